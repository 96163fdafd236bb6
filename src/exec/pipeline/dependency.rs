// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Pipeline dependency primitives.
//!
//! Responsibilities:
//! - Defines dependency handles with readiness flags, observer callbacks and a
//!   blocking wait for callers outside a cooperative driver loop.
//! - Used by operators to coordinate blocked/unblocked transitions (e.g. probe
//!   waiting on the join bridge).

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::common::logging::debug;

static NEXT_DEP_ID: AtomicUsize = AtomicUsize::new(1);

/// Callback invoked when a dependency becomes ready.
pub type Observer = Arc<dyn Fn() + Send + Sync + 'static>;

/// Reference-counted handle to one pipeline dependency object.
pub type DependencyHandle = Arc<Dependency>;

/// Dependency primitive used to model blocked/unblocked execution conditions.
pub struct Dependency {
    id: usize,
    name: String,
    ready: AtomicBool,
    observers: Mutex<Vec<Observer>>,
    wait_lock: Mutex<()>,
    wait_cv: Condvar,
}

impl fmt::Debug for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dependency")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl PartialEq for Dependency {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Dependency {}

impl Dependency {
    fn new(name: String) -> Self {
        Self {
            id: NEXT_DEP_ID.fetch_add(1, Ordering::Relaxed),
            name,
            ready: AtomicBool::new(false),
            observers: Mutex::new(Vec::new()),
            wait_lock: Mutex::new(()),
            wait_cv: Condvar::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn set_ready(&self) {
        let prev = self.ready.swap(true, Ordering::AcqRel);
        if prev {
            return;
        }
        debug!("dependency ready: dep_id={} name={}", self.id, self.name);
        let observers = {
            let mut guard = self.observers.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        for observer in observers {
            observer();
        }
        let _guard = self.wait_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.wait_cv.notify_all();
    }

    pub fn set_blocked(&self) {
        self.ready.store(false, Ordering::Release);
    }

    /// Register a callback for readiness; fires immediately if already ready.
    pub fn add_waiter(&self, observer: Observer) {
        if self.is_ready() {
            observer();
            return;
        }
        let mut guard = self.observers.lock().unwrap_or_else(|e| e.into_inner());
        guard.push(observer);
        drop(guard);
        // The flag may have flipped while registering; deliver instead of losing the wakeup.
        if self.is_ready() {
            let observers = {
                let mut guard = self.observers.lock().unwrap_or_else(|e| e.into_inner());
                std::mem::take(&mut *guard)
            };
            for observer in observers {
                observer();
            }
        }
    }

    /// Block the calling thread until ready or the timeout elapses. Returns readiness.
    pub fn wait_ready(&self, timeout: Duration) -> bool {
        if self.is_ready() {
            return true;
        }
        let mut guard = self.wait_lock.lock().unwrap_or_else(|e| e.into_inner());
        let deadline = std::time::Instant::now() + timeout;
        while !self.is_ready() {
            let now = std::time::Instant::now();
            if now >= deadline {
                return self.is_ready();
            }
            let (g, res) = self
                .wait_cv
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            guard = g;
            if res.timed_out() {
                return self.is_ready();
            }
        }
        true
    }
}

/// Registry managing dependency objects for one pipeline build/execution context.
#[derive(Clone)]
pub struct DependencyManager {
    deps: Arc<Mutex<HashMap<String, DependencyHandle>>>,
}

impl DependencyManager {
    pub fn new() -> Self {
        Self {
            deps: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn get_or_create(&self, name: impl Into<String>) -> DependencyHandle {
        let name = name.into();
        let mut guard = self.deps.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .entry(name.clone())
            .or_insert_with(|| Arc::new(Dependency::new(name)))
            .clone()
    }

    pub fn mark_ready(&self, name: &str) {
        let dep = self.get_or_create(name.to_string());
        dep.set_ready();
    }
}

impl Default for DependencyManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a standalone dependency not tracked by a manager.
pub fn new_dependency(name: impl Into<String>) -> DependencyHandle {
    Arc::new(Dependency::new(name.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn waiter_fires_once_on_ready() {
        let dep = new_dependency("join_build:1:0");
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        dep.add_waiter(Arc::new(move || {
            count_clone.fetch_add(1, Ordering::AcqRel);
        }));
        assert_eq!(count.load(Ordering::Acquire), 0);
        dep.set_ready();
        dep.set_ready();
        assert_eq!(count.load(Ordering::Acquire), 1);
    }

    #[test]
    fn waiter_added_after_ready_fires_immediately() {
        let dep = new_dependency("join_build:1:0");
        dep.set_ready();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        dep.add_waiter(Arc::new(move || {
            count_clone.fetch_add(1, Ordering::AcqRel);
        }));
        assert_eq!(count.load(Ordering::Acquire), 1);
    }

    #[test]
    fn blocking_wait_observes_cross_thread_ready() {
        let dep = new_dependency("join_build:2:0");
        let dep_clone = Arc::clone(&dep);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            dep_clone.set_ready();
        });
        assert!(dep.wait_ready(Duration::from_secs(5)));
        handle.join().unwrap();
    }
}
