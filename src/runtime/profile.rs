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
//! Runtime profile counters.
//!
//! Responsibilities:
//! - Provides named, unit-tagged counters, info strings and scoped wall timers per operator.
//! - Profiles form a tree so a join's spill counters nest under its operator node.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CounterUnit {
    Unit,
    Bytes,
    Nanos,
}

#[derive(Debug)]
pub struct Counter {
    unit: CounterUnit,
    value: AtomicI64,
}

pub type CounterRef = Arc<Counter>;

impl Counter {
    fn new(unit: CounterUnit) -> Self {
        Self {
            unit,
            value: AtomicI64::new(0),
        }
    }

    pub fn unit(&self) -> CounterUnit {
        self.unit
    }

    pub fn add(&self, delta: i64) {
        self.value.fetch_add(delta, Ordering::AcqRel);
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Release);
    }

    pub fn set_max(&self, candidate: i64) {
        let mut prev = self.value.load(Ordering::Relaxed);
        while candidate > prev {
            match self.value.compare_exchange(
                prev,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => prev = actual,
            }
        }
    }

    pub fn value(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct ProfileInner {
    counters: HashMap<String, CounterRef>,
    info_strings: HashMap<String, String>,
    children: Vec<RuntimeProfile>,
}

/// A named tree node of counters, timers and info strings.
#[derive(Clone)]
pub struct RuntimeProfile {
    name: Arc<String>,
    inner: Arc<Mutex<ProfileInner>>,
}

impl RuntimeProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Arc::new(name.into()),
            inner: Arc::new(Mutex::new(ProfileInner::default())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn child(&self, name: impl Into<String>) -> RuntimeProfile {
        let child = RuntimeProfile::new(name);
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.children.push(child.clone());
        child
    }

    pub fn children(&self) -> Vec<RuntimeProfile> {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.children.clone()
    }

    pub fn add_counter(&self, name: impl Into<String>, unit: CounterUnit) -> CounterRef {
        let name = name.into();
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            guard
                .counters
                .entry(name)
                .or_insert_with(|| Arc::new(Counter::new(unit))),
        )
    }

    pub fn add_timer(&self, name: impl Into<String>) -> CounterRef {
        self.add_counter(name, CounterUnit::Nanos)
    }

    pub fn counter(&self, name: &str) -> Option<CounterRef> {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.counters.get(name).map(Arc::clone)
    }

    pub fn counter_value(&self, name: &str) -> i64 {
        self.counter(name).map(|c| c.value()).unwrap_or(0)
    }

    pub fn counter_add(&self, name: &str, unit: CounterUnit, delta: i64) {
        self.add_counter(name, unit).add(delta);
    }

    pub fn counter_set(&self, name: &str, unit: CounterUnit, value: i64) {
        self.add_counter(name, unit).set(value);
    }

    pub fn scoped_timer(&self, name: impl Into<String>) -> ScopedTimer {
        ScopedTimer::new(self.add_timer(name))
    }

    pub fn add_info_string(&self, key: impl Into<String>, value: impl Into<String>) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.info_strings.insert(key.into(), value.into());
    }

    pub fn get_info_string(&self, key: &str) -> Option<String> {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.info_strings.get(key).cloned()
    }
}

/// Adds elapsed wall time to the wrapped counter on drop.
pub struct ScopedTimer {
    counter: CounterRef,
    start: Instant,
}

impl ScopedTimer {
    pub fn new(counter: CounterRef) -> Self {
        Self {
            counter,
            start: Instant::now(),
        }
    }
}

impl Drop for ScopedTimer {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed().as_nanos();
        self.counter.add(i64::try_from(elapsed).unwrap_or(i64::MAX));
    }
}

/// Counter bundle handed to an operator at creation.
#[derive(Clone)]
pub struct OperatorProfiles {
    pub common: RuntimeProfile,
}

impl OperatorProfiles {
    pub fn new(operator: RuntimeProfile) -> Self {
        Self { common: operator }
    }
}
