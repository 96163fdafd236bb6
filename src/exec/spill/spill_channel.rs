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
//! Background executor for spill I/O.
//!
//! Spill writes triggered outside the reclaim path run on a bounded queue of
//! worker threads; the reclaim path itself writes synchronously so it never
//! depends on queue capacity.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;

use crate::common::config::{spill_io_queue_size, spill_io_threads};
use crate::common::error::ExecResult;
use crate::common::logging::error;

pub type SpillTask = Box<dyn FnOnce() -> ExecResult<()> + Send + 'static>;

pub struct SpillIoExecutor {
    inner: Arc<SpillIoExecutorInner>,
    #[allow(dead_code)]
    workers: Vec<thread::JoinHandle<()>>,
}

impl SpillIoExecutor {
    pub fn new(num_threads: usize, queue_capacity: usize) -> Self {
        let capacity = queue_capacity.max(1);
        let inner = Arc::new(SpillIoExecutorInner::new(capacity));
        let threads = num_threads.max(1);
        let mut workers = Vec::with_capacity(threads);
        for _ in 0..threads {
            let inner_clone = Arc::clone(&inner);
            workers.push(thread::spawn(move || worker_loop(inner_clone)));
        }
        Self { inner, workers }
    }

    /// Enqueue if the queue has capacity; returns false when full.
    pub fn submit(&self, task: SpillTask) -> bool {
        self.inner.submit(task)
    }

    /// Enqueue unconditionally; used when dropping the task would lose data.
    pub fn force_submit(&self, task: SpillTask) {
        self.inner.force_submit(task);
    }

    pub fn num_tasks(&self) -> usize {
        self.inner.num_tasks()
    }
}

struct SpillIoExecutorInner {
    queue: Mutex<VecDeque<SpillTask>>,
    cv: Condvar,
    capacity: usize,
    shutdown: AtomicBool,
}

impl SpillIoExecutorInner {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            capacity: capacity.max(1),
            shutdown: AtomicBool::new(false),
        }
    }

    fn submit(&self, task: SpillTask) -> bool {
        if self.shutdown.load(Ordering::Acquire) {
            return false;
        }
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        if queue.len() >= self.capacity {
            return false;
        }
        queue.push_back(task);
        self.cv.notify_one();
        true
    }

    fn force_submit(&self, task: SpillTask) {
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.push_back(task);
        self.cv.notify_one();
    }

    fn num_tasks(&self) -> usize {
        let queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.len()
    }

    fn take(&self) -> Option<SpillTask> {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        while queue.is_empty() && !self.shutdown.load(Ordering::Acquire) {
            queue = self.cv.wait(queue).unwrap_or_else(|e| e.into_inner());
        }
        if self.shutdown.load(Ordering::Acquire) {
            return None;
        }
        queue.pop_front()
    }
}

fn worker_loop(inner: Arc<SpillIoExecutorInner>) {
    while let Some(task) = inner.take() {
        if let Err(err) = task() {
            error!("spill task failed: {}", err);
        }
    }
}

static SPILL_IO_EXECUTOR: OnceLock<SpillIoExecutor> = OnceLock::new();

pub fn spill_io_executor() -> &'static SpillIoExecutor {
    SPILL_IO_EXECUTOR.get_or_init(|| {
        let threads = spill_io_threads();
        let queue_capacity = spill_io_queue_size();
        SpillIoExecutor::new(threads, queue_capacity)
    })
}

struct SpillChannel {
    executor: &'static SpillIoExecutor,
    inflight_tasks: AtomicUsize,
}

/// Per-operator handle over the shared executor tracking in-flight tasks.
#[derive(Clone)]
pub struct SpillChannelHandle {
    inner: Arc<SpillChannel>,
}

impl SpillChannelHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SpillChannel {
                executor: spill_io_executor(),
                inflight_tasks: AtomicUsize::new(0),
            }),
        }
    }

    pub fn submit(&self, task: SpillTask) -> bool {
        self.inner.inflight_tasks.fetch_add(1, Ordering::AcqRel);
        let channel = Arc::clone(&self.inner);
        let wrapped: SpillTask = Box::new(move || {
            let _guard = InflightGuard { channel };
            task()
        });
        if !self.inner.executor.submit(wrapped) {
            self.inner.inflight_tasks.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    pub fn force_submit(&self, task: SpillTask) {
        self.inner.inflight_tasks.fetch_add(1, Ordering::AcqRel);
        let channel = Arc::clone(&self.inner);
        let wrapped: SpillTask = Box::new(move || {
            let _guard = InflightGuard { channel };
            task()
        });
        self.inner.executor.force_submit(wrapped);
    }

    pub fn has_pending(&self) -> bool {
        self.inner.inflight_tasks.load(Ordering::Acquire) > 0
    }
}

impl Default for SpillChannelHandle {
    fn default() -> Self {
        Self::new()
    }
}

struct InflightGuard {
    channel: Arc<SpillChannel>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.channel.inflight_tasks.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for SpillChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpillChannelHandle")
            .field(
                "inflight_tasks",
                &self.inner.inflight_tasks.load(Ordering::Acquire),
            )
            .finish()
    }
}
