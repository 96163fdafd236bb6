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
//! Per-query execution context.
//!
//! Responsibilities:
//! - Carries runtime-tunable query options, the query memory tracker and arbitrator.
//! - Holds the first-error-wins error state and the cancellation flag observed at
//!   cooperative checkpoints.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::common::error::{ExecError, ExecResult};
use crate::runtime::arbitrator::MemoryArbitrator;
use crate::runtime::mem_tracker::MemTracker;

/// Runtime-tunable knobs for one query. All of these may differ per query.
#[derive(Clone, Debug)]
pub struct QueryOptions {
    pub join_spill_enabled: bool,
    /// -1 means unlimited recursion depth.
    pub max_spill_level: i32,
    pub spill_start_partition_bit: u8,
    pub spill_num_partition_bits: u8,
    /// Spill files roll over when exceeding this size.
    pub max_spill_file_size: u64,
    /// Per-query spill byte cap; 0 means unlimited.
    pub max_spill_bytes: u64,
    pub spill_write_buffer_size: usize,
    pub preferred_output_batch_rows: usize,
    pub preferred_output_batch_bytes: usize,
    pub min_table_rows_for_parallel_join_build: usize,
    pub hash_probe_finish_early_on_empty_build: bool,
    pub max_split_preload_per_driver: usize,
    /// Spill directories for this query; empty falls back to process config.
    pub spill_dirs: Vec<PathBuf>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            join_spill_enabled: false,
            max_spill_level: 4,
            spill_start_partition_bit: 48,
            spill_num_partition_bits: 3,
            max_spill_file_size: 256 * 1024 * 1024,
            max_spill_bytes: 0,
            spill_write_buffer_size: 1024 * 1024,
            preferred_output_batch_rows: 4096,
            preferred_output_batch_bytes: 8 * 1024 * 1024,
            min_table_rows_for_parallel_join_build: 1000,
            hash_probe_finish_early_on_empty_build: true,
            max_split_preload_per_driver: 2,
            spill_dirs: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct RuntimeErrorState {
    error: std::sync::Mutex<Option<ExecError>>,
}

impl RuntimeErrorState {
    pub fn set_error(&self, err: ExecError) {
        let mut guard = self.error.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = Some(err);
        }
    }

    pub fn error(&self) -> Option<ExecError> {
        self.error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// RuntimeState is the per-query execution context shared by all drivers of the query.
#[derive(Clone)]
pub struct RuntimeState {
    options: Arc<QueryOptions>,
    error_state: Arc<RuntimeErrorState>,
    cancelled: Arc<AtomicBool>,
    mem_tracker: Option<Arc<MemTracker>>,
    arbitrator: Option<Arc<MemoryArbitrator>>,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self::new(QueryOptions::default())
    }
}

impl RuntimeState {
    pub fn new(options: QueryOptions) -> Self {
        Self {
            options: Arc::new(options),
            error_state: Arc::new(RuntimeErrorState::default()),
            cancelled: Arc::new(AtomicBool::new(false)),
            mem_tracker: None,
            arbitrator: None,
        }
    }

    pub fn with_arbitrator(mut self, arbitrator: Arc<MemoryArbitrator>) -> Self {
        self.mem_tracker = Some(arbitrator.pool());
        self.arbitrator = Some(arbitrator);
        self
    }

    pub fn with_mem_tracker(mut self, tracker: Arc<MemTracker>) -> Self {
        self.mem_tracker = Some(tracker);
        self
    }

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    pub fn mem_tracker(&self) -> Option<Arc<MemTracker>> {
        self.mem_tracker.clone()
    }

    pub fn arbitrator(&self) -> Option<Arc<MemoryArbitrator>> {
        self.arbitrator.clone()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Cooperative checkpoint: surfaces cancellation or a sibling driver's error.
    pub fn check_alive(&self) -> ExecResult<()> {
        if self.is_cancelled() {
            return Err(ExecError::aborted("task was cancelled"));
        }
        if let Some(err) = self.error_state.error() {
            return Err(err);
        }
        Ok(())
    }

    pub fn set_error(&self, err: ExecError) {
        self.error_state.set_error(err);
    }

    pub fn error(&self) -> Option<ExecError> {
        self.error_state.error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::error::ErrorKind;

    #[test]
    fn first_error_wins() {
        let state = RuntimeState::default();
        state.set_error(ExecError::internal("first"));
        state.set_error(ExecError::aborted("second"));
        let err = state.error().unwrap();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn cancellation_surfaces_at_checkpoint() {
        let state = RuntimeState::default();
        assert!(state.check_alive().is_ok());
        state.cancel();
        assert_eq!(
            state.check_alive().unwrap_err().kind(),
            ErrorKind::Aborted
        );
    }
}
