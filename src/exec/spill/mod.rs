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
//! Spill subsystem.
//!
//! Responsibilities:
//! - Partitions rows by key-hash bit windows, serializes partitions to block
//!   files, and reads them back for recursive processing.
//! - Enforces the per-query spill byte cap and the maximum recursion level.

pub mod block_manager;
pub mod dir_manager;
pub mod ipc_serde;
pub mod spill_channel;
pub mod spill_stream;
pub mod spiller;

use std::path::PathBuf;

use crate::common::config;
use crate::common::error::{ExecError, ExecResult};
use crate::exec::spill::ipc_serde::SpillCodec;
use crate::runtime::profile::{CounterRef, CounterUnit, RuntimeProfile};
use crate::runtime::runtime_state::{QueryOptions, RuntimeState};

pub use spill_channel::{SpillChannelHandle, SpillIoExecutor, SpillTask};

/// Resolved spill configuration for one operator of one query.
#[derive(Clone, Debug)]
pub struct SpillConfig {
    pub local_dirs: Vec<PathBuf>,
    pub dir_max_bytes: u64,
    pub codec: SpillCodec,
    pub start_partition_bit: u8,
    pub partition_bits: u8,
    /// Files roll over past this size; 0 means unlimited.
    pub max_file_size: u64,
    /// -1 means unlimited recursion.
    pub max_spill_level: i32,
    /// Per-query cap counted against the injected global counter; 0 = unlimited.
    pub max_spill_bytes: u64,
    pub write_buffer_size: usize,
}

impl SpillConfig {
    /// Resolve from query options plus process config. Rejects bit windows that
    /// would overlap or run past the hash width at the first recursion level.
    pub fn resolve(options: &QueryOptions) -> ExecResult<Self> {
        if !options.join_spill_enabled {
            return Err(ExecError::internal("spill is disabled for this query"));
        }
        let start = options.spill_start_partition_bit;
        let bits = options.spill_num_partition_bits;
        if bits == 0 || bits > 8 {
            return Err(ExecError::invalid_plan(format!(
                "spill partition bits must be in [1, 8], got {bits}"
            )));
        }
        if u32::from(start) + u32::from(bits) > 64 {
            return Err(ExecError::invalid_plan(format!(
                "spill partition bit window [{start}, {}) exceeds the 64-bit hash",
                u32::from(start) + u32::from(bits)
            )));
        }
        let local_dirs = if options.spill_dirs.is_empty() {
            config::spill_local_dirs().into_iter().map(PathBuf::from).collect()
        } else {
            options.spill_dirs.clone()
        };
        let codec = SpillCodec::from_str(&config::spill_ipc_compression())?;
        let max_file_size = if options.max_spill_file_size == 0 {
            config::spill_block_size_bytes()
        } else {
            options.max_spill_file_size
        };
        Ok(Self {
            local_dirs,
            dir_max_bytes: config::spill_dir_max_bytes(),
            codec,
            start_partition_bit: start,
            partition_bits: bits,
            max_file_size,
            max_spill_level: options.max_spill_level,
            max_spill_bytes: options.max_spill_bytes,
            write_buffer_size: options.spill_write_buffer_size,
        })
    }

    pub fn partition_count(&self) -> u32 {
        1u32 << self.partition_bits
    }
}

/// Contract for operators the arbitrator can reclaim memory from.
pub trait SpillableOperator {
    fn spillable(&self) -> bool;

    /// Bytes this operator could free right now; 0 while unreclaimable.
    fn estimated_revocable_bytes(&self) -> i64;

    /// Spill to free memory; called at a cooperative checkpoint, never
    /// re-entrantly from inside an arbitration call.
    fn trigger_spill(&mut self, state: &RuntimeState) -> ExecResult<()>;
}

/// Per-operator spill counters, nested under the operator profile.
#[derive(Clone)]
pub struct SpillStats {
    pub spilled_bytes: CounterRef,
    pub spilled_rows: CounterRef,
    pub spilled_partitions: CounterRef,
    pub spilled_files: CounterRef,
    pub exceeded_max_spill_level_count: CounterRef,
    pub exceeded_max_spill_level_max: CounterRef,
    pub spill_time: CounterRef,
    pub restore_rows: CounterRef,
    pub restore_time: CounterRef,
}

impl SpillStats {
    pub fn new(profile: &RuntimeProfile) -> Self {
        let profile = profile.child("Spill");
        Self {
            spilled_bytes: profile.add_counter("SpilledBytes", CounterUnit::Bytes),
            spilled_rows: profile.add_counter("SpilledRows", CounterUnit::Unit),
            spilled_partitions: profile.add_counter("SpilledPartitions", CounterUnit::Unit),
            spilled_files: profile.add_counter("SpilledFiles", CounterUnit::Unit),
            exceeded_max_spill_level_count: profile
                .add_counter("ExceededMaxSpillLevelCount", CounterUnit::Unit),
            exceeded_max_spill_level_max: profile
                .add_counter("ExceededMaxSpillLevelMax", CounterUnit::Unit),
            spill_time: profile.add_timer("SpillTime"),
            restore_rows: profile.add_counter("RestoreRows", CounterUnit::Unit),
            restore_time: profile.add_timer("RestoreTime"),
        }
    }
}

