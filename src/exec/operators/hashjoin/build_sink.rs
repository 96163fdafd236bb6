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
//! Hash-join build sink.
//!
//! Responsibilities:
//! - Accumulates build rows per driver with the join-type null policy applied at
//!   ingest, and spills under arbitrator pressure.
//! - The last driver to finish input becomes the leader: it reconciles the
//!   spilled picture across peers, constructs the table over the unspilled
//!   remainder and publishes to the bridge.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::AtomicI64;

use arrow::array::{ArrayRef, UInt32Array};
use arrow::compute::take_record_batch;

use crate::common::error::{ExecError, ExecResult};
use crate::common::logging::debug;
use crate::exec::chunk::Chunk;
use crate::exec::hash_table::key_builder::{
    build_key_hashes, build_key_views, row_has_null_key,
};
use crate::exec::node::join::JoinSpec;
use crate::exec::operators::hashjoin::join_bridge::{BuildFinalizeInput, JoinArtifact, JoinBridge};
use crate::exec::operators::hashjoin::join_hash_table::{JoinHashTable, ParallelBuildPolicy};
use crate::exec::operators::hashjoin::row_container::RowContainer;
use crate::exec::pipeline::operator::{Operator, OperatorFactory, ProcessorOperator};
use crate::exec::spill::spiller::{JoinSpiller, SpilledPartition};
use crate::exec::spill::{SpillConfig, SpillStats, SpillableOperator};
use crate::runtime::arbitrator::{GrowOutcome, ReclaimToken};
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::profile::{CounterUnit, OperatorProfiles};
use crate::runtime::runtime_state::RuntimeState;

/// Factory for per-driver hash-join build sinks.
pub struct HashJoinBuildSinkFactory {
    name: String,
    spec: Arc<JoinSpec>,
    bridge: Arc<JoinBridge>,
}

impl HashJoinBuildSinkFactory {
    pub fn new(spec: Arc<JoinSpec>, bridge: Arc<JoinBridge>) -> ExecResult<Self> {
        spec.validate()?;
        Ok(Self {
            name: format!("HASH_JOIN_BUILD (id={})", bridge.node_id()),
            spec,
            bridge,
        })
    }
}

impl OperatorFactory for HashJoinBuildSinkFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self, _dop: i32, driver_id: i32) -> Box<dyn Operator> {
        debug!(
            "HashJoinBuildSink create: node_id={} driver_id={} join_type={} null_aware={} build_keys={}",
            self.bridge.node_id(),
            driver_id,
            self.spec.join_type.as_str(),
            self.spec.null_aware,
            self.spec.build_keys.len()
        );
        Box::new(HashJoinBuildSinkOperator {
            name: self.name.clone(),
            driver_id,
            spec: Arc::clone(&self.spec),
            bridge: Arc::clone(&self.bridge),
            container: Some(RowContainer::new(
                self.spec.build_schema.clone(),
                self.spec.build_keys.clone(),
            )),
            spiller: None,
            spill_config: None,
            spilled_bytes_counter: Arc::new(AtomicI64::new(0)),
            accepted_rows: 0,
            accepted_null_key_rows: 0,
            input_chunks: 0,
            finished: false,
            reclaim_token: None,
            profiles: None,
            spill_stats: None,
            container_tracker: None,
        })
    }

    fn is_sink(&self) -> bool {
        true
    }
}

struct HashJoinBuildSinkOperator {
    name: String,
    driver_id: i32,
    spec: Arc<JoinSpec>,
    bridge: Arc<JoinBridge>,
    container: Option<RowContainer>,
    spiller: Option<JoinSpiller>,
    spill_config: Option<SpillConfig>,
    spilled_bytes_counter: Arc<AtomicI64>,
    accepted_rows: usize,
    accepted_null_key_rows: u64,
    input_chunks: u64,
    finished: bool,
    reclaim_token: Option<ReclaimToken>,
    profiles: Option<OperatorProfiles>,
    spill_stats: Option<SpillStats>,
    container_tracker: Option<Arc<MemTracker>>,
}

impl Operator for HashJoinBuildSinkOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_mem_tracker(&mut self, tracker: Arc<MemTracker>) {
        let container_tracker = MemTracker::new_child("BuildRows", &tracker);
        if let Some(container) = self.container.as_mut() {
            container.set_mem_tracker(Arc::clone(&container_tracker));
        }
        self.container_tracker = Some(container_tracker);
    }

    fn set_profiles(&mut self, profiles: OperatorProfiles) {
        profiles
            .common
            .add_info_string("JoinType", self.spec.join_type.as_str());
        self.spill_stats = Some(SpillStats::new(&profiles.common));
        self.profiles = Some(profiles);
    }

    fn prepare(&mut self, state: &RuntimeState) -> ExecResult<()> {
        if state.options().join_spill_enabled {
            self.spill_config = Some(SpillConfig::resolve(state.options())?);
        }
        if let Some(arbitrator) = state.arbitrator() {
            self.spilled_bytes_counter = arbitrator.spilled_bytes_counter();
            self.reclaim_token = Some(arbitrator.register(self.name.clone()));
        }
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn as_processor_mut(&mut self) -> Option<&mut dyn ProcessorOperator> {
        Some(self)
    }

    fn as_processor_ref(&self) -> Option<&dyn ProcessorOperator> {
        Some(self)
    }

    fn as_spillable_mut(&mut self) -> Option<&mut dyn SpillableOperator> {
        Some(self)
    }
}

impl ProcessorOperator for HashJoinBuildSinkOperator {
    fn need_input(&self) -> bool {
        !self.finished
    }

    fn has_output(&self) -> bool {
        false
    }

    fn push_chunk(&mut self, state: &RuntimeState, chunk: Chunk) -> ExecResult<()> {
        state.check_alive()?;
        if self.finished || chunk.is_empty() {
            return Ok(());
        }
        self.drain_reclaim_demand(state)?;
        self.input_chunks += 1;

        let key_arrays: Vec<ArrayRef> = self
            .spec
            .build_keys
            .iter()
            .map(|idx| chunk.column(*idx))
            .collect::<ExecResult<_>>()?;
        let views = build_key_views(&key_arrays)?;
        let num_rows = chunk.len();
        let null_keys: Vec<bool> = (0..num_rows)
            .map(|row| row_has_null_key(&views, row))
            .collect();

        let retains_nulls = self
            .spec
            .join_type
            .build_retains_null_keys(self.spec.null_aware);
        let (chunk, null_keys, views_rows) = if !retains_nulls && null_keys.iter().any(|n| *n) {
            let kept: Vec<u32> = (0..num_rows)
                .filter(|row| !null_keys[*row])
                .map(|row| row as u32)
                .collect();
            if kept.is_empty() {
                return Ok(());
            }
            let indices = UInt32Array::from(kept);
            let batch = take_record_batch(&chunk.batch, &indices)
                .map_err(|e| ExecError::internal(format!("null-key filter failed: {e}")))?;
            let filtered = Chunk::try_new(batch)?;
            let rows = filtered.len();
            (filtered, vec![false; rows], rows)
        } else {
            (chunk, null_keys, num_rows)
        };

        // Keys must be re-evaluated when rows were dropped above.
        let key_arrays: Vec<ArrayRef> = self
            .spec
            .build_keys
            .iter()
            .map(|idx| chunk.column(*idx))
            .collect::<ExecResult<_>>()?;
        let views = build_key_views(&key_arrays)?;
        let hashes = build_key_hashes(&views, views_rows, self.bridge.hash_seed());
        let mut column_null_counts = vec![0u64; self.spec.build_keys.len()];
        for (col, view) in views.iter().enumerate() {
            for row in 0..views_rows {
                if view.is_null(row) {
                    column_null_counts[col] += 1;
                }
            }
        }

        // Reserve before copying so a later reclaim never truncates mid-batch.
        let chunk_bytes = i64::try_from(chunk.estimated_bytes()).unwrap_or(i64::MAX);
        if let (Some(arbitrator), Some(token)) = (state.arbitrator(), self.reclaim_token.as_ref())
        {
            match arbitrator.try_grow(token, chunk_bytes)? {
                GrowOutcome::Granted => {}
                GrowOutcome::ReclaimRequested { .. } => {
                    // Demand lands on peers; they spill at their next checkpoint.
                    // This batch proceeds against the reservation.
                }
            }
        }

        let container = self
            .container
            .as_mut()
            .ok_or_else(|| ExecError::internal("build sink container already taken"))?;
        self.accepted_rows += views_rows;
        self.accepted_null_key_rows += null_keys.iter().filter(|n| **n).count() as u64;
        container.append_page(chunk, hashes, null_keys, &column_null_counts)?;

        if self.spill_config.is_some() {
            let reclaimable = container.estimated_bytes();
            if let Some(token) = self.reclaim_token.as_ref() {
                token.report_reclaimable(reclaimable);
            }
        }
        Ok(())
    }

    fn pull_chunk(&mut self, _state: &RuntimeState) -> ExecResult<Option<Chunk>> {
        Ok(None)
    }

    fn set_finishing(&mut self, state: &RuntimeState) -> ExecResult<()> {
        if self.finished {
            return Ok(());
        }
        state.check_alive()?;
        // Inside the peer barrier this operator is unreclaimable.
        if let Some(token) = self.reclaim_token.as_ref() {
            token.report_reclaimable(0);
        }
        let container = self
            .container
            .take()
            .ok_or_else(|| ExecError::internal("build sink container already taken"))?;
        let spilled = self
            .spiller
            .as_mut()
            .map(|s| s.take_spilled_partitions())
            .unwrap_or_default();
        debug!(
            "HashJoinBuildSink set_finishing: node_id={} driver_id={} rows={} chunks={} spilled_partitions={}",
            self.bridge.node_id(),
            self.driver_id,
            self.accepted_rows,
            self.input_chunks,
            spilled.len()
        );
        let finalize = self.bridge.arrive_builder(
            container,
            spilled,
            self.accepted_rows,
            self.accepted_null_key_rows,
        )?;
        if let Some(input) = finalize {
            self.finalize_as_leader(state, input)?;
        }
        self.finished = true;
        Ok(())
    }
}

impl HashJoinBuildSinkOperator {
    fn drain_reclaim_demand(&mut self, state: &RuntimeState) -> ExecResult<()> {
        let Some(token) = self.reclaim_token.as_ref() else {
            return Ok(());
        };
        if token.take_demand() > 0 && self.spillable() {
            let token = token.clone();
            let _guard = token.enter_arbitration()?;
            self.trigger_spill(state)?;
        }
        Ok(())
    }

    fn ensure_spiller(&mut self) -> ExecResult<&mut JoinSpiller> {
        if self.spiller.is_none() {
            let config = self
                .spill_config
                .clone()
                .ok_or_else(|| ExecError::internal("spill triggered while disabled"))?;
            self.spiller = Some(JoinSpiller::new(
                config,
                0,
                Arc::clone(&self.spilled_bytes_counter),
            )?);
        }
        self.spiller
            .as_mut()
            .ok_or_else(|| ExecError::internal("spiller missing"))
    }

    /// Leader path: reconcile the spilled picture, build the table over the
    /// unspilled remainder and publish.
    fn finalize_as_leader(
        &mut self,
        state: &RuntimeState,
        input: BuildFinalizeInput,
    ) -> ExecResult<()> {
        state.check_alive()?;
        let BuildFinalizeInput {
            mut containers,
            mut spilled,
            total_rows,
            has_null_key,
        } = input;

        // If any driver spilled, the union of spilled partitions must look the
        // same on disk for every driver's rows.
        let spilled_ids: HashSet<u32> = spilled.iter().map(|p| p.partition).collect();
        if !spilled_ids.is_empty() {
            let config = self
                .spill_config
                .clone()
                .ok_or_else(|| ExecError::internal("spilled partitions without spill config"))?;
            let mut leader_spiller = JoinSpiller::new(
                config.clone(),
                0,
                Arc::clone(&self.spilled_bytes_counter),
            )?;
            for container in containers.iter_mut() {
                state.check_alive()?;
                let by_partition = container.partition_rows(&config, 0);
                for (partition, pages_rows) in by_partition {
                    if !spilled_ids.contains(&partition) {
                        continue;
                    }
                    let batches = container.extract_partition_batches(&pages_rows)?;
                    leader_spiller.spill_partition(partition, &container.schema(), &batches)?;
                    self.record_spill(&batches);
                }
                container.erase_partitions(&config, 0, &spilled_ids)?;
            }
            spilled.extend(leader_spiller.take_spilled_partitions());
            spilled = merge_spilled(spilled);
        }

        state.check_alive()?;
        let mut merged = containers
            .pop()
            .ok_or_else(|| ExecError::internal("leader received no build containers"))?;
        // Merge back-to-front to keep the Vec pop cheap; page order across
        // drivers is unspecified anyway.
        while let Some(container) = containers.pop() {
            merged.merge(container)?;
        }
        if let Some(tracker) = self.container_tracker.as_ref() {
            merged.set_mem_tracker(Arc::clone(tracker));
        }

        let table = if merged.row_count() > 0 {
            let timer = self
                .profiles
                .as_ref()
                .map(|p| p.common.scoped_timer("HashTableBuildTime"));
            let mut table = JoinHashTable::prepare(
                &merged,
                self.spec.build_key_types()?,
                self.spec.null_aware,
                self.bridge.hash_seed(),
            )?;
            table.build(
                &merged,
                state,
                ParallelBuildPolicy {
                    min_table_rows: state.options().min_table_rows_for_parallel_join_build,
                    contributors: self.bridge.num_builders(),
                },
            )?;
            drop(timer);
            self.record_table_stats(&table);
            Some(Arc::new(table))
        } else {
            None
        };

        debug!(
            "HashJoinBuildSink publish: node_id={} total_rows={} in_memory_rows={} spilled_partitions={} has_null_key={}",
            self.bridge.node_id(),
            total_rows,
            merged.row_count(),
            spilled.len(),
            has_null_key
        );
        self.bridge.publish(JoinArtifact {
            container: Arc::new(merged),
            table,
            spilled,
            total_build_rows: total_rows,
            build_has_null_key: has_null_key,
        })
    }

    fn record_table_stats(&self, table: &JoinHashTable) {
        let Some(profiles) = self.profiles.as_ref() else {
            return;
        };
        profiles
            .common
            .counter_set("NumNullKeys", CounterUnit::Unit, {
                (0..self.spec.build_keys.len())
                    .map(|col| table.key_null_count(col))
                    .sum::<u64>() as i64
            });
        for col in 0..self.spec.build_keys.len() {
            profiles.common.counter_set(
                &format!("DistinctKey{col}"),
                CounterUnit::Unit,
                table.group_count() as i64,
            );
            if let Some(range) = table.key_range(col) {
                profiles.common.counter_set(
                    &format!("RangeKey{col}"),
                    CounterUnit::Unit,
                    range.span().map(|s| s as i64).unwrap_or(i64::MAX),
                );
            }
        }
    }

    fn record_spill(&self, batches: &[arrow::record_batch::RecordBatch]) {
        let Some(stats) = self.spill_stats.as_ref() else {
            return;
        };
        let rows: usize = batches.iter().map(|b| b.num_rows()).sum();
        stats.spilled_rows.add(rows as i64);
    }
}

impl SpillableOperator for HashJoinBuildSinkOperator {
    fn spillable(&self) -> bool {
        self.spill_config.is_some()
            && !self.finished
            && self
                .container
                .as_ref()
                .map(|c| !c.is_empty())
                .unwrap_or(false)
    }

    fn estimated_revocable_bytes(&self) -> i64 {
        if !self.spillable() {
            return 0;
        }
        self.container
            .as_ref()
            .map(|c| c.estimated_bytes())
            .unwrap_or(0)
    }

    /// Spill this driver's entire accumulation, one partition at a time, then
    /// drop the in-memory rows.
    fn trigger_spill(&mut self, state: &RuntimeState) -> ExecResult<()> {
        state.check_alive()?;
        if !self.spillable() {
            return Ok(());
        }
        let config = self
            .spill_config
            .clone()
            .ok_or_else(|| ExecError::internal("spill triggered while disabled"))?;
        let timer = self
            .spill_stats
            .as_ref()
            .map(|s| crate::runtime::profile::ScopedTimer::new(s.spill_time.clone()));

        let (by_partition, schema) = {
            let container = self
                .container
                .as_mut()
                .ok_or_else(|| ExecError::internal("build sink container already taken"))?;
            container.reserve_spillable(config.write_buffer_size as i64);
            (container.partition_rows(&config, 0), container.schema())
        };
        let mut spilled_rows = 0u64;
        let mut spilled_partitions = 0u64;
        for (partition, pages_rows) in by_partition {
            let batches = {
                let container = self
                    .container
                    .as_ref()
                    .ok_or_else(|| ExecError::internal("build sink container already taken"))?;
                container.extract_partition_batches(&pages_rows)?
            };
            let spiller = self.ensure_spiller()?;
            spiller.spill_partition(partition, &schema, &batches)?;
            spilled_rows += batches.iter().map(|b| b.num_rows() as u64).sum::<u64>();
            spilled_partitions += 1;
        }
        let (spilled_files, disk_bytes) = self
            .spiller
            .as_ref()
            .map(|s| (s.file_count() as u64, s.total_bytes()))
            .unwrap_or((0, 0));
        if let Some(container) = self.container.as_mut() {
            container.clear();
        }
        if let Some(token) = self.reclaim_token.as_ref() {
            token.report_reclaimable(0);
        }
        if let Some(stats) = self.spill_stats.as_ref() {
            stats.spilled_rows.add(spilled_rows as i64);
            stats.spilled_partitions.add(spilled_partitions as i64);
            stats.spilled_files.set(spilled_files as i64);
            stats.spilled_bytes.set(disk_bytes as i64);
        }
        drop(timer);
        debug!(
            "HashJoinBuildSink spilled: node_id={} driver_id={} rows={} partitions={}",
            self.bridge.node_id(),
            self.driver_id,
            spilled_rows,
            spilled_partitions
        );
        Ok(())
    }
}

fn merge_spilled(spilled: Vec<SpilledPartition>) -> Vec<SpilledPartition> {
    let mut by_partition: std::collections::BTreeMap<u32, SpilledPartition> =
        std::collections::BTreeMap::new();
    for partition in spilled {
        by_partition
            .entry(partition.partition)
            .and_modify(|existing| existing.files.extend(partition.files.iter().cloned()))
            .or_insert(partition);
    }
    by_partition.into_values().collect()
}
