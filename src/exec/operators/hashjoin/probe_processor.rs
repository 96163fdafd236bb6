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
//! Hash-join probe processor.
//!
//! Responsibilities:
//! - Buffers probe input until the bridge publishes, probes through the core and
//!   yields output in preferred-size batches via a resumable cursor.
//! - Merges per-driver finish state at the bridge; the last probe driver emits
//!   the build-side remainder and replays spilled partition pairs recursively.
//! - Spills pending input or in-progress output under reclaim, and emits dynamic
//!   filters back to the probe-side scan when no spill occurred.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use std::time::Duration;

use arrow::array::{ArrayRef, UInt32Array};
use arrow::compute::take_record_batch;
use arrow::record_batch::RecordBatch;

use crate::common::error::{ExecError, ExecResult};
use crate::common::ids::PlanNodeId;
use crate::common::logging::debug;
use crate::exec::chunk::Chunk;
use crate::exec::expr::ExprArena;
use crate::exec::hash_table::key_builder::{build_key_hashes, build_key_views, row_has_null_key};
use crate::exec::node::join::{JoinSpec, JoinType, OutputColumn};
use crate::exec::operators::hashjoin::join_bridge::{JoinArtifact, JoinBridge};
use crate::exec::operators::hashjoin::join_hash_table::{JoinHashTable, ParallelBuildPolicy};
use crate::exec::operators::hashjoin::probe_core::ProbeCore;
use crate::exec::operators::hashjoin::row_container::RowContainer;
use crate::exec::pipeline::dependency::DependencyHandle;
use crate::exec::pipeline::operator::{Operator, OperatorFactory, ProcessorOperator};
use crate::exec::runtime_filter::DynamicFilter;
use crate::exec::runtime_filter::channel::DynamicFilterChannel;
use crate::exec::runtime_filter::in_filter::DistinctSetBuilder;
use crate::exec::spill::spill_stream::SpillStream;
use crate::exec::spill::spiller::{
    JoinSpiller, SpilledPartition, bit_window_fits, open_partition_streams, partition_index_at,
};
use crate::exec::spill::{SpillConfig, SpillStats, SpillableOperator};
use crate::runtime::arbitrator::ReclaimToken;
use crate::runtime::profile::{CounterUnit, OperatorProfiles};
use crate::runtime::runtime_state::RuntimeState;

const BUILD_WAIT_AT_FINISH: Duration = Duration::from_secs(60);
const MAX_BUFFERED_PROBE_CHUNKS: usize = 8;

/// Where a probe operator publishes a dynamic filter for one build key column.
#[derive(Clone, Copy, Debug)]
pub struct DynamicFilterTarget {
    /// Ordinal into the join's key list.
    pub key_ordinal: usize,
    pub scan_node: PlanNodeId,
    pub scan_column: usize,
}

/// Factory for per-driver hash-join probe processors.
pub struct HashJoinProbeProcessorFactory {
    name: String,
    spec: Arc<JoinSpec>,
    arena: Arc<ExprArena>,
    bridge: Arc<JoinBridge>,
    filter_channel: Option<Arc<DynamicFilterChannel>>,
    filter_targets: Vec<DynamicFilterTarget>,
}

impl HashJoinProbeProcessorFactory {
    pub fn new(
        spec: Arc<JoinSpec>,
        arena: Arc<ExprArena>,
        bridge: Arc<JoinBridge>,
    ) -> ExecResult<Self> {
        spec.validate()?;
        Ok(Self {
            name: format!("HASH_JOIN_PROBE (id={})", bridge.node_id()),
            spec,
            arena,
            bridge,
            filter_channel: None,
            filter_targets: Vec::new(),
        })
    }

    /// Enable dynamic filter production toward the named scan targets.
    pub fn with_dynamic_filters(
        mut self,
        channel: Arc<DynamicFilterChannel>,
        targets: Vec<DynamicFilterTarget>,
    ) -> Self {
        self.filter_channel = Some(channel);
        self.filter_targets = targets;
        self
    }
}

impl OperatorFactory for HashJoinProbeProcessorFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self, _dop: i32, driver_id: i32) -> Box<dyn Operator> {
        debug!(
            "HashJoinProbe create: node_id={} driver_id={} join_type={} null_aware={}",
            self.bridge.node_id(),
            driver_id,
            self.spec.join_type.as_str(),
            self.spec.null_aware
        );
        let core = ProbeCore::new(Arc::clone(&self.spec), Arc::clone(&self.arena))
            .expect("validated join spec");
        Box::new(HashJoinProbeOperator {
            name: self.name.clone(),
            driver_id,
            spec: Arc::clone(&self.spec),
            bridge: Arc::clone(&self.bridge),
            dep: self.bridge.table_dependency(),
            core,
            artifact: None,
            buffered: VecDeque::new(),
            pending_output: VecDeque::new(),
            restore_streams: VecDeque::new(),
            output_spill_keepalive: Vec::new(),
            spill_config: None,
            probe_spiller: None,
            replay_queue: VecDeque::new(),
            probe_partitions: HashMap::new(),
            recursion_requested: false,
            spilled_bytes_counter: Arc::new(AtomicI64::new(0)),
            finishing: false,
            finishing_done: false,
            finished: false,
            finish_early: false,
            probe_arrived: false,
            is_last_prober: false,
            emitted_build_side: false,
            replace_with_filter: false,
            filters_published: false,
            filter_channel: self.filter_channel.clone(),
            filter_targets: self.filter_targets.clone(),
            input_rows: 0,
            input_chunks: 0,
            reclaim_token: None,
            profiles: None,
            spill_stats: None,
        })
    }
}

/// One spilled partition pair awaiting replay by the last probe driver.
struct ReplayEntry {
    build: SpilledPartition,
    probe: Option<SpilledPartition>,
}

struct HashJoinProbeOperator {
    name: String,
    driver_id: i32,
    spec: Arc<JoinSpec>,
    bridge: Arc<JoinBridge>,
    dep: DependencyHandle,
    core: ProbeCore,
    artifact: Option<Arc<JoinArtifact>>,
    buffered: VecDeque<Chunk>,
    pending_output: VecDeque<Chunk>,
    /// Readers over previously spilled output, drained before new output.
    restore_streams: VecDeque<SpillStream>,
    /// Keeps spilled-output files alive (and thus on disk) until close.
    output_spill_keepalive: Vec<SpilledPartition>,
    spill_config: Option<SpillConfig>,
    probe_spiller: Option<JoinSpiller>,
    replay_queue: VecDeque<ReplayEntry>,
    /// Merged probe-side partitions keyed by (level, partition).
    probe_partitions: HashMap<(u16, u32), SpilledPartition>,
    recursion_requested: bool,
    spilled_bytes_counter: Arc<AtomicI64>,
    finishing: bool,
    finishing_done: bool,
    finished: bool,
    finish_early: bool,
    probe_arrived: bool,
    is_last_prober: bool,
    emitted_build_side: bool,
    replace_with_filter: bool,
    filters_published: bool,
    filter_channel: Option<Arc<DynamicFilterChannel>>,
    filter_targets: Vec<DynamicFilterTarget>,
    input_rows: u64,
    input_chunks: u64,
    reclaim_token: Option<ReclaimToken>,
    profiles: Option<OperatorProfiles>,
    spill_stats: Option<SpillStats>,
}

impl Operator for HashJoinProbeOperator {
    fn name(&self) -> &str {
        &self.name
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

    fn close(&mut self, _state: &RuntimeState) -> ExecResult<()> {
        if let Some(profiles) = self.profiles.as_ref() {
            if let Some(channel) = self.filter_channel.as_ref() {
                profiles.common.counter_set(
                    "DynamicFiltersProduced",
                    CounterUnit::Unit,
                    channel.produced_count() as i64,
                );
                profiles.common.counter_set(
                    "DynamicFiltersAccepted",
                    CounterUnit::Unit,
                    channel.accepted_count() as i64,
                );
            }
        }
        // Spill files owed to this operator unlink here at the latest.
        self.restore_streams.clear();
        self.output_spill_keepalive.clear();
        self.probe_partitions.clear();
        self.replay_queue.clear();
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

impl ProcessorOperator for HashJoinProbeOperator {
    fn need_input(&self) -> bool {
        if self.finishing || self.finished || self.finish_early {
            return false;
        }
        if !self.pending_output.is_empty() {
            return false;
        }
        if self.core.is_loaded() || self.dep.is_ready() {
            return true;
        }
        self.buffered.len() < MAX_BUFFERED_PROBE_CHUNKS
    }

    fn has_output(&self) -> bool {
        if !self.pending_output.is_empty() || !self.restore_streams.is_empty() {
            return true;
        }
        self.finishing && !self.finishing_done
    }

    fn push_chunk(&mut self, state: &RuntimeState, chunk: Chunk) -> ExecResult<()> {
        state.check_alive()?;
        if self.finished || self.finish_early {
            return Ok(());
        }
        if self.finishing {
            return Err(ExecError::internal(
                "join probe received input after set_finishing",
            ));
        }
        self.drain_reclaim_demand(state)?;
        if !chunk.is_empty() {
            self.input_rows += chunk.len() as u64;
            self.input_chunks += 1;
        }

        if !self.core.is_loaded() && !self.try_load_build(state)? {
            if self.buffered.len() >= MAX_BUFFERED_PROBE_CHUNKS {
                return Err(ExecError::internal("join probe input buffer is full"));
            }
            self.buffered.push_back(chunk);
            return Ok(());
        }
        if self.finish_early {
            return Ok(());
        }

        // Anything buffered before the build arrived goes first.
        while let Some(buffered) = self.buffered.pop_front() {
            self.process_chunk(state, buffered)?;
        }
        self.process_chunk(state, chunk)
    }

    fn pull_chunk(&mut self, state: &RuntimeState) -> ExecResult<Option<Chunk>> {
        state.check_alive()?;
        if let Some(chunk) = self.next_restored_or_pending()? {
            return Ok(Some(chunk));
        }
        if self.finishing && !self.finishing_done {
            self.advance_finish(state)?;
            if let Some(chunk) = self.next_restored_or_pending()? {
                return Ok(Some(chunk));
            }
        }
        if self.finishing && self.finishing_done {
            self.finished = true;
            if self.is_last_prober || self.bridge.num_probers() == 1 {
                self.bridge.mark_drained();
            }
        }
        Ok(None)
    }

    fn set_finishing(&mut self, state: &RuntimeState) -> ExecResult<()> {
        state.check_alive()?;
        if self.finished {
            return Ok(());
        }
        self.finishing = true;
        Ok(())
    }

    fn precondition_dependency(&self) -> Option<DependencyHandle> {
        if self.core.is_loaded() || self.dep.is_ready() {
            None
        } else {
            Some(self.dep.clone())
        }
    }
}

impl HashJoinProbeOperator {
    fn next_restored_or_pending(&mut self) -> ExecResult<Option<Chunk>> {
        // Output spilled mid-emission replays before anything newer, keeping the
        // output order of the remainder stable.
        while let Some(stream) = self.restore_streams.front_mut() {
            match stream.next_batch()? {
                Some(batch) => {
                    if let Some(stats) = self.spill_stats.as_ref() {
                        stats.restore_rows.add(batch.num_rows() as i64);
                    }
                    return Ok(Some(Chunk::try_new(batch)?));
                }
                None => {
                    self.restore_streams.pop_front();
                }
            }
        }
        Ok(self.pending_output.pop_front())
    }

    /// Non-blocking build pickup; returns whether the build side is loaded.
    fn try_load_build(&mut self, state: &RuntimeState) -> ExecResult<bool> {
        if self.core.is_loaded() {
            return Ok(true);
        }
        if self.bridge.is_cancelled() {
            return Err(ExecError::aborted("join bridge cancelled"));
        }
        let Some(artifact) = self.bridge.artifact() else {
            return Ok(false);
        };
        self.load_artifact(state, artifact)?;
        Ok(true)
    }

    fn load_artifact(
        &mut self,
        state: &RuntimeState,
        artifact: Arc<JoinArtifact>,
    ) -> ExecResult<()> {
        self.core.load(
            Arc::clone(&artifact.container),
            artifact.table.clone(),
            artifact.total_build_rows,
            artifact.build_has_null_key,
        );
        if artifact.total_build_rows == 0
            && state.options().hash_probe_finish_early_on_empty_build
            && self.spec.join_type.finishes_early_on_empty_build()
        {
            debug!(
                "HashJoinProbe finish early on empty build: node_id={} driver_id={}",
                self.bridge.node_id(),
                self.driver_id
            );
            self.finish_early = true;
            self.buffered.clear();
        }
        self.maybe_publish_dynamic_filters(&artifact)?;
        self.artifact = Some(artifact);
        Ok(())
    }

    fn process_chunk(&mut self, state: &RuntimeState, chunk: Chunk) -> ExecResult<()> {
        state.check_alive()?;
        if chunk.is_empty() {
            return Ok(());
        }
        if self.replace_with_filter {
            // The scan already applied the exact filter; the join is a pass-through.
            let batch = self.project_probe_passthrough(&chunk)?;
            if let Some(profiles) = self.profiles.as_ref() {
                profiles.common.counter_add(
                    "ReplacedWithFilterRows",
                    CounterUnit::Unit,
                    batch.num_rows() as i64,
                );
            }
            self.enqueue_output(state, batch);
            return Ok(());
        }

        // Rows that hash into build-spilled partitions go to disk for replay;
        // the remainder probes the in-memory table.
        let chunk = self.spill_probe_rows_for_spilled_partitions(chunk)?;
        if chunk.is_empty() {
            return Ok(());
        }
        let batches = self.core.probe_chunk(&chunk)?;
        for batch in batches {
            self.enqueue_output(state, batch);
        }
        Ok(())
    }

    /// Split off the probe rows belonging to build-spilled partitions and write
    /// them to this driver's probe-side spill files.
    fn spill_probe_rows_for_spilled_partitions(&mut self, chunk: Chunk) -> ExecResult<Chunk> {
        let spilled_ids: Vec<u32> = match self.artifact.as_ref() {
            Some(artifact) if !artifact.spilled.is_empty() => {
                artifact.spilled.iter().map(|p| p.partition).collect()
            }
            _ => return Ok(chunk),
        };
        let config = self
            .spill_config
            .clone()
            .ok_or_else(|| ExecError::internal("build spilled but probe spill is disabled"))?;

        let key_arrays: Vec<ArrayRef> = self
            .spec
            .probe_keys
            .iter()
            .map(|idx| chunk.column(*idx))
            .collect::<ExecResult<_>>()?;
        let views = build_key_views(&key_arrays)?;
        let hashes = build_key_hashes(&views, chunk.len(), self.bridge.hash_seed());

        let mut keep: Vec<u32> = Vec::with_capacity(chunk.len());
        let mut to_spill: HashMap<u32, Vec<u32>> = HashMap::new();
        for (row, hash) in hashes.iter().enumerate() {
            let partition = partition_index_at(&config, 0, *hash);
            if spilled_ids.contains(&partition) {
                to_spill.entry(partition).or_default().push(row as u32);
            } else {
                keep.push(row as u32);
            }
        }
        if to_spill.is_empty() {
            return Ok(chunk);
        }

        self.bridge.note_probe_spill();
        if self.probe_spiller.is_none() {
            self.probe_spiller = Some(JoinSpiller::new(
                config,
                0,
                Arc::clone(&self.spilled_bytes_counter),
            )?);
        }
        let schema = chunk.schema();
        for (partition, rows) in to_spill {
            let indices = UInt32Array::from(rows);
            let batch = take_record_batch(&chunk.batch, &indices)
                .map_err(|e| ExecError::internal(format!("probe spill split failed: {e}")))?;
            if let Some(stats) = self.spill_stats.as_ref() {
                stats.spilled_rows.add(batch.num_rows() as i64);
            }
            let spiller = self
                .probe_spiller
                .as_mut()
                .ok_or_else(|| ExecError::internal("probe spiller missing"))?;
            spiller.spill_partition(partition, &schema, &[batch])?;
        }

        if keep.is_empty() {
            let empty = chunk.batch.slice(0, 0);
            return Chunk::try_new(empty);
        }
        let indices = UInt32Array::from(keep);
        let batch = take_record_batch(&chunk.batch, &indices)
            .map_err(|e| ExecError::internal(format!("probe spill split failed: {e}")))?;
        Chunk::try_new(batch)
    }

    /// Finish protocol, one expensive unit per call so the driver can interleave
    /// output draining:
    /// 1. drain buffered input through the in-memory table,
    /// 2. merge finish state at the bridge (last prober carries on),
    /// 3. emit the build-side remainder,
    /// 4. replay spilled partition pairs until dry.
    fn advance_finish(&mut self, state: &RuntimeState) -> ExecResult<()> {
        if !self.core.is_loaded() && !self.probe_arrived {
            let artifact = self.bridge.wait_artifact(BUILD_WAIT_AT_FINISH)?;
            self.load_artifact(state, artifact)?;
        }

        if !self.probe_arrived {
            while let Some(buffered) = self.buffered.pop_front() {
                self.process_chunk(state, buffered)?;
            }
            if !self.pending_output.is_empty() {
                return Ok(());
            }

            self.probe_arrived = true;
            let matched = self.core.take_build_matched();
            let probe_rows = self.core.probe_rows_seen();
            let saw_null = self.core.probe_saw_null_key();
            let own_partitions = self.take_own_probe_partitions();
            match self
                .bridge
                .arrive_prober(matched, probe_rows, saw_null, own_partitions)?
            {
                Some(merge) => {
                    self.is_last_prober = true;
                    self.core.set_build_matched(merge.matched);
                    self.core.set_probe_totals(merge.probe_rows, merge.probe_saw_null_key);
                    for partition in merge.probe_partitions {
                        merge_probe_partition(&mut self.probe_partitions, partition);
                    }
                }
                None => {
                    self.core.unload();
                    self.finishing_done = true;
                    return Ok(());
                }
            }
        }

        if self.is_last_prober && !self.emitted_build_side {
            self.emitted_build_side = true;
            let batches = self.core.finish()?;
            let had_output = !batches.is_empty();
            for batch in batches {
                self.enqueue_output(state, batch);
            }
            self.core.unload();
            if had_output {
                return Ok(());
            }
        }

        if let Some(entry) = self.replay_queue.pop_front() {
            self.replay_partition(state, entry)?;
            return Ok(());
        }
        if let Some(entry) = self.claim_from_bridge() {
            self.replay_queue.push_back(entry);
            return Ok(());
        }

        debug!(
            "HashJoinProbe finished: node_id={} driver_id={} input_rows={} input_chunks={} output_rows={}",
            self.bridge.node_id(),
            self.driver_id,
            self.input_rows,
            self.input_chunks,
            self.core.output_rows()
        );
        self.finishing_done = true;
        Ok(())
    }

    fn take_own_probe_partitions(&mut self) -> Vec<SpilledPartition> {
        match self.probe_spiller.take() {
            Some(mut spiller) => spiller.take_spilled_partitions(),
            None => Vec::new(),
        }
    }

    fn claim_from_bridge(&mut self) -> Option<ReplayEntry> {
        if !self.is_last_prober {
            return None;
        }
        let build = self.bridge.claim_spilled_partition()?;
        let probe = self
            .probe_partitions
            .remove(&(build.level, build.partition));
        Some(ReplayEntry { build, probe })
    }

    /// Replay one spilled partition pair: rebuild a smaller table from the build
    /// files and probe it with the corresponding probe files. A reclaim that
    /// arrived since the last step recurses instead, unless the level cap or the
    /// hash width stops it; then the partition is processed in place and
    /// `ExceededMaxSpillLevel` is recorded.
    fn replay_partition(&mut self, state: &RuntimeState, entry: ReplayEntry) -> ExecResult<()> {
        state.check_alive()?;
        let config = self
            .spill_config
            .clone()
            .ok_or_else(|| ExecError::internal("spilled partition replay without spill config"))?;
        let level = entry.build.level;
        debug!(
            "HashJoinProbe replay: node_id={} driver_id={} partition={} level={} build_rows={}",
            self.bridge.node_id(),
            self.driver_id,
            entry.build.partition,
            level,
            entry.build.rows()
        );

        if self.recursion_requested {
            self.recursion_requested = false;
            let next_level = level + 1;
            let level_allowed = config.max_spill_level < 0
                || i32::from(next_level) <= config.max_spill_level;
            if level_allowed && bit_window_fits(&config, next_level) {
                return self.respill_partition(state, entry, next_level);
            }
            if let Some(stats) = self.spill_stats.as_ref() {
                stats.exceeded_max_spill_level_count.add(1);
                stats
                    .exceeded_max_spill_level_max
                    .set_max(i64::from(next_level));
            }
            // Fall through: process the partition in place.
        }

        let container = self.read_build_partition(&entry.build)?;
        let table = if container.row_count() > 0 {
            let mut table = JoinHashTable::prepare(
                &container,
                self.spec.build_key_types()?,
                self.spec.null_aware,
                self.bridge.hash_seed(),
            )?;
            table.build(
                &container,
                state,
                ParallelBuildPolicy {
                    min_table_rows: usize::MAX,
                    contributors: 1,
                },
            )?;
            Some(Arc::new(table))
        } else {
            None
        };
        let artifact = self
            .artifact
            .as_ref()
            .ok_or_else(|| ExecError::internal("replay without a loaded artifact"))?;
        self.core.load(
            Arc::new(container),
            table,
            artifact.total_build_rows,
            artifact.build_has_null_key,
        );

        if let Some(probe_partition) = entry.probe {
            let streams = open_partition_streams(&probe_partition, self.spec.probe_schema.clone())?;
            for mut stream in streams {
                while let Some(batch) = stream.next_batch()? {
                    if batch.num_rows() == 0 {
                        continue;
                    }
                    if let Some(stats) = self.spill_stats.as_ref() {
                        stats.restore_rows.add(batch.num_rows() as i64);
                    }
                    let chunk = Chunk::try_new(batch)?;
                    let batches = self.core.probe_chunk(&chunk)?;
                    for batch in batches {
                        self.enqueue_output(state, batch);
                    }
                }
            }
        }
        let batches = self.core.finish()?;
        for batch in batches {
            self.enqueue_output(state, batch);
        }
        self.core.unload();
        Ok(())
    }

    /// Redistribute one partition pair to the next level.
    fn respill_partition(
        &mut self,
        state: &RuntimeState,
        entry: ReplayEntry,
        next_level: u16,
    ) -> ExecResult<()> {
        state.check_alive()?;
        let config = self
            .spill_config
            .clone()
            .ok_or_else(|| ExecError::internal("respill without spill config"))?;
        debug!(
            "HashJoinProbe respill: node_id={} partition={} level={} -> {}",
            self.bridge.node_id(),
            entry.build.partition,
            entry.build.level,
            next_level
        );

        let mut build_spiller = JoinSpiller::new(
            config.clone(),
            next_level,
            Arc::clone(&self.spilled_bytes_counter),
        )?;
        self.respill_side(
            &entry.build,
            self.spec.build_schema.clone(),
            &self.spec.build_keys.clone(),
            &mut build_spiller,
        )?;
        let new_build = build_spiller.take_spilled_partitions();

        let mut new_probe: HashMap<u32, SpilledPartition> = HashMap::new();
        if let Some(probe_partition) = entry.probe.as_ref() {
            let mut probe_spiller = JoinSpiller::new(
                config,
                next_level,
                Arc::clone(&self.spilled_bytes_counter),
            )?;
            self.respill_side(
                probe_partition,
                self.spec.probe_schema.clone(),
                &self.spec.probe_keys.clone(),
                &mut probe_spiller,
            )?;
            for partition in probe_spiller.take_spilled_partitions() {
                new_probe.insert(partition.partition, partition);
            }
        }

        for build in new_build {
            let probe = new_probe.remove(&build.partition);
            self.replay_queue.push_back(ReplayEntry { build, probe });
        }
        if let Some(stats) = self.spill_stats.as_ref() {
            stats.spilled_partitions.add(1);
        }
        Ok(())
    }

    fn respill_side(
        &mut self,
        partition: &SpilledPartition,
        schema: arrow::datatypes::SchemaRef,
        key_columns: &[usize],
        spiller: &mut JoinSpiller,
    ) -> ExecResult<()> {
        let streams = open_partition_streams(partition, schema.clone())?;
        for mut stream in streams {
            while let Some(batch) = stream.next_batch()? {
                if batch.num_rows() == 0 {
                    continue;
                }
                let key_arrays: Vec<ArrayRef> = key_columns
                    .iter()
                    .map(|idx| {
                        batch
                            .columns()
                            .get(*idx)
                            .cloned()
                            .ok_or_else(|| ExecError::internal("respill key column out of bounds"))
                    })
                    .collect::<ExecResult<_>>()?;
                let views = build_key_views(&key_arrays)?;
                let hashes = build_key_hashes(&views, batch.num_rows(), self.bridge.hash_seed());
                let mut by_partition: HashMap<u32, Vec<u32>> = HashMap::new();
                for (row, hash) in hashes.iter().enumerate() {
                    let target = spiller.partition_index(*hash);
                    by_partition.entry(target).or_default().push(row as u32);
                }
                for (target, rows) in by_partition {
                    let indices = UInt32Array::from(rows);
                    let split = take_record_batch(&batch, &indices)
                        .map_err(|e| ExecError::internal(format!("respill split failed: {e}")))?;
                    spiller.spill_partition(target, &schema, &[split])?;
                }
            }
        }
        Ok(())
    }

    /// Load one spilled build partition back into a fresh container.
    fn read_build_partition(&self, partition: &SpilledPartition) -> ExecResult<RowContainer> {
        let mut container = RowContainer::new(
            self.spec.build_schema.clone(),
            self.spec.build_keys.clone(),
        );
        let streams = open_partition_streams(partition, self.spec.build_schema.clone())?;
        for mut stream in streams {
            while let Some(batch) = stream.next_batch()? {
                if batch.num_rows() == 0 {
                    continue;
                }
                if let Some(stats) = self.spill_stats.as_ref() {
                    stats.restore_rows.add(batch.num_rows() as i64);
                }
                let chunk = Chunk::try_new(batch)?;
                let key_arrays: Vec<ArrayRef> = self
                    .spec
                    .build_keys
                    .iter()
                    .map(|idx| chunk.column(*idx))
                    .collect::<ExecResult<_>>()?;
                let views = build_key_views(&key_arrays)?;
                let num_rows = chunk.len();
                let hashes = build_key_hashes(&views, num_rows, self.bridge.hash_seed());
                let null_keys: Vec<bool> = (0..num_rows)
                    .map(|row| row_has_null_key(&views, row))
                    .collect();
                let mut column_null_counts = vec![0u64; self.spec.build_keys.len()];
                for (col, view) in views.iter().enumerate() {
                    for row in 0..num_rows {
                        if view.is_null(row) {
                            column_null_counts[col] += 1;
                        }
                    }
                }
                container.append_page(chunk, hashes, null_keys, &column_null_counts)?;
            }
        }
        Ok(container)
    }

    /// Slice an output batch into preferred-size chunks and queue them.
    fn enqueue_output(&mut self, state: &RuntimeState, batch: RecordBatch) {
        if batch.num_rows() == 0 {
            return;
        }
        let options = state.options();
        let mut rows_per_chunk = options.preferred_output_batch_rows.max(1);
        let batch_bytes = batch.get_array_memory_size().max(1);
        let bytes_per_row = batch_bytes / batch.num_rows().max(1);
        if bytes_per_row > 0 {
            let rows_by_bytes = (options.preferred_output_batch_bytes / bytes_per_row).max(1);
            rows_per_chunk = rows_per_chunk.min(rows_by_bytes);
        }
        let mut offset = 0;
        while offset < batch.num_rows() {
            let len = rows_per_chunk.min(batch.num_rows() - offset);
            let slice = batch.slice(offset, len);
            self.pending_output.push_back(Chunk::new(slice));
            offset += len;
        }
    }

    fn project_probe_passthrough(&self, chunk: &Chunk) -> ExecResult<RecordBatch> {
        let mut columns = Vec::with_capacity(self.spec.output_layout.len());
        for output in &self.spec.output_layout {
            match output {
                OutputColumn::Probe(idx) => columns.push(chunk.column(*idx)?),
                OutputColumn::Build(_) => {
                    return Err(ExecError::internal(
                        "filter-replaced join cannot output build columns",
                    ));
                }
            }
        }
        RecordBatch::try_new(self.core.output_schema(), columns)
            .map_err(|e| ExecError::internal(format!("pass-through projection failed: {e}")))
    }

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

    /// Dynamic filters are produced only when no spill occurred anywhere in the
    /// join; spill wins when both become possible in the same instant.
    fn maybe_publish_dynamic_filters(&mut self, artifact: &JoinArtifact) -> ExecResult<()> {
        if self.filters_published {
            return Ok(());
        }
        self.filters_published = true;
        let Some(channel) = self.filter_channel.clone() else {
            return Ok(());
        };
        if self.filter_targets.is_empty() {
            return Ok(());
        }
        if self.bridge.any_spill_observed() || !artifact.spilled.is_empty() {
            return Ok(());
        }
        // Filters drop non-matching probe rows at the scan, which is only sound
        // when such rows produce no join output.
        if !matches!(
            self.spec.join_type,
            JoinType::Inner | JoinType::LeftSemiFilter | JoinType::RightSemiFilter
        ) {
            return Ok(());
        }
        let Some(table) = artifact.table.as_ref() else {
            return Ok(());
        };

        for target in &self.filter_targets.clone() {
            let Some(range) = table.key_range(target.key_ordinal) else {
                continue;
            };
            let key_column = match self.spec.build_keys.get(target.key_ordinal) {
                Some(idx) => *idx,
                None => continue,
            };
            let mut distinct = DistinctSetBuilder::default();
            let mut eligible = true;
            for page in artifact.container.pages() {
                let array = page.chunk.column(key_column)?;
                let views = build_key_views(std::slice::from_ref(&array))?;
                if !distinct.observe_view(&views[0], page.chunk.len()) {
                    eligible = false;
                    break;
                }
            }
            if !eligible {
                continue;
            }
            let filter = DynamicFilter {
                range,
                distinct: distinct.finish().map(Arc::new),
            };
            let exact = filter.is_exact();
            channel.publish(target.scan_node, target.scan_column, filter)?;

            // The join collapses into the filter when the filter alone decides
            // membership and the output needs nothing from the build side.
            let unique_build_keys = table.group_count() == table.indexed_rows();
            let replaceable = exact
                && self.spec.probe_keys.len() == 1
                && self.spec.residual.is_none()
                && self
                    .spec
                    .output_layout
                    .iter()
                    .all(|c| matches!(c, OutputColumn::Probe(_)))
                && match self.spec.join_type {
                    JoinType::LeftSemiFilter => true,
                    JoinType::Inner => unique_build_keys,
                    _ => false,
                };
            if replaceable {
                debug!(
                    "HashJoinProbe replaced with filter: node_id={} scan={}",
                    self.bridge.node_id(),
                    target.scan_node
                );
                self.replace_with_filter = true;
            }
        }
        Ok(())
    }
}

impl SpillableOperator for HashJoinProbeOperator {
    fn spillable(&self) -> bool {
        self.spill_config.is_some()
            && !self.finished
            && (!self.pending_output.is_empty() || !self.buffered.is_empty() || self.finishing)
    }

    fn estimated_revocable_bytes(&self) -> i64 {
        if !self.spillable() {
            return 0;
        }
        let pending: usize = self.pending_output.iter().map(|c| c.estimated_bytes()).sum();
        let buffered: usize = self.buffered.iter().map(|c| c.estimated_bytes()).sum();
        i64::try_from(pending + buffered).unwrap_or(i64::MAX)
    }

    fn trigger_spill(&mut self, state: &RuntimeState) -> ExecResult<()> {
        state.check_alive()?;
        if !self.spillable() {
            return Ok(());
        }
        let config = self
            .spill_config
            .clone()
            .ok_or_else(|| ExecError::internal("spill triggered while disabled"))?;
        self.bridge.note_probe_spill();

        // Mid-output spill: only the partially produced output run goes to disk,
        // as a single partition; the built table is never a spill victim here.
        if !self.pending_output.is_empty() {
            let mut spiller = JoinSpiller::new(
                config.clone(),
                0,
                Arc::clone(&self.spilled_bytes_counter),
            )?;
            let schema = self.core.output_schema();
            let batches: Vec<RecordBatch> = self
                .pending_output
                .drain(..)
                .map(|chunk| chunk.batch)
                .collect();
            if let Some(stats) = self.spill_stats.as_ref() {
                let rows: usize = batches.iter().map(|b| b.num_rows()).sum();
                stats.spilled_rows.add(rows as i64);
            }
            spiller.spill_partition(0, &schema, &batches)?;
            for partition in spiller.take_spilled_partitions() {
                for stream in open_partition_streams(&partition, schema.clone())? {
                    self.restore_streams.push_back(stream);
                }
                // The readers keep the files open; the handles stay alive until
                // close so Drop can unlink the files afterwards.
                self.output_spill_keepalive.push(partition);
            }
        }

        // Replay recursion: the next replayed partition redistributes to the
        // deeper level instead of building a table.
        if self.finishing {
            self.recursion_requested = true;
        }
        Ok(())
    }
}

fn merge_probe_partition(
    partitions: &mut HashMap<(u16, u32), SpilledPartition>,
    partition: SpilledPartition,
) {
    partitions
        .entry((partition.level, partition.partition))
        .and_modify(|existing| existing.files.extend(partition.files.iter().cloned()))
        .or_insert(partition);
}
