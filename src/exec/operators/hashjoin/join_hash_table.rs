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
//! Join hash table: key tuples to chains of row-container rows.
//!
//! Responsibilities:
//! - Decides the representation mode once from complete build-side statistics,
//!   then builds group chains over the row container, optionally in parallel.
//! - Serves batched probe lookups; chain iteration order is stable across calls.
//!
//! The table never contains null-key rows; those stay tagged in the container
//! for the join variants that need them.

use std::sync::Arc;

use arrow::datatypes::DataType;

use crate::common::error::{ExecError, ExecResult};
use crate::common::logging::debug;
use crate::exec::hash_table::key_builder::{
    KeyArrayView, build_key_hashes, build_key_views, row_has_null_key,
};
use crate::exec::hash_table::key_strategy::{JoinKeyMode, KeyColumnStats, pick_join_key_mode};
use crate::exec::hash_table::key_table::{KeyIndex, KeyLookup};
use crate::exec::operators::hashjoin::row_container::{ROW_NONE, RowContainer};
use crate::exec::runtime_filter::min_max::ValueRange;
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::runtime_state::RuntimeState;

const PARALLEL_BUILD_PARTITIONS: usize = 8;

/// Parallel-build eligibility, decided by the build leader.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ParallelBuildPolicy {
    pub(crate) min_table_rows: usize,
    pub(crate) contributors: usize,
}

#[derive(Debug)]
pub(crate) struct JoinHashTable {
    key_types: Vec<DataType>,
    mode: JoinKeyMode,
    index: KeyIndex,
    hash_seed: u64,
    group_head: Vec<u32>,
    row_next: Vec<u32>,
    group_offsets: Option<Vec<u32>>,
    group_rows: Option<Vec<u32>>,
    indexed_rows: usize,
    key_stats: Vec<KeyColumnStats>,
    built_parallel: bool,
    mem_tracker: Option<Arc<MemTracker>>,
    accounted_bytes: i64,
}

impl JoinHashTable {
    /// Scan the complete build input once, collect key statistics and decide the
    /// representation mode. The mode is stable for the table's lifetime.
    pub(crate) fn prepare(
        container: &RowContainer,
        key_types: Vec<DataType>,
        null_aware: bool,
        hash_seed: u64,
    ) -> ExecResult<Self> {
        if key_types.is_empty() {
            return Err(ExecError::invalid_plan("join hash table requires join keys"));
        }
        let mut stats: Vec<KeyColumnStats> = key_types.iter().map(KeyColumnStats::new).collect();
        for page in 0..container.page_count() {
            let arrays = container.key_arrays(page)?;
            let views = build_key_views(&arrays)?;
            let rows = container.pages()[page].chunk.len();
            for (stat, view) in stats.iter_mut().zip(views.iter()) {
                stat.observe(view, rows);
            }
        }
        let mode = if container.page_count() == 0 {
            JoinKeyMode::Hashed
        } else {
            // Views from any page classify the physical key types.
            let arrays = container.key_arrays(0)?;
            let views = build_key_views(&arrays)?;
            let null_aware_nullable = null_aware && container.has_null_key();
            pick_join_key_mode(&key_types, &stats, &views, null_aware_nullable)
        };
        debug!(
            "join hash table prepared: mode={:?} rows={} null_key_rows={}",
            mode,
            container.row_count(),
            container.null_key_rows()
        );
        let index = KeyIndex::new(&mode);
        Ok(Self {
            key_types,
            mode,
            index,
            hash_seed,
            group_head: Vec::new(),
            row_next: Vec::new(),
            group_offsets: None,
            group_rows: None,
            indexed_rows: 0,
            key_stats: stats,
            built_parallel: false,
            mem_tracker: None,
            accounted_bytes: 0,
        })
    }

    pub(crate) fn set_mem_tracker(&mut self, tracker: Arc<MemTracker>) {
        if let Some(current) = self.mem_tracker.as_ref() {
            current.release(self.accounted_bytes);
        }
        let bytes = self.tracked_bytes();
        tracker.consume(bytes);
        self.mem_tracker = Some(tracker);
        self.accounted_bytes = bytes;
    }

    pub(crate) fn mode(&self) -> &JoinKeyMode {
        &self.mode
    }

    pub(crate) fn hash_seed(&self) -> u64 {
        self.hash_seed
    }

    pub(crate) fn key_types(&self) -> &[DataType] {
        &self.key_types
    }

    pub(crate) fn group_count(&self) -> usize {
        self.group_head.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.group_head.is_empty()
    }

    /// Rows inserted into chains (excludes null-key rows).
    pub(crate) fn indexed_rows(&self) -> usize {
        self.indexed_rows
    }

    pub(crate) fn built_parallel(&self) -> bool {
        self.built_parallel
    }

    /// Observed range of key column `i`, for integer-like columns with values.
    pub(crate) fn key_range(&self, column: usize) -> Option<ValueRange> {
        let stat = self.key_stats.get(column)?;
        if !stat.int_like || stat.non_null_count == 0 {
            return None;
        }
        Some(ValueRange {
            min: stat.min,
            max: stat.max,
        })
    }

    pub(crate) fn key_null_count(&self, column: usize) -> u64 {
        self.key_stats.get(column).map(|s| s.null_count).unwrap_or(0)
    }

    /// Build the chains over the container. Work is split by hash prefix across
    /// worker threads when the policy allows and the general mode is in use.
    pub(crate) fn build(
        &mut self,
        container: &RowContainer,
        state: &RuntimeState,
        policy: ParallelBuildPolicy,
    ) -> ExecResult<()> {
        state.check_alive()?;
        let row_count = container.row_count();
        if row_count > ROW_NONE as usize {
            return Err(ExecError::internal("join build row count overflow"));
        }
        self.row_next = vec![ROW_NONE; row_count];

        let parallel = matches!(self.mode, JoinKeyMode::Hashed)
            && policy.contributors > 1
            && row_count >= policy.min_table_rows.max(1);
        if parallel {
            self.build_parallel(container, state)?;
        } else {
            self.build_serial(container)?;
        }
        state.check_alive()?;
        self.finalize_groups()?;
        self.refresh_accounting();
        Ok(())
    }

    fn build_serial(&mut self, container: &RowContainer) -> ExecResult<()> {
        let mut scratch = Vec::new();
        for page_idx in 0..container.page_count() {
            let arrays = container.key_arrays(page_idx)?;
            let views = build_key_views(&arrays)?;
            let page = &container.pages()[page_idx];
            for row in 0..page.chunk.len() {
                if page.null_keys[row] {
                    continue;
                }
                let flat = container.flat_id(page_idx, row);
                let lookup = self
                    .index
                    .insert(&views, row, page.hashes[row], &mut scratch)?;
                self.handle_lookup(lookup, flat)?;
            }
        }
        Ok(())
    }

    /// Workers own disjoint hash-prefix partitions of the rows; their output
    /// slots (chains and serialized keys) never overlap, and the leader links
    /// partition results into the shared table in a final merge step.
    fn build_parallel(&mut self, container: &RowContainer, state: &RuntimeState) -> ExecResult<()> {
        struct WorkerGroup {
            key: Vec<u8>,
            hash: u64,
            head: u32,
        }
        struct WorkerOutput {
            groups: Vec<WorkerGroup>,
            links: Vec<(u32, u32)>,
            rows: usize,
        }

        fn worker_partition(hash: u64) -> usize {
            (hash >> 61) as usize % PARALLEL_BUILD_PARTITIONS
        }

        fn run_worker(
            container: &RowContainer,
            partition: usize,
        ) -> ExecResult<WorkerOutput> {
            let mut local = KeyIndex::new(&JoinKeyMode::Hashed);
            let mut groups: Vec<WorkerGroup> = Vec::new();
            let mut links = Vec::new();
            let mut scratch = Vec::new();
            let mut rows = 0usize;
            for page_idx in 0..container.page_count() {
                let arrays = container.key_arrays(page_idx)?;
                let views = build_key_views(&arrays)?;
                let page = &container.pages()[page_idx];
                for row in 0..page.chunk.len() {
                    if page.null_keys[row] {
                        continue;
                    }
                    let hash = page.hashes[row];
                    if worker_partition(hash) != partition {
                        continue;
                    }
                    let flat = container.flat_id(page_idx, row);
                    let lookup = local.insert(&views, row, hash, &mut scratch)?;
                    if lookup.is_new {
                        if lookup.group_id != groups.len() {
                            return Err(ExecError::internal(
                                "parallel build local group id out of order",
                            ));
                        }
                        groups.push(WorkerGroup {
                            key: scratch.clone(),
                            hash,
                            head: ROW_NONE,
                        });
                    }
                    let group = groups
                        .get_mut(lookup.group_id)
                        .ok_or_else(|| ExecError::internal("parallel build group missing"))?;
                    links.push((flat, group.head));
                    group.head = flat;
                    rows += 1;
                }
            }
            Ok(WorkerOutput { groups, links, rows })
        }

        state.check_alive()?;
        let outputs: Vec<ExecResult<WorkerOutput>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..PARALLEL_BUILD_PARTITIONS)
                .map(|partition| scope.spawn(move || run_worker(container, partition)))
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(ExecError::internal("parallel build worker panicked")))
                })
                .collect()
        });
        state.check_alive()?;

        for output in outputs {
            let output = output?;
            for group in output.groups {
                let lookup = self.index.insert_serialized(&group.key, group.hash)?;
                if !lookup.is_new {
                    return Err(ExecError::internal(
                        "parallel build partitions produced overlapping keys",
                    ));
                }
                if lookup.group_id != self.group_head.len() {
                    return Err(ExecError::internal("parallel build group id out of order"));
                }
                self.group_head.push(group.head);
            }
            for (row, next) in output.links {
                let slot = row as usize;
                if slot >= self.row_next.len() {
                    return Err(ExecError::internal("parallel build row id out of bounds"));
                }
                self.row_next[slot] = next;
            }
            self.indexed_rows += output.rows;
        }
        self.built_parallel = true;
        Ok(())
    }

    fn handle_lookup(&mut self, lookup: KeyLookup, row_id: u32) -> ExecResult<()> {
        if lookup.is_new {
            if lookup.group_id != self.group_head.len() {
                return Err(ExecError::internal("join group id out of order"));
            }
            self.group_head.push(ROW_NONE);
        }
        let head = self
            .group_head
            .get(lookup.group_id)
            .copied()
            .ok_or_else(|| ExecError::internal("join group id out of bounds"))?;
        let slot = row_id as usize;
        if slot >= self.row_next.len() {
            return Err(ExecError::internal("join row id out of bounds"));
        }
        self.row_next[slot] = head;
        self.group_head[lookup.group_id] = row_id;
        self.indexed_rows += 1;
        Ok(())
    }

    /// Flatten chains into offset/row arrays so probe-side iteration over one
    /// chain is stable across calls.
    fn finalize_groups(&mut self) -> ExecResult<()> {
        if self.group_offsets.is_some() {
            return Ok(());
        }
        let group_count = self.group_head.len();
        let mut counts = vec![0u32; group_count];
        for group_id in 0..group_count {
            let mut row = self.group_head[group_id];
            while row != ROW_NONE {
                counts[group_id] = counts[group_id]
                    .checked_add(1)
                    .ok_or_else(|| ExecError::internal("join group row count overflow"))?;
                row = self.next_row(row)?;
            }
        }

        let mut offsets = Vec::with_capacity(group_count + 1);
        offsets.push(0u32);
        let mut total = 0u32;
        for count in &counts {
            total = total
                .checked_add(*count)
                .ok_or_else(|| ExecError::internal("join group rows overflow"))?;
            offsets.push(total);
        }

        let mut rows = vec![0u32; total as usize];
        let mut write_pos: Vec<u32> = offsets[..group_count].to_vec();
        for group_id in 0..group_count {
            let mut row = self.group_head[group_id];
            while row != ROW_NONE {
                let slot = write_pos[group_id] as usize;
                if slot >= rows.len() {
                    return Err(ExecError::internal("join group row index out of bounds"));
                }
                rows[slot] = row;
                write_pos[group_id] += 1;
                row = self.next_row(row)?;
            }
        }

        self.group_offsets = Some(offsets);
        self.group_rows = Some(rows);
        Ok(())
    }

    fn next_row(&self, row_id: u32) -> ExecResult<u32> {
        self.row_next
            .get(row_id as usize)
            .copied()
            .ok_or_else(|| ExecError::internal("join row id out of bounds"))
    }

    /// Container row ids chained under one group.
    pub(crate) fn group_rows_slice(&self, group_id: usize) -> ExecResult<&[u32]> {
        let offsets = self
            .group_offsets
            .as_ref()
            .ok_or_else(|| ExecError::internal("join table is not finalized"))?;
        let rows = self
            .group_rows
            .as_ref()
            .ok_or_else(|| ExecError::internal("join table is not finalized"))?;
        if group_id + 1 >= offsets.len() {
            return Err(ExecError::internal("join group id out of bounds"));
        }
        let start = offsets[group_id] as usize;
        let end = offsets[group_id + 1] as usize;
        Ok(&rows[start..end])
    }

    /// Group ids for one probe batch; null-key rows produce None.
    pub(crate) fn lookup_batch(
        &self,
        views: &[KeyArrayView<'_>],
        hashes: &[u64],
        num_rows: usize,
    ) -> ExecResult<Vec<Option<usize>>> {
        let mut group_ids = vec![None; num_rows];
        let mut scratch = Vec::new();
        for row in 0..num_rows {
            if row_has_null_key(views, row) {
                continue;
            }
            group_ids[row] = self.index.lookup(views, row, hashes[row], &mut scratch)?;
        }
        Ok(group_ids)
    }

    /// Per-row hashes for probe keys, using this table's seed.
    pub(crate) fn probe_hashes(&self, views: &[KeyArrayView<'_>], num_rows: usize) -> Vec<u64> {
        build_key_hashes(views, num_rows, self.hash_seed)
    }

    fn refresh_accounting(&mut self) {
        let Some(tracker) = self.mem_tracker.as_ref() else {
            return;
        };
        let bytes = self.tracked_bytes();
        let delta = bytes - self.accounted_bytes;
        if delta > 0 {
            tracker.consume(delta);
        } else if delta < 0 {
            tracker.release(-delta);
        }
        self.accounted_bytes = bytes;
    }

    fn tracked_bytes(&self) -> i64 {
        fn vec_bytes<T>(v: &Vec<T>) -> i64 {
            let bytes = v.capacity().saturating_mul(std::mem::size_of::<T>());
            i64::try_from(bytes).unwrap_or(i64::MAX)
        }
        fn opt_vec_bytes<T>(v: &Option<Vec<T>>) -> i64 {
            v.as_ref().map(vec_bytes).unwrap_or(0)
        }

        vec_bytes(&self.group_head)
            .saturating_add(vec_bytes(&self.row_next))
            .saturating_add(opt_vec_bytes(&self.group_offsets))
            .saturating_add(opt_vec_bytes(&self.group_rows))
            .saturating_add(self.index.tracked_bytes())
    }
}

impl Drop for JoinHashTable {
    fn drop(&mut self) {
        if let Some(tracker) = self.mem_tracker.as_ref() {
            tracker.release(self.accounted_bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ids::SlotId;
    use crate::exec::chunk::{Chunk, field_with_slot_id};
    use arrow::array::{ArrayRef, Int64Array, StringArray};
    use arrow::datatypes::{Field, Schema, SchemaRef};
    use arrow::record_batch::RecordBatch;

    const SEED: u64 = 42;

    fn int_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![field_with_slot_id(
            Field::new("k", DataType::Int64, true),
            SlotId::new(1),
        )]))
    }

    fn container_of(batches: Vec<Vec<Option<i64>>>) -> RowContainer {
        let mut container = RowContainer::new(int_schema(), vec![0]);
        for values in batches {
            let array: ArrayRef = Arc::new(Int64Array::from(values.clone()));
            let views = build_key_views(std::slice::from_ref(&array)).unwrap();
            let hashes = build_key_hashes(&views, values.len(), SEED);
            let nulls: Vec<bool> = (0..values.len())
                .map(|row| row_has_null_key(&views, row))
                .collect();
            let null_count = nulls.iter().filter(|n| **n).count() as u64;
            let batch =
                RecordBatch::try_new(int_schema(), vec![array]).unwrap();
            container
                .append_page(Chunk::new(batch), hashes, nulls, &[null_count])
                .unwrap();
        }
        container
    }

    fn build_table(container: &RowContainer, contributors: usize, min_rows: usize) -> JoinHashTable {
        let mut table = JoinHashTable::prepare(
            container,
            vec![DataType::Int64],
            false,
            SEED,
        )
        .unwrap();
        let state = RuntimeState::default();
        table
            .build(
                container,
                &state,
                ParallelBuildPolicy {
                    min_table_rows: min_rows,
                    contributors,
                },
            )
            .unwrap();
        table
    }

    fn lookup_value(table: &JoinHashTable, value: i64) -> Option<Vec<u32>> {
        let array: ArrayRef = Arc::new(Int64Array::from(vec![value]));
        let views = build_key_views(std::slice::from_ref(&array)).unwrap();
        let hashes = table.probe_hashes(&views, 1);
        let ids = table.lookup_batch(&views, &hashes, 1).unwrap();
        ids[0].map(|g| table.group_rows_slice(g).unwrap().to_vec())
    }

    #[test]
    fn chains_collect_duplicate_keys_across_pages() {
        let container = container_of(vec![
            vec![Some(1), Some(2), Some(1)],
            vec![Some(2), Some(3)],
        ]);
        let table = build_table(&container, 1, 1000);
        assert_eq!(table.group_count(), 3);
        assert_eq!(table.indexed_rows(), 5);

        let rows = lookup_value(&table, 2).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.contains(&1));
        assert!(rows.contains(&3));
        assert!(lookup_value(&table, 9).is_none());
    }

    #[test]
    fn null_keys_stay_out_of_the_table() {
        let container = container_of(vec![vec![Some(1), None, Some(1)]]);
        let table = build_table(&container, 1, 1000);
        assert_eq!(table.group_count(), 1);
        assert_eq!(table.indexed_rows(), 2);
        assert_eq!(table.key_null_count(0), 1);
    }

    #[test]
    fn chain_iteration_is_stable_across_calls() {
        let container = container_of(vec![vec![Some(7); 10]]);
        let table = build_table(&container, 1, 1000);
        let first = lookup_value(&table, 7).unwrap();
        let second = lookup_value(&table, 7).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn parallel_build_matches_serial_contents() {
        // Strings force the hashed mode, which is the parallel-eligible one.
        let schema: SchemaRef = Arc::new(Schema::new(vec![field_with_slot_id(
            Field::new("k", DataType::Utf8, true),
            SlotId::new(1),
        )]));
        let mut container = RowContainer::new(schema.clone(), vec![0]);
        for page in 0..4 {
            let values: Vec<String> =
                (0..64).map(|i| format!("key-{}", (page * 64 + i) % 50)).collect();
            let array: ArrayRef = Arc::new(StringArray::from(
                values.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
            ));
            let views = build_key_views(std::slice::from_ref(&array)).unwrap();
            let hashes = build_key_hashes(&views, values.len(), SEED);
            let batch = RecordBatch::try_new(schema.clone(), vec![array]).unwrap();
            container
                .append_page(Chunk::new(batch), hashes, vec![false; values.len()], &[0])
                .unwrap();
        }

        let state = RuntimeState::default();
        let mut parallel = JoinHashTable::prepare(
            &container,
            vec![DataType::Utf8],
            false,
            SEED,
        )
        .unwrap();
        parallel
            .build(
                &container,
                &state,
                ParallelBuildPolicy {
                    min_table_rows: 1,
                    contributors: 4,
                },
            )
            .unwrap();
        assert!(parallel.built_parallel());

        let mut serial =
            JoinHashTable::prepare(&container, vec![DataType::Utf8], false, SEED).unwrap();
        serial
            .build(
                &container,
                &state,
                ParallelBuildPolicy {
                    min_table_rows: usize::MAX,
                    contributors: 4,
                },
            )
            .unwrap();
        assert!(!serial.built_parallel());

        assert_eq!(parallel.group_count(), serial.group_count());
        assert_eq!(parallel.indexed_rows(), serial.indexed_rows());

        // Every key chains the same row set under both builds.
        let array: ArrayRef = Arc::new(StringArray::from(
            (0..50).map(|i| format!("key-{i}")).collect::<Vec<_>>(),
        ));
        let views = build_key_views(std::slice::from_ref(&array)).unwrap();
        let hashes = parallel.probe_hashes(&views, 50);
        let par_ids = parallel.lookup_batch(&views, &hashes, 50).unwrap();
        let ser_hashes = serial.probe_hashes(&views, 50);
        let ser_ids = serial.lookup_batch(&views, &ser_hashes, 50).unwrap();
        for row in 0..50 {
            let mut par_rows = parallel
                .group_rows_slice(par_ids[row].unwrap())
                .unwrap()
                .to_vec();
            let mut ser_rows = serial
                .group_rows_slice(ser_ids[row].unwrap())
                .unwrap()
                .to_vec();
            par_rows.sort_unstable();
            ser_rows.sort_unstable();
            assert_eq!(par_rows, ser_rows);
        }
    }

    #[test]
    fn cancelled_state_aborts_build() {
        let container = container_of(vec![vec![Some(1)]]);
        let mut table =
            JoinHashTable::prepare(&container, vec![DataType::Int64], false, SEED).unwrap();
        let state = RuntimeState::default();
        state.cancel();
        let err = table
            .build(
                &container,
                &state,
                ParallelBuildPolicy {
                    min_table_rows: 1000,
                    contributors: 1,
                },
            )
            .unwrap_err();
        assert_eq!(err.kind(), crate::common::error::ErrorKind::Aborted);
    }
}
