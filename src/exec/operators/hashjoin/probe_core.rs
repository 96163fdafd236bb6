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
//! Core probe engine: key lookup, match expansion and per-variant row assembly.
//!
//! Responsibilities:
//! - Implements the per-batch probe loop for every join variant, including the
//!   three-valued `match` column of the null-aware projections and the
//!   null-aware anti short-circuits.
//! - A residual filter is evaluated over assembled (probe, build) pairs; a null
//!   filter result counts as false.
//!
//! The core is loaded with one build artifact at a time; recursive spill replay
//! loads it again with the smaller per-partition table.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, BooleanArray, UInt32Array, new_null_array};
use arrow::compute::take;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;

use crate::common::error::{ExecError, ExecResult};
use crate::exec::chunk::Chunk;
use crate::exec::expr::{ExprArena, ExprId};
use crate::exec::hash_table::key_builder::{build_key_views, row_has_null_key};
use crate::exec::node::join::{JoinSpec, JoinType, OutputColumn};
use crate::exec::operators::hashjoin::join_hash_table::JoinHashTable;
use crate::exec::operators::hashjoin::row_container::RowContainer;

const MAX_EVAL_PAIRS: usize = 16 * 1024;

pub(crate) struct ProbeCore {
    spec: Arc<JoinSpec>,
    arena: Arc<ExprArena>,
    output_schema: SchemaRef,
    join_scope_schema: SchemaRef,
    container: Option<Arc<RowContainer>>,
    table: Option<Arc<JoinHashTable>>,
    /// Per container row: whether some probe row matched it (residual included).
    build_matched: Vec<bool>,
    total_build_rows: usize,
    build_has_null_key: bool,
    probe_rows_seen: u64,
    probe_saw_null_key: bool,
    /// Null-aware anti poisoning: once set, the join output is empty.
    null_aware_empty: bool,
    output_rows: u64,
    lookup_hit_rows: u64,
    lookup_miss_rows: u64,
}

impl ProbeCore {
    pub(crate) fn new(spec: Arc<JoinSpec>, arena: Arc<ExprArena>) -> ExecResult<Self> {
        let output_schema = spec.output_schema()?;
        let join_scope_schema = spec.join_scope_schema();
        Ok(Self {
            spec,
            arena,
            output_schema,
            join_scope_schema,
            container: None,
            table: None,
            build_matched: Vec::new(),
            total_build_rows: 0,
            build_has_null_key: false,
            probe_rows_seen: 0,
            probe_saw_null_key: false,
            null_aware_empty: false,
            output_rows: 0,
            lookup_hit_rows: 0,
            lookup_miss_rows: 0,
        })
    }

    pub(crate) fn is_loaded(&self) -> bool {
        self.container.is_some()
    }

    pub(crate) fn output_schema(&self) -> SchemaRef {
        self.output_schema.clone()
    }

    pub(crate) fn output_rows(&self) -> u64 {
        self.output_rows
    }

    pub(crate) fn lookup_hit_rows(&self) -> u64 {
        self.lookup_hit_rows
    }

    pub(crate) fn lookup_miss_rows(&self) -> u64 {
        self.lookup_miss_rows
    }

    pub(crate) fn table(&self) -> Option<&Arc<JoinHashTable>> {
        self.table.as_ref()
    }

    pub(crate) fn container(&self) -> Option<&Arc<RowContainer>> {
        self.container.as_ref()
    }

    /// Load one build result. `total_build_rows` and `build_has_null_key` are
    /// global across all partitions, spilled ones included; the null-aware
    /// short-circuits must see the whole build side, not one partition.
    pub(crate) fn load(
        &mut self,
        container: Arc<RowContainer>,
        table: Option<Arc<JoinHashTable>>,
        total_build_rows: usize,
        build_has_null_key: bool,
    ) {
        self.build_matched = if self.spec.join_type.tracks_build_matches() {
            vec![false; container.row_count()]
        } else {
            Vec::new()
        };
        self.container = Some(container);
        self.table = table;
        self.total_build_rows = total_build_rows;
        self.build_has_null_key = build_has_null_key;
    }

    /// Unload the current partition; cross-partition flags stay.
    pub(crate) fn unload(&mut self) {
        self.container = None;
        self.table = None;
        self.build_matched = Vec::new();
    }

    /// Local build-matched flags for the loaded partition, for cross-driver
    /// merging at the bridge.
    pub(crate) fn take_build_matched(&mut self) -> Vec<bool> {
        std::mem::take(&mut self.build_matched)
    }

    /// Install merged flags before build-side emission.
    pub(crate) fn set_build_matched(&mut self, matched: Vec<bool>) {
        self.build_matched = matched;
    }

    pub(crate) fn probe_saw_null_key(&self) -> bool {
        self.probe_saw_null_key
    }

    pub(crate) fn probe_rows_seen(&self) -> u64 {
        self.probe_rows_seen
    }

    /// Install merged probe totals (all drivers) before build-side emission.
    pub(crate) fn set_probe_totals(&mut self, probe_rows: u64, saw_null_key: bool) {
        self.probe_rows_seen = probe_rows;
        self.probe_saw_null_key = saw_null_key;
    }

    /// Probe one chunk and return zero or more output batches.
    pub(crate) fn probe_chunk(&mut self, chunk: &Chunk) -> ExecResult<Vec<RecordBatch>> {
        if chunk.is_empty() {
            return Ok(Vec::new());
        }
        let container = Arc::clone(
            self.container
                .as_ref()
                .ok_or_else(|| ExecError::internal("probe core has no build side loaded"))?,
        );
        self.probe_rows_seen += chunk.len() as u64;

        let num_rows = chunk.len();
        let key_arrays: Vec<ArrayRef> = self
            .spec
            .probe_keys
            .iter()
            .map(|idx| chunk.column(*idx))
            .collect::<ExecResult<_>>()?;
        let views = build_key_views(&key_arrays)?;
        let null_keys: Vec<bool> = (0..num_rows)
            .map(|row| row_has_null_key(&views, row))
            .collect();
        if null_keys.iter().any(|n| *n) {
            self.probe_saw_null_key = true;
        }

        // Null-aware anti: a build-side null key, or any probe-side null key,
        // empties the whole join. Detected as early as the data allows.
        if self.spec.join_type == JoinType::Anti
            && self.spec.null_aware
            && self.spec.residual.is_none()
            && self.total_build_rows > 0
            && (self.build_has_null_key || self.probe_saw_null_key)
        {
            self.null_aware_empty = true;
        }
        if self.null_aware_empty {
            return Ok(Vec::new());
        }

        let group_ids = match self.table.as_ref() {
            Some(table) if !table.is_empty() => {
                let hashes = table.probe_hashes(&views, num_rows);
                table.lookup_batch(&views, &hashes, num_rows)?
            }
            _ => vec![None; num_rows],
        };
        for group in &group_ids {
            if group.is_some() {
                self.lookup_hit_rows += 1;
            } else {
                self.lookup_miss_rows += 1;
            }
        }

        // Expand matched (probe row, build row) pairs over the chains.
        let mut pair_probe: Vec<u32> = Vec::new();
        let mut pair_build: Vec<u32> = Vec::new();
        if let Some(table) = self.table.as_ref() {
            for (row, group) in group_ids.iter().enumerate() {
                let Some(group) = group else {
                    continue;
                };
                for &build_row in table.group_rows_slice(*group)? {
                    pair_probe.push(row as u32);
                    pair_build.push(build_row);
                }
            }
        }

        let pair_pass = match self.spec.residual {
            Some(pred) => {
                self.eval_residual_pairs(chunk, &container, &pair_probe, &pair_build, pred)?
            }
            None => vec![true; pair_probe.len()],
        };

        let mut probe_matched = vec![false; num_rows];
        for (idx, pass) in pair_pass.iter().enumerate() {
            if !pass {
                continue;
            }
            probe_matched[pair_probe[idx] as usize] = true;
            if !self.build_matched.is_empty() {
                let slot = pair_build[idx] as usize;
                if slot < self.build_matched.len() {
                    self.build_matched[slot] = true;
                }
            }
        }

        let batches = match self.spec.join_type {
            JoinType::Inner | JoinType::Right => {
                self.emit_pairs(chunk, &container, &pair_probe, &pair_build, &pair_pass)?
            }
            JoinType::Left | JoinType::Full => {
                let mut batches =
                    self.emit_pairs(chunk, &container, &pair_probe, &pair_build, &pair_pass)?;
                let unmatched: Vec<u32> = (0..num_rows)
                    .filter(|row| !probe_matched[*row])
                    .map(|row| row as u32)
                    .collect();
                if let Some(batch) = self.emit_probe_null_extended(chunk, &unmatched)? {
                    batches.push(batch);
                }
                batches
            }
            JoinType::LeftSemiFilter => {
                let kept: Vec<u32> = (0..num_rows)
                    .filter(|row| probe_matched[*row])
                    .map(|row| row as u32)
                    .collect();
                self.emit_probe_only(chunk, &kept)?
            }
            JoinType::Anti => self.emit_anti(chunk, &container, &null_keys, &probe_matched)?,
            JoinType::LeftSemiProject => {
                self.emit_left_semi_project(chunk, &container, &null_keys, &probe_matched)?
            }
            // Build-side emission happens at finish for these.
            JoinType::RightSemiFilter | JoinType::RightSemiProject => Vec::new(),
        };

        let produced: usize = batches.iter().map(|b| b.num_rows()).sum();
        self.output_rows += produced as u64;
        Ok(batches)
    }

    /// Emit the build-side output owed after all probe input for the loaded
    /// partition was consumed: unmatched build rows for Right/Full, matched
    /// build rows for RightSemiFilter, every build row plus the `match` column
    /// for RightSemiProject.
    pub(crate) fn finish(&mut self) -> ExecResult<Vec<RecordBatch>> {
        let Some(container) = self.container.as_ref().map(Arc::clone) else {
            return Ok(Vec::new());
        };
        let batches = match self.spec.join_type {
            JoinType::Right | JoinType::Full => {
                let unmatched: Vec<u32> = (0..container.row_count() as u32)
                    .filter(|flat| !self.build_matched[*flat as usize])
                    .collect();
                match self.emit_build_null_extended(&container, &unmatched)? {
                    Some(batch) => vec![batch],
                    None => Vec::new(),
                }
            }
            JoinType::RightSemiFilter => {
                let matched: Vec<u32> = (0..container.row_count() as u32)
                    .filter(|flat| self.build_matched[*flat as usize])
                    .collect();
                match self.emit_build_only(&container, &matched, None)? {
                    Some(batch) => vec![batch],
                    None => Vec::new(),
                }
            }
            JoinType::RightSemiProject => {
                let all: Vec<u32> = (0..container.row_count() as u32).collect();
                let match_col = self.right_semi_project_match(&container)?;
                match self.emit_build_only(&container, &all, Some(match_col))? {
                    Some(batch) => vec![batch],
                    None => Vec::new(),
                }
            }
            _ => Vec::new(),
        };
        let produced: usize = batches.iter().map(|b| b.num_rows()).sum();
        self.output_rows += produced as u64;
        Ok(batches)
    }

    fn right_semi_project_match(
        &self,
        container: &RowContainer,
    ) -> ExecResult<Vec<Option<bool>>> {
        let mut match_col = Vec::with_capacity(container.row_count());
        let probe_empty = self.probe_rows_seen == 0;
        for (page_idx, page) in container.pages().iter().enumerate() {
            for row in 0..page.chunk.len() {
                let flat = container.flat_id(page_idx, row) as usize;
                let matched = self.build_matched.get(flat).copied().unwrap_or(false);
                let value = if matched {
                    Some(true)
                } else if !self.spec.null_aware || probe_empty {
                    // `x IN (empty)` is false even for null x.
                    Some(false)
                } else if page.null_keys[row] || self.probe_saw_null_key {
                    None
                } else {
                    Some(false)
                };
                match_col.push(value);
            }
        }
        Ok(match_col)
    }

    fn emit_anti(
        &mut self,
        chunk: &Chunk,
        container: &Arc<RowContainer>,
        null_keys: &[bool],
        probe_matched: &[bool],
    ) -> ExecResult<Vec<RecordBatch>> {
        let num_rows = chunk.len();
        if !self.spec.null_aware {
            // Null-key probe rows are unmatched and emitted.
            let kept: Vec<u32> = (0..num_rows)
                .filter(|row| !probe_matched[*row])
                .map(|row| row as u32)
                .collect();
            return self.emit_probe_only(chunk, &kept);
        }

        if self.total_build_rows == 0 {
            // `x NOT IN (empty)` holds for every row.
            let all: Vec<u32> = (0..num_rows as u32).collect();
            return self.emit_probe_only(chunk, &all);
        }

        match self.spec.residual {
            None => {
                // The eager empty checks ran in probe_chunk; reaching here means
                // neither side produced a null key so far.
                let kept: Vec<u32> = (0..num_rows)
                    .filter(|row| !null_keys[*row] && !probe_matched[*row])
                    .map(|row| row as u32)
                    .collect();
                self.emit_probe_only(chunk, &kept)
            }
            Some(pred) => {
                // With a residual, a row survives only when no build row can
                // satisfy it: equality matches, build null-key rows, and (for
                // null-key probe rows) the entire build side are all consulted.
                let matched_null_key = self.probe_matches_rows(
                    chunk,
                    container,
                    &build_null_key_rows(container),
                    pred,
                    None,
                )?;
                let matched_any = if null_keys.iter().any(|n| *n) {
                    self.probe_matches_rows(
                        chunk,
                        container,
                        &all_build_rows(container),
                        pred,
                        Some(null_keys),
                    )?
                } else {
                    vec![false; num_rows]
                };
                let kept: Vec<u32> = (0..num_rows)
                    .filter(|row| {
                        if null_keys[*row] {
                            !matched_any[*row]
                        } else {
                            !(probe_matched[*row] || matched_null_key[*row])
                        }
                    })
                    .map(|row| row as u32)
                    .collect();
                self.emit_probe_only(chunk, &kept)
            }
        }
    }

    fn emit_left_semi_project(
        &mut self,
        chunk: &Chunk,
        container: &Arc<RowContainer>,
        null_keys: &[bool],
        probe_matched: &[bool],
    ) -> ExecResult<Vec<RecordBatch>> {
        let num_rows = chunk.len();
        let matched_null_key = if self.spec.null_aware && self.build_has_null_key {
            match self.spec.residual {
                Some(pred) => self.probe_matches_rows(
                    chunk,
                    container,
                    &build_null_key_rows(container),
                    pred,
                    None,
                )?,
                // Without a residual, a build-side null makes every non-match unknown.
                None => vec![true; num_rows],
            }
        } else {
            vec![false; num_rows]
        };

        let mut match_col = Vec::with_capacity(num_rows);
        for row in 0..num_rows {
            let value = if probe_matched[row] {
                Some(true)
            } else if !self.spec.null_aware {
                Some(false)
            } else if self.total_build_rows == 0 {
                Some(false)
            } else if null_keys[row] || matched_null_key[row] {
                None
            } else {
                Some(false)
            };
            match_col.push(value);
        }

        let all: Vec<u32> = (0..num_rows as u32).collect();
        match self.assemble(Some((chunk, &all)), None, num_rows, Some(match_col))? {
            Some(batch) => Ok(vec![batch]),
            None => Ok(Vec::new()),
        }
    }

    /// Whether each probe row satisfies the residual against any of the given
    /// build rows. `probe_filter` restricts which probe rows are considered.
    fn probe_matches_rows(
        &self,
        chunk: &Chunk,
        container: &Arc<RowContainer>,
        build_rows: &[u32],
        pred: ExprId,
        probe_filter: Option<&[bool]>,
    ) -> ExecResult<Vec<bool>> {
        let num_rows = chunk.len();
        let mut matched = vec![false; num_rows];
        if build_rows.is_empty() {
            return Ok(matched);
        }
        let probe_rows: Vec<u32> = (0..num_rows)
            .filter(|row| probe_filter.map(|f| f[*row]).unwrap_or(true))
            .map(|row| row as u32)
            .collect();
        if probe_rows.is_empty() {
            return Ok(matched);
        }

        let mut left = Vec::new();
        let mut right = Vec::new();
        for &probe_row in &probe_rows {
            if matched[probe_row as usize] {
                continue;
            }
            for &build_row in build_rows {
                left.push(probe_row);
                right.push(build_row);
                if left.len() == MAX_EVAL_PAIRS {
                    self.apply_residual_batch(chunk, container, &left, &right, pred, &mut matched)?;
                    left.clear();
                    right.clear();
                }
            }
        }
        if !left.is_empty() {
            self.apply_residual_batch(chunk, container, &left, &right, pred, &mut matched)?;
        }
        Ok(matched)
    }

    fn apply_residual_batch(
        &self,
        chunk: &Chunk,
        container: &Arc<RowContainer>,
        pair_probe: &[u32],
        pair_build: &[u32],
        pred: ExprId,
        matched: &mut [bool],
    ) -> ExecResult<()> {
        let mask = self.residual_mask(chunk, container, pair_probe, pair_build, pred)?;
        for idx in 0..mask.len() {
            if mask.is_valid(idx) && mask.value(idx) {
                let probe_row = pair_probe[idx] as usize;
                if probe_row < matched.len() {
                    matched[probe_row] = true;
                }
            }
        }
        Ok(())
    }

    fn eval_residual_pairs(
        &self,
        chunk: &Chunk,
        container: &Arc<RowContainer>,
        pair_probe: &[u32],
        pair_build: &[u32],
        pred: ExprId,
    ) -> ExecResult<Vec<bool>> {
        let mut pass = vec![false; pair_probe.len()];
        let mut offset = 0usize;
        while offset < pair_probe.len() {
            let end = (offset + MAX_EVAL_PAIRS).min(pair_probe.len());
            let mask = self.residual_mask(
                chunk,
                container,
                &pair_probe[offset..end],
                &pair_build[offset..end],
                pred,
            )?;
            for idx in 0..mask.len() {
                // Three-valued logic: a null residual result is not a match.
                pass[offset + idx] = mask.is_valid(idx) && mask.value(idx);
            }
            offset = end;
        }
        Ok(pass)
    }

    /// Evaluate the residual over assembled join-scope pairs.
    fn residual_mask(
        &self,
        chunk: &Chunk,
        container: &Arc<RowContainer>,
        pair_probe: &[u32],
        pair_build: &[u32],
        pred: ExprId,
    ) -> ExecResult<BooleanArray> {
        let probe_indices = UInt32Array::from(pair_probe.to_vec());
        let mut columns =
            Vec::with_capacity(self.join_scope_schema.fields().len());
        for col in chunk.columns() {
            let taken = take(col.as_ref(), &probe_indices, None)
                .map_err(|e| ExecError::internal(format!("residual probe take failed: {e}")))?;
            columns.push(taken);
        }
        for col_idx in 0..container.schema().fields().len() {
            columns.push(container.gather_column(col_idx, pair_build)?);
        }
        let batch = RecordBatch::try_new(self.join_scope_schema.clone(), columns)
            .map_err(|e| ExecError::internal(format!("residual scope assembly failed: {e}")))?;
        let scope_chunk = Chunk::try_new(batch)?;
        let mask = self.arena.eval(pred, &scope_chunk)?;
        mask.as_any()
            .downcast_ref::<BooleanArray>()
            .cloned()
            .ok_or_else(|| {
                ExecError::internal("join residual predicate must return a boolean array")
            })
    }

    fn emit_pairs(
        &self,
        chunk: &Chunk,
        container: &Arc<RowContainer>,
        pair_probe: &[u32],
        pair_build: &[u32],
        pair_pass: &[bool],
    ) -> ExecResult<Vec<RecordBatch>> {
        let kept_probe: Vec<u32> = pair_probe
            .iter()
            .zip(pair_pass)
            .filter(|(_, pass)| **pass)
            .map(|(row, _)| *row)
            .collect();
        if kept_probe.is_empty() {
            return Ok(Vec::new());
        }
        let kept_build: Vec<u32> = pair_build
            .iter()
            .zip(pair_pass)
            .filter(|(_, pass)| **pass)
            .map(|(row, _)| *row)
            .collect();
        match self.assemble(
            Some((chunk, &kept_probe)),
            Some((container, &kept_build)),
            kept_probe.len(),
            None,
        )? {
            Some(batch) => Ok(vec![batch]),
            None => Ok(Vec::new()),
        }
    }

    fn emit_probe_only(&self, chunk: &Chunk, rows: &[u32]) -> ExecResult<Vec<RecordBatch>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        match self.assemble(Some((chunk, rows)), None, rows.len(), None)? {
            Some(batch) => Ok(vec![batch]),
            None => Ok(Vec::new()),
        }
    }

    fn emit_probe_null_extended(
        &self,
        chunk: &Chunk,
        rows: &[u32],
    ) -> ExecResult<Option<RecordBatch>> {
        if rows.is_empty() {
            return Ok(None);
        }
        self.assemble(Some((chunk, rows)), None, rows.len(), None)
    }

    fn emit_build_null_extended(
        &self,
        container: &Arc<RowContainer>,
        rows: &[u32],
    ) -> ExecResult<Option<RecordBatch>> {
        if rows.is_empty() {
            return Ok(None);
        }
        self.assemble(None, Some((container, rows)), rows.len(), None)
    }

    fn emit_build_only(
        &self,
        container: &Arc<RowContainer>,
        rows: &[u32],
        match_col: Option<Vec<Option<bool>>>,
    ) -> ExecResult<Option<RecordBatch>> {
        if rows.is_empty() {
            return Ok(None);
        }
        self.assemble(None, Some((container, rows)), rows.len(), match_col)
    }

    /// Assemble one output batch per the output layout. Absent sides fill with
    /// nulls (the null-extended half of outer joins).
    fn assemble(
        &self,
        probe: Option<(&Chunk, &[u32])>,
        build: Option<(&Arc<RowContainer>, &[u32])>,
        len: usize,
        match_col: Option<Vec<Option<bool>>>,
    ) -> ExecResult<Option<RecordBatch>> {
        if len == 0 {
            return Ok(None);
        }
        let probe_indices = probe.map(|(_, rows)| UInt32Array::from(rows.to_vec()));
        let mut columns = Vec::with_capacity(self.output_schema.fields().len());
        for output in &self.spec.output_layout {
            let column = match output {
                OutputColumn::Probe(idx) => match (probe, probe_indices.as_ref()) {
                    (Some((chunk, _)), Some(indices)) => {
                        take(chunk.column(*idx)?.as_ref(), indices, None).map_err(|e| {
                            ExecError::internal(format!("output probe take failed: {e}"))
                        })?
                    }
                    _ => new_null_array(
                        self.spec.probe_schema.field(*idx).data_type(),
                        len,
                    ),
                },
                OutputColumn::Build(idx) => match build {
                    Some((container, rows)) => container.gather_column(*idx, rows)?,
                    None => new_null_array(
                        self.spec.build_schema.field(*idx).data_type(),
                        len,
                    ),
                },
            };
            columns.push(column);
        }
        if self.spec.join_type.has_match_column() {
            let values = match_col.ok_or_else(|| {
                ExecError::internal("semi project output requires a match column")
            })?;
            if values.len() != len {
                return Err(ExecError::internal("match column length mismatch"));
            }
            columns.push(Arc::new(BooleanArray::from(values)) as ArrayRef);
        }
        let batch = RecordBatch::try_new(self.output_schema.clone(), columns)
            .map_err(|e| ExecError::internal(format!("join output assembly failed: {e}")))?;
        Ok(Some(batch))
    }
}

fn build_null_key_rows(container: &RowContainer) -> Vec<u32> {
    let mut rows = Vec::new();
    for (page_idx, page) in container.pages().iter().enumerate() {
        for row in 0..page.chunk.len() {
            if page.null_keys[row] {
                rows.push(container.flat_id(page_idx, row));
            }
        }
    }
    rows
}

fn all_build_rows(container: &RowContainer) -> Vec<u32> {
    (0..container.row_count() as u32).collect()
}
