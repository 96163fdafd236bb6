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
//! Append-only store of build rows.
//!
//! Rows live in immutable chunk pages; a flat `u32` row id addresses a row
//! through cumulative page offsets and stays valid across hash-table rehash.
//! Bulk erase (used only after spill, never during probe) compacts pages and
//! renumbers rows. Each row carries its precomputed key hash and null-key flag
//! so spill partitioning and table build never re-evaluate keys.

use std::collections::HashSet;
use std::sync::Arc;

use arrow::array::{ArrayRef, UInt32Array};
use arrow::compute::{interleave, take_record_batch};
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;

use crate::common::error::{ExecError, ExecResult};
use crate::exec::chunk::Chunk;
use crate::exec::spill::SpillConfig;
use crate::exec::spill::spiller::partition_index_at;
use crate::runtime::mem_tracker::MemTracker;

pub(crate) const ROW_NONE: u32 = u32::MAX;

#[derive(Debug)]
pub(crate) struct Page {
    pub(crate) chunk: Chunk,
    pub(crate) hashes: Vec<u64>,
    /// Per-row flag: some key column is null. Such rows never enter the table.
    pub(crate) null_keys: Vec<bool>,
}

#[derive(Debug)]
pub(crate) struct RowContainer {
    schema: SchemaRef,
    key_columns: Vec<usize>,
    pages: Vec<Page>,
    /// Cumulative first flat row id of each page; one trailing total entry.
    page_offsets: Vec<u32>,
    null_key_counts: Vec<u64>,
    null_key_rows: u64,
    mem_tracker: Option<Arc<MemTracker>>,
    reserved_spill_bytes: i64,
}

impl RowContainer {
    pub(crate) fn new(schema: SchemaRef, key_columns: Vec<usize>) -> Self {
        let key_count = key_columns.len();
        Self {
            schema,
            key_columns,
            pages: Vec::new(),
            page_offsets: vec![0],
            null_key_counts: vec![0; key_count],
            null_key_rows: 0,
            mem_tracker: None,
            reserved_spill_bytes: 0,
        }
    }

    pub(crate) fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    pub(crate) fn key_columns(&self) -> &[usize] {
        &self.key_columns
    }

    pub(crate) fn row_count(&self) -> usize {
        *self.page_offsets.last().unwrap_or(&0) as usize
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.row_count() == 0
    }

    pub(crate) fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub(crate) fn pages(&self) -> &[Page] {
        &self.pages
    }

    pub(crate) fn null_key_counts(&self) -> &[u64] {
        &self.null_key_counts
    }

    pub(crate) fn null_key_rows(&self) -> u64 {
        self.null_key_rows
    }

    pub(crate) fn has_null_key(&self) -> bool {
        self.null_key_rows > 0
    }

    pub(crate) fn set_mem_tracker(&mut self, tracker: Arc<MemTracker>) {
        for page in self.pages.iter_mut() {
            page.chunk.transfer_to(&tracker);
        }
        self.mem_tracker = Some(tracker);
    }

    /// Pre-reserve bytes so the spill path never fails on its own allocations.
    pub(crate) fn reserve_spillable(&mut self, bytes: i64) {
        if let Some(tracker) = self.mem_tracker.as_ref() {
            tracker.reserve(bytes);
        }
        self.reserved_spill_bytes = self.reserved_spill_bytes.saturating_add(bytes.max(0));
    }

    /// Append one chunk of build rows with precomputed per-row key hashes and
    /// null-key flags, plus per-key-column null counts.
    pub(crate) fn append_page(
        &mut self,
        mut chunk: Chunk,
        hashes: Vec<u64>,
        null_keys: Vec<bool>,
        column_null_counts: &[u64],
    ) -> ExecResult<u32> {
        if chunk.is_empty() {
            return Err(ExecError::internal("row container page must not be empty"));
        }
        if hashes.len() != chunk.len() || null_keys.len() != chunk.len() {
            return Err(ExecError::internal(format!(
                "row container page metadata length mismatch: rows={} hashes={} nulls={}",
                chunk.len(),
                hashes.len(),
                null_keys.len()
            )));
        }
        if column_null_counts.len() != self.null_key_counts.len() {
            return Err(ExecError::internal(
                "row container key column null count arity mismatch",
            ));
        }
        let total = self
            .row_count()
            .checked_add(chunk.len())
            .filter(|total| *total <= ROW_NONE as usize)
            .ok_or_else(|| ExecError::internal("row container row count overflow"))?;

        if let Some(tracker) = self.mem_tracker.as_ref() {
            chunk.transfer_to(tracker);
        }
        for (count, add) in self.null_key_counts.iter_mut().zip(column_null_counts) {
            *count += add;
        }
        self.null_key_rows += null_keys.iter().filter(|n| **n).count() as u64;
        let page_index = self.pages.len() as u32;
        self.pages.push(Page {
            chunk,
            hashes,
            null_keys,
        });
        self.page_offsets.push(total as u32);
        Ok(page_index)
    }

    /// Absorb all pages of another container (the leader collecting peers).
    pub(crate) fn merge(&mut self, other: RowContainer) -> ExecResult<()> {
        for page in other.pages.into_iter() {
            let total = self
                .row_count()
                .checked_add(page.chunk.len())
                .filter(|total| *total <= ROW_NONE as usize)
                .ok_or_else(|| ExecError::internal("row container row count overflow"))?;
            self.pages.push(page);
            self.page_offsets.push(total as u32);
        }
        for (count, add) in self
            .null_key_counts
            .iter_mut()
            .zip(other.null_key_counts.iter())
        {
            *count += add;
        }
        self.null_key_rows += other.null_key_rows;
        if let Some(tracker) = self.mem_tracker.clone() {
            for page in self.pages.iter_mut() {
                page.chunk.transfer_to(&tracker);
            }
        }
        Ok(())
    }

    pub(crate) fn location(&self, flat: u32) -> ExecResult<(usize, usize)> {
        let page = match self.page_offsets.binary_search(&flat) {
            Ok(exact) => {
                // `exact` may address a trailing empty boundary; the row lives in
                // the page starting at this offset.
                exact
            }
            Err(insert) => insert - 1,
        };
        if page >= self.pages.len() {
            return Err(ExecError::internal(format!(
                "row id {flat} out of bounds (rows={})",
                self.row_count()
            )));
        }
        let row = (flat - self.page_offsets[page]) as usize;
        if row >= self.pages[page].chunk.len() {
            return Err(ExecError::internal(format!(
                "row id {flat} out of bounds (rows={})",
                self.row_count()
            )));
        }
        Ok((page, row))
    }

    pub(crate) fn flat_id(&self, page: usize, row: usize) -> u32 {
        self.page_offsets[page] + row as u32
    }

    pub(crate) fn key_arrays(&self, page: usize) -> ExecResult<Vec<ArrayRef>> {
        let chunk = &self.pages[page].chunk;
        self.key_columns
            .iter()
            .map(|idx| chunk.column(*idx))
            .collect()
    }

    /// Gather one column across pages in the order of `flat_ids`; unmatched
    /// output paths pass the build column index directly.
    pub(crate) fn gather_column(&self, column: usize, flat_ids: &[u32]) -> ExecResult<ArrayRef> {
        let arrays: Vec<ArrayRef> = self
            .pages
            .iter()
            .map(|p| p.chunk.column(column))
            .collect::<ExecResult<_>>()?;
        let array_refs: Vec<&dyn arrow::array::Array> =
            arrays.iter().map(|a| a.as_ref()).collect();
        let mut indices = Vec::with_capacity(flat_ids.len());
        for flat in flat_ids {
            let (page, row) = self.location(*flat)?;
            indices.push((page, row));
        }
        interleave(&array_refs, &indices)
            .map_err(|e| ExecError::internal(format!("row container gather failed: {e}")))
    }

    /// Row indices per spill partition at `level`, keyed by partition index.
    pub(crate) fn partition_rows(
        &self,
        config: &SpillConfig,
        level: u16,
    ) -> Vec<(u32, Vec<(usize, Vec<u32>)>)> {
        let partition_count = config.partition_count();
        let mut by_partition: Vec<Vec<(usize, Vec<u32>)>> =
            (0..partition_count).map(|_| Vec::new()).collect();
        for (page_idx, page) in self.pages.iter().enumerate() {
            let mut page_lists: Vec<Vec<u32>> =
                (0..partition_count).map(|_| Vec::new()).collect();
            for (row, hash) in page.hashes.iter().enumerate() {
                let partition = partition_index_at(config, level, *hash);
                page_lists[partition as usize].push(row as u32);
            }
            for (partition, rows) in page_lists.into_iter().enumerate() {
                if !rows.is_empty() {
                    by_partition[partition].push((page_idx, rows));
                }
            }
        }
        by_partition
            .into_iter()
            .enumerate()
            .filter(|(_, pages)| !pages.is_empty())
            .map(|(partition, pages)| (partition as u32, pages))
            .collect()
    }

    /// Extract the rows of one partition as record batches (page granularity).
    pub(crate) fn extract_partition_batches(
        &self,
        pages_rows: &[(usize, Vec<u32>)],
    ) -> ExecResult<Vec<RecordBatch>> {
        let mut batches = Vec::with_capacity(pages_rows.len());
        for (page_idx, rows) in pages_rows {
            let indices = UInt32Array::from(rows.clone());
            let batch = take_record_batch(&self.pages[*page_idx].chunk.batch, &indices)
                .map_err(|e| ExecError::internal(format!("partition extract failed: {e}")))?;
            batches.push(batch);
        }
        Ok(batches)
    }

    /// Remove all rows of the given partitions. Only legal after those
    /// partitions were spilled and before any table is built over this
    /// container: previously handed-out row ids are invalidated.
    pub(crate) fn erase_partitions(
        &mut self,
        config: &SpillConfig,
        level: u16,
        partitions: &HashSet<u32>,
    ) -> ExecResult<u64> {
        if partitions.is_empty() {
            return Ok(0);
        }
        let mut erased = 0u64;
        let old_pages = std::mem::take(&mut self.pages);
        self.page_offsets = vec![0];
        self.null_key_counts = vec![0; self.key_columns.len()];
        self.null_key_rows = 0;

        for page in old_pages {
            let mut keep = Vec::with_capacity(page.chunk.len());
            for (row, hash) in page.hashes.iter().enumerate() {
                let partition = partition_index_at(config, level, *hash);
                if partitions.contains(&partition) {
                    erased += 1;
                } else {
                    keep.push(row as u32);
                }
            }
            if keep.is_empty() {
                continue;
            }
            if keep.len() == page.chunk.len() {
                self.readd_page(page)?;
                continue;
            }
            let hashes = keep.iter().map(|r| page.hashes[*r as usize]).collect();
            let null_keys: Vec<bool> =
                keep.iter().map(|r| page.null_keys[*r as usize]).collect();
            let indices = UInt32Array::from(keep);
            let batch = take_record_batch(&page.chunk.batch, &indices)
                .map_err(|e| ExecError::internal(format!("partition erase failed: {e}")))?;
            let chunk = Chunk::try_new(batch)?;
            self.readd_page(Page {
                chunk,
                hashes,
                null_keys,
            })?;
        }
        Ok(erased)
    }

    fn readd_page(&mut self, mut page: Page) -> ExecResult<()> {
        let total = self
            .row_count()
            .checked_add(page.chunk.len())
            .filter(|total| *total <= ROW_NONE as usize)
            .ok_or_else(|| ExecError::internal("row container row count overflow"))?;
        if let Some(tracker) = self.mem_tracker.as_ref() {
            page.chunk.transfer_to(tracker);
        }
        // Recount nulls from the page flags; the per-column split is recomputed
        // lazily because erase happens before any null-aware consumer runs.
        self.null_key_rows += page.null_keys.iter().filter(|n| **n).count() as u64;
        self.pages.push(page);
        self.page_offsets.push(total as u32);
        Ok(())
    }

    pub(crate) fn estimated_bytes(&self) -> i64 {
        let chunk_bytes: usize = self.pages.iter().map(|p| p.chunk.estimated_bytes()).sum();
        let meta_bytes: usize = self
            .pages
            .iter()
            .map(|p| p.hashes.capacity() * 8 + p.null_keys.capacity())
            .sum();
        i64::try_from(chunk_bytes + meta_bytes).unwrap_or(i64::MAX)
    }

    /// Drop all pages, keeping schema and key layout; used after a full spill.
    pub(crate) fn clear(&mut self) {
        self.pages.clear();
        self.page_offsets = vec![0];
        self.null_key_counts = vec![0; self.key_columns.len()];
        self.null_key_rows = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ids::SlotId;
    use crate::exec::chunk::field_with_slot_id;
    use crate::exec::spill::ipc_serde::SpillCodec;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![field_with_slot_id(
            Field::new("k", DataType::Int64, true),
            SlotId::new(1),
        )]))
    }

    fn page_chunk(values: Vec<i64>) -> (Chunk, Vec<u64>, Vec<bool>) {
        let len = values.len();
        let hashes = values.iter().map(|v| *v as u64).collect();
        let batch = RecordBatch::try_new(
            schema(),
            vec![Arc::new(Int64Array::from(values)) as ArrayRef],
        )
        .unwrap();
        (Chunk::new(batch), hashes, vec![false; len])
    }

    fn spill_config() -> SpillConfig {
        SpillConfig {
            local_dirs: vec![std::env::temp_dir()],
            dir_max_bytes: 0,
            codec: SpillCodec::None,
            start_partition_bit: 0,
            partition_bits: 1,
            max_file_size: 0,
            max_spill_level: 1,
            max_spill_bytes: 0,
            write_buffer_size: 4096,
        }
    }

    #[test]
    fn flat_ids_are_stable_across_pages() {
        let mut container = RowContainer::new(schema(), vec![0]);
        let (c1, h1, n1) = page_chunk(vec![1, 2, 3]);
        let (c2, h2, n2) = page_chunk(vec![4, 5]);
        container.append_page(c1, h1, n1, &[0]).unwrap();
        container.append_page(c2, h2, n2, &[0]).unwrap();
        assert_eq!(container.row_count(), 5);
        assert_eq!(container.location(0).unwrap(), (0, 0));
        assert_eq!(container.location(2).unwrap(), (0, 2));
        assert_eq!(container.location(3).unwrap(), (1, 0));
        assert_eq!(container.location(4).unwrap(), (1, 1));
        assert!(container.location(5).is_err());
        assert_eq!(container.flat_id(1, 1), 4);
    }

    #[test]
    fn gather_preserves_request_order() {
        let mut container = RowContainer::new(schema(), vec![0]);
        let (c1, h1, n1) = page_chunk(vec![10, 20]);
        let (c2, h2, n2) = page_chunk(vec![30, 40]);
        container.append_page(c1, h1, n1, &[0]).unwrap();
        container.append_page(c2, h2, n2, &[0]).unwrap();
        let gathered = container.gather_column(0, &[3, 0, 2]).unwrap();
        let gathered = gathered.as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(gathered.values(), &[40, 10, 30]);
    }

    #[test]
    fn erase_partitions_compacts_and_renumbers() {
        let mut container = RowContainer::new(schema(), vec![0]);
        // Hash = value, partition bit 0: even values partition 0, odd partition 1.
        let (c1, h1, n1) = page_chunk(vec![1, 2, 3, 4]);
        container.append_page(c1, h1, n1, &[0]).unwrap();
        let config = spill_config();

        let mut spilled = HashSet::new();
        spilled.insert(1u32);
        let erased = container.erase_partitions(&config, 0, &spilled).unwrap();
        assert_eq!(erased, 2);
        assert_eq!(container.row_count(), 2);
        let remaining = container.gather_column(0, &[0, 1]).unwrap();
        let remaining = remaining.as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(remaining.values(), &[2, 4]);
    }

    #[test]
    fn partition_rows_cover_all_rows_once() {
        let mut container = RowContainer::new(schema(), vec![0]);
        let (c1, h1, n1) = page_chunk(vec![1, 2, 3, 4, 5]);
        container.append_page(c1, h1, n1, &[0]).unwrap();
        let config = spill_config();
        let partitions = container.partition_rows(&config, 0);
        let total: usize = partitions
            .iter()
            .flat_map(|(_, pages)| pages.iter().map(|(_, rows)| rows.len()))
            .sum();
        assert_eq!(total, 5);
    }
}
