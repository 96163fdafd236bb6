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
//! Scan-side dynamic filter consumption.
//!
//! A scan embeds a [`ScanFilterConsumer`] per filtered column, polls it at
//! driver start and between batches, and conjoins the dynamic filter with its
//! static predicates. Whole splits are skipped when their value range cannot
//! overlap the filter.

use std::sync::Arc;

use arrow::array::{Array, BooleanArray};
use arrow::compute::filter_record_batch;

use crate::common::error::{ExecError, ExecResult};
use crate::common::ids::PlanNodeId;
use crate::exec::chunk::Chunk;
use crate::exec::hash_table::key_builder::{KeyArrayView, build_key_views};
use crate::exec::runtime_filter::DynamicFilter;
use crate::exec::runtime_filter::channel::DynamicFilterChannel;
use crate::runtime::profile::{CounterRef, CounterUnit, RuntimeProfile};

/// Keep-mask for one chunk column under a dynamic filter. Null values never
/// match (a dynamic filter models an equality join key).
pub fn filter_mask(filter: &DynamicFilter, chunk: &Chunk, column: usize) -> ExecResult<BooleanArray> {
    let array = chunk.column(column)?;
    let views = build_key_views(std::slice::from_ref(&array))?;
    let KeyArrayView::Int(int_view) = &views[0] else {
        return Err(ExecError::internal(
            "dynamic filters only apply to integer-like columns",
        ));
    };
    let mut keep = Vec::with_capacity(chunk.len());
    for row in 0..chunk.len() {
        keep.push(match int_view.value_at(row) {
            Some(value) => filter.matches(value),
            None => false,
        });
    }
    Ok(BooleanArray::from(keep))
}

/// Per-(scan, column) consumer state with skip/preload accounting.
pub struct ScanFilterConsumer {
    channel: Arc<DynamicFilterChannel>,
    scan_node: PlanNodeId,
    column: usize,
    seen_version: u64,
    cached: Option<Arc<DynamicFilter>>,
    skipped_splits: CounterRef,
    preloaded_splits: CounterRef,
}

impl ScanFilterConsumer {
    pub fn new(
        channel: Arc<DynamicFilterChannel>,
        scan_node: PlanNodeId,
        column: usize,
        profile: &RuntimeProfile,
    ) -> Self {
        Self {
            channel,
            scan_node,
            column,
            seen_version: 0,
            cached: None,
            skipped_splits: profile.add_counter("SkippedSplits", CounterUnit::Unit),
            preloaded_splits: profile.add_counter("PreloadedSplits", CounterUnit::Unit),
        }
    }

    /// Re-poll the channel when its version moved; cheap to call per batch.
    pub fn poll(&mut self) -> Option<Arc<DynamicFilter>> {
        let version = self.channel.version();
        if self.cached.is_none() && version != self.seen_version {
            self.seen_version = version;
            if let Some(filter) = self.channel.poll(self.scan_node, self.column) {
                self.channel.mark_accepted(self.scan_node, self.column);
                self.cached = Some(filter);
            }
        }
        self.cached.clone()
    }

    pub fn current(&self) -> Option<Arc<DynamicFilter>> {
        self.cached.clone()
    }

    /// Whether a split whose column values lie in `[min, max]` can be skipped
    /// entirely; counts the skip.
    pub fn should_skip_split(&mut self, min: i64, max: i64) -> bool {
        let Some(filter) = self.poll() else {
            return false;
        };
        let skip = !filter.overlaps(min, max);
        if skip {
            self.skipped_splits.add(1);
        }
        skip
    }

    pub fn record_preloaded_split(&mut self) {
        self.preloaded_splits.add(1);
    }

    /// Apply the filter to one chunk, conjoining with an optional static mask.
    pub fn apply(&mut self, chunk: Chunk, static_mask: Option<&BooleanArray>) -> ExecResult<Chunk> {
        let Some(filter) = self.poll() else {
            return match static_mask {
                Some(mask) => filtered(chunk, mask),
                None => Ok(chunk),
            };
        };
        let mask = filter_mask(&filter, &chunk, self.column)?;
        let mask = match static_mask {
            Some(static_mask) => conjoin(&mask, static_mask)?,
            None => mask,
        };
        filtered(chunk, &mask)
    }
}

fn conjoin(lhs: &BooleanArray, rhs: &BooleanArray) -> ExecResult<BooleanArray> {
    if lhs.len() != rhs.len() {
        return Err(ExecError::internal("filter mask length mismatch"));
    }
    let values = (0..lhs.len())
        .map(|row| {
            let l = !lhs.is_null(row) && lhs.value(row);
            let r = !rhs.is_null(row) && rhs.value(row);
            l && r
        })
        .collect::<Vec<_>>();
    Ok(BooleanArray::from(values))
}

fn filtered(chunk: Chunk, mask: &BooleanArray) -> ExecResult<Chunk> {
    let batch = filter_record_batch(&chunk.batch, mask)
        .map_err(|e| ExecError::internal(format!("dynamic filter apply failed: {e}")))?;
    Chunk::try_new(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ids::SlotId;
    use crate::exec::chunk::field_with_slot_id;
    use crate::exec::runtime_filter::in_filter::DistinctSetBuilder;
    use crate::exec::runtime_filter::min_max::ValueRange;
    use arrow::array::{ArrayRef, Int64Array};
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;

    fn chunk_of(values: Vec<i64>) -> Chunk {
        let schema = Arc::new(Schema::new(vec![field_with_slot_id(
            Field::new("k", DataType::Int64, false),
            SlotId::new(1),
        )]));
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(Int64Array::from(values)) as ArrayRef],
        )
        .unwrap();
        Chunk::new(batch)
    }

    fn exact_filter(values: &[i64]) -> DynamicFilter {
        let array: ArrayRef = Arc::new(Int64Array::from(values.to_vec()));
        let views = build_key_views(std::slice::from_ref(&array)).unwrap();
        let mut builder = DistinctSetBuilder::default();
        builder.observe_view(&views[0], values.len());
        DynamicFilter {
            range: ValueRange {
                min: *values.iter().min().unwrap(),
                max: *values.iter().max().unwrap(),
            },
            distinct: builder.finish().map(Arc::new),
        }
    }

    #[test]
    fn consumer_applies_published_filter() {
        let channel = DynamicFilterChannel::new();
        let scan = PlanNodeId::new(2);
        let profile = RuntimeProfile::new("scan");
        let mut consumer = ScanFilterConsumer::new(Arc::clone(&channel), scan, 0, &profile);

        // Nothing published yet: chunk passes through.
        let out = consumer.apply(chunk_of(vec![1, 2, 3]), None).unwrap();
        assert_eq!(out.len(), 3);

        channel.publish(scan, 0, exact_filter(&[2, 4])).unwrap();
        let out = consumer.apply(chunk_of(vec![1, 2, 3, 4]), None).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(channel.accepted_count(), 1);
    }

    #[test]
    fn split_pruning_counts_skips() {
        let channel = DynamicFilterChannel::new();
        let scan = PlanNodeId::new(2);
        let profile = RuntimeProfile::new("scan");
        let mut consumer = ScanFilterConsumer::new(Arc::clone(&channel), scan, 0, &profile);
        channel.publish(scan, 0, exact_filter(&[35, 233])).unwrap();

        assert!(consumer.should_skip_split(300, 400));
        assert!(!consumer.should_skip_split(0, 50));
        assert_eq!(profile.counter_value("SkippedSplits"), 1);
    }
}
