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
//! Dynamic filters derived from observed build keys and pushed to probe-side scans.

pub mod apply;
pub mod channel;
pub mod in_filter;
pub mod min_max;

use std::sync::Arc;

use crate::exec::runtime_filter::in_filter::DistinctSet;
use crate::exec::runtime_filter::min_max::ValueRange;

/// A per-key dynamic filter: a value range plus an optional exact distinct set.
/// Filters never exclude a row that would have matched the join.
#[derive(Clone, Debug)]
pub struct DynamicFilter {
    pub range: ValueRange,
    pub distinct: Option<Arc<DistinctSet>>,
}

impl DynamicFilter {
    /// Whether a probe value may match some build key.
    pub fn matches(&self, value: i64) -> bool {
        if !self.range.contains(value) {
            return false;
        }
        match self.distinct.as_ref() {
            Some(set) => set.contains(value),
            None => true,
        }
    }

    /// Whether any value in `[min, max]` may match; used for split pruning.
    pub fn overlaps(&self, min: i64, max: i64) -> bool {
        self.range.overlaps(min, max)
    }

    /// An exact filter accepts a value iff some build key equals it.
    pub fn is_exact(&self) -> bool {
        self.distinct.is_some()
    }
}
