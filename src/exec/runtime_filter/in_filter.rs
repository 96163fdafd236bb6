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
use std::collections::HashSet;

use crate::exec::hash_table::key_builder::KeyArrayView;

/// Distinct build-key values are only collected up to this bound; larger key
/// sets fall back to the range-only filter.
pub const MAX_DISTINCT_FILTER_VALUES: usize = 1024;

/// Exact set of distinct integer key values observed on the build side.
#[derive(Clone, Debug)]
pub struct DistinctSet {
    values: HashSet<i64>,
}

impl DistinctSet {
    pub fn contains(&self, value: i64) -> bool {
        self.values.contains(&value)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Collects distinct values with an overflow bound.
#[derive(Clone, Debug, Default)]
pub struct DistinctSetBuilder {
    values: HashSet<i64>,
    overflowed: bool,
}

impl DistinctSetBuilder {
    /// Returns false when the column type cannot produce a distinct-set filter.
    pub fn observe_view(&mut self, view: &KeyArrayView<'_>, num_rows: usize) -> bool {
        if self.overflowed {
            return true;
        }
        let KeyArrayView::Int(int_view) = view else {
            return false;
        };
        for row in 0..num_rows {
            if let Some(value) = int_view.value_at(row) {
                self.values.insert(value);
                if self.values.len() > MAX_DISTINCT_FILTER_VALUES {
                    self.overflowed = true;
                    self.values.clear();
                    return true;
                }
            }
        }
        true
    }

    pub fn finish(self) -> Option<DistinctSet> {
        if self.overflowed {
            None
        } else {
            Some(DistinctSet {
                values: self.values,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::hash_table::key_builder::build_key_views;
    use arrow::array::{ArrayRef, Int32Array, Int64Array};
    use std::sync::Arc;

    #[test]
    fn collects_distinct_values() {
        let array: ArrayRef = Arc::new(Int32Array::from(vec![Some(1), Some(2), Some(1), None]));
        let views = build_key_views(std::slice::from_ref(&array)).unwrap();
        let mut builder = DistinctSetBuilder::default();
        assert!(builder.observe_view(&views[0], 4));
        let set = builder.finish().unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.contains(1));
        assert!(!set.contains(3));
    }

    #[test]
    fn overflow_discards_the_set() {
        let values: Vec<i64> = (0..=(MAX_DISTINCT_FILTER_VALUES as i64)).collect();
        let array: ArrayRef = Arc::new(Int64Array::from(values));
        let views = build_key_views(std::slice::from_ref(&array)).unwrap();
        let mut builder = DistinctSetBuilder::default();
        builder.observe_view(&views[0], MAX_DISTINCT_FILTER_VALUES + 1);
        assert!(builder.finish().is_none());
    }
}
