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
use crate::exec::hash_table::key_builder::{IntKeyView, KeyArrayView};

/// Closed integer value range observed over one build key column.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ValueRange {
    pub min: i64,
    pub max: i64,
}

impl ValueRange {
    pub fn contains(&self, value: i64) -> bool {
        value >= self.min && value <= self.max
    }

    pub fn overlaps(&self, min: i64, max: i64) -> bool {
        min <= self.max && max >= self.min
    }

    pub fn span(&self) -> Option<u64> {
        u64::try_from(self.max as i128 - self.min as i128)
            .ok()
            .and_then(|span| span.checked_add(1))
    }
}

/// Accumulates the observed min/max of an integer-like key column.
#[derive(Clone, Copy, Debug, Default)]
pub struct RangeBuilder {
    min: Option<i64>,
    max: Option<i64>,
    saw_null: bool,
}

impl RangeBuilder {
    pub fn observe_view(&mut self, view: &KeyArrayView<'_>, num_rows: usize) -> bool {
        let KeyArrayView::Int(int_view) = view else {
            return false;
        };
        self.observe_int_view(int_view, num_rows);
        true
    }

    pub fn observe_int_view(&mut self, view: &IntKeyView<'_>, num_rows: usize) {
        for row in 0..num_rows {
            match view.value_at(row) {
                Some(value) => {
                    self.min = Some(self.min.map_or(value, |m| m.min(value)));
                    self.max = Some(self.max.map_or(value, |m| m.max(value)));
                }
                None => self.saw_null = true,
            }
        }
    }

    pub fn saw_null(&self) -> bool {
        self.saw_null
    }

    pub fn finish(&self) -> Option<ValueRange> {
        match (self.min, self.max) {
            (Some(min), Some(max)) => Some(ValueRange { min, max }),
            _ => None,
        }
    }
}
