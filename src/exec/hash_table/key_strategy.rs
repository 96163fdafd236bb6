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
//! Join-table representation mode selection.
//!
//! The mode is decided once, after the build input is complete, from observed key
//! statistics, and stays stable for the lifetime of a non-spilled table:
//! - `DirectArray`: one integer key over a dense small range, heads indexed directly.
//! - `NormalizedKey`: fixed-width key columns packed losslessly into 64 bits.
//! - `Hashed`: the general representation; required for float keys, for nullable
//!   keys under null-aware semantics, and for anything the first two cannot express.

use arrow::array::Array;
use arrow::datatypes::{DataType, TimeUnit};

use crate::exec::hash_table::key_builder::{IntKeyView, KeyArrayView};

/// Direct-array mode is capped so the head array stays small even for sparse misuse.
pub(crate) const DIRECT_ARRAY_MAX_SPAN: u64 = 4 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum JoinKeyMode {
    DirectArray { min: i64, span: u64 },
    NormalizedKey { fields: Vec<NormalizedField> },
    Hashed,
}

/// Per-column packing recipe: values encode as `value - min + 1` in `bits` bits,
/// with 0 reserved for null.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct NormalizedField {
    pub(crate) min: i64,
    pub(crate) bits: u32,
}

/// Observed statistics for one key column across the whole build input.
#[derive(Clone, Copy, Debug)]
pub(crate) struct KeyColumnStats {
    pub(crate) min: i64,
    pub(crate) max: i64,
    pub(crate) null_count: u64,
    pub(crate) non_null_count: u64,
    pub(crate) int_like: bool,
}

impl KeyColumnStats {
    pub(crate) fn new(data_type: &DataType) -> Self {
        Self {
            min: i64::MAX,
            max: i64::MIN,
            null_count: 0,
            non_null_count: 0,
            int_like: is_int_like_key_type(data_type),
        }
    }

    pub(crate) fn observe(&mut self, view: &KeyArrayView<'_>, num_rows: usize) {
        match view {
            KeyArrayView::Int(int_view) => {
                for row in 0..num_rows {
                    match int_view.value_at(row) {
                        Some(value) => {
                            self.non_null_count += 1;
                            self.min = self.min.min(value);
                            self.max = self.max.max(value);
                        }
                        None => self.null_count += 1,
                    }
                }
            }
            KeyArrayView::Boolean(array) => {
                for row in 0..num_rows {
                    if array.is_null(row) {
                        self.null_count += 1;
                    } else {
                        self.non_null_count += 1;
                        let value = array.value(row) as i64;
                        self.min = self.min.min(value);
                        self.max = self.max.max(value);
                    }
                }
            }
            other => {
                for row in 0..num_rows {
                    if other.is_null(row) {
                        self.null_count += 1;
                    } else {
                        self.non_null_count += 1;
                    }
                }
            }
        }
    }

    fn span(&self) -> Option<u64> {
        if !self.int_like || self.non_null_count == 0 {
            return None;
        }
        (self.max as i128 - self.min as i128)
            .try_into()
            .ok()
            .and_then(|span: u64| span.checked_add(1))
    }
}

pub(crate) fn is_int_like_key_type(data_type: &DataType) -> bool {
    matches!(
        data_type,
        DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::Boolean
            | DataType::Date32
            | DataType::Timestamp(
                TimeUnit::Second
                    | TimeUnit::Millisecond
                    | TimeUnit::Microsecond
                    | TimeUnit::Nanosecond,
                _
            )
    )
}

fn is_single_int_key(view: &KeyArrayView<'_>) -> bool {
    matches!(
        view,
        KeyArrayView::Int(
            IntKeyView::Int8(_)
                | IntKeyView::Int16(_)
                | IntKeyView::Int32(_)
                | IntKeyView::Int64(_)
                | IntKeyView::Date32(_)
                | IntKeyView::TimestampSecond(_)
                | IntKeyView::TimestampMillisecond(_)
                | IntKeyView::TimestampMicrosecond(_)
                | IntKeyView::TimestampNanosecond(_)
        )
    )
}

/// Pick the representation from complete build-side statistics.
///
/// `null_aware_nullable` forces the general mode: null-aware semantics need the
/// table to coexist with tracked null-key rows, which the packed modes cannot
/// represent.
pub(crate) fn pick_join_key_mode(
    types: &[DataType],
    stats: &[KeyColumnStats],
    sample_views: &[KeyArrayView<'_>],
    null_aware_nullable: bool,
) -> JoinKeyMode {
    if types.is_empty() || stats.len() != types.len() {
        return JoinKeyMode::Hashed;
    }
    if null_aware_nullable {
        return JoinKeyMode::Hashed;
    }
    if stats.iter().any(|s| !s.int_like) {
        return JoinKeyMode::Hashed;
    }
    if stats.iter().all(|s| s.non_null_count == 0) {
        // Empty or all-null build side: nothing to index, any mode works.
        return JoinKeyMode::Hashed;
    }

    if types.len() == 1
        && sample_views.first().map(is_single_int_key).unwrap_or(false)
        && stats[0].null_count == 0
    {
        if let Some(span) = stats[0].span() {
            if span <= DIRECT_ARRAY_MAX_SPAN {
                return JoinKeyMode::DirectArray {
                    min: stats[0].min,
                    span,
                };
            }
        }
    }

    let mut fields = Vec::with_capacity(types.len());
    let mut total_bits = 0u32;
    for stat in stats {
        let Some(span) = stat.span() else {
            return JoinKeyMode::Hashed;
        };
        // Encoded domain is [0, span]: 0 for null, 1..=span for values.
        let Some(domain) = span.checked_add(1) else {
            return JoinKeyMode::Hashed;
        };
        let bits = bits_for(domain);
        if bits > 63 {
            return JoinKeyMode::Hashed;
        }
        total_bits = total_bits.saturating_add(bits);
        if total_bits > 64 {
            return JoinKeyMode::Hashed;
        }
        fields.push(NormalizedField {
            min: stat.min,
            bits,
        });
    }
    JoinKeyMode::NormalizedKey { fields }
}

fn bits_for(max_encoded: u64) -> u32 {
    64 - max_encoded.leading_zeros()
}
