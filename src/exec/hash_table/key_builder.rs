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
//! Typed views over join key arrays.
//!
//! Responsibilities:
//! - Adapts arrow arrays of the supported key types to a uniform per-row accessor.
//! - Computes per-row key hashes and the serialized key encoding used by the
//!   general hash representation.

use arrow::array::{
    Array, ArrayRef, BooleanArray, Date32Array, Decimal128Array, Float32Array, Float64Array,
    Int8Array, Int16Array, Int32Array, Int64Array, StringArray, TimestampMicrosecondArray,
    TimestampMillisecondArray, TimestampNanosecondArray, TimestampSecondArray,
};
use arrow::datatypes::{DataType, TimeUnit};

use crate::common::error::{ExecError, ExecResult};
use crate::exec::hash_table::hash::{
    canonical_f32_bits, canonical_f64_bits, combine_hash, hash_bytes_with_seed,
    hash_i128_with_seed, hash_null_with_seed, hash_u64_with_seed,
};

pub(crate) enum KeyArrayView<'a> {
    Int(IntKeyView<'a>),
    Float(FloatKeyView<'a>),
    Boolean(&'a BooleanArray),
    Utf8(&'a StringArray),
    Decimal128(&'a Decimal128Array),
}

pub(crate) enum IntKeyView<'a> {
    Int8(&'a Int8Array),
    Int16(&'a Int16Array),
    Int32(&'a Int32Array),
    Int64(&'a Int64Array),
    Date32(&'a Date32Array),
    TimestampSecond(&'a TimestampSecondArray),
    TimestampMillisecond(&'a TimestampMillisecondArray),
    TimestampMicrosecond(&'a TimestampMicrosecondArray),
    TimestampNanosecond(&'a TimestampNanosecondArray),
}

pub(crate) enum FloatKeyView<'a> {
    Float32(&'a Float32Array),
    Float64(&'a Float64Array),
}

impl IntKeyView<'_> {
    pub(crate) fn value_at(&self, row: usize) -> Option<i64> {
        match self {
            IntKeyView::Int8(a) => valid(a, row).then(|| a.value(row) as i64),
            IntKeyView::Int16(a) => valid(a, row).then(|| a.value(row) as i64),
            IntKeyView::Int32(a) => valid(a, row).then(|| a.value(row) as i64),
            IntKeyView::Int64(a) => valid(a, row).then(|| a.value(row)),
            IntKeyView::Date32(a) => valid(a, row).then(|| a.value(row) as i64),
            IntKeyView::TimestampSecond(a) => valid(a, row).then(|| a.value(row)),
            IntKeyView::TimestampMillisecond(a) => valid(a, row).then(|| a.value(row)),
            IntKeyView::TimestampMicrosecond(a) => valid(a, row).then(|| a.value(row)),
            IntKeyView::TimestampNanosecond(a) => valid(a, row).then(|| a.value(row)),
        }
    }
}

impl FloatKeyView<'_> {
    /// Canonicalized bit pattern; every NaN maps to the same bits.
    pub(crate) fn bits_at(&self, row: usize) -> Option<u64> {
        match self {
            FloatKeyView::Float32(a) => {
                valid(a, row).then(|| canonical_f32_bits(a.value(row)) as u64)
            }
            FloatKeyView::Float64(a) => valid(a, row).then(|| canonical_f64_bits(a.value(row))),
        }
    }
}

fn valid(array: &dyn Array, row: usize) -> bool {
    !array.is_null(row)
}

impl KeyArrayView<'_> {
    pub(crate) fn is_null(&self, row: usize) -> bool {
        match self {
            KeyArrayView::Int(view) => view.value_at(row).is_none(),
            KeyArrayView::Float(view) => view.bits_at(row).is_none(),
            KeyArrayView::Boolean(a) => a.is_null(row),
            KeyArrayView::Utf8(a) => a.is_null(row),
            KeyArrayView::Decimal128(a) => a.is_null(row),
        }
    }
}

pub(crate) fn build_key_views(arrays: &[ArrayRef]) -> ExecResult<Vec<KeyArrayView<'_>>> {
    let mut views = Vec::with_capacity(arrays.len());
    for array in arrays {
        views.push(build_key_view(array)?);
    }
    Ok(views)
}

fn build_key_view(array: &ArrayRef) -> ExecResult<KeyArrayView<'_>> {
    let view = match array.data_type() {
        DataType::Int8 => KeyArrayView::Int(IntKeyView::Int8(cast(array)?)),
        DataType::Int16 => KeyArrayView::Int(IntKeyView::Int16(cast(array)?)),
        DataType::Int32 => KeyArrayView::Int(IntKeyView::Int32(cast(array)?)),
        DataType::Int64 => KeyArrayView::Int(IntKeyView::Int64(cast(array)?)),
        DataType::Date32 => KeyArrayView::Int(IntKeyView::Date32(cast(array)?)),
        DataType::Timestamp(TimeUnit::Second, _) => {
            KeyArrayView::Int(IntKeyView::TimestampSecond(cast(array)?))
        }
        DataType::Timestamp(TimeUnit::Millisecond, _) => {
            KeyArrayView::Int(IntKeyView::TimestampMillisecond(cast(array)?))
        }
        DataType::Timestamp(TimeUnit::Microsecond, _) => {
            KeyArrayView::Int(IntKeyView::TimestampMicrosecond(cast(array)?))
        }
        DataType::Timestamp(TimeUnit::Nanosecond, _) => {
            KeyArrayView::Int(IntKeyView::TimestampNanosecond(cast(array)?))
        }
        DataType::Float32 => KeyArrayView::Float(FloatKeyView::Float32(cast(array)?)),
        DataType::Float64 => KeyArrayView::Float(FloatKeyView::Float64(cast(array)?)),
        DataType::Boolean => KeyArrayView::Boolean(cast(array)?),
        DataType::Utf8 => KeyArrayView::Utf8(cast(array)?),
        DataType::Decimal128(_, _) => KeyArrayView::Decimal128(cast(array)?),
        other => {
            return Err(ExecError::invalid_plan(format!(
                "unsupported join key type: {other}"
            )));
        }
    };
    Ok(view)
}

fn cast<T: 'static>(array: &ArrayRef) -> ExecResult<&T> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| ExecError::internal("join key array downcast failed"))
}

/// Whether the row has a null in any key column. Null keys never enter the table.
pub(crate) fn row_has_null_key(views: &[KeyArrayView<'_>], row: usize) -> bool {
    views.iter().any(|view| view.is_null(row))
}

/// Per-row combined key hashes for one batch, seeded with the join-wide seed.
pub(crate) fn build_key_hashes(
    views: &[KeyArrayView<'_>],
    num_rows: usize,
    seed: u64,
) -> Vec<u64> {
    let mut hashes = vec![0u64; num_rows];
    for view in views {
        for (row, acc) in hashes.iter_mut().enumerate() {
            let value_hash = match view {
                KeyArrayView::Int(v) => match v.value_at(row) {
                    Some(value) => hash_u64_with_seed(seed, value as u64),
                    None => hash_null_with_seed(seed),
                },
                KeyArrayView::Float(v) => match v.bits_at(row) {
                    Some(bits) => hash_u64_with_seed(seed, bits),
                    None => hash_null_with_seed(seed),
                },
                KeyArrayView::Boolean(a) => {
                    if a.is_null(row) {
                        hash_null_with_seed(seed)
                    } else {
                        hash_u64_with_seed(seed, a.value(row) as u64)
                    }
                }
                KeyArrayView::Utf8(a) => {
                    if a.is_null(row) {
                        hash_null_with_seed(seed)
                    } else {
                        hash_bytes_with_seed(seed, a.value(row).as_bytes())
                    }
                }
                KeyArrayView::Decimal128(a) => {
                    if a.is_null(row) {
                        hash_null_with_seed(seed)
                    } else {
                        hash_i128_with_seed(seed, a.value(row))
                    }
                }
            };
            *acc = combine_hash(*acc, value_hash);
        }
    }
    hashes
}

/// Serialized key encoding for the general hash representation. Per column: a
/// presence byte, then a fixed-width or length-prefixed value. Floats are
/// canonicalized so NaN payload bits never distinguish keys.
pub(crate) fn encode_key_row(views: &[KeyArrayView<'_>], row: usize, out: &mut Vec<u8>) {
    out.clear();
    for view in views {
        match view {
            KeyArrayView::Int(v) => match v.value_at(row) {
                Some(value) => {
                    out.push(1);
                    out.extend_from_slice(&value.to_le_bytes());
                }
                None => out.push(0),
            },
            KeyArrayView::Float(v) => match v.bits_at(row) {
                Some(bits) => {
                    out.push(1);
                    out.extend_from_slice(&bits.to_le_bytes());
                }
                None => out.push(0),
            },
            KeyArrayView::Boolean(a) => {
                if a.is_null(row) {
                    out.push(0);
                } else {
                    out.push(1);
                    out.push(a.value(row) as u8);
                }
            }
            KeyArrayView::Utf8(a) => {
                if a.is_null(row) {
                    out.push(0);
                } else {
                    let bytes = a.value(row).as_bytes();
                    out.push(1);
                    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                    out.extend_from_slice(bytes);
                }
            }
            KeyArrayView::Decimal128(a) => {
                if a.is_null(row) {
                    out.push(0);
                } else {
                    out.push(1);
                    out.extend_from_slice(&a.value(row).to_le_bytes());
                }
            }
        }
    }
}
