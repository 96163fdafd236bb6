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
//! The three-mode key index backing the join hash table.
//!
//! Responsibilities:
//! - Maps key tuples to dense group ids under the representation picked by
//!   `key_strategy`: direct array, normalized 64-bit key, or general hash.
//! - Guarantees NaN-canonical equality and never stores null keys.

use std::mem;

use arrow::array::Array;
use hashbrown::raw::RawTable;

use crate::common::error::{ExecError, ExecResult};
use crate::exec::hash_table::key_builder::{KeyArrayView, encode_key_row};
use crate::exec::hash_table::key_storage::{RowKey, RowStorage};
use crate::exec::hash_table::key_strategy::{JoinKeyMode, NormalizedField};

pub(crate) struct KeyLookup {
    pub(crate) group_id: usize,
    pub(crate) is_new: bool,
}

#[derive(Clone, Copy)]
struct PackedEntry {
    packed: u64,
    hash: u64,
    group_id: u32,
}

#[derive(Clone, Copy)]
struct HashEntry {
    hash: u64,
    group_id: u32,
}

pub(crate) struct DirectArrayIndex {
    min: i64,
    slots: Vec<u32>,
    group_count: usize,
}

pub(crate) struct NormalizedKeyIndex {
    fields: Vec<NormalizedField>,
    table: RawTable<PackedEntry>,
    group_count: usize,
}

pub(crate) struct HashedKeyIndex {
    table: RawTable<HashEntry>,
    keys: Vec<RowKey>,
    storage: RowStorage,
}

pub(crate) enum KeyIndex {
    DirectArray(DirectArrayIndex),
    Normalized(NormalizedKeyIndex),
    Hashed(HashedKeyIndex),
}

impl std::fmt::Debug for KeyIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let variant = match self {
            KeyIndex::DirectArray(_) => "DirectArray",
            KeyIndex::Normalized(_) => "Normalized",
            KeyIndex::Hashed(_) => "Hashed",
        };
        f.debug_tuple(variant).finish()
    }
}

impl KeyIndex {
    pub(crate) fn new(mode: &JoinKeyMode) -> Self {
        match mode {
            JoinKeyMode::DirectArray { min, span } => KeyIndex::DirectArray(DirectArrayIndex {
                min: *min,
                slots: vec![0u32; *span as usize],
                group_count: 0,
            }),
            JoinKeyMode::NormalizedKey { fields } => KeyIndex::Normalized(NormalizedKeyIndex {
                fields: fields.clone(),
                table: RawTable::new(),
                group_count: 0,
            }),
            JoinKeyMode::Hashed => KeyIndex::Hashed(HashedKeyIndex {
                table: RawTable::new(),
                keys: Vec::new(),
                storage: RowStorage::new(64 * 1024),
            }),
        }
    }

    pub(crate) fn group_count(&self) -> usize {
        match self {
            KeyIndex::DirectArray(index) => index.group_count,
            KeyIndex::Normalized(index) => index.group_count,
            KeyIndex::Hashed(index) => index.keys.len(),
        }
    }

    /// Insert the key of `row`; nulls must have been filtered by the caller.
    pub(crate) fn insert(
        &mut self,
        views: &[KeyArrayView<'_>],
        row: usize,
        hash: u64,
        scratch: &mut Vec<u8>,
    ) -> ExecResult<KeyLookup> {
        match self {
            KeyIndex::DirectArray(index) => index.insert(views, row),
            KeyIndex::Normalized(index) => index.insert(views, row, hash),
            KeyIndex::Hashed(index) => {
                encode_key_row(views, row, scratch);
                index.insert(scratch, hash)
            }
        }
    }

    pub(crate) fn lookup(
        &self,
        views: &[KeyArrayView<'_>],
        row: usize,
        hash: u64,
        scratch: &mut Vec<u8>,
    ) -> ExecResult<Option<usize>> {
        match self {
            KeyIndex::DirectArray(index) => index.lookup(views, row),
            KeyIndex::Normalized(index) => Ok(index.lookup(views, row, hash)),
            KeyIndex::Hashed(index) => {
                encode_key_row(views, row, scratch);
                Ok(index.lookup(scratch, hash))
            }
        }
    }

    /// Insert an already-serialized key; used by the parallel-build merge step
    /// where worker partitions hand the leader their serialized keys.
    pub(crate) fn insert_serialized(&mut self, key: &[u8], hash: u64) -> ExecResult<KeyLookup> {
        match self {
            KeyIndex::Hashed(index) => index.insert(key, hash),
            _ => Err(ExecError::internal(
                "serialized key insert requires the hashed representation",
            )),
        }
    }

    pub(crate) fn tracked_bytes(&self) -> i64 {
        let bytes = match self {
            KeyIndex::DirectArray(index) => index.slots.capacity() * mem::size_of::<u32>(),
            KeyIndex::Normalized(index) => index.table.capacity() * mem::size_of::<PackedEntry>(),
            KeyIndex::Hashed(index) => {
                index.table.capacity() * mem::size_of::<HashEntry>()
                    + index.keys.capacity() * mem::size_of::<RowKey>()
                    + index.storage.tracked_bytes() as usize
            }
        };
        i64::try_from(bytes).unwrap_or(i64::MAX)
    }
}

fn int_key_value(views: &[KeyArrayView<'_>], row: usize) -> ExecResult<Option<i64>> {
    let Some(KeyArrayView::Int(view)) = views.first() else {
        return Err(ExecError::internal(
            "direct-array key index expects one integer key column",
        ));
    };
    Ok(view.value_at(row))
}

impl DirectArrayIndex {
    fn insert(&mut self, views: &[KeyArrayView<'_>], row: usize) -> ExecResult<KeyLookup> {
        let value = int_key_value(views, row)?
            .ok_or_else(|| ExecError::internal("null key reached the key index"))?;
        let slot = usize::try_from(value.wrapping_sub(self.min))
            .ok()
            .filter(|s| *s < self.slots.len())
            .ok_or_else(|| {
                ExecError::internal(format!(
                    "direct-array key {value} outside prepared range [{}, {})",
                    self.min,
                    self.min + self.slots.len() as i64
                ))
            })?;
        if self.slots[slot] == 0 {
            self.group_count += 1;
            let group_id = self.group_count as u32;
            self.slots[slot] = group_id;
            Ok(KeyLookup {
                group_id: (group_id - 1) as usize,
                is_new: true,
            })
        } else {
            Ok(KeyLookup {
                group_id: (self.slots[slot] - 1) as usize,
                is_new: false,
            })
        }
    }

    fn lookup(&self, views: &[KeyArrayView<'_>], row: usize) -> ExecResult<Option<usize>> {
        let Some(value) = int_key_value(views, row)? else {
            return Ok(None);
        };
        let Some(slot) = usize::try_from(value.wrapping_sub(self.min))
            .ok()
            .filter(|s| *s < self.slots.len())
        else {
            return Ok(None);
        };
        match self.slots[slot] {
            0 => Ok(None),
            group_id => Ok(Some((group_id - 1) as usize)),
        }
    }
}

impl NormalizedKeyIndex {
    /// Pack one row's key columns into 64 bits, or None when any value falls
    /// outside the prepared per-column range (possible only on the probe side).
    fn pack(&self, views: &[KeyArrayView<'_>], row: usize) -> Option<u64> {
        let mut packed = 0u64;
        for (field, view) in self.fields.iter().zip(views.iter()) {
            let value = match view {
                KeyArrayView::Int(v) => v.value_at(row)?,
                KeyArrayView::Boolean(a) => {
                    if a.is_null(row) {
                        return None;
                    }
                    a.value(row) as i64
                }
                _ => return None,
            };
            let offset = (value as i128) - (field.min as i128) + 1;
            let encoded = u64::try_from(offset).ok()?;
            if field.bits < 64 && encoded >= (1u64 << field.bits) {
                return None;
            }
            packed = (packed << field.bits) | encoded;
        }
        Some(packed)
    }

    fn insert(
        &mut self,
        views: &[KeyArrayView<'_>],
        row: usize,
        hash: u64,
    ) -> ExecResult<KeyLookup> {
        let packed = self
            .pack(views, row)
            .ok_or_else(|| ExecError::internal("build key fell outside the prepared pack range"))?;
        let result = self.table.find_or_find_insert_slot(
            hash,
            |entry| entry.packed == packed,
            |entry| entry.hash,
        );
        match result {
            Ok(bucket) => Ok(KeyLookup {
                group_id: unsafe { bucket.as_ref().group_id } as usize,
                is_new: false,
            }),
            Err(slot) => {
                let group_id = self.group_count as u32;
                self.group_count += 1;
                unsafe {
                    self.table.insert_in_slot(
                        hash,
                        slot,
                        PackedEntry {
                            packed,
                            hash,
                            group_id,
                        },
                    );
                }
                Ok(KeyLookup {
                    group_id: group_id as usize,
                    is_new: true,
                })
            }
        }
    }

    fn lookup(&self, views: &[KeyArrayView<'_>], row: usize, hash: u64) -> Option<usize> {
        let packed = self.pack(views, row)?;
        self.table
            .get(hash, |entry| entry.packed == packed)
            .map(|entry| entry.group_id as usize)
    }
}

impl HashedKeyIndex {
    fn insert(&mut self, key: &[u8], hash: u64) -> ExecResult<KeyLookup> {
        let mut error = None;
        let result = {
            let keys = &self.keys;
            let storage = &self.storage;
            self.table.find_or_find_insert_slot(
                hash,
                |entry| match keys.get(entry.group_id as usize) {
                    Some(stored) => storage.get(*stored) == key,
                    None => {
                        error = Some(ExecError::internal("key index group out of bounds"));
                        false
                    }
                },
                |entry| entry.hash,
            )
        };
        if let Some(err) = error {
            return Err(err);
        }
        match result {
            Ok(bucket) => Ok(KeyLookup {
                group_id: unsafe { bucket.as_ref().group_id } as usize,
                is_new: false,
            }),
            Err(slot) => {
                let group_id = u32::try_from(self.keys.len())
                    .map_err(|_| ExecError::internal("key index group id overflow"))?;
                let stored = self.storage.alloc_copy(key);
                self.keys.push(stored);
                unsafe {
                    self.table
                        .insert_in_slot(hash, slot, HashEntry { hash, group_id });
                }
                Ok(KeyLookup {
                    group_id: group_id as usize,
                    is_new: true,
                })
            }
        }
    }

    fn lookup(&self, key: &[u8], hash: u64) -> Option<usize> {
        self.table
            .get(hash, |entry| {
                self.keys
                    .get(entry.group_id as usize)
                    .map(|stored| self.storage.get(*stored) == key)
                    .unwrap_or(false)
            })
            .map(|entry| entry.group_id as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::hash_table::key_builder::{build_key_hashes, build_key_views};
    use crate::exec::hash_table::key_strategy::{
        JoinKeyMode, KeyColumnStats, pick_join_key_mode,
    };
    use arrow::array::{ArrayRef, Float64Array, Int32Array, Int64Array};
    use std::sync::Arc;

    fn index_over(arrays: &[ArrayRef]) -> (KeyIndex, Vec<u64>) {
        let views = build_key_views(arrays).unwrap();
        let types: Vec<_> = arrays.iter().map(|a| a.data_type().clone()).collect();
        let mut stats: Vec<KeyColumnStats> = types.iter().map(KeyColumnStats::new).collect();
        for (stat, view) in stats.iter_mut().zip(views.iter()) {
            stat.observe(view, arrays[0].len());
        }
        let mode = pick_join_key_mode(&types, &stats, &views, false);
        let hashes = build_key_hashes(&views, arrays[0].len(), 7);
        let mut index = KeyIndex::new(&mode);
        let mut scratch = Vec::new();
        for row in 0..arrays[0].len() {
            index.insert(&views, row, hashes[row], &mut scratch).unwrap();
        }
        (index, hashes)
    }

    #[test]
    fn direct_array_groups_duplicates() {
        let arrays: Vec<ArrayRef> = vec![Arc::new(Int64Array::from(vec![5, 6, 5, 9]))];
        let (index, hashes) = index_over(&arrays);
        assert!(matches!(index, KeyIndex::DirectArray(_)));
        assert_eq!(index.group_count(), 3);

        let views = build_key_views(&arrays).unwrap();
        let mut scratch = Vec::new();
        let g0 = index.lookup(&views, 0, hashes[0], &mut scratch).unwrap();
        let g2 = index.lookup(&views, 2, hashes[2], &mut scratch).unwrap();
        assert_eq!(g0, g2);

        let miss: Vec<ArrayRef> = vec![Arc::new(Int64Array::from(vec![7]))];
        let miss_views = build_key_views(&miss).unwrap();
        let miss_hash = build_key_hashes(&miss_views, 1, 7);
        assert_eq!(
            index
                .lookup(&miss_views, 0, miss_hash[0], &mut scratch)
                .unwrap(),
            None
        );
    }

    #[test]
    fn normalized_key_distinguishes_column_order() {
        let arrays: Vec<ArrayRef> = vec![
            Arc::new(Int32Array::from(vec![1, 2])),
            Arc::new(Int32Array::from(vec![2, 1])),
        ];
        let (index, _) = index_over(&arrays);
        assert!(matches!(index, KeyIndex::Normalized(_)));
        assert_eq!(index.group_count(), 2);
    }

    #[test]
    fn hashed_mode_joins_nan_payloads() {
        let quiet = f64::NAN;
        let payload = f64::from_bits(f64::NAN.to_bits() | 0x77);
        let arrays: Vec<ArrayRef> = vec![Arc::new(Float64Array::from(vec![quiet, payload]))];
        let (index, _) = index_over(&arrays);
        assert!(matches!(index, KeyIndex::Hashed(_)));
        assert_eq!(index.group_count(), 1);
    }

    #[test]
    fn probe_value_outside_packed_range_misses() {
        let arrays: Vec<ArrayRef> = vec![
            Arc::new(Int32Array::from(vec![1, 2])),
            Arc::new(Int32Array::from(vec![10, 20])),
        ];
        let (index, _) = index_over(&arrays);
        let probe: Vec<ArrayRef> = vec![
            Arc::new(Int32Array::from(vec![100])),
            Arc::new(Int32Array::from(vec![10])),
        ];
        let views = build_key_views(&probe).unwrap();
        let hashes = build_key_hashes(&views, 1, 7);
        let mut scratch = Vec::new();
        assert_eq!(index.lookup(&views, 0, hashes[0], &mut scratch).unwrap(), None);
    }
}
