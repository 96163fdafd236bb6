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
//! Seeded key hashing for the join subsystem.
//!
//! Everything under one join node hashes with a single seed derived from the
//! plan node id (see [`derive_join_seed`] and `JoinBridge::new_for_node`), so
//! build ingest, probe lookup and spill partitioning agree on every row's hash
//! across drivers, recursion levels and re-runs of the same plan.
//!
//! Floats canonicalize before hashing and key encoding: every NaN maps to one
//! bit pattern, and negative zero maps to positive zero, matching IEEE-754
//! equality.

/// Tag folded into the per-node seed derivation ("vexec_jn").
const SEED_TAG: u64 = 0x7665_7865_635f_6a6e;

/// Value standing in for a null key in combined row hashes ("nullkey!").
const NULL_TAG: u64 = 0x6e75_6c6c_6b65_7921;

// MurmurHash3 fmix64 multipliers.
const MIX_K1: u64 = 0xff51_afd7_ed55_8ccd;
const MIX_K2: u64 = 0xc4ce_b9fe_1a85_ec53;

/// Multiplier for folding per-column hashes into one row hash.
const COMBINE_MUL: u64 = 0x9ddf_ea08_eb38_2d69;

fn mix64(mut value: u64) -> u64 {
    value ^= value >> 33;
    value = value.wrapping_mul(MIX_K1);
    value ^= value >> 33;
    value = value.wrapping_mul(MIX_K2);
    value ^ (value >> 33)
}

/// The hash seed for one join node. Deterministic per node id so partition
/// assignment reproduces across drivers and process restarts within one run.
pub(crate) fn derive_join_seed(node_id: i32) -> u64 {
    mix64(SEED_TAG ^ (node_id as u64).rotate_left(17))
}

pub(crate) fn hash_u64_with_seed(seed: u64, value: u64) -> u64 {
    mix64(value.wrapping_add(seed.rotate_left(23)))
}

pub(crate) fn hash_null_with_seed(seed: u64) -> u64 {
    hash_u64_with_seed(seed, NULL_TAG)
}

/// Fold one column's value hash into the accumulated row hash. Order-sensitive
/// so (a, b) and (b, a) key tuples stay distinct.
pub(crate) fn combine_hash(acc: u64, value_hash: u64) -> u64 {
    (acc.rotate_left(27) ^ value_hash).wrapping_mul(COMBINE_MUL)
}

pub(crate) fn hash_i128_with_seed(seed: u64, value: i128) -> u64 {
    let bits = value as u128;
    let low = hash_u64_with_seed(seed, bits as u64);
    let high = hash_u64_with_seed(seed, (bits >> 64) as u64);
    combine_hash(low, high)
}

/// Seeded hash over raw bytes, consumed 8 bytes at a time with a zero-padded
/// tail; the length participates so prefixes don't collide with their
/// extensions.
pub(crate) fn hash_bytes_with_seed(seed: u64, bytes: &[u8]) -> u64 {
    let mut hash = seed ^ mix64(bytes.len() as u64 ^ SEED_TAG);
    let mut chunks = bytes.chunks_exact(8);
    for chunk in &mut chunks {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        hash = combine_hash(hash, mix64(u64::from_le_bytes(word)));
    }
    let rem = chunks.remainder();
    if !rem.is_empty() {
        let mut tail = [0u8; 8];
        tail[..rem.len()].copy_from_slice(rem);
        hash = combine_hash(hash, mix64(u64::from_le_bytes(tail)));
    }
    mix64(hash)
}

/// Canonical bit pattern for hashing and key encoding: one NaN, one zero.
pub(crate) fn canonical_f64_bits(value: f64) -> u64 {
    if value.is_nan() {
        f64::NAN.to_bits()
    } else if value == 0.0 {
        // -0.0 == 0.0 under IEEE-754 equality; they must share a key.
        0u64
    } else {
        value.to_bits()
    }
}

pub(crate) fn canonical_f32_bits(value: f32) -> u32 {
    if value.is_nan() {
        f32::NAN.to_bits()
    } else if value == 0.0 {
        0u32
    } else {
        value.to_bits()
    }
}
