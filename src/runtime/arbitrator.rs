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
//! Memory arbitration for spillable operators.
//!
//! Responsibilities:
//! - Owns the query memory pool and turns capacity shortfalls into reclaim demand.
//! - Tracks per-operator reclaim demand, advertised reclaimable bytes and arbitration re-entry.
//!
//! Operators poll their demand at cooperative checkpoints and spill themselves; the
//! arbitrator never calls into an operator directly. A reclaim entering a driver that is
//! already arbitrating is rejected to prevent deadlock.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use crate::common::error::{ExecError, ExecResult};
use crate::common::logging::debug;
use crate::runtime::mem_tracker::MemTracker;

struct RegisteredOperator {
    name: String,
    /// Outstanding reclaim demand in bytes, set by the arbitrator, drained by the operator.
    demand: AtomicI64,
    /// Bytes the operator currently advertises as reclaimable; 0 while unreclaimable.
    reclaimable: AtomicI64,
    in_arbitration: AtomicBool,
}

/// Identifies one registered operator to the arbitrator.
#[derive(Clone)]
pub struct ReclaimToken {
    slot: usize,
    op: Arc<RegisteredOperator>,
}

pub struct MemoryArbitrator {
    pool: Arc<MemTracker>,
    operators: Mutex<Vec<Arc<RegisteredOperator>>>,
    spilled_bytes: Arc<AtomicI64>,
    non_reclaimable_attempts: AtomicI64,
}

/// Clears the in-arbitration flag when the reclaim section ends.
pub struct ArbitrationGuard {
    op: Arc<RegisteredOperator>,
}

impl Drop for ArbitrationGuard {
    fn drop(&mut self) {
        self.op.in_arbitration.store(false, Ordering::Release);
    }
}

impl MemoryArbitrator {
    /// Create an arbitrator over a fresh pool; `capacity` of -1 means unlimited.
    pub fn new(capacity: i64) -> Arc<Self> {
        Self::with_spill_counter(capacity, Arc::new(AtomicI64::new(0)))
    }

    /// Create an arbitrator with an injected process-wide spilled-bytes counter so
    /// tests can sandbox the per-query spill cap.
    pub fn with_spill_counter(capacity: i64, spilled_bytes: Arc<AtomicI64>) -> Arc<Self> {
        Arc::new(Self {
            pool: MemTracker::new_root_with_limit("arbitrator", capacity),
            operators: Mutex::new(Vec::new()),
            spilled_bytes,
            non_reclaimable_attempts: AtomicI64::new(0),
        })
    }

    pub fn pool(&self) -> Arc<MemTracker> {
        Arc::clone(&self.pool)
    }

    pub fn spilled_bytes_counter(&self) -> Arc<AtomicI64> {
        Arc::clone(&self.spilled_bytes)
    }

    pub fn non_reclaimable_attempts(&self) -> i64 {
        self.non_reclaimable_attempts.load(Ordering::Acquire)
    }

    pub fn register(&self, name: impl Into<String>) -> ReclaimToken {
        let op = Arc::new(RegisteredOperator {
            name: name.into(),
            demand: AtomicI64::new(0),
            reclaimable: AtomicI64::new(0),
            in_arbitration: AtomicBool::new(false),
        });
        let mut guard = self.operators.lock().unwrap_or_else(|e| e.into_inner());
        guard.push(Arc::clone(&op));
        ReclaimToken {
            slot: guard.len() - 1,
            op,
        }
    }

    /// Whether `bytes` more fit under the pool limit right now.
    pub fn fits(&self, bytes: i64) -> bool {
        !self.pool.would_exceed_limit(bytes)
    }

    /// Ask for `bytes` of growth. On shortfall, reclaim demand is spread over other
    /// operators (largest advertised reclaimable first) and the call reports how many
    /// reclaimable bytes were flagged. The caller retries after spilling or fails with
    /// `OutOfMemory` when nothing is reclaimable.
    pub fn try_grow(&self, requester: &ReclaimToken, bytes: i64) -> ExecResult<GrowOutcome> {
        if self.fits(bytes) {
            return Ok(GrowOutcome::Granted);
        }
        let flagged = self.request_reclaim(requester, bytes);
        if flagged > 0 {
            Ok(GrowOutcome::ReclaimRequested { flagged })
        } else {
            Err(ExecError::out_of_memory(format!(
                "allocation of {bytes} bytes denied for {}: pool used={} limit={}, nothing reclaimable",
                requester.op.name,
                self.pool.current(),
                self.pool.limit()
            )))
        }
    }

    /// Flag reclaim demand on every other operator with advertised reclaimable bytes.
    /// Returns the total reclaimable bytes flagged; 0 records a non-reclaimable attempt.
    pub fn request_reclaim(&self, requester: &ReclaimToken, bytes: i64) -> i64 {
        let operators = {
            let guard = self.operators.lock().unwrap_or_else(|e| e.into_inner());
            guard.clone()
        };
        let mut candidates: Vec<(i64, Arc<RegisteredOperator>)> = operators
            .into_iter()
            .enumerate()
            .filter(|(slot, op)| {
                *slot != requester.slot
                    && !op.in_arbitration.load(Ordering::Acquire)
                    && op.reclaimable.load(Ordering::Acquire) > 0
            })
            .map(|(_, op)| (op.reclaimable.load(Ordering::Acquire), op))
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0));

        let mut flagged = 0i64;
        for (reclaimable, op) in candidates {
            if flagged >= bytes {
                break;
            }
            let ask = reclaimable.min(bytes - flagged);
            op.demand.fetch_add(ask, Ordering::AcqRel);
            flagged = flagged.saturating_add(reclaimable);
            debug!(
                "arbitrator reclaim demand: target={} ask={} reclaimable={}",
                op.name, ask, reclaimable
            );
        }
        if flagged == 0 {
            self.non_reclaimable_attempts.fetch_add(1, Ordering::AcqRel);
        }
        flagged
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GrowOutcome {
    Granted,
    ReclaimRequested { flagged: i64 },
}

impl ReclaimToken {
    pub fn name(&self) -> &str {
        &self.op.name
    }

    /// Advertise how many bytes this operator could free right now; 0 while inside a
    /// non-reclaimable section.
    pub fn report_reclaimable(&self, bytes: i64) {
        self.op.reclaimable.store(bytes.max(0), Ordering::Release);
    }

    /// Drain outstanding reclaim demand; called at cooperative checkpoints.
    pub fn take_demand(&self) -> i64 {
        self.op.demand.swap(0, Ordering::AcqRel)
    }

    /// Enter the arbitration section. Re-entry is rejected rather than deadlocking.
    pub fn enter_arbitration(&self) -> ExecResult<ArbitrationGuard> {
        if self.op.in_arbitration.swap(true, Ordering::AcqRel) {
            return Err(ExecError::internal(format!(
                "operator {} is already inside arbitration",
                self.op.name
            )));
        }
        Ok(ArbitrationGuard {
            op: Arc::clone(&self.op),
        })
    }
}
