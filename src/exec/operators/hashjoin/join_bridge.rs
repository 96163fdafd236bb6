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
//! Join bridge: the rendezvous between the build and probe sides of one join.
//!
//! Responsibilities:
//! - Collects per-driver build results; the last arriving builder becomes the
//!   leader and publishes the finished artifact exactly once.
//! - Hands spilled partitions out to probe drivers so no partition is replayed
//!   twice; cancellation unblocks every waiter.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::common::error::{ExecError, ExecResult};
use crate::common::ids::PlanNodeId;
use crate::common::logging::debug;
use crate::exec::hash_table::hash::derive_join_seed;
use crate::exec::operators::hashjoin::join_hash_table::JoinHashTable;
use crate::exec::operators::hashjoin::row_container::RowContainer;
use crate::exec::pipeline::dependency::{DependencyHandle, new_dependency};
use crate::exec::spill::spiller::SpilledPartition;

/// Bridge lifecycle. Exactly one transition out of Building happens, performed
/// by the last builder.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BridgeState {
    Building,
    TablePublished,
    Spilled,
    Drained,
    Closed,
}

/// The published build result: the merged row container, the table over its
/// unspilled rows, and the on-disk picture of the spilled partitions.
#[derive(Debug)]
pub struct JoinArtifact {
    pub(crate) container: Arc<RowContainer>,
    pub(crate) table: Option<Arc<JoinHashTable>>,
    pub(crate) spilled: Vec<SpilledPartition>,
    /// Total accepted build rows across all drivers, spilled rows included.
    pub(crate) total_build_rows: usize,
    pub(crate) build_has_null_key: bool,
}

impl JoinArtifact {
    pub fn total_build_rows(&self) -> usize {
        self.total_build_rows
    }

    pub fn build_has_null_key(&self) -> bool {
        self.build_has_null_key
    }

    pub fn spilled_partition_count(&self) -> usize {
        self.spilled.len()
    }

    /// Rows sitting in spill files across all partitions.
    pub fn spilled_rows(&self) -> u64 {
        self.spilled.iter().map(|p| p.rows()).sum()
    }

    /// Build rows kept in memory (the unspilled remainder).
    pub fn in_memory_rows(&self) -> usize {
        self.container.row_count()
    }
}

/// What the leader receives when the last builder arrives. Row and null totals
/// are accumulated at ingest, before any rows were spilled away, so the
/// null-aware short-circuits see the whole build side.
pub(crate) struct BuildFinalizeInput {
    pub(crate) containers: Vec<RowContainer>,
    pub(crate) spilled: Vec<SpilledPartition>,
    pub(crate) total_rows: usize,
    pub(crate) has_null_key: bool,
}

struct Rendezvous {
    containers: Vec<RowContainer>,
    spilled: Vec<SpilledPartition>,
    total_rows: usize,
    null_key_rows: u64,
    arrived: usize,
}

/// Merged probe-side finish state handed to the last arriving probe driver.
pub(crate) struct ProbeMerge {
    /// Element-wise OR of every driver's build-matched flags.
    pub(crate) matched: Vec<bool>,
    pub(crate) probe_rows: u64,
    pub(crate) probe_saw_null_key: bool,
    /// Probe-side spill partitions deposited by all drivers.
    pub(crate) probe_partitions: Vec<SpilledPartition>,
}

struct ProbeRendezvous {
    matched: Vec<bool>,
    probe_rows: u64,
    probe_saw_null_key: bool,
    probe_partitions: Vec<SpilledPartition>,
    arrived: usize,
}

pub struct JoinBridge {
    node_id: PlanNodeId,
    num_builders: usize,
    num_probers: usize,
    hash_seed: u64,
    rendezvous: Mutex<Rendezvous>,
    probe_rendezvous: Mutex<ProbeRendezvous>,
    artifact: Mutex<Option<Arc<JoinArtifact>>>,
    state: Mutex<BridgeState>,
    unclaimed: Mutex<VecDeque<SpilledPartition>>,
    probe_spill_observed: AtomicBool,
    cancelled: AtomicBool,
    table_ready: DependencyHandle,
}

impl JoinBridge {
    pub fn new(
        node_id: PlanNodeId,
        num_builders: usize,
        num_probers: usize,
        hash_seed: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            num_builders: num_builders.max(1),
            num_probers: num_probers.max(1),
            hash_seed,
            rendezvous: Mutex::new(Rendezvous {
                containers: Vec::new(),
                spilled: Vec::new(),
                total_rows: 0,
                null_key_rows: 0,
                arrived: 0,
            }),
            probe_rendezvous: Mutex::new(ProbeRendezvous {
                matched: Vec::new(),
                probe_rows: 0,
                probe_saw_null_key: false,
                probe_partitions: Vec::new(),
                arrived: 0,
            }),
            artifact: Mutex::new(None),
            state: Mutex::new(BridgeState::Building),
            unclaimed: Mutex::new(VecDeque::new()),
            probe_spill_observed: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            table_ready: new_dependency(format!("join_build:{node_id}")),
        })
    }

    /// Like [`JoinBridge::new`] with the hash seed derived from the node id, so
    /// re-running the same plan reproduces row hashes and partition assignment.
    pub fn new_for_node(
        node_id: PlanNodeId,
        num_builders: usize,
        num_probers: usize,
    ) -> Arc<Self> {
        Self::new(node_id, num_builders, num_probers, derive_join_seed(node_id.0))
    }

    pub fn node_id(&self) -> PlanNodeId {
        self.node_id
    }

    /// The join-wide seed: build ingest, probe lookup and spill partitioning all
    /// hash with it, which is what keeps partition assignment consistent.
    pub fn hash_seed(&self) -> u64 {
        self.hash_seed
    }

    pub fn num_builders(&self) -> usize {
        self.num_builders
    }

    pub fn state(&self) -> BridgeState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// A build driver deposits its result. The last arriver gets the collected
    /// inputs back and must publish.
    pub(crate) fn arrive_builder(
        &self,
        container: RowContainer,
        spilled: Vec<SpilledPartition>,
        accepted_rows: usize,
        accepted_null_key_rows: u64,
    ) -> ExecResult<Option<BuildFinalizeInput>> {
        if self.is_cancelled() {
            return Err(ExecError::aborted("join bridge cancelled"));
        }
        let mut guard = self.rendezvous.lock().unwrap_or_else(|e| e.into_inner());
        if guard.arrived >= self.num_builders {
            return Err(ExecError::internal(
                "more build drivers arrived than registered",
            ));
        }
        guard.containers.push(container);
        guard.spilled.extend(spilled);
        guard.total_rows += accepted_rows;
        guard.null_key_rows += accepted_null_key_rows;
        guard.arrived += 1;
        debug!(
            "join build driver arrived: node_id={} arrived={}/{}",
            self.node_id, guard.arrived, self.num_builders
        );
        if guard.arrived == self.num_builders {
            let containers = std::mem::take(&mut guard.containers);
            let spilled = std::mem::take(&mut guard.spilled);
            Ok(Some(BuildFinalizeInput {
                containers,
                spilled,
                total_rows: guard.total_rows,
                has_null_key: guard.null_key_rows > 0,
            }))
        } else {
            Ok(None)
        }
    }

    /// Publish the finished artifact. At most one publication is allowed; a
    /// second one is an internal error.
    pub(crate) fn publish(&self, artifact: JoinArtifact) -> ExecResult<()> {
        {
            let mut guard = self.artifact.lock().unwrap_or_else(|e| e.into_inner());
            if guard.is_some() {
                return Err(ExecError::internal(format!(
                    "join bridge {} artifact published twice",
                    self.node_id
                )));
            }
            let next_state = if artifact.spilled.is_empty() {
                BridgeState::TablePublished
            } else {
                BridgeState::Spilled
            };
            {
                let mut unclaimed = self.unclaimed.lock().unwrap_or_else(|e| e.into_inner());
                for partition in &artifact.spilled {
                    unclaimed.push_back(partition.clone());
                }
            }
            *self.state.lock().unwrap_or_else(|e| e.into_inner()) = next_state;
            *guard = Some(Arc::new(artifact));
        }
        debug!(
            "join bridge published: node_id={} state={:?}",
            self.node_id,
            self.state()
        );
        self.table_ready.set_ready();
        Ok(())
    }

    /// Dependency that becomes ready at publication (or cancellation).
    pub fn table_dependency(&self) -> DependencyHandle {
        self.table_ready.clone()
    }

    pub fn artifact(&self) -> Option<Arc<JoinArtifact>> {
        self.artifact
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Block until published or cancelled. Used off the cooperative path.
    pub fn wait_artifact(&self, timeout: Duration) -> ExecResult<Arc<JoinArtifact>> {
        if !self.table_ready.wait_ready(timeout) {
            return Err(ExecError::internal(format!(
                "join bridge {} wait timed out",
                self.node_id
            )));
        }
        if self.is_cancelled() {
            return Err(ExecError::aborted("join bridge cancelled"));
        }
        self.artifact()
            .ok_or_else(|| ExecError::internal("join bridge ready without artifact"))
    }

    /// Claim one spilled partition for replay; each partition is handed out once.
    pub(crate) fn claim_spilled_partition(&self) -> Option<SpilledPartition> {
        let mut guard = self.unclaimed.lock().unwrap_or_else(|e| e.into_inner());
        guard.pop_front()
    }

    pub fn num_probers(&self) -> usize {
        self.num_probers
    }

    /// A probe driver finished its streamed input: merge its build-matched flags,
    /// probe totals and spilled probe partitions. The last arriver receives the
    /// merged state and performs unmatched-build emission plus partition replay.
    pub(crate) fn arrive_prober(
        &self,
        matched: Vec<bool>,
        probe_rows: u64,
        probe_saw_null_key: bool,
        probe_partitions: Vec<SpilledPartition>,
    ) -> ExecResult<Option<ProbeMerge>> {
        if self.is_cancelled() {
            return Err(ExecError::aborted("join bridge cancelled"));
        }
        let mut guard = self
            .probe_rendezvous
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if guard.arrived >= self.num_probers {
            return Err(ExecError::internal(
                "more probe drivers arrived than registered",
            ));
        }
        if guard.matched.is_empty() {
            guard.matched = matched;
        } else if !matched.is_empty() {
            if guard.matched.len() != matched.len() {
                return Err(ExecError::internal(
                    "probe drivers disagree on build row count",
                ));
            }
            for (merged, local) in guard.matched.iter_mut().zip(matched) {
                *merged |= local;
            }
        }
        guard.probe_rows += probe_rows;
        guard.probe_saw_null_key |= probe_saw_null_key;
        guard.probe_partitions.extend(probe_partitions);
        guard.arrived += 1;
        debug!(
            "join probe driver arrived: node_id={} arrived={}/{}",
            self.node_id, guard.arrived, self.num_probers
        );
        if guard.arrived == self.num_probers {
            Ok(Some(ProbeMerge {
                matched: std::mem::take(&mut guard.matched),
                probe_rows: guard.probe_rows,
                probe_saw_null_key: guard.probe_saw_null_key,
                probe_partitions: std::mem::take(&mut guard.probe_partitions),
            }))
        } else {
            Ok(None)
        }
    }

    /// Record that some probe driver spilled; suppresses dynamic filters.
    pub fn note_probe_spill(&self) {
        self.probe_spill_observed.store(true, Ordering::Release);
    }

    pub fn any_spill_observed(&self) -> bool {
        self.probe_spill_observed.load(Ordering::Acquire)
            || self
                .artifact()
                .map(|a| !a.spilled.is_empty())
                .unwrap_or(false)
    }

    pub fn mark_drained(&self) {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(*guard, BridgeState::TablePublished | BridgeState::Spilled) {
            *guard = BridgeState::Drained;
        }
    }

    pub fn close(&self) {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *guard = BridgeState::Closed;
    }

    /// Unblock all waiters with failure.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.table_ready.set_ready();
    }
}
