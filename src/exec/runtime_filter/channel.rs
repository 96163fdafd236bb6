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
//! One-shot dynamic filter publication channel.
//!
//! Responsibilities:
//! - Accepts at most one filter per (scan node, column) from the probe side.
//! - Consumers poll at driver start and between batches; a version counter
//!   makes re-polling cheap.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::common::error::{ExecError, ExecResult};
use crate::common::ids::PlanNodeId;
use crate::common::logging::debug;
use crate::exec::runtime_filter::DynamicFilter;

#[derive(Default)]
struct ChannelStore {
    filters: HashMap<(PlanNodeId, usize), Arc<DynamicFilter>>,
}

/// Shared by the probe operators (producers) and scans (consumers) of one query.
pub struct DynamicFilterChannel {
    store: RwLock<ChannelStore>,
    version: AtomicU64,
    produced: AtomicU64,
    accepted: Mutex<HashMap<(PlanNodeId, usize), ()>>,
}

impl DynamicFilterChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            store: RwLock::new(ChannelStore::default()),
            version: AtomicU64::new(0),
            produced: AtomicU64::new(0),
            accepted: Mutex::new(HashMap::new()),
        })
    }

    /// Publish a filter for `(scan_node, column)`. A second publication for the
    /// same target is an internal error.
    pub fn publish(
        &self,
        scan_node: PlanNodeId,
        column: usize,
        filter: DynamicFilter,
    ) -> ExecResult<()> {
        let mut guard = self.store.write().unwrap_or_else(|e| e.into_inner());
        if guard.filters.contains_key(&(scan_node, column)) {
            return Err(ExecError::internal(format!(
                "dynamic filter for scan {scan_node} column {column} published twice"
            )));
        }
        debug!(
            "dynamic filter published: scan={} column={} exact={} range=[{}, {}]",
            scan_node,
            column,
            filter.is_exact(),
            filter.range.min,
            filter.range.max
        );
        guard.filters.insert((scan_node, column), Arc::new(filter));
        drop(guard);
        self.version.fetch_add(1, Ordering::AcqRel);
        self.produced.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Poll for the filter; None while not yet published.
    pub fn poll(&self, scan_node: PlanNodeId, column: usize) -> Option<Arc<DynamicFilter>> {
        let guard = self.store.read().unwrap_or_else(|e| e.into_inner());
        guard.filters.get(&(scan_node, column)).map(Arc::clone)
    }

    /// Record that a consumer adopted the filter; idempotent per target.
    pub fn mark_accepted(&self, scan_node: PlanNodeId, column: usize) {
        let mut guard = self.accepted.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert((scan_node, column), ());
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn produced_count(&self) -> u64 {
        self.produced.load(Ordering::Acquire)
    }

    pub fn accepted_count(&self) -> u64 {
        let guard = self.accepted.lock().unwrap_or_else(|e| e.into_inner());
        guard.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::runtime_filter::min_max::ValueRange;

    fn filter(min: i64, max: i64) -> DynamicFilter {
        DynamicFilter {
            range: ValueRange { min, max },
            distinct: None,
        }
    }

    #[test]
    fn publish_then_poll() {
        let channel = DynamicFilterChannel::new();
        let scan = PlanNodeId::new(7);
        assert!(channel.poll(scan, 0).is_none());
        channel.publish(scan, 0, filter(1, 10)).unwrap();
        let polled = channel.poll(scan, 0).unwrap();
        assert_eq!(polled.range, ValueRange { min: 1, max: 10 });
        assert_eq!(channel.produced_count(), 1);
    }

    #[test]
    fn double_publish_is_internal_error() {
        let channel = DynamicFilterChannel::new();
        let scan = PlanNodeId::new(7);
        channel.publish(scan, 0, filter(1, 10)).unwrap();
        let err = channel.publish(scan, 0, filter(1, 10)).unwrap_err();
        assert_eq!(err.kind(), crate::common::error::ErrorKind::Internal);
    }

    #[test]
    fn accepted_is_idempotent() {
        let channel = DynamicFilterChannel::new();
        let scan = PlanNodeId::new(7);
        channel.publish(scan, 0, filter(1, 10)).unwrap();
        channel.mark_accepted(scan, 0);
        channel.mark_accepted(scan, 0);
        assert_eq!(channel.accepted_count(), 1);
    }
}
