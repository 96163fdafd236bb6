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
//! Hash-join operator pair.
//!
//! Responsibilities:
//! - Exposes the build-sink and probe-processor factories and the join bridge
//!   that connects the two sides of one join node.
//! - Everything below is driven by the cooperative operator contract; cross-driver
//!   synchronization goes through the bridge only.

mod build_sink;
mod join_bridge;
mod join_hash_table;
mod probe_core;
mod probe_processor;
pub(crate) mod row_container;

pub use build_sink::HashJoinBuildSinkFactory;
pub use join_bridge::{BridgeState, JoinArtifact, JoinBridge};
pub use probe_processor::{DynamicFilterTarget, HashJoinProbeProcessorFactory};
