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
//! Core operator traits and blocking semantics.
//!
//! Responsibilities:
//! - Defines the processor execution contract and blocked-reason signaling.
//! - Drivers run operators cooperatively; when an operator cannot make progress
//!   it reports a [`BlockedReason`] instead of blocking the thread.

use std::sync::Arc;

use crate::common::error::ExecResult;
use crate::exec::chunk::Chunk;
use crate::exec::pipeline::dependency::DependencyHandle;
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::profile::OperatorProfiles;
use crate::runtime::runtime_state::RuntimeState;

/// Why a driver yielded instead of advancing an operator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlockedReason {
    /// Upstream currently has no data available.
    InputEmpty,
    /// Downstream cannot accept more output at the moment.
    OutputFull,
    /// Blocked on a dependency object (e.g. build side ready).
    Dependency(DependencyHandle),
}

/// Base operator contract implemented by source/processor/sink operators.
pub trait Operator: Send {
    fn name(&self) -> &str;

    fn set_mem_tracker(&mut self, tracker: Arc<MemTracker>) {
        let _ = tracker;
    }

    fn set_profiles(&mut self, profiles: OperatorProfiles) {
        let _ = profiles;
    }

    fn prepare(&mut self, state: &RuntimeState) -> ExecResult<()> {
        let _ = state;
        Ok(())
    }

    fn close(&mut self, state: &RuntimeState) -> ExecResult<()> {
        let _ = state;
        Ok(())
    }

    fn cancel(&mut self) {}

    fn is_finished(&self) -> bool {
        false
    }

    fn as_processor_mut(&mut self) -> Option<&mut dyn ProcessorOperator> {
        None
    }

    fn as_processor_ref(&self) -> Option<&dyn ProcessorOperator> {
        None
    }

    fn as_spillable_mut(&mut self) -> Option<&mut dyn crate::exec::spill::SpillableOperator> {
        None
    }
}

/// Extended operator contract for processor stages with push/pull semantics.
pub trait ProcessorOperator: Operator {
    fn need_input(&self) -> bool;

    fn has_output(&self) -> bool;

    fn push_chunk(&mut self, state: &RuntimeState, chunk: Chunk) -> ExecResult<()>;

    fn pull_chunk(&mut self, state: &RuntimeState) -> ExecResult<Option<Chunk>>;

    fn set_finishing(&mut self, state: &RuntimeState) -> ExecResult<()>;

    /// Dependency that must be ready before the operator can make progress.
    /// Used for build-side readiness.
    fn precondition_dependency(&self) -> Option<DependencyHandle> {
        None
    }
}

/// Factory creating one operator instance per driver.
pub trait OperatorFactory: Send + Sync {
    fn name(&self) -> &str;

    fn create(&self, degree_of_parallelism: i32, driver_id: i32) -> Box<dyn Operator>;

    fn is_sink(&self) -> bool {
        false
    }
}
