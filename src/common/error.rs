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
//! Typed execution errors.
//!
//! Responsibilities:
//! - Defines the error kinds surfaced by operators, the spiller, and the arbitrator.
//! - Carries a human-readable message next to the kind; the kind drives retry/abort decisions
//!   in the surrounding task, the message goes to logs and profiles.

use std::fmt;

use thiserror::Error;

/// Classification of execution failures. The kind is stable API; messages are not.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// Allocation denied by the memory arbitrator after reclaim attempts.
    OutOfMemory,
    /// The per-query spill byte cap was crossed.
    SpillLimitExceeded,
    /// The planner contract was violated (e.g. null-aware join with multiple keys).
    InvalidPlan,
    /// The task was externally cancelled.
    Aborted,
    /// An internal invariant was broken.
    Internal,
    /// Spill file I/O failed.
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::OutOfMemory => "OUT_OF_MEMORY",
            ErrorKind::SpillLimitExceeded => "SPILL_LIMIT_EXCEEDED",
            ErrorKind::InvalidPlan => "INVALID_PLAN",
            ErrorKind::Aborted => "ABORTED",
            ErrorKind::Internal => "INTERNAL",
            ErrorKind::Io => "IO",
        };
        write!(f, "{s}")
    }
}

#[derive(Clone, Debug, Error, PartialEq)]
#[error("{kind}: {message}")]
pub struct ExecError {
    pub kind: ErrorKind,
    pub message: String,
}

pub type ExecResult<T> = Result<T, ExecError>;

impl ExecError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn out_of_memory(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::OutOfMemory, message)
    }

    pub fn spill_limit_exceeded(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SpillLimitExceeded, message)
    }

    pub fn invalid_plan(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidPlan, message)
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Aborted, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_includes_kind_and_message() {
        let err = ExecError::invalid_plan("null-aware join requires exactly one key");
        assert_eq!(
            err.to_string(),
            "INVALID_PLAN: null-aware join requires exactly one key"
        );
        assert_eq!(err.kind(), ErrorKind::InvalidPlan);
    }
}
