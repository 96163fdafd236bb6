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
//! Process logging setup.
//!
//! Operators emit single-line key=value events (`node_id=`, `driver_id=`,
//! `partition=` and so on), so the subscriber stays on the stock compact
//! formatter with file:line locations; interleaved driver output remains
//! greppable without a custom event format.

use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, fmt as tracing_fmt};

static INIT: OnceLock<()> = OnceLock::new();

pub fn init_with_level(level: &str) {
    INIT.get_or_init(|| {
        // The caller (via config) is responsible for per-target filters, e.g.
        // silencing verbose third-party crates.
        let env_filter = EnvFilter::new(level);

        // ANSI only when stderr is a terminal; redirected logs must stay clean.
        let use_ansi = atty::is(atty::Stream::Stderr);
        let _ = tracing_fmt()
            .compact()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_ansi(use_ansi)
            .with_target(false)
            .with_file(true)
            .with_line_number(true)
            .try_init();
    });
}

/// Initialize from the process config file's `log_filter`/`log_level`.
pub fn init_from_config() {
    let filter = crate::common::app_config::config()
        .map(|c| c.effective_log_filter())
        .unwrap_or_else(|_| "info".to_string());
    init_with_level(&filter);
}

pub fn init() {
    init_with_level("info");
}

pub use tracing::instrument;
pub use tracing::{debug, error, info, trace, warn};
