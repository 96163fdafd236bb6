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
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static CONFIG: OnceLock<VexecConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static VexecConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = path.as_ref().to_path_buf();
    let cfg = VexecConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn init_from_env_or_default() -> Result<&'static VexecConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = config_path_from_env_or_default()?;
    let cfg = VexecConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn config() -> Result<&'static VexecConfig> {
    init_from_env_or_default()
}

fn config_path_from_env_or_default() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("VEXEC_CONFIG") {
        if !p.trim().is_empty() {
            return Ok(PathBuf::from(p));
        }
    }

    let candidates = [PathBuf::from("vexec.toml")];
    for p in candidates {
        if p.exists() {
            return Ok(p);
        }
    }

    Err(anyhow!(
        "missing config file: set $VEXEC_CONFIG or create ./vexec.toml"
    ))
}

#[derive(Clone, Deserialize)]
pub struct VexecConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression.
    /// If set, this takes precedence over `log_level`.
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub spill: SpillStorageConfig,
}

#[derive(Clone, Deserialize, Default)]
pub struct RuntimeConfig {
    /// Worker threads for background spill writes; 0 means one per core.
    #[serde(default)]
    pub spill_io_threads: usize,

    /// Bounded queue length for the spill I/O executor; 0 means the default.
    #[serde(default)]
    pub spill_io_queue_size: usize,

    /// Chunks a probe operator may buffer while its build side is not ready.
    #[serde(default)]
    pub operator_buffer_chunks: usize,
}

#[derive(Clone, Deserialize, Default)]
pub struct SpillStorageConfig {
    #[serde(default)]
    pub local_dirs: Vec<String>,

    /// Soft cap per spill directory; 0 means unlimited.
    #[serde(default)]
    pub dir_max_bytes: u64,

    /// Maximum size of one spill block file before rolling to a new one.
    #[serde(default)]
    pub block_size_bytes: u64,

    /// IPC compression codec for spill blocks: none, lz4 or zstd.
    #[serde(default)]
    pub ipc_compression: String,
}

impl VexecConfig {
    fn load_from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        let cfg: VexecConfig = toml::from_str(&text)
            .with_context(|| format!("parse config file {}", path.display()))?;
        Ok(cfg)
    }

    pub fn effective_log_filter(&self) -> String {
        self.log_filter
            .clone()
            .unwrap_or_else(|| self.log_level.clone())
    }
}
