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
use crate::common::app_config::config as vexec_app_config;

pub(crate) fn spill_io_threads() -> usize {
    vexec_app_config()
        .ok()
        .map(|c| {
            if c.runtime.spill_io_threads > 0 {
                c.runtime.spill_io_threads
            } else {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            }
        })
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
}

pub(crate) fn spill_io_queue_size() -> usize {
    vexec_app_config()
        .ok()
        .map(|c| {
            if c.runtime.spill_io_queue_size == 0 {
                1024
            } else {
                c.runtime.spill_io_queue_size
            }
        })
        .unwrap_or(1024)
}

pub(crate) fn operator_buffer_chunks() -> usize {
    vexec_app_config()
        .ok()
        .map(|c| {
            if c.runtime.operator_buffer_chunks == 0 {
                8
            } else {
                c.runtime.operator_buffer_chunks
            }
        })
        .unwrap_or(8)
}

pub(crate) fn spill_local_dirs() -> Vec<String> {
    let configured = vexec_app_config()
        .ok()
        .map(|c| c.spill.local_dirs.clone())
        .unwrap_or_default();
    if configured.is_empty() {
        let mut default_dir = std::env::temp_dir();
        default_dir.push("vexec-spill");
        vec![default_dir.to_string_lossy().into_owned()]
    } else {
        configured
    }
}

pub(crate) fn spill_dir_max_bytes() -> u64 {
    vexec_app_config()
        .ok()
        .map(|c| c.spill.dir_max_bytes)
        .unwrap_or(0)
}

pub(crate) fn spill_block_size_bytes() -> u64 {
    let configured = vexec_app_config()
        .ok()
        .map(|c| c.spill.block_size_bytes)
        .unwrap_or(0);
    if configured == 0 {
        134_217_728
    } else {
        configured
    }
}

pub(crate) fn spill_ipc_compression() -> String {
    let configured = vexec_app_config()
        .ok()
        .map(|c| c.spill.ipc_compression.clone())
        .unwrap_or_default();
    if configured.is_empty() {
        "lz4".to_string()
    } else {
        configured
    }
}
