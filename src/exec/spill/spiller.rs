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
//! Partitioned join spiller.
//!
//! Rows are assigned to `1 << partition_bits` partitions from the key-hash bits
//! `[start_bit + level * partition_bits, ...)`; the window moves at each
//! recursion level so the same row redistributes at deeper levels. Partition
//! files are deleted when the last handle drops.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;

use crate::common::error::{ExecError, ExecResult};
use crate::common::logging::{debug, warn};
use crate::exec::spill::SpillConfig;
use crate::exec::spill::block_manager::{
    BLOCK_HEADER_LEN, BlockHeader, BlockMeta, MESSAGE_INDEX_ENTRY_LEN, MessageIndexEntry,
    write_block_header, write_block_index,
};
use crate::exec::spill::dir_manager::DirManager;
use crate::exec::spill::ipc_serde::{EncodedMessage, IpcSerde, schema_hash};
use crate::exec::spill::spill_stream::SpillStream;

static NEXT_SPILL_FILE_ID: AtomicU64 = AtomicU64::new(0);

/// One written spill block file; the file is removed from disk on drop.
#[derive(Debug)]
pub struct SpillFile {
    pub path: PathBuf,
    pub meta: BlockMeta,
    pub bytes: u64,
    pub rows: u64,
}

impl Drop for SpillFile {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    "remove spill file {} failed: {}",
                    self.path.display(),
                    err
                );
            }
        }
    }
}

/// The on-disk picture of one spilled partition at one level.
#[derive(Clone, Debug)]
pub struct SpilledPartition {
    pub partition: u32,
    pub level: u16,
    pub files: Vec<Arc<SpillFile>>,
}

impl SpilledPartition {
    pub fn rows(&self) -> u64 {
        self.files.iter().map(|f| f.rows).sum()
    }

    pub fn bytes(&self) -> u64 {
        self.files.iter().map(|f| f.bytes).sum()
    }
}

struct PartitionWriteState {
    files: Vec<Arc<SpillFile>>,
    rows: u64,
    bytes: u64,
    active: bool,
}

/// Per-operator spiller writing at one recursion level.
pub struct JoinSpiller {
    config: SpillConfig,
    dir_manager: Arc<DirManager>,
    ipc: IpcSerde,
    level: u16,
    partitions: HashMap<u32, PartitionWriteState>,
    global_spilled_bytes: Arc<AtomicI64>,
}

impl JoinSpiller {
    pub fn new(
        config: SpillConfig,
        level: u16,
        global_spilled_bytes: Arc<AtomicI64>,
    ) -> ExecResult<Self> {
        if !bit_window_fits(&config, level) {
            return Err(ExecError::invalid_plan(format!(
                "spill bit window for level {level} overlaps the end of the 64-bit hash \
                 (start_bit={} partition_bits={})",
                config.start_partition_bit, config.partition_bits
            )));
        }
        let dir_manager = Arc::new(DirManager::new(
            config.local_dirs.clone(),
            config.dir_max_bytes,
        )?);
        let ipc = IpcSerde::new(config.codec)?;
        Ok(Self {
            config,
            dir_manager,
            ipc,
            level,
            partitions: HashMap::new(),
            global_spilled_bytes,
        })
    }

    pub fn config(&self) -> &SpillConfig {
        &self.config
    }

    pub fn level(&self) -> u16 {
        self.level
    }

    pub fn partition_count(&self) -> u32 {
        self.config.partition_count()
    }

    /// Partition index for a key hash at this spiller's level.
    pub fn partition_index(&self, hash: u64) -> u32 {
        partition_index_at(&self.config, self.level, hash)
    }

    /// Whether one more recursion level is possible: the level cap allows it and
    /// the next bit window still fits in the hash.
    pub fn can_recurse(&self) -> bool {
        let next = self.level + 1;
        if self.config.max_spill_level >= 0 && i32::from(next) > self.config.max_spill_level {
            return false;
        }
        bit_window_fits(&self.config, next)
    }

    pub fn spilled_partition_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .partitions
            .iter()
            .filter(|(_, state)| !state.files.is_empty())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn has_spilled(&self) -> bool {
        self.partitions.values().any(|state| !state.files.is_empty())
    }

    pub fn file_count(&self) -> usize {
        self.partitions.values().map(|state| state.files.len()).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.partitions.values().map(|state| state.bytes).sum()
    }

    /// Serialize `batches` as partition `partition`. Each call writes one or more
    /// new files, rolling when a file would cross `max_file_size`.
    pub fn spill_partition(
        &mut self,
        partition: u32,
        schema: &SchemaRef,
        batches: &[RecordBatch],
    ) -> ExecResult<()> {
        if partition >= self.partition_count() {
            return Err(ExecError::internal(format!(
                "spill partition {partition} out of range (count={})",
                self.partition_count()
            )));
        }
        self.check_byte_cap()?;

        let state = self.partitions.entry(partition).or_insert_with(|| {
            PartitionWriteState {
                files: Vec::new(),
                rows: 0,
                bytes: 0,
                active: false,
            }
        });
        if state.active {
            return Err(ExecError::internal(format!(
                "partition {partition} already has an active spill"
            )));
        }
        state.active = true;
        let result = Self::write_partition_files(
            &self.config,
            &self.dir_manager,
            &self.ipc,
            self.level,
            partition,
            schema,
            batches,
        );
        let state = self
            .partitions
            .get_mut(&partition)
            .ok_or_else(|| ExecError::internal("spill partition state missing"))?;
        state.active = false;
        let files = result?;

        let mut added_bytes = 0u64;
        for file in files {
            added_bytes = added_bytes.saturating_add(file.bytes);
            state.rows = state.rows.saturating_add(file.rows);
            state.bytes = state.bytes.saturating_add(file.bytes);
            state.files.push(Arc::new(file));
        }
        self.global_spilled_bytes
            .fetch_add(i64::try_from(added_bytes).unwrap_or(i64::MAX), Ordering::AcqRel);
        debug!(
            "spilled partition: level={} partition={} bytes={} total_files={}",
            self.level,
            partition,
            added_bytes,
            self.partitions
                .get(&partition)
                .map(|s| s.files.len())
                .unwrap_or(0)
        );
        Ok(())
    }

    /// The finished on-disk picture, consuming the write state.
    pub fn take_spilled_partitions(&mut self) -> Vec<SpilledPartition> {
        let mut out: Vec<SpilledPartition> = self
            .partitions
            .drain()
            .filter(|(_, state)| !state.files.is_empty())
            .map(|(partition, state)| SpilledPartition {
                partition,
                level: self.level,
                files: state.files,
            })
            .collect();
        out.sort_by_key(|p| p.partition);
        out
    }

    fn check_byte_cap(&self) -> ExecResult<()> {
        if self.config.max_spill_bytes == 0 {
            return Ok(());
        }
        let used = self.global_spilled_bytes.load(Ordering::Acquire).max(0) as u64;
        if used >= self.config.max_spill_bytes {
            return Err(ExecError::spill_limit_exceeded(format!(
                "query spilled {used} bytes, cap is {}",
                self.config.max_spill_bytes
            )));
        }
        Ok(())
    }

    fn write_partition_files(
        config: &SpillConfig,
        dir_manager: &Arc<DirManager>,
        ipc: &IpcSerde,
        level: u16,
        partition: u32,
        schema: &SchemaRef,
        batches: &[RecordBatch],
    ) -> ExecResult<Vec<SpillFile>> {
        let mut files = Vec::new();
        let mut writer: Option<OpenBlock> = None;

        for batch in batches {
            if batch.num_rows() == 0 {
                continue;
            }
            let encoded = ipc.encode_record_batch(batch)?;
            let roll = writer
                .as_ref()
                .map(|w| {
                    config.max_file_size > 0
                        && w.estimated_bytes + encoded.bytes.len() as u64 > config.max_file_size
                        && !w.index.is_empty()
                })
                .unwrap_or(false);
            if roll {
                if let Some(w) = writer.take() {
                    files.push(w.finish()?);
                }
            }
            if writer.is_none() {
                writer = Some(OpenBlock::create(
                    dir_manager,
                    ipc,
                    level,
                    partition,
                    schema,
                    config.write_buffer_size,
                )?);
            }
            let w = writer
                .as_mut()
                .ok_or_else(|| ExecError::internal("spill block writer missing"))?;
            w.append(&encoded)?;
        }
        if let Some(w) = writer.take() {
            files.push(w.finish()?);
        }
        Ok(files)
    }
}

struct OpenBlock {
    path: PathBuf,
    writer: BufWriter<File>,
    header: BlockHeader,
    index: Vec<MessageIndexEntry>,
    estimated_bytes: u64,
    rows: u64,
    offset: u64,
}

impl OpenBlock {
    fn create(
        dir_manager: &Arc<DirManager>,
        ipc: &IpcSerde,
        level: u16,
        partition: u32,
        schema: &SchemaRef,
        write_buffer_size: usize,
    ) -> ExecResult<Self> {
        let (path, file) = create_block_file(dir_manager)?;
        let mut writer = BufWriter::with_capacity(write_buffer_size.max(4096), file);
        let header = BlockHeader::new(
            ipc.codec(),
            level,
            partition,
            schema_hash(schema.as_ref()),
        );
        write_block_header(&mut writer, &header)?;
        Ok(Self {
            path,
            writer,
            header,
            index: Vec::new(),
            estimated_bytes: BLOCK_HEADER_LEN as u64,
            rows: 0,
            offset: BLOCK_HEADER_LEN as u64,
        })
    }

    fn append(&mut self, encoded: &EncodedMessage) -> ExecResult<()> {
        self.writer
            .write_all(&encoded.bytes)
            .map_err(|e| ExecError::io(format!("write spill message failed: {e}")))?;
        self.index.push(MessageIndexEntry {
            offset: self.offset,
            length: encoded.bytes.len() as u64,
            num_rows: encoded.num_rows,
            num_cols: encoded.num_cols,
            flags: 0,
        });
        self.offset += encoded.bytes.len() as u64;
        self.estimated_bytes += encoded.bytes.len() as u64;
        self.rows += u64::from(encoded.num_rows);
        Ok(())
    }

    fn finish(mut self) -> ExecResult<SpillFile> {
        let index_offset = self.offset;
        write_block_index(&mut self.writer, &self.index)?;
        let index_length = (self.index.len() * MESSAGE_INDEX_ENTRY_LEN) as u64;

        self.header.num_messages = self.index.len() as u32;
        self.header.index_offset = index_offset;
        self.header.index_length = index_length;

        self.writer
            .flush()
            .map_err(|e| ExecError::io(format!("flush spill file failed: {e}")))?;
        let mut file = self
            .writer
            .into_inner()
            .map_err(|e| ExecError::io(format!("flush spill file failed: {e}")))?;
        file.seek(SeekFrom::Start(0))
            .map_err(|e| ExecError::io(format!("seek spill header failed: {e}")))?;
        write_block_header(&mut file, &self.header)?;
        file.flush()
            .map_err(|e| ExecError::io(format!("flush spill file failed: {e}")))?;

        Ok(SpillFile {
            path: self.path,
            meta: BlockMeta {
                header: self.header,
                index: self.index,
            },
            bytes: self.estimated_bytes + index_length,
            rows: self.rows,
        })
    }
}

fn create_block_file(dir_manager: &Arc<DirManager>) -> ExecResult<(PathBuf, File)> {
    let mut attempts = 0;
    loop {
        let dir = dir_manager.next_dir();
        let id = NEXT_SPILL_FILE_ID.fetch_add(1, Ordering::AcqRel);
        let filename = format!("spill_{:x}_{:x}.blk", std::process::id(), id);
        let path = dir.join(filename);
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path);
        match file {
            Ok(file) => return Ok((path, file)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists && attempts < 3 => {
                attempts += 1;
                continue;
            }
            Err(err) => {
                return Err(ExecError::io(format!(
                    "create spill file {} failed: {err}",
                    path.display()
                )));
            }
        }
    }
}

/// Open readers over a spilled partition's files in write order.
pub fn open_partition_streams(
    spilled: &SpilledPartition,
    schema: SchemaRef,
) -> ExecResult<Vec<SpillStream>> {
    let mut streams = Vec::with_capacity(spilled.files.len());
    for file in &spilled.files {
        streams.push(SpillStream::open(&file.path, schema.clone())?);
    }
    Ok(streams)
}

pub(crate) fn bit_window_fits(config: &SpillConfig, level: u16) -> bool {
    let shift = u32::from(config.start_partition_bit)
        + u32::from(level) * u32::from(config.partition_bits);
    shift + u32::from(config.partition_bits) <= 64
}

pub(crate) fn partition_index_at(config: &SpillConfig, level: u16, hash: u64) -> u32 {
    let shift = u32::from(config.start_partition_bit)
        + u32::from(level) * u32::from(config.partition_bits);
    let mask = (1u64 << config.partition_bits) - 1;
    ((hash >> shift) & mask) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{ArrayRef, Int64Array};
    use arrow::datatypes::{DataType, Field, Schema};
    use tempfile::tempdir;

    fn test_config(dir: PathBuf) -> SpillConfig {
        SpillConfig {
            local_dirs: vec![dir],
            dir_max_bytes: 0,
            codec: crate::exec::spill::ipc_serde::SpillCodec::None,
            start_partition_bit: 32,
            partition_bits: 2,
            max_file_size: 0,
            max_spill_level: 2,
            max_spill_bytes: 0,
            write_buffer_size: 4096,
        }
    }

    fn batch(values: Vec<i64>) -> (SchemaRef, RecordBatch) {
        let schema = Arc::new(Schema::new(vec![Field::new("k", DataType::Int64, false)]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![Arc::new(Int64Array::from(values)) as ArrayRef],
        )
        .unwrap();
        (schema, batch)
    }

    #[test]
    fn same_hash_same_partition_within_level() {
        let temp = tempdir().unwrap();
        let config = test_config(temp.path().to_path_buf());
        let hash = 0xdead_beef_dead_beefu64;
        assert_eq!(
            partition_index_at(&config, 0, hash),
            partition_index_at(&config, 0, hash)
        );
        // The window moves across levels, so deeper levels see different bits.
        let shift0 = (hash >> 32) & 0b11;
        let shift1 = (hash >> 34) & 0b11;
        assert_eq!(partition_index_at(&config, 0, hash) as u64, shift0);
        assert_eq!(partition_index_at(&config, 1, hash) as u64, shift1);
    }

    #[test]
    fn spill_and_restore_round_trip() {
        let temp = tempdir().unwrap();
        let config = test_config(temp.path().to_path_buf());
        let global = Arc::new(AtomicI64::new(0));
        let mut spiller = JoinSpiller::new(config, 0, Arc::clone(&global)).unwrap();

        let (schema, b) = batch(vec![1, 2, 3, 4, 5]);
        spiller.spill_partition(1, &schema, &[b]).unwrap();
        assert!(spiller.has_spilled());
        assert_eq!(spiller.spilled_partition_ids(), vec![1]);
        assert!(global.load(Ordering::Acquire) > 0);

        let spilled = spiller.take_spilled_partitions();
        assert_eq!(spilled.len(), 1);
        assert_eq!(spilled[0].rows(), 5);

        let mut streams = open_partition_streams(&spilled[0], schema).unwrap();
        let restored = streams[0].next_batch().unwrap().unwrap();
        assert_eq!(restored.num_rows(), 5);
        assert!(streams[0].next_batch().unwrap().is_none());
    }

    #[test]
    fn files_deleted_on_drop() {
        let temp = tempdir().unwrap();
        let config = test_config(temp.path().to_path_buf());
        let mut spiller =
            JoinSpiller::new(config, 0, Arc::new(AtomicI64::new(0))).unwrap();
        let (schema, b) = batch(vec![1, 2]);
        spiller.spill_partition(0, &schema, &[b]).unwrap();
        let spilled = spiller.take_spilled_partitions();
        let path = spilled[0].files[0].path.clone();
        assert!(path.exists());
        drop(spilled);
        assert!(!path.exists());
    }

    #[test]
    fn byte_cap_fails_subsequent_spills() {
        let temp = tempdir().unwrap();
        let mut config = test_config(temp.path().to_path_buf());
        config.max_spill_bytes = 1;
        let global = Arc::new(AtomicI64::new(0));
        let mut spiller = JoinSpiller::new(config, 0, Arc::clone(&global)).unwrap();

        let (schema, b) = batch(vec![1, 2, 3]);
        // First spill is under the cap, crossing it.
        spiller.spill_partition(0, &schema, &[b.clone()]).unwrap();
        let err = spiller.spill_partition(1, &schema, &[b]).unwrap_err();
        assert_eq!(
            err.kind(),
            crate::common::error::ErrorKind::SpillLimitExceeded
        );
    }

    #[test]
    fn max_file_size_rolls_files() {
        let temp = tempdir().unwrap();
        let mut config = test_config(temp.path().to_path_buf());
        config.max_file_size = 1;
        let mut spiller =
            JoinSpiller::new(config, 0, Arc::new(AtomicI64::new(0))).unwrap();
        let (schema, b1) = batch(vec![1, 2, 3]);
        let (_, b2) = batch(vec![4, 5, 6]);
        spiller.spill_partition(0, &schema, &[b1, b2]).unwrap();
        let spilled = spiller.take_spilled_partitions();
        assert_eq!(spilled[0].files.len(), 2);
    }

    #[test]
    fn recursion_respects_level_cap_and_bit_window() {
        let temp = tempdir().unwrap();
        let config = test_config(temp.path().to_path_buf());
        let spiller_l2 =
            JoinSpiller::new(config.clone(), 2, Arc::new(AtomicI64::new(0))).unwrap();
        // max_spill_level = 2, so level 2 cannot recurse to 3.
        assert!(!spiller_l2.can_recurse());

        let mut wide = config;
        wide.max_spill_level = -1;
        wide.start_partition_bit = 60;
        let spiller = JoinSpiller::new(wide.clone(), 1, Arc::new(AtomicI64::new(0))).unwrap();
        // Window for level 2 would be [64, 66): off the end of the hash.
        assert!(!spiller.can_recurse());
        assert!(JoinSpiller::new(wide, 2, Arc::new(AtomicI64::new(0))).is_err());
    }
}
