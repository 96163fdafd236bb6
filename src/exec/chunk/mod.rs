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
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use arrow::array::{ArrayRef, RecordBatch};
use arrow::datatypes::{Schema, SchemaRef};

use crate::common::error::{ExecError, ExecResult};
use crate::common::ids::SlotId;
use crate::runtime::mem_tracker::MemTracker;

/// A chunk of rows: a wrapper around an arrow RecordBatch with stable slot-id
/// addressing and transferable memory accounting.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub batch: RecordBatch,
    slot_id_to_index: Arc<HashMap<SlotId, usize>>,
    accounting: Option<Arc<ChunkAccounting>>,
}

impl Chunk {
    pub fn try_new(batch: RecordBatch) -> ExecResult<Self> {
        let slot_id_to_index = slot_id_to_index_from_schema(batch.schema().as_ref())?;
        Ok(Self {
            batch,
            slot_id_to_index: Arc::new(slot_id_to_index),
            accounting: None,
        })
    }

    pub fn new(batch: RecordBatch) -> Self {
        match Self::try_new(batch) {
            Ok(v) => v,
            Err(e) => panic!("{e}"),
        }
    }

    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    pub fn len(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.num_rows() == 0
    }

    pub fn columns(&self) -> &[ArrayRef] {
        self.batch.columns()
    }

    pub fn column(&self, index: usize) -> ExecResult<ArrayRef> {
        self.batch
            .columns()
            .get(index)
            .cloned()
            .ok_or_else(|| {
                ExecError::internal(format!(
                    "column index {index} out of bounds (num_columns={})",
                    self.batch.num_columns()
                ))
            })
    }

    pub fn slot_id_to_index(&self) -> &HashMap<SlotId, usize> {
        &self.slot_id_to_index
    }

    pub fn column_by_slot_id(&self, slot_id: SlotId) -> ExecResult<ArrayRef> {
        let idx = self
            .slot_id_to_index
            .get(&slot_id)
            .copied()
            .ok_or_else(|| {
                ExecError::internal(format!(
                    "slot id {} not found in chunk (num_columns={})",
                    slot_id,
                    self.batch.num_columns()
                ))
            })?;
        self.column(idx)
    }

    pub fn slice(&self, offset: usize, length: usize) -> Self {
        let mut out = Self {
            batch: self.batch.slice(offset, length),
            slot_id_to_index: Arc::clone(&self.slot_id_to_index),
            accounting: None,
        };
        if let Some(accounting) = self.accounting.as_ref() {
            let tracker = accounting.tracker();
            out.transfer_to(&tracker);
        }
        out
    }

    pub fn estimated_bytes(&self) -> usize {
        self.batch.get_array_memory_size()
    }

    /// Account this chunk's bytes against `tracker`; a later call moves the
    /// accounting to the new holder.
    pub fn transfer_to(&mut self, tracker: &Arc<MemTracker>) {
        if let Some(accounting) = self.accounting.as_ref() {
            accounting.transfer_to(tracker);
            return;
        }
        let bytes = i64::try_from(self.estimated_bytes()).unwrap_or(i64::MAX);
        if bytes <= 0 {
            return;
        }
        self.accounting = Some(Arc::new(ChunkAccounting::new(bytes, tracker)));
    }
}

#[derive(Debug)]
struct ChunkAccounting {
    bytes: i64,
    tracker: Mutex<Arc<MemTracker>>,
}

impl ChunkAccounting {
    fn new(bytes: i64, tracker: &Arc<MemTracker>) -> Self {
        tracker.consume(bytes);
        Self {
            bytes,
            tracker: Mutex::new(Arc::clone(tracker)),
        }
    }

    fn tracker(&self) -> Arc<MemTracker> {
        Arc::clone(&self.tracker.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn transfer_to(&self, tracker: &Arc<MemTracker>) {
        let mut guard = self.tracker.lock().unwrap_or_else(|e| e.into_inner());
        if Arc::ptr_eq(&guard, tracker) {
            return;
        }
        guard.release(self.bytes);
        tracker.consume(self.bytes);
        *guard = Arc::clone(tracker);
    }
}

impl Drop for ChunkAccounting {
    fn drop(&mut self) {
        let guard = self.tracker.lock().unwrap_or_else(|e| e.into_inner());
        guard.release(self.bytes);
    }
}

pub const FIELD_META_SLOT_ID: &str = "vexec.slot_id";

pub fn field_with_slot_id(
    field: arrow::datatypes::Field,
    slot_id: SlotId,
) -> arrow::datatypes::Field {
    let mut meta = field.metadata().clone();
    meta.insert(FIELD_META_SLOT_ID.to_string(), slot_id.to_string());
    field.with_metadata(meta)
}

pub fn field_slot_id(field: &arrow::datatypes::Field) -> ExecResult<Option<SlotId>> {
    let Some(v) = field.metadata().get(FIELD_META_SLOT_ID) else {
        return Ok(None);
    };
    let slot_id = v.parse::<SlotId>()?;
    Ok(Some(slot_id))
}

fn slot_id_to_index_from_schema(schema: &Schema) -> ExecResult<HashMap<SlotId, usize>> {
    let mut map = HashMap::with_capacity(schema.fields().len());
    for (idx, field) in schema.fields().iter().enumerate() {
        let Some(slot_id) = field_slot_id(field)? else {
            continue;
        };
        if map.insert(slot_id, idx).is_some() {
            return Err(ExecError::internal(format!(
                "duplicate slot id {slot_id} in chunk schema"
            )));
        }
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int32Array;
    use arrow::datatypes::{DataType, Field};

    fn test_chunk() -> Chunk {
        let schema = Arc::new(Schema::new(vec![field_with_slot_id(
            Field::new("k", DataType::Int32, false),
            SlotId::new(7),
        )]));
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(Int32Array::from(vec![1, 2, 3])) as ArrayRef],
        )
        .unwrap();
        Chunk::new(batch)
    }

    #[test]
    fn slot_id_lookup() {
        let chunk = test_chunk();
        assert_eq!(chunk.len(), 3);
        let col = chunk.column_by_slot_id(SlotId::new(7)).unwrap();
        assert_eq!(col.len(), 3);
        assert!(chunk.column_by_slot_id(SlotId::new(8)).is_err());
    }

    #[test]
    fn accounting_follows_holder() {
        let a = MemTracker::new_root("a");
        let b = MemTracker::new_root("b");
        let mut chunk = test_chunk();
        chunk.transfer_to(&a);
        assert!(a.current() > 0);
        chunk.transfer_to(&b);
        assert_eq!(a.current(), 0);
        assert!(b.current() > 0);
        drop(chunk);
        assert_eq!(b.current(), 0);
    }
}
