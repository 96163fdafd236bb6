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
//! Shared join-test harness: operator driving, a reference nested-loop join
//! with SQL three-valued logic, and multiset output comparison.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, Float64Array, Int32Array, Int64Array, StringArray,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;

use vexec::common::ids::SlotId;
use vexec::exec::chunk::{Chunk, field_with_slot_id};
use vexec::exec::expr::ExprArena;
use vexec::exec::node::join::{JoinSpec, JoinType, OutputColumn};
use vexec::exec::operators::hashjoin::{
    HashJoinBuildSinkFactory, HashJoinProbeProcessorFactory, JoinBridge,
};
use vexec::exec::pipeline::operator::{Operator, OperatorFactory};
use vexec::runtime::profile::{OperatorProfiles, RuntimeProfile};
use vexec::runtime::runtime_state::{QueryOptions, RuntimeState};

pub const TEST_SEED: u64 = 0x5eed_cafe;

// ---------------------------------------------------------------------------
// Schema and chunk builders
// ---------------------------------------------------------------------------

pub fn int64_schema(names: &[&str], first_slot: u32) -> SchemaRef {
    let fields = names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            field_with_slot_id(
                Field::new(*name, DataType::Int64, true),
                SlotId::new(first_slot + i as u32),
            )
        })
        .collect::<Vec<_>>();
    Arc::new(Schema::new(fields))
}

pub fn int64_chunk(schema: &SchemaRef, columns: Vec<Vec<Option<i64>>>) -> Chunk {
    let arrays: Vec<ArrayRef> = columns
        .into_iter()
        .map(|values| Arc::new(Int64Array::from(values)) as ArrayRef)
        .collect();
    Chunk::new(RecordBatch::try_new(schema.clone(), arrays).unwrap())
}

pub fn float64_schema(names: &[&str], first_slot: u32) -> SchemaRef {
    let fields = names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            field_with_slot_id(
                Field::new(*name, DataType::Float64, true),
                SlotId::new(first_slot + i as u32),
            )
        })
        .collect::<Vec<_>>();
    Arc::new(Schema::new(fields))
}

pub fn float64_chunk(schema: &SchemaRef, columns: Vec<Vec<Option<f64>>>) -> Chunk {
    let arrays: Vec<ArrayRef> = columns
        .into_iter()
        .map(|values| Arc::new(Float64Array::from(values)) as ArrayRef)
        .collect();
    Chunk::new(RecordBatch::try_new(schema.clone(), arrays).unwrap())
}

// ---------------------------------------------------------------------------
// Operator driving
// ---------------------------------------------------------------------------

pub struct JoinRun {
    pub output: Vec<RecordBatch>,
    pub probe_profile: RuntimeProfile,
    pub build_profiles: Vec<RuntimeProfile>,
    pub bridge: Arc<JoinBridge>,
}

pub struct JoinDriver {
    pub spec: Arc<JoinSpec>,
    pub arena: Arc<ExprArena>,
    pub options: QueryOptions,
    pub num_build_drivers: usize,
    /// Trigger a build-side spill after every build chunk.
    pub spill_build_input: bool,
    /// Trigger a probe-side spill before every pull during the finish phase.
    pub spill_probe_replay: bool,
}

impl JoinDriver {
    pub fn new(spec: JoinSpec, arena: ExprArena) -> Self {
        Self {
            spec: Arc::new(spec),
            arena: Arc::new(arena),
            options: QueryOptions::default(),
            num_build_drivers: 1,
            spill_build_input: false,
            spill_probe_replay: false,
        }
    }

    pub fn run(&self, build_batches: Vec<Chunk>, probe_batches: Vec<Chunk>) -> JoinRun {
        let state = RuntimeState::new(self.options.clone());
        let bridge = JoinBridge::new(
            self.spec.node_id,
            self.num_build_drivers,
            1,
            TEST_SEED,
        );
        let build_factory =
            HashJoinBuildSinkFactory::new(Arc::clone(&self.spec), Arc::clone(&bridge)).unwrap();
        let probe_factory = HashJoinProbeProcessorFactory::new(
            Arc::clone(&self.spec),
            Arc::clone(&self.arena),
            Arc::clone(&bridge),
        )
        .unwrap();

        let mut build_profiles = Vec::new();
        let mut build_ops: Vec<Box<dyn Operator>> = (0..self.num_build_drivers)
            .map(|driver| {
                let mut op = build_factory.create(self.num_build_drivers as i32, driver as i32);
                let profile = RuntimeProfile::new(format!("build-{driver}"));
                op.set_profiles(OperatorProfiles::new(profile.clone()));
                op.prepare(&state).unwrap();
                build_profiles.push(profile);
                op
            })
            .collect();

        let mut probe_op = probe_factory.create(1, 0);
        let probe_profile = RuntimeProfile::new("probe");
        probe_op.set_profiles(OperatorProfiles::new(probe_profile.clone()));
        probe_op.prepare(&state).unwrap();

        for (index, chunk) in build_batches.into_iter().enumerate() {
            let op = &mut build_ops[index % self.num_build_drivers];
            op.as_processor_mut()
                .unwrap()
                .push_chunk(&state, chunk)
                .unwrap();
            if self.spill_build_input {
                op.as_spillable_mut().unwrap().trigger_spill(&state).unwrap();
            }
        }
        for op in build_ops.iter_mut() {
            op.as_processor_mut().unwrap().set_finishing(&state).unwrap();
        }

        let mut output = Vec::new();
        for chunk in probe_batches {
            loop {
                let processor = probe_op.as_processor_mut().unwrap();
                if processor.need_input() {
                    break;
                }
                if !processor.has_output() {
                    break;
                }
                if let Some(out) = processor.pull_chunk(&state).unwrap() {
                    output.push(out.batch);
                }
            }
            probe_op
                .as_processor_mut()
                .unwrap()
                .push_chunk(&state, chunk)
                .unwrap();
        }
        probe_op
            .as_processor_mut()
            .unwrap()
            .set_finishing(&state)
            .unwrap();

        let mut guard = 0;
        loop {
            guard += 1;
            assert!(guard < 100_000, "join probe did not finish");
            if self.spill_probe_replay {
                probe_op.as_spillable_mut().unwrap().trigger_spill(&state).unwrap();
            }
            let out = probe_op
                .as_processor_mut()
                .unwrap()
                .pull_chunk(&state)
                .unwrap();
            match out {
                Some(chunk) => output.push(chunk.batch),
                None => {
                    if probe_op.is_finished() {
                        break;
                    }
                }
            }
        }
        probe_op.close(&state).unwrap();
        for op in build_ops.iter_mut() {
            op.close(&state).unwrap();
        }

        JoinRun {
            output,
            probe_profile,
            build_profiles,
            bridge,
        }
    }
}

// ---------------------------------------------------------------------------
// Reference engine
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Value {
    Int(i64),
    /// Canonicalized float bits: NaN payloads compare equal.
    Float(u64),
    Str(String),
    Bool(bool),
}

pub type Row = Vec<Option<Value>>;

pub type Residual<'a> = &'a dyn Fn(&Row, &Row) -> Option<bool>;

pub struct RefJoin<'a> {
    pub join_type: JoinType,
    pub null_aware: bool,
    pub probe_keys: Vec<usize>,
    pub build_keys: Vec<usize>,
    pub residual: Option<Residual<'a>>,
    pub output_layout: Vec<OutputColumn>,
}

impl RefJoin<'_> {
    pub fn run(&self, probe_rows: &[Row], build_rows: &[Row]) -> Vec<Row> {
        let probe_key_null = |row: &Row| self.probe_keys.iter().any(|k| row[*k].is_none());
        let build_key_null = |row: &Row| self.build_keys.iter().any(|k| row[*k].is_none());
        let keys_equal = |p: &Row, b: &Row| {
            self.probe_keys
                .iter()
                .zip(self.build_keys.iter())
                .all(|(pk, bk)| match (&p[*pk], &b[*bk]) {
                    (Some(a), Some(c)) => a == c,
                    _ => false,
                })
        };
        let residual_pass = |p: &Row, b: &Row| match self.residual {
            Some(pred) => pred(p, b) == Some(true),
            None => true,
        };
        let matches = |p: &Row, b: &Row| keys_equal(p, b) && residual_pass(p, b);

        let build_has_null = build_rows.iter().any(|b| build_key_null(b));
        let probe_has_null = probe_rows.iter().any(|p| probe_key_null(p));

        let mut out = Vec::new();
        match self.join_type {
            JoinType::Inner => {
                for p in probe_rows {
                    for b in build_rows {
                        if matches(p, b) {
                            out.push(self.project(Some(p), Some(b), None));
                        }
                    }
                }
            }
            JoinType::Left => {
                for p in probe_rows {
                    let mut any = false;
                    for b in build_rows {
                        if matches(p, b) {
                            any = true;
                            out.push(self.project(Some(p), Some(b), None));
                        }
                    }
                    if !any {
                        out.push(self.project(Some(p), None, None));
                    }
                }
            }
            JoinType::Right => {
                for b in build_rows {
                    for p in probe_rows {
                        if matches(p, b) {
                            out.push(self.project(Some(p), Some(b), None));
                        }
                    }
                }
                for b in build_rows {
                    if !probe_rows.iter().any(|p| matches(p, b)) {
                        out.push(self.project(None, Some(b), None));
                    }
                }
            }
            JoinType::Full => {
                for p in probe_rows {
                    let mut any = false;
                    for b in build_rows {
                        if matches(p, b) {
                            any = true;
                            out.push(self.project(Some(p), Some(b), None));
                        }
                    }
                    if !any {
                        out.push(self.project(Some(p), None, None));
                    }
                }
                for b in build_rows {
                    if !probe_rows.iter().any(|p| matches(p, b)) {
                        out.push(self.project(None, Some(b), None));
                    }
                }
            }
            JoinType::LeftSemiFilter => {
                for p in probe_rows {
                    if build_rows.iter().any(|b| matches(p, b)) {
                        out.push(self.project(Some(p), None, None));
                    }
                }
            }
            JoinType::RightSemiFilter => {
                for b in build_rows {
                    if probe_rows.iter().any(|p| matches(p, b)) {
                        out.push(self.project(None, Some(b), None));
                    }
                }
            }
            JoinType::Anti => {
                if self.null_aware {
                    if build_rows.is_empty() {
                        for p in probe_rows {
                            out.push(self.project(Some(p), None, None));
                        }
                    } else if self.residual.is_none() {
                        // A null key on either side empties the whole join.
                        if !build_has_null && !probe_has_null {
                            for p in probe_rows {
                                if !build_rows.iter().any(|b| matches(p, b)) {
                                    out.push(self.project(Some(p), None, None));
                                }
                            }
                        }
                    } else {
                        for p in probe_rows {
                            let keep = if probe_key_null(p) {
                                !build_rows.iter().any(|b| residual_pass(p, b))
                            } else {
                                let eq = build_rows.iter().any(|b| matches(p, b));
                                let null_b = build_rows
                                    .iter()
                                    .filter(|b| build_key_null(b))
                                    .any(|b| residual_pass(p, b));
                                !(eq || null_b)
                            };
                            if keep {
                                out.push(self.project(Some(p), None, None));
                            }
                        }
                    }
                } else {
                    for p in probe_rows {
                        if !build_rows.iter().any(|b| matches(p, b)) {
                            out.push(self.project(Some(p), None, None));
                        }
                    }
                }
            }
            JoinType::LeftSemiProject => {
                for p in probe_rows {
                    let any = build_rows.iter().any(|b| matches(p, b));
                    let m = if any {
                        Some(Value::Bool(true))
                    } else if !self.null_aware || build_rows.is_empty() {
                        Some(Value::Bool(false))
                    } else if probe_key_null(p) {
                        None
                    } else {
                        let null_b = match self.residual {
                            Some(_) => build_rows
                                .iter()
                                .filter(|b| build_key_null(b))
                                .any(|b| residual_pass(p, b)),
                            None => build_has_null,
                        };
                        if null_b { None } else { Some(Value::Bool(false)) }
                    };
                    out.push(self.project(Some(p), None, Some(m)));
                }
            }
            JoinType::RightSemiProject => {
                for b in build_rows {
                    let any = probe_rows.iter().any(|p| matches(p, b));
                    let m = if any {
                        Some(Value::Bool(true))
                    } else if !self.null_aware || probe_rows.is_empty() {
                        Some(Value::Bool(false))
                    } else if build_key_null(b) || probe_has_null {
                        None
                    } else {
                        Some(Value::Bool(false))
                    };
                    out.push(self.project(None, Some(b), Some(m)));
                }
            }
        }
        out
    }

    fn project(&self, probe: Option<&Row>, build: Option<&Row>, m: Option<Option<Value>>) -> Row {
        let mut out = Vec::with_capacity(self.output_layout.len() + 1);
        for column in &self.output_layout {
            let value = match column {
                OutputColumn::Probe(idx) => probe.and_then(|row| row[*idx].clone()),
                OutputColumn::Build(idx) => build.and_then(|row| row[*idx].clone()),
            };
            out.push(value);
        }
        if let Some(m) = m {
            out.push(m);
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Output conversion and multiset comparison
// ---------------------------------------------------------------------------

pub fn rows_from_batches(batches: &[RecordBatch]) -> Vec<Row> {
    let mut rows = Vec::new();
    for batch in batches {
        for row in 0..batch.num_rows() {
            let mut out = Vec::with_capacity(batch.num_columns());
            for col in batch.columns() {
                out.push(value_at(col, row));
            }
            rows.push(out);
        }
    }
    rows
}

fn value_at(array: &ArrayRef, row: usize) -> Option<Value> {
    if array.is_null(row) {
        return None;
    }
    match array.data_type() {
        DataType::Int64 => Some(Value::Int(
            array.as_any().downcast_ref::<Int64Array>().unwrap().value(row),
        )),
        DataType::Int32 => Some(Value::Int(
            array.as_any().downcast_ref::<Int32Array>().unwrap().value(row) as i64,
        )),
        DataType::Float64 => {
            let v = array
                .as_any()
                .downcast_ref::<Float64Array>()
                .unwrap()
                .value(row);
            let bits = if v.is_nan() {
                f64::NAN.to_bits()
            } else {
                v.to_bits()
            };
            Some(Value::Float(bits))
        }
        DataType::Utf8 => Some(Value::Str(
            array
                .as_any()
                .downcast_ref::<StringArray>()
                .unwrap()
                .value(row)
                .to_string(),
        )),
        DataType::Boolean => Some(Value::Bool(
            array
                .as_any()
                .downcast_ref::<BooleanArray>()
                .unwrap()
                .value(row),
        )),
        other => panic!("unsupported test output type: {other}"),
    }
}

pub fn chunk_rows(chunks: &[Chunk]) -> Vec<Row> {
    let batches: Vec<RecordBatch> = chunks.iter().map(|c| c.batch.clone()).collect();
    rows_from_batches(&batches)
}

/// Multiset equality over rows, with a readable diff on mismatch.
pub fn assert_same_multiset(actual: Vec<Row>, expected: Vec<Row>) {
    let mut actual_counts: HashMap<String, i64> = HashMap::new();
    for row in &actual {
        *actual_counts.entry(format!("{row:?}")).or_default() += 1;
    }
    let mut expected_counts: HashMap<String, i64> = HashMap::new();
    for row in &expected {
        *expected_counts.entry(format!("{row:?}")).or_default() += 1;
    }
    if actual_counts != expected_counts {
        let mut only_actual: Vec<&String> = actual_counts
            .iter()
            .filter(|(k, v)| expected_counts.get(*k) != Some(v))
            .map(|(k, _)| k)
            .collect();
        only_actual.sort();
        let mut only_expected: Vec<&String> = expected_counts
            .iter()
            .filter(|(k, v)| actual_counts.get(*k) != Some(v))
            .map(|(k, _)| k)
            .collect();
        only_expected.sort();
        panic!(
            "row multisets differ\n  actual rows: {}\n  expected rows: {}\n  mismatched in actual: {:#?}\n  mismatched in expected: {:#?}",
            actual.len(),
            expected.len(),
            only_actual,
            only_expected
        );
    }
}

/// Interpret Int64-only chunks as reference rows.
pub fn int_rows(columns: &[Vec<Option<i64>>]) -> Vec<Row> {
    let num_rows = columns.first().map(|c| c.len()).unwrap_or(0);
    (0..num_rows)
        .map(|row| {
            columns
                .iter()
                .map(|col| col[row].map(Value::Int))
                .collect()
        })
        .collect()
}
