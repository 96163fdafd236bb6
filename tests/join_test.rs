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
//! Join semantics tests: every variant against the reference engine, plus the
//! literal scenarios from the acceptance checklist.

mod common;

use std::sync::Arc;

use common::*;
use vexec::common::ids::{PlanNodeId, SlotId};
use vexec::exec::expr::{ArithOp, CmpOp, ExprArena, ExprNode, LiteralValue};
use vexec::exec::node::join::{JoinSpec, JoinType, OutputColumn};
use vexec::exec::runtime_filter::channel::DynamicFilterChannel;
use vexec::exec::runtime_filter::apply::ScanFilterConsumer;
use vexec::exec::operators::hashjoin::{
    HashJoinBuildSinkFactory, HashJoinProbeProcessorFactory, JoinBridge,
};
use vexec::exec::operators::hashjoin::DynamicFilterTarget;
use vexec::exec::pipeline::operator::{Operator, OperatorFactory};
use vexec::runtime::profile::{OperatorProfiles, RuntimeProfile};
use vexec::runtime::runtime_state::{QueryOptions, RuntimeState};

/// Probe schema: k (slot 1), v (slot 2). Build schema: k (slot 11), w (slot 12).
fn two_column_spec(join_type: JoinType, null_aware: bool) -> JoinSpec {
    let probe_schema = int64_schema(&["k", "v"], 1);
    let build_schema = int64_schema(&["k", "w"], 11);
    let output_layout = if join_type.output_is_probe_only() {
        vec![OutputColumn::Probe(0), OutputColumn::Probe(1)]
    } else if join_type.output_is_build_only() {
        vec![OutputColumn::Build(0), OutputColumn::Build(1)]
    } else {
        vec![
            OutputColumn::Probe(0),
            OutputColumn::Probe(1),
            OutputColumn::Build(0),
            OutputColumn::Build(1),
        ]
    };
    JoinSpec {
        node_id: PlanNodeId::new(7),
        join_type,
        null_aware,
        probe_keys: vec![0],
        build_keys: vec![0],
        residual: None,
        output_layout,
        probe_schema,
        build_schema,
    }
}

fn run_and_compare(
    join_type: JoinType,
    null_aware: bool,
    probe_cols: Vec<Vec<Option<i64>>>,
    build_cols: Vec<Vec<Option<i64>>>,
) {
    let spec = two_column_spec(join_type, null_aware);
    let driver = JoinDriver::new(spec.clone(), ExprArena::default());
    let probe_chunk = int64_chunk(&spec.probe_schema, probe_cols.clone());
    let build_chunk = int64_chunk(&spec.build_schema, build_cols.clone());
    let run = driver.run(vec![build_chunk], vec![probe_chunk]);

    let reference = RefJoin {
        join_type,
        null_aware,
        probe_keys: vec![0],
        build_keys: vec![0],
        residual: None,
        output_layout: spec.output_layout.clone(),
    };
    let expected = reference.run(&int_rows(&probe_cols), &int_rows(&build_cols));
    assert_same_multiset(rows_from_batches(&run.output), expected);
}

fn probe_fixture() -> Vec<Vec<Option<i64>>> {
    vec![
        vec![
            Some(1),
            Some(2),
            Some(2),
            Some(3),
            None,
            Some(7),
            Some(4),
            Some(2),
        ],
        vec![
            Some(10),
            Some(20),
            Some(21),
            Some(30),
            Some(40),
            Some(70),
            Some(41),
            Some(22),
        ],
    ]
}

fn build_fixture() -> Vec<Vec<Option<i64>>> {
    vec![
        vec![Some(2), Some(2), Some(3), Some(5), None, Some(8)],
        vec![Some(200), Some(201), Some(300), Some(500), Some(900), Some(800)],
    ]
}

#[test]
fn inner_join_matches_reference() {
    run_and_compare(JoinType::Inner, false, probe_fixture(), build_fixture());
}

#[test]
fn left_join_matches_reference() {
    run_and_compare(JoinType::Left, false, probe_fixture(), build_fixture());
}

#[test]
fn right_join_matches_reference() {
    run_and_compare(JoinType::Right, false, probe_fixture(), build_fixture());
}

#[test]
fn full_join_matches_reference() {
    run_and_compare(JoinType::Full, false, probe_fixture(), build_fixture());
}

#[test]
fn left_semi_filter_matches_reference() {
    run_and_compare(JoinType::LeftSemiFilter, false, probe_fixture(), build_fixture());
}

#[test]
fn right_semi_filter_matches_reference() {
    run_and_compare(JoinType::RightSemiFilter, false, probe_fixture(), build_fixture());
}

#[test]
fn anti_join_matches_reference() {
    run_and_compare(JoinType::Anti, false, probe_fixture(), build_fixture());
}

#[test]
fn left_semi_project_matches_reference() {
    run_and_compare(JoinType::LeftSemiProject, false, probe_fixture(), build_fixture());
}

#[test]
fn right_semi_project_matches_reference() {
    run_and_compare(JoinType::RightSemiProject, false, probe_fixture(), build_fixture());
}

#[test]
fn null_aware_left_semi_project_matches_reference() {
    run_and_compare(
        JoinType::LeftSemiProject,
        true,
        probe_fixture(),
        build_fixture(),
    );
}

#[test]
fn null_aware_right_semi_project_matches_reference() {
    run_and_compare(
        JoinType::RightSemiProject,
        true,
        probe_fixture(),
        build_fixture(),
    );
}

#[test]
fn null_aware_anti_without_nulls_matches_reference() {
    let probe = vec![
        vec![Some(1), Some(2), Some(3)],
        vec![Some(10), Some(20), Some(30)],
    ];
    let build = vec![vec![Some(2), Some(5)], vec![Some(200), Some(500)]];
    run_and_compare(JoinType::Anti, true, probe, build);
}

// Scenario 1: empty build, left join.
#[test]
fn empty_build_left_join_null_extends() {
    let spec = two_column_spec(JoinType::Left, false);
    let driver = JoinDriver::new(spec.clone(), ExprArena::default());
    let probe = int64_chunk(
        &spec.probe_schema,
        vec![vec![Some(1), Some(2)], vec![Some(100), Some(200)]],
    );
    let run = driver.run(Vec::new(), vec![probe]);

    let expected = vec![
        vec![Some(Value::Int(1)), Some(Value::Int(100)), None, None],
        vec![Some(Value::Int(2)), Some(Value::Int(200)), None, None],
    ];
    assert_same_multiset(rows_from_batches(&run.output), expected);

    for profile in &run.build_profiles {
        assert_eq!(profile.counter_value("SpilledRows"), 0);
        assert_eq!(profile.counter_value("SpilledPartitions"), 0);
    }
    assert_eq!(run.probe_profile.counter_value("SpilledRows"), 0);
}

// Scenario 2: inner join on bigint keys.
#[test]
fn inner_join_on_bigint() {
    let spec = two_column_spec(JoinType::Inner, false);
    let driver = JoinDriver::new(spec.clone(), ExprArena::default());
    let probe = int64_chunk(
        &spec.probe_schema,
        vec![
            vec![Some(1), Some(2), Some(3)],
            vec![Some(10), Some(20), Some(30)],
        ],
    );
    let build = int64_chunk(
        &spec.build_schema,
        vec![
            vec![Some(2), Some(3), Some(4)],
            vec![Some(200), Some(300), Some(400)],
        ],
    );
    let run = driver.run(vec![build], vec![probe]);

    let expected = vec![
        vec![
            Some(Value::Int(2)),
            Some(Value::Int(20)),
            Some(Value::Int(2)),
            Some(Value::Int(200)),
        ],
        vec![
            Some(Value::Int(3)),
            Some(Value::Int(30)),
            Some(Value::Int(3)),
            Some(Value::Int(300)),
        ],
    ];
    assert_same_multiset(rows_from_batches(&run.output), expected);
}

// Scenario 3: right semi with the selective residual t1 % 5 = 0.
#[test]
fn right_semi_with_selective_filter() {
    let mut arena = ExprArena::default();
    let t1 = arena.push(ExprNode::Slot(SlotId::new(1)));
    let five = arena.push(ExprNode::Literal(LiteralValue::Int64(5)));
    let zero = arena.push(ExprNode::Literal(LiteralValue::Int64(0)));
    let modulo = arena.push(ExprNode::Arith(ArithOp::Mod, t1, five));
    let pred = arena.push(ExprNode::Cmp(CmpOp::Eq, modulo, zero));

    let mut spec = two_column_spec(JoinType::RightSemiFilter, false);
    spec.residual = Some(pred);
    let driver = JoinDriver::new(spec.clone(), arena);

    let probe_batches: Vec<_> = (0..4)
        .map(|_| {
            let keys: Vec<Option<i64>> = (0..345).map(Some).collect();
            let values: Vec<Option<i64>> = (0..345).map(|v| Some(v * 10)).collect();
            int64_chunk(&spec.probe_schema, vec![keys, values])
        })
        .collect();
    let build_batches: Vec<_> = (0..4)
        .map(|_| {
            let keys: Vec<Option<i64>> = (0..250).map(Some).collect();
            let values: Vec<Option<i64>> = (0..250).map(|v| Some(v * 100)).collect();
            int64_chunk(&spec.build_schema, vec![keys, values])
        })
        .collect();

    let run = driver.run(build_batches, probe_batches);
    let total_rows: usize = run.output.iter().map(|b| b.num_rows()).sum();
    // 50 multiples of five below 250, duplicated across 4 build copies.
    assert_eq!(total_rows, 200);
}

// Scenario 4: null-aware anti join with a null on the build side.
#[test]
fn null_aware_anti_with_build_null_is_empty() {
    let spec = two_column_spec(JoinType::Anti, true);
    let driver = JoinDriver::new(spec.clone(), ExprArena::default());
    let probe = int64_chunk(
        &spec.probe_schema,
        vec![
            vec![Some(1), Some(2), Some(3)],
            vec![Some(10), Some(20), Some(30)],
        ],
    );
    let build = int64_chunk(
        &spec.build_schema,
        vec![vec![None, Some(2)], vec![Some(900), Some(200)]],
    );
    let run = driver.run(vec![build], vec![probe]);
    let total_rows: usize = run.output.iter().map(|b| b.num_rows()).sum();
    assert_eq!(total_rows, 0);
}

#[test]
fn nan_keys_with_different_bit_patterns_join_equal() {
    let probe_schema = float64_schema(&["k"], 1);
    let build_schema = float64_schema(&["k", "w"], 11);
    let spec = JoinSpec {
        node_id: PlanNodeId::new(8),
        join_type: JoinType::Inner,
        null_aware: false,
        probe_keys: vec![0],
        build_keys: vec![0],
        residual: None,
        output_layout: vec![OutputColumn::Probe(0), OutputColumn::Build(1)],
        probe_schema: probe_schema.clone(),
        build_schema: build_schema.clone(),
    };
    let driver = JoinDriver::new(spec, ExprArena::default());

    let quiet = f64::NAN;
    let payload = f64::from_bits(f64::NAN.to_bits() | 0xabc);
    let negative = f64::from_bits(f64::NAN.to_bits() | (1u64 << 63));
    let probe = float64_chunk(&probe_schema, vec![vec![Some(quiet), Some(1.5)]]);
    let build = float64_chunk(
        &build_schema,
        vec![
            vec![Some(payload), Some(negative), Some(2.5)],
            vec![Some(1.0), Some(2.0), Some(3.0)],
        ],
    );
    let run = driver.run(vec![build], vec![probe]);
    // The NaN probe row matches both NaN build rows regardless of payload bits.
    let rows = rows_from_batches(&run.output);
    assert_eq!(rows.len(), 2);
}

#[test]
fn residual_filter_null_result_is_false() {
    // Residual `v < w` where some w is null: null comparisons must not match.
    let mut arena = ExprArena::default();
    let v = arena.push(ExprNode::Slot(SlotId::new(2)));
    let w = arena.push(ExprNode::Slot(SlotId::new(12)));
    let pred = arena.push(ExprNode::Cmp(CmpOp::Lt, v, w));

    let mut spec = two_column_spec(JoinType::Inner, false);
    spec.residual = Some(pred);
    let driver = JoinDriver::new(spec.clone(), arena);

    let probe_cols = vec![vec![Some(1), Some(2)], vec![Some(10), Some(20)]];
    let build_cols = vec![vec![Some(1), Some(2)], vec![Some(50), None]];
    let probe = int64_chunk(&spec.probe_schema, probe_cols.clone());
    let build = int64_chunk(&spec.build_schema, build_cols.clone());
    let run = driver.run(vec![build], vec![probe]);

    let residual = |p: &Row, b: &Row| -> Option<bool> {
        match (&p[1], &b[1]) {
            (Some(Value::Int(a)), Some(Value::Int(c))) => Some(a < c),
            _ => None,
        }
    };
    let reference = RefJoin {
        join_type: JoinType::Inner,
        null_aware: false,
        probe_keys: vec![0],
        build_keys: vec![0],
        residual: Some(&residual),
        output_layout: spec.output_layout.clone(),
    };
    let expected = reference.run(&int_rows(&probe_cols), &int_rows(&build_cols));
    assert_same_multiset(rows_from_batches(&run.output), expected);
}

#[test]
fn multi_key_join_uses_normalized_mode() {
    // Two narrow int keys pack into 64 bits; semantics must be unaffected.
    let probe_schema = int64_schema(&["a", "b", "v"], 1);
    let build_schema = int64_schema(&["a", "b", "w"], 11);
    let spec = JoinSpec {
        node_id: PlanNodeId::new(9),
        join_type: JoinType::Inner,
        null_aware: false,
        probe_keys: vec![0, 1],
        build_keys: vec![0, 1],
        residual: None,
        output_layout: vec![
            OutputColumn::Probe(0),
            OutputColumn::Probe(1),
            OutputColumn::Build(2),
        ],
        probe_schema: probe_schema.clone(),
        build_schema: build_schema.clone(),
    };
    let driver = JoinDriver::new(spec.clone(), ExprArena::default());

    let probe_cols = vec![
        vec![Some(1), Some(1), Some(2), Some(9)],
        vec![Some(1), Some(2), Some(1), Some(9)],
        vec![Some(0), Some(0), Some(0), Some(0)],
    ];
    let build_cols = vec![
        vec![Some(1), Some(2), Some(1)],
        vec![Some(1), Some(1), Some(2)],
        vec![Some(100), Some(200), Some(300)],
    ];
    let probe = int64_chunk(&probe_schema, probe_cols.clone());
    let build = int64_chunk(&build_schema, build_cols.clone());
    let run = driver.run(vec![build], vec![probe]);

    let reference = RefJoin {
        join_type: JoinType::Inner,
        null_aware: false,
        probe_keys: vec![0, 1],
        build_keys: vec![0, 1],
        residual: None,
        output_layout: spec.output_layout.clone(),
    };
    let expected = reference.run(&int_rows(&probe_cols), &int_rows(&build_cols));
    assert_same_multiset(rows_from_batches(&run.output), expected);
}

#[test]
fn output_respects_preferred_batch_rows() {
    let spec = two_column_spec(JoinType::Inner, false);
    let mut driver = JoinDriver::new(spec.clone(), ExprArena::default());
    driver.options.preferred_output_batch_rows = 16;

    let keys: Vec<Option<i64>> = (0..256).map(|v| Some(v % 8)).collect();
    let values: Vec<Option<i64>> = (0..256).map(Some).collect();
    let probe = int64_chunk(&spec.probe_schema, vec![keys, values]);
    let build = int64_chunk(
        &spec.build_schema,
        vec![vec![Some(1), Some(2)], vec![Some(10), Some(20)]],
    );
    let run = driver.run(vec![build], vec![probe]);
    assert!(!run.output.is_empty());
    for batch in &run.output {
        assert!(batch.num_rows() <= 16);
    }
    let total: usize = run.output.iter().map(|b| b.num_rows()).sum();
    assert_eq!(total, 64);
}

#[test]
fn multiple_build_drivers_rendezvous() {
    let spec = two_column_spec(JoinType::Inner, false);
    let mut driver = JoinDriver::new(spec.clone(), ExprArena::default());
    driver.num_build_drivers = 3;

    let build_batches: Vec<_> = (0..6)
        .map(|i| {
            int64_chunk(
                &spec.build_schema,
                vec![vec![Some(i)], vec![Some(i * 100)]],
            )
        })
        .collect();
    let probe = int64_chunk(
        &spec.probe_schema,
        vec![
            vec![Some(0), Some(3), Some(5), Some(7)],
            vec![Some(1), Some(2), Some(3), Some(4)],
        ],
    );
    let run = driver.run(build_batches, vec![probe]);
    let rows = rows_from_batches(&run.output);
    assert_eq!(rows.len(), 3); // keys 0, 3 and 5 match
}

// Scenario 6: dynamic filter replaces the join at the scan.
#[test]
fn dynamic_filter_replaces_join() {
    let probe_schema = int64_schema(&["k"], 1);
    let build_schema = int64_schema(&["k"], 11);
    let spec = Arc::new(JoinSpec {
        node_id: PlanNodeId::new(3),
        join_type: JoinType::Inner,
        null_aware: false,
        probe_keys: vec![0],
        build_keys: vec![0],
        residual: None,
        output_layout: vec![OutputColumn::Probe(0)],
        probe_schema: probe_schema.clone(),
        build_schema: build_schema.clone(),
    });
    let arena = Arc::new(ExprArena::default());
    let state = RuntimeState::new(QueryOptions::default());
    let bridge = JoinBridge::new_for_node(spec.node_id, 1, 1);
    let channel = DynamicFilterChannel::new();
    let scan_node = PlanNodeId::new(1);

    let build_factory =
        HashJoinBuildSinkFactory::new(Arc::clone(&spec), Arc::clone(&bridge)).unwrap();
    let probe_factory = HashJoinProbeProcessorFactory::new(
        Arc::clone(&spec),
        Arc::clone(&arena),
        Arc::clone(&bridge),
    )
    .unwrap()
    .with_dynamic_filters(
        Arc::clone(&channel),
        vec![DynamicFilterTarget {
            key_ordinal: 0,
            scan_node,
            scan_column: 0,
        }],
    );

    let mut build_op = build_factory.create(1, 0);
    build_op.prepare(&state).unwrap();
    // 100 distinct keys in [35, 233], step 2.
    let build_keys: Vec<Option<i64>> = (0..100).map(|i| Some(35 + i * 2)).collect();
    let build_chunk = int64_chunk(&build_schema, vec![build_keys.clone()]);
    build_op
        .as_processor_mut()
        .unwrap()
        .push_chunk(&state, build_chunk)
        .unwrap();
    build_op
        .as_processor_mut()
        .unwrap()
        .set_finishing(&state)
        .unwrap();

    let mut probe_op = probe_factory.create(1, 0);
    let probe_profile = RuntimeProfile::new("probe");
    probe_op.set_profiles(OperatorProfiles::new(probe_profile.clone()));
    probe_op.prepare(&state).unwrap();

    // An empty first batch makes the probe pick up the published build side
    // (and emit the filter) before the scan starts polling.
    let empty = int64_chunk(&probe_schema, vec![Vec::new()]);
    probe_op
        .as_processor_mut()
        .unwrap()
        .push_chunk(&state, empty)
        .unwrap();

    // The scan consumes the filter: 10 splits of 333 rows each.
    let scan_profile = RuntimeProfile::new("scan");
    let mut consumer = ScanFilterConsumer::new(Arc::clone(&channel), scan_node, 0, &scan_profile);
    let mut output_rows = 0usize;
    for _split in 0..10 {
        consumer.record_preloaded_split();
        let keys: Vec<Option<i64>> = (0..333).map(Some).collect();
        let chunk = int64_chunk(&probe_schema, vec![keys]);
        // Probe must be loaded (and the filter published) before the scan polls.
        let processor = probe_op.as_processor_mut().unwrap();
        let filtered = consumer.apply(chunk, None).unwrap();
        processor.push_chunk(&state, filtered).unwrap();
        while processor.has_output() {
            if let Some(out) = processor.pull_chunk(&state).unwrap() {
                output_rows += out.len();
            } else {
                break;
            }
        }
    }
    probe_op
        .as_processor_mut()
        .unwrap()
        .set_finishing(&state)
        .unwrap();
    loop {
        let out = probe_op
            .as_processor_mut()
            .unwrap()
            .pull_chunk(&state)
            .unwrap();
        match out {
            Some(chunk) => output_rows += chunk.len(),
            None => {
                if probe_op.is_finished() {
                    break;
                }
            }
        }
    }
    probe_op.close(&state).unwrap();

    // Every split passes exactly the 100 build keys through the exact filter.
    assert_eq!(output_rows, 1000);
    assert_eq!(channel.produced_count(), 1);
    assert_eq!(channel.accepted_count(), 1);
    assert_eq!(
        probe_profile.counter_value("ReplacedWithFilterRows"),
        1000
    );
    assert_eq!(probe_profile.counter_value("DynamicFiltersProduced"), 1);
    assert_eq!(probe_profile.counter_value("DynamicFiltersAccepted"), 1);
    assert_eq!(scan_profile.counter_value("PreloadedSplits"), 10);
}

#[test]
fn dynamic_filter_prunes_splits() {
    let channel = DynamicFilterChannel::new();
    let scan_node = PlanNodeId::new(1);
    let scan_profile = RuntimeProfile::new("scan");
    let mut consumer = ScanFilterConsumer::new(Arc::clone(&channel), scan_node, 0, &scan_profile);

    channel
        .publish(
            scan_node,
            0,
            vexec::exec::runtime_filter::DynamicFilter {
                range: vexec::exec::runtime_filter::min_max::ValueRange { min: 35, max: 233 },
                distinct: None,
            },
        )
        .unwrap();
    assert!(consumer.should_skip_split(234, 400));
    assert!(!consumer.should_skip_split(100, 150));
    assert_eq!(scan_profile.counter_value("SkippedSplits"), 1);
}
