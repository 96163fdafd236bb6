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
//! Expression arena.
//!
//! Responsibilities:
//! - Holds expression trees addressed by `ExprId` and evaluates them over chunks.
//! - Serves as the residual-predicate surface consumed by the join operators; the
//!   full vectorized evaluator lives outside this crate.
//!
//! Comparisons and arithmetic follow SQL three-valued logic: a null operand yields a
//! null result, and And/Or use Kleene semantics.

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, Date32Array, Float32Array, Float64Array, Int8Array,
    Int16Array, Int32Array, Int64Array, StringArray,
};
use arrow::datatypes::DataType;

use crate::common::error::{ExecError, ExecResult};
use crate::common::ids::SlotId;
use crate::exec::chunk::Chunk;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ExprId(pub usize);

#[derive(Clone, Debug)]
pub enum LiteralValue {
    Null,
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Bool(bool),
    Utf8(String),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Mod,
}

#[derive(Clone, Debug)]
pub enum ExprNode {
    Literal(LiteralValue),
    Slot(SlotId),
    Cmp(CmpOp, ExprId, ExprId),
    Arith(ArithOp, ExprId, ExprId),
    And(ExprId, ExprId),
    Or(ExprId, ExprId),
    Not(ExprId),
    IsNull(ExprId),
}

#[derive(Clone, Debug, Default)]
pub struct ExprArena {
    nodes: Vec<ExprNode>,
}

impl ExprArena {
    pub fn push(&mut self, node: ExprNode) -> ExprId {
        let id = ExprId(self.nodes.len());
        self.nodes.push(node);
        id
    }

    pub fn node(&self, id: ExprId) -> Option<&ExprNode> {
        self.nodes.get(id.0)
    }

    pub fn eval(&self, id: ExprId, chunk: &Chunk) -> ExecResult<ArrayRef> {
        let node = self
            .nodes
            .get(id.0)
            .ok_or_else(|| ExecError::internal(format!("expr id {} out of bounds", id.0)))?;
        match node {
            ExprNode::Literal(value) => Ok(literal_array(value, chunk.len())),
            ExprNode::Slot(slot) => chunk.column_by_slot_id(*slot),
            ExprNode::Cmp(op, lhs, rhs) => {
                let lhs = self.eval(*lhs, chunk)?;
                let rhs = self.eval(*rhs, chunk)?;
                compare_arrays(*op, &lhs, &rhs)
            }
            ExprNode::Arith(op, lhs, rhs) => {
                let lhs = self.eval(*lhs, chunk)?;
                let rhs = self.eval(*rhs, chunk)?;
                arith_arrays(*op, &lhs, &rhs)
            }
            ExprNode::And(lhs, rhs) => {
                let lhs = self.eval_bool(*lhs, chunk)?;
                let rhs = self.eval_bool(*rhs, chunk)?;
                Ok(Arc::new(kleene_and(&lhs, &rhs)))
            }
            ExprNode::Or(lhs, rhs) => {
                let lhs = self.eval_bool(*lhs, chunk)?;
                let rhs = self.eval_bool(*rhs, chunk)?;
                Ok(Arc::new(kleene_or(&lhs, &rhs)))
            }
            ExprNode::Not(child) => {
                let child = self.eval_bool(*child, chunk)?;
                let values = (0..child.len())
                    .map(|row| bool_at(&child, row).map(|v| !v))
                    .collect::<Vec<_>>();
                Ok(Arc::new(BooleanArray::from(values)))
            }
            ExprNode::IsNull(child) => {
                let child = self.eval(*child, chunk)?;
                let values = (0..child.len())
                    .map(|row| Some(child.is_null(row)))
                    .collect::<Vec<_>>();
                Ok(Arc::new(BooleanArray::from(values)))
            }
        }
    }

    fn eval_bool(&self, id: ExprId, chunk: &Chunk) -> ExecResult<BooleanArray> {
        let array = self.eval(id, chunk)?;
        array
            .as_any()
            .downcast_ref::<BooleanArray>()
            .cloned()
            .ok_or_else(|| {
                ExecError::internal(format!(
                    "expected boolean expression result, got {}",
                    array.data_type()
                ))
            })
    }
}

fn literal_array(value: &LiteralValue, len: usize) -> ArrayRef {
    match value {
        LiteralValue::Null => Arc::new(Int64Array::from(vec![None::<i64>; len])),
        LiteralValue::Int32(v) => Arc::new(Int32Array::from(vec![*v; len])),
        LiteralValue::Int64(v) => Arc::new(Int64Array::from(vec![*v; len])),
        LiteralValue::Float64(v) => Arc::new(Float64Array::from(vec![*v; len])),
        LiteralValue::Bool(v) => Arc::new(BooleanArray::from(vec![*v; len])),
        LiteralValue::Utf8(v) => Arc::new(StringArray::from(vec![v.as_str(); len])),
    }
}

fn int_at(array: &ArrayRef, row: usize) -> ExecResult<Option<i64>> {
    if array.is_null(row) {
        return Ok(None);
    }
    let value = match array.data_type() {
        DataType::Int8 => downcast::<Int8Array>(array)?.value(row) as i64,
        DataType::Int16 => downcast::<Int16Array>(array)?.value(row) as i64,
        DataType::Int32 => downcast::<Int32Array>(array)?.value(row) as i64,
        DataType::Int64 => downcast::<Int64Array>(array)?.value(row),
        DataType::Date32 => downcast::<Date32Array>(array)?.value(row) as i64,
        other => {
            return Err(ExecError::internal(format!(
                "expected integer operand, got {other}"
            )));
        }
    };
    Ok(Some(value))
}

fn float_at(array: &ArrayRef, row: usize) -> ExecResult<Option<f64>> {
    if array.is_null(row) {
        return Ok(None);
    }
    let value = match array.data_type() {
        DataType::Float32 => downcast::<Float32Array>(array)?.value(row) as f64,
        DataType::Float64 => downcast::<Float64Array>(array)?.value(row),
        _ => match int_at(array, row)? {
            Some(v) => v as f64,
            None => return Ok(None),
        },
    };
    Ok(Some(value))
}

fn bool_at(array: &BooleanArray, row: usize) -> Option<bool> {
    if array.is_null(row) {
        None
    } else {
        Some(array.value(row))
    }
}

fn downcast<T: 'static>(array: &ArrayRef) -> ExecResult<&T> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| ExecError::internal("expression operand downcast failed"))
}

fn is_float(data_type: &DataType) -> bool {
    matches!(data_type, DataType::Float32 | DataType::Float64)
}

fn is_int(data_type: &DataType) -> bool {
    matches!(
        data_type,
        DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::Int64 | DataType::Date32
    )
}

fn compare_arrays(op: CmpOp, lhs: &ArrayRef, rhs: &ArrayRef) -> ExecResult<ArrayRef> {
    if lhs.len() != rhs.len() {
        return Err(ExecError::internal(format!(
            "comparison operand length mismatch: {} vs {}",
            lhs.len(),
            rhs.len()
        )));
    }
    let len = lhs.len();
    let mut out = Vec::with_capacity(len);

    let lt = lhs.data_type();
    let rt = rhs.data_type();
    if is_float(lt) || is_float(rt) {
        for row in 0..len {
            let pair = (float_at(lhs, row)?, float_at(rhs, row)?);
            out.push(match pair {
                (Some(a), Some(b)) => Some(apply_cmp(op, a.partial_cmp(&b))),
                _ => None,
            });
        }
    } else if is_int(lt) && is_int(rt) {
        for row in 0..len {
            let pair = (int_at(lhs, row)?, int_at(rhs, row)?);
            out.push(match pair {
                (Some(a), Some(b)) => Some(apply_cmp(op, Some(a.cmp(&b)))),
                _ => None,
            });
        }
    } else if lt == &DataType::Utf8 && rt == &DataType::Utf8 {
        let lhs = downcast::<StringArray>(lhs)?;
        let rhs = downcast::<StringArray>(rhs)?;
        for row in 0..len {
            out.push(if lhs.is_null(row) || rhs.is_null(row) {
                None
            } else {
                Some(apply_cmp(op, Some(lhs.value(row).cmp(rhs.value(row)))))
            });
        }
    } else if lt == &DataType::Boolean && rt == &DataType::Boolean {
        let lhs = downcast::<BooleanArray>(lhs)?;
        let rhs = downcast::<BooleanArray>(rhs)?;
        for row in 0..len {
            out.push(match (bool_at(lhs, row), bool_at(rhs, row)) {
                (Some(a), Some(b)) => Some(apply_cmp(op, Some(a.cmp(&b)))),
                _ => None,
            });
        }
    } else if lt == &DataType::Null || rt == &DataType::Null {
        out.resize(len, None);
    } else {
        return Err(ExecError::internal(format!(
            "unsupported comparison operand types: {lt} vs {rt}"
        )));
    }

    Ok(Arc::new(BooleanArray::from(out)))
}

fn apply_cmp(op: CmpOp, ordering: Option<std::cmp::Ordering>) -> bool {
    use std::cmp::Ordering::*;
    match ordering {
        Some(ord) => match op {
            CmpOp::Eq => ord == Equal,
            CmpOp::Ne => ord != Equal,
            CmpOp::Lt => ord == Less,
            CmpOp::Le => ord != Greater,
            CmpOp::Gt => ord == Greater,
            CmpOp::Ge => ord != Less,
        },
        // Incomparable floats (NaN operands) compare as not-equal.
        None => op == CmpOp::Ne,
    }
}

fn arith_arrays(op: ArithOp, lhs: &ArrayRef, rhs: &ArrayRef) -> ExecResult<ArrayRef> {
    if lhs.len() != rhs.len() {
        return Err(ExecError::internal(format!(
            "arithmetic operand length mismatch: {} vs {}",
            lhs.len(),
            rhs.len()
        )));
    }
    let len = lhs.len();

    if is_float(lhs.data_type()) || is_float(rhs.data_type()) {
        let mut out = Vec::with_capacity(len);
        for row in 0..len {
            let pair = (float_at(lhs, row)?, float_at(rhs, row)?);
            out.push(match pair {
                (Some(a), Some(b)) => match op {
                    ArithOp::Add => Some(a + b),
                    ArithOp::Sub => Some(a - b),
                    ArithOp::Mul => Some(a * b),
                    ArithOp::Mod => {
                        if b == 0.0 {
                            None
                        } else {
                            Some(a % b)
                        }
                    }
                },
                _ => None,
            });
        }
        return Ok(Arc::new(Float64Array::from(out)));
    }

    let mut out = Vec::with_capacity(len);
    for row in 0..len {
        let pair = (int_at(lhs, row)?, int_at(rhs, row)?);
        out.push(match pair {
            (Some(a), Some(b)) => match op {
                ArithOp::Add => a.checked_add(b),
                ArithOp::Sub => a.checked_sub(b),
                ArithOp::Mul => a.checked_mul(b),
                ArithOp::Mod => {
                    if b == 0 {
                        None
                    } else {
                        a.checked_rem(b)
                    }
                }
            },
            _ => None,
        });
    }
    Ok(Arc::new(Int64Array::from(out)))
}

fn kleene_and(lhs: &BooleanArray, rhs: &BooleanArray) -> BooleanArray {
    let values = (0..lhs.len())
        .map(|row| match (bool_at(lhs, row), bool_at(rhs, row)) {
            (Some(false), _) | (_, Some(false)) => Some(false),
            (Some(true), Some(true)) => Some(true),
            _ => None,
        })
        .collect::<Vec<_>>();
    BooleanArray::from(values)
}

fn kleene_or(lhs: &BooleanArray, rhs: &BooleanArray) -> BooleanArray {
    let values = (0..lhs.len())
        .map(|row| match (bool_at(lhs, row), bool_at(rhs, row)) {
            (Some(true), _) | (_, Some(true)) => Some(true),
            (Some(false), Some(false)) => Some(false),
            _ => None,
        })
        .collect::<Vec<_>>();
    BooleanArray::from(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::chunk::field_with_slot_id;
    use arrow::datatypes::{Field, Schema};
    use arrow::record_batch::RecordBatch;

    fn chunk_i32(slot: u32, values: Vec<Option<i32>>) -> Chunk {
        let schema = Arc::new(Schema::new(vec![field_with_slot_id(
            Field::new("c", DataType::Int32, true),
            SlotId::new(slot),
        )]));
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(Int32Array::from(values)) as ArrayRef],
        )
        .unwrap();
        Chunk::new(batch)
    }

    #[test]
    fn modulo_filter_matches_multiples() {
        let chunk = chunk_i32(1, (0..10).map(Some).collect());
        let mut arena = ExprArena::default();
        let slot = arena.push(ExprNode::Slot(SlotId::new(1)));
        let five = arena.push(ExprNode::Literal(LiteralValue::Int64(5)));
        let zero = arena.push(ExprNode::Literal(LiteralValue::Int64(0)));
        let modulo = arena.push(ExprNode::Arith(ArithOp::Mod, slot, five));
        let pred = arena.push(ExprNode::Cmp(CmpOp::Eq, modulo, zero));

        let result = arena.eval(pred, &chunk).unwrap();
        let mask = result.as_any().downcast_ref::<BooleanArray>().unwrap();
        let matched = (0..mask.len()).filter(|&i| mask.value(i)).count();
        assert_eq!(matched, 2); // 0 and 5
    }

    #[test]
    fn null_operand_yields_null_comparison() {
        let chunk = chunk_i32(1, vec![Some(1), None]);
        let mut arena = ExprArena::default();
        let slot = arena.push(ExprNode::Slot(SlotId::new(1)));
        let one = arena.push(ExprNode::Literal(LiteralValue::Int64(1)));
        let pred = arena.push(ExprNode::Cmp(CmpOp::Eq, slot, one));

        let result = arena.eval(pred, &chunk).unwrap();
        let mask = result.as_any().downcast_ref::<BooleanArray>().unwrap();
        assert!(mask.value(0));
        assert!(mask.is_null(1));
    }

    #[test]
    fn kleene_logic() {
        let chunk = chunk_i32(1, vec![Some(1)]);
        let mut arena = ExprArena::default();
        let null_lit = arena.push(ExprNode::Literal(LiteralValue::Null));
        let one = arena.push(ExprNode::Literal(LiteralValue::Int64(1)));
        let null_cmp = arena.push(ExprNode::Cmp(CmpOp::Eq, null_lit, one));
        let false_lit = arena.push(ExprNode::Literal(LiteralValue::Bool(false)));
        let true_lit = arena.push(ExprNode::Literal(LiteralValue::Bool(true)));

        let and_false = arena.push(ExprNode::And(null_cmp, false_lit));
        let result = arena.eval(and_false, &chunk).unwrap();
        let mask = result.as_any().downcast_ref::<BooleanArray>().unwrap();
        assert!(!mask.value(0));

        let or_true = arena.push(ExprNode::Or(null_cmp, true_lit));
        let result = arena.eval(or_true, &chunk).unwrap();
        let mask = result.as_any().downcast_ref::<BooleanArray>().unwrap();
        assert!(mask.value(0));
    }
}
