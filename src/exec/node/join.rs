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
//! Join plan contract.
//!
//! Responsibilities:
//! - Defines the join variants, the output layout description, and the immutable
//!   `JoinSpec` shared by the build and probe operators of one join node.
//! - Enforces the planner contract: key arity/type compatibility, null-aware
//!   restrictions, and output-layout legality per join variant.

use std::sync::Arc;

use arrow::datatypes::{DataType, Field, Schema, SchemaRef};

use crate::common::error::{ExecError, ExecResult};
use crate::common::ids::PlanNodeId;
use crate::exec::expr::ExprId;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
    /// Emit probe rows with at least one match.
    LeftSemiFilter,
    /// Emit build rows with at least one match.
    RightSemiFilter,
    /// Emit all probe rows with an appended boolean `match` column.
    LeftSemiProject,
    /// Emit all build rows with an appended boolean `match` column.
    RightSemiProject,
    /// Emit probe rows with no match.
    Anti,
}

/// One output column drawn from the probe or build schema. For *SemiProject
/// joins the boolean `match` column is appended automatically after these.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OutputColumn {
    Probe(usize),
    Build(usize),
}

/// Immutable join specification shared by the build and probe operators.
#[derive(Clone, Debug)]
pub struct JoinSpec {
    pub node_id: PlanNodeId,
    pub join_type: JoinType,
    pub null_aware: bool,
    /// Column indices into the probe schema; pairwise with `build_keys`.
    pub probe_keys: Vec<usize>,
    /// Column indices into the build schema.
    pub build_keys: Vec<usize>,
    /// Residual predicate over the join scope (probe columns then build columns).
    pub residual: Option<ExprId>,
    pub output_layout: Vec<OutputColumn>,
    pub probe_schema: SchemaRef,
    pub build_schema: SchemaRef,
}

impl JoinType {
    pub fn as_str(self) -> &'static str {
        match self {
            JoinType::Inner => "INNER",
            JoinType::Left => "LEFT",
            JoinType::Right => "RIGHT",
            JoinType::Full => "FULL",
            JoinType::LeftSemiFilter => "LEFT_SEMI_FILTER",
            JoinType::RightSemiFilter => "RIGHT_SEMI_FILTER",
            JoinType::LeftSemiProject => "LEFT_SEMI_PROJECT",
            JoinType::RightSemiProject => "RIGHT_SEMI_PROJECT",
            JoinType::Anti => "ANTI",
        }
    }

    pub fn supports_null_aware(self) -> bool {
        matches!(
            self,
            JoinType::Anti | JoinType::LeftSemiProject | JoinType::RightSemiProject
        )
    }

    /// Probe rows whose key is null cannot match; for these variants they also
    /// produce no output, so they are dropped before lookup.
    pub fn drops_null_probe_keys(self) -> bool {
        matches!(
            self,
            JoinType::Inner
                | JoinType::Right
                | JoinType::LeftSemiFilter
                | JoinType::RightSemiFilter
        )
    }

    /// Whether unmatched probe rows appear in the output (null-extended or as-is).
    pub fn emits_unmatched_probe(self) -> bool {
        matches!(
            self,
            JoinType::Left | JoinType::Full | JoinType::Anti | JoinType::LeftSemiProject
        )
    }

    /// Whether unmatched build rows are emitted after probe completion.
    pub fn emits_unmatched_build(self) -> bool {
        matches!(
            self,
            JoinType::Right | JoinType::Full | JoinType::RightSemiProject
        )
    }

    /// Whether the probe must track which build rows matched.
    pub fn tracks_build_matches(self) -> bool {
        matches!(
            self,
            JoinType::Right
                | JoinType::Full
                | JoinType::RightSemiFilter
                | JoinType::RightSemiProject
        )
    }

    /// Whether build rows with a null key must be retained (tagged) instead of
    /// dropped at ingest.
    pub fn build_retains_null_keys(self, null_aware: bool) -> bool {
        null_aware
            || matches!(
                self,
                JoinType::Right | JoinType::Full | JoinType::RightSemiProject
            )
    }

    /// Output references only probe columns for these variants.
    pub fn output_is_probe_only(self) -> bool {
        matches!(
            self,
            JoinType::LeftSemiFilter | JoinType::LeftSemiProject | JoinType::Anti
        )
    }

    /// Output references only build columns for these variants.
    pub fn output_is_build_only(self) -> bool {
        matches!(self, JoinType::RightSemiFilter | JoinType::RightSemiProject)
    }

    pub fn has_match_column(self) -> bool {
        matches!(self, JoinType::LeftSemiProject | JoinType::RightSemiProject)
    }

    /// An empty build side makes these variants produce no output at all, so the
    /// probe can finish without consuming its input.
    pub fn finishes_early_on_empty_build(self) -> bool {
        matches!(
            self,
            JoinType::Inner
                | JoinType::Right
                | JoinType::LeftSemiFilter
                | JoinType::RightSemiFilter
        )
    }
}

impl JoinSpec {
    /// Validate the planner contract; all violations surface as `InvalidPlan`.
    pub fn validate(&self) -> ExecResult<()> {
        if self.probe_keys.is_empty() {
            return Err(ExecError::invalid_plan("join requires at least one key"));
        }
        if self.probe_keys.len() != self.build_keys.len() {
            return Err(ExecError::invalid_plan(format!(
                "join key arity mismatch: probe={} build={}",
                self.probe_keys.len(),
                self.build_keys.len()
            )));
        }
        for (probe_idx, build_idx) in self.probe_keys.iter().zip(self.build_keys.iter()) {
            let probe_type = self.column_type(&self.probe_schema, *probe_idx, "probe")?;
            let build_type = self.column_type(&self.build_schema, *build_idx, "build")?;
            if !key_types_compatible(probe_type, build_type) {
                return Err(ExecError::invalid_plan(format!(
                    "join key type mismatch: probe {probe_type} vs build {build_type}"
                )));
            }
        }

        if self.null_aware {
            if !self.join_type.supports_null_aware() {
                return Err(ExecError::invalid_plan(format!(
                    "null-aware is not legal for {} joins",
                    self.join_type.as_str()
                )));
            }
            if self.probe_keys.len() != 1 {
                return Err(ExecError::invalid_plan(
                    "null-aware join requires exactly one key",
                ));
            }
            if self.join_type == JoinType::RightSemiProject && self.residual.is_some() {
                return Err(ExecError::invalid_plan(
                    "null-aware right semi project join does not support a residual filter",
                ));
            }
        }

        for column in &self.output_layout {
            match column {
                OutputColumn::Probe(idx) => {
                    if self.join_type.output_is_build_only() {
                        return Err(ExecError::invalid_plan(format!(
                            "{} join output cannot reference probe columns",
                            self.join_type.as_str()
                        )));
                    }
                    self.column_type(&self.probe_schema, *idx, "probe")?;
                }
                OutputColumn::Build(idx) => {
                    if self.join_type.output_is_probe_only() {
                        return Err(ExecError::invalid_plan(format!(
                            "{} join output cannot reference build columns",
                            self.join_type.as_str()
                        )));
                    }
                    self.column_type(&self.build_schema, *idx, "build")?;
                }
            }
        }
        Ok(())
    }

    fn column_type<'a>(
        &self,
        schema: &'a SchemaRef,
        idx: usize,
        side: &str,
    ) -> ExecResult<&'a DataType> {
        schema
            .fields()
            .get(idx)
            .map(|f| f.data_type())
            .ok_or_else(|| {
                ExecError::invalid_plan(format!(
                    "join {side} column index {idx} out of bounds ({} columns)",
                    schema.fields().len()
                ))
            })
    }

    pub fn build_key_types(&self) -> ExecResult<Vec<DataType>> {
        self.build_keys
            .iter()
            .map(|idx| {
                self.column_type(&self.build_schema, *idx, "build")
                    .cloned()
            })
            .collect()
    }

    /// The output schema: the layout columns in order, plus the `match` column
    /// for *SemiProject variants.
    pub fn output_schema(&self) -> ExecResult<SchemaRef> {
        let mut fields = Vec::with_capacity(self.output_layout.len() + 1);
        for column in &self.output_layout {
            let field = match column {
                OutputColumn::Probe(idx) => {
                    self.output_field(&self.probe_schema, *idx, "probe")?
                }
                OutputColumn::Build(idx) => {
                    self.output_field(&self.build_schema, *idx, "build")?
                }
            };
            fields.push(field);
        }
        if self.join_type.has_match_column() {
            fields.push(Field::new("match", DataType::Boolean, true));
        }
        Ok(Arc::new(Schema::new(fields)))
    }

    fn output_field(&self, schema: &SchemaRef, idx: usize, side: &str) -> ExecResult<Field> {
        let field = schema.fields().get(idx).ok_or_else(|| {
            ExecError::invalid_plan(format!(
                "join {side} column index {idx} out of bounds ({} columns)",
                schema.fields().len()
            ))
        })?;
        // Columns from the null-extended side of an outer join become nullable.
        let nullable = field.is_nullable()
            || match (self.join_type, side) {
                (JoinType::Left | JoinType::Full, "build") => true,
                (JoinType::Right | JoinType::Full, "probe") => true,
                _ => false,
            };
        Ok(field.as_ref().clone().with_nullable(nullable))
    }

    /// The join-scope schema (probe columns then build columns) the residual
    /// predicate is evaluated over.
    pub fn join_scope_schema(&self) -> SchemaRef {
        let mut fields = Vec::with_capacity(
            self.probe_schema.fields().len() + self.build_schema.fields().len(),
        );
        for field in self.probe_schema.fields() {
            fields.push(field.as_ref().clone().with_nullable(true));
        }
        for field in self.build_schema.fields() {
            fields.push(field.as_ref().clone().with_nullable(true));
        }
        Arc::new(Schema::new(fields))
    }
}

fn key_types_compatible(probe: &DataType, build: &DataType) -> bool {
    probe == build
}
