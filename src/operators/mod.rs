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

//! Aggregate operator library: expression parsing, the physical
//! aggregation primitives, and the merge rewrite

pub mod aggregations;
pub mod parse;

use std::fmt;

/// The closed set of aggregate operators. `do_process` dispatches on the
/// variant tag; there is no open extensibility at this layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateKind {
    Sum,
    /// SUM that yields zero instead of null over empty or all-null input
    Sum0,
    /// COUNT over a column, nulls excluded
    CountValid,
    /// COUNT(*), every row
    CountAll,
    Min,
    Max,
    Mean,
    /// First element of the group in arrival order
    NthElement,
    CountDistinct,
}

impl fmt::Display for AggregateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AggregateKind::Sum => "SUM",
            AggregateKind::Sum0 => "SUM0",
            AggregateKind::CountValid => "COUNT",
            AggregateKind::CountAll => "COUNT(*)",
            AggregateKind::Min => "MIN",
            AggregateKind::Max => "MAX",
            AggregateKind::Mean => "AVG",
            AggregateKind::NthElement => "NTH_ELEMENT",
            AggregateKind::CountDistinct => "COUNT(DISTINCT)",
        };
        write!(f, "{name}")
    }
}

/// Parsed form of a `GROUP BY` expression: the quadruple every aggregation
/// kernel works from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateSpec {
    /// Ordered positions of the grouping columns in the input schema
    pub group_column_indices: Vec<usize>,
    /// Textual argument expression per aggregate (`"$i"`; empty for
    /// COUNT(*); `"$s,$c"` for a merged mean)
    pub aggregation_input_expressions: Vec<String>,
    pub aggregation_types: Vec<AggregateKind>,
    /// Output column name per aggregate
    pub aggregation_column_assigned_aliases: Vec<String>,
}

impl AggregateSpec {
    /// Whether this is a scalar aggregation: aggregates but no group keys,
    /// producing a single row merged only on the master node
    pub fn is_scalar_aggregation(&self) -> bool {
        self.group_column_indices.is_empty() && !self.aggregation_types.is_empty()
    }
}
