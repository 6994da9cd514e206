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

//! Physical aggregation primitives.
//!
//! These are the operator seams the aggregation kernels call through: group
//! values without aggregating, aggregate without grouping, aggregate with
//! grouping, and the merge rewrite that turns an operator set into its
//! merging counterpart. Accumulators update per input row and finalize per
//! group; a partial and a final aggregation run the same code, differing
//! only in the parameters the caller passes.
//!
//! The mean is two-phase: its partial emits a sum column under the assigned
//! alias plus a count column under `alias$count`, and the rewritten mean
//! consumes that pair (`"$s,$c"`) to produce the final quotient.

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use hashbrown::{HashMap, HashSet};

use crate::error::{Error, Result};
use crate::operators::parse::{parse_column_ref, parse_column_refs};
use crate::operators::AggregateKind;

/// Typed view over one input column (or no column, for COUNT(*))
enum ColumnValues<'a> {
    None,
    Int64(&'a Int64Array),
    Float64(&'a Float64Array),
    Utf8(&'a StringArray),
    Boolean(&'a BooleanArray),
}

impl<'a> ColumnValues<'a> {
    fn from_batch(batch: &'a RecordBatch, index: usize) -> Result<Self> {
        if index >= batch.num_columns() {
            return Err(Error::SchemaMismatch(format!(
                "column reference ${} out of range for {} columns",
                index,
                batch.num_columns()
            )));
        }
        let array = batch.column(index);
        match array.data_type() {
            DataType::Int64 => array
                .as_any()
                .downcast_ref::<Int64Array>()
                .map(Self::Int64),
            DataType::Float64 => array
                .as_any()
                .downcast_ref::<Float64Array>()
                .map(Self::Float64),
            DataType::Utf8 => array.as_any().downcast_ref::<StringArray>().map(Self::Utf8),
            DataType::Boolean => array
                .as_any()
                .downcast_ref::<BooleanArray>()
                .map(Self::Boolean),
            other => {
                return Err(Error::Compute(format!(
                    "unsupported column type {other} at position {index}"
                )))
            }
        }
        .ok_or_else(|| Error::Internal(format!("column {index} downcast failed")))
    }

    fn data_type(&self) -> Option<DataType> {
        match self {
            ColumnValues::None => None,
            ColumnValues::Int64(_) => Some(DataType::Int64),
            ColumnValues::Float64(_) => Some(DataType::Float64),
            ColumnValues::Utf8(_) => Some(DataType::Utf8),
            ColumnValues::Boolean(_) => Some(DataType::Boolean),
        }
    }

    fn is_null(&self, row: usize) -> bool {
        match self {
            ColumnValues::None => false,
            ColumnValues::Int64(a) => a.is_null(row),
            ColumnValues::Float64(a) => a.is_null(row),
            ColumnValues::Utf8(a) => a.is_null(row),
            ColumnValues::Boolean(a) => a.is_null(row),
        }
    }

    /// Numeric value of the row, if the column is numeric and non-null
    fn numeric(&self, row: usize) -> Option<f64> {
        match self {
            ColumnValues::Int64(a) if !a.is_null(row) => Some(a.value(row) as f64),
            ColumnValues::Float64(a) if !a.is_null(row) => Some(a.value(row)),
            _ => None,
        }
    }
}

/// One grouping-key cell. Group keys are hash-partitioned across nodes, so
/// the supported key types mirror the hashable column types.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum GroupKey {
    Int64(Option<i64>),
    Utf8(Option<String>),
    Boolean(Option<bool>),
}

fn group_key(values: &ColumnValues, row: usize) -> GroupKey {
    match values {
        ColumnValues::Int64(a) => GroupKey::Int64((!a.is_null(row)).then(|| a.value(row))),
        ColumnValues::Utf8(a) => {
            GroupKey::Utf8((!a.is_null(row)).then(|| a.value(row).to_string()))
        }
        ColumnValues::Boolean(a) => {
            GroupKey::Boolean((!a.is_null(row)).then(|| a.value(row)))
        }
        _ => GroupKey::Int64(None),
    }
}

/// Typed readers over the grouping columns, with the key-type restriction
/// applied once up front
fn group_readers<'a>(batch: &'a RecordBatch, indices: &[usize]) -> Result<Vec<ColumnValues<'a>>> {
    indices
        .iter()
        .map(|&index| {
            let values = ColumnValues::from_batch(batch, index)?;
            match values {
                ColumnValues::Int64(_) | ColumnValues::Utf8(_) | ColumnValues::Boolean(_) => {
                    Ok(values)
                }
                _ => Err(Error::Compute(format!(
                    "group keys must be integer, string, or boolean (column {index})"
                ))),
            }
        })
        .collect()
}

struct PreparedAggregate<'a> {
    kind: AggregateKind,
    alias: &'a str,
    primary: ColumnValues<'a>,
    /// Count column of a merged mean
    secondary: Option<ColumnValues<'a>>,
}

fn prepare_aggregates<'a>(
    batch: &'a RecordBatch,
    input_expressions: &[String],
    types: &[AggregateKind],
    aliases: &'a [String],
) -> Result<Vec<PreparedAggregate<'a>>> {
    if input_expressions.len() != types.len() || aliases.len() != types.len() {
        return Err(Error::Internal(format!(
            "aggregate descriptor arity mismatch: {} expressions, {} types, {} aliases",
            input_expressions.len(),
            types.len(),
            aliases.len()
        )));
    }
    types
        .iter()
        .zip(input_expressions)
        .zip(aliases)
        .map(|((kind, expression), alias)| {
            let (primary, secondary) = match kind {
                AggregateKind::CountAll => (ColumnValues::None, None),
                AggregateKind::Mean => {
                    let refs = parse_column_refs(expression)?;
                    match refs.as_slice() {
                        [value] => (ColumnValues::from_batch(batch, *value)?, None),
                        [sum, count] => (
                            ColumnValues::from_batch(batch, *sum)?,
                            Some(ColumnValues::from_batch(batch, *count)?),
                        ),
                        _ => {
                            return Err(Error::Parse(format!(
                                "AVG expects one or two column references, got '{expression}'"
                            )))
                        }
                    }
                }
                _ => (
                    ColumnValues::from_batch(batch, parse_column_ref(expression)?)?,
                    None,
                ),
            };
            Ok(PreparedAggregate {
                kind: *kind,
                alias: alias.as_str(),
                primary,
                secondary,
            })
        })
        .collect()
}

/// Output fields an aggregate contributes; a partial mean contributes two
fn output_fields(prepared: &PreparedAggregate) -> Result<Vec<Field>> {
    let unsupported = |kind: &AggregateKind, prepared: &PreparedAggregate| {
        Error::Compute(format!(
            "{} does not support input type {:?}",
            kind,
            prepared.primary.data_type()
        ))
    };
    let fields = match prepared.kind {
        AggregateKind::Sum | AggregateKind::Sum0 => match prepared.primary.data_type() {
            Some(DataType::Int64) => vec![Field::new(prepared.alias, DataType::Int64, true)],
            Some(DataType::Float64) => vec![Field::new(prepared.alias, DataType::Float64, true)],
            _ => return Err(unsupported(&prepared.kind, prepared)),
        },
        AggregateKind::CountValid | AggregateKind::CountAll | AggregateKind::CountDistinct => {
            vec![Field::new(prepared.alias, DataType::Int64, true)]
        }
        AggregateKind::Min | AggregateKind::Max | AggregateKind::NthElement => {
            match prepared.primary.data_type() {
                Some(data_type @ (DataType::Int64 | DataType::Float64 | DataType::Utf8)) => {
                    vec![Field::new(prepared.alias, data_type, true)]
                }
                _ => return Err(unsupported(&prepared.kind, prepared)),
            }
        }
        AggregateKind::Mean => {
            if prepared.secondary.is_some() {
                vec![Field::new(prepared.alias, DataType::Float64, true)]
            } else {
                vec![
                    Field::new(prepared.alias, DataType::Float64, true),
                    Field::new(format!("{}$count", prepared.alias), DataType::Int64, true),
                ]
            }
        }
    };
    Ok(fields)
}

/// Per-group running state of one aggregate
enum Accumulator {
    SumInt(Option<i64>),
    SumFloat(Option<f64>),
    Sum0Int(i64),
    Sum0Float(f64),
    Count { n: i64, all_rows: bool },
    MinMaxInt { value: Option<i64>, min: bool },
    MinMaxFloat { value: Option<f64>, min: bool },
    MinMaxUtf8 { value: Option<String>, min: bool },
    MeanPartial { sum: f64, count: i64 },
    MeanMerge { sum: f64, count: i64 },
    NthInt { value: Option<i64>, taken: bool },
    NthFloat { value: Option<f64>, taken: bool },
    NthUtf8 { value: Option<String>, taken: bool },
    DistinctInt(HashSet<i64>),
    DistinctUtf8(HashSet<String>),
    DistinctBool(HashSet<bool>),
}

/// One finalized cell
enum AggResult {
    Int(Option<i64>),
    Float(Option<f64>),
    Str(Option<String>),
}

fn new_accumulator(prepared: &PreparedAggregate) -> Result<Accumulator> {
    let acc = match (prepared.kind, prepared.primary.data_type()) {
        (AggregateKind::Sum, Some(DataType::Int64)) => Accumulator::SumInt(None),
        (AggregateKind::Sum, Some(DataType::Float64)) => Accumulator::SumFloat(None),
        (AggregateKind::Sum0, Some(DataType::Int64)) => Accumulator::Sum0Int(0),
        (AggregateKind::Sum0, Some(DataType::Float64)) => Accumulator::Sum0Float(0.0),
        (AggregateKind::CountValid, Some(_)) => Accumulator::Count {
            n: 0,
            all_rows: false,
        },
        (AggregateKind::CountAll, _) => Accumulator::Count {
            n: 0,
            all_rows: true,
        },
        (AggregateKind::Min, Some(DataType::Int64)) => Accumulator::MinMaxInt {
            value: None,
            min: true,
        },
        (AggregateKind::Min, Some(DataType::Float64)) => Accumulator::MinMaxFloat {
            value: None,
            min: true,
        },
        (AggregateKind::Min, Some(DataType::Utf8)) => Accumulator::MinMaxUtf8 {
            value: None,
            min: true,
        },
        (AggregateKind::Max, Some(DataType::Int64)) => Accumulator::MinMaxInt {
            value: None,
            min: false,
        },
        (AggregateKind::Max, Some(DataType::Float64)) => Accumulator::MinMaxFloat {
            value: None,
            min: false,
        },
        (AggregateKind::Max, Some(DataType::Utf8)) => Accumulator::MinMaxUtf8 {
            value: None,
            min: false,
        },
        (AggregateKind::Mean, Some(DataType::Int64 | DataType::Float64)) => {
            if prepared.secondary.is_some() {
                Accumulator::MeanMerge { sum: 0.0, count: 0 }
            } else {
                Accumulator::MeanPartial { sum: 0.0, count: 0 }
            }
        }
        (AggregateKind::NthElement, Some(DataType::Int64)) => Accumulator::NthInt {
            value: None,
            taken: false,
        },
        (AggregateKind::NthElement, Some(DataType::Float64)) => Accumulator::NthFloat {
            value: None,
            taken: false,
        },
        (AggregateKind::NthElement, Some(DataType::Utf8)) => Accumulator::NthUtf8 {
            value: None,
            taken: false,
        },
        (AggregateKind::CountDistinct, Some(DataType::Int64)) => {
            Accumulator::DistinctInt(HashSet::new())
        }
        (AggregateKind::CountDistinct, Some(DataType::Utf8)) => {
            Accumulator::DistinctUtf8(HashSet::new())
        }
        (AggregateKind::CountDistinct, Some(DataType::Boolean)) => {
            Accumulator::DistinctBool(HashSet::new())
        }
        (kind, data_type) => {
            return Err(Error::Compute(format!(
                "{kind} does not support input type {data_type:?}"
            )))
        }
    };
    Ok(acc)
}

impl Accumulator {
    fn update(
        &mut self,
        primary: &ColumnValues,
        secondary: Option<&ColumnValues>,
        row: usize,
    ) -> Result<()> {
        match (self, primary) {
            (Accumulator::SumInt(acc), ColumnValues::Int64(a)) => {
                if !a.is_null(row) {
                    let v = a.value(row);
                    let updated = match *acc {
                        Some(current) => current.checked_add(v).ok_or_else(|| {
                            Error::Compute("SUM overflow on int64 column".to_string())
                        })?,
                        None => v,
                    };
                    *acc = Some(updated);
                }
            }
            (Accumulator::SumFloat(acc), ColumnValues::Float64(a)) => {
                if !a.is_null(row) {
                    *acc = Some(acc.unwrap_or(0.0) + a.value(row));
                }
            }
            (Accumulator::Sum0Int(acc), ColumnValues::Int64(a)) => {
                if !a.is_null(row) {
                    *acc = acc.checked_add(a.value(row)).ok_or_else(|| {
                        Error::Compute("SUM0 overflow on int64 column".to_string())
                    })?;
                }
            }
            (Accumulator::Sum0Float(acc), ColumnValues::Float64(a)) => {
                if !a.is_null(row) {
                    *acc += a.value(row);
                }
            }
            (Accumulator::Count { n, all_rows: true }, _) => *n += 1,
            (Accumulator::Count { n, all_rows: false }, values) => {
                if !values.is_null(row) {
                    *n += 1;
                }
            }
            (Accumulator::MinMaxInt { value, min }, ColumnValues::Int64(a)) => {
                if !a.is_null(row) {
                    let v = a.value(row);
                    *value = Some(match *value {
                        None => v,
                        Some(current) if (*min && v < current) || (!*min && v > current) => v,
                        Some(current) => current,
                    });
                }
            }
            (Accumulator::MinMaxFloat { value, min }, ColumnValues::Float64(a)) => {
                if !a.is_null(row) {
                    let v = a.value(row);
                    *value = Some(match *value {
                        None => v,
                        Some(current) if (*min && v < current) || (!*min && v > current) => v,
                        Some(current) => current,
                    });
                }
            }
            (Accumulator::MinMaxUtf8 { value, min }, ColumnValues::Utf8(a)) => {
                if !a.is_null(row) {
                    let v = a.value(row);
                    let replace = match value.as_deref() {
                        None => true,
                        Some(current) => (*min && v < current) || (!*min && v > current),
                    };
                    if replace {
                        *value = Some(v.to_string());
                    }
                }
            }
            (Accumulator::MeanPartial { sum, count }, values) => {
                if let Some(v) = values.numeric(row) {
                    *sum += v;
                    *count += 1;
                }
            }
            (Accumulator::MeanMerge { sum, count }, values) => {
                if let Some(v) = values.numeric(row) {
                    *sum += v;
                }
                if let Some(c) = secondary.and_then(|s| s.numeric(row)) {
                    *count += c as i64;
                }
            }
            (Accumulator::NthInt { value, taken }, ColumnValues::Int64(a)) => {
                if !*taken {
                    *taken = true;
                    *value = (!a.is_null(row)).then(|| a.value(row));
                }
            }
            (Accumulator::NthFloat { value, taken }, ColumnValues::Float64(a)) => {
                if !*taken {
                    *taken = true;
                    *value = (!a.is_null(row)).then(|| a.value(row));
                }
            }
            (Accumulator::NthUtf8 { value, taken }, ColumnValues::Utf8(a)) => {
                if !*taken {
                    *taken = true;
                    *value = (!a.is_null(row)).then(|| a.value(row).to_string());
                }
            }
            (Accumulator::DistinctInt(seen), ColumnValues::Int64(a)) => {
                if !a.is_null(row) {
                    seen.insert(a.value(row));
                }
            }
            (Accumulator::DistinctUtf8(seen), ColumnValues::Utf8(a)) => {
                if !a.is_null(row) {
                    seen.insert(a.value(row).to_string());
                }
            }
            (Accumulator::DistinctBool(seen), ColumnValues::Boolean(a)) => {
                if !a.is_null(row) {
                    seen.insert(a.value(row));
                }
            }
            _ => {
                return Err(Error::Internal(
                    "accumulator and input column type diverged".to_string(),
                ))
            }
        }
        Ok(())
    }

    fn finish(self) -> Vec<AggResult> {
        match self {
            Accumulator::SumInt(v) => vec![AggResult::Int(v)],
            Accumulator::SumFloat(v) => vec![AggResult::Float(v)],
            Accumulator::Sum0Int(v) => vec![AggResult::Int(Some(v))],
            Accumulator::Sum0Float(v) => vec![AggResult::Float(Some(v))],
            Accumulator::Count { n, .. } => vec![AggResult::Int(Some(n))],
            Accumulator::MinMaxInt { value, .. } => vec![AggResult::Int(value)],
            Accumulator::MinMaxFloat { value, .. } => vec![AggResult::Float(value)],
            Accumulator::MinMaxUtf8 { value, .. } => vec![AggResult::Str(value)],
            Accumulator::MeanPartial { sum, count } => vec![
                AggResult::Float((count > 0).then_some(sum)),
                AggResult::Int(Some(count)),
            ],
            Accumulator::MeanMerge { sum, count } => {
                vec![AggResult::Float((count > 0).then(|| sum / count as f64))]
            }
            Accumulator::NthInt { value, .. } => vec![AggResult::Int(value)],
            Accumulator::NthFloat { value, .. } => vec![AggResult::Float(value)],
            Accumulator::NthUtf8 { value, .. } => vec![AggResult::Str(value)],
            Accumulator::DistinctInt(seen) => vec![AggResult::Int(Some(seen.len() as i64))],
            Accumulator::DistinctUtf8(seen) => vec![AggResult::Int(Some(seen.len() as i64))],
            Accumulator::DistinctBool(seen) => vec![AggResult::Int(Some(seen.len() as i64))],
        }
    }
}

/// Assemble one aggregate's output columns from its finalized cells
fn agg_result_columns(fields: &[Field], results: Vec<Vec<AggResult>>) -> Result<Vec<ArrayRef>> {
    (0..fields.len())
        .map(|j| {
            let column: ArrayRef = match fields[j].data_type() {
                DataType::Int64 => {
                    let values = results
                        .iter()
                        .map(|row| match &row[j] {
                            AggResult::Int(v) => Ok(*v),
                            _ => Err(Error::Internal("aggregate cell type diverged".to_string())),
                        })
                        .collect::<Result<Vec<_>>>()?;
                    Arc::new(Int64Array::from(values))
                }
                DataType::Float64 => {
                    let values = results
                        .iter()
                        .map(|row| match &row[j] {
                            AggResult::Float(v) => Ok(*v),
                            _ => Err(Error::Internal("aggregate cell type diverged".to_string())),
                        })
                        .collect::<Result<Vec<_>>>()?;
                    Arc::new(Float64Array::from(values))
                }
                DataType::Utf8 => {
                    let values = results
                        .iter()
                        .map(|row| match &row[j] {
                            AggResult::Str(v) => Ok(v.clone()),
                            _ => Err(Error::Internal("aggregate cell type diverged".to_string())),
                        })
                        .collect::<Result<Vec<_>>>()?;
                    Arc::new(StringArray::from(values))
                }
                other => {
                    return Err(Error::Internal(format!(
                        "unexpected aggregate output type {other}"
                    )))
                }
            };
            Ok(column)
        })
        .collect()
}

/// Rebuild one grouping column from the collected keys
fn build_group_column(
    prototype: &ColumnValues,
    keys: &[Vec<GroupKey>],
    column: usize,
) -> Result<ArrayRef> {
    let array: ArrayRef = match prototype {
        ColumnValues::Int64(_) => Arc::new(Int64Array::from(
            keys.iter()
                .map(|key| match &key[column] {
                    GroupKey::Int64(v) => *v,
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        ColumnValues::Utf8(_) => Arc::new(StringArray::from(
            keys.iter()
                .map(|key| match &key[column] {
                    GroupKey::Utf8(v) => v.clone(),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        ColumnValues::Boolean(_) => Arc::new(BooleanArray::from(
            keys.iter()
                .map(|key| match &key[column] {
                    GroupKey::Boolean(v) => *v,
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        _ => {
            return Err(Error::Internal(
                "group column reader lost its type".to_string(),
            ))
        }
    };
    Ok(array)
}

fn group_fields(batch: &RecordBatch, indices: &[usize]) -> Vec<Field> {
    indices
        .iter()
        .map(|&index| {
            let field = batch.schema().field(index).clone();
            Field::new(field.name().as_str(), field.data_type().clone(), true)
        })
        .collect()
}

/// Distinct tuples of the grouping columns; the group-only form of the
/// aggregate kernels
pub fn compute_groupby_without_aggregations(
    batch: &RecordBatch,
    group_indices: &[usize],
) -> Result<RecordBatch> {
    let readers = group_readers(batch, group_indices)?;
    let mut slots: HashMap<Vec<GroupKey>, usize> = HashMap::new();
    let mut keys: Vec<Vec<GroupKey>> = Vec::new();
    for row in 0..batch.num_rows() {
        let key: Vec<GroupKey> = readers.iter().map(|r| group_key(r, row)).collect();
        if !slots.contains_key(&key) {
            slots.insert(key.clone(), keys.len());
            keys.push(key);
        }
    }
    let columns = readers
        .iter()
        .enumerate()
        .map(|(c, reader)| build_group_column(reader, &keys, c))
        .collect::<Result<Vec<_>>>()?;
    let schema = Arc::new(Schema::new(group_fields(batch, group_indices)));
    RecordBatch::try_new(schema, columns).map_err(Into::into)
}

/// Scalar aggregation: one output row regardless of input cardinality
pub fn compute_aggregations_without_groupby(
    batch: &RecordBatch,
    input_expressions: &[String],
    types: &[AggregateKind],
    aliases: &[String],
) -> Result<RecordBatch> {
    let prepared = prepare_aggregates(batch, input_expressions, types, aliases)?;
    let mut fields = Vec::new();
    let mut columns = Vec::new();
    for aggregate in &prepared {
        let mut accumulator = new_accumulator(aggregate)?;
        for row in 0..batch.num_rows() {
            accumulator.update(&aggregate.primary, aggregate.secondary.as_ref(), row)?;
        }
        let aggregate_fields = output_fields(aggregate)?;
        columns.extend(agg_result_columns(
            &aggregate_fields,
            vec![accumulator.finish()],
        )?);
        fields.extend(aggregate_fields);
    }
    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns).map_err(Into::into)
}

/// Grouped aggregation: one output row per distinct group-key tuple
pub fn compute_aggregations_with_groupby(
    batch: &RecordBatch,
    input_expressions: &[String],
    types: &[AggregateKind],
    aliases: &[String],
    group_indices: &[usize],
) -> Result<RecordBatch> {
    let readers = group_readers(batch, group_indices)?;
    let prepared = prepare_aggregates(batch, input_expressions, types, aliases)?;

    let mut slots: HashMap<Vec<GroupKey>, usize> = HashMap::new();
    let mut keys: Vec<Vec<GroupKey>> = Vec::new();
    let mut accumulators: Vec<Vec<Accumulator>> =
        prepared.iter().map(|_| Vec::new()).collect();

    for row in 0..batch.num_rows() {
        let key: Vec<GroupKey> = readers.iter().map(|r| group_key(r, row)).collect();
        let slot = match slots.get(&key) {
            Some(slot) => *slot,
            None => {
                let slot = keys.len();
                slots.insert(key.clone(), slot);
                keys.push(key);
                for (i, aggregate) in prepared.iter().enumerate() {
                    accumulators[i].push(new_accumulator(aggregate)?);
                }
                slot
            }
        };
        for (i, aggregate) in prepared.iter().enumerate() {
            accumulators[i][slot].update(
                &aggregate.primary,
                aggregate.secondary.as_ref(),
                row,
            )?;
        }
    }

    let mut fields = group_fields(batch, group_indices);
    let mut columns = readers
        .iter()
        .enumerate()
        .map(|(c, reader)| build_group_column(reader, &keys, c))
        .collect::<Result<Vec<_>>>()?;
    for (i, aggregate) in prepared.iter().enumerate() {
        let aggregate_fields = output_fields(aggregate)?;
        let results = std::mem::take(&mut accumulators[i])
            .into_iter()
            .map(Accumulator::finish)
            .collect();
        columns.extend(agg_result_columns(&aggregate_fields, results)?);
        fields.extend(aggregate_fields);
    }
    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns).map_err(Into::into)
}

/// Partial stage of COUNT(DISTINCT ..): the deduplicated (group keys,
/// argument) tuples, with the argument column renamed to the assigned
/// alias. Hash partitioning on the group keys co-locates every tuple of a
/// group, so the merge can count distinct values exactly.
pub fn compute_distinct_partial(
    batch: &RecordBatch,
    group_indices: &[usize],
    input_expression: &str,
    alias: &str,
) -> Result<RecordBatch> {
    let argument = parse_column_ref(input_expression)?;
    let mut indices = group_indices.to_vec();
    indices.push(argument);
    let distinct = compute_groupby_without_aggregations(batch, &indices)?;
    let fields: Vec<Field> = distinct
        .schema()
        .fields()
        .iter()
        .enumerate()
        .map(|(i, field)| {
            if i == indices.len() - 1 {
                Field::new(alias, field.data_type().clone(), true)
            } else {
                field.as_ref().clone()
            }
        })
        .collect();
    RecordBatch::try_new(Arc::new(Schema::new(fields)), distinct.columns().to_vec())
        .map_err(Into::into)
}

/// Rewrite an operator set into its merging counterpart.
///
/// Partial outputs lay the group columns first and the aggregate columns
/// after, so the rewritten group indices are simply `0..group_len` and the
/// rewritten input expressions are regenerated positionally. A COUNT
/// becomes a SUM of partial counts; a mean consumes its partial sum/count
/// pair; everything else merges as itself. Applying the rewrite twice
/// yields the same quadruple as applying it once.
pub fn mod_group_by_parameters_for_merge(
    group_column_indices: &[usize],
    aggregation_types: &[AggregateKind],
    merging_column_names: &[String],
) -> Result<(Vec<usize>, Vec<String>, Vec<AggregateKind>, Vec<String>)> {
    let mod_group_column_indices: Vec<usize> = (0..group_column_indices.len()).collect();
    let mut mod_aggregation_input_expressions = Vec::with_capacity(aggregation_types.len());
    let mut mod_aggregation_types = Vec::with_capacity(aggregation_types.len());
    let mut mod_aggregation_column_assigned_aliases = Vec::with_capacity(aggregation_types.len());

    let name_at = |column: usize| -> Result<String> {
        merging_column_names.get(column).cloned().ok_or_else(|| {
            Error::SchemaMismatch(format!(
                "merge expects a partial column at position {column}, but only {} columns arrived",
                merging_column_names.len()
            ))
        })
    };

    // the aggregated columns sit right after the group by columns
    let mut column = group_column_indices.len();
    for kind in aggregation_types {
        match kind {
            AggregateKind::CountValid | AggregateKind::CountAll => {
                // a COUNT merges by summing the partial counts
                mod_aggregation_types.push(AggregateKind::Sum);
                mod_aggregation_input_expressions.push(format!("${column}"));
                mod_aggregation_column_assigned_aliases.push(name_at(column)?);
                column += 1;
            }
            AggregateKind::Mean => {
                mod_aggregation_types.push(AggregateKind::Mean);
                mod_aggregation_input_expressions.push(format!("${},${}", column, column + 1));
                mod_aggregation_column_assigned_aliases.push(name_at(column)?);
                column += 2;
            }
            other => {
                mod_aggregation_types.push(*other);
                mod_aggregation_input_expressions.push(format!("${column}"));
                mod_aggregation_column_assigned_aliases.push(name_at(column)?);
                column += 1;
            }
        }
    }

    Ok((
        mod_group_column_indices,
        mod_aggregation_input_expressions,
        mod_aggregation_types,
        mod_aggregation_column_assigned_aliases,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema_kv() -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("k", DataType::Int64, true),
            Field::new("v", DataType::Int64, true),
        ]))
    }

    fn batch_kv(k: Vec<Option<i64>>, v: Vec<Option<i64>>) -> RecordBatch {
        RecordBatch::try_new(
            schema_kv(),
            vec![
                Arc::new(Int64Array::from(k)),
                Arc::new(Int64Array::from(v)),
            ],
        )
        .unwrap()
    }

    fn int_column(batch: &RecordBatch, index: usize) -> Vec<Option<i64>> {
        let array = batch
            .column(index)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        (0..array.len())
            .map(|i| (!array.is_null(i)).then(|| array.value(i)))
            .collect()
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn grouped_sum_and_count() {
        let batch = batch_kv(
            vec![Some(1), Some(1), Some(2), None],
            vec![Some(10), None, Some(20), Some(5)],
        );
        let result = compute_aggregations_with_groupby(
            &batch,
            &strings(&["$1", "$1", ""]),
            &[
                AggregateKind::Sum,
                AggregateKind::CountValid,
                AggregateKind::CountAll,
            ],
            &strings(&["s", "c", "n"]),
            &[0],
        )
        .unwrap();

        assert_eq!(result.num_rows(), 3);
        let mut rows: Vec<_> = (0..result.num_rows())
            .map(|i| {
                (
                    int_column(&result, 0)[i],
                    int_column(&result, 1)[i],
                    int_column(&result, 2)[i],
                    int_column(&result, 3)[i],
                )
            })
            .collect();
        rows.sort();
        assert_eq!(
            rows,
            vec![
                (None, Some(5), Some(1), Some(1)),
                (Some(1), Some(10), Some(1), Some(2)),
                (Some(2), Some(20), Some(1), Some(1)),
            ]
        );
    }

    #[test]
    fn scalar_aggregation_always_one_row() {
        let batch = batch_kv(vec![], vec![]);
        let result = compute_aggregations_without_groupby(
            &batch,
            &strings(&["$1", "$1", ""]),
            &[AggregateKind::Sum, AggregateKind::Sum0, AggregateKind::CountAll],
            &strings(&["s", "s0", "n"]),
        )
        .unwrap();
        assert_eq!(result.num_rows(), 1);
        assert_eq!(int_column(&result, 0), vec![None]);
        assert_eq!(int_column(&result, 1), vec![Some(0)]);
        assert_eq!(int_column(&result, 2), vec![Some(0)]);
    }

    #[test]
    fn mean_is_two_phase() {
        // partial over a batch: sum and count columns
        let batch = batch_kv(vec![Some(1), Some(1)], vec![Some(2), Some(4)]);
        let partial = compute_aggregations_with_groupby(
            &batch,
            &strings(&["$1"]),
            &[AggregateKind::Mean],
            &strings(&["m"]),
            &[0],
        )
        .unwrap();
        assert_eq!(partial.num_columns(), 3);
        assert_eq!(partial.schema().field(1).name(), "m");
        assert_eq!(partial.schema().field(2).name(), "m$count");

        // merge consumes the pair and divides
        let merged = compute_aggregations_with_groupby(
            &partial,
            &strings(&["$1,$2"]),
            &[AggregateKind::Mean],
            &strings(&["m"]),
            &[0],
        )
        .unwrap();
        assert_eq!(merged.num_rows(), 1);
        let mean = merged
            .column(1)
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap();
        assert!((mean.value(0) - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn distinct_partial_dedups_tuples() {
        let batch = batch_kv(
            vec![Some(1), Some(1), Some(1), Some(2)],
            vec![Some(7), Some(7), Some(8), Some(7)],
        );
        let partial = compute_distinct_partial(&batch, &[0], "$1", "d").unwrap();
        assert_eq!(partial.num_rows(), 3);
        assert_eq!(partial.schema().field(1).name(), "d");

        // merge counts distinct values per re-grouped key
        let merged = compute_aggregations_with_groupby(
            &partial,
            &strings(&["$1"]),
            &[AggregateKind::CountDistinct],
            &strings(&["d"]),
            &[0],
        )
        .unwrap();
        let mut rows: Vec<_> = (0..merged.num_rows())
            .map(|i| (int_column(&merged, 0)[i], int_column(&merged, 1)[i]))
            .collect();
        rows.sort();
        assert_eq!(rows, vec![(Some(1), Some(2)), (Some(2), Some(1))]);
    }

    #[test]
    fn groupby_without_aggregations_is_distinct() {
        let batch = batch_kv(
            vec![Some(1), Some(1), Some(2), None, None],
            vec![Some(1); 5],
        );
        let result = compute_groupby_without_aggregations(&batch, &[0]).unwrap();
        assert_eq!(result.num_rows(), 3);
    }

    #[test]
    fn sum_overflow_is_compute_error() {
        let batch = batch_kv(vec![Some(1), Some(1)], vec![Some(i64::MAX), Some(1)]);
        let err = compute_aggregations_with_groupby(
            &batch,
            &strings(&["$1"]),
            &[AggregateKind::Sum],
            &strings(&["s"]),
            &[0],
        )
        .unwrap_err();
        assert!(matches!(err, Error::Compute(_)));
    }

    #[test]
    fn float_group_keys_are_rejected() {
        let schema = Arc::new(Schema::new(vec![Field::new("f", DataType::Float64, true)]));
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(Float64Array::from(vec![Some(1.0)]))],
        )
        .unwrap();
        let err = compute_groupby_without_aggregations(&batch, &[0]).unwrap_err();
        assert!(matches!(err, Error::Compute(_)));
    }

    #[test]
    fn merge_rewrite_maps_counts_to_sums() {
        let names = strings(&["k", "s", "c", "n", "m", "m$count"]);
        let (group, exprs, types, aliases) = mod_group_by_parameters_for_merge(
            &[4],
            &[
                AggregateKind::Sum,
                AggregateKind::CountValid,
                AggregateKind::CountAll,
                AggregateKind::Mean,
            ],
            &names,
        )
        .unwrap();
        assert_eq!(group, vec![0]);
        assert_eq!(
            types,
            vec![
                AggregateKind::Sum,
                AggregateKind::Sum,
                AggregateKind::Sum,
                AggregateKind::Mean,
            ]
        );
        assert_eq!(exprs, vec!["$1", "$2", "$3", "$4,$5"]);
        assert_eq!(aliases, strings(&["s", "c", "n", "m"]));
    }

    #[test]
    fn merge_rewrite_is_idempotent() {
        let names = strings(&["k", "s", "c", "m", "m$count", "d"]);
        let types = [
            AggregateKind::Sum,
            AggregateKind::CountValid,
            AggregateKind::Mean,
            AggregateKind::NthElement,
        ];
        let once = mod_group_by_parameters_for_merge(&[2], &types, &names).unwrap();
        let twice = mod_group_by_parameters_for_merge(&once.0, &once.2, &names).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn merge_rewrite_checks_partial_layout() {
        let err =
            mod_group_by_parameters_for_merge(&[0], &[AggregateKind::Sum], &strings(&["k"]))
                .unwrap_err();
        assert!(matches!(err, Error::SchemaMismatch(_)));
    }
}
