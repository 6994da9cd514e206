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

//! Common table operations shared by the kernels

use std::sync::Arc;

use arrow::array::{Array, StringArray};
use arrow::compute::concat;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;

use crate::error::{Error, Result};

/// Concatenate batches with identical schemas into one.
///
/// Schemas must agree on column names and types; nullability widens to the
/// union. Incompatible partials are a [`Error::SchemaMismatch`].
pub fn concat_tables(batches: &[RecordBatch]) -> Result<RecordBatch> {
    let first = batches.first().ok_or_else(|| {
        Error::Internal("concat_tables requires at least one batch".to_string())
    })?;
    let first_schema = first.schema();

    for batch in &batches[1..] {
        let schema = batch.schema();
        if schema.fields().len() != first_schema.fields().len() {
            return Err(Error::SchemaMismatch(format!(
                "cannot concatenate {} columns with {} columns",
                schema.fields().len(),
                first_schema.fields().len()
            )));
        }
        for (a, b) in first_schema.fields().iter().zip(schema.fields()) {
            if a.name() != b.name() || a.data_type() != b.data_type() {
                return Err(Error::SchemaMismatch(format!(
                    "cannot concatenate column '{} {}' with '{} {}'",
                    a.name(),
                    a.data_type(),
                    b.name(),
                    b.data_type()
                )));
            }
        }
    }

    let fields: Vec<Field> = first_schema
        .fields()
        .iter()
        .enumerate()
        .map(|(i, field)| {
            let nullable = batches.iter().any(|b| b.schema().field(i).is_nullable());
            Field::new(field.name().as_str(), field.data_type().clone(), nullable)
        })
        .collect();

    let columns = (0..first_schema.fields().len())
        .map(|i| {
            let arrays: Vec<&dyn Array> =
                batches.iter().map(|b| b.column(i).as_ref()).collect();
            concat(&arrays).map_err(Into::into)
        })
        .collect::<Result<Vec<_>>>()?;

    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns).map_err(Into::into)
}

/// Whether concatenating the string columns of these batches would push a
/// character-offset column past the 32-bit limit. The concatenation itself
/// still proceeds; callers log and let the eventual failure surface as a
/// compute error.
pub fn check_if_concatenating_strings_will_overflow(batches: &[RecordBatch]) -> bool {
    let Some(first) = batches.first() else {
        return false;
    };
    let schema = first.schema();
    for (i, field) in schema.fields().iter().enumerate() {
        if field.data_type() != &DataType::Utf8 {
            continue;
        }
        let mut total_bytes: i64 = 0;
        for batch in batches {
            if i >= batch.num_columns() {
                continue;
            }
            if let Some(array) = batch.column(i).as_any().downcast_ref::<StringArray>() {
                let offsets = array.value_offsets();
                let bytes = offsets[array.len()] - offsets[0];
                total_bytes += bytes as i64;
            }
        }
        if total_bytes > i32::MAX as i64 {
            return true;
        }
    }
    false
}

/// An empty batch sharing the given batch's schema
pub fn create_empty_table(batch: &RecordBatch) -> RecordBatch {
    RecordBatch::new_empty(batch.schema())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;

    fn batch(name: &str, values: Vec<i64>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new(name, DataType::Int64, true)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values))]).unwrap()
    }

    #[test]
    fn concat_preserves_order() {
        let result = concat_tables(&[batch("v", vec![1, 2]), batch("v", vec![3])]).unwrap();
        assert_eq!(result.num_rows(), 3);
        let column = result
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        let values: Vec<i64> = (0..column.len()).map(|i| column.value(i)).collect();
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[test]
    fn concat_rejects_mismatched_schemas() {
        let err = concat_tables(&[batch("a", vec![1]), batch("b", vec![2])]).unwrap_err();
        assert!(matches!(err, Error::SchemaMismatch(_)));
    }

    #[test]
    fn concat_of_nothing_is_internal_error() {
        assert!(matches!(concat_tables(&[]), Err(Error::Internal(_))));
    }

    #[test]
    fn small_string_columns_do_not_overflow() {
        let schema = Arc::new(Schema::new(vec![Field::new("s", DataType::Utf8, true)]));
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(StringArray::from(vec!["alpha", "beta"]))],
        )
        .unwrap();
        assert!(!check_if_concatenating_strings_will_overflow(&[
            batch.clone(),
            batch
        ]));
    }

    #[test]
    fn empty_table_keeps_schema() {
        let source = batch("v", vec![1, 2]);
        let empty = create_empty_table(&source);
        assert_eq!(empty.num_rows(), 0);
        assert_eq!(empty.schema(), source.schema());
    }
}
