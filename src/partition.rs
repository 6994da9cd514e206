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

//! Deterministic hash partitioning of batches.
//!
//! Rows are bucketed by hashing the designated columns with a fixed-seed
//! hasher, so every node of a cluster routes equal keys to the same peer
//! without coordination. `hash_partition` rearranges a batch into
//! contiguous per-bucket segments and reports cudf-style begin offsets
//! (first offset always 0); `split` then cuts the rearranged batch at the
//! remaining offsets into zero-copy views.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, BooleanArray, Int64Array, StringArray, UInt64Array};
use arrow::compute::take;
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;

use crate::error::{Error, Result};

/// Hash of a null cell; any fixed odd constant works, it only has to be
/// identical on every node
const NULL_HASH: u64 = 0x9e37_79b9_7f4a_7c15;

fn combine_hashes(l: u64, r: u64) -> u64 {
    l ^ r
        .wrapping_add(NULL_HASH)
        .wrapping_add(l << 6)
        .wrapping_add(l >> 2)
}

/// Hash every row of the given arrays into `hashes_buf`, combining columns
/// left to right. Uses a fixed random state so all nodes agree.
pub fn create_hashes(
    arrays: &[ArrayRef],
    random_state: &ahash::RandomState,
    hashes_buf: &mut Vec<u64>,
) -> Result<()> {
    for (i, array) in arrays.iter().enumerate() {
        let first_column = i == 0;
        match array.data_type() {
            DataType::Int64 => {
                let array = array
                    .as_any()
                    .downcast_ref::<Int64Array>()
                    .ok_or_else(|| Error::Internal("hash column downcast failed".to_string()))?;
                for (row, hash) in hashes_buf.iter_mut().enumerate() {
                    let value_hash = if array.is_null(row) {
                        NULL_HASH
                    } else {
                        random_state.hash_one(array.value(row))
                    };
                    *hash = if first_column {
                        value_hash
                    } else {
                        combine_hashes(*hash, value_hash)
                    };
                }
            }
            DataType::Utf8 => {
                let array = array
                    .as_any()
                    .downcast_ref::<StringArray>()
                    .ok_or_else(|| Error::Internal("hash column downcast failed".to_string()))?;
                for (row, hash) in hashes_buf.iter_mut().enumerate() {
                    let value_hash = if array.is_null(row) {
                        NULL_HASH
                    } else {
                        random_state.hash_one(array.value(row))
                    };
                    *hash = if first_column {
                        value_hash
                    } else {
                        combine_hashes(*hash, value_hash)
                    };
                }
            }
            DataType::Boolean => {
                let array = array
                    .as_any()
                    .downcast_ref::<BooleanArray>()
                    .ok_or_else(|| Error::Internal("hash column downcast failed".to_string()))?;
                for (row, hash) in hashes_buf.iter_mut().enumerate() {
                    let value_hash = if array.is_null(row) {
                        NULL_HASH
                    } else {
                        random_state.hash_one(array.value(row))
                    };
                    *hash = if first_column {
                        value_hash
                    } else {
                        combine_hashes(*hash, value_hash)
                    };
                }
            }
            other => {
                return Err(Error::Compute(format!(
                    "unsupported type for hash partitioning: {other}"
                )))
            }
        }
    }
    Ok(())
}

/// Rearrange `batch` into `num_partitions` contiguous segments by hashing
/// the designated columns. Returns the rearranged batch and the begin
/// offset of every segment; the first offset is always 0 and callers pass
/// the rest to [`split`].
pub fn hash_partition(
    batch: &RecordBatch,
    columns_to_hash: &[usize],
    num_partitions: usize,
) -> Result<(RecordBatch, Vec<usize>)> {
    if num_partitions == 0 {
        return Err(Error::Internal(
            "hash_partition requires at least one partition".to_string(),
        ));
    }
    if batch.num_rows() == 0 {
        return Ok((batch.clone(), vec![0; num_partitions]));
    }

    let arrays: Vec<ArrayRef> = columns_to_hash
        .iter()
        .map(|&index| {
            if index >= batch.num_columns() {
                Err(Error::SchemaMismatch(format!(
                    "hash column ${index} out of range for {} columns",
                    batch.num_columns()
                )))
            } else {
                Ok(Arc::clone(batch.column(index)))
            }
        })
        .collect::<Result<_>>()?;

    // Use fixed random state
    let random_state = ahash::RandomState::with_seeds(0, 0, 0, 0);
    let mut hashes_buf = vec![0u64; batch.num_rows()];
    create_hashes(&arrays, &random_state, &mut hashes_buf)?;

    let mut indices: Vec<Vec<u64>> = vec![vec![]; num_partitions];
    for (row, hash) in hashes_buf.iter().enumerate() {
        indices[(*hash % num_partitions as u64) as usize].push(row as u64);
    }

    let mut offsets = Vec::with_capacity(num_partitions);
    let mut flat = Vec::with_capacity(batch.num_rows());
    for bucket in &indices {
        offsets.push(flat.len());
        flat.extend_from_slice(bucket);
    }

    let take_indices = UInt64Array::from(flat);
    let columns = batch
        .columns()
        .iter()
        .map(|column| {
            take(column.as_ref(), &take_indices, None)
                .map_err(|e| Error::Compute(e.to_string()))
        })
        .collect::<Result<Vec<_>>>()?;
    let partitioned = RecordBatch::try_new(batch.schema(), columns)?;
    Ok((partitioned, offsets))
}

/// Cut a batch at the given row boundaries into `split_indexes.len() + 1`
/// zero-copy views
pub fn split(batch: &RecordBatch, split_indexes: &[usize]) -> Result<Vec<RecordBatch>> {
    let num_rows = batch.num_rows();
    let mut views = Vec::with_capacity(split_indexes.len() + 1);
    let mut previous = 0;
    for &index in split_indexes {
        if index < previous || index > num_rows {
            return Err(Error::Internal(format!(
                "split index {index} out of order for a batch of {num_rows} rows"
            )));
        }
        views.push(batch.slice(previous, index - previous));
        previous = index;
    }
    views.push(batch.slice(previous, num_rows - previous));
    Ok(views)
}
