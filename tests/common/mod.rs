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

//! Shared helpers for driving aggregation pipelines in tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arrow::array::{Array, Float64Array, Int64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;

use helion::cache::CacheMachine;
use helion::communication::{CommunicationData, ExchangeNetwork, Node};
use helion::config::EngineConfig;
use helion::context::Context;
use helion::graph::AggregationPipeline;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Tests sharing one process must not share exchange routes
static NEXT_QUERY_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_query_id() -> u64 {
    NEXT_QUERY_ID.fetch_add(1, Ordering::SeqCst)
}

pub fn batch_kv(k: Vec<i64>, v: Vec<i64>) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![
        Field::new("k", DataType::Int64, true),
        Field::new("v", DataType::Int64, true),
    ]));
    RecordBatch::try_new(
        schema,
        vec![Arc::new(Int64Array::from(k)), Arc::new(Int64Array::from(v))],
    )
    .unwrap()
}

pub fn batch_k(k: Vec<i64>) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![Field::new("k", DataType::Int64, true)]));
    RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(k))]).unwrap()
}

pub fn batch_v(v: Vec<i64>) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, true)]));
    RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(v))]).unwrap()
}

pub fn i64_column(batch: &RecordBatch, index: usize) -> Vec<Option<i64>> {
    let array = batch
        .column(index)
        .as_any()
        .downcast_ref::<Int64Array>()
        .unwrap();
    (0..array.len())
        .map(|i| (!array.is_null(i)).then(|| array.value(i)))
        .collect()
}

pub fn f64_column(batch: &RecordBatch, index: usize) -> Vec<Option<f64>> {
    let array = batch
        .column(index)
        .as_any()
        .downcast_ref::<Float64Array>()
        .unwrap();
    (0..array.len())
        .map(|i| (!array.is_null(i)).then(|| array.value(i)))
        .collect()
}

/// All (column `a`, column `b`) pairs across the batches, sorted for
/// multiset comparison
pub fn sorted_pairs(
    batches: &[RecordBatch],
    a: usize,
    b: usize,
) -> Vec<(Option<i64>, Option<i64>)> {
    let mut rows: Vec<_> = batches
        .iter()
        .flat_map(|batch| {
            i64_column(batch, a)
                .into_iter()
                .zip(i64_column(batch, b))
                .collect::<Vec<_>>()
        })
        .collect();
    rows.sort();
    rows
}

pub async fn drain_cache(cache: &Arc<CacheMachine>) -> Vec<RecordBatch> {
    let mut batches = Vec::new();
    while let Some(data) = cache.pull_cache_data().await.unwrap() {
        batches.push(data.materialize().unwrap());
    }
    batches
}

/// Stand up one pipeline per input node on a shared in-process exchange,
/// feed every node its batches, run all pipelines to completion, and
/// return each node's merged output. Node 0 is the master.
pub async fn run_cluster(
    expression: &str,
    inputs: Vec<Vec<RecordBatch>>,
) -> (Vec<Vec<RecordBatch>>, Vec<AggregationPipeline>) {
    init_logging();
    let config = EngineConfig::default();
    let network = ExchangeNetwork::new();
    let query_id = next_query_id();
    let nodes: Vec<Node> = (0..inputs.len())
        .map(|i| Node::new(format!("node-{i}")))
        .collect();

    // every endpoint must exist before any pipeline runs
    let mut pipelines = Vec::with_capacity(inputs.len());
    for i in 0..inputs.len() {
        let context = Arc::new(Context::new(query_id, nodes.clone(), 0, i).unwrap());
        let comm = CommunicationData::new(nodes[i].clone(), Arc::clone(&network));
        pipelines.push(
            AggregationPipeline::try_new(expression, context, comm, &config, None).unwrap(),
        );
    }

    for (pipeline, batches) in pipelines.iter().zip(inputs) {
        for batch in batches {
            pipeline
                .input()
                .add_to_cache(batch, "", false)
                .await
                .unwrap();
        }
        pipeline.input().finish();
    }

    let runs = futures::future::join_all(pipelines.iter().map(|p| p.run()));
    let results = tokio::time::timeout(Duration::from_secs(60), runs)
        .await
        .expect("pipeline deadlocked");
    for result in results {
        result.unwrap();
    }

    let mut outputs = Vec::with_capacity(pipelines.len());
    for pipeline in &pipelines {
        outputs.push(drain_cache(pipeline.output()).await);
    }
    (outputs, pipelines)
}
