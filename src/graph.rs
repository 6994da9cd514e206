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

//! Wiring of the aggregation pipeline inside a query graph.
//!
//! One `AggregationPipeline` per node builds the three kernels with their
//! connecting caches, registers this node's exchange endpoints, and drives
//! the kernels' run loops concurrently. The distribute stage's output cache
//! doubles as the merge stage's input cache and as the landing zone for
//! partitions arriving from peers.

use std::sync::Arc;

use crate::cache::CacheMachine;
use crate::communication::CommunicationData;
use crate::config::EngineConfig;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::kernel::aggregate::{
    ComputeAggregateKernel, DistributeAggregateKernel, MergeAggregateKernel,
};
use crate::kernel::{Kernel, KernelStatus};

const COMPUTE_KERNEL_ID: usize = 1;
const DISTRIBUTE_KERNEL_ID: usize = 2;
const MERGE_KERNEL_ID: usize = 3;

/// The Compute -> Distribute -> Merge subgraph for one node of a query
pub struct AggregationPipeline {
    compute: Arc<ComputeAggregateKernel>,
    distribute: Arc<DistributeAggregateKernel>,
    merge: Arc<MergeAggregateKernel>,
    input: Arc<CacheMachine>,
    output: Arc<CacheMachine>,
}

impl AggregationPipeline {
    /// Build the pipeline for this node and register its exchange
    /// endpoints. Peers running the same query must build their pipelines
    /// before any of them runs, so every endpoint exists before the first
    /// partition is sent.
    pub fn try_new(
        expression: &str,
        context: Arc<Context>,
        comm: Arc<CommunicationData>,
        config: &EngineConfig,
        input_rows_hint: Option<u64>,
    ) -> Result<Self> {
        let capacity = config.cache_capacity();
        let input = Arc::new(CacheMachine::new("compute_aggregate.input", capacity));
        let partials = Arc::new(CacheMachine::new("distribute_aggregate.input", capacity));
        // the merge stage drains nothing until the stream finishes, so its
        // inbound cache must accept every partition without blocking or the
        // partition-count barrier can never be satisfied
        let shuffled = Arc::new(CacheMachine::new("merge_aggregate.input", usize::MAX));
        let output = Arc::new(CacheMachine::new("merge_aggregate.output", capacity));

        // partitions and count reports from peers land on the distribute
        // stage's output, keyed by query and kernel
        let route = format!("{}.{}", context.query_id(), DISTRIBUTE_KERNEL_ID);
        comm.network()
            .register_data_endpoint(context.self_node(), &route, Arc::clone(&shuffled));
        let counts_rx = comm
            .network()
            .register_count_endpoint(context.self_node(), &route);

        let compute = Arc::new(ComputeAggregateKernel::try_new(
            COMPUTE_KERNEL_ID,
            expression,
            Arc::clone(&context),
            Arc::clone(&input),
            Arc::clone(&partials),
            input_rows_hint,
        )?);
        let distribute = Arc::new(DistributeAggregateKernel::try_new(
            DISTRIBUTE_KERNEL_ID,
            expression,
            Arc::clone(&context),
            partials,
            Arc::clone(&shuffled),
            comm,
            route,
            counts_rx,
        )?);
        let merge = Arc::new(MergeAggregateKernel::try_new(
            MERGE_KERNEL_ID,
            expression,
            context,
            shuffled,
            Arc::clone(&output),
        )?);

        Ok(Self {
            compute,
            distribute,
            merge,
            input,
            output,
        })
    }

    /// The cache upstream feeds batches into
    pub fn input(&self) -> &Arc<CacheMachine> {
        &self.input
    }

    /// The cache downstream pulls merged results from
    pub fn output(&self) -> &Arc<CacheMachine> {
        &self.output
    }

    pub fn compute(&self) -> &Arc<ComputeAggregateKernel> {
        &self.compute
    }

    pub fn distribute(&self) -> &Arc<DistributeAggregateKernel> {
        &self.distribute
    }

    /// Drive all three kernels to completion, surfacing the first kernel
    /// error after every run loop has ended
    pub async fn run(&self) -> Result<()> {
        let compute = tokio::spawn(Arc::clone(&self.compute).run());
        let distribute = tokio::spawn(Arc::clone(&self.distribute).run());
        let merge = tokio::spawn(Arc::clone(&self.merge).run());

        let mut first_error = None;
        for handle in [compute, distribute, merge] {
            let result = handle
                .await
                .map_err(|e| Error::Internal(format!("kernel run loop panicked: {e}")));
            match result {
                Ok(Ok(KernelStatus::Proceed | KernelStatus::Stop)) => {}
                Ok(Err(e)) | Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
