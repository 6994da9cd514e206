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

//! Scatter/send support for kernels that move data between nodes.
//!
//! A distributing kernel keeps one counter per peer: how many partitions it
//! routed there. At end-of-stream every sender reports its counters, and a
//! receiver knows all data has arrived once the sum of reported counts
//! equals the number of payloads its cache accepted. Empty partitions are
//! dropped on the sending side and never counted, which is what keeps that
//! reconciliation exact.

use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::communication::{
    CommunicationData, DataPartition, Node, PartitionCountReport,
};
use crate::error::{Error, Result};
use crate::kernel::KernelBase;

/// Kernel infrastructure for stages that scatter batches across the
/// cluster: per-peer partition counters and the end-of-stream count
/// exchange.
#[derive(Debug)]
pub struct DistributingKernel {
    base: KernelBase,
    comm: Arc<CommunicationData>,
    /// Exchange route shared by this kernel's peers across all nodes
    route: String,
    /// Partitions routed per target node id
    node_counts: Mutex<HashMap<String, u64>>,
    counts_rx: Mutex<Option<mpsc::UnboundedReceiver<PartitionCountReport>>>,
}

impl DistributingKernel {
    pub fn new(
        base: KernelBase,
        comm: Arc<CommunicationData>,
        route: impl Into<String>,
        counts_rx: mpsc::UnboundedReceiver<PartitionCountReport>,
    ) -> Self {
        Self {
            base,
            comm,
            route: route.into(),
            node_counts: Mutex::new(HashMap::new()),
            counts_rx: Mutex::new(Some(counts_rx)),
        }
    }

    pub fn base(&self) -> &KernelBase {
        &self.base
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn increment_node_count(&self, node_id: &str) {
        *self
            .node_counts
            .lock()
            .entry(node_id.to_string())
            .or_insert(0) += 1;
    }

    /// Partitions routed to the given node so far
    pub fn node_count(&self, node_id: &str) -> u64 {
        self.node_counts.lock().get(node_id).copied().unwrap_or(0)
    }

    /// Deposit a batch in this kernel's own output cache
    pub async fn add_to_output_cache(
        &self,
        batch: RecordBatch,
        message_id: &str,
        allow_empty: bool,
    ) -> Result<bool> {
        self.base
            .output_cache()
            .add_to_cache(batch, message_id, allow_empty)
            .await
    }

    /// Send a batch to a peer's matching cache.
    ///
    /// Returns whether the batch was actually transmitted: an empty batch
    /// is skipped (and must not be counted) unless `allow_empty`.
    pub async fn send_message(
        &self,
        batch: RecordBatch,
        target: &Node,
        message_id: &str,
        allow_empty: bool,
    ) -> Result<bool> {
        let is_empty = batch.num_rows() == 0;
        if is_empty && !allow_empty {
            return Ok(false);
        }
        let message = DataPartition {
            source: self.comm.self_node().id().to_string(),
            destination: target.id().to_string(),
            message_id: message_id.to_string(),
            payload: batch,
            is_empty,
        };
        self.comm.network().send_data(&self.route, message).await?;
        Ok(true)
    }

    /// Route partition `i` to peer `i`, delivering locally when the peer is
    /// this node. Every accepted delivery increments that peer's counter;
    /// empty partitions are neither delivered nor counted.
    pub async fn scatter(
        &self,
        partitions: Vec<RecordBatch>,
        message_id_prefix: &str,
    ) -> Result<()> {
        let context = self.base.context();
        let self_index = context.self_index();
        for (i, partition) in partitions.into_iter().enumerate() {
            if i == self_index {
                let added = self
                    .add_to_output_cache(partition, message_id_prefix, false)
                    .await?;
                if added {
                    self.increment_node_count(context.self_node().id());
                }
            } else {
                let target = context.node(i).clone();
                let sent = self
                    .send_message(partition, &target, message_id_prefix, false)
                    .await?;
                if sent {
                    self.increment_node_count(target.id());
                }
            }
        }
        Ok(())
    }

    /// Report to every peer the number of partitions previously routed to
    /// it. Zero counts are reported too; a peer waiting on this sender must
    /// learn that nothing is coming.
    pub fn send_total_partition_counts(&self) -> Result<()> {
        let context = self.base.context();
        let self_id = self.comm.self_node().id().to_string();
        for node in context.nodes() {
            if node.id() == self_id {
                continue;
            }
            let count = self.node_count(node.id());
            self.comm.network().send_counts(
                &self.route,
                PartitionCountReport {
                    source: self_id.clone(),
                    destination: node.id().to_string(),
                    count,
                },
            )?;
        }
        Ok(())
    }

    /// Total partitions bound for this node: its own self-count plus one
    /// report from each of the other peers. Blocks until every peer has
    /// reported.
    pub async fn get_total_partition_counts(&self) -> Result<u64> {
        let mut total = self.node_count(self.comm.self_node().id());
        let mut rx = self.counts_rx.lock().take().ok_or_else(|| {
            Error::Internal("partition counts were already collected".to_string())
        })?;
        let expected_reports = self.base.context().total_nodes() - 1;
        for _ in 0..expected_reports {
            let report = rx.recv().await.ok_or_else(|| {
                Error::Transport(
                    "count channel closed before all peers reported".to_string(),
                )
            })?;
            total += report.count;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheMachine;
    use crate::communication::ExchangeNetwork;
    use crate::context::Context;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};

    fn batch(values: Vec<i64>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, true)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values))]).unwrap()
    }

    fn make_node(
        network: &Arc<ExchangeNetwork>,
        nodes: &[Node],
        self_index: usize,
    ) -> (DistributingKernel, Arc<CacheMachine>) {
        let context = Arc::new(Context::new(9, nodes.to_vec(), 0, self_index).unwrap());
        let output = Arc::new(CacheMachine::new(
            format!("{}.out", nodes[self_index].id()),
            16,
        ));
        let route = "9.2".to_string();
        network.register_data_endpoint(&nodes[self_index], &route, Arc::clone(&output));
        let counts_rx = network.register_count_endpoint(&nodes[self_index], &route);
        let comm = CommunicationData::new(nodes[self_index].clone(), Arc::clone(network));
        let base = KernelBase::new(
            2,
            "",
            context,
            Arc::new(CacheMachine::new("in", 16)),
            Arc::clone(&output),
        );
        (DistributingKernel::new(base, comm, route, counts_rx), output)
    }

    #[tokio::test]
    async fn scatter_routes_and_counts_nonempty_partitions_only() {
        let network = ExchangeNetwork::new();
        let nodes = vec![Node::new("a"), Node::new("b")];
        let (kernel_a, out_a) = make_node(&network, &nodes, 0);
        let (_kernel_b, out_b) = make_node(&network, &nodes, 1);

        // partition 0 (self) non-empty, partition 1 (peer) empty
        kernel_a
            .scatter(vec![batch(vec![1, 2]), batch(vec![])], "")
            .await
            .unwrap();

        assert_eq!(out_a.num_batches_added(), 1);
        assert_eq!(out_b.num_batches_added(), 0);
        assert_eq!(kernel_a.node_count("a"), 1);
        assert_eq!(kernel_a.node_count("b"), 0);
    }

    #[tokio::test]
    async fn count_exchange_reconciles() {
        let network = ExchangeNetwork::new();
        let nodes = vec![Node::new("a"), Node::new("b")];
        let (kernel_a, _out_a) = make_node(&network, &nodes, 0);
        let (kernel_b, out_b) = make_node(&network, &nodes, 1);

        // a routes two partitions to b, b routes none anywhere
        kernel_a
            .scatter(vec![batch(vec![]), batch(vec![1])], "")
            .await
            .unwrap();
        kernel_a
            .scatter(vec![batch(vec![]), batch(vec![2])], "")
            .await
            .unwrap();

        kernel_a.send_total_partition_counts().unwrap();
        kernel_b.send_total_partition_counts().unwrap();

        let total_a = kernel_a.get_total_partition_counts().await.unwrap();
        let total_b = kernel_b.get_total_partition_counts().await.unwrap();
        assert_eq!(total_a, 0);
        assert_eq!(total_b, 2);
        assert_eq!(out_b.num_batches_added(), total_b);
    }

    #[tokio::test]
    async fn counts_cannot_be_collected_twice() {
        let network = ExchangeNetwork::new();
        let nodes = vec![Node::new("a")];
        let (kernel, _out) = make_node(&network, &nodes, 0);
        kernel.get_total_partition_counts().await.unwrap();
        assert!(kernel.get_total_partition_counts().await.is_err());
    }
}
