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

//! Inter-node messaging for distributing kernels.
//!
//! Two message kinds cross node boundaries: data partitions bound for a
//! peer's cache, and end-of-stream partition-count reports that let each
//! receiver decide when everything has arrived. The wire encoding and RPC
//! transport live outside this crate; the [`ExchangeNetwork`] here routes
//! both kinds between the logical nodes registered in a process, which is
//! also how a multi-node cluster is driven in tests.

use std::sync::{Arc, OnceLock};

use arrow::record_batch::RecordBatch;
use hashbrown::HashMap;
use log::debug;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::cache::CacheMachine;
use crate::error::{Error, Result};

/// Identity of a worker node in the cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Node {
    id: String,
}

impl Node {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

/// A batch routed to a peer's cache
#[derive(Debug)]
pub struct DataPartition {
    pub source: String,
    pub destination: String,
    pub message_id: String,
    pub payload: RecordBatch,
    pub is_empty: bool,
}

/// End-of-stream report: how many partitions `source` routed to `destination`
#[derive(Debug, Clone)]
pub struct PartitionCountReport {
    pub source: String,
    pub destination: String,
    pub count: u64,
}

type EndpointKey = (String, String);

/// Routes messages between the logical nodes of a process.
///
/// A receiver registers its inbound cache (for data partitions) and a
/// counts listener (for partition-count reports) under a per-kernel route;
/// senders address a `(node, route)` pair. Delivery into an unregistered
/// endpoint is a [`Error::Transport`].
#[derive(Debug, Default)]
pub struct ExchangeNetwork {
    data_endpoints: Mutex<HashMap<EndpointKey, Arc<CacheMachine>>>,
    count_endpoints: Mutex<HashMap<EndpointKey, mpsc::UnboundedSender<PartitionCountReport>>>,
}

impl ExchangeNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register_data_endpoint(&self, node: &Node, route: &str, cache: Arc<CacheMachine>) {
        self.data_endpoints
            .lock()
            .insert((node.id().to_string(), route.to_string()), cache);
    }

    pub fn register_count_endpoint(
        &self,
        node: &Node,
        route: &str,
    ) -> mpsc::UnboundedReceiver<PartitionCountReport> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.count_endpoints
            .lock()
            .insert((node.id().to_string(), route.to_string()), tx);
        rx
    }

    /// Deliver a data partition into the destination's registered cache.
    ///
    /// What arrives here has already passed the sender's empty-batch
    /// filtering, so delivery always allows empties and is always counted
    /// by the receiving cache.
    pub async fn send_data(&self, route: &str, message: DataPartition) -> Result<()> {
        let cache = {
            let endpoints = self.data_endpoints.lock();
            endpoints
                .get(&(message.destination.clone(), route.to_string()))
                .cloned()
        };
        let cache = cache.ok_or_else(|| {
            Error::Transport(format!(
                "no data endpoint registered for node {} route {}",
                message.destination, route
            ))
        })?;
        debug!(
            "delivering partition {} -> {} route {} ({} rows)",
            message.source,
            message.destination,
            route,
            message.payload.num_rows()
        );
        cache
            .add_to_cache(message.payload, &message.message_id, true)
            .await?;
        Ok(())
    }

    /// Deliver a partition-count report to the destination's listener
    pub fn send_counts(&self, route: &str, report: PartitionCountReport) -> Result<()> {
        let sender = {
            let endpoints = self.count_endpoints.lock();
            endpoints
                .get(&(report.destination.clone(), route.to_string()))
                .cloned()
        };
        let sender = sender.ok_or_else(|| {
            Error::Transport(format!(
                "no count endpoint registered for node {} route {}",
                report.destination, route
            ))
        })?;
        sender.send(report).map_err(|e| {
            Error::Transport(format!(
                "count listener for route {} hung up: {}",
                route, e
            ))
        })
    }
}

/// Node identity plus the exchange fabric it sends through.
///
/// Production bootstrap installs one instance per process via
/// [`CommunicationData::initialize`]; a multi-node test harness constructs
/// one per logical node instead and hands it to the pipeline builder.
#[derive(Debug)]
pub struct CommunicationData {
    self_node: Node,
    network: Arc<ExchangeNetwork>,
}

static INSTANCE: OnceLock<Arc<CommunicationData>> = OnceLock::new();

impl CommunicationData {
    pub fn new(self_node: Node, network: Arc<ExchangeNetwork>) -> Arc<Self> {
        Arc::new(Self { self_node, network })
    }

    /// Install the process-wide instance. Returns false if one was already
    /// installed (the existing instance is kept).
    pub fn initialize(data: Arc<CommunicationData>) -> bool {
        INSTANCE.set(data).is_ok()
    }

    /// The process-wide instance installed by bootstrap
    pub fn instance() -> Result<Arc<CommunicationData>> {
        INSTANCE.get().cloned().ok_or_else(|| {
            Error::Internal("CommunicationData used before initialization".to_string())
        })
    }

    pub fn self_node(&self) -> &Node {
        &self.self_node
    }

    pub fn network(&self) -> &Arc<ExchangeNetwork> {
        &self.network
    }
}
