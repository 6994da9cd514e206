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

//! Query-scoped execution context

use crate::communication::Node;
use crate::error::{Error, Result};

/// Query-scoped metadata shared read-only by every kernel of a query.
///
/// Holds the cluster membership for the query (an ordered node list whose
/// positions are the partition ordinals), the designated master node, this
/// node's own identity, and the query/step/substep tokens used by log
/// records.
#[derive(Debug, Clone)]
pub struct Context {
    query_id: u64,
    nodes: Vec<Node>,
    master_index: usize,
    self_index: usize,
    query_step: u32,
    query_substep: u32,
}

impl Context {
    pub fn new(
        query_id: u64,
        nodes: Vec<Node>,
        master_index: usize,
        self_index: usize,
    ) -> Result<Self> {
        if nodes.is_empty() {
            return Err(Error::Internal(
                "Context requires at least one node".to_string(),
            ));
        }
        if master_index >= nodes.len() || self_index >= nodes.len() {
            return Err(Error::Internal(format!(
                "Node index out of range: master {} self {} of {} nodes",
                master_index,
                self_index,
                nodes.len()
            )));
        }
        Ok(Self {
            query_id,
            nodes,
            master_index,
            self_index,
            query_step: 0,
            query_substep: 0,
        })
    }

    pub fn with_steps(mut self, query_step: u32, query_substep: u32) -> Self {
        self.query_step = query_step;
        self.query_substep = query_substep;
        self
    }

    pub fn query_id(&self) -> u64 {
        self.query_id
    }

    pub fn query_step(&self) -> u32 {
        self.query_step
    }

    pub fn query_substep(&self) -> u32 {
        self.query_substep
    }

    pub fn total_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> &Node {
        &self.nodes[index]
    }

    pub fn self_node(&self) -> &Node {
        &self.nodes[self.self_index]
    }

    pub fn self_index(&self) -> usize {
        self.self_index
    }

    pub fn master_node(&self) -> &Node {
        &self.nodes[self.master_index]
    }

    pub fn is_master(&self, node: &Node) -> bool {
        *node == self.nodes[self.master_index]
    }

    /// Whether this node is the query's designated master
    pub fn self_is_master(&self) -> bool {
        self.self_index == self.master_index
    }

    /// Ordinal of the given node in the query's node list
    pub fn node_index(&self, node: &Node) -> Option<usize> {
        self.nodes.iter().position(|n| n == node)
    }
}
