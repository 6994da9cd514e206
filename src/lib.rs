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

//! Helion is a distributed, GPU-accelerated SQL execution engine built on
//! [Apache Arrow](https://arrow.apache.org). This crate carries its
//! aggregation execution pipeline: the Compute -> Distribute -> Merge
//! kernel subgraph that answers `GROUP BY` and aggregate queries across a
//! cluster of worker nodes.
//!
//! Batches flow through [`cache::CacheMachine`] queues between kernels;
//! kernels submit per-batch tasks to the process-wide
//! [`execution::TaskExecutor`]; the distribute stage hash-partitions
//! partials across peers and reconciles per-peer partition counts so every
//! merge stage knows when all of its input has arrived.

pub mod cache;
pub mod communication;
pub mod config;
pub mod context;
pub mod error;
pub mod execution;
pub mod graph;
pub mod kernel;
pub mod operators;
pub mod partition;
pub mod utilities;

pub use error::{Error, Result};
