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

//! The three-stage aggregation pipeline.
//!
//! `ComputeAggregateKernel` turns each input batch into that batch's
//! partial aggregate. `DistributeAggregateKernel` routes partials across
//! the cluster: hash-partitioned by the group keys, or funneled to the
//! master when there are no group keys. `MergeAggregateKernel` waits for
//! everything to arrive, concatenates, and re-aggregates with the
//! operators rewritten to their merging counterparts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;

use crate::cache::CacheMachine;
use crate::communication::{CommunicationData, PartitionCountReport};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::execution::{ComputeStream, TaskExecutor};
use crate::kernel::distributing::DistributingKernel;
use crate::kernel::{Kernel, KernelBase, KernelStatus};
use crate::operators::aggregations::{
    compute_aggregations_with_groupby, compute_aggregations_without_groupby,
    compute_distinct_partial, compute_groupby_without_aggregations,
    mod_group_by_parameters_for_merge,
};
use crate::operators::parse::parse_group_by_expression;
use crate::operators::{AggregateKind, AggregateSpec};
use crate::partition::{hash_partition, split};
use crate::utilities::{
    check_if_concatenating_strings_will_overflow, concat_tables, create_empty_table,
};

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

fn batch_size_bytes(batch: &RecordBatch) -> usize {
    batch
        .columns()
        .iter()
        .map(|c| c.get_array_memory_size())
        .sum()
}

// BEGIN ComputeAggregateKernel

/// Computes each input batch's partial aggregate
pub struct ComputeAggregateKernel {
    base: KernelBase,
    spec: AggregateSpec,
    /// Estimated total input rows, from the graph's upstream statistics
    input_rows_hint: Option<u64>,
}

impl ComputeAggregateKernel {
    pub fn try_new(
        kernel_id: usize,
        expression: &str,
        context: Arc<Context>,
        input: Arc<CacheMachine>,
        output: Arc<CacheMachine>,
        input_rows_hint: Option<u64>,
    ) -> Result<Self> {
        let spec = parse_group_by_expression(expression)?;
        Ok(Self {
            base: KernelBase::new(kernel_id, expression, context, input, output),
            spec,
            input_rows_hint,
        })
    }

    pub fn spec(&self) -> &AggregateSpec {
        &self.spec
    }

    /// Estimated output rows: one for a scalar aggregation, otherwise the
    /// upstream estimate scaled by the rows-out/rows-in ratio observed so
    /// far. `None` when no estimate is possible yet.
    pub fn estimated_output_num_rows(&self) -> Option<u64> {
        if self.spec.is_scalar_aggregation() {
            return Some(1);
        }
        let total_in = self.input_rows_hint?;
        let in_so_far = self.base.input_cache().total_rows_added() as f64;
        if in_so_far == 0.0 {
            return None;
        }
        let out_so_far = self.base.output_cache().total_rows_added() as f64;
        Some((total_in as f64 * out_so_far / in_so_far) as u64)
    }
}

#[async_trait]
impl Kernel for ComputeAggregateKernel {
    fn base(&self) -> &KernelBase {
        &self.base
    }

    async fn do_process(
        &self,
        inputs: Vec<RecordBatch>,
        output: &Arc<CacheMachine>,
        _stream: &ComputeStream,
    ) -> Result<()> {
        let input = inputs
            .first()
            .ok_or_else(|| Error::Internal("compute task submitted without input".to_string()))?;

        let spec = &self.spec;
        let columns = if spec.aggregation_types == [AggregateKind::CountDistinct] {
            compute_distinct_partial(
                input,
                &spec.group_column_indices,
                &spec.aggregation_input_expressions[0],
                &spec.aggregation_column_assigned_aliases[0],
            )?
        } else if spec.aggregation_types.is_empty() {
            compute_groupby_without_aggregations(input, &spec.group_column_indices)?
        } else if spec.group_column_indices.is_empty() {
            compute_aggregations_without_groupby(
                input,
                &spec.aggregation_input_expressions,
                &spec.aggregation_types,
                &spec.aggregation_column_assigned_aliases,
            )?
        } else {
            compute_aggregations_with_groupby(
                input,
                &spec.aggregation_input_expressions,
                &spec.aggregation_types,
                &spec.aggregation_column_assigned_aliases,
                &spec.group_column_indices,
            )?
        };

        output.add_to_cache(columns, "", false).await?;
        Ok(())
    }

    async fn run(self: Arc<Self>) -> Result<KernelStatus> {
        let timer = Instant::now();
        let context = Arc::clone(self.base.context());

        while let Some(cache_data) = self.base.input_cache().pull_cache_data().await? {
            TaskExecutor::instance().add_task(
                vec![cache_data],
                Arc::clone(self.base.output_cache()),
                self.clone(),
            );
        }

        debug!(
            "{}|{}|{}|{}|{}|kernel_id|{}||",
            context.query_id(),
            context.query_step(),
            context.query_substep(),
            "Compute Aggregate Kernel tasks created",
            timer.elapsed().as_millis(),
            self.base.kernel_id()
        );

        let task_result = self.base.wait_for_tasks().await;
        self.base.output_cache().finish();
        task_result?;

        debug!(
            "{}|{}|{}|{}|{}|kernel_id|{}||",
            context.query_id(),
            context.query_step(),
            context.query_substep(),
            "ComputeAggregate Kernel Completed",
            timer.elapsed().as_millis(),
            self.base.kernel_id()
        );
        Ok(KernelStatus::Proceed)
    }
}

// END ComputeAggregateKernel

// BEGIN DistributeAggregateKernel

/// Routes each partial across the cluster: hash-partitioned by group keys,
/// or funneled to the master for scalar aggregations
pub struct DistributeAggregateKernel {
    dist: DistributingKernel,
    spec: AggregateSpec,
    columns_to_hash: Vec<usize>,
    set_empty_part_for_non_master_node: AtomicBool,
}

impl DistributeAggregateKernel {
    #[allow(clippy::too_many_arguments)]
    pub fn try_new(
        kernel_id: usize,
        expression: &str,
        context: Arc<Context>,
        input: Arc<CacheMachine>,
        output: Arc<CacheMachine>,
        comm: Arc<CommunicationData>,
        route: impl Into<String>,
        counts_rx: mpsc::UnboundedReceiver<PartitionCountReport>,
    ) -> Result<Self> {
        let spec = parse_group_by_expression(expression)?;
        let columns_to_hash = spec.group_column_indices.clone();
        let base = KernelBase::new(kernel_id, expression, context, input, output);
        Ok(Self {
            dist: DistributingKernel::new(base, comm, route, counts_rx),
            spec,
            columns_to_hash,
            set_empty_part_for_non_master_node: AtomicBool::new(false),
        })
    }

    pub fn distributing(&self) -> &DistributingKernel {
        &self.dist
    }
}

#[async_trait]
impl Kernel for DistributeAggregateKernel {
    fn base(&self) -> &KernelBase {
        self.dist.base()
    }

    async fn do_process(
        &self,
        inputs: Vec<RecordBatch>,
        _output: &Arc<CacheMachine>,
        _stream: &ComputeStream,
    ) -> Result<()> {
        let input = inputs
            .into_iter()
            .next()
            .ok_or_else(|| Error::Internal("distribute task submitted without input".to_string()))?;

        let context = self.base().context();
        // partitioning into anything other than the node count would need
        // explicit part ids downstream
        let num_partitions = context.total_nodes();

        if self.spec.group_column_indices.is_empty() {
            // aggregation without group by: all results go to the master
            let self_node = context.self_node().clone();
            if context.self_is_master() {
                let added = self.dist.add_to_output_cache(input, "", false).await?;
                if added {
                    self.dist.increment_node_count(self_node.id());
                }
            } else {
                if !self
                    .set_empty_part_for_non_master_node
                    .swap(true, Ordering::SeqCst)
                {
                    // keep something in the non-master output so downstream
                    // sees the schema
                    let empty = create_empty_table(&input);
                    let added = self.dist.add_to_output_cache(empty, "", true).await?;
                    if added {
                        self.dist.increment_node_count(self_node.id());
                    }
                }
                let master = context.master_node().clone();
                let sent = self.dist.send_message(input, &master, "", true).await?;
                if sent {
                    self.dist.increment_node_count(master.id());
                }
            }
        } else {
            let partitions = if input.num_rows() > 0 {
                let (partitioned, offsets) =
                    hash_partition(&input, &self.columns_to_hash, num_partitions)?;
                // hash_partition offsets always start at 0, which split
                // must not see
                split(&partitioned, &offsets[1..])?
            } else {
                (0..num_partitions).map(|_| input.slice(0, 0)).collect()
            };
            self.dist.scatter(partitions, "").await?;
        }
        Ok(())
    }

    async fn run(self: Arc<Self>) -> Result<KernelStatus> {
        let timer = Instant::now();
        let context = Arc::clone(self.base().context());

        while let Some(cache_data) = self.base().input_cache().pull_cache_data().await? {
            TaskExecutor::instance().add_task(
                vec![cache_data],
                Arc::clone(self.base().output_cache()),
                self.clone(),
            );
        }

        debug!(
            "{}|{}|{}|{}|{}|kernel_id|{}||",
            context.query_id(),
            context.query_step(),
            context.query_substep(),
            "DistributeAggregate Kernel tasks created",
            timer.elapsed().as_millis(),
            self.base().kernel_id()
        );

        if let Err(e) = self.base().wait_for_tasks().await {
            self.base().output_cache().finish();
            return Err(e);
        }

        if let Err(e) = self.dist.send_total_partition_counts() {
            self.base().output_cache().finish();
            return Err(e);
        }
        let total_count = match self.dist.get_total_partition_counts().await {
            Ok(total) => total,
            Err(e) => {
                self.base().output_cache().finish();
                return Err(e);
            }
        };
        // every partition bound for this node has to be in the cache before
        // the merge stage may start
        self.base().output_cache().wait_for_count(total_count).await;
        self.base().output_cache().finish();

        debug!(
            "{}|{}|{}|{}|{}|kernel_id|{}||",
            context.query_id(),
            context.query_step(),
            context.query_substep(),
            "DistributeAggregate Kernel Completed",
            timer.elapsed().as_millis(),
            self.base().kernel_id()
        );
        Ok(KernelStatus::Proceed)
    }
}

// END DistributeAggregateKernel

// BEGIN MergeAggregateKernel

/// Concatenates every partial bound for this node and re-aggregates with
/// the merge-rewritten operators
pub struct MergeAggregateKernel {
    base: KernelBase,
    spec: AggregateSpec,
}

impl MergeAggregateKernel {
    pub fn try_new(
        kernel_id: usize,
        expression: &str,
        context: Arc<Context>,
        input: Arc<CacheMachine>,
        output: Arc<CacheMachine>,
    ) -> Result<Self> {
        let spec = parse_group_by_expression(expression)?;
        Ok(Self {
            base: KernelBase::new(kernel_id, expression, context, input, output),
            spec,
        })
    }
}

#[async_trait]
impl Kernel for MergeAggregateKernel {
    fn base(&self) -> &KernelBase {
        &self.base
    }

    async fn do_process(
        &self,
        inputs: Vec<RecordBatch>,
        output: &Arc<CacheMachine>,
        _stream: &ComputeStream,
    ) -> Result<()> {
        let context = self.base.context();
        let timestamp_begin = now_millis();

        if check_if_concatenating_strings_will_overflow(&inputs) {
            warn!(
                "{}|{}|{}|{}",
                context.query_id(),
                context.query_step(),
                context.query_substep(),
                "In MergeAggregateKernel::run Concatenating Strings will overflow strings length"
            );
        }
        let concatenated = concat_tables(&inputs)?;

        let log_input_num_rows = concatenated.num_rows();
        let log_input_num_bytes = batch_size_bytes(&concatenated);

        let merging_column_names: Vec<String> = concatenated
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect();
        let (
            mod_group_column_indices,
            mod_aggregation_input_expressions,
            mod_aggregation_types,
            mod_aggregation_column_assigned_aliases,
        ) = mod_group_by_parameters_for_merge(
            &self.spec.group_column_indices,
            &self.spec.aggregation_types,
            &merging_column_names,
        )?;

        let columns = if self.spec.aggregation_types.is_empty() {
            compute_groupby_without_aggregations(&concatenated, &mod_group_column_indices)?
        } else if self.spec.group_column_indices.is_empty() {
            // aggregations without group by are only merged on the master
            // node
            if context.self_is_master() {
                compute_aggregations_without_groupby(
                    &concatenated,
                    &mod_aggregation_input_expressions,
                    &mod_aggregation_types,
                    &mod_aggregation_column_assigned_aliases,
                )?
            } else {
                // the distribution phase deposited an empty batch with the
                // right schema, which is the output here
                concatenated
            }
        } else {
            compute_aggregations_with_groupby(
                &concatenated,
                &mod_aggregation_input_expressions,
                &mod_aggregation_types,
                &mod_aggregation_column_assigned_aliases,
                &mod_group_column_indices,
            )?
        };
        let timestamp_end = now_millis();

        info!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
            context.self_index(),
            context.query_id(),
            self.base.kernel_id(),
            log_input_num_rows,
            log_input_num_bytes,
            columns.num_rows(),
            batch_size_bytes(&columns),
            "compute",
            timestamp_begin,
            timestamp_end
        );

        output.add_to_cache(columns, "", true).await?;
        Ok(())
    }

    async fn run(self: Arc<Self>) -> Result<KernelStatus> {
        let timer = Instant::now();
        let context = Arc::clone(self.base.context());

        // this kernel needs all of the input before it can do any output
        self.base.input_cache().wait_until_finished().await;

        let mut inputs = Vec::new();
        while self.base.input_cache().wait_for_next().await {
            if let Some(cache_data) = self.base.input_cache().pull_cache_data().await? {
                inputs.push(cache_data);
            }
        }

        if !inputs.is_empty() {
            TaskExecutor::instance().add_task(
                inputs,
                Arc::clone(self.base.output_cache()),
                self.clone(),
            );
        }

        debug!(
            "{}|{}|{}|{}|{}|kernel_id|{}||",
            context.query_id(),
            context.query_step(),
            context.query_substep(),
            "Merge Aggregate Kernel tasks created",
            timer.elapsed().as_millis(),
            self.base.kernel_id()
        );

        if let Err(e) = self.base.wait_for_tasks().await {
            // TODO: retry failed merge tasks instead of failing the query
            error!(
                "{}|{}|{}|In MergeAggregate kernel for {}. What: {}|||",
                context.query_id(),
                context.query_step(),
                context.query_substep(),
                self.base.expression(),
                e
            );
            self.base.output_cache().finish();
            return Err(e);
        }
        self.base.output_cache().finish();

        debug!(
            "{}|{}|{}|{}|{}|kernel_id|{}||",
            context.query_id(),
            context.query_step(),
            context.query_substep(),
            "MergeAggregate Kernel Completed",
            timer.elapsed().as_millis(),
            self.base.kernel_id()
        );
        Ok(KernelStatus::Proceed)
    }
}

// END MergeAggregateKernel

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::{ExchangeNetwork, Node};

    fn context() -> Arc<Context> {
        Arc::new(Context::new(1, vec![Node::new("node-0")], 0, 0).unwrap())
    }

    fn compute_kernel(expression: &str, hint: Option<u64>) -> ComputeAggregateKernel {
        ComputeAggregateKernel::try_new(
            1,
            expression,
            context(),
            Arc::new(CacheMachine::new("in", 16)),
            Arc::new(CacheMachine::new("out", 16)),
            hint,
        )
        .unwrap()
    }

    #[test]
    fn scalar_aggregation_estimates_one_row() {
        let kernel = compute_kernel("LogicalAggregate(group=[{}], s=[SUM($0)])", None);
        assert_eq!(kernel.estimated_output_num_rows(), Some(1));
    }

    #[test]
    fn grouped_estimate_needs_observed_rows() {
        let kernel =
            compute_kernel("LogicalAggregate(group=[{0}], s=[SUM($1)])", Some(1000));
        // nothing has flowed yet
        assert_eq!(kernel.estimated_output_num_rows(), None);

        let kernel = compute_kernel("LogicalAggregate(group=[{0}], s=[SUM($1)])", None);
        assert_eq!(kernel.estimated_output_num_rows(), None);
    }

    #[test]
    fn malformed_expression_fails_construction() {
        let network = ExchangeNetwork::new();
        let node = Node::new("node-0");
        let comm = CommunicationData::new(node.clone(), Arc::clone(&network));
        let counts_rx = network.register_count_endpoint(&node, "1.2");
        let result = DistributeAggregateKernel::try_new(
            2,
            "LogicalAggregate(group=[{}])",
            context(),
            Arc::new(CacheMachine::new("in", 16)),
            Arc::new(CacheMachine::new("out", 16)),
            comm,
            "1.2",
            counts_rx,
        );
        assert!(matches!(result, Err(Error::Parse(_))));
    }
}
