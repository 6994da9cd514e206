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

//! Kernel lifecycle: the pipeline-stage abstraction and its task barrier

pub mod aggregate;
pub mod distributing;

use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use hashbrown::HashSet;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::cache::CacheMachine;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::execution::ComputeStream;

/// Outcome of a kernel's `run()`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelStatus {
    Proceed,
    Stop,
}

/// A pipeline stage with one input cache and one output cache.
///
/// `run()` is invoked exactly once, on its own executor thread, and must
/// not return until the input cache is finished, every submitted task has
/// been observed complete, and the output cache has been finished.
#[async_trait]
pub trait Kernel: Send + Sync + 'static {
    fn base(&self) -> &KernelBase;

    /// Process one task's worth of materialized input batches into the
    /// output cache. Invoked by the task executor, which supplies the
    /// compute stream the work is ordered on.
    async fn do_process(
        &self,
        inputs: Vec<RecordBatch>,
        output: &Arc<CacheMachine>,
        stream: &ComputeStream,
    ) -> Result<()>;

    async fn run(self: Arc<Self>) -> Result<KernelStatus>;
}

/// State shared by every kernel: identity, expression, caches, and the
/// outstanding-task set with its completion barrier.
#[derive(Debug)]
pub struct KernelBase {
    kernel_id: usize,
    expression: String,
    context: Arc<Context>,
    input: Arc<CacheMachine>,
    output: Arc<CacheMachine>,
    tasks: Mutex<HashSet<u64>>,
    /// First task failure observed; surfaced when the barrier releases
    error: Mutex<Option<Error>>,
    task_change: watch::Sender<u64>,
}

impl KernelBase {
    pub fn new(
        kernel_id: usize,
        expression: impl Into<String>,
        context: Arc<Context>,
        input: Arc<CacheMachine>,
        output: Arc<CacheMachine>,
    ) -> Self {
        let (task_change, _) = watch::channel(0);
        Self {
            kernel_id,
            expression: expression.into(),
            context,
            input,
            output,
            tasks: Mutex::new(HashSet::new()),
            error: Mutex::new(None),
            task_change,
        }
    }

    pub fn kernel_id(&self) -> usize {
        self.kernel_id
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn input_cache(&self) -> &Arc<CacheMachine> {
        &self.input
    }

    pub fn output_cache(&self) -> &Arc<CacheMachine> {
        &self.output
    }

    /// Record a task as outstanding. Called by the executor at submission,
    /// before the task can possibly complete.
    pub fn register_task(&self, task_id: u64) {
        self.tasks.lock().insert(task_id);
        self.task_change.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Remove a task from the outstanding set, attaching its failure (first
    /// one wins) for `run()` to surface, and notify the barrier.
    pub fn complete_task(&self, task_id: u64, result: Result<()>) {
        if let Err(e) = result {
            let mut slot = self.error.lock();
            if slot.is_none() {
                *slot = Some(e);
            }
        }
        self.tasks.lock().remove(&task_id);
        self.task_change.send_modify(|v| *v = v.wrapping_add(1));
    }

    pub fn num_outstanding_tasks(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Completion barrier: resolves once the outstanding-task set is empty,
    /// yielding the first task failure if any task failed.
    pub async fn wait_for_tasks(&self) -> Result<()> {
        let mut rx = self.task_change.subscribe();
        loop {
            if self.tasks.lock().is_empty() {
                break;
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
        match self.error.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn base() -> KernelBase {
        let context = Arc::new(
            Context::new(1, vec![crate::communication::Node::new("node-0")], 0, 0).unwrap(),
        );
        KernelBase::new(
            1,
            "LogicalAggregate(group=[{0}], EXPR$0=[SUM($1)])",
            context,
            Arc::new(CacheMachine::new("in", 16)),
            Arc::new(CacheMachine::new("out", 16)),
        )
    }

    #[tokio::test]
    async fn barrier_waits_until_task_set_empties() {
        let base = Arc::new(base());
        base.register_task(1);
        base.register_task(2);

        let waiter = {
            let base = Arc::clone(&base);
            tokio::spawn(async move { base.wait_for_tasks().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        base.complete_task(1, Ok(()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        base.complete_task(2, Ok(()));
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn barrier_surfaces_first_task_failure() {
        let base = base();
        base.register_task(1);
        base.register_task(2);
        base.complete_task(1, Err(Error::Compute("device OOM".to_string())));
        base.complete_task(2, Err(Error::Compute("later failure".to_string())));

        let err = base.wait_for_tasks().await.unwrap_err();
        assert!(err.to_string().contains("device OOM"));
    }

    #[tokio::test]
    async fn barrier_with_no_tasks_is_immediate() {
        base().wait_for_tasks().await.unwrap();
    }
}
