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

//! Process-wide task executor.
//!
//! Kernels do not run their `do_process` inline; they submit tasks here.
//! The executor hosts a dedicated multi-threaded runtime on its own OS
//! thread, separate from whatever runtime drives the kernel run loops, so
//! compute-bound work cannot starve the control plane. Each task
//! materializes its inputs, runs the owning kernel's `do_process` on one of
//! a fixed pool of compute streams, and then removes itself from the
//! kernel's outstanding set, success or failure alike.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use futures::Future;
use log::{debug, error, warn};
use parking_lot::Mutex;

use crate::cache::{CacheData, CacheMachine};
use crate::config::EngineConfig;
use crate::error::Error;
use crate::kernel::Kernel;

/// The type of thing that the executor runs
type Task = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Affinity token for the device stream a task's work is ordered on.
///
/// The physical primitives behind the operator seams key their device
/// submissions off this id; streams are owned by the executor and never
/// shared across concurrent tasks.
#[derive(Debug, Clone, Copy)]
pub struct ComputeStream {
    id: usize,
}

impl ComputeStream {
    pub fn id(&self) -> usize {
        self.id
    }
}

struct State {
    /// Channel for requests -- the executor takes requests from here and
    /// runs them
    requests: Option<std::sync::mpsc::Sender<Task>>,

    /// The thread hosting the dedicated runtime
    thread: Option<std::thread::JoinHandle<()>>,
}

/// Process-wide pool that runs `do_process` invocations submitted by
/// kernels
pub struct TaskExecutor {
    state: Arc<Mutex<State>>,
    next_task_id: AtomicU64,
    next_stream: AtomicUsize,
    stream_pool_size: usize,
}

static EXECUTOR: OnceLock<TaskExecutor> = OnceLock::new();

impl TaskExecutor {
    /// Install the process-wide executor with the given configuration.
    /// Returns false if one was already installed (the existing pool is
    /// kept).
    pub fn initialize(config: &EngineConfig) -> bool {
        EXECUTOR.set(TaskExecutor::new(config)).is_ok()
    }

    /// The process-wide executor, created with default configuration if
    /// `initialize` was never called
    pub fn instance() -> &'static TaskExecutor {
        EXECUTOR.get_or_init(|| TaskExecutor::new(&EngineConfig::default()))
    }

    fn new(config: &EngineConfig) -> Self {
        let num_threads = config.executor_concurrency().max(1);
        let (tx, rx) = std::sync::mpsc::channel::<Task>();

        // Cannot create a separate tokio runtime inside another tokio
        // runtime, so use std::thread to host it
        let thread = std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .thread_name("helion-task-executor")
                .worker_threads(num_threads)
                .build()
                .expect("Creating tokio runtime");

            // By entering the context, all calls to `tokio::spawn` go to
            // this runtime
            let _guard = runtime.enter();

            while let Ok(request) = rx.recv() {
                tokio::task::spawn(request);
            }
        });

        Self {
            state: Arc::new(Mutex::new(State {
                requests: Some(tx),
                thread: Some(thread),
            })),
            next_task_id: AtomicU64::new(1),
            next_stream: AtomicUsize::new(0),
            stream_pool_size: config.executor_stream_pool_size().max(1),
        }
    }

    /// Submit one task: the inputs are materialized, the kernel's
    /// `do_process` runs on a pool thread, and the task is removed from the
    /// kernel's outstanding set when done. Returns the task id.
    ///
    /// The task is registered with the kernel before this returns, so the
    /// kernel's completion barrier can never miss it.
    pub fn add_task(
        &self,
        inputs: Vec<CacheData>,
        output: Arc<CacheMachine>,
        kernel: Arc<dyn Kernel>,
    ) -> u64 {
        let task_id = self.next_task_id.fetch_add(1, Ordering::SeqCst);
        kernel.base().register_task(task_id);

        let stream = ComputeStream {
            id: self.next_stream.fetch_add(1, Ordering::SeqCst) % self.stream_pool_size,
        };

        let owner = Arc::clone(&kernel);
        let job: Task = Box::pin(async move {
            let kernel_id = kernel.base().kernel_id();
            let query_id = kernel.base().context().query_id();
            let timer = Instant::now();

            let mut input_rows = 0u64;
            let mut batches = Vec::with_capacity(inputs.len());
            let mut materialize_error = None;
            for data in inputs {
                input_rows += data.num_rows() as u64;
                match data.materialize() {
                    Ok(batch) => batches.push(batch),
                    Err(e) => {
                        materialize_error = Some(e);
                        break;
                    }
                }
            }

            let result = match materialize_error {
                Some(e) => Err(e),
                None => kernel.do_process(batches, &output, &stream).await,
            };

            match &result {
                Ok(()) => debug!(
                    "{}|{}|task {} completed|{}|kernel_id|{}|stream {}|{} input rows",
                    query_id,
                    kernel.base().context().query_step(),
                    task_id,
                    timer.elapsed().as_millis(),
                    kernel_id,
                    stream.id(),
                    input_rows
                ),
                Err(e) => error!(
                    "{}|{}|task {} failed on kernel {}: {}",
                    query_id,
                    kernel.base().context().query_step(),
                    task_id,
                    kernel_id,
                    e
                ),
            }

            kernel.base().complete_task(task_id, result);
        });

        let state = self.state.lock();
        let submitted = match &state.requests {
            Some(requests) => requests.send(job).is_ok(),
            None => false,
        };
        drop(state);

        if !submitted {
            // the pool is gone; fail the task instead of hanging the
            // kernel's barrier
            warn!("tried to schedule task on an executor that was shutdown");
            owner.base().complete_task(
                task_id,
                Err(Error::Internal(
                    "task submitted to an executor that was shutdown".to_string(),
                )),
            );
        }

        task_id
    }

    /// Signals shutdown of this executor: queued tasks still run, no new
    /// tasks are accepted
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.requests = None;
    }

    /// Stops all subsequent task submissions and waits for the hosting
    /// thread to complete. Only the first call actually waits; later calls
    /// return immediately.
    pub fn join(&self) {
        self.shutdown();

        // take the thread out while the mutex is held
        let thread = {
            let mut state = self.state.lock();
            state.thread.take()
        };

        // wait for completion while not holding the mutex
        if let Some(thread) = thread {
            thread.join().ok();
        }
    }
}

impl std::fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TaskExecutor")
            .field("stream_pool_size", &self.stream_pool_size)
            .field("running", &state.requests.is_some())
            .finish()
    }
}
