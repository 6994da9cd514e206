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

//! Ordered, bounded, threadsafe batch queues connecting kernels.
//!
//! A [`CacheMachine`] sits between a producer kernel and a consumer kernel.
//! The producer appends batches with [`CacheMachine::add_to_cache`] and
//! declares end-of-stream with [`CacheMachine::finish`]; the consumer drains
//! with [`CacheMachine::pull_cache_data`] and can wait on stream-level
//! conditions (`wait_for_next`, `wait_until_finished`, `wait_for_count`).
//! Counters track accepted items and rows, never subtractions, so
//! `wait_for_count` reconciles against what producers ever delivered.

use std::collections::VecDeque;

use arrow::record_batch::RecordBatch;
use log::debug;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::{Error, Result};

/// Opaque handle to a batch held by a cache.
///
/// The full engine keeps handles resident on device, host, or disk and
/// materializes them on demand; this layer carries the host tier. A handle
/// is produced by one kernel and consumed exactly once.
#[derive(Debug)]
pub struct CacheData {
    batch: RecordBatch,
    num_bytes: usize,
}

impl CacheData {
    pub fn new(batch: RecordBatch) -> Self {
        let num_bytes = batch
            .columns()
            .iter()
            .map(|c| c.get_array_memory_size())
            .sum();
        Self { batch, num_bytes }
    }

    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn num_bytes(&self) -> usize {
        self.num_bytes
    }

    /// Consume the handle, yielding the underlying batch
    pub fn materialize(self) -> Result<RecordBatch> {
        Ok(self.batch)
    }
}

#[derive(Debug, Default)]
struct CacheState {
    queue: VecDeque<CacheData>,
    finished: bool,
    /// Monotonic count of accepted items; additions only
    num_added: u64,
    /// Monotonic count of accepted rows; additions only
    rows_added: u64,
}

/// Ordered threadsafe queue of [`CacheData`] items with completion signaling.
///
/// Items are delivered in insertion order. The queue is bounded: producers
/// block in `add_to_cache` once `capacity` items are queued, which is what
/// throttles upstream kernels when downstream falls behind.
#[derive(Debug)]
pub struct CacheMachine {
    name: String,
    capacity: usize,
    state: Mutex<CacheState>,
    /// Bumped on every state mutation; waiters subscribe before checking
    /// their predicate so no wakeup is lost.
    change: watch::Sender<u64>,
}

impl CacheMachine {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let (change, _) = watch::channel(0);
        Self {
            name: name.into(),
            capacity: capacity.max(1),
            state: Mutex::new(CacheState::default()),
            change,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn bump(&self) {
        self.change.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Append a batch.
    ///
    /// Returns whether the batch was accepted: an empty batch is rejected
    /// (and no counter moves) unless `allow_empty`. Fails with
    /// [`Error::ClosedCache`] once `finish()` has been called. Blocks while
    /// the cache is at capacity.
    pub async fn add_to_cache(
        &self,
        batch: RecordBatch,
        message_id: &str,
        allow_empty: bool,
    ) -> Result<bool> {
        if batch.num_rows() == 0 && !allow_empty {
            return Ok(false);
        }
        let mut slot = Some(batch);
        let mut rx = self.change.subscribe();
        loop {
            {
                let mut state = self.state.lock();
                if state.finished {
                    return Err(Error::ClosedCache(format!(
                        "add_to_cache on {} (message_id '{}')",
                        self.name, message_id
                    )));
                }
                if state.queue.len() < self.capacity {
                    let batch = slot.take().ok_or_else(|| {
                        Error::Internal(format!("cache {} lost a batch in transit", self.name))
                    })?;
                    let data = CacheData::new(batch);
                    state.num_added += 1;
                    state.rows_added += data.num_rows() as u64;
                    state.queue.push_back(data);
                    drop(state);
                    self.bump();
                    return Ok(true);
                }
            }
            if rx.changed().await.is_err() {
                return Err(Error::Internal(format!(
                    "cache {} signal channel closed",
                    self.name
                )));
            }
        }
    }

    /// Remove and return the next item, blocking while the cache is empty
    /// and not finished. Returns `None` once finished and drained.
    pub async fn pull_cache_data(&self) -> Result<Option<CacheData>> {
        let mut rx = self.change.subscribe();
        loop {
            {
                let mut state = self.state.lock();
                if let Some(data) = state.queue.pop_front() {
                    drop(state);
                    self.bump();
                    return Ok(Some(data));
                }
                if state.finished {
                    return Ok(None);
                }
            }
            if rx.changed().await.is_err() {
                return Ok(None);
            }
        }
    }

    /// Declare end-of-stream and wake all waiters. Idempotent.
    pub fn finish(&self) {
        {
            let mut state = self.state.lock();
            if state.finished {
                return;
            }
            state.finished = true;
        }
        debug!("cache {} finished", self.name);
        self.bump();
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    /// Block until the producer has called `finish()`
    pub async fn wait_until_finished(&self) {
        let mut rx = self.change.subscribe();
        loop {
            if self.state.lock().finished {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Block until an item is available (`true`) or the cache is finished
    /// and drained (`false`)
    pub async fn wait_for_next(&self) -> bool {
        let mut rx = self.change.subscribe();
        loop {
            {
                let state = self.state.lock();
                if !state.queue.is_empty() {
                    return true;
                }
                if state.finished {
                    return false;
                }
            }
            if rx.changed().await.is_err() {
                return false;
            }
        }
    }

    /// Block until the total number of accepted items reaches `count`.
    ///
    /// Counts additions, not what currently sits in the queue, so items
    /// pulled concurrently still satisfy the wait.
    pub async fn wait_for_count(&self, count: u64) {
        let mut rx = self.change.subscribe();
        loop {
            if self.state.lock().num_added >= count {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Monotonic count of rows ever accepted; used by the optimizer
    pub fn total_rows_added(&self) -> u64 {
        self.state.lock().rows_added
    }

    /// Monotonic count of items ever accepted
    pub fn num_batches_added(&self) -> u64 {
        self.state.lock().num_added
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;
    use std::time::Duration;

    fn batch(values: Vec<i64>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, true)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values))]).unwrap()
    }

    fn empty_batch() -> RecordBatch {
        RecordBatch::new_empty(Arc::new(Schema::new(vec![Field::new(
            "v",
            DataType::Int64,
            true,
        )])))
    }

    #[tokio::test]
    async fn delivers_in_insertion_order() {
        let cache = CacheMachine::new("test", 16);
        cache.add_to_cache(batch(vec![1]), "", false).await.unwrap();
        cache.add_to_cache(batch(vec![2]), "", false).await.unwrap();
        cache.finish();

        let first = cache.pull_cache_data().await.unwrap().unwrap();
        assert_eq!(first.num_rows(), 1);
        let first = first.materialize().unwrap();
        let col = first
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        assert_eq!(col.value(0), 1);

        assert!(cache.pull_cache_data().await.unwrap().is_some());
        assert!(cache.pull_cache_data().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_empty_unless_allowed() {
        let cache = CacheMachine::new("test", 16);
        assert!(!cache.add_to_cache(empty_batch(), "", false).await.unwrap());
        assert_eq!(cache.num_batches_added(), 0);

        assert!(cache.add_to_cache(empty_batch(), "", true).await.unwrap());
        assert_eq!(cache.num_batches_added(), 1);
        assert_eq!(cache.total_rows_added(), 0);
    }

    #[tokio::test]
    async fn add_after_finish_is_closed_cache() {
        let cache = CacheMachine::new("test", 16);
        cache.finish();
        let err = cache.add_to_cache(batch(vec![1]), "", false).await;
        assert!(matches!(err, Err(Error::ClosedCache(_))));
    }

    #[tokio::test]
    async fn wait_for_count_counts_additions_not_queue_depth() {
        let cache = Arc::new(CacheMachine::new("test", 16));
        cache.add_to_cache(batch(vec![1]), "", false).await.unwrap();
        // drain it; the accepted count must still satisfy the wait
        cache.pull_cache_data().await.unwrap().unwrap();

        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.wait_for_count(2).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        cache.add_to_cache(batch(vec![2]), "", false).await.unwrap();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_next_true_then_false() {
        let cache = Arc::new(CacheMachine::new("test", 16));
        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.wait_for_next().await })
        };
        cache.add_to_cache(batch(vec![1]), "", false).await.unwrap();
        assert!(waiter.await.unwrap());

        cache.pull_cache_data().await.unwrap().unwrap();
        cache.finish();
        assert!(!cache.wait_for_next().await);
    }

    #[tokio::test]
    async fn bounded_cache_applies_backpressure() {
        let cache = Arc::new(CacheMachine::new("test", 1));
        cache.add_to_cache(batch(vec![1]), "", false).await.unwrap();

        let producer = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.add_to_cache(batch(vec![2]), "", false).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        cache.pull_cache_data().await.unwrap().unwrap();
        assert!(producer.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn unblocks_pull_on_finish() {
        let cache = Arc::new(CacheMachine::new("test", 16));
        let consumer = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.pull_cache_data().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.finish();
        assert!(consumer.await.unwrap().unwrap().is_none());
    }
}
