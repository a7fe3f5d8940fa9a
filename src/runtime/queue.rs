//! Bounded hand-off queue between the multiplexer and the workers.
//!
//! The queue is split into one shard per worker. An item is routed by its
//! affinity key (the connection id) to shard `key % shards`, and every worker
//! drains only its own shard. All requests from one connection are therefore
//! handled in arrival order by a single worker, which is also the only thread
//! writing to that connection.
//!
//! Each shard is a `crossbeam_queue::ArrayQueue`: a bounded lock-free MPMC
//! ring, so a pop never hands the same item to two consumers even if more
//! than one thread drains a shard.

use bytes::Bytes;
use crossbeam_queue::ArrayQueue;
use std::sync::Arc;
use std::time::Instant;

use super::connection::Connection;

/// Raw bytes from one read, bound to the connection they came from.
#[derive(Debug)]
pub struct WorkItem {
    pub conn: Arc<Connection>,
    pub payload: Bytes,
    pub received_at: Instant,
}

/// Sharded bounded queue.
pub struct HandoffQueue<T> {
    shards: Vec<ArrayQueue<T>>,
}

impl<T> HandoffQueue<T> {
    /// Create a queue with `shards` shards sharing `capacity` slots.
    ///
    /// Every shard holds at least one item.
    pub fn new(shards: usize, capacity: usize) -> Self {
        let shards = shards.max(1);
        let per_shard = (capacity / shards).max(1);
        Self {
            shards: (0..shards).map(|_| ArrayQueue::new(per_shard)).collect(),
        }
    }

    /// Shard an affinity key maps to.
    pub fn shard_for(&self, key: usize) -> usize {
        key % self.shards.len()
    }

    /// Push without blocking. Returns `false` and drops the item when the
    /// target shard is full.
    pub fn enqueue(&self, key: usize, item: T) -> bool {
        self.shards[self.shard_for(key)].push(item).is_ok()
    }

    /// Pop the oldest item from a shard.
    pub fn dequeue(&self, shard: usize) -> Option<T> {
        self.shards[shard].pop()
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Capacity of a single shard.
    pub fn shard_capacity(&self) -> usize {
        self.shards[0].capacity()
    }

    /// Items waiting across all shards.
    pub fn len(&self) -> usize {
        self.shards.iter().map(ArrayQueue::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(ArrayQueue::is_empty)
    }
}
