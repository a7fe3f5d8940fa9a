//! Worker threads: dequeue, decode, run the pipeline, write the response.

use crate::config::ServerConfig;
use crate::pipeline::{Pipeline, Request, INTERNAL_ERROR_RESPONSE};
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use super::queue::{HandoffQueue, WorkItem};
use super::stats::ServerStats;

/// Line terminator appended to every response.
pub const RESPONSE_TERMINATOR: &[u8] = b"\r\n";

thread_local! {
    static IS_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current thread is a pool worker.
pub(crate) fn on_worker_thread() -> bool {
    IS_WORKER.with(Cell::get)
}

pub(crate) struct Worker<'a> {
    pub id: usize,
    pub queue: &'a HandoffQueue<WorkItem>,
    pub pipeline: &'a Pipeline,
    pub stats: &'a ServerStats,
    pub running: &'a AtomicBool,
    pub config: &'a ServerConfig,
}

impl Worker<'_> {
    /// Drain this worker's shard until shutdown. Items still queued when the
    /// running flag clears are abandoned.
    pub(crate) fn run(&self) {
        IS_WORKER.with(|w| w.set(true));
        let idle = self.config.idle_sleep();
        info!(worker = self.id, "Worker started");

        while self.running.load(Ordering::Acquire) {
            match self.queue.dequeue(self.id) {
                Some(item) => self.process(item),
                None => thread::sleep(idle),
            }
        }

        debug!(worker = self.id, "Worker stopped");
    }

    fn process(&self, item: WorkItem) {
        let started = Instant::now();
        let conn_id = item.conn.id();
        if item.conn.is_closed() {
            debug!(
                worker = self.id,
                conn_id,
                "Skipping request for closed connection"
            );
            return;
        }
        let request = Request::decode(conn_id, &item.payload, item.received_at);

        let mut response = panic::catch_unwind(AssertUnwindSafe(|| self.pipeline.execute(request)))
            .unwrap_or_else(|_| {
                error!(worker = self.id, conn_id, "Pipeline panicked");
                INTERNAL_ERROR_RESPONSE.to_string()
            })
            .into_bytes();
        response.extend_from_slice(RESPONSE_TERMINATOR);

        let elapsed = started.elapsed();
        self.stats.record_completed(elapsed);
        if elapsed > self.config.slow_request() {
            warn!(
                worker = self.id,
                conn_id,
                latency_ms = elapsed.as_millis() as u64,
                "Slow request"
            );
        }

        if let Err(e) = item
            .conn
            .write_response(&response, self.config.write_timeout())
        {
            // a partial response breaks request/response pairing
            item.conn.close();
            self.stats.record_write_failure();
            debug!(
                worker = self.id,
                conn_id,
                error = %e,
                "Failed to write response, closing connection"
            );
        }
    }
}
