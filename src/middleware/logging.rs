//! Request tracing. Side-effect only, never rejects.

use crate::pipeline::{Middleware, Request, Verdict};
use tracing::{debug, info};

pub struct LoggingMiddleware;

impl Middleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "logging"
    }

    fn priority(&self) -> i32 {
        1
    }

    fn before(&self, request: &mut Request) -> Verdict {
        debug!(
            conn_id = request.conn_id,
            command = %request.command,
            request = %request.raw,
            "Processing request"
        );
        Verdict::Proceed
    }

    fn after(&self, request: &Request, response: &mut String) {
        let latency_us = request.received_at.elapsed().as_micros() as u64;
        info!(
            conn_id = request.conn_id,
            command = %request.command,
            latency_us,
            ok = !response.starts_with("ERROR"),
            "Request completed"
        );
        debug!(conn_id = request.conn_id, response = %response, "Response");
    }
}
