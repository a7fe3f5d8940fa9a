//! Input validation: non-empty, bounded length, recognized command.

use crate::pipeline::{Middleware, Request, Verdict};
use tracing::debug;

/// Replacement for an empty response in the post-pass.
pub const EMPTY_RESPONSE: &str = "ERROR: Empty response";

pub struct ValidationMiddleware {
    max_length: usize,
    commands: Vec<String>,
}

impl ValidationMiddleware {
    pub fn new<I, S>(max_length: usize, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            max_length,
            commands: commands.into_iter().map(Into::into).collect(),
        }
    }

    fn check(&self, request: &Request) -> Result<(), &'static str> {
        if request.raw.trim().is_empty() {
            return Err("Empty request");
        }
        if request.raw.len() > self.max_length {
            return Err("Request too long");
        }
        if !self.commands.iter().any(|c| request.is_command(c)) {
            return Err("Unknown command");
        }
        Ok(())
    }
}

impl Default for ValidationMiddleware {
    fn default() -> Self {
        Self::new(1000, ["ECHO", "CAL", "READ", "WRITE"])
    }
}

impl Middleware for ValidationMiddleware {
    fn name(&self) -> &str {
        "validation"
    }

    fn priority(&self) -> i32 {
        3
    }

    fn before(&self, request: &mut Request) -> Verdict {
        match self.check(request) {
            Ok(()) => Verdict::Proceed,
            Err(reason) => {
                debug!(conn_id = request.conn_id, reason, "Validation failed");
                Verdict::Reject(reason.to_string())
            }
        }
    }

    fn after(&self, _request: &Request, response: &mut String) {
        if response.is_empty() {
            *response = EMPTY_RESPONSE.to_string();
        }
    }
}
