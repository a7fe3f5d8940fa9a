//! Token authentication.

use crate::pipeline::{Middleware, Request, Verdict};
use tracing::{debug, trace};

pub struct AuthMiddleware {
    token: String,
}

impl AuthMiddleware {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl Middleware for AuthMiddleware {
    fn name(&self) -> &str {
        "auth"
    }

    fn priority(&self) -> i32 {
        0
    }

    fn before(&self, request: &mut Request) -> Verdict {
        if request.token.as_deref() == Some(self.token.as_str()) {
            trace!(conn_id = request.conn_id, "Authentication successful");
            Verdict::Proceed
        } else {
            debug!(conn_id = request.conn_id, "Authentication failed");
            Verdict::Reject("Authentication failed".to_string())
        }
    }
}
