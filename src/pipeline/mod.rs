//! Middleware and handler pipeline.
//!
//! Each request runs through three stages:
//!
//! 1. **Pre-pass**: middleware in ascending priority order may rewrite the
//!    request or reject it. The first rejection ends the pre-pass and skips
//!    dispatch.
//! 2. **Dispatch**: handlers in registration order; the first one that
//!    returns a non-empty response answers the request.
//! 3. **Post-pass**: the middleware whose pre-pass ran, in the same order,
//!    may rewrite the response.
//!
//! Registration happens before the server starts; afterwards the pipeline is
//! shared read-only by all workers.

mod request;

pub use request::{Request, TOKEN_PREFIX};

use crate::error::{HandlerError, ServerError};
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, error, info};

/// Response when no handler claims a request.
pub const NO_HANDLER_RESPONSE: &str = "ERROR: No service available to handle request";

/// Response when a handler panics.
pub const INTERNAL_ERROR_RESPONSE: &str = "ERROR: Internal server error";

/// Outcome of a middleware pre-pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Proceed,
    Reject(String),
}

/// A business capability answering some subset of requests.
pub trait Handler: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Called once when the handler is registered.
    fn initialize(&mut self) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Answer the request, or return `None` to let the next handler try.
    ///
    /// `Some(Err(_))` claims the request and is rendered as `ERROR: <reason>`.
    fn handle(&self, request: &Request) -> Option<Result<String, HandlerError>>;

    /// Called once when the pipeline is torn down.
    fn release(&self) {}
}

/// Cross-cutting logic run before and after dispatch.
pub trait Middleware: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Lower values run earlier.
    fn priority(&self) -> i32;

    /// Inspect or rewrite the request before dispatch.
    fn before(&self, request: &mut Request) -> Verdict;

    /// Observe or rewrite the response after dispatch.
    fn after(&self, _request: &Request, _response: &mut String) {}
}

/// Ordered handler and middleware registrations.
#[derive(Default)]
pub struct Pipeline {
    handlers: Vec<Box<dyn Handler>>,
    middleware: Vec<Box<dyn Middleware>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialize the handler and append it to the dispatch order.
    pub fn add_handler(&mut self, mut handler: Box<dyn Handler>) -> Result<(), ServerError> {
        handler
            .initialize()
            .map_err(|source| ServerError::HandlerInit {
                name: handler.name().to_string(),
                source,
            })?;
        info!(handler = handler.name(), "Handler registered");
        self.handlers.push(handler);
        Ok(())
    }

    /// Append the middleware and restore priority order.
    ///
    /// The sort is stable, so equal priorities keep insertion order.
    pub fn add_middleware(&mut self, middleware: Box<dyn Middleware>) {
        info!(
            middleware = middleware.name(),
            priority = middleware.priority(),
            "Middleware registered"
        );
        self.middleware.push(middleware);
        self.middleware.sort_by_key(|m| m.priority());
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Middleware names in execution order.
    pub fn middleware_order(&self) -> Vec<&str> {
        self.middleware.iter().map(|m| m.name()).collect()
    }

    /// Run one request through the pipeline, producing exactly one response.
    pub fn execute(&self, mut request: Request) -> String {
        let mut ran = 0;
        let mut rejection = None;

        for middleware in &self.middleware {
            ran += 1;
            if let Verdict::Reject(reason) = middleware.before(&mut request) {
                debug!(
                    conn_id = request.conn_id,
                    middleware = middleware.name(),
                    %reason,
                    "Request rejected"
                );
                rejection = Some(reason);
                break;
            }
        }

        let mut response = match rejection {
            Some(reason) => format!("ERROR: {reason}"),
            None => self.dispatch(&request),
        };

        for middleware in &self.middleware[..ran] {
            middleware.after(&request, &mut response);
        }

        response
    }

    fn dispatch(&self, request: &Request) -> String {
        for handler in &self.handlers {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(request)));
            match outcome {
                Ok(Some(Ok(response))) if !response.is_empty() => return response,
                Ok(Some(Ok(_))) | Ok(None) => continue,
                Ok(Some(Err(e))) => {
                    debug!(handler = handler.name(), error = %e, "Handler error");
                    return e.to_response();
                }
                Err(_) => {
                    error!(handler = handler.name(), "Handler panicked");
                    return INTERNAL_ERROR_RESPONSE.to_string();
                }
            }
        }
        NO_HANDLER_RESPONSE.to_string()
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        for handler in &self.handlers {
            handler.release();
            debug!(handler = handler.name(), "Handler released");
        }
    }
}
