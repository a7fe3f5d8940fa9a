//! Echo handler.
//!
//! ```text
//! Request:  TOKEN:<secret> ECHO Hello World
//! Response: ECHO: Hello World
//! ```

use crate::error::HandlerError;
use crate::pipeline::{Handler, Request};

pub struct EchoHandler;

impl Handler for EchoHandler {
    fn name(&self) -> &str {
        "echo"
    }

    fn handle(&self, request: &Request) -> Option<Result<String, HandlerError>> {
        if !request.is_command("ECHO") {
            return None;
        }
        Some(Ok(format!("ECHO: {}", request.arguments)))
    }
}
