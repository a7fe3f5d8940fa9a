//! Built-in handlers.
//!
//! - `echo`: returns the arguments verbatim (`ECHO: <text>`)
//! - `calculator`: evaluates arithmetic expressions (`RESULT: <number>`)
//! - `file`: reads and writes files under a root directory

pub mod calculator;
pub mod echo;
pub mod file;

pub use calculator::CalculatorHandler;
pub use echo::EchoHandler;
pub use file::FileHandler;
