//! Built-in middleware, listed in their default priority order:
//!
//! | priority | middleware   | role                                   |
//! |----------|--------------|----------------------------------------|
//! | 0        | `auth`       | token check against the shared secret  |
//! | 1        | `logging`    | request trace and timing, never rejects |
//! | 2        | `rate_limit` | fixed-window request counter           |
//! | 3        | `validation` | length bound and known-command check   |

pub mod auth;
pub mod logging;
pub mod rate_limit;
pub mod validation;

pub use auth::AuthMiddleware;
pub use logging::LoggingMiddleware;
pub use rate_limit::RateLimitMiddleware;
pub use validation::ValidationMiddleware;
