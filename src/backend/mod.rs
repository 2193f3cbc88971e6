//! HTTP surface: routing, handlers, rate limiting and the error envelope.

pub mod api;
pub mod error;
pub mod rate_limit;
pub mod router;

pub use router::{AppState, create_router};
