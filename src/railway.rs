//! Railway platform integration
//!
//! Typed wrapper over the hosting platform's GraphQL query/mutation API.

mod client;
mod types;

pub use client::{ClientError, RailwayClient, RateLimiter};
pub use types::*;
