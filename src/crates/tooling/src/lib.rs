//! Cross-cutting utilities for the converge resource engine.

pub mod rate_limit;
pub mod safepath;

pub use rate_limit::RateLimiter;
