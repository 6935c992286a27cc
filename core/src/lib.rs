//! CIL Router Core Library
//! Endpoint pool, per-client rate limiting and transparent request forwarding

pub mod config;
pub mod error;
pub mod proxy;
