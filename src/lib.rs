//! Turnstile - In-process admission control
//!
//! This crate implements a sliding-window request limiter that gates every
//! inbound HTTP request before it reaches business logic. Requests are
//! classified into policy tiers by path, tracked per caller identity with
//! bounded memory, and either admitted with rate limit headers or rejected
//! with a 429 carrying back-off metadata.

pub mod config;
pub mod error;
pub mod gate;
pub mod ratelimit;
pub mod server;
