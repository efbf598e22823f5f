//! Ratewarden - Distributed Request Rate Limiting
//!
//! This crate throttles HTTP clients with a sliding-window log kept in a
//! shared store, so every instance behind a load balancer enforces the same
//! limit for the same client. It ships a tower middleware for axum routers
//! and a small reference gateway.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod server;
pub mod store;
