//! Plugin gateway with a built-in service mesh
//!
//! Plugins are loaded from descriptors, registered with a discovery
//! registry and served through one request path that applies health
//! gating, sliding-window rate limits and a per-plugin circuit breaker
//! before dispatching with a timeout.

pub mod commands;
pub mod config;
pub mod discovery;
pub mod error;
pub mod gateway;
pub mod mesh;
pub mod plugin;
pub mod ratelimit;
pub mod sandbox;
pub mod web;

#[cfg(test)]
pub mod test_utils;

pub use error::{GatewayError, Result};
pub use gateway::PluginGateway;
