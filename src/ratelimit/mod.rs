//! Request throttling
//!
//! - `sliding_window`: the per-key counter store every limiter here is built on
//! - `plugin`: plugin-wide and per-endpoint limits applied by the gateway
//! - `ddos`: coarse per-IP counter that installs temporary bans
//! - `guard`: per-IP / per-user policy evaluated in front of the gateway

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

pub mod ddos;
pub mod guard;
pub mod plugin;
pub mod sliding_window;

pub use ddos::DdosGuard;
pub use guard::{ClientContext, EndpointLimit, RequestGuard};
pub use plugin::PluginRateLimiter;
pub use sliding_window::SlidingWindow;

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("{scope} limit of {limit} exceeded, retry in {}s", .retry_after.as_secs())]
    Exceeded {
        scope: String,
        limit: u32,
        retry_after: Duration,
    },

    #[error("IP {ip} is temporarily banned, retry in {}s", .retry_after.as_secs())]
    DdosBanned { ip: String, retry_after: Duration },

    #[error("IP {ip} is blacklisted")]
    Blacklisted { ip: String },
}

impl RateLimitError {
    pub fn status_code(&self) -> u16 {
        match self {
            RateLimitError::Exceeded { .. } | RateLimitError::DdosBanned { .. } => 429,
            RateLimitError::Blacklisted { .. } => 403,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            RateLimitError::Exceeded { .. } => "rate_limited",
            RateLimitError::DdosBanned { .. } => "ddos_banned",
            RateLimitError::Blacklisted { .. } => "blacklisted",
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RateLimitError::Exceeded { retry_after, .. }
            | RateLimitError::DdosBanned { retry_after, .. } => Some(*retry_after),
            RateLimitError::Blacklisted { .. } => None,
        }
    }
}

/// Outcome of one sliding-window check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Time until the oldest counted request ages out
    pub reset_after: Duration,
    pub retry_after: Option<Duration>,
}

impl RateLimitDecision {
    pub fn reset_time(&self) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::from_std(self.reset_after).unwrap_or_default()
    }

    /// `X-RateLimit-*` (and `Retry-After` on rejection) header values.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_time().timestamp().to_string()),
        ];
        if let Some(retry) = self.retry_after {
            headers.push(("Retry-After", retry_after_secs(retry).to_string()));
        }
        headers
    }

    pub(crate) fn into_result(self, scope: impl Into<String>) -> Result<Self, RateLimitError> {
        match self.retry_after {
            Some(retry_after) if !self.allowed => Err(RateLimitError::Exceeded {
                scope: scope.into(),
                limit: self.limit,
                retry_after,
            }),
            _ => Ok(self),
        }
    }
}

/// Whole seconds for a `Retry-After` header, never below one.
pub fn retry_after_secs(d: Duration) -> u64 {
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    secs.max(1)
}
