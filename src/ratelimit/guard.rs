//! Per-IP / per-user admission policy
//!
//! Evaluation order, first match decides:
//! 1. whitelist: admitted without counting
//! 2. static or dynamic blacklist: 403
//! 3. DDoS ban / counter: 429
//! 4. endpoint-specific limit: 429
//! 5. global per-IP limit, then per-user limit when authenticated: 429

use super::{DdosGuard, RateLimitDecision, RateLimitError, SlidingWindow};
use crate::config::{EndpointLimitConfig, RequestGuardConfig};
use crate::error::ConfigError;
use dashmap::DashMap;
use std::collections::HashSet;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Who is calling and what they are calling
#[derive(Debug, Clone)]
pub struct ClientContext {
    pub ip: String,
    pub user_id: Option<String>,
    pub method: String,
    pub path: String,
}

impl ClientContext {
    pub fn new(ip: impl Into<String>, method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            user_id: None,
            method: method.into(),
            path: path.into(),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// Parsed `METHOD:/path` pattern; a trailing `*` makes the path a prefix.
#[derive(Debug, Clone)]
pub struct EndpointLimit {
    pattern: String,
    method: Option<String>,
    path: String,
    wildcard: bool,
    limit: u32,
    window: Duration,
    auth_required: bool,
}

impl EndpointLimit {
    pub fn parse(config: &EndpointLimitConfig) -> Result<Self, ConfigError> {
        let (method, path) = config.pattern.split_once(':').ok_or_else(|| {
            ConfigError::Validation(format!(
                "endpoint limit pattern '{}' must be METHOD:/path",
                config.pattern
            ))
        })?;
        if !path.starts_with('/') {
            return Err(ConfigError::Validation(format!(
                "endpoint limit pattern '{}' must have an absolute path",
                config.pattern
            )));
        }
        if config.window_seconds == 0 {
            return Err(ConfigError::Validation(format!(
                "endpoint limit '{}' has a zero window",
                config.pattern
            )));
        }

        let (path, wildcard) = match path.split_once('*') {
            Some((prefix, _)) => (prefix.to_string(), true),
            None => (path.to_string(), false),
        };
        let method = match method {
            "*" | "" => None,
            m => Some(m.to_ascii_uppercase()),
        };

        Ok(Self {
            pattern: config.pattern.clone(),
            method,
            path,
            wildcard,
            limit: config.limit,
            window: Duration::from_secs(config.window_seconds),
            auth_required: config.auth_required,
        })
    }

    pub fn matches(&self, method: &str, path: &str) -> bool {
        if let Some(m) = &self.method {
            if !m.eq_ignore_ascii_case(method) {
                return false;
            }
        }
        if self.wildcard {
            path.starts_with(&self.path)
        } else {
            path == self.path
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

pub struct RequestGuard {
    endpoint_limits: Vec<EndpointLimit>,
    global_ip_limit: u32,
    global_ip_window: Duration,
    user_limit: u32,
    user_window: Duration,
    whitelist: HashSet<String>,
    blacklist: HashSet<String>,
    trusted_proxies: HashSet<IpAddr>,
    /// Dynamic blacklist; `None` never expires
    dynamic_blacklist: DashMap<String, Option<Instant>>,
    ddos: DdosGuard,
    windows: SlidingWindow,
}

impl RequestGuard {
    pub fn new(config: &RequestGuardConfig) -> Result<Self, ConfigError> {
        let endpoint_limits = config
            .endpoint_limits
            .iter()
            .map(EndpointLimit::parse)
            .collect::<Result<Vec<_>, _>>()?;
        let trusted_proxies = config
            .trusted_proxies
            .iter()
            .map(|ip| {
                ip.parse::<IpAddr>().map_err(|e| {
                    ConfigError::Validation(format!("invalid trusted proxy '{}': {}", ip, e))
                })
            })
            .collect::<Result<HashSet<_>, _>>()?;

        Ok(Self {
            endpoint_limits,
            global_ip_limit: config.global_ip_limit,
            global_ip_window: config.global_ip_window(),
            user_limit: config.user_limit,
            user_window: config.user_window(),
            whitelist: config.whitelist_ips.iter().cloned().collect(),
            blacklist: config.blacklist_ips.iter().cloned().collect(),
            trusted_proxies,
            dynamic_blacklist: DashMap::new(),
            ddos: DdosGuard::new(
                config.ddos_threshold,
                config.ddos_window(),
                config.ddos_ban_duration(),
            ),
            windows: SlidingWindow::new(),
        })
    }

    /// Whether forwarding headers from `peer` describe the real client
    pub fn trusts_proxy(&self, peer: IpAddr) -> bool {
        self.trusted_proxies.contains(&peer)
    }

    pub fn evaluate(&self, client: &ClientContext) -> Result<Option<RateLimitDecision>, RateLimitError> {
        self.evaluate_at(client, Instant::now())
    }

    /// Admit or reject `client`. `Ok(None)` means whitelisted (nothing counted).
    pub fn evaluate_at(
        &self,
        client: &ClientContext,
        now: Instant,
    ) -> Result<Option<RateLimitDecision>, RateLimitError> {
        if self.whitelist.contains(&client.ip) {
            return Ok(None);
        }

        if self.is_blacklisted(&client.ip, now) {
            tracing::warn!(ip = %client.ip, path = %client.path, "Rejected blacklisted IP");
            return Err(RateLimitError::Blacklisted {
                ip: client.ip.clone(),
            });
        }

        if let Some(retry_after) = self.ddos.record_at(&client.ip, now) {
            return Err(RateLimitError::DdosBanned {
                ip: client.ip.clone(),
                retry_after,
            });
        }

        let mut tightest: Option<RateLimitDecision> = None;
        let mut keep = |d: RateLimitDecision| match tightest {
            Some(t) if t.remaining <= d.remaining => {}
            _ => tightest = Some(d),
        };

        if let Some(limit) = self.endpoint_limit(&client.method, &client.path) {
            let identifier = match (&client.user_id, limit.auth_required) {
                (Some(user), true) => format!("user:{user}"),
                _ => client.ip.clone(),
            };
            let key = format!("endpoint:{}:{}", limit.pattern, identifier);
            let decision = self.windows.check_at(&key, limit.limit, limit.window, now);
            keep(decision.into_result(format!("endpoint {}", limit.pattern)).inspect_err(
                |e| tracing::warn!(ip = %client.ip, pattern = %limit.pattern, error = %e, "Endpoint rate limit exceeded"),
            )?);
        }

        let decision = self.windows.check_at(
            &format!("ip:{}", client.ip),
            self.global_ip_limit,
            self.global_ip_window,
            now,
        );
        keep(decision.into_result("IP").inspect_err(
            |e| tracing::warn!(ip = %client.ip, error = %e, "IP rate limit exceeded"),
        )?);

        if let Some(user) = &client.user_id {
            let decision = self.windows.check_at(
                &format!("user:{user}"),
                self.user_limit,
                self.user_window,
                now,
            );
            keep(decision.into_result("user").inspect_err(
                |e| tracing::warn!(user_id = %user, error = %e, "User rate limit exceeded"),
            )?);
        }

        Ok(tightest)
    }

    /// Exact `METHOD:path` patterns win over wildcard ones.
    fn endpoint_limit(&self, method: &str, path: &str) -> Option<&EndpointLimit> {
        let mut candidates = self
            .endpoint_limits
            .iter()
            .filter(|l| l.matches(method, path));
        let first = candidates.next()?;
        if !first.wildcard {
            return Some(first);
        }
        Some(
            std::iter::once(first)
                .chain(candidates)
                .max_by_key(|l| (!l.wildcard, l.path.len()))
                .unwrap_or(first),
        )
    }

    fn is_blacklisted(&self, ip: &str, now: Instant) -> bool {
        if self.blacklist.contains(ip) {
            return true;
        }
        match self.dynamic_blacklist.get(ip).map(|e| *e) {
            Some(None) => true,
            Some(Some(until)) => until > now,
            None => false,
        }
    }

    /// Block `ip` for `ttl`, or until restart when `ttl` is `None`.
    pub fn blacklist_ip(&self, ip: &str, ttl: Option<Duration>) {
        let until = ttl.map(|ttl| Instant::now() + ttl);
        self.dynamic_blacklist.insert(ip.to_string(), until);
        tracing::info!(ip = %ip, ttl_seconds = ttl.map(|t| t.as_secs()), "IP added to blacklist");
    }

    pub fn unblacklist_ip(&self, ip: &str) -> bool {
        self.dynamic_blacklist.remove(ip).is_some()
    }

    /// Drop idle windows, elapsed bans and expired dynamic blacklist entries.
    pub fn sweep_expired(&self, now: Instant) {
        let windows = self.windows.sweep_expired(now);
        self.ddos.sweep_expired(now);
        self.dynamic_blacklist
            .retain(|_, until| until.map(|u| u > now).unwrap_or(true));
        tracing::trace!(windows, "Swept request guard state");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RequestGuardConfig {
        RequestGuardConfig {
            endpoint_limits: vec![
                EndpointLimitConfig {
                    pattern: "POST:/api/auth/login".into(),
                    limit: 3,
                    window_seconds: 15 * 60,
                    auth_required: false,
                },
                EndpointLimitConfig {
                    pattern: "POST:/api/*".into(),
                    limit: 30,
                    window_seconds: 3600,
                    auth_required: true,
                },
            ],
            global_ip_limit: 30,
            global_ip_window_seconds: 60,
            user_limit: 80,
            user_window_seconds: 60,
            ddos_threshold: 100,
            ddos_window_seconds: 60,
            ddos_ban_seconds: 1800,
            whitelist_ips: vec!["127.0.0.1".into()],
            blacklist_ips: vec!["6.6.6.6".into()],
            trusted_proxies: vec!["10.0.0.1".into()],
        }
    }

    #[test]
    fn test_exact_endpoint_limit_beats_wildcard() {
        let guard = RequestGuard::new(&config()).unwrap();
        let login = ClientContext::new("1.2.3.4", "POST", "/api/auth/login");
        let t0 = Instant::now();

        for i in 0..3 {
            let decision = guard
                .evaluate_at(&login, t0 + Duration::from_secs(i))
                .unwrap()
                .unwrap();
            assert!(decision.allowed);
        }
        let err = guard
            .evaluate_at(&login, t0 + Duration::from_secs(60))
            .unwrap_err();
        match err {
            RateLimitError::Exceeded { limit, retry_after, .. } => {
                assert_eq!(limit, 3);
                assert_eq!(retry_after, Duration::from_secs(14 * 60));
            }
            other => panic!("unexpected: {other:?}"),
        }

        // Other endpoints from the same IP still pass.
        let other = ClientContext::new("1.2.3.4", "GET", "/api/echo/ping");
        assert!(guard.evaluate_at(&other, t0 + Duration::from_secs(61)).is_ok());
    }

    #[test]
    fn test_whitelist_wins_over_blacklist_and_limits() {
        let mut cfg = config();
        cfg.blacklist_ips.push("127.0.0.1".into());
        cfg.global_ip_limit = 1;
        let guard = RequestGuard::new(&cfg).unwrap();
        let local = ClientContext::new("127.0.0.1", "GET", "/api/x");
        for _ in 0..5 {
            assert!(guard.evaluate(&local).unwrap().is_none());
        }
    }

    #[test]
    fn test_static_and_dynamic_blacklist() {
        let guard = RequestGuard::new(&config()).unwrap();
        let bad = ClientContext::new("6.6.6.6", "GET", "/api/x");
        assert!(matches!(
            guard.evaluate(&bad),
            Err(RateLimitError::Blacklisted { .. })
        ));

        let client = ClientContext::new("5.5.5.5", "GET", "/api/x");
        assert!(guard.evaluate(&client).is_ok());
        guard.blacklist_ip("5.5.5.5", None);
        assert!(matches!(
            guard.evaluate(&client),
            Err(RateLimitError::Blacklisted { .. })
        ));
        assert!(guard.unblacklist_ip("5.5.5.5"));
        assert!(guard.evaluate(&client).is_ok());
    }

    #[test]
    fn test_ddos_ban_preempts_endpoint_limits() {
        let mut cfg = config();
        cfg.global_ip_limit = 10_000;
        let guard = RequestGuard::new(&cfg).unwrap();
        let t0 = Instant::now();
        let client = ClientContext::new("7.7.7.7", "GET", "/api/echo/ping");

        for i in 0..100 {
            assert!(guard
                .evaluate_at(&client, t0 + Duration::from_millis(i))
                .is_ok());
        }
        let err = guard
            .evaluate_at(&client, t0 + Duration::from_millis(150))
            .unwrap_err();
        assert!(matches!(err, RateLimitError::DdosBanned { .. }));
        assert_eq!(err.status_code(), 429);

        // Still banned well after the counting window, on any endpoint.
        let login = ClientContext::new("7.7.7.7", "POST", "/api/auth/login");
        let err = guard
            .evaluate_at(&login, t0 + Duration::from_secs(20 * 60))
            .unwrap_err();
        assert!(matches!(err, RateLimitError::DdosBanned { .. }));

        assert!(guard
            .evaluate_at(&client, t0 + Duration::from_secs(31 * 60))
            .is_ok());
    }

    #[test]
    fn test_user_limit_applies_when_authenticated() {
        let mut cfg = config();
        cfg.user_limit = 2;
        let guard = RequestGuard::new(&cfg).unwrap();
        let t0 = Instant::now();

        // Same user from different IPs shares one user window.
        let a = ClientContext::new("1.1.1.1", "GET", "/api/x").with_user("u1");
        let b = ClientContext::new("2.2.2.2", "GET", "/api/x").with_user("u1");
        assert!(guard.evaluate_at(&a, t0).is_ok());
        assert!(guard.evaluate_at(&b, t0).is_ok());
        assert!(matches!(
            guard.evaluate_at(&a, t0),
            Err(RateLimitError::Exceeded { .. })
        ));
    }

    #[test]
    fn test_bad_pattern_rejected() {
        let mut cfg = config();
        cfg.endpoint_limits.push(EndpointLimitConfig {
            pattern: "no-colon".into(),
            limit: 1,
            window_seconds: 1,
            auth_required: false,
        });
        assert!(RequestGuard::new(&cfg).is_err());
    }

    #[test]
    fn test_trusted_proxies_parsed() {
        let guard = RequestGuard::new(&config()).unwrap();
        assert!(guard.trusts_proxy("10.0.0.1".parse().unwrap()));
        assert!(!guard.trusts_proxy("10.0.0.2".parse().unwrap()));

        let mut cfg = config();
        cfg.trusted_proxies.push("not-an-ip".into());
        assert!(RequestGuard::new(&cfg).is_err());
    }
}
