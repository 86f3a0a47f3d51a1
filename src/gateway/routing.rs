//! Request path → plugin id resolution
//!
//! Explicit routes (from configuration or declared plugin endpoints) are
//! matched longest-prefix-first on segment boundaries. Paths no route covers
//! fall back to `<prefix>/<plugin-id>/...`.

use crate::error::ConfigError;
use std::collections::BTreeMap;
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RouteSource {
    /// From configuration; survives plugin unloads
    Static,
    /// From a loaded plugin's endpoint declarations
    Endpoint,
}

#[derive(Debug, Clone)]
struct Route {
    plugin_id: String,
    source: RouteSource,
}

pub struct RouteTable {
    prefix: String,
    routes: RwLock<BTreeMap<String, Route>>,
}

fn normalize(path: &str) -> &str {
    if path.len() > 1 {
        path.trim_end_matches('/')
    } else {
        path
    }
}

/// `prefix` covers `path` exactly or up to a `/`.
fn covers(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return path.starts_with('/');
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

impl RouteTable {
    pub fn new<'a>(
        prefix: &str,
        static_routes: impl IntoIterator<Item = (&'a String, &'a String)>,
    ) -> Self {
        let routes = static_routes
            .into_iter()
            .map(|(path, plugin_id)| {
                (
                    normalize(path).to_string(),
                    Route {
                        plugin_id: plugin_id.clone(),
                        source: RouteSource::Static,
                    },
                )
            })
            .collect();
        Self {
            prefix: normalize(prefix).to_string(),
            routes: RwLock::new(routes),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Plugin id serving `path`, if any route or the fallback convention names one.
    pub fn resolve(&self, path: &str) -> Option<String> {
        let path = path.split(['?', '#']).next().unwrap_or(path);
        if let Ok(routes) = self.routes.read() {
            let hit = routes
                .iter()
                .filter(|(prefix, _)| covers(prefix, path))
                .max_by_key(|(prefix, _)| prefix.len());
            if let Some((_, route)) = hit {
                return Some(route.plugin_id.clone());
            }
        }

        if !covers(&self.prefix, path) {
            return None;
        }
        let rest = if self.prefix == "/" {
            path
        } else {
            &path[self.prefix.len()..]
        };
        rest.split('/')
            .find(|segment| !segment.is_empty())
            .map(str::to_string)
    }

    /// Fail if any of `paths` is already routed to a different plugin.
    pub fn check_conflicts<'a>(
        &self,
        plugin_id: &str,
        paths: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), ConfigError> {
        let routes = self
            .routes
            .read()
            .map_err(|_| ConfigError::Validation("route table lock poisoned".into()))?;
        for path in paths {
            if let Some(route) = routes.get(normalize(path)) {
                if route.plugin_id != plugin_id {
                    return Err(ConfigError::Validation(format!(
                        "Route '{}' already belongs to plugin '{}'",
                        path, route.plugin_id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Route each endpoint path to `plugin_id`. Paths taken by another plugin
    /// are left alone.
    pub fn add_endpoints<'a>(&self, plugin_id: &str, paths: impl IntoIterator<Item = &'a str>) {
        let Ok(mut routes) = self.routes.write() else {
            return;
        };
        for path in paths {
            let key = normalize(path).to_string();
            match routes.get(&key) {
                Some(existing) if existing.plugin_id != plugin_id => {
                    tracing::warn!(
                        plugin_id = %plugin_id,
                        path = %key,
                        owner = %existing.plugin_id,
                        "Endpoint route already taken, skipping"
                    );
                }
                Some(_) => {}
                None => {
                    routes.insert(
                        key,
                        Route {
                            plugin_id: plugin_id.to_string(),
                            source: RouteSource::Endpoint,
                        },
                    );
                }
            }
        }
    }

    /// Drop endpoint routes owned by `plugin_id`; configured routes stay.
    pub fn remove_plugin(&self, plugin_id: &str) {
        if let Ok(mut routes) = self.routes.write() {
            routes.retain(|_, r| !(r.source == RouteSource::Endpoint && r.plugin_id == plugin_id));
        }
    }

    pub fn routes(&self) -> Vec<(String, String)> {
        self.routes
            .read()
            .map(|routes| {
                routes
                    .iter()
                    .map(|(p, r)| (p.clone(), r.plugin_id.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}
