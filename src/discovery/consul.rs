//! Consul KV-backed registry
//!
//! Each plugin is one key, `<service>/plugins/<id>`, holding its `PluginInfo`
//! as JSON. Consul has no push channel we rely on here, so watching is done
//! by polling the key list and diffing snapshots.

use super::{DiscoveryRegistry, PluginEvent, PluginEventKind, RegistryError, WATCH_CAPACITY};
use crate::config::DiscoveryConfig;
use crate::plugin::PluginInfo;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

struct KvClient {
    http: reqwest::Client,
    base: Url,
    service_name: String,
}

impl KvClient {
    fn prefix_url(&self) -> Result<Url, RegistryError> {
        Ok(self
            .base
            .join(&format!("v1/kv/{}/plugins/", self.service_name))?)
    }

    fn key_url(&self, plugin_id: &str) -> Result<Url, RegistryError> {
        Ok(self.prefix_url()?.join(plugin_id)?)
    }

    async fn put(&self, plugin_id: &str, info: &PluginInfo) -> Result<(), RegistryError> {
        self.http
            .put(self.key_url(plugin_id)?)
            .json(info)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn delete(&self, plugin_id: &str) -> Result<(), RegistryError> {
        self.http
            .delete(self.key_url(plugin_id)?)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn get(&self, plugin_id: &str) -> Result<Option<PluginInfo>, RegistryError> {
        let mut url = self.key_url(plugin_id)?;
        url.set_query(Some("raw"));
        let response = self.http.get(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let bytes = response.error_for_status()?.bytes().await?;
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| RegistryError::Decode {
                id: plugin_id.to_string(),
                reason: e.to_string(),
            })
    }

    async fn keys(&self) -> Result<Vec<String>, RegistryError> {
        let mut url = self.prefix_url()?;
        url.set_query(Some("keys"));
        let response = self.http.get(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = response.error_for_status()?.json().await?;
        let prefix = format!("{}/plugins/", self.service_name);
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
            .filter(|id| !id.is_empty() && !id.contains('/'))
            .collect())
    }

    async fn snapshot(&self) -> Result<HashMap<String, PluginInfo>, RegistryError> {
        let mut plugins = HashMap::new();
        for id in self.keys().await? {
            match self.get(&id).await {
                Ok(Some(info)) => {
                    plugins.insert(id, info);
                }
                // Deleted between list and get.
                Ok(None) => {}
                Err(RegistryError::Decode { id, reason }) => {
                    tracing::warn!(plugin_id = %id, reason = %reason, "Skipping undecodable registry entry");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(plugins)
    }
}

pub struct ConsulRegistry {
    kv: Arc<KvClient>,
    poll_interval: Duration,
    events: broadcast::Sender<PluginEvent>,
    shutdown: CancellationToken,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl ConsulRegistry {
    pub fn new(config: &DiscoveryConfig) -> Result<Self, RegistryError> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Ok(Self {
            kv: Arc::new(KvClient {
                http,
                base: Url::parse(&config.address)?,
                service_name: config.service_name.clone(),
            }),
            poll_interval: config.poll_interval().max(Duration::from_millis(10)),
            events,
            shutdown: CancellationToken::new(),
            poller: Mutex::new(None),
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

fn diff(
    previous: &HashMap<String, PluginInfo>,
    current: &HashMap<String, PluginInfo>,
) -> Vec<PluginEvent> {
    let mut events = Vec::new();
    for (id, info) in current {
        match previous.get(id) {
            None => events.push(PluginEvent::new(
                PluginEventKind::Registered,
                id.clone(),
                Some(info.clone()),
            )),
            Some(old) if old != info => events.push(PluginEvent::new(
                PluginEventKind::Updated,
                id.clone(),
                Some(info.clone()),
            )),
            Some(_) => {}
        }
    }
    for (id, info) in previous {
        if !current.contains_key(id) {
            events.push(PluginEvent::new(
                PluginEventKind::Unregistered,
                id.clone(),
                Some(info.clone()),
            ));
        }
    }
    events
}

#[async_trait]
impl DiscoveryRegistry for ConsulRegistry {
    async fn start(&self) -> Result<(), RegistryError> {
        let mut poller = self.poller.lock().await;
        if poller.is_some() {
            return Ok(());
        }

        let kv = self.kv.clone();
        let events = self.events.clone();
        let shutdown = self.shutdown.clone();
        let period = self.poll_interval;

        let initial = match kv.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(error = %e, "Consul unreachable at start, watching from empty view");
                HashMap::new()
            }
        };

        *poller = Some(tokio::spawn(async move {
            let mut known = initial;
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        match kv.snapshot().await {
                            Ok(current) => {
                                for event in diff(&known, &current) {
                                    let _ = events.send(event);
                                }
                                known = current;
                            }
                            Err(e) => tracing::debug!(error = %e, "Consul poll failed"),
                        }
                    }
                }
            }
        }));

        tracing::info!(address = %self.kv.base, service = %self.kv.service_name, "Consul registry started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), RegistryError> {
        self.shutdown.cancel();
        if let Some(handle) = self.poller.lock().await.take() {
            let _ = handle.await;
        }
        Ok(())
    }

    async fn register_plugin(&self, plugin_id: &str, info: &PluginInfo) -> Result<(), RegistryError> {
        self.kv.put(plugin_id, info).await
    }

    async fn unregister_plugin(&self, plugin_id: &str) -> Result<(), RegistryError> {
        if self.kv.get(plugin_id).await?.is_none() {
            return Err(RegistryError::NotFound(plugin_id.to_string()));
        }
        self.kv.delete(plugin_id).await
    }

    async fn list_plugins(&self) -> Result<Vec<PluginInfo>, RegistryError> {
        let mut plugins: Vec<PluginInfo> = self.kv.snapshot().await?.into_values().collect();
        plugins.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(plugins)
    }

    async fn get_plugin(&self, plugin_id: &str) -> Result<PluginInfo, RegistryError> {
        self.kv
            .get(plugin_id)
            .await?
            .ok_or_else(|| RegistryError::NotFound(plugin_id.to_string()))
    }

    fn watch_plugins(&self) -> broadcast::Receiver<PluginEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::PluginStatus;
    use chrono::Utc;
    use std::net::SocketAddr;
    use std::sync::Mutex as StdMutex;
    use warp::http::StatusCode as WarpStatus;
    use warp::Filter;

    type Store = Arc<StdMutex<HashMap<String, String>>>;

    /// Minimal stand-in for Consul's KV endpoints.
    fn spawn_mock_consul(store: Store) -> SocketAddr {
        let with_store = {
            let store = store.clone();
            warp::any().map(move || store.clone())
        };

        let put = warp::put()
            .and(warp::path!("v1" / "kv" / ..))
            .and(warp::path::tail())
            .and(warp::body::bytes())
            .and(with_store.clone())
            .map(|tail: warp::path::Tail, body: bytes::Bytes, store: Store| {
                let value = String::from_utf8_lossy(&body).to_string();
                store.lock().unwrap().insert(tail.as_str().to_string(), value);
                warp::reply::with_status("true".to_string(), WarpStatus::OK)
            });

        let delete = warp::delete()
            .and(warp::path!("v1" / "kv" / ..))
            .and(warp::path::tail())
            .and(with_store.clone())
            .map(|tail: warp::path::Tail, store: Store| {
                store.lock().unwrap().remove(tail.as_str());
                warp::reply::with_status("true".to_string(), WarpStatus::OK)
            });

        let get = warp::get()
            .and(warp::path!("v1" / "kv" / ..))
            .and(warp::path::tail())
            .and(warp::query::<HashMap<String, String>>())
            .and(with_store)
            .map(
                |tail: warp::path::Tail, query: HashMap<String, String>, store: Store| {
                    let store = store.lock().unwrap();
                    if query.contains_key("keys") {
                        let mut keys: Vec<String> = store
                            .keys()
                            .filter(|k| k.starts_with(tail.as_str()))
                            .cloned()
                            .collect();
                        keys.sort();
                        if keys.is_empty() {
                            return warp::reply::with_status(String::new(), WarpStatus::NOT_FOUND);
                        }
                        let body = serde_json::to_string(&keys).unwrap();
                        return warp::reply::with_status(body, WarpStatus::OK);
                    }
                    match store.get(tail.as_str()) {
                        Some(v) => warp::reply::with_status(v.clone(), WarpStatus::OK),
                        None => warp::reply::with_status(String::new(), WarpStatus::NOT_FOUND),
                    }
                },
            );

        let (addr, server) =
            warp::serve(put.or(delete).or(get)).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);
        addr
    }

    fn info(id: &str) -> PluginInfo {
        PluginInfo {
            id: id.to_string(),
            name: id.to_string(),
            version: "1.0.0".into(),
            description: String::new(),
            author: String::new(),
            license: String::new(),
            status: PluginStatus::Active,
            endpoints: Vec::new(),
            metadata: Default::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn registry(addr: SocketAddr) -> ConsulRegistry {
        let config = DiscoveryConfig {
            provider: "consul".into(),
            address: format!("http://{addr}"),
            ..Default::default()
        };
        ConsulRegistry::new(&config)
            .unwrap()
            .with_poll_interval(Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_kv_round_trip() {
        let store: Store = Default::default();
        let registry = registry(spawn_mock_consul(store.clone()));

        registry.register_plugin("echo", &info("echo")).await.unwrap();
        assert!(store
            .lock()
            .unwrap()
            .contains_key("plugin-gateway/plugins/echo"));

        assert_eq!(registry.get_plugin("echo").await.unwrap().id, "echo");
        let listed = registry.list_plugins().await.unwrap();
        assert_eq!(listed.len(), 1);

        registry.unregister_plugin("echo").await.unwrap();
        assert!(matches!(
            registry.get_plugin("echo").await,
            Err(RegistryError::NotFound(_))
        ));
        assert!(matches!(
            registry.unregister_plugin("echo").await,
            Err(RegistryError::NotFound(_))
        ));
        assert!(registry.list_plugins().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_watch_reports_external_changes() {
        let store: Store = Default::default();
        let registry = registry(spawn_mock_consul(store.clone()));
        let mut events = registry.watch_plugins();
        registry.start().await.unwrap();

        // Written by another node.
        store.lock().unwrap().insert(
            "plugin-gateway/plugins/remote".into(),
            serde_json::to_string(&info("remote")).unwrap(),
        );

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no watch event")
            .unwrap();
        assert_eq!(event.kind, PluginEventKind::Registered);
        assert_eq!(event.plugin_id, "remote");

        store.lock().unwrap().remove("plugin-gateway/plugins/remote");
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no watch event")
            .unwrap();
        assert_eq!(event.kind, PluginEventKind::Unregistered);

        registry.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_an_error() {
        let config = DiscoveryConfig {
            provider: "consul".into(),
            address: "http://127.0.0.1:1".into(),
            ..Default::default()
        };
        let registry = ConsulRegistry::new(&config).unwrap();
        assert!(matches!(
            registry.register_plugin("x", &info("x")).await,
            Err(RegistryError::Http(_))
        ));
    }

    #[test]
    fn test_diff_detects_all_changes() {
        let mut before = HashMap::new();
        before.insert("a".to_string(), info("a"));
        before.insert("b".to_string(), info("b"));

        let mut after = HashMap::new();
        after.insert(
            "a".to_string(),
            before["a"].clone().with_status(PluginStatus::Failed),
        );
        after.insert("c".to_string(), info("c"));

        let mut kinds: Vec<(String, PluginEventKind)> = diff(&before, &after)
            .into_iter()
            .map(|e| (e.plugin_id, e.kind))
            .collect();
        kinds.sort_by(|x, y| x.0.cmp(&y.0));
        assert_eq!(
            kinds,
            vec![
                ("a".to_string(), PluginEventKind::Updated),
                ("b".to_string(), PluginEventKind::Unregistered),
                ("c".to_string(), PluginEventKind::Registered),
            ]
        );
    }
}
