use crate::config::HttpConfig;
use crate::error::{ConfigError, Result};
use crate::gateway::PluginGateway;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use warp::Filter;

pub mod api;


fn listen_addr(host: &str, port: u16) -> Result<SocketAddr> {
    let addr = format!("{}:{}", host, port)
        .parse::<SocketAddr>()
        .map_err(|e| ConfigError::Parse(format!("Invalid HTTP address {}:{}: {}", host, port, e)))?;
    Ok(addr)
}

fn bind_error(e: warp::Error) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::AddrInUse, e.to_string())
}

/// Serve the proxy listener, and the admin listener when enabled, until
/// `shutdown` is cancelled.
pub async fn start_server(
    gateway: Arc<PluginGateway>,
    http: &HttpConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let public_addr = listen_addr(&http.host, http.port)?;
    let token = shutdown.clone();
    let (bound, public) = warp::serve(create_routes(gateway.clone()))
        .try_bind_with_graceful_shutdown(public_addr, async move { token.cancelled().await })
        .map_err(bind_error)?;
    tracing::info!(addr = %bound, "Proxy listener ready");

    if !http.admin_enabled {
        public.await;
        tracing::info!("HTTP server stopped");
        return Ok(());
    }

    let admin_addr = listen_addr(&http.admin_host, http.admin_port)?;
    let (bound, admin) = warp::serve(create_admin_routes(gateway))
        .try_bind_with_graceful_shutdown(admin_addr, async move { shutdown.cancelled().await })
        .map_err(bind_error)?;
    tracing::info!(addr = %bound, "Admin listener ready");

    tokio::join!(public, admin);
    tracing::info!("HTTP server stopped");
    Ok(())
}

fn health_route(
    gateway: Arc<PluginGateway>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .and(api::with_gateway(gateway))
        .and_then(api::health)
}

/// Public listener: health plus the plugin proxy.
pub fn create_routes(
    gateway: Arc<PluginGateway>,
) -> impl Filter<Extract = impl warp::Reply, Error = std::convert::Infallible> + Clone {
    health_route(gateway.clone())
        .or(api::proxy_route(gateway))
        .with(
            warp::cors()
                .allow_any_origin()
                .allow_methods(vec!["GET", "POST", "PUT", "PATCH", "DELETE"])
                .allow_headers(vec!["Content-Type", "Authorization", "X-User-Id"]),
        )
        .recover(api::handle_rejection)
        .with(warp::trace::request())
}

/// Admin listener: plugin management, events, prometheus text, health.
pub fn create_admin_routes(
    gateway: Arc<PluginGateway>,
) -> impl Filter<Extract = impl warp::Reply, Error = std::convert::Infallible> + Clone {
    api::admin_routes(gateway.clone())
        .or(health_route(gateway))
        .recover(api::handle_rejection)
        .with(warp::trace::request())
}
