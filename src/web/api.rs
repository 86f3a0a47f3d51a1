use crate::error::GatewayError;
use crate::gateway::PluginGateway;
use crate::plugin::{DomainEvent, PluginConfig, PluginRequest, PluginResponse};
use crate::ratelimit::{retry_after_secs, ClientContext, RateLimitDecision, RequestGuard};
use bytes::Bytes;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use warp::http::header::{HeaderMap, HeaderName, HeaderValue};
use warp::http::{Method, StatusCode};
use warp::path::FullPath;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

const MAX_BODY_BYTES: u64 = 1024 * 1024;
const USER_HEADER: &str = "x-user-id";

/// Declared body larger than the proxy accepts
#[derive(Debug)]
struct BodyTooLarge;

impl warp::reject::Reject for BodyTooLarge {}

pub fn with_gateway(
    gateway: Arc<PluginGateway>,
) -> impl Filter<Extract = (Arc<PluginGateway>,), Error = Infallible> + Clone {
    warp::any().map(move || gateway.clone())
}

pub fn admin_routes(
    gateway: Arc<PluginGateway>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let list = warp::path!("plugins")
        .and(warp::get())
        .and(with_gateway(gateway.clone()))
        .and_then(list_plugins);

    let info = warp::path!("plugins" / String)
        .and(warp::get())
        .and(with_gateway(gateway.clone()))
        .and_then(plugin_info);

    let metrics = warp::path!("plugins" / String / "metrics")
        .and(warp::get())
        .and(with_gateway(gateway.clone()))
        .and_then(plugin_metrics);

    let circuit = warp::path!("plugins" / String / "circuit")
        .and(warp::get())
        .and(with_gateway(gateway.clone()))
        .and_then(plugin_circuit);

    let load = warp::path!("plugins" / String)
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::json())
        .and(with_gateway(gateway.clone()))
        .and_then(load_plugin);

    let unload = warp::path!("plugins" / String)
        .and(warp::delete())
        .and(with_gateway(gateway.clone()))
        .and_then(unload_plugin);

    let events = warp::path!("events")
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::json())
        .and(with_gateway(gateway.clone()))
        .and_then(publish_event);

    let prometheus = warp::path!("metrics")
        .and(warp::get())
        .and(with_gateway(gateway))
        .and_then(render_metrics);

    warp::path("admin").and(
        list.or(info)
            .or(metrics)
            .or(circuit)
            .or(load)
            .or(unload)
            .or(events)
            .or(prometheus),
    )
}

/// Every request not claimed by another route goes to a plugin.
pub fn proxy_route(
    gateway: Arc<PluginGateway>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::method()
        .and(warp::path::full())
        .and(warp::header::headers_cloned())
        .and(warp::addr::remote())
        .and(body_limit())
        .and(warp::body::bytes())
        .and(with_gateway(gateway))
        .and_then(proxy)
}

/// Reject a declared `Content-Length` over the limit; requests without one
/// (body-less GETs) pass.
fn body_limit() -> impl Filter<Extract = (), Error = Rejection> + Clone {
    warp::header::optional::<u64>("content-length")
        .and_then(|length: Option<u64>| async move {
            match length {
                Some(n) if n > MAX_BODY_BYTES => Err(warp::reject::custom(BodyTooLarge)),
                _ => Ok(()),
            }
        })
        .untuple_one()
}

/// Client address. Forwarding headers (first `X-Forwarded-For` hop, then
/// `X-Real-IP`) count only when the socket peer is a trusted proxy.
pub fn client_ip(headers: &HeaderMap, remote: Option<SocketAddr>, guard: &RequestGuard) -> String {
    let peer: Option<IpAddr> = remote.map(|addr| addr.ip());
    let Some(peer) = peer else {
        return "unknown".to_string();
    };
    if !guard.trusts_proxy(peer) {
        return peer.to_string();
    }

    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    forwarded
        .or(real_ip)
        .map(str::to_string)
        .unwrap_or_else(|| peer.to_string())
}

fn decode_body(body: &Bytes) -> serde_json::Value {
    if body.is_empty() {
        return serde_json::Value::Null;
    }
    serde_json::from_slice(body)
        .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(body).into_owned()))
}

async fn proxy(
    method: Method,
    path: FullPath,
    headers: HeaderMap,
    remote: Option<SocketAddr>,
    body: Bytes,
    gateway: Arc<PluginGateway>,
) -> Result<Response, Infallible> {
    if body.len() as u64 > MAX_BODY_BYTES {
        return Ok(json_error(
            StatusCode::PAYLOAD_TOO_LARGE,
            "payload_too_large",
            format!("request body exceeds {} bytes", MAX_BODY_BYTES),
        ));
    }
    let ip = client_ip(&headers, remote, gateway.request_guard());
    let user = headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string);

    let mut client = ClientContext::new(ip.clone(), method.as_str(), path.as_str());
    if let Some(user) = &user {
        client = client.with_user(user.clone());
    }

    let now = Instant::now();
    let guard_decision = match gateway.request_guard().evaluate_at(&client, now) {
        Ok(decision) => decision,
        Err(e) => {
            let plugin = gateway.routes().resolve(path.as_str()).unwrap_or_default();
            gateway
                .mesh()
                .observability()
                .record_rejection(&plugin, e.reason());
            tracing::debug!(ip = %ip, path = %path.as_str(), reason = e.reason(), "Request rejected by guard");
            return Ok(error_reply(&GatewayError::from(e)));
        }
    };

    let mut request = PluginRequest::new(method.as_str(), path.as_str()).with_body(decode_body(&body));
    request.headers = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    request.user_id = user;
    request.context.insert("client_ip".into(), json!(ip));
    request.timestamp = Some(Utc::now());

    match gateway.handle_request_at(request, now).await {
        Ok((response, decision)) => {
            let tightest = match guard_decision {
                Some(g) if g.remaining < decision.remaining => g,
                _ => decision,
            };
            Ok(plugin_reply(response, &tightest))
        }
        Err(e) => Ok(error_reply(&e)),
    }
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        headers.insert(name, value);
    }
}

fn plugin_reply(response: PluginResponse, decision: &RateLimitDecision) -> Response {
    let status = StatusCode::from_u16(response.status_code).unwrap_or(StatusCode::OK);
    let mut reply = warp::reply::json(&response.body).into_response();
    *reply.status_mut() = status;

    let headers = reply.headers_mut();
    for (name, value) in &response.headers {
        insert_header(headers, name, value);
    }
    for (name, value) in decision.headers() {
        insert_header(headers, name, &value);
    }
    reply
}

fn json_error(status: StatusCode, reason: &str, message: String) -> Response {
    let body = json!({
        "error": status.canonical_reason().unwrap_or("Error"),
        "message": message,
        "reason": reason,
    });
    let mut reply = warp::reply::json(&body).into_response();
    *reply.status_mut() = status;
    reply
}

/// JSON error body with the gateway's status code and `Retry-After` when the
/// condition clears on its own.
pub fn error_reply(err: &GatewayError) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let mut body = json!({
        "error": status.canonical_reason().unwrap_or("Error"),
        "message": err.to_string(),
        "reason": err.reason(),
    });
    let retry_after = err.retry_after();
    if let Some(retry) = retry_after {
        body["retry_after_seconds"] = json!(retry_after_secs(retry));
        let reset = Utc::now() + chrono::Duration::from_std(retry).unwrap_or_default();
        body["reset_time"] = json!(reset.to_rfc3339());
    }

    let mut reply = warp::reply::json(&body).into_response();
    *reply.status_mut() = status;
    if let Some(retry) = retry_after {
        if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE {
            insert_header(
                reply.headers_mut(),
                "Retry-After",
                &retry_after_secs(retry).to_string(),
            );
        }
    }
    reply
}

/// Turn filter rejections into the same JSON error shape.
pub async fn handle_rejection(err: Rejection) -> Result<Response, Infallible> {
    let (status, reason, message) =
        if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
            (StatusCode::BAD_REQUEST, "invalid_body", e.to_string())
        } else if err.find::<BodyTooLarge>().is_some()
            || err.find::<warp::reject::PayloadTooLarge>().is_some()
        {
            (
                StatusCode::PAYLOAD_TOO_LARGE,
                "payload_too_large",
                format!("request body exceeds {} bytes", MAX_BODY_BYTES),
            )
        } else if err.find::<warp::reject::LengthRequired>().is_some() {
            (
                StatusCode::LENGTH_REQUIRED,
                "length_required",
                "a content-length header is required".to_string(),
            )
        } else if err.find::<warp::reject::UnsupportedMediaType>().is_some() {
            (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "unsupported_media_type",
                "expected application/json".to_string(),
            )
        } else if let Some(e) = err.find::<warp::cors::CorsForbidden>() {
            (StatusCode::FORBIDDEN, "cors_forbidden", e.to_string())
        } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
            (
                StatusCode::METHOD_NOT_ALLOWED,
                "method_not_allowed",
                "method not allowed".to_string(),
            )
        } else if err.is_not_found() {
            (
                StatusCode::NOT_FOUND,
                "route_not_found",
                "no route matches this path".to_string(),
            )
        } else {
            tracing::warn!(?err, "Unhandled rejection");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "unhandled rejection".to_string(),
            )
        };
    Ok(json_error(status, reason, message))
}

pub async fn health(gateway: Arc<PluginGateway>) -> Result<impl Reply, Infallible> {
    let plugins = gateway.list_plugins().await;
    let active = plugins
        .iter()
        .filter(|p| p.status == crate::plugin::PluginStatus::Active)
        .count();
    Ok(warp::reply::json(&json!({
        "status": "healthy",
        "service": "plugin-gateway",
        "plugins": plugins.len(),
        "active": active,
    })))
}

async fn list_plugins(gateway: Arc<PluginGateway>) -> Result<impl Reply, Infallible> {
    let plugins = gateway.list_plugins().await;
    Ok(warp::reply::json(&json!({ "plugins": plugins })))
}

async fn plugin_info(id: String, gateway: Arc<PluginGateway>) -> Result<Response, Infallible> {
    Ok(match gateway.get_plugin_info(&id).await {
        Ok(info) => warp::reply::json(&info).into_response(),
        Err(e) => error_reply(&e),
    })
}

async fn plugin_metrics(id: String, gateway: Arc<PluginGateway>) -> Result<Response, Infallible> {
    Ok(match gateway.get_plugin_metrics(&id).await {
        Ok(metrics) => warp::reply::json(&metrics).into_response(),
        Err(e) => error_reply(&e),
    })
}

async fn plugin_circuit(id: String, gateway: Arc<PluginGateway>) -> Result<Response, Infallible> {
    Ok(match gateway.circuit_status(&id).await {
        Ok(status) => warp::reply::json(&status).into_response(),
        Err(e) => error_reply(&e),
    })
}

async fn load_plugin(
    id: String,
    config: PluginConfig,
    gateway: Arc<PluginGateway>,
) -> Result<Response, Infallible> {
    if let Err(e) = gateway.load_plugin(&id, config).await {
        tracing::warn!(plugin_id = %id, error = %e, "Load requested over HTTP failed");
        return Ok(error_reply(&e));
    }
    Ok(match gateway.get_plugin_info(&id).await {
        Ok(info) => warp::reply::with_status(
            warp::reply::json(&json!({ "status": "loaded", "plugin": info })),
            StatusCode::CREATED,
        )
        .into_response(),
        Err(e) => error_reply(&e),
    })
}

async fn unload_plugin(id: String, gateway: Arc<PluginGateway>) -> Result<Response, Infallible> {
    Ok(match gateway.unload_plugin(&id).await {
        Ok(()) => warp::reply::json(&json!({ "status": "unloaded", "plugin": id })).into_response(),
        Err(e) => error_reply(&e),
    })
}

#[derive(Debug, Deserialize)]
pub struct PublishEventRequest {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default = "default_event_source")]
    pub source: String,
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
}

fn default_event_source() -> String {
    "http".to_string()
}

async fn publish_event(
    request: PublishEventRequest,
    gateway: Arc<PluginGateway>,
) -> Result<impl Reply, Infallible> {
    let mut event = DomainEvent::new(request.event_type, request.source);
    event.data = request.data;

    let failures = gateway.publish_event(&event).await;
    let failures: Vec<serde_json::Value> = failures
        .into_iter()
        .map(|(plugin, error)| json!({ "plugin": plugin, "error": error.to_string() }))
        .collect();

    Ok(warp::reply::json(&json!({
        "event_id": event.id,
        "failures": failures,
    })))
}

async fn render_metrics(gateway: Arc<PluginGateway>) -> Result<impl Reply, Infallible> {
    Ok(warp::reply::with_header(
        gateway.mesh().observability().render(),
        "content-type",
        "text/plain; version=0.0.4",
    ))
}
