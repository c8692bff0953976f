//! Local control API
//!
//! HTTP/WS server that lets the browser UI authenticate against the
//! agent and drive it: status, restart, mode switching and the WebSocket
//! bridge to the INDI-server. Browser access is limited to the
//! indihub.space origins (plus configured extras), and every protected
//! route checks the session access token.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::header::{AUTHORIZATION, ORIGIN};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use indihub_core::error::{AgentError, Result};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use url::Url;

use crate::api::{tls, ws_bridge};
use crate::modes::ModeSupervisor;

/// Origins that may open the control API from a browser.
const DEFAULT_ORIGINS: [&str; 3] = ["indihub.space", "app.indihub.space", "kids.indihub.space"];

/// Which browser origins are allowed in, as host or host:port entries.
#[derive(Debug, Clone)]
pub struct OriginPolicy {
    allowed: HashSet<String>,
    dev: bool,
}

impl OriginPolicy {
    pub fn new(extras: &[String], dev: bool) -> Self {
        let mut allowed: HashSet<String> =
            DEFAULT_ORIGINS.iter().map(|s| s.to_string()).collect();
        if dev {
            allowed.insert("localhost".to_string());
        }
        for extra in extras {
            let extra = extra.trim();
            if !extra.is_empty() {
                allowed.insert(extra.to_string());
            }
        }
        Self { allowed, dev }
    }

    /// Check an `Origin` header value; both the bare host and host:port
    /// forms are matched against the allow-set.
    pub fn check(&self, origin: Option<&HeaderValue>) -> bool {
        let Some(origin) = origin.and_then(|v| v.to_str().ok()) else {
            return false;
        };
        let Ok(url) = Url::parse(origin) else {
            return false;
        };
        let Some(host) = url.host_str() else {
            return false;
        };
        if self.allowed.contains(host) {
            return true;
        }
        match url.port() {
            Some(port) => self.allowed.contains(&format!("{host}:{port}")),
            None => false,
        }
    }

    /// The http/https origin list for the CORS pre-flight layer.
    pub fn cors_origins(&self) -> Vec<HeaderValue> {
        let mut origins = Vec::new();
        for host in &self.allowed {
            for scheme in ["http", "https"] {
                if let Ok(value) = HeaderValue::from_str(&format!("{scheme}://{host}")) {
                    origins.push(value);
                }
            }
        }
        if self.dev {
            if let Ok(value) = HeaderValue::from_str("http://localhost:5000") {
                origins.push(value);
            }
        }
        origins
    }
}

pub struct ApiState {
    pub token: String,
    pub indi_server_addr: String,
    pub supervisor: Arc<ModeSupervisor>,
    pub origins: OriginPolicy,
    pub shutdown: CancellationToken,
}

#[derive(Deserialize)]
struct TokenQuery {
    #[serde(default)]
    token: String,
}

pub fn router(state: Arc<ApiState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(state.origins.cors_origins())
        .allow_methods([Method::GET, Method::POST]);

    Router::new()
        .route("/status", get(get_status))
        .route("/restart", get(get_restart))
        .route("/mode/:new_mode", post(change_mode))
        .route("/websocket/indiserver", get(ws_indiserver))
        .route("/websocket/phd2server", get(ws_phd2server))
        .with_state(state)
        .layer(cors)
}

/// Serve the API, over TLS with the self-signed chain when requested.
pub async fn serve(state: Arc<ApiState>, port: u16, with_tls: bool, dev: bool) -> Result<()> {
    let app = router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    if with_tls {
        let (key, cert) = tls::get_self_signed_cert(dev)?;
        let config = RustlsConfig::from_pem_file(cert, key)
            .await
            .map_err(AgentError::Io)?;
        info!("API-server listening on https://{addr}");
        axum_server::bind_rustls(addr, config)
            .serve(app.into_make_service())
            .await
            .map_err(AgentError::Io)?;
        return Ok(());
    }

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("API-server listening on http://{addr}");
    axum::serve(listener, app).await.map_err(AgentError::Io)?;
    Ok(())
}

async fn get_status(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    Json(state.supervisor.status().await)
}

async fn get_restart(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    Json(state.supervisor.restart().await)
}

async fn change_mode(
    State(state): State<Arc<ApiState>>,
    Path(new_mode): Path<String>,
    headers: HeaderMap,
) -> Response {
    let authorized = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|token| token == state.token)
        .unwrap_or(false);
    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    match state.supervisor.change_mode(&new_mode).await {
        Ok(status) => Json(status).into_response(),
        Err(err) => {
            error!("mode change rejected: {err}");
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "message": err.to_string() })),
            )
                .into_response()
        }
    }
}

async fn ws_indiserver(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    match gate(&state, &query, &headers) {
        Ok(()) => {}
        Err(code) => return code.into_response(),
    }

    let indi_server_addr = state.indi_server_addr.clone();
    let shutdown = state.shutdown.clone();
    ws.on_upgrade(move |socket| ws_bridge::run(socket, indi_server_addr, shutdown))
}

/// Reserved; upgrades succeed but no PHD2 bridge is wired up yet.
async fn ws_phd2server(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    match gate(&state, &query, &headers) {
        Ok(()) => {}
        Err(code) => return code.into_response(),
    }
    ws.on_upgrade(|_socket| async {})
}

fn gate(
    state: &ApiState,
    query: &TokenQuery,
    headers: &HeaderMap,
) -> std::result::Result<(), StatusCode> {
    if !state.origins.check(headers.get(ORIGIN)) {
        return Err(StatusCode::FORBIDDEN);
    }
    if query.token != state.token {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(s: &str) -> HeaderValue {
        HeaderValue::from_str(s).unwrap()
    }

    #[test]
    fn test_default_origins_are_allowed() {
        let policy = OriginPolicy::new(&[], false);
        assert!(policy.check(Some(&header("https://indihub.space"))));
        assert!(policy.check(Some(&header("https://app.indihub.space"))));
        assert!(policy.check(Some(&header("http://kids.indihub.space"))));
    }

    #[test]
    fn test_unknown_origin_is_rejected() {
        let policy = OriginPolicy::new(&[], false);
        assert!(!policy.check(Some(&header("https://evil.example.com"))));
        assert!(!policy.check(Some(&header("not a url"))));
        assert!(!policy.check(None));
    }

    #[test]
    fn test_localhost_only_in_dev() {
        assert!(!OriginPolicy::new(&[], false).check(Some(&header("http://localhost"))));
        assert!(OriginPolicy::new(&[], true).check(Some(&header("http://localhost"))));
    }

    #[test]
    fn test_extra_origins_match_host_and_host_port() {
        let policy = OriginPolicy::new(
            &["observatory.lan".to_string(), "10.0.0.5:8080".to_string()],
            false,
        );
        assert!(policy.check(Some(&header("http://observatory.lan"))));
        assert!(policy.check(Some(&header("http://observatory.lan:9999"))));
        assert!(policy.check(Some(&header("http://10.0.0.5:8080"))));
        assert!(!policy.check(Some(&header("http://10.0.0.5:9090"))));
    }

    #[test]
    fn test_cors_origin_list_has_both_schemes() {
        let policy = OriginPolicy::new(&[], false);
        let origins = policy.cors_origins();
        assert!(origins.contains(&header("https://indihub.space")));
        assert!(origins.contains(&header("http://indihub.space")));
        assert!(!origins.contains(&header("http://localhost:5000")));

        let dev = OriginPolicy::new(&[], true);
        assert!(dev.cors_origins().contains(&header("http://localhost:5000")));
    }
}
