//! REST control plane: build info, a 1 Hz traffic stream and connection/DNS
//! diagnostics, all behind bearer-token auth (`Authorization: Bearer <t>` or
//! `?token=<t>` for clients that cannot set headers).

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::{error, info};

use crate::config::Endpoint;
use crate::resolver::DnsResolver;
use crate::stats::DEFAULT_MANAGER;

#[derive(Clone)]
struct ApiState {
    token: Arc<String>,
    nameservers: Arc<Vec<String>>,
}

/// Start serving on `api.host:port`; a zero port disables the surface.
pub fn serve(api: Endpoint, resolver: &DnsResolver) {
    if api.port == 0 {
        return;
    }
    let state = ApiState {
        token: Arc::new(api.token.clone()),
        nameservers: Arc::new(resolver.nameservers()),
    };
    let router = Router::new()
        .route("/api/", get(hello))
        .route("/api/traffic", get(traffic))
        .route("/api/connections", get(connections))
        .route("/api/dns", get(dns))
        .layer(middleware::from_fn_with_state(state.clone(), authenticate))
        .with_state(state);

    let addr = format!("{}:{}", api.host, api.port);
    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(err) => {
                error!(%addr, %err, "restful api listen failed");
                return;
            }
        };
        info!(listen = %addr, "RESTful API listening");
        if let Err(err) = axum::serve(listener, router).await {
            error!(%err, "restful api serve failed");
        }
    });
}

async fn authenticate(
    State(state): State<ApiState>,
    request: Request,
    next: Next,
) -> Response {
    if state.token.is_empty() {
        return next.run(request).await;
    }
    let bearer = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    // the query arrives percent-encoded; decode before comparing so tokens
    // with reserved characters survive the trip
    let query_token = request.uri().query().and_then(|q| {
        serde_urlencoded::from_str::<Vec<(String, String)>>(q)
            .ok()?
            .into_iter()
            .find(|(key, _)| key == "token")
            .map(|(_, value)| value)
    });
    let authorized = matches!(bearer, Some(t) if t == state.token.as_str())
        || query_token.as_deref() == Some(state.token.as_str());
    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"message": "Unauthorized"})),
        )
            .into_response();
    }
    next.run(request).await
}

async fn hello() -> Json<serde_json::Value> {
    Json(json!({
        "Name": "omnisocks",
        "Version": env!("CARGO_PKG_VERSION"),
        "OS": std::env::consts::OS,
        "Arch": std::env::consts::ARCH,
    }))
}

/// Chunked stream of `{"up":N,"down":N}` lines, one per second.
async fn traffic() -> Response {
    let stream = IntervalStream::new(tokio::time::interval(Duration::from_secs(1))).map(|_| {
        let (up, down) = DEFAULT_MANAGER.now();
        Ok::<_, Infallible>(format!("{}\n", json!({"up": up, "down": down})))
    });
    Response::builder()
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from_stream(stream))
        .expect("static response parts")
}

async fn connections() -> Json<serde_json::Value> {
    Json(json!({"connections": DEFAULT_MANAGER.snapshot()}))
}

async fn dns(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(json!({"nameservers": state.nameservers.as_slice()}))
}
