//! HTTP surface over the coordinator.
//!
//! Every request runs inside a tracing span carrying its correlation id
//! (incoming `X-Request-ID` or a fresh UUID). `/v2/*` requires a bearer
//! JWT when a secret is configured. Panics from handler code map to 500.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde_json::json;
use tower_http::catch_panic::CatchPanicLayer;
use tracing::Instrument;

use strata::{Coordinator, GaugeRegistry, HealthState};

use crate::graphql::StrataSchema;

pub const API_VERSIONS: &[&str] = &["v2"];

const REQUEST_ID_HEADER: &str = "X-Request-ID";

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub registry: Arc<GaugeRegistry>,
    pub schema: StrataSchema,
}

pub fn router(state: AppState) -> Router {
    let path_prefix = state.coordinator.config().path_prefix.clone();

    let v2 = Router::new()
        .route("/config", get(config_handler))
        .route("/schema", get(schema_handler))
        .route("/service", post(service_handler))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            bearer_auth_middleware,
        ));

    let router = Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .nest("/v2", v2)
        .layer(middleware::from_fn(request_id_middleware))
        .layer(CatchPanicLayer::custom(handle_panic))
        .with_state(state);

    if path_prefix.is_empty() {
        router
    } else {
        Router::new().nest(&path_prefix, router)
    }
}

fn handle_panic(err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unexpected state");
    tracing::error!(detail, "request handler panicked");
    problem_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
}

fn problem_response(status: StatusCode, detail: &str) -> Response {
    (
        status,
        Json(json!({"status": status.as_u16(), "detail": detail})),
    )
        .into_response()
}

async fn request_id_middleware(request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        method = %request.method(),
        path = %request.uri().path(),
    );

    let mut response = next.run(request).instrument(span).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

async fn bearer_auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(secret) = state.coordinator.config().jwt_secret.clone() else {
        return next.run(request).await;
    };

    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let Some(token) = token else {
        return problem_response(StatusCode::UNAUTHORIZED, "missing bearer token");
    };

    let validation = Validation::new(Algorithm::HS256);
    let key = DecodingKey::from_secret(secret.as_bytes());
    if let Err(e) = jsonwebtoken::decode::<serde_json::Value>(token, &key, &validation) {
        tracing::warn!(error = %e, "rejected bearer token");
        return problem_response(StatusCode::UNAUTHORIZED, "invalid bearer token");
    }

    next.run(request).await
}

async fn root_handler() -> Json<serde_json::Value> {
    Json(json!({
        "release": format!("strata v{}", env!("CARGO_PKG_VERSION")),
        "sha": option_env!("STRATA_GIT_SHA").unwrap_or("unknown"),
        "apiVersions": API_VERSIONS,
    }))
}

async fn health_handler(State(state): State<AppState>) -> Response {
    let health = state.coordinator.health_check().await;
    let status = match health.status {
        HealthState::UP => StatusCode::OK,
        HealthState::DOWN => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(health)).into_response()
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    plain_text(state.registry.render())
}

async fn config_handler(State(state): State<AppState>) -> Response {
    let rendered = state.coordinator.config().to_string();
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-yaml")
        .body(Body::from(rendered))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn schema_handler(State(state): State<AppState>) -> Response {
    plain_text(state.schema.sdl())
}

async fn service_handler(
    State(state): State<AppState>,
    Json(request): Json<async_graphql::Request>,
) -> Json<async_graphql::Response> {
    tracing::info!(operation = ?request.operation_name, "graphql request");
    Json(state.schema.execute(request).await)
}

fn plain_text(body: String) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
