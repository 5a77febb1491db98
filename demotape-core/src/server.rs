//! HTTP surface: `GET|HEAD /assets/:reference` and `/health`.

use crate::locator::AssetReference;
use crate::policy::RequesterContext;
use crate::service::DeliveryService;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{debug, info};

/// Create the delivery router.
pub fn create_router(service: Arc<DeliveryService>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/assets/:reference", get(get_asset).head(head_asset))
        .layer(CorsLayer::permissive())
        .with_state(service)
}

async fn health() -> &'static str {
    "ok"
}

async fn get_asset(
    State(service): State<Arc<DeliveryService>>,
    Path(reference): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Response {
    deliver(service, &reference, &params, connect_info, &headers, false).await
}

async fn head_asset(
    State(service): State<Arc<DeliveryService>>,
    Path(reference): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Response {
    deliver(service, &reference, &params, connect_info, &headers, true).await
}

async fn deliver(
    service: Arc<DeliveryService>,
    raw_reference: &str,
    params: &HashMap<String, String>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: &HeaderMap,
    head_only: bool,
) -> Response {
    let Ok(reference) = raw_reference.parse::<AssetReference>() else {
        debug!("Rejecting malformed asset reference {:?}", raw_reference);
        return not_found();
    };

    let requester = RequesterContext {
        token: requester_token(headers, params),
        remote_addr: connect_info.map(|ConnectInfo(addr)| addr.ip().to_string()),
    };
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok());

    match service
        .deliver(&reference, &requester, range, head_only)
        .await
    {
        Ok(response) => response,
        Err(e) => {
            info!("Request for {} failed: {}", reference, e);
            not_found()
        }
    }
}

/// `Authorization: Bearer <token>`, falling back to `?token=`.
fn requester_token(headers: &HeaderMap, params: &HashMap<String, String>) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .or_else(|| params.get("token").cloned())
        .filter(|t| !t.is_empty())
}

/// Every failure looks the same from outside.
fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "Not found").into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_header_wins_over_query() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        let params = HashMap::from([("token".to_string(), "xyz".to_string())]);
        assert_eq!(requester_token(&headers, &params), Some("abc".to_string()));
    }

    #[test]
    fn query_token_is_fallback() {
        let params = HashMap::from([("token".to_string(), "xyz".to_string())]);
        assert_eq!(
            requester_token(&HeaderMap::new(), &params),
            Some("xyz".to_string())
        );
    }

    #[test]
    fn non_bearer_and_empty_tokens_are_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic Zm9vOmJhcg=="));
        assert_eq!(requester_token(&headers, &HashMap::new()), None);

        let params = HashMap::from([("token".to_string(), String::new())]);
        assert_eq!(requester_token(&HeaderMap::new(), &params), None);
    }
}
