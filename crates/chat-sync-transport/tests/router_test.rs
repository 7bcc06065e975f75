//! Router smoke tests; no socket is actually upgraded.

use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
};
use chat_sync_bridge::{ChatService, MemoryGateway};
use chat_sync_core::{EventHub, RateTracker, RunTracker, SyncConfig};
use chat_sync_transport::{WsState, create_ws_router};
use tower::ServiceExt;

fn router() -> axum::Router {
    let hub = Arc::new(EventHub::new());
    let chat = ChatService::new(
        Arc::new(MemoryGateway::new()),
        Arc::clone(&hub),
        Arc::new(RunTracker::new()),
        &SyncConfig::default(),
    );
    create_ws_router(WsState::new(
        hub,
        chat,
        Arc::new(RateTracker::new(30, Duration::from_secs(60))),
    ))
}

fn request(method: Method, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_plain_get_is_refused_without_upgrade() {
    let response = router().oneshot(request(Method::GET, "/ws")).await.unwrap();
    assert!(response.status().is_client_error(), "{}", response.status());
}

#[tokio::test]
async fn test_only_get_is_routed() {
    let response = router().oneshot(request(Method::POST, "/ws")).await.unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_unknown_path_is_not_found() {
    let response = router().oneshot(request(Method::GET, "/events")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
