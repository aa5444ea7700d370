use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use bothost::registry::TenantRegistry;
use bothost::test_util::{PLATFORM_ROUTE, PLATFORM_TOKEN, TestPlatform, tenant_token};
use bothost::webhook::router;
use serde_json::json;
use tempfile::TempDir;
use tower::ServiceExt;

async fn post(app: &Router, identity: &str, body: impl Into<Body>) -> (StatusCode, String) {
    let req = Request::builder()
        .method("POST")
        .uri(format!("/bot/{identity}"))
        .header("content-type", "application/json")
        .body(body.into())
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

async fn get(app: &Router, path: &str) -> String {
    let req = Request::builder().uri(path).body(Body::empty()).unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn message(chat_id: i64, text: &str) -> String {
    json!({
        "update_id": 10,
        "message": {
            "message_id": 1,
            "from": {"id": chat_id, "is_bot": false, "first_name": "Ann"},
            "chat": {"id": chat_id, "type": "private"},
            "date": 0,
            "text": text
        }
    })
    .to_string()
}

async fn platform_with_echo_bot(dir: &TempDir) -> (TestPlatform, String, String) {
    let p = TestPlatform::new(dir.path());
    let token = tenant_token(1);
    let bot = p
        .seed_bot(7, &token, "echo_bot", "fn on_update(update) { @@echo }")
        .await;
    p.lifecycle.start(&token).await.unwrap();
    (p, token, bot.short_id)
}

#[tokio::test]
async fn running_tenant_gets_update_and_replies_with_its_own_token() {
    let dir = TempDir::new().unwrap();
    let (p, token, route) = platform_with_echo_bot(&dir).await;
    let app = router(p.webhook_state());

    let (status, body) = post(&app, &route, message(55, "ping")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "OK");
    assert_eq!(p.host.delivery_count(), 1);
    let sent = p.provider.sent_messages().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, token);
    assert_eq!(sent[0].1.chat_id, 55);
    assert_eq!(sent[0].1.text, "ping");
    assert_eq!(p.bot(&token).await.event_count, 1);
}

#[tokio::test]
async fn malformed_body_is_rejected_without_side_effects() {
    let dir = TempDir::new().unwrap();
    let (p, token, route) = platform_with_echo_bot(&dir).await;
    let app = router(p.webhook_state());

    let (status, _) = post(&app, &route, "{not json").await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(p.host.delivery_count(), 0);
    assert_eq!(p.bot(&token).await.event_count, 0);
    assert!(p.provider.sent_messages().await.is_empty());
}

#[tokio::test]
async fn unknown_identity_is_acknowledged_and_dropped() {
    let dir = TempDir::new().unwrap();
    let (p, _, _) = platform_with_echo_bot(&dir).await;
    let app = router(p.webhook_state());

    let (status, body) = post(&app, "does_not_exist", message(55, "ping")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "OK");
    assert_eq!(p.host.delivery_count(), 0);
}

#[tokio::test]
async fn blocked_tenant_receives_nothing() {
    let dir = TempDir::new().unwrap();
    let (p, token, route) = platform_with_echo_bot(&dir).await;
    p.lifecycle.block(&token).await.unwrap();
    let app = router(p.webhook_state());

    for _ in 0..2 {
        let (status, _) = post(&app, &route, message(55, "ping")).await;
        assert_eq!(status, StatusCode::OK);
    }

    assert_eq!(p.host.delivery_count(), 0);
    assert_eq!(p.bot(&token).await.event_count, 0);
    assert!(p.provider.sent_messages().await.is_empty());
}

#[tokio::test]
async fn panicking_tenant_does_not_affect_the_caller_or_others() {
    let dir = TempDir::new().unwrap();
    let (p, echo_token, echo_route) = platform_with_echo_bot(&dir).await;
    let bad_token = tenant_token(2);
    let bad = p
        .seed_bot(8, &bad_token, "bad_bot", "fn on_update(update) { @@panic }")
        .await;
    p.lifecycle.start(&bad_token).await.unwrap();
    let app = router(p.webhook_state());

    let (status, _) = post(&app, &bad.short_id, message(56, "boom")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = post(&app, &echo_route, message(55, "still here")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(p.provider.texts_to(55).await, vec!["still here".to_string()]);
    assert_eq!(p.bot(&echo_token).await.event_count, 1);
    assert!(p.lifecycle.is_running(&bad_token));
}

#[tokio::test]
async fn handler_errors_still_count_the_event() {
    let dir = TempDir::new().unwrap();
    let p = TestPlatform::new(dir.path());
    let token = tenant_token(3);
    let bot = p
        .seed_bot(7, &token, "failing_bot", "fn on_update(update) { @@fail }")
        .await;
    p.lifecycle.start(&token).await.unwrap();
    let app = router(p.webhook_state());

    let (status, _) = post(&app, &bot.short_id, message(55, "x")).await;

    assert_eq!(status, StatusCode::OK);
    assert!(p.provider.sent_messages().await.is_empty());
    assert_eq!(p.registry.get_by_token(&token).await.unwrap().unwrap().event_count, 1);
}

#[tokio::test]
async fn health_reports_running_tenants() {
    let dir = TempDir::new().unwrap();
    let (p, _, _) = platform_with_echo_bot(&dir).await;
    let app = router(p.webhook_state());

    assert_eq!(get(&app, "/health").await, "OK - 1 bots running");
    assert_eq!(get(&app, "/").await, "OK - 1 bots running");
}

#[tokio::test]
async fn platform_identity_goes_to_the_conversation_engine() {
    let dir = TempDir::new().unwrap();
    let p = TestPlatform::new(dir.path());
    let app = router(p.webhook_state());

    let (status, _) = post(&app, PLATFORM_ROUTE, message(77, "/start")).await;
    assert_eq!(status, StatusCode::OK);

    let mut welcomed = false;
    for _ in 0..50 {
        if let Some(msg) = p.provider.last_to(77).await {
            welcomed = msg.text.contains("Welcome");
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(welcomed);
    let sent = p.provider.sent_messages().await;
    assert!(sent.iter().all(|(token, _)| token == PLATFORM_TOKEN));
    assert_eq!(p.host.delivery_count(), 0);
}
