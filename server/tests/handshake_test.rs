//! Integration tests for /register, /login and the ticket redemption on /upgrade.

mod common;

use std::time::Duration;

use common::*;
use relay_server::hub::HubSettings;
use serde_json::Value;

#[tokio::test]
async fn test_register_upgrade_then_reuse_is_forbidden() {
    let server = start_test_server().await;

    let resp = server.post_credentials("/register", "gopher123", "pass").await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["username"], "gopher123");
    let user_id = body["userID"].as_str().unwrap().to_string();
    let ticket = body["ticket"].as_str().unwrap().to_string();
    assert!(ticket.len() >= 43);

    let mut ws = server.connect(&user_id, &ticket).await;
    let me = whoami(&mut ws, "1").await;
    assert_eq!(me["id"], user_id.as_str());

    let status = server.upgrade_status(&server.upgrade_url(&user_id, &ticket)).await;
    assert_eq!(status, 403);
}

#[tokio::test]
async fn test_login_issues_working_ticket() {
    let server = start_test_server().await;
    server.register("gopher123", "pass").await;

    let (user_id, ticket) = server.login("gopher123", "pass").await;
    let mut ws = server.connect(&user_id, &ticket).await;
    let me = whoami(&mut ws, "x").await;
    assert_eq!(me["nick"], "gopher123");
}

#[tokio::test]
async fn test_bad_credentials_are_indistinguishable() {
    let server = start_test_server().await;
    server.register("gopher123", "pass").await;

    let wrong_password = server.post_credentials("/login", "gopher123", "Pass").await;
    assert_eq!(wrong_password.status(), 403);
    let wrong_body: Value = wrong_password.json().await.unwrap();

    let unknown_user = server.post_credentials("/login", "nobody", "pass").await;
    assert_eq!(unknown_user.status(), 403);
    let unknown_body: Value = unknown_user.json().await.unwrap();

    assert_eq!(wrong_body, unknown_body);
    assert_eq!(wrong_body["error"], "forbidden");
}

#[tokio::test]
async fn test_duplicate_registration_conflicts() {
    let server = start_test_server().await;
    server.register("gopher123", "pass").await;

    let resp = server.post_credentials("/register", "gopher123", "other").await;
    assert_eq!(resp.status(), 409);
}

#[tokio::test]
async fn test_malformed_bodies_are_bad_requests() {
    let server = start_test_server().await;

    let not_json = server
        .http
        .post(format!("{}/register", server.base_url))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(not_json.status(), 400);

    let missing_field = server
        .http
        .post(format!("{}/login", server.base_url))
        .json(&serde_json::json!({ "username": "gopher123" }))
        .send()
        .await
        .unwrap();
    assert_eq!(missing_field.status(), 400);

    let empty_username = server.post_credentials("/register", "", "pass").await;
    assert_eq!(empty_username.status(), 400);
}

#[tokio::test]
async fn test_upgrade_without_params_is_bad_request() {
    let server = start_test_server().await;

    let bare = format!("ws://{}/upgrade", server.addr);
    assert_eq!(server.upgrade_status(&bare).await, 400);

    let id_only = format!("ws://{}/upgrade?id=someone", server.addr);
    assert_eq!(server.upgrade_status(&id_only).await, 400);
}

#[tokio::test]
async fn test_wrong_or_foreign_ticket_is_forbidden() {
    let server = start_test_server().await;
    let (alice, alice_ticket) = server.register("alice", "pass").await;
    let (bob, _bob_ticket) = server.register("bob", "pass").await;

    // Alice's ticket does not open Bob's session
    let status = server.upgrade_status(&server.upgrade_url(&bob, &alice_ticket)).await;
    assert_eq!(status, 403);

    let status = server.upgrade_status(&server.upgrade_url(&alice, "guess")).await;
    assert_eq!(status, 403);

    // The failed guess consumed Alice's ticket
    let status = server.upgrade_status(&server.upgrade_url(&alice, &alice_ticket)).await;
    assert_eq!(status, 403);
}

#[tokio::test]
async fn test_expired_ticket_is_forbidden() {
    let server = start_with(HubSettings {
        ticket_ttl: Duration::from_millis(100),
        ..test_settings()
    })
    .await;
    let (user_id, ticket) = server.register("gopher123", "pass").await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    let status = server.upgrade_status(&server.upgrade_url(&user_id, &ticket)).await;
    assert_eq!(status, 403);
}

#[tokio::test]
async fn test_rate_limit_on_auth_endpoints() {
    let server = start_with(HubSettings {
        auth_rate_burst: 2,
        auth_rate_period: Duration::from_secs(60),
        ..test_settings()
    })
    .await;

    assert_eq!(server.post_credentials("/login", "a", "b").await.status(), 403);
    assert_eq!(server.post_credentials("/login", "a", "b").await.status(), 403);
    assert_eq!(server.post_credentials("/login", "a", "b").await.status(), 429);

    // Health is not rate limited
    let health = server
        .http
        .get(format!("{}/health", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(health.status(), 200);
    assert_eq!(health.text().await.unwrap(), "ok");
}

#[tokio::test]
async fn test_sqlite_backed_handshake() {
    let server = start_sqlite_server().await;
    let (user_id, ticket) = server.register("gopher123", "pass").await;
    assert_eq!(server.post_credentials("/register", "gopher123", "x").await.status(), 409);

    let mut ws = server.connect(&user_id, &ticket).await;
    let me = whoami(&mut ws, "1").await;
    assert_eq!(me["nick"], "gopher123");

    drop(ws);
    server.shutdown_and_drain().await;
}
