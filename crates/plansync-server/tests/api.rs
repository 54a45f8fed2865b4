use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use plansync_server::{build_router, AppState, ServerConfig};

fn router() -> Router {
    build_router(AppState::new(ServerConfig::default()))
}

async fn call(
    app: &Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

fn record(id: &str, data: &str) -> Value {
    json!({
        "id": id,
        "payload": { "iv": "AAAAAAAAAAAAAAAA", "data": data },
        "updatedAt": 1_700_000_000_000i64,
    })
}

async fn login(app: &Router, room: &str, auth_hash: &str) -> (StatusCode, Value) {
    let (_, init) = call(app, "POST", &format!("/rooms/{room}/init"), None, None).await;
    call(
        app,
        "POST",
        &format!("/rooms/{room}/login"),
        None,
        Some(json!({ "authHash": auth_hash, "salt": init["salt"] })),
    )
    .await
}

#[tokio::test]
async fn test_health() {
    let app = router();
    let (status, body) = call(&app, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["rooms"], 0);
}

#[tokio::test]
async fn test_init_is_stable() {
    let app = router();
    let (status, first) = call(&app, "POST", "/rooms/chem-101/init", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["isNew"], true);
    assert_eq!(first["salt"].as_str().unwrap().len(), 32);

    let (_, second) = call(&app, "POST", "/rooms/chem-101/init", None, None).await;
    assert_eq!(second["isNew"], false);
    assert_eq!(second["salt"], first["salt"]);
}

#[tokio::test]
async fn test_login_claims_then_checks() {
    let app = router();
    let right = "ab".repeat(32);
    let wrong = "cd".repeat(32);

    let (status, body) = login(&app, "room", &right).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["token"].as_str().is_some());

    let (status, _) = login(&app, "room", &right).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = login(&app, "room", &wrong).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_login_unknown_room() {
    let app = router();
    let (status, _) = call(
        &app,
        "POST",
        "/rooms/ghost/login",
        None,
        Some(json!({ "authHash": "ab", "salt": "00" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_events_require_token() {
    let app = router();
    login(&app, "room", &"ab".repeat(32)).await;

    let (status, _) = call(&app, "GET", "/rooms/room/events", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = call(&app, "GET", "/rooms/room/events", Some("forged"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_record_lifecycle() {
    let app = router();
    let (_, body) = login(&app, "room", &"ab".repeat(32)).await;
    let token = body["token"].as_str().unwrap().to_string();
    let token = Some(token.as_str());

    let (status, _) = call(&app, "PUT", "/rooms/room/events/t1", token, Some(record("t1", "one"))).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(
        &app,
        "POST",
        "/rooms/room/events/bulk",
        token,
        Some(json!([record("t2", "two"), record("t1", "uno")])),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["saved"], 2);

    let (_, events) = call(&app, "GET", "/rooms/room/events", token, None).await;
    let events = events.as_array().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["id"], "t1");
    assert_eq!(events[0]["payload"]["data"], "uno");

    let (status, body) = call(&app, "DELETE", "/rooms/room/events/t1", token, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], true);

    let (status, body) = call(&app, "DELETE", "/rooms/room/events/t1", token, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], false);
}

#[tokio::test]
async fn test_path_and_body_ids_must_agree() {
    let app = router();
    let (_, body) = login(&app, "room", &"ab".repeat(32)).await;
    let token = body["token"].as_str().unwrap().to_string();

    let (status, _) = call(
        &app,
        "PUT",
        "/rooms/room/events/t1",
        Some(&token),
        Some(record("t2", "x")),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_rate_limit_by_forwarded_ip() {
    let config = ServerConfig {
        rate_limit_per_sec: 0.001,
        rate_limit_burst: 2.0,
        ..ServerConfig::default()
    };
    let app = build_router(AppState::new(config));

    let request = |ip: &str| {
        Request::builder()
            .uri("/health")
            .header("x-forwarded-for", ip)
            .body(Body::empty())
            .unwrap()
    };

    for _ in 0..2 {
        let response = app.clone().oneshot(request("203.0.113.9")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = app.clone().oneshot(request("203.0.113.9")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    let response = app.clone().oneshot(request("203.0.113.10")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
