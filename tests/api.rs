//! HTTP surface: routing, session middleware and the JSON error envelope.

mod common;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use common::{Harness, ADMIN_PASSWORD};
use koi::api;

async fn send(app: &Router, method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
    let mut req = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        req = req.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    let req = match body {
        Some(body) => req
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => req.body(Body::empty()).unwrap(),
    };

    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

async fn login(app: &Router, name: &str, password: &str) -> String {
    let (status, body) = send(
        app,
        Method::POST,
        "/api/login",
        None,
        Some(json!({ "user_name": name, "password": password })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body["token"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_healthz_is_public() {
    let h = Harness::new().await;
    let app = api::app(h.state.clone());
    let resp = app
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_protected_routes_need_a_token() {
    let h = Harness::new().await;
    let app = api::app(h.state.clone());

    let (status, body) = send(&app, Method::GET, "/api/user", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "not_authenticated");

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/login",
        None,
        Some(json!({ "user_name": "admin", "password": "wrong" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_login_list_and_logout() {
    let h = Harness::new().await;
    let app = api::app(h.state.clone());
    let token = login(&app, "admin", ADMIN_PASSWORD).await;

    let (status, body) = send(&app, Method::GET, "/api/user", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["user_name"], "admin");

    let (status, _) = send(&app, Method::POST, "/api/logout", Some(&token), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(&app, Method::GET, "/api/user", Some(&token), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_role_endpoints_validate_vocabulary() {
    let h = Harness::new().await;
    let app = api::app(h.state.clone());
    let token = login(&app, "admin", ADMIN_PASSWORD).await;

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/userroles/model",
        Some(&token),
        Some(json!({ "role_name": "auditor", "capabilities": ["can_see_model", "fly"] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "invalid_request_error");

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/userroles/model",
        Some(&token),
        Some(json!({ "role_name": "auditor", "capabilities": ["can_see_model"] })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["capabilities"], json!(["can_see_model"]));

    let (status, _) = send(&app, Method::GET, "/api/userroles/galaxy", Some(&token), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_model_access_and_merge_flow() {
    let h = Harness::new().await;
    let app = api::app(h.state.clone());
    let token = login(&app, "admin", ADMIN_PASSWORD).await;

    let (status, model) = send(
        &app,
        Method::POST,
        "/api/model",
        Some(&token),
        Some(json!({ "model_name": "detector" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let model_id = model["id"].as_str().unwrap().to_string();

    // instantiating before finalization is rejected
    let (status, _) = send(
        &app,
        Method::POST,
        &format!("/api/model/{}/instance", model_id),
        Some(&token),
        Some(json!({ "instance_name": "early" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        Method::POST,
        &format!("/api/model/{}/finalize", model_id),
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let mut ids = Vec::new();
    for name in ["target", "source"] {
        let (status, inst) = send(
            &app,
            Method::POST,
            &format!("/api/model/{}/instance", model_id),
            Some(&token),
            Some(json!({ "instance_name": name })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        ids.push(inst["id"].as_str().unwrap().to_string());
    }
    let (target, source) = (&ids[0], &ids[1]);

    let merge_uri = format!("/api/model/{}/instance/{}/merge", model_id, target);
    let (status, body) = send(
        &app,
        Method::POST,
        &merge_uri,
        Some(&token),
        Some(json!({ "sources": [source] })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "forbidden");

    let (status, _) = send(
        &app,
        Method::POST,
        &format!("/api/model/{}/instance/{}/finalize", model_id, target),
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, report) = send(
        &app,
        Method::POST,
        &merge_uri,
        Some(&token),
        Some(json!({ "sources": [source] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["merged"], json!([source]));

    // creator owns the model: one grant, listed through the model
    let (status, grants) = send(
        &app,
        Method::GET,
        &format!("/api/model/{}/access", model_id),
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(grants.as_array().unwrap().len(), 1);

    let (status, caps) = send(
        &app,
        Method::GET,
        &format!("/api/model/{}/capabilities", model_id),
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(caps["capabilities"].as_array().unwrap().len(), 5);
}

#[tokio::test]
async fn test_grant_conflict_over_http() {
    let h = Harness::new().await;
    let bob = h.add_user("bob").await;
    let guest = h.role(koi::models::role::Scope::General, "guest").await;
    let app = api::app(h.state.clone());
    let token = login(&app, "admin", ADMIN_PASSWORD).await;

    let body = json!({ "user_uuid": bob.id, "role_uuid": guest.id });
    let (status, _) = send(&app, Method::POST, "/api/access", Some(&token), Some(body.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, err) = send(&app, Method::POST, "/api/access", Some(&token), Some(body)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(err["error"]["code"], "conflict");
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let h = Harness::new().await;
    let app = api::app(h.state.clone());
    let token = login(&app, "admin", ADMIN_PASSWORD).await;
    let (status, _) = send(&app, Method::GET, "/api/nothing-here", Some(&token), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
