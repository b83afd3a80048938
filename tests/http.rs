#![cfg(feature = "pg-tests")]

mod common;

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use moto_club_hub::{auth::AuthKeys, email::Mailer, storage::StorageSettings, DbPool};
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};
use tower::ServiceExt;

fn router(pool: DbPool) -> Router {
    let keys = AuthKeys::from_secret(
        "c2VjcmV0LWZvci10ZXN0cw==",
        Duration::from_secs(15 * 60),
        Duration::from_secs(24 * 60 * 60),
        Duration::from_secs(24 * 60 * 60),
    )
    .unwrap();
    let storage = StorageSettings::Local {
        root: std::env::temp_dir().to_string_lossy().into_owned(),
    };
    moto_club_hub::app(pool, Arc::new(keys), Mailer::disabled("http://localhost:3000"), &storage)
}

async fn call(app: &Router, method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let body = match body {
        Some(body) => {
            request = request.header(header::CONTENT_TYPE, "application/json");
            Body::from(body.to_string())
        }
        None => Body::empty(),
    };
    let response = app.clone().oneshot(request.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn register(app: &Router, name: &str) -> String {
    let username = common::unique(name);
    let (status, body) = call(
        app,
        Method::POST,
        "/api/auth/register",
        None,
        Some(json!({
            "username": username,
            "email": format!("{username}@example.com"),
            "password": "correct horse",
            "first_name": name,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    body["access_token"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn register_then_read_me() {
    let Some(pool) = common::pool().await else { return };
    let app = router(pool);

    let token = register(&app, "Rae").await;
    let (status, me) = call(&app, Method::GET, "/api/auth/me", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(me["first_name"], "Rae");
    assert!(me.get("password_hash").is_none());

    let (status, _) = call(&app, Method::GET, "/api/auth/me", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn bad_credentials_are_rejected() {
    let Some(pool) = common::pool().await else { return };
    let app = router(pool);

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/auth/login",
        None,
        Some(json!({ "login": common::unique("ghost"), "password": "nope nope" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "invalid_credentials");
}

#[tokio::test]
async fn club_lifecycle_over_http() {
    let Some(pool) = common::pool().await else { return };
    let app = router(pool);

    let name = common::unique("Http Riders ");
    let (status, _) = call(&app, Method::POST, "/api/clubs", None, Some(json!({ "name": name }))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let founder = register(&app, "Fox").await;
    let (status, founded) = call(&app, Method::POST, "/api/clubs", Some(&founder), Some(json!({ "name": name }))).await;
    assert_eq!(status, StatusCode::CREATED, "{founded}");
    assert_eq!(founded["total_chapters"], 1);
    assert_eq!(founded["default_chapter"]["name"], "Main Chapter");
    let club_id = founded["id"].as_i64().unwrap();

    let (status, body) = call(&app, Method::POST, "/api/clubs", Some(&founder), Some(json!({ "name": name.to_lowercase() }))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "duplicate_club_name");

    let stranger = register(&app, "Sly").await;
    let uri = format!("/api/clubs/{club_id}");
    let (status, _) = call(&app, Method::PATCH, &uri, Some(&stranger), Some(json!({ "name": "Taken Over" }))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, queued) = call(
        &app,
        Method::POST,
        "/api/chapters",
        Some(&stranger),
        Some(json!({ "club": club_id, "name": "Stranger Chapter" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED, "{queued}");
    assert_eq!(queued["outcome"], "pending_approval");
    assert_eq!(queued["request"]["status"], "pending");

    let (status, created) = call(
        &app,
        Method::POST,
        "/api/chapters",
        Some(&founder),
        Some(json!({ "club": club_id, "name": "Founder Chapter" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{created}");
    assert_eq!(created["outcome"], "created");
}

#[tokio::test]
async fn unknown_routes_and_ids() {
    let Some(pool) = common::pool().await else { return };
    let app = router(pool);

    let (status, body) = call(&app, Method::GET, "/api/clubs/2147483647", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");
}

#[tokio::test]
async fn claim_codes_stay_with_chapter_admins() {
    let Some(pool) = common::pool().await else { return };
    let app = router(pool);

    let founder = register(&app, "Cato").await;
    let (status, founded) = call(
        &app,
        Method::POST,
        "/api/clubs",
        Some(&founder),
        Some(json!({ "name": common::unique("Claim Keepers ") })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{founded}");
    let chapter_id = founded["default_chapter"]["id"].as_i64().unwrap();

    let (status, created) = call(
        &app,
        Method::POST,
        "/api/members",
        Some(&founder),
        Some(json!({ "chapter": chapter_id, "first_name": "Spare", "generate_claim_code": true })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{created}");
    let first_code = created["claim_code"].as_str().unwrap().to_string();
    let member_id = created["id"].as_i64().unwrap();

    let stranger = register(&app, "Nosy").await;
    let uri = format!("/api/members/{member_id}");
    for token in [None, Some(stranger.as_str()), Some(founder.as_str())] {
        let (status, read) = call(&app, Method::GET, &uri, token, None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(read.get("claim_code").is_none(), "{read}");

        let list_uri = format!("/api/members?chapter={chapter_id}");
        let (status, listed) = call(&app, Method::GET, &list_uri, token, None).await;
        assert_eq!(status, StatusCode::OK);
        let rows = listed.as_array().unwrap();
        assert!(rows.iter().any(|m| m["id"] == member_id));
        assert!(rows.iter().all(|m| m.get("claim_code").is_none()), "{listed}");
    }

    let reissue = format!("/api/members/{member_id}/claim-code");
    let (status, _) = call(&app, Method::POST, &reissue, Some(&stranger), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, reissued) = call(&app, Method::POST, &reissue, Some(&founder), None).await;
    assert_eq!(status, StatusCode::OK, "{reissued}");
    let second_code = reissued["claim_code"].as_str().unwrap().to_string();

    let claim = |code: &str| json!({ "code": code });
    let (status, body) = call(
        &app,
        Method::POST,
        "/api/members/claim-membership",
        Some(&stranger),
        Some(claim(&first_code)),
    )
    .await;
    assert_ne!(status, StatusCode::OK, "{body}");
    let (status, claimed) = call(
        &app,
        Method::POST,
        "/api/members/claim-membership",
        Some(&stranger),
        Some(claim(&second_code)),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{claimed}");
    assert!(claimed.get("claim_code").is_none());
}

#[tokio::test]
async fn foreign_awards_are_filtered_out() {
    let Some(pool) = common::pool().await else { return };
    let app = router(pool);

    let founder = register(&app, "Ayo").await;
    let (status, _) = call(
        &app,
        Method::POST,
        "/api/clubs",
        Some(&founder),
        Some(json!({ "name": common::unique("Badge Holders ") })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let (_, me) = call(&app, Method::GET, "/api/auth/me", Some(&founder), None).await;
    let founder_id = me["id"].as_i64().unwrap();
    let uri = format!("/api/user-achievements?user={founder_id}");

    let (status, own) = call(&app, Method::GET, &uri, Some(&founder), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!own.as_array().unwrap().is_empty(), "{own}");

    let stranger = register(&app, "Peek").await;
    let (status, foreign) = call(&app, Method::GET, &uri, Some(&stranger), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(foreign, json!([]));
}
