//! Admin and Session History API Tests

use axum::http::StatusCode;
use axum_test::TestServer;
use pretty_assertions::assert_eq;

use chatbox_server::domain::SessionStore;

use crate::common::{body_json, TestApp, TestUser};

#[tokio::test]
async fn test_admin_routes_require_token() {
    let app = TestApp::new().await;

    let response = app.get("/admin/sessions").await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_admin_routes_require_admin_role() {
    let app = TestApp::new().await;
    let user = TestUser::user();

    let response = app.get_auth("/admin/stats", &user.token).await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_list_sessions_newest_first() {
    let app = TestApp::new().await;
    let admin = TestUser::admin();
    let older = app.state.sessions.create_session("u1").unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let newer = app.state.sessions.create_session("u2").unwrap();

    let response = app.get_auth("/admin/sessions", &admin.token).await;

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["total"], 2);
    assert_eq!(json["sessions"][0]["id"], newer.id.as_str());
    assert_eq!(json["sessions"][1]["id"], older.id.as_str());
}

#[tokio::test]
async fn test_takeover_conflict_and_leave() {
    let app = TestApp::new().await;
    let server = TestServer::new(app.router.clone()).unwrap();
    let first = TestUser::admin();
    let second = TestUser::new(&["chat_admin"]);
    let session = app.state.sessions.create_session("u1").unwrap();
    let takeover = format!("/admin/takeover/{}", session.id);

    let response = server
        .post(&takeover)
        .authorization_bearer(&first.token)
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: serde_json::Value = response.json();
    assert_eq!(body["admin_assisted"], true);
    assert_eq!(body["assisting_admin_id"], first.user_id.as_str());

    let response = server
        .post(&takeover)
        .authorization_bearer(&second.token)
        .await;
    assert_eq!(response.status_code(), StatusCode::CONFLICT);

    // Only the assisting admin can leave
    let leave = format!("/admin/sessions/{}/leave", session.id);
    let response = server.post(&leave).authorization_bearer(&second.token).await;
    assert_eq!(response.status_code(), StatusCode::FORBIDDEN);

    let response = server.post(&leave).authorization_bearer(&first.token).await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert!(!app.state.sessions.get(&session.id).unwrap().admin_assisted);

    let response = server
        .post(&takeover)
        .authorization_bearer(&second.token)
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
}

#[tokio::test]
async fn test_takeover_unknown_session() {
    let app = TestApp::new().await;
    let server = TestServer::new(app.router.clone()).unwrap();
    let admin = TestUser::admin();

    let response = server
        .post("/admin/takeover/does-not-exist")
        .authorization_bearer(&admin.token)
        .await;

    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_concurrent_takeover_single_winner() {
    let app = TestApp::new().await;
    let session = app.state.sessions.create_session("u1").unwrap();
    let admins: Vec<TestUser> = (0..8).map(|_| TestUser::admin()).collect();

    let requests = admins.iter().map(|admin| {
        let uri = format!("/admin/takeover/{}", session.id);
        let router = app.router.clone();
        async move {
            tower::ServiceExt::oneshot(
                router,
                axum::http::Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("Authorization", format!("Bearer {}", admin.token))
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap()
            .status()
        }
    });
    let statuses = futures::future::join_all(requests).await;

    assert_eq!(statuses.iter().filter(|s| **s == StatusCode::OK).count(), 1);
    assert_eq!(
        statuses.iter().filter(|s| **s == StatusCode::CONFLICT).count(),
        admins.len() - 1
    );
}

#[tokio::test]
async fn test_admin_rate_limit() {
    let app = TestApp::with_settings(|s| s.rate_limit.admin_limit = 1).await;
    let admin = TestUser::admin();

    assert_eq!(app.get_auth("/admin/stats", &admin.token).await.status(), StatusCode::OK);
    let response = app.get_auth("/admin/stats", &admin.token).await;

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let json = body_json(response).await;
    assert!(json["retry_after"].as_u64().unwrap() >= 1);

    // Limits are per admin
    let other = TestUser::admin();
    assert_eq!(app.get_auth("/admin/stats", &other.token).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_my_sessions_from_store() {
    let app = TestApp::new().await;
    let user = TestUser::user();
    let other = TestUser::user();
    for owner in [&user.user_id, &user.user_id, &other.user_id] {
        let session = app.state.sessions.create_session(owner).unwrap();
        app.state.store.create_session(&session).await.unwrap();
    }

    let response = app.get_auth("/sessions", &user.token).await;

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let sessions = json.as_array().unwrap();
    assert_eq!(sessions.len(), 2);
    assert!(sessions.iter().all(|s| s["user_id"] == user.user_id.as_str()));
}

#[tokio::test]
async fn test_my_sessions_rejects_bad_limit() {
    let app = TestApp::new().await;
    let user = TestUser::user();

    let response = app.get_auth("/sessions?limit=0", &user.token).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
