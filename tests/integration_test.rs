// Integration tests for the transport API harness
//
// These tests run the credential manager, resource client and cleanup
// tracker together against a mock HTTP server.

use mockito::Matcher;
use reqwest::Method;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use transport_api_harness::{
    auth::{CredentialManager, CredentialSource, HttpLoginExchange, SqliteTokenStore},
    client::ApiClient,
    error::ClientError,
    session::TestSession,
    tracker::{CleanupOutcome, ResourceId, ResourceTracker},
};

// ==================================================================================================
// Test Helpers
// ==================================================================================================

/// Credential manager holding a single external token
fn static_credentials(token: &str) -> Arc<CredentialManager> {
    Arc::new(CredentialManager::builder().external_token(token).build())
}

/// Login exchange pointed at the mock server's /auth/login
fn login_exchange(server: &mockito::Server) -> Arc<HttpLoginExchange> {
    Arc::new(
        HttpLoginExchange::new(format!("{}/auth/login", server.url()), Duration::from_secs(5))
            .expect("Failed to create login exchange"),
    )
}

fn api_client(server: &mockito::Server, credentials: Arc<CredentialManager>) -> ApiClient {
    ApiClient::new(credentials, server.url(), 5).expect("Failed to create API client")
}

// ==================================================================================================
// Login Exchange Tests
// ==================================================================================================

#[tokio::test]
async fn test_login_credential_is_persisted_and_reused() {
    let mut server = mockito::Server::new_async().await;
    let login = server
        .mock("POST", "/auth/login")
        .match_body(Matcher::Json(json!({
            "username": "tester",
            "password": "secret"
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token": "login-token-abc", "expires_in": 3600}"#)
        .expect(1)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("tokens.sqlite3");

    let first = CredentialManager::builder()
        .token_store(Arc::new(SqliteTokenStore::new(store_path.clone())))
        .login(login_exchange(&server), "tester", "secret")
        .build();

    let credential = first.get_valid_credential().await.unwrap();
    assert_eq!(credential.value(), "login-token-abc");
    assert_eq!(credential.source(), CredentialSource::LoginResponse);

    // A later run picks the token up from the store without logging in again
    let second = CredentialManager::builder()
        .token_store(Arc::new(SqliteTokenStore::new(store_path)))
        .login(login_exchange(&server), "tester", "secret")
        .build();

    let credential = second.get_valid_credential().await.unwrap();
    assert_eq!(credential.value(), "login-token-abc");
    assert_eq!(credential.source(), CredentialSource::PersistedFile);

    login.assert_async().await;
}

#[tokio::test]
async fn test_rejected_login_falls_back_to_default_token() {
    let mut server = mockito::Server::new_async().await;
    let _login = server
        .mock("POST", "/auth/login")
        .with_status(401)
        .with_body("invalid credentials")
        .create_async()
        .await;

    let credentials = CredentialManager::builder()
        .login(login_exchange(&server), "tester", "wrong")
        .fallback_token("fallback-token")
        .build();

    let credential = credentials.get_valid_credential().await.unwrap();
    assert_eq!(credential.source(), CredentialSource::FallbackDefault);
    assert_eq!(credential.value(), "fallback-token");
}

#[tokio::test]
async fn test_out_of_range_login_expiry_falls_back_to_default_token() {
    let mut server = mockito::Server::new_async().await;
    let _login = server
        .mock("POST", "/auth/login")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token": "tok", "expires_in": 9000000000000000}"#)
        .create_async()
        .await;

    let credentials = CredentialManager::builder()
        .login(login_exchange(&server), "tester", "secret")
        .fallback_token("fallback-token")
        .build();

    let credential = credentials.get_valid_credential().await.unwrap();
    assert_eq!(credential.source(), CredentialSource::FallbackDefault);
    assert_eq!(credential.value(), "fallback-token");
}

#[tokio::test]
async fn test_all_sources_failing_reports_each_attempt() {
    let mut server = mockito::Server::new_async().await;
    let _login = server
        .mock("POST", "/auth/login")
        .with_status(500)
        .with_body("boom")
        .create_async()
        .await;

    let credentials = CredentialManager::builder()
        .login(login_exchange(&server), "tester", "secret")
        .build();

    let err = credentials.get_valid_credential().await.unwrap_err();
    assert_eq!(err.attempts.len(), 4);

    let message = err.to_string();
    assert!(message.contains("environment (not configured)"));
    assert!(message.contains("login exchange (login rejected by server (500): boom)"));
    assert!(credentials.current().await.is_none());
}

// ==================================================================================================
// Resource Client Tests
// ==================================================================================================

#[tokio::test]
async fn test_requests_carry_standard_headers() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/categories/12")
        .match_header("authorization", "Bearer test-access-token")
        .match_header("content-type", "application/json")
        .match_header("accept", "application/json")
        .match_header(
            "user-agent",
            Matcher::Regex("^transport-api-harness/".to_string()),
        )
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"id": 12, "name": "Flooding"}"#)
        .create_async()
        .await;

    let client = api_client(&server, static_credentials("test-access-token"));
    let body = client
        .fetch("category", &ResourceId::from(12))
        .await
        .unwrap();

    assert_eq!(body["name"], "Flooding");
    mock.assert_async().await;
}

#[tokio::test]
async fn test_unauthorized_response_refreshes_and_retries_once() {
    let mut server = mockito::Server::new_async().await;
    let stale = server
        .mock("GET", "/incidents/3")
        .match_header("authorization", "Bearer stale-token")
        .with_status(401)
        .expect(1)
        .create_async()
        .await;
    let fresh = server
        .mock("GET", "/incidents/3")
        .match_header("authorization", "Bearer fresh-token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"id": 3}"#)
        .expect(1)
        .create_async()
        .await;
    let login = server
        .mock("POST", "/auth/login")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token": "fresh-token", "expires_in": 3600}"#)
        .expect(1)
        .create_async()
        .await;

    let credentials = Arc::new(
        CredentialManager::builder()
            .external_token("stale-token")
            .login(login_exchange(&server), "tester", "secret")
            .build(),
    );
    let client = api_client(&server, Arc::clone(&credentials));

    let body = client.fetch("incident", &ResourceId::from(3)).await.unwrap();
    assert_eq!(body["id"], 3);

    let current = credentials.current().await.unwrap();
    assert_eq!(current.source(), CredentialSource::LoginResponse);

    stale.assert_async().await;
    fresh.assert_async().await;
    login.assert_async().await;
}

#[tokio::test]
async fn test_concurrent_unauthorized_requests_keep_replacement() {
    let mut server = mockito::Server::new_async().await;
    let _stale = server
        .mock("GET", Matcher::Regex(r"^/incidents/\d+$".to_string()))
        .match_header("authorization", "Bearer stale-token")
        .with_status(401)
        .create_async()
        .await;
    let _fresh = server
        .mock("GET", Matcher::Regex(r"^/incidents/\d+$".to_string()))
        .match_header("authorization", "Bearer fallback-token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"ok": true}"#)
        .create_async()
        .await;

    let credentials = Arc::new(
        CredentialManager::builder()
            .external_token("stale-token")
            .fallback_token("fallback-token")
            .build(),
    );
    let client = api_client(&server, Arc::clone(&credentials));

    let id1 = ResourceId::from(1);
    let id2 = ResourceId::from(2);
    let (first, second) = tokio::join!(
        client.fetch("incident", &id1),
        client.fetch("incident", &id2),
    );
    assert!(first.is_ok());
    assert!(second.is_ok());

    // Both 401s were for the stale token; the replacement stays usable
    let current = credentials.get_valid_credential().await.unwrap();
    assert_eq!(current.value(), "fallback-token");
}

#[tokio::test]
async fn test_explicit_authorization_override_is_not_retried() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/incidents/3")
        .match_header("authorization", "Bearer BROKEN")
        .with_status(401)
        .expect(1)
        .create_async()
        .await;

    let credentials = static_credentials("test-access-token");
    let client = api_client(&server, Arc::clone(&credentials));

    let url = client.resource_url("incident", &ResourceId::from(3));
    let extra = [("Authorization".to_string(), "Bearer BROKEN".to_string())];
    let response = client
        .execute(Method::GET, &url, None, &extra)
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 401);
    // The managed credential was never at fault
    let current = credentials.current().await.unwrap();
    assert_eq!(current.value(), "test-access-token");
    mock.assert_async().await;
}

#[tokio::test]
async fn test_create_reads_nested_identifier() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/stations")
        .match_body(Matcher::Json(json!({"name": "Central"})))
        .with_status(201)
        .with_header("content-type", "application/json")
        .with_body(r#"{"data": {"id": "st-42"}}"#)
        .create_async()
        .await;

    let client = api_client(&server, static_credentials("test-access-token"));
    let id = client
        .create("station", &json!({"name": "Central"}))
        .await
        .unwrap();

    assert_eq!(id, ResourceId::from("st-42"));
}

#[tokio::test]
async fn test_create_without_identifier_is_an_error() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/keywords")
        .with_status(201)
        .with_header("content-type", "application/json")
        .with_body(r#"{"ok": true}"#)
        .create_async()
        .await;

    let client = api_client(&server, static_credentials("test-access-token"));
    let err = client
        .create("keyword", &json!({"word": "delay"}))
        .await
        .unwrap_err();

    assert!(matches!(err, ClientError::MissingId(_)));
}

#[tokio::test]
async fn test_server_error_surfaces_status_and_body() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("DELETE", "/routes/9")
        .with_status(500)
        .with_body("database unavailable")
        .create_async()
        .await;

    let client = api_client(&server, static_credentials("test-access-token"));
    let err = client
        .delete("route", &ResourceId::from(9))
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "API error: 500 - database unavailable");
}

// ==================================================================================================
// Cleanup Tests
// ==================================================================================================

#[tokio::test]
async fn test_keyword_already_deleted_is_reported_not_found() {
    let mut server = mockito::Server::new_async().await;
    let _create = server
        .mock("POST", "/keywords")
        .with_status(201)
        .with_header("content-type", "application/json")
        .with_body(r#"{"id": 7}"#)
        .create_async()
        .await;
    let delete = server
        .mock("DELETE", "/keywords/7")
        .with_status(404)
        .expect(1)
        .create_async()
        .await;

    let client = api_client(&server, static_credentials("test-access-token"));
    let mut tracker = ResourceTracker::new();

    let id = client
        .create("keyword", &json!({"word": "detour"}))
        .await
        .unwrap();
    tracker.register("keyword", id).unwrap();

    let outcomes = tracker.flush(&client).await;

    assert_eq!(
        outcomes,
        vec![CleanupOutcome::failure("keyword", 7, "not found")]
    );
    assert_eq!(tracker.pending_count(), 0);
    delete.assert_async().await;
}

#[tokio::test]
async fn test_flush_continues_after_failed_deletion() {
    let mut server = mockito::Server::new_async().await;
    let first = server
        .mock("DELETE", "/categories/1")
        .with_status(204)
        .create_async()
        .await;
    let second = server
        .mock("DELETE", "/categories/2")
        .with_status(500)
        .with_body("constraint violation")
        .create_async()
        .await;
    let third = server
        .mock("DELETE", "/categories/3")
        .with_status(204)
        .create_async()
        .await;

    let client = api_client(&server, static_credentials("test-access-token"));
    let mut tracker = ResourceTracker::new();
    for id in 1..=3 {
        tracker.register("category", id).unwrap();
    }

    let outcomes = tracker.flush(&client).await;

    assert_eq!(
        outcomes,
        vec![
            CleanupOutcome::success("category", 1),
            CleanupOutcome::failure("category", 2, "API error: 500 - constraint violation"),
            CleanupOutcome::success("category", 3),
        ]
    );
    assert_eq!(tracker.pending_count(), 0);

    first.assert_async().await;
    second.assert_async().await;
    third.assert_async().await;
}

#[tokio::test]
async fn test_session_teardown_deletes_created_resources() {
    let mut server = mockito::Server::new_async().await;
    let _create_route = server
        .mock("POST", "/routes")
        .with_status(201)
        .with_header("content-type", "application/json")
        .with_body(r#"{"id": 31}"#)
        .create_async()
        .await;
    let _create_scenario = server
        .mock("POST", "/response-scenarios")
        .with_status(201)
        .with_header("content-type", "application/json")
        .with_body(r#"{"id": 5}"#)
        .create_async()
        .await;
    let delete_route = server
        .mock("DELETE", "/routes/31")
        .with_status(204)
        .expect(1)
        .create_async()
        .await;
    let delete_scenario = server
        .mock("DELETE", "/response-scenarios/5")
        .with_status(204)
        .expect(1)
        .create_async()
        .await;

    let client = Arc::new(api_client(&server, static_credentials("test-access-token")));
    let mut session = TestSession::new(client);

    session.create("route", &json!({"name": "42A"})).await.unwrap();
    session
        .create("response_scenario", &json!({"name": "Derailment"}))
        .await
        .unwrap();
    assert_eq!(session.tracker().pending_count(), 2);

    let outcomes = session.teardown().await;

    assert_eq!(
        outcomes,
        vec![
            CleanupOutcome::success("route", 31),
            CleanupOutcome::success("response_scenario", 5),
        ]
    );
    delete_route.assert_async().await;
    delete_scenario.assert_async().await;
}

#[tokio::test]
async fn test_flush_without_credential_records_auth_failure() {
    let server = mockito::Server::new_async().await;

    let credentials = Arc::new(CredentialManager::builder().build());
    let client = api_client(&server, credentials);
    let mut tracker = ResourceTracker::new();
    tracker.register("keyword", 1).unwrap();

    let outcomes = tracker.flush(&client).await;

    assert_eq!(outcomes.len(), 1);
    assert!(!outcomes[0].succeeded);
    assert!(outcomes[0]
        .error
        .as_deref()
        .unwrap()
        .starts_with("authentication failed: no credential available"));
}
