//! HTTP surface exercised through the router without a listener.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tempfile::TempDir;
use time::OffsetDateTime;
use tower::ServiceExt;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use waav_session::core::tools::{ApprovalPolicy, HttpToolConfig};
use waav_session::routes::create_app;
use waav_session::state::ActiveSession;
use waav_session::transcript::{EntryType, TranscriptEntry};
use waav_session::{
    AppState, ServerConfig, SessionConfig, SessionError, SessionStateMachine, TurnDetectionPolicy,
    spawn_session,
};

fn test_config(transcript_dir: Option<&TempDir>) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        openai_api_key: Some("sk-test".to_string()),
        realtime_model: "gpt-realtime".to_string(),
        realtime_voice: "marin".to_string(),
        realtime_instructions: None,
        transcription_model: None,
        turn_detection: TurnDetectionPolicy::default(),
        tool_timeout_seconds: 30,
        cancel_ack_timeout_ms: 2000,
        history_max_tokens: 32_000,
        history_retain_ratio: 0.75,
        approval_policy: ApprovalPolicy::AutoApprove,
        auto_response: true,
        transcript_dir: transcript_dir.map(|d| d.path().join("transcripts")),
        cors_allowed_origins: None,
        tools: Vec::new(),
    }
}

fn webhook_tool(server: &MockServer, name: &str, dangerous: bool) -> HttpToolConfig {
    HttpToolConfig {
        name: name.to_string(),
        description: format!("{name} webhook"),
        parameters: Some(json!({
            "type": "object",
            "properties": { "order_id": { "type": "string" } }
        })),
        url: format!("{}/{name}", server.uri()),
        timeout_seconds: None,
        dangerous,
        headers: HashMap::new(),
    }
}

async fn send(state: &Arc<AppState>, method: &str, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    dispatch(state, request).await
}

async fn send_json(state: &Arc<AppState>, uri: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    dispatch(state, request).await
}

async fn dispatch(state: &Arc<AppState>, request: Request<Body>) -> (StatusCode, Value) {
    let response = create_app(state.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

#[tokio::test]
async fn test_health_check() {
    let state = AppState::new(test_config(None)).unwrap();
    let (status, body) = send(&state, "GET", "/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "OK");
}

#[tokio::test]
async fn test_sessions_unavailable_without_persistence() {
    let state = AppState::new(test_config(None)).unwrap();
    for uri in ["/sessions", "/sessions/stats", "/sessions/sess_1"] {
        let (status, body) = send(&state, "GET", uri).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
        assert!(body["error"].as_str().unwrap().contains("disabled"));
    }
}

#[tokio::test]
async fn test_list_and_get_stored_session() {
    let dir = TempDir::new().unwrap();
    let state = AppState::new(test_config(Some(&dir))).unwrap();
    let repo = state.transcripts.clone().unwrap();
    repo.create_session("sess_1").unwrap();
    repo.create_session("sess_2").unwrap();
    for text in ["first", "second", "third"] {
        repo.add_entry(&TranscriptEntry::new("sess_1", EntryType::User).with_text(text))
            .unwrap();
    }

    let (status, body) = send(&state, "GET", "/sessions").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 2);
    assert_eq!(body["sessions"][0]["id"], "sess_2");

    let (status, body) = send(&state, "GET", "/sessions?limit=1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);

    let (status, body) = send(&state, "GET", "/sessions/sess_1?limit=2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["session"]["message_count"], 3);
    assert_eq!(body["transcript"].as_array().unwrap().len(), 2);
    assert_eq!(body["transcript"][1]["text"], "third");
    assert!(body.get("live").is_none());
}

#[tokio::test]
async fn test_unknown_session_and_bad_status_filter() {
    let dir = TempDir::new().unwrap();
    let state = AppState::new(test_config(Some(&dir))).unwrap();

    let (status, _) = send(&state, "GET", "/sessions/missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(&state, "GET", "/sessions?status=sleeping").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("sleeping"));

    let (status, _) = send(&state, "GET", "/sessions/..%2Fetc").await;
    assert!(status.is_client_error());
}

#[tokio::test]
async fn test_end_stored_session_twice() {
    let dir = TempDir::new().unwrap();
    let state = AppState::new(test_config(Some(&dir))).unwrap();
    state
        .transcripts
        .as_ref()
        .unwrap()
        .create_session("sess_end")
        .unwrap();

    let (status, body) = send(&state, "POST", "/sessions/sess_end/end").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["end_reason"], "user_ended");

    let (status, body) = send(&state, "POST", "/sessions/sess_end/end").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("already ended"));

    let (status, _) = send(&state, "POST", "/sessions/nobody/end").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_live_session_is_reported_and_closed() {
    let dir = TempDir::new().unwrap();
    let state = AppState::new(test_config(Some(&dir))).unwrap();
    state
        .transcripts
        .as_ref()
        .unwrap()
        .create_session("sess_live")
        .unwrap();

    let machine = SessionStateMachine::new("sess_live", SessionConfig::default());
    let (handle, _outputs, _task) = spawn_session(machine);
    state.sessions.insert(
        "sess_live".to_string(),
        ActiveSession {
            handle: handle.clone(),
            started_at: OffsetDateTime::now_utc(),
        },
    );

    let (status, body) = send(&state, "GET", "/sessions/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["active_sessions"], 1);
    assert_eq!(body["total_sessions"], 1);

    let (status, body) = send(&state, "GET", "/sessions/sess_live").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["live"]["state"], "idle");
    assert_eq!(body["live"]["closed"], false);

    let (status, body) = send(&state, "POST", "/sessions/sess_live/end").await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "closing");
    match handle.snapshot().await {
        Ok(snapshot) => assert!(snapshot.closed),
        Err(e) => assert_eq!(e, SessionError::SessionClosed),
    }
}

#[tokio::test]
async fn test_session_socket_requires_upgrade() {
    let state = AppState::new(test_config(None)).unwrap();
    let (status, _) = send(&state, "GET", "/session").await;
    assert!(status.is_client_error());
}

#[tokio::test]
async fn test_list_tools() {
    let server = MockServer::start().await;
    let mut config = test_config(None);
    config.tools = vec![
        webhook_tool(&server, "lookup_order", false),
        webhook_tool(&server, "refund_order", true),
    ];
    let state = AppState::new(config).unwrap();

    let (status, body) = send(&state, "GET", "/tools").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 2);
    assert_eq!(body["tools"][0]["name"], "lookup_order");
    assert_eq!(body["tools"][1]["name"], "refund_order");
    assert_eq!(
        body["tools"][0]["parameters"]["properties"]["order_id"]["type"],
        "string"
    );
}

#[tokio::test]
async fn test_list_tools_empty() {
    let state = AppState::new(test_config(None)).unwrap();
    let (status, body) = send(&state, "GET", "/tools").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 0);
    assert_eq!(body["tools"], json!([]));
}

#[tokio::test]
async fn test_execute_tool_posts_arguments() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/lookup_order"))
        .and(body_json(json!({"order_id": "A-17"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "shipped"})))
        .expect(1)
        .mount(&server)
        .await;
    let mut config = test_config(None);
    config.tools = vec![webhook_tool(&server, "lookup_order", false)];
    let state = AppState::new(config).unwrap();

    let (status, body) =
        send_json(&state, "/execute/lookup_order", json!({"order_id": "A-17"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["output"]["status"], "shipped");
}

#[tokio::test]
async fn test_execute_unknown_tool() {
    let state = AppState::new(test_config(None)).unwrap();
    let (status, body) = send_json(&state, "/execute/missing", json!({})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("missing"));
}

#[tokio::test]
async fn test_execute_tool_failure_and_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/lookup_order"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/slow_order"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;
    let mut config = test_config(None);
    config.tool_timeout_seconds = 1;
    config.tools = vec![
        webhook_tool(&server, "lookup_order", false),
        webhook_tool(&server, "slow_order", false),
    ];
    let state = AppState::new(config).unwrap();

    let (status, body) = send_json(&state, "/execute/lookup_order", json!({})).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"], "execution_failed");
    assert!(body["message"].as_str().unwrap().contains("500"));

    let (status, body) = send_json(&state, "/execute/slow_order", json!({})).await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body["error"], "timeout");
    assert_eq!(body["timeout_ms"], 1000);
}

#[tokio::test]
async fn test_execute_dangerous_tool_refused_when_safe_only() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/refund_order"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    let mut config = test_config(None);
    config.approval_policy = ApprovalPolicy::SafeOnly;
    config.tools = vec![webhook_tool(&server, "refund_order", true)];
    let state = AppState::new(config).unwrap();

    let (status, body) = send_json(&state, "/execute/refund_order", json!({})).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "denied");
    assert_eq!(body["name"], "refund_order");
}
