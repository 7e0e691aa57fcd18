use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use waav_session::core::tools::{HttpTool, HttpToolConfig, ToolError, ToolHandler};

fn config(server: &MockServer, route: &str) -> HttpToolConfig {
    HttpToolConfig {
        name: "lookup_order".to_string(),
        description: "Look up an order".to_string(),
        parameters: None,
        url: format!("{}{route}", server.uri()),
        timeout_seconds: None,
        dangerous: false,
        headers: HashMap::new(),
    }
}

fn tool(config: &HttpToolConfig) -> HttpTool {
    HttpTool::from_config(reqwest::Client::new(), config).unwrap()
}

#[tokio::test]
async fn test_posts_arguments_and_returns_json() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/orders"))
        .and(body_json(json!({"order_id": "A-17"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "shipped"})))
        .expect(1)
        .mount(&server)
        .await;

    let output = tool(&config(&server, "/orders"))
        .call(json!({"order_id": "A-17"}), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(output, json!({"status": "shipped"}));
}

#[tokio::test]
async fn test_plain_text_body_becomes_string() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ping"))
        .respond_with(ResponseTemplate::new(200).set_body_string("pong"))
        .mount(&server)
        .await;

    let output = tool(&config(&server, "/ping"))
        .call(json!({}), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(output, json!("pong"));
}

#[tokio::test]
async fn test_configured_headers_are_sent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/secure"))
        .and(header("x-api-key", "secret-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = config(&server, "/secure");
    config
        .headers
        .insert("x-api-key".to_string(), "secret-key".to_string());
    let output = tool(&config)
        .call(json!({}), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(output["ok"], true);

    let rendered = serde_json::to_string(&config).unwrap();
    assert!(!rendered.contains("secret-key"));
}

#[tokio::test]
async fn test_error_status_is_execution_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let err = tool(&config(&server, "/orders"))
        .call(json!({}), CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        ToolError::Execution(message) => {
            assert!(message.contains("503"));
            assert!(message.contains("maintenance"));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn test_request_timeout_is_execution_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;

    let mut config = config(&server, "/slow");
    config.timeout_seconds = Some(1);
    let err = tool(&config)
        .call(json!({}), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ToolError::Execution(_)));
}

#[tokio::test]
async fn test_cancellation_stops_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
        .mount(&server)
        .await;

    let tool = Arc::new(tool(&config(&server, "/slow")));
    let cancel = CancellationToken::new();
    let call = {
        let tool = tool.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { tool.call(json!({}), cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(2), call)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result, Err(ToolError::Cancelled));
}
