//! Integration tests for the LLM inference executor.
//!
//! Each test spins up an Axum stub of an OpenAI-compatible endpoint on a
//! random port and points the executor at it.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, extract::State};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;

use task_orchestrator::error::ExecutorError;
use task_orchestrator::executor::builtin::{LlmConfig, LlmExecutor};
use task_orchestrator::executor::{ExecutionContext, Executor};
use task_orchestrator::task::Action;

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Start the stub on a random port and return its base URL.
async fn start_stub(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    format!("http://127.0.0.1:{port}/v1")
}

fn ask(prompt: &str) -> Action {
    Action::new("ask", "llm_inference").with_param("prompt", prompt)
}

#[tokio::test]
async fn successful_completion_returns_content() {
    timeout(TEST_TIMEOUT, async {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                let auth = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                let prompt = body["messages"][1]["content"].as_str().unwrap_or_default();
                Json(json!({
                    "model": body["model"],
                    "choices": [{
                        "message": { "role": "assistant", "content": format!("echo: {prompt} ({auth})") }
                    }],
                    "usage": { "prompt_tokens": 3, "completion_tokens": 4 }
                }))
            }),
        );
        let base = start_stub(app).await;

        let executor = LlmExecutor::new(
            LlmConfig::default()
                .with_base_url(base)
                .with_api_key("sk-test"),
        );
        let action = ask("hello")
            .with_param("system", "be brief")
            .with_param("model", "stub-model");

        let output = executor
            .execute(&action, &ExecutionContext::detached())
            .await
            .unwrap();

        assert_eq!(output.result["content"], "echo: hello (Bearer sk-test)");
        assert_eq!(output.result["model"], "stub-model");
        assert_eq!(output.result["usage"]["completion_tokens"], 4);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn server_error_is_retryable() {
    timeout(TEST_TIMEOUT, async {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route(
                "/v1/chat/completions",
                post(|State(hits): State<Arc<AtomicUsize>>| async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    (StatusCode::SERVICE_UNAVAILABLE, "overloaded")
                }),
            )
            .with_state(Arc::clone(&hits));
        let base = start_stub(app).await;

        let executor = LlmExecutor::new(LlmConfig::default().with_base_url(base));
        let err = executor
            .execute(&ask("hello"), &ExecutionContext::detached())
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutorError::Unavailable(_)));
        assert!(err.is_retryable());
        // The executor itself never retries; that's the scheduler's job.
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn client_error_is_not_retryable() {
    timeout(TEST_TIMEOUT, async {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|| async { (StatusCode::BAD_REQUEST, "bad model") }),
        );
        let base = start_stub(app).await;

        let executor = LlmExecutor::new(LlmConfig::default().with_base_url(base));
        let err = executor
            .execute(&ask("hello"), &ExecutionContext::detached())
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutorError::Rejected(ref m) if m.contains("bad model")));
        assert!(!err.is_retryable());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn unreachable_endpoint_is_retryable() {
    timeout(TEST_TIMEOUT, async {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let executor = LlmExecutor::new(
            LlmConfig::default().with_base_url(format!("http://127.0.0.1:{port}/v1")),
        );
        let err = executor
            .execute(&ask("hello"), &ExecutionContext::detached())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn empty_choices_fail_the_attempt() {
    timeout(TEST_TIMEOUT, async {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|| async { Json(json!({ "choices": [] })) }),
        );
        let base = start_stub(app).await;

        let executor = LlmExecutor::new(LlmConfig::default().with_base_url(base));
        let err = executor
            .execute(&ask("hello"), &ExecutionContext::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::ExecutionFailed(_)));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn timeout_reports_task_deadline_not_client_default() {
    timeout(TEST_TIMEOUT, async {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Json(json!({ "choices": [] }))
            }),
        );
        let base = start_stub(app).await;

        let executor = LlmExecutor::new(LlmConfig::default().with_base_url(base));
        let ctx = ExecutionContext {
            time_remaining: Some(Duration::from_millis(200)),
            ..ExecutionContext::detached()
        };
        let err = executor.execute(&ask("hello"), &ctx).await.unwrap_err();

        assert_eq!(err, ExecutorError::Timeout(Duration::from_millis(200)));
        assert!(err.is_retryable());
    })
    .await
    .expect("test timed out");
}
