use std::sync::Arc;
use std::time::Duration;

use meridian::gateway::{
    Attribution, ChatAdapter, CompletionBackend, CompletionGateway, CompletionOptions,
    CompletionRequest, GatewayConfig, NoopUsageSink, ProviderError, ProviderGateway, ProviderRoute,
};
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn route(server: &MockServer, name: &str) -> ProviderRoute {
    ProviderRoute::new(name, server.uri(), "UNUSED", "test-model")
}

fn request() -> CompletionRequest {
    CompletionRequest::new("size this market", Attribution::new("test"))
        .system("you are an analyst")
        .options(CompletionOptions {
            timeout: Duration::from_secs(5),
            ..CompletionOptions::default()
        })
}

#[tokio::test]
async fn adapter_parses_content_and_usage() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": "a $4 billion market" } }],
            "usage": { "prompt_tokens": 11, "completion_tokens": 6 }
        })))
        .mount(&server)
        .await;

    let adapter = ChatAdapter::with_key(route(&server, "fast"), "sk-test").unwrap();
    let completion = adapter.complete(&request()).await.unwrap();

    assert_eq!(completion.text, "a $4 billion market");
    assert_eq!(completion.input_tokens, 11);
    assert_eq!(completion.output_tokens, 6);
}

#[tokio::test]
async fn adapter_maps_429_to_rate_limited_with_retry_after() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "7")
                .set_body_json(json!({ "error": { "message": "slow down" } })),
        )
        .mount(&server)
        .await;

    let adapter = ChatAdapter::with_key(route(&server, "fast"), "sk-test").unwrap();
    let err = adapter.complete(&request()).await.unwrap_err();

    match err {
        ProviderError::RateLimited { retry_after, .. } => {
            assert_eq!(retry_after, Duration::from_secs(7));
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }
}

#[tokio::test]
async fn adapter_rejects_empty_completion_content() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": "   " } }]
        })))
        .mount(&server)
        .await;

    let adapter = ChatAdapter::with_key(route(&server, "fast"), "sk-test").unwrap();
    let err = adapter.complete(&request()).await.unwrap_err();
    assert!(matches!(err, ProviderError::InvalidResponse { .. }));
}

#[tokio::test]
async fn adapter_surfaces_api_error_with_http_context() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(500)
                .insert_header("x-request-id", "req-123")
                .set_body_json(json!({ "error": { "message": "backend exploded", "code": "upstream" } })),
        )
        .mount(&server)
        .await;

    let adapter = ChatAdapter::with_key(route(&server, "fast"), "sk-test").unwrap();
    let err = adapter.complete(&request()).await.unwrap_err();

    match err {
        ProviderError::Provider {
            provider,
            message,
            context,
        } => {
            assert_eq!(provider, "fast");
            assert!(message.contains("backend exploded"));
            let context = context.expect("error context");
            assert_eq!(context.http_status, Some(500));
            assert_eq!(context.request_id.as_deref(), Some("req-123"));
        }
        other => panic!("expected Provider, got {other:?}"),
    }
}

#[tokio::test]
async fn gateway_falls_back_across_real_http_backends() {
    // First backend always 500s, second serves the completion.
    let broken = MockServer::start().await;
    let healthy = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({
            "error": { "message": "down for maintenance" }
        })))
        .mount(&broken)
        .await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": "growing 12% annually" } }],
            "usage": { "prompt_tokens": 4, "completion_tokens": 5 }
        })))
        .mount(&healthy)
        .await;

    let backends: Vec<Arc<dyn CompletionBackend>> = vec![
        Arc::new(ChatAdapter::with_key(route(&broken, "primary"), "sk").unwrap()),
        Arc::new(ChatAdapter::with_key(route(&healthy, "backup"), "sk").unwrap()),
    ];
    let gateway = ProviderGateway::with_backends(
        backends,
        Arc::new(NoopUsageSink),
        GatewayConfig {
            retry_base_delay: Duration::from_millis(0),
            retry_max_delay: Duration::from_millis(0),
            ..GatewayConfig::default()
        },
    );

    let outcome = gateway
        .complete_with_fallback(&request(), &["primary".into(), "backup".into()])
        .await
        .unwrap();

    assert_eq!(outcome.provider, "backup");
    assert_eq!(outcome.completion.text, "growing 12% annually");

    let primary = gateway.counters().snapshot("primary").unwrap();
    assert_eq!(primary.failures, 1);
    let backup = gateway.counters().snapshot("backup").unwrap();
    assert_eq!(backup.successes, 1);
}
