//! Integration tests for end-to-end proxy flow

use crate::domain::{CacheStatus, LogEvent};
use crate::infrastructure::{InMemoryCounterStore, InMemoryResponseStore};
use crate::proxy::test_utils::test_helpers::*;
use axum::body::{Body, Bytes};
use axum::extract::Request as ExtractRequest;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::IntoResponse;
use axum::Router;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

const SSE_BODY: &str = "data: {\"id\":\"chatcmpl-1\",\"object\":\"chat.completion.chunk\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"\"},\"finish_reason\":null}]}\n\n\
data: {\"id\":\"chatcmpl-1\",\"object\":\"chat.completion.chunk\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hel\"},\"finish_reason\":null}]}\n\n\
data: {\"id\":\"chatcmpl-1\",\"object\":\"chat.completion.chunk\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"},\"finish_reason\":null}]}\n\n\
data: {\"id\":\"chatcmpl-1\",\"object\":\"chat.completion.chunk\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n\
data: [DONE]\n\n";

/// Mock completion API that echoes what it received and counts calls
async fn run_mock_backend() -> (String, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let app = Router::new()
        .route(
            "/v1/completions",
            axum::routing::post(move |headers: HeaderMap, body: String| {
                let counter = counter.clone();
                async move {
                    let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    let received: Vec<String> = headers.keys().map(|k| k.to_string()).collect();
                    axum::Json(json!({
                        "id": format!("cmpl-{call}"),
                        "object": "text_completion",
                        "received_headers": received,
                        "received_body": serde_json::from_str::<Value>(&body).unwrap_or(Value::Null),
                        "choices": [{"index": 0, "text": "ok", "finish_reason": "stop"}],
                        "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
                    }))
                }
            }),
        )
        .route(
            "/v1/chat/completions",
            axum::routing::post(|| async {
                ([("content-type", "text/event-stream")], SSE_BODY).into_response()
            }),
        )
        .route(
            "/v1/chat/completions/trickle",
            axum::routing::post(|| async {
                let pieces = SSE_BODY
                    .as_bytes()
                    .chunks(7)
                    .map(|piece| Ok::<_, std::io::Error>(Bytes::from_static(piece)));
                (
                    [("content-type", "text/event-stream")],
                    Body::from_stream(futures_util::stream::iter(pieces)),
                )
                    .into_response()
            }),
        )
        .route(
            "/slow",
            axum::routing::post(|| async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                "late"
            }),
        )
        .fallback(|request: ExtractRequest| async move {
            (
                StatusCode::NOT_FOUND,
                format!("Not found: {} {}", request.method(), request.uri()),
            )
        });

    (spawn_upstream(app).await, calls)
}

fn completion_body() -> Value {
    json!({"model": "text-davinci-003", "prompt": "Say ok"})
}

#[tokio::test]
async fn test_basic_proxy_flow() {
    let (base, calls) = run_mock_backend().await;
    let proxy = test_proxy(&base);

    let request = json_request(
        "/v1/completions",
        &completion_body(),
        &[("Helicone-Property-Session", "s-1"), ("Helicone-User-Id", "alice")],
    );
    let response = proxy.router.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["helicone-status"], "success");
    let helicone_id = response.headers()["helicone-id"].to_str().unwrap().to_string();
    assert!(response.headers().get("helicone-cache").is_none());

    let body = body_json(response).await;
    assert_eq!(body["received_body"], completion_body());
    let received: Vec<&str> = body["received_headers"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(Value::as_str)
        .collect();
    assert!(received.contains(&"authorization"));
    assert!(!received.iter().any(|name| name.starts_with("helicone-")));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    proxy.settle().await;
    let records = proxy.sink.request_records();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.request.id.as_ref(), helicone_id);
    assert_eq!(record.request.path, "/v1/completions");
    assert_eq!(record.request.properties["session"], "s-1");
    assert_eq!(record.request.user_id.as_ref().unwrap().as_ref(), "alice");
    assert_eq!(record.request.cache, None);
    assert!(!record.request.streamed);
    assert_eq!(record.response.status, 200);
    assert_eq!(record.response.usage.unwrap().total_tokens, Some(4));
    assert!(!record.response.timed_out);
}

#[tokio::test]
async fn test_cache_miss_then_hit() {
    let (base, calls) = run_mock_backend().await;
    let proxy = test_proxy(&base);
    let headers = [("Helicone-Cache-Enabled", "true")];

    let first = proxy
        .router
        .clone()
        .oneshot(json_request("/v1/completions", &completion_body(), &headers))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers()["helicone-cache"], "MISS");
    let first_id = first.headers()["helicone-id"].to_str().unwrap().to_string();
    let first_body = body_text(first).await;
    proxy.settle().await;

    let second = proxy
        .router
        .clone()
        .oneshot(json_request("/v1/completions", &completion_body(), &headers))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(second.headers()["helicone-cache"], "HIT");
    assert_eq!(second.headers()["helicone-cache-bucket-idx"], "0");
    assert_eq!(second.headers()["helicone-id"], first_id.as_str());
    assert_eq!(body_text(second).await, first_body);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    proxy.settle().await;
    let records = proxy.sink.request_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].request.cache, Some(CacheStatus::Miss));
    let hits: Vec<_> = proxy
        .sink
        .events()
        .into_iter()
        .filter(|event| matches!(event, LogEvent::CacheHit { .. }))
        .collect();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].request_id().as_ref(), first_id);
}

#[tokio::test]
async fn test_cache_bucket_fills_before_serving() {
    let (base, calls) = run_mock_backend().await;
    let proxy = test_proxy(&base);
    let headers = [
        ("Helicone-Cache-Enabled", "true"),
        ("Helicone-Cache-Bucket-Max-Size", "2"),
    ];

    for _ in 0..2 {
        let response = proxy
            .router
            .clone()
            .oneshot(json_request("/v1/completions", &completion_body(), &headers))
            .await
            .unwrap();
        assert_eq!(response.headers()["helicone-cache"], "MISS");
        let _ = body_text(response).await;
        proxy.settle().await;
    }

    let response = proxy
        .router
        .clone()
        .oneshot(json_request("/v1/completions", &completion_body(), &headers))
        .await
        .unwrap();
    assert_eq!(response.headers()["helicone-cache"], "HIT");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_rate_limit_rejects_after_quota() {
    let (base, calls) = run_mock_backend().await;
    let proxy = test_proxy(&base);
    let headers = [("Helicone-RateLimit-Policy", "2;w=3600")];

    for remaining in ["1", "0"] {
        let response = proxy
            .router
            .clone()
            .oneshot(json_request("/v1/completions", &completion_body(), &headers))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["helicone-ratelimit-limit"], "2");
        assert_eq!(response.headers()["helicone-ratelimit-remaining"], remaining);
        let _ = body_text(response).await;
        proxy.settle().await;
    }

    let response = proxy
        .router
        .clone()
        .oneshot(json_request("/v1/completions", &completion_body(), &headers))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()["helicone-ratelimit-remaining"], "0");
    assert_eq!(
        response.headers()["helicone-ratelimit-policy"],
        "2;w=3600;u=request"
    );
    let body = body_json(response).await;
    assert_eq!(
        body["message"],
        "Rate limit reached. Please wait before making more requests."
    );
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_rate_limit_is_scoped_per_user() {
    let (base, _calls) = run_mock_backend().await;
    let proxy = test_proxy(&base);

    for user in ["alice", "bob"] {
        let response = proxy
            .router
            .clone()
            .oneshot(json_request(
                "/v1/completions",
                &completion_body(),
                &[("Helicone-RateLimit-Policy", "1;w=3600"), ("Helicone-User-Id", user)],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "{user} has its own counter");
        let _ = body_text(response).await;
        proxy.settle().await;
    }
}

#[tokio::test]
async fn test_invalid_rate_limit_policy_is_rejected() {
    let (base, calls) = run_mock_backend().await;
    let proxy = test_proxy(&base);

    let response = proxy
        .router
        .clone()
        .oneshot(json_request(
            "/v1/completions",
            &completion_body(),
            &[("Helicone-RateLimit-Policy", "many;w=soon")],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_missing_authorization_is_rejected() {
    let (base, calls) = run_mock_backend().await;
    let proxy = test_proxy(&base);

    let request = Request::builder()
        .method("POST")
        .uri("/v1/completions")
        .header("content-type", "application/json")
        .body(Body::from(completion_body().to_string()))
        .unwrap();
    let response = proxy.router.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_text(response).await, "No authorization header found!");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_prompt_template_is_rendered_before_forwarding() {
    let (base, _calls) = run_mock_backend().await;
    let proxy = test_proxy(&base);

    let body = json!({
        "model": "text-davinci-003",
        "prompt": {"prompt": "Write a poem about {{topic}}", "values": {"topic": "rust"}}
    });
    let response = proxy
        .router
        .clone()
        .oneshot(json_request(
            "/v1/completions",
            &body,
            &[("Helicone-Prompt-Format", "true"), ("Helicone-Prompt-Name", "poem")],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let echoed = body_json(response).await;
    assert_eq!(echoed["received_body"]["prompt"], "Write a poem about rust");

    proxy.settle().await;
    let record = &proxy.sink.request_records()[0];
    assert_eq!(record.request.prompts.len(), 1);
    assert_eq!(record.request.prompts[0].prompt.template, "Write a poem about {{topic}}");
    assert_eq!(record.request.prompt_name.as_ref().unwrap().as_ref(), "poem");
    assert_eq!(record.request.body.as_ref().unwrap()["prompt"], "Write a poem about rust");
}

#[tokio::test]
async fn test_prompt_template_missing_values_is_400() {
    let (base, calls) = run_mock_backend().await;
    let proxy = test_proxy(&base);

    let body = json!({
        "model": "text-davinci-003",
        "prompt": {"prompt": "Hello {{name}}, meet {{friend}}", "values": {"name": "Ada"}}
    });
    let response = proxy
        .router
        .clone()
        .oneshot(json_request(
            "/v1/completions",
            &body,
            &[("Helicone-Prompt-Format", "true")],
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_text(response).await, "Missing values in the prompt: friend");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_streamed_response_is_consolidated_in_log() {
    let (base, _calls) = run_mock_backend().await;
    let proxy = test_proxy(&base);

    let body = json!({
        "model": "gpt-3.5-turbo",
        "stream": true,
        "user": "body-user",
        "messages": [{"role": "user", "content": "hello world"}]
    });
    let response = proxy
        .router
        .clone()
        .oneshot(json_request("/v1/chat/completions", &body, &[("User-Id", "header-user")]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, SSE_BODY);

    proxy.settle().await;
    let record = &proxy.sink.request_records()[0];
    assert!(record.request.streamed);
    assert_eq!(record.request.user_id.as_ref().unwrap().as_ref(), "body-user");

    let logged = &record.response.body;
    assert_eq!(logged["choices"][0]["message"]["content"], "Hello");
    assert_eq!(logged["choices"][0]["finish_reason"], "stop");
    assert_eq!(logged["streamed_data"].as_array().unwrap().len(), 5);

    let usage = record.response.usage.unwrap();
    assert!(usage.proxy_calculated);
    assert_eq!(usage.prompt_tokens, Some(2 + 3 + 5));
    assert_eq!(logged["usage"]["helicone_calculated"], true);
}

#[tokio::test]
async fn test_cache_with_stream_is_rejected() {
    let (base, calls) = run_mock_backend().await;
    let proxy = test_proxy(&base);

    let body = json!({"model": "gpt-3.5-turbo", "stream": true, "messages": []});
    let response = proxy
        .router
        .clone()
        .oneshot(json_request(
            "/v1/chat/completions",
            &body,
            &[("Helicone-Cache-Enabled", "true")],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_upstream_error_status_passes_through() {
    let (base, _calls) = run_mock_backend().await;
    let proxy = test_proxy(&base);

    let response = proxy
        .router
        .clone()
        .oneshot(json_request("/v1/missing", &completion_body(), &[]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.headers()["helicone-status"], "success");
    assert_eq!(body_text(response).await, "Not found: POST /v1/missing");

    proxy.settle().await;
    let record = &proxy.sink.request_records()[0];
    assert_eq!(record.response.status, 404);
    assert_eq!(record.response.body["helicone_error"], "error parsing response");
}

#[tokio::test]
async fn test_retry_recovers_from_rate_limited_upstream() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let app = Router::new().route(
        "/v1/completions",
        axum::routing::post(move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    (StatusCode::TOO_MANY_REQUESTS, [("retry-after", "0")], "slow down").into_response()
                } else {
                    axum::Json(json!({"id": "cmpl-retry"})).into_response()
                }
            }
        }),
    );
    let base = spawn_upstream(app).await;
    let proxy = test_proxy(&base);

    let response = proxy
        .router
        .clone()
        .oneshot(json_request(
            "/v1/completions",
            &completion_body(),
            &[("Helicone-Retry-Enabled", "true"), ("Helicone-Retry-Min-Timeout", "1")],
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["id"], "cmpl-retry");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_unreachable_upstream_is_500_and_logged() {
    let proxy = test_proxy("http://127.0.0.1:1");

    let response = proxy
        .router
        .clone()
        .oneshot(json_request("/v1/completions", &completion_body(), &[]))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response.headers()["helicone-error"], "true");
    let body = body_json(response).await;
    assert!(body["helicone-message"]
        .as_str()
        .unwrap()
        .starts_with("Helicone ran into an error servicing your request"));

    proxy.settle().await;
    let records = proxy.sink.request_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].response.status, 500);
}

#[tokio::test]
async fn test_upstream_timeout_is_504() {
    let (base, _calls) = run_mock_backend().await;
    let mut config = test_proxy_config(&base);
    config.request_timeout = Duration::from_millis(200);
    let proxy = test_proxy_with_config(config);

    let response = proxy
        .router
        .clone()
        .oneshot(json_request("/slow", &completion_body(), &[]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
}

#[tokio::test]
async fn test_oversized_body_is_413() {
    let (base, calls) = run_mock_backend().await;
    let proxy = test_proxy(&base);

    let body = json!({"prompt": "x".repeat(100 * 1024)});
    let response = proxy
        .router
        .clone()
        .oneshot(json_request("/v1/completions", &body, &[]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_logging_endpoint_records_properties() {
    let (base, calls) = run_mock_backend().await;
    let proxy = test_proxy(&base);

    let request = Request::builder()
        .method("POST")
        .uri("/v1/log")
        .header("content-type", "application/json")
        .header("Helicone-Property-Conversation", "c-7")
        .body(Body::from(r#"{"helicone-id": "req-123"}"#))
        .unwrap();
    let response = proxy.router.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_text(response).await,
        "Successfully logged properties: conversation"
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    proxy.settle().await;
    match &proxy.sink.events()[..] {
        [LogEvent::Properties {
            request_id,
            properties,
        }] => {
            assert_eq!(request_id.as_ref(), "req-123");
            assert_eq!(properties["conversation"], "c-7");
        }
        other => panic!("unexpected events {other:?}"),
    }
}

#[tokio::test]
async fn test_logging_endpoint_requires_id() {
    let (base, _calls) = run_mock_backend().await;
    let proxy = test_proxy(&base);

    let request = Request::builder()
        .method("POST")
        .uri("/v1/log")
        .header("Helicone-Property-Conversation", "c-7")
        .body(Body::from("{}"))
        .unwrap();
    let response = proxy.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_health_check() {
    let proxy = test_proxy("http://127.0.0.1:1");
    let request = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let response = proxy.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "OK");
}

#[tokio::test]
async fn test_unavailable_response_store_serves_uncached() {
    let (base, calls) = run_mock_backend().await;
    let proxy = test_proxy_with_stores(
        test_proxy_config(&base),
        Arc::new(InMemoryCounterStore::default()),
        Arc::new(UnavailableStore),
    );

    for _ in 0..2 {
        let response = proxy
            .router
            .clone()
            .oneshot(json_request(
                "/v1/completions",
                &completion_body(),
                &[("Helicone-Cache-Enabled", "true")],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["helicone-cache"], "MISS");
        assert_eq!(body_json(response).await["object"], "text_completion");
    }

    proxy.settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(proxy.sink.request_records().len(), 2);
    assert!(!proxy
        .sink
        .events()
        .iter()
        .any(|event| matches!(event, LogEvent::CacheHit { .. })));
}

#[tokio::test]
async fn test_unavailable_counter_store_allows_requests() {
    let (base, calls) = run_mock_backend().await;
    let proxy = test_proxy_with_stores(
        test_proxy_config(&base),
        Arc::new(UnavailableStore),
        Arc::new(InMemoryResponseStore::default()),
    );

    for _ in 0..3 {
        let response = proxy
            .router
            .clone()
            .oneshot(json_request(
                "/v1/completions",
                &completion_body(),
                &[("Helicone-RateLimit-Policy", "1;w=60")],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("helicone-ratelimit-limit").is_none());
    }

    proxy.settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(proxy.sink.request_records().len(), 3);
}

#[tokio::test]
async fn test_increase_timeout_flag_uses_extended_timeout() {
    let (base, _calls) = run_mock_backend().await;
    let mut config = test_proxy_config(&base);
    config.request_timeout = Duration::from_millis(100);
    config.extended_timeout = Duration::from_secs(5);
    let proxy = test_proxy_with_config(config);

    let response = proxy
        .router
        .clone()
        .oneshot(json_request("/slow", &completion_body(), &[]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);

    let response = proxy
        .router
        .clone()
        .oneshot(json_request(
            "/slow",
            &completion_body(),
            &[("Helicone-FF-Increase-Timeout", "true")],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "late");

    proxy.settle().await;
    let statuses: Vec<u16> = proxy
        .sink
        .request_records()
        .iter()
        .map(|record| record.response.status)
        .collect();
    assert_eq!(statuses, vec![504, 200]);
}

#[tokio::test]
async fn test_force_format_coalesces_small_chunks() {
    let (base, _calls) = run_mock_backend().await;
    let proxy = test_proxy(&base);

    let body = json!({
        "model": "gpt-3.5-turbo",
        "stream": true,
        "messages": [{"role": "user", "content": "hello world"}]
    });
    let response = proxy
        .router
        .clone()
        .oneshot(json_request(
            "/v1/chat/completions/trickle",
            &body,
            &[("Helicone-FF-Stream-Force-Format", "true")],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let frames: Vec<Bytes> = response
        .into_body()
        .into_data_stream()
        .map(|frame| frame.unwrap())
        .collect()
        .await;
    let (last, rest) = frames.split_last().unwrap();
    assert!(rest.iter().all(|frame| frame.len() >= 50));
    assert!(!last.is_empty());
    assert_eq!(frames.concat(), SSE_BODY.as_bytes());

    proxy.settle().await;
    let record = &proxy.sink.request_records()[0];
    let logged = &record.response.body;
    assert_eq!(logged["choices"][0]["message"]["content"], "Hello");
    assert_eq!(logged["streamed_data"].as_array().unwrap().len(), 5);
}
