//! Main proxy service implementation
//!
//! The `ProxyService` is the request orchestrator. For every proxied request
//! it checks the credential, applies the rate limit, consults the cache,
//! resolves prompt templates, forwards upstream with retries and streams the
//! response back. Counter increments, cache writes and log records are
//! scheduled on the [`LogPath`] so the client never waits for them.
//!
//! ## Service Lifecycle
//!
//! ```rust,ignore
//! use helicone_proxy::proxy::{AuthConfig, Collaborators, ProxyConfig, ProxyService};
//!
//! let service = ProxyService::new(ProxyConfig::default(), collaborators);
//! let log_path = service.log_path().clone();
//! let router = service.into_router(AuthConfig::default());
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8787").await?;
//! axum::serve(listener, router).await?;
//! log_path.drain(Duration::from_secs(900)).await;
//! ```

use crate::domain::{
    CacheStatus, HashedCredential, LogEvent, PromptId, PromptName, RequestId, RequestLog, UserId,
};
use crate::infrastructure::{CachedResponse, CounterStore, LogSink, ResponseStore};
use crate::proxy::{
    cache::{request_cache_control, CacheRequest, CacheSettings, CacheSettingsError, ResponseCache},
    capture::{coalesce_small_chunks, tee, FORCE_FORMAT_MIN_CHUNK},
    headers::{
        bearer_token, content_types, paths, response as response_headers, Headers, AUTHORIZATION,
        HELICONE_AUTH, HELICONE_FF_INCREASE_TIMEOUT, HELICONE_FF_STREAM_FORCE_FORMAT,
        HELICONE_PROMPT_ID, HELICONE_PROMPT_NAME, HELICONE_RATELIMIT_POLICY, HELICONE_USER_ID,
        USER_ID,
    },
    log_path::{failed_exchange, LogPath, PendingExchange},
    logging_endpoint::{confirmation, property_update},
    middleware::AuthConfig,
    middleware_stack::ProxyMiddlewareStack,
    prompt::extract_prompt,
    rate_limit::{
        cents_cost, RateLimitDecision, RateLimitPolicy, RateLimitScope, RateLimitUnit, RateLimiter,
    },
    retry::{ForwardRequest, RetryForwarder, RetryOptions, UpstreamClient, UpstreamError},
    types::*,
};
use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// External collaborators of the proxy
#[derive(Clone)]
pub struct Collaborators {
    pub upstream: Arc<dyn UpstreamClient>,
    pub counters: Arc<dyn CounterStore>,
    pub responses: Arc<dyn ResponseStore>,
    pub log_sink: Arc<dyn LogSink>,
}

/// Per-request settings read from the proxy headers
struct RequestSettings {
    rate_limit: Option<RateLimitPolicy>,
    cache: CacheSettings,
    retry: Option<RetryOptions>,
    force_format: bool,
}

impl RequestSettings {
    /// Every header-driven setting is validated before anything is forwarded
    fn from_headers(headers: &Headers, streamed: bool) -> ProxyResult<Self> {
        let rate_limit = headers
            .get(HELICONE_RATELIMIT_POLICY)
            .map(str::parse::<RateLimitPolicy>)
            .transpose()?;
        let cache = CacheSettings::from_headers(headers)?;
        if cache.enabled() && streamed {
            return Err(CacheSettingsError::StreamingNotSupported.into());
        }
        let retry = RetryOptions::from_headers(headers)?;

        Ok(Self {
            rate_limit,
            cache,
            retry,
            force_format: headers.is_true(HELICONE_FF_STREAM_FORCE_FORMAT),
        })
    }
}

/// Main proxy service
pub struct ProxyService {
    config: ProxyConfig,
    forwarder: RetryForwarder,
    cache: ResponseCache,
    rate_limiter: RateLimiter,
    log_path: LogPath,
}

impl ProxyService {
    pub fn new(config: ProxyConfig, collaborators: Collaborators) -> Self {
        Self {
            config,
            forwarder: RetryForwarder::new(collaborators.upstream),
            cache: ResponseCache::new(collaborators.responses),
            rate_limiter: RateLimiter::new(collaborators.counters),
            log_path: LogPath::new(collaborators.log_sink),
        }
    }

    /// Handle on the background work, for draining at shutdown
    pub fn log_path(&self) -> &LogPath {
        &self.log_path
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Create an Axum router for the proxy service with middleware
    pub fn into_router(self, auth_config: AuthConfig) -> axum::Router {
        let router = axum::Router::new()
            .route(paths::HEALTH, axum::routing::get(health_handler))
            .route(paths::LOG, axum::routing::post(log_properties_handler))
            .fallback(proxy_handler)
            .with_state(Arc::new(self));

        ProxyMiddlewareStack::new(auth_config).apply_to_router(router)
    }

    async fn collect_body(&self, body: Body) -> ProxyResult<Bytes> {
        let max_size = self.config.max_request_size;
        match Limited::new(body, *max_size.as_ref()).collect().await {
            Ok(collected) => Ok(collected.to_bytes()),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                Err(ProxyError::RequestTooLarge { max_size })
            }
            Err(e) => Err(ProxyError::Internal(format!(
                "Failed to read request body: {e}"
            ))),
        }
    }

    fn upstream_url(&self, path_and_query: &str) -> String {
        format!("{}{}", self.config.upstream_base_url, path_and_query)
    }

    /// Orchestrate one proxied request
    pub async fn handle(&self, request_id: RequestId, request: Request) -> ProxyResult<Response> {
        let (parts, body) = request.into_parts();
        let raw_body = self.collect_body(body).await?;
        let headers = Headers::from_header_map(&parts.headers);
        let request_json: Option<Value> = serde_json::from_slice(&raw_body).ok();
        let streamed = request_json
            .as_ref()
            .and_then(|json| json.get("stream"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let settings = RequestSettings::from_headers(&headers, streamed)?;

        let credential = headers
            .get(AUTHORIZATION)
            .filter(|value| !value.trim().is_empty())
            .ok_or(ProxyError::MissingCredential)?;
        let auth_hash = HashedCredential::from_credential(credential);
        let user_id = resolve_user_id(request_json.as_ref(), &headers);

        let decision = match &settings.rate_limit {
            Some(policy) => {
                self.check_rate_limit(
                    &request_id,
                    RateLimitScope {
                        credential: auth_hash.clone(),
                        user: user_id.clone(),
                    },
                    policy,
                )
                .await?
            }
            None => None,
        };

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or(parts.uri.path());
        let url = self.upstream_url(path_and_query);

        if settings.cache.should_read {
            let cache_request = CacheRequest {
                url: &url,
                body: &raw_body,
                headers: &headers,
            };
            match self
                .cache
                .read(&cache_request, settings.cache.bucket_max_size)
                .await
            {
                Ok(Some(hit)) => {
                    debug!(
                        request_id = %request_id,
                        bucket_index = hit.bucket_index,
                        "Serving response from cache"
                    );
                    let cached_id =
                        cached_request_id(&hit.response).unwrap_or_else(|| request_id.clone());
                    self.log_path.write_in_background(LogEvent::CacheHit {
                        request_id: cached_id,
                        hit_at: Utc::now(),
                    });
                    let mut response = cached_response(hit.response)?;
                    append_rate_limit_headers(&mut response, decision.as_ref());
                    return Ok(response);
                }
                Ok(None) => {}
                Err(e) => warn!(request_id = %request_id, error = %e, "Cache read failed"),
            }
        }

        let extracted = extract_prompt(&raw_body, &headers)?;
        let forwarded_json: Option<Value> = serde_json::from_slice(&extracted.body).ok();

        let request_log = RequestLog {
            id: request_id.clone(),
            created_at: Utc::now(),
            method: parts.method.to_string(),
            url: url.clone(),
            path: parts.uri.path().to_string(),
            body: forwarded_json,
            auth_hash,
            helicone_auth_hash: headers.get(HELICONE_AUTH).map(|key| {
                HashedCredential::from_credential(&format!("Bearer {}", bearer_token(key)))
            }),
            user_id,
            prompt_id: headers
                .get(HELICONE_PROMPT_ID)
                .and_then(|id| PromptId::try_new(id.to_string()).ok()),
            prompt_name: headers
                .get(HELICONE_PROMPT_NAME)
                .and_then(|name| PromptName::try_new(name.to_string()).ok()),
            properties: headers.properties(),
            prompts: extracted.prompts.clone(),
            streamed,
            cache: settings.cache.should_read.then_some(CacheStatus::Miss),
        };

        let timeout = if headers.is_true(HELICONE_FF_INCREASE_TIMEOUT) {
            self.config.extended_timeout
        } else {
            self.config.request_timeout
        };
        let forward = ForwardRequest {
            method: parts.method.clone(),
            url,
            headers: extracted.headers.for_upstream(),
            body: extracted.body,
            timeout,
        };

        let started = Instant::now();
        let upstream = match self.forwarder.forward(forward, settings.retry.as_ref()).await {
            Ok(upstream) => upstream,
            Err(e) => {
                let status = match e {
                    UpstreamError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                warn!(request_id = %request_id, error = %e, "Forwarding failed");
                let record = failed_exchange(request_log, status.as_u16(), &e.to_string(), started);
                self.log_path
                    .write_in_background(LogEvent::Request(Box::new(record)));
                return Err(e.into());
            }
        };

        let status = upstream.status;
        let response_headers = upstream
            .headers
            .with(response_headers::HELICONE_STATUS, response_headers::STATUS_SUCCESS)
            .with(response_headers::HELICONE_ID, request_id.to_string());

        let (client_stream, capture) = tee(upstream.body);
        let client_body = if settings.force_format {
            Body::from_stream(coalesce_small_chunks(client_stream, FORCE_FORMAT_MIN_CHUNK))
        } else {
            Body::from_stream(client_stream)
        };

        let mut client_headers = response_headers.clone();
        if settings.cache.should_read {
            client_headers = client_headers.with(
                response_headers::HELICONE_CACHE,
                CacheStatus::Miss.to_string(),
            );
        }
        if let Some(decision) = &decision {
            for (name, value) in decision.header_pairs() {
                client_headers = client_headers.with(name, value);
            }
        }

        let mut response = Response::builder().status(status).body(client_body)?;
        *response.headers_mut() = client_headers.to_header_map();

        let pending = PendingExchange {
            request: request_log,
            status: status.as_u16(),
            started,
            capture,
        };
        self.schedule_completion(
            pending,
            CompletionContext {
                cache_settings: settings.cache,
                cache_control: request_cache_control(&headers).map(str::to_string),
                cache_url: self.upstream_url(path_and_query),
                raw_body,
                raw_headers: headers,
                response_headers,
                decision,
            },
        );

        Ok(response)
    }

    async fn check_rate_limit(
        &self,
        request_id: &RequestId,
        scope: RateLimitScope,
        policy: &RateLimitPolicy,
    ) -> ProxyResult<Option<RateLimitDecision>> {
        let decision = match self.rate_limiter.check(&scope, policy).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(
                    request_id = %request_id,
                    error = %e,
                    "Rate limit store unavailable, allowing request"
                );
                return Ok(None);
            }
        };

        if decision.is_limited() {
            info!(
                request_id = %request_id,
                quota = policy.quota,
                window = policy.time_window,
                "Rate limit reached"
            );
            return Err(ProxyError::RateLimited(Box::new(decision)));
        }

        if policy.unit == RateLimitUnit::Request {
            let limiter = self.rate_limiter.clone();
            let counted = decision.clone();
            self.log_path.spawn("rate_limit_increment", async move {
                if let Err(e) = limiter.record(&counted, 1).await {
                    warn!(error = %e, "Failed to update rate limit counter");
                }
            });
        }
        Ok(Some(decision))
    }

    fn schedule_completion(&self, pending: PendingExchange, context: CompletionContext) {
        let log_path = self.log_path.clone();
        let cache = self.cache.clone();
        let limiter = self.rate_limiter.clone();
        let ceiling = self.config.log_body_timeout;
        let cents_per_1k = self.config.cents_per_1k_tokens;

        self.log_path.spawn("exchange_completion", async move {
            let finished = pending.finish(ceiling).await;
            let request_id = finished.record.request.id.clone();
            let status = finished.record.response.status;
            let total_tokens = finished
                .record
                .response
                .usage
                .and_then(|usage| usage.total_tokens);

            log_path
                .write(LogEvent::Request(Box::new(finished.record)))
                .await;

            let cacheable = context.cache_settings.should_save
                && (200..300).contains(&status)
                && finished.body.complete;
            if cacheable {
                let request = CacheRequest {
                    url: &context.cache_url,
                    body: &context.raw_body,
                    headers: &context.raw_headers,
                };
                let entry = CachedResponse {
                    status,
                    headers: context
                        .response_headers
                        .iter()
                        .map(|(name, value)| (name.to_string(), value.to_string()))
                        .collect(),
                    body: finished.body.bytes,
                };
                match cache
                    .write(
                        &request,
                        entry,
                        context.cache_control.as_deref(),
                        context.cache_settings.bucket_max_size,
                    )
                    .await
                {
                    Ok(index) => {
                        debug!(request_id = %request_id, bucket_index = index, "Response cached")
                    }
                    Err(e) => debug!(request_id = %request_id, error = %e, "Response not cached"),
                }
            }

            if let Some(decision) = context
                .decision
                .filter(|decision| decision.policy.unit == RateLimitUnit::Cents)
            {
                let cost = cents_cost(total_tokens.unwrap_or(0), cents_per_1k);
                if let Err(e) = limiter.record(&decision, cost).await {
                    warn!(
                        request_id = %request_id,
                        error = %e,
                        "Failed to update rate limit counter"
                    );
                }
            }
        });
    }
}

/// What the background continuation needs besides the pending exchange
struct CompletionContext {
    cache_settings: CacheSettings,
    cache_control: Option<String>,
    cache_url: String,
    raw_body: Bytes,
    raw_headers: Headers,
    response_headers: Headers,
    decision: Option<RateLimitDecision>,
}

/// User id precedence: body `user`, then `Helicone-User-Id`, then `User-Id`
pub fn resolve_user_id(body: Option<&Value>, headers: &Headers) -> Option<UserId> {
    let from_body = body
        .and_then(|json| json.get("user"))
        .filter(|user| !user.is_null())
        .map(|user| match user {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });

    from_body
        .or_else(|| headers.get(HELICONE_USER_ID).map(str::to_string))
        .or_else(|| headers.get(USER_ID).map(str::to_string))
        .and_then(|id| UserId::try_new(id).ok())
}

fn cached_request_id(entry: &CachedResponse) -> Option<RequestId> {
    entry
        .headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(response_headers::HELICONE_ID))
        .and_then(|(_, value)| RequestId::try_new(value.clone()).ok())
}

fn cached_response(entry: CachedResponse) -> ProxyResult<Response> {
    let mut response = Response::builder()
        .status(entry.status)
        .body(Body::from(entry.body))?;
    *response.headers_mut() = Headers::from_pairs(entry.headers).to_header_map();
    Ok(response)
}

fn append_rate_limit_headers(response: &mut Response, decision: Option<&RateLimitDecision>) {
    let Some(decision) = decision else {
        return;
    };
    for (name, value) in decision.header_pairs() {
        if let Ok(value) = HeaderValue::from_str(&value) {
            response.headers_mut().insert(name, value);
        }
    }
}

/// Axum handler for proxying requests
async fn proxy_handler(
    State(proxy): State<Arc<ProxyService>>,
    request: Request,
) -> Result<Response, ProxyError> {
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .cloned()
        .unwrap_or_else(RequestId::generate);

    proxy.handle(request_id, request).await
}

/// `POST /v1/log`
async fn log_properties_handler(
    State(proxy): State<Arc<ProxyService>>,
    request: Request,
) -> Result<Response, ProxyError> {
    let (parts, body) = request.into_parts();
    let body = proxy.collect_body(body).await?;
    let headers = Headers::from_header_map(&parts.headers);

    let event = property_update(&body, &headers)?;
    let message = match &event {
        LogEvent::Properties { properties, .. } => confirmation(properties),
        _ => String::new(),
    };
    proxy.log_path.write_in_background(event);

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, content_types::TEXT_PLAIN)],
        message,
    )
        .into_response())
}

/// Health check handler
async fn health_handler() -> &'static str {
    "OK"
}
