use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{stream, StreamExt};
use serde_json::{json, Value};
use uuid::Uuid;

use serde::Serialize;

use super::balancer::{InstanceLease, LoadBalancer, StrategyStatus};
use super::client_pool::InstanceClientManager;
use super::config::BalancerSettings;
use super::estimate::estimate_total_tokens;
use super::idempotency::IdempotencyStore;
use super::instance::ModelInstance;
use super::monitor::GatewayMonitor;
use super::observability::{FailureReason, Metrics};
use super::pipeline::{render_payload, StreamTransform};
use super::state_file::SettingsFile;
use super::{Clock, GatewayError};

#[derive(Clone)]
pub struct AppState {
    pub balancer: Arc<LoadBalancer>,
    pub clients: Arc<InstanceClientManager>,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub metrics: Arc<Metrics>,
    pub monitor: Arc<GatewayMonitor>,
    pub clock: Arc<dyn Clock>,
    pub settings_file: Option<SettingsFile>,
}

pub fn router(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/v1/chat/completions", post(chat))
        .route(
            "/admin/load-balancing/settings",
            get(get_settings).put(put_settings),
        )
        .route("/admin/load-balancing/strategies", get(get_strategies))
        .route("/admin/metrics", get(get_metrics))
        .route("/admin/monitor", get(get_monitor))
        .route("/admin/monitor/reset", post(reset_monitor))
        .route("/admin/instances", get(get_instances))
        .route("/admin/instances/refresh", post(refresh_instances))
        .with_state(state)
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            GatewayError::BadRequest => StatusCode::BAD_REQUEST,
            GatewayError::DuplicateRequest => StatusCode::CONFLICT,
            GatewayError::NoInstanceOrRateLimit => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Downstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// The single client-facing entry point: admit, forward, and stream back
/// normalized lines.
async fn chat(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    state.metrics.on_request_start();
    match chat_inner(&state, body).await {
        Ok(response) => response,
        Err(err) => {
            // Synchronous-phase failure: the stream guard never took over, so
            // account for the request here.
            state.metrics.record_failure(err.reason());
            state.metrics.on_request_end();
            err.into_response()
        }
    }
}

async fn chat_inner(state: &AppState, body: Value) -> Result<Response, GatewayError> {
    let message = body
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if message.is_empty() {
        return Err(GatewayError::BadRequest);
    }

    let idempotency_key = body
        .get("idempotencyKey")
        .or_else(|| body.get("idempotency_key"))
        .and_then(Value::as_str)
        .filter(|key| !key.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    tracing::debug!(idempotency_key = %idempotency_key, "received chat request");

    if !state.idempotency.try_acquire(&idempotency_key).await {
        return Err(GatewayError::DuplicateRequest);
    }

    let estimated_tokens = estimate_total_tokens(message);
    let Some(lease) = state.balancer.acquire(estimated_tokens) else {
        state.idempotency.release(&idempotency_key).await;
        return Err(GatewayError::NoInstanceOrRateLimit);
    };
    let instance = Arc::clone(lease.instance());

    let client = match state.clients.get(&instance) {
        Ok(client) => client,
        Err(err) => {
            drop(lease);
            state.idempotency.release(&idempotency_key).await;
            return Err(GatewayError::Unexpected(err.to_string()));
        }
    };

    let payload = render_payload(&instance, &body, &idempotency_key);
    let mut request = client
        .post(&instance.config().url)
        .header(
            header::AUTHORIZATION,
            format!("Bearer {}", instance.config().api_key),
        )
        .header("X-Request-Id", &idempotency_key)
        .header("Idempotency-Key", &idempotency_key)
        .json(&payload);
    if instance.config().provider_name.eq_ignore_ascii_case("azure") {
        request = request.header("api-key", &instance.config().api_key);
    }

    // From here on the guard owns every release path: queue slot,
    // idempotency key, inflight gauge and outcome accounting.
    let mut guard = StreamGuard::new(state, lease, Arc::clone(&instance), idempotency_key.clone(), estimated_tokens);

    let upstream = match request.send().await {
        Ok(response) if response.status().is_success() => response,
        Ok(response) => {
            let error = GatewayError::Downstream(format!("upstream status {}", response.status()));
            guard.fail_downstream(&error.to_string());
            return Ok(error.into_response());
        }
        Err(err) => {
            let error = GatewayError::Downstream(err.to_string());
            guard.fail_downstream(&error.to_string());
            return Ok(error.into_response());
        }
    };

    let chat_stream = ChatStream {
        upstream: upstream.bytes_stream().boxed(),
        transform: StreamTransform::new(&instance, idempotency_key),
        carry: String::new(),
        guard,
        done: false,
    };
    let body_stream =
        stream::unfold(chat_stream, |mut ctx| async move { ctx.next_item().await.map(|item| (item, ctx)) });

    let mut response = Response::new(Body::from_stream(body_stream));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    Ok(response)
}

/// Upstream byte stream folded into normalized client lines. A trailing
/// partial line is carried across chunks and flushed at end of stream.
struct ChatStream {
    upstream: BoxStream<'static, reqwest::Result<Bytes>>,
    transform: StreamTransform,
    carry: String,
    guard: StreamGuard,
    done: bool,
}

impl ChatStream {
    async fn next_item(&mut self) -> Option<Result<Bytes, std::io::Error>> {
        if self.done {
            return None;
        }
        loop {
            match self.upstream.next().await {
                Some(Ok(bytes)) => {
                    self.carry.push_str(&String::from_utf8_lossy(&bytes));
                    let Some(cut) = self.carry.rfind('\n') else {
                        continue;
                    };
                    let complete: String = self.carry.drain(..=cut).collect();
                    let outputs = self.transform.transform_chunk(&complete);
                    if outputs.is_empty() {
                        continue;
                    }
                    return Some(Ok(Bytes::from(join_lines(&outputs))));
                }
                Some(Err(err)) => {
                    self.done = true;
                    self.guard.fail_downstream(&err.to_string());
                    return Some(Err(std::io::Error::other(err)));
                }
                None => {
                    self.done = true;
                    let outputs = self.transform.transform_chunk(&self.carry);
                    self.carry.clear();
                    self.guard.complete();
                    if outputs.is_empty() {
                        return None;
                    }
                    return Some(Ok(Bytes::from(join_lines(&outputs))));
                }
            }
        }
    }
}

fn join_lines(outputs: &[String]) -> String {
    let mut buffer = String::with_capacity(outputs.iter().map(|line| line.len() + 1).sum());
    for line in outputs {
        buffer.push_str(line);
        buffer.push('\n');
    }
    buffer
}

/// Releases request-scoped resources exactly once, whatever the outcome.
/// Dropped without a verdict (client went away) counts as a cancel.
struct StreamGuard {
    metrics: Arc<Metrics>,
    idempotency: Arc<dyn IdempotencyStore>,
    clock: Arc<dyn Clock>,
    instance: Arc<ModelInstance>,
    lease: Option<InstanceLease>,
    idempotency_key: String,
    estimated_tokens: i64,
    started_at_ms: i64,
    finished: bool,
}

impl StreamGuard {
    fn new(
        state: &AppState,
        lease: InstanceLease,
        instance: Arc<ModelInstance>,
        idempotency_key: String,
        estimated_tokens: i64,
    ) -> Self {
        Self {
            metrics: Arc::clone(&state.metrics),
            idempotency: Arc::clone(&state.idempotency),
            clock: Arc::clone(&state.clock),
            instance,
            lease: Some(lease),
            idempotency_key,
            estimated_tokens,
            started_at_ms: state.clock.now_millis(),
            finished: false,
        }
    }

    fn complete(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let now = self.clock.now_millis();
        self.instance
            .record_success((now - self.started_at_ms).max(0), now);
        self.metrics.record_success(self.estimated_tokens);
        self.release();
    }

    fn fail_downstream(&mut self, error: &str) {
        if self.finished {
            return;
        }
        self.finished = true;
        tracing::error!(idempotency_key = %self.idempotency_key, error, "downstream error");
        self.instance.record_failure(self.clock.now_millis());
        self.metrics.record_failure(FailureReason::DownstreamError);
        self.release();
    }

    fn release(&mut self) {
        self.lease.take();
        let store = Arc::clone(&self.idempotency);
        let key = std::mem::take(&mut self.idempotency_key);
        tokio::spawn(async move { store.release(&key).await });
        self.metrics.on_request_end();
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.metrics.record_failure(FailureReason::ClientCancelled);
        self.release();
    }
}

async fn get_settings(State(state): State<AppState>) -> Json<BalancerSettings> {
    Json(state.balancer.settings())
}

async fn put_settings(
    State(state): State<AppState>,
    Json(new_settings): Json<BalancerSettings>,
) -> Json<BalancerSettings> {
    state.balancer.update_settings(new_settings);
    let applied = state.balancer.settings();
    if let Some(file) = &state.settings_file {
        if let Err(err) = file.save(&applied) {
            tracing::warn!(path = %file.path().display(), error = %err, "failed to persist settings");
        }
    }
    Json(applied)
}

async fn get_strategies(State(state): State<AppState>) -> Json<Vec<StrategyStatus>> {
    Json(state.balancer.strategy_statuses())
}

async fn get_metrics(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "requests": state.metrics.snapshot(),
        "balancer": state.balancer.stats(),
    }))
}

async fn get_monitor(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::to_value(state.monitor.snapshot()).unwrap_or_default())
}

async fn reset_monitor(State(state): State<AppState>) -> StatusCode {
    state.monitor.reset();
    StatusCode::NO_CONTENT
}

/// Per-instance runtime view for the admin surface; credentials stay out.
#[derive(Debug, Serialize)]
struct InstanceStatus {
    id: i64,
    name: String,
    provider_name: String,
    model_name: String,
    url: String,
    pool_key: String,
    active: bool,
    healthy: bool,
    circuit_open: bool,
    request_count: i64,
    failure_count: i64,
    avg_latency_ms: i64,
    last_used_ms: i64,
}

async fn get_instances(State(state): State<AppState>) -> Json<Vec<InstanceStatus>> {
    let mut statuses: Vec<InstanceStatus> = state
        .balancer
        .instances()
        .into_iter()
        .map(|instance| {
            let requests = instance.request_count();
            let avg_latency_ms = if requests > 0 {
                instance.total_latency_ms() / requests
            } else {
                0
            };
            InstanceStatus {
                id: instance.id(),
                name: instance.name(),
                provider_name: instance.config().provider_name.clone(),
                model_name: instance.config().model_name.clone(),
                url: instance.config().url.clone(),
                pool_key: instance.pool_key().to_string(),
                active: instance.config().active,
                healthy: instance.is_healthy(),
                circuit_open: instance.is_circuit_open(),
                request_count: requests,
                failure_count: instance.failure_count(),
                avg_latency_ms,
                last_used_ms: instance.last_used_ms(),
            }
        })
        .collect();
    statuses.sort_by_key(|status| status.id);
    Json(statuses)
}

async fn refresh_instances(State(state): State<AppState>) -> StatusCode {
    state.balancer.refresh();
    StatusCode::NO_CONTENT
}
