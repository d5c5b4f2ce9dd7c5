use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};

use tether_core::{ChannelListener, Subscription};
use tether_orchestrator::{OrchestratorError, Registered, StartRunParams};
use tether_types::{RunSummary, SessionKey, WireFrame};

use crate::AppState;

const CONFLICT_RETRY_AFTER_MS: u64 = 500;

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let reaper_state = state.clone();
    let shutdown_state = state.clone();
    let app = app_router(state);
    let reap_every = Duration::from_secs(reaper_state.registry.config().reap_interval_secs.max(1));
    let reaper = tokio::spawn(async move {
        loop {
            tokio::time::sleep(reap_every).await;
            let pruned = reaper_state.registry.reap().await;
            if !pruned.is_empty() {
                tracing::debug!(count = pruned.len(), "pruned expired runs");
            }
        }
    });

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "tether server listening");
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await;
    reaper.abort();
    let aborted = shutdown_state.registry.shutdown().await;
    tracing::info!(aborted, "tether server stopped");
    result?;
    Ok(())
}

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/config", get(config_layers).patch(patch_config))
        .route("/session/{key}/run", post(start_run).get(get_run))
        .route("/session/{key}/events", get(session_events))
        .route("/session/{key}/abort", post(abort_run))
        .route("/session/{key}/follow-up", post(follow_up))
        .route("/session/{key}/children", get(list_children))
        .layer(cors)
        .with_state(state)
}

#[derive(Debug)]
enum ApiError {
    BadRequest { code: &'static str, message: String },
    NotFound(String),
    Conflict(Value),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest { code, message } => (
                StatusCode::BAD_REQUEST,
                Json(json!({"code": code, "error": message})),
            )
                .into_response(),
            ApiError::NotFound(key) => (
                StatusCode::NOT_FOUND,
                Json(json!({"code": "NOT_FOUND", "sessionKey": key})),
            )
                .into_response(),
            ApiError::Conflict(payload) => (StatusCode::CONFLICT, Json(payload)).into_response(),
            ApiError::Internal(message) => {
                tracing::error!(error = %message, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"code": "INTERNAL", "error": message})),
                )
                    .into_response()
            }
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::AlreadyRunning {
                session_key,
                run_id,
            } => ApiError::Conflict(conflict_payload(&session_key, &run_id)),
            OrchestratorError::InvalidKey(_)
            | OrchestratorError::DepthExceeded { .. }
            | OrchestratorError::ParentMismatch { .. }
            | OrchestratorError::SubagentRequiresParent(_)
            | OrchestratorError::InvalidTransition(_) => ApiError::BadRequest {
                code: err.code(),
                message: err.to_string(),
            },
            other => ApiError::Internal(other.to_string()),
        }
    }
}

fn parse_key(raw: &str) -> Result<SessionKey, ApiError> {
    SessionKey::parse(raw).map_err(|err| ApiError::BadRequest {
        code: "INVALID_SESSION_KEY",
        message: err.to_string(),
    })
}

fn conflict_payload(key: &SessionKey, run_id: &str) -> Value {
    json!({
        "code": "SESSION_RUN_CONFLICT",
        "sessionKey": key,
        "activeRun": { "runID": run_id },
        "retryAfterMs": CONFLICT_RETRY_AFTER_MS,
        "attachEventStream": attach_event_stream_path(key),
    })
}

fn attach_event_stream_path(key: &SessionKey) -> String {
    format!("/session/{key}/events?replay=true")
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "activeRuns": state.registry.active_run_count(),
    }))
}

async fn config_layers(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "effective": serde_json::to_value(state.config.get().await).unwrap_or(Value::Null),
        "layers": state.config.get_layers_value().await,
    }))
}

#[derive(Debug, Deserialize)]
struct ConfigPatchInput {
    patch: Value,
    /// Written to the config file unless false; otherwise kept in memory.
    #[serde(default)]
    persist: Option<bool>,
}

/// Orchestrator limits and the executor are read at startup, so a patch
/// takes effect on the next start.
async fn patch_config(
    State(state): State<AppState>,
    Json(body): Json<ConfigPatchInput>,
) -> Result<Json<Value>, ApiError> {
    if !body.patch.is_object() {
        return Err(ApiError::BadRequest {
            code: "INVALID_CONFIG_PATCH",
            message: "patch must be a JSON object".to_string(),
        });
    }
    let persist = body.persist.unwrap_or(true);
    let effective = if persist {
        state.config.patch_file(body.patch).await
    } else {
        state.config.patch_runtime(body.patch).await
    }
    .map_err(|err| ApiError::Internal(err.to_string()))?;
    Ok(Json(json!({
        "persisted": persist,
        "effective": effective,
        "layers": state.config.get_layers_value().await,
    })))
}

#[derive(Debug, Deserialize)]
struct StartRunInput {
    input: String,
    #[serde(default)]
    task: Option<String>,
    #[serde(default)]
    label: Option<String>,
}

async fn start_run(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(body): Json<StartRunInput>,
) -> Result<Response, ApiError> {
    let key = parse_key(&key)?;
    let run_id = match key.parent() {
        // Subagent keys are registered under the parent they encode, which
        // links and persists them like a spawn from inside a run.
        Some(parent) => {
            let task = body.task.unwrap_or_else(|| body.input.clone());
            match state
                .coordinator
                .register_subagent_with_input(&key, &parent, task, body.label, body.input)
                .await?
            {
                Registered::Created { run_id } => run_id,
                Registered::AlreadyActive { run_id } => {
                    return Err(ApiError::Conflict(conflict_payload(&key, &run_id)))
                }
            }
        }
        None => {
            let params = StartRunParams {
                input: body.input,
                parent: None,
                task: body.task,
                label: body.label,
            };
            state.registry.start_run(&key, params).await?.run_id
        }
    };
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "runID": run_id,
            "attachEventStream": attach_event_stream_path(&key),
        })),
    )
        .into_response())
}

async fn get_run(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<RunSummary>, ApiError> {
    let key = parse_key(&key)?;
    if key.is_subagent() {
        state
            .coordinator
            .ensure_registered_from_disk(&key, key.parent().as_ref())
            .await;
    }
    state
        .registry
        .get_run(&key)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(key.to_string()))
}

#[derive(Debug, Default, Deserialize)]
struct EventsQuery {
    replay: Option<bool>,
}

/// Unsubscribes when the client goes away.
struct SubscriptionGuard(Subscription);

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.0.unsubscribe();
    }
}

async fn session_events(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let key = parse_key(&key)?;
    if key.is_subagent() {
        state
            .coordinator
            .ensure_registered_from_disk(&key, key.parent().as_ref())
            .await;
    }
    let (listener, rx) = ChannelListener::pair();
    let subscription = state
        .registry
        .subscribe(&key, listener, query.replay.unwrap_or(true))
        .ok_or_else(|| ApiError::NotFound(key.to_string()))?;
    let guard = SubscriptionGuard(subscription);
    // The buffer drops the listener after the terminal marker, which ends the stream.
    let stream = UnboundedReceiverStream::new(rx).map(move |item| {
        let _guard = &guard;
        let frame = WireFrame::from_item(&key, &item);
        let payload = serde_json::to_string(&frame).unwrap_or_default();
        Ok(Event::default().data(payload))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(10))))
}

async fn abort_run(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let key = parse_key(&key)?;
    let aborted = state.registry.abort_run(&key).await;
    Ok(Json(json!({ "aborted": aborted })))
}

#[derive(Debug, Deserialize)]
struct FollowUpInput {
    message: String,
}

async fn follow_up(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(body): Json<FollowUpInput>,
) -> Result<Json<Value>, ApiError> {
    let key = parse_key(&key)?;
    let accepted = if key.is_subagent() {
        state.coordinator.send_follow_up(&key, body.message).await
    } else {
        match state.registry.follow_up(&key, body.message).await {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(session_key = %key, error = %err, "follow-up not accepted");
                false
            }
        }
    };
    Ok(Json(json!({ "accepted": accepted })))
}

async fn list_children(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let key = parse_key(&key)?;
    let children = state
        .coordinator
        .list_children(&key)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    Ok(Json(json!({ "sessionKey": key, "children": children })))
}
