//! API routes

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{delete, get, post, put},
    Router,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::conversation::{Backup, Conversation, ConversationId, Message};
use crate::core::{AssemblySink, ConversationListing, SessionController, SessionError, StoreError};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub controller: Arc<SessionController>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    model: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemPrompt {
    pub system_prompt: String,
}

/// Error response carrying a session error
pub struct ApiError(SessionError);

impl<E> From<E> for ApiError
where
    E: Into<SessionError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SessionError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            SessionError::Store(StoreError::Conflict(_)) => StatusCode::CONFLICT,
            SessionError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SessionError::Upstream(_) => StatusCode::BAD_GATEWAY,
            SessionError::EmptyMessage | SessionError::InvalidBackup(_) => StatusCode::BAD_REQUEST,
        };

        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }

        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// Progress of one chat turn, as sent to the client
#[derive(Debug)]
enum TurnUpdate {
    Delta(String),
    Done(Conversation),
    Failed(String),
}

impl TurnUpdate {
    fn into_event(self) -> Result<Event, axum::Error> {
        match self {
            TurnUpdate::Delta(text) => Event::default().event("delta").json_data(json!({ "text": text })),
            TurnUpdate::Done(conversation) => Event::default()
                .event("done")
                .json_data(json!({ "conversation": conversation })),
            TurnUpdate::Failed(error) => Event::default().event("error").json_data(json!({ "error": error })),
        }
    }
}

/// Forwards assembled text to the response stream
struct ChannelSink {
    tx: mpsc::UnboundedSender<TurnUpdate>,
}

impl AssemblySink for ChannelSink {
    fn on_text(&mut self, text: &str) {
        // A closed channel means the client left; the turn is cancelled separately
        let _ = self.tx.send(TurnUpdate::Delta(text.to_string()));
    }
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        model: state.config.service.model.name.clone(),
    })
}

async fn list_conversations(State(state): State<AppState>) -> Result<Json<ConversationListing>, ApiError> {
    Ok(Json(state.controller.list().await?))
}

async fn new_conversation(State(state): State<AppState>) -> Result<(StatusCode, Json<Conversation>), ApiError> {
    let conversation = state.controller.new_conversation().await?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

async fn current_conversation(State(state): State<AppState>) -> Result<Json<Conversation>, ApiError> {
    Ok(Json(state.controller.current_conversation().await?))
}

async fn select_conversation(
    State(state): State<AppState>,
    Path(id): Path<ConversationId>,
) -> Result<Json<Conversation>, ApiError> {
    Ok(Json(state.controller.select(id).await?))
}

async fn delete_conversation(
    State(state): State<AppState>,
    Path(id): Path<ConversationId>,
) -> Result<StatusCode, ApiError> {
    state.controller.delete_conversation(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn replace_messages(
    State(state): State<AppState>,
    Path(id): Path<ConversationId>,
    Json(messages): Json<Vec<Message>>,
) -> Result<Json<Conversation>, ApiError> {
    Ok(Json(state.controller.replace_messages(id, messages).await?))
}

async fn delete_message(
    State(state): State<AppState>,
    Path(index): Path<usize>,
) -> Result<Json<Conversation>, ApiError> {
    Ok(Json(state.controller.delete_message(index).await?))
}

/// Run one turn and stream its progress as server-sent events.
///
/// The turn is cancelled when the client disconnects; nothing is stored for
/// the assistant in that case.
async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    if request.message.trim().is_empty() {
        return Err(SessionError::EmptyMessage.into());
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let controller = state.controller.clone();

    tokio::spawn(async move {
        let mut sink = ChannelSink { tx: tx.clone() };
        let outcome = tokio::select! {
            outcome = controller.send_message(&request.message, &mut sink) => outcome,
            _ = tx.closed() => {
                tracing::info!("client disconnected, turn cancelled");
                return;
            }
        };

        let update = match outcome {
            Ok(conversation) => TurnUpdate::Done(conversation),
            Err(e) => TurnUpdate::Failed(e.to_string()),
        };
        let _ = tx.send(update);
    });

    let events = async_stream::stream! {
        while let Some(update) = rx.recv().await {
            yield update.into_event();
        }
    };

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn get_system_prompt(State(state): State<AppState>) -> Result<Json<SystemPrompt>, ApiError> {
    let system_prompt = state.controller.system_prompt().await?;
    Ok(Json(SystemPrompt { system_prompt }))
}

async fn put_system_prompt(
    State(state): State<AppState>,
    Json(prompt): Json<SystemPrompt>,
) -> Result<Json<SystemPrompt>, ApiError> {
    state.controller.set_system_prompt(&prompt.system_prompt).await?;
    Ok(Json(prompt))
}

async fn backup(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let backup: Backup = state.controller.export_backup().await?;
    Ok((
        [(header::CONTENT_DISPOSITION, "attachment; filename=\"chatapp-backup.json\"")],
        Json(backup),
    ))
}

async fn restore(State(state): State<AppState>, body: String) -> Result<Json<ConversationListing>, ApiError> {
    Ok(Json(state.controller.restore_json(&body).await?))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/v1/conversations", get(list_conversations).post(new_conversation))
        .route(
            "/v1/conversations/:id",
            get(select_conversation).delete(delete_conversation),
        )
        .route("/v1/conversations/:id/messages", put(replace_messages))
        .route("/v1/current", get(current_conversation))
        .route("/v1/messages/:index", delete(delete_message))
        .route("/v1/chat", post(chat))
        .route("/v1/system-prompt", get(get_system_prompt).put(put_system_prompt))
        .route("/v1/backup", get(backup))
        .route("/v1/restore", post(restore))
}
