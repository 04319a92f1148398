use axum::{
    body::Body,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::fs;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn};

use crate::{
    auth::{verify_bearer, verify_query_token},
    blob_store::{BlobStore, LinkError},
    bus::Subscription,
    errors::ErrorCategory,
    models::{
        ErrorDetail, ResolutionRequest, SubmitAcceptedResponse, SubmitDownloadRequest, Task,
        TaskMutation, TaskResponse, TaskStatus,
    },
    store::StoreError,
    AppState,
};

#[derive(Debug, PartialEq, Eq)]
pub enum ApiError {
    Unauthorized(&'static str),
    InvalidRequest(String),
    TaskNotFound,
    QueueUnavailable,
    StoreUnavailable,
    Link(LinkError),
    FileMissing,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::TaskNotFound | Self::FileMissing => StatusCode::NOT_FOUND,
            Self::QueueUnavailable | Self::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Link(LinkError::Expired) => StatusCode::GONE,
            Self::Link(LinkError::Key) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Link(_) => StatusCode::FORBIDDEN,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::InvalidRequest(_) => "INVALID_DOWNLOAD_REQUEST",
            Self::TaskNotFound => "TASK_NOT_FOUND",
            Self::QueueUnavailable => "QUEUE_UNAVAILABLE",
            Self::StoreUnavailable => "STORE_UNAVAILABLE",
            Self::Link(LinkError::Expired) => "LINK_EXPIRED",
            Self::Link(_) => "LINK_INVALID",
            Self::FileMissing => "FILE_NOT_FOUND",
        }
    }

    fn message(&self) -> String {
        match self {
            Self::Unauthorized(message) => message.to_string(),
            Self::InvalidRequest(message) => message.clone(),
            Self::TaskNotFound => "Download task not found.".to_string(),
            Self::QueueUnavailable => "Download queue is unavailable.".to_string(),
            Self::StoreUnavailable => "Task storage is unavailable.".to_string(),
            Self::Link(err) => format!("Download link rejected: {err}."),
            Self::FileMissing => "The requested file no longer exists.".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(json!({
                "error": {
                    "code": self.code(),
                    "message": self.message()
                }
            })),
        )
            .into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        error!("Task store call failed: {err}");
        Self::StoreUnavailable
    }
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FileQuery {
    pub expires: i64,
    pub signature: String,
}

pub async fn healthz() -> impl IntoResponse {
    Json(json!({ "ok": true, "timestamp": Utc::now() }))
}

fn validate_source_url(raw: &str) -> Result<String, ApiError> {
    let url = raw.trim();
    let host = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .and_then(|rest| rest.split(['/', '?', '#']).next())
        .unwrap_or_default();
    if host.is_empty() || url.chars().any(char::is_whitespace) {
        return Err(ApiError::InvalidRequest(
            "url must be an absolute http(s) URL.".to_string(),
        ));
    }
    Ok(url.to_string())
}

pub async fn create_download(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<SubmitDownloadRequest>,
) -> Result<Response, ApiError> {
    verify_bearer(&headers, &state.config.api_key)?;

    let source_url = validate_source_url(&payload.url)?;
    let resolution = match payload.resolution.as_deref() {
        Some(raw) => raw
            .parse::<ResolutionRequest>()
            .map_err(|err| ApiError::InvalidRequest(format!("{err}.")))?,
        None => ResolutionRequest::HighestAvailable,
    };

    let task = Task::new(source_url, resolution, payload.include_audio);
    state.store.insert(task.clone()).await?;

    if state.queue_tx.send(task.id.clone()).await.is_err() {
        let detail = ErrorDetail::from_category(ErrorCategory::InternalError);
        if let Err(err) = state.store.apply(&task.id, TaskMutation::Fail(detail)).await {
            warn!(task_id = %task.id, "Failed marking unqueued task as failed: {err}");
        }
        return Err(ApiError::QueueUnavailable);
    }

    info!(
        task_id = %task.id,
        resolution = %task.resolution_request,
        include_audio = task.include_audio,
        "Download task accepted"
    );

    let response = SubmitAcceptedResponse {
        task_id: task.id,
        status: task.status,
        stage: task.stage,
        created_at: task.created_at,
    };
    Ok((StatusCode::ACCEPTED, Json(response)).into_response())
}

fn task_view(state: &AppState, task: &Task) -> TaskResponse {
    let download_url = match (&task.status, &task.result_reference) {
        (TaskStatus::Completed, Some(reference)) => {
            match state.blobs.sign_retrieval_url(reference, state.config.link_ttl) {
                Ok(url) => Some(url),
                Err(err) => {
                    warn!(task_id = %task.id, "Failed signing retrieval link: {err:#}");
                    None
                }
            }
        }
        _ => None,
    };
    task.to_response(download_url)
}

pub async fn get_download(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> Result<Json<TaskResponse>, ApiError> {
    verify_bearer(&headers, &state.config.api_key)?;

    let task = state.store.get(&task_id).await?.ok_or(ApiError::TaskNotFound)?;
    Ok(Json(task_view(&state, &task)))
}

pub async fn download_events(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Query(query): Query<EventsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    verify_query_token(query.token.as_deref(), &state.config.api_key)?;

    // Subscribe before reading the snapshot so no event falls in between.
    let subscription = state.bus.subscribe(&task_id).await;
    let task = state.store.get(&task_id).await?.ok_or(ApiError::TaskNotFound)?;
    let snapshot = json!({ "type": "snapshot", "task": task_view(&state, &task) });
    // A finished task has nothing left to stream.
    let events = (!task.is_terminal()).then_some(subscription);

    Ok(ws.on_upgrade(move |socket| stream_events(socket, snapshot, events)))
}

async fn stream_events(socket: WebSocket, snapshot: serde_json::Value, events: Option<Subscription>) {
    let (sender, receiver) = socket.split();
    forward_events(sender, receiver, snapshot, events).await;
}

async fn forward_events<S, R, E>(
    mut sender: S,
    mut receiver: R,
    snapshot: serde_json::Value,
    events: Option<Subscription>,
) where
    S: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    if sender
        .send(Message::Text(snapshot.to_string().into()))
        .await
        .is_err()
    {
        return;
    }
    let Some(mut events) = events else {
        let _ = sender.send(Message::Close(None)).await;
        return;
    };

    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else {
                    break;
                };
                let payload = match serde_json::to_string(&event) {
                    Ok(payload) => payload,
                    Err(err) => {
                        error!(task_id = %events.task_id(), "Failed encoding task event: {err}");
                        continue;
                    }
                };
                if sender.send(Message::Text(payload.into())).await.is_err() {
                    debug!(task_id = %events.task_id(), "Event subscriber went away");
                    return;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Err(err)) => {
                        debug!(task_id = %events.task_id(), "WebSocket error: {err}");
                        return;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

fn content_type_for(key: &str) -> &'static str {
    match key.rsplit_once('.').map(|(_, ext)| ext) {
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("m4a") => "audio/mp4",
        Some("mp3") => "audio/mpeg",
        _ => "application/octet-stream",
    }
}

pub async fn download_file(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<FileQuery>,
) -> Result<Response, ApiError> {
    let path = state
        .blobs
        .resolve_signed(&key, query.expires, &query.signature)
        .map_err(ApiError::Link)?;

    let file = match fs::File::open(&path).await {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError::FileMissing);
        }
        Err(err) => {
            error!(path = %path.display(), "Failed opening stored file: {err}");
            return Err(ApiError::FileMissing);
        }
    };
    let length = file.metadata().await.ok().map(|meta| meta.len());

    let file_name = key.rsplit('/').next().unwrap_or(key.as_str());
    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type_for(&key))
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{file_name}\""),
        );
    if let Some(length) = length {
        response = response.header(header::CONTENT_LENGTH, length);
    }

    response
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|err| {
            error!("Failed building file response: {err}");
            ApiError::FileMissing
        })
}
