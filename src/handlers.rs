use std::convert::Infallible;

use axum::{
    Json,
    extract::{Multipart, Path, Query, State, multipart::MultipartError},
    response::sse::{Event, KeepAlive, Sse},
};
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_stream::{Stream, StreamExt};
use tracing::{error, info, warn};

use crate::AppState;
use crate::error::{PanelError, PanelResult};
use crate::logs::LogChunk;
use crate::ops::{FileOpRequest, FileOpResponse, UploadFile};
use crate::registry::Principal;

const KEEPALIVE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(15);

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub folders_only: bool,
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateFolderRequest {
    #[serde(default)]
    pub path: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    #[serde(default)]
    pub path: String,
    pub old_name: String,
    pub new_name: String,
}

#[derive(Debug, Deserialize)]
pub struct DeleteRequest {
    #[serde(default)]
    pub path: String,
    pub names: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    #[serde(default)]
    pub path: String,
    pub names: Vec<String>,
    pub destination: String,
}

// ============================================================================
// Helpers
// ============================================================================

/// Run a file operation on the blocking pool.
async fn run_file_op(
    state: &AppState,
    principal: Principal,
    request: FileOpRequest,
) -> PanelResult<Json<FileOpResponse>> {
    let files = state.files.clone();
    let response = tokio::task::spawn_blocking(move || files.execute(&principal, request))
        .await
        .map_err(|e| {
            error!("File operation task failed: {}", e);
            PanelError::Internal("file operation task failed".to_string())
        })??;

    Ok(Json(response))
}

fn multipart_error(e: MultipartError) -> PanelError {
    warn!("Multipart error: {}", e);
    PanelError::InvalidArgument(format!(
        "Error parsing `multipart/form-data` request: {}",
        e.body_text()
    ))
}

fn chunk_event(chunk: &LogChunk) -> Event {
    // SSE data cannot carry carriage returns.
    Event::default()
        .event(chunk.event_name())
        .data(chunk.text().replace('\r', ""))
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /health - Health check endpoint
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// GET /sites/{site}/files - List a directory
pub async fn list_files(
    State(state): State<AppState>,
    Path(site): Path<String>,
    principal: Principal,
    Query(query): Query<ListQuery>,
) -> PanelResult<Json<FileOpResponse>> {
    let request = FileOpRequest::List {
        tenant: site,
        path: query.path,
        folders_only: query.folders_only,
    };
    run_file_op(&state, principal, request).await
}

/// POST /sites/{site}/files/upload - Upload one or more files
///
/// Every multipart field carrying a filename is one uploaded file. Bytes past
/// the configured per-file limit are counted but not buffered.
pub async fn upload_files(
    State(state): State<AppState>,
    Path(site): Path<String>,
    principal: Principal,
    Query(query): Query<UploadQuery>,
    mut multipart: Multipart,
) -> PanelResult<Json<FileOpResponse>> {
    let limit = state.config.max_upload_size;
    let mut files = Vec::new();

    while let Some(mut field) = multipart.next_field().await.map_err(multipart_error)? {
        let Some(file_name) = field.file_name().map(str::to_string) else {
            continue;
        };

        let mut buffer = BytesMut::new();
        let mut size = 0u64;
        while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
            size = size.saturating_add(chunk.len() as u64);
            if size <= limit {
                buffer.extend_from_slice(&chunk);
            }
        }

        let data = if size > limit {
            warn!(site = %site, file = %file_name, size, limit, "Upload exceeds size limit");
            Bytes::new()
        } else {
            buffer.freeze()
        };

        files.push(UploadFile {
            file_name,
            data,
            size,
        });
    }

    if files.is_empty() {
        return Err(PanelError::InvalidArgument(
            "Missing file upload data".to_string(),
        ));
    }

    let request = FileOpRequest::Upload {
        tenant: site,
        path: query.path,
        files,
    };
    run_file_op(&state, principal, request).await
}

/// POST /sites/{site}/files/folder - Create a directory
pub async fn create_folder(
    State(state): State<AppState>,
    Path(site): Path<String>,
    principal: Principal,
    Json(body): Json<CreateFolderRequest>,
) -> PanelResult<Json<FileOpResponse>> {
    let request = FileOpRequest::CreateFolder {
        tenant: site,
        path: body.path,
        name: body.name,
    };
    run_file_op(&state, principal, request).await
}

/// POST /sites/{site}/files/rename - Rename an entry in place
pub async fn rename_item(
    State(state): State<AppState>,
    Path(site): Path<String>,
    principal: Principal,
    Json(body): Json<RenameRequest>,
) -> PanelResult<Json<FileOpResponse>> {
    let request = FileOpRequest::Rename {
        tenant: site,
        path: body.path,
        old_name: body.old_name,
        new_name: body.new_name,
    };
    run_file_op(&state, principal, request).await
}

/// POST /sites/{site}/files/delete - Delete entries
pub async fn delete_items(
    State(state): State<AppState>,
    Path(site): Path<String>,
    principal: Principal,
    Json(body): Json<DeleteRequest>,
) -> PanelResult<Json<FileOpResponse>> {
    let request = FileOpRequest::Delete {
        tenant: site,
        path: body.path,
        names: body.names,
    };
    run_file_op(&state, principal, request).await
}

/// POST /sites/{site}/files/copy - Copy entries into another directory
pub async fn copy_items(
    State(state): State<AppState>,
    Path(site): Path<String>,
    principal: Principal,
    Json(body): Json<TransferRequest>,
) -> PanelResult<Json<FileOpResponse>> {
    let request = FileOpRequest::Copy {
        tenant: site,
        path: body.path,
        names: body.names,
        destination: body.destination,
    };
    run_file_op(&state, principal, request).await
}

/// POST /sites/{site}/files/move - Move entries into another directory
pub async fn move_items(
    State(state): State<AppState>,
    Path(site): Path<String>,
    principal: Principal,
    Json(body): Json<TransferRequest>,
) -> PanelResult<Json<FileOpResponse>> {
    let request = FileOpRequest::Move {
        tenant: site,
        path: body.path,
        names: body.names,
        destination: body.destination,
    };
    run_file_op(&state, principal, request).await
}

/// GET /logs/{service}/stream - Follow a service's journal as server-sent events
///
/// The follower is spawned only after the request passes validation and
/// authorization. Closing the connection drops the stream, which tears the
/// follower down.
pub async fn stream_logs(
    State(state): State<AppState>,
    Path(service): Path<String>,
    principal: Principal,
) -> PanelResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let session = state.logs.open(&service, &principal)?;
    info!(
        service = session.service(),
        principal = principal.as_str(),
        "Starting log stream"
    );

    let stream = session
        .start()
        .map(|chunk| Ok::<_, Infallible>(chunk_event(&chunk)));

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(KEEPALIVE_INTERVAL)
            .text("keepalive"),
    ))
}
