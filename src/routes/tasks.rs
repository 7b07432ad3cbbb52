use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::Json;
use garde::Validate;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::AppError;
use crate::models::conversion::{
    CreateTaskRequest, CreateTaskResponse, DeleteTaskResponse, DownloadResponse, UploadUrlRequest,
    UploadUrlResponse,
};
use crate::models::job::{JobPayload, JobStatus, JobView};
use crate::services::converter::is_supported;

/// Namespace clients may hand back to `create-task`.
pub const UPLOAD_PREFIX: &str = "uploads/";

/// Ids that are not UUIDs cannot name a task.
fn parse_task_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| AppError::NotFound(format!("task {raw} not found")))
}

fn ensure_supported(filename: &str) -> Result<(), AppError> {
    if is_supported(filename) {
        Ok(())
    } else {
        Err(AppError::Validation(format!("Unsupported file type: {filename}")))
    }
}

/// POST /api/v1/async/upload-url
pub async fn create_upload_url(
    State(state): State<AppState>,
    payload: Result<Json<UploadUrlRequest>, JsonRejection>,
) -> Result<Json<UploadUrlResponse>, AppError> {
    let Json(request) = payload?;
    request.validate()?;
    ensure_supported(&request.filename)?;

    let intent = state
        .storage
        .issue_upload_url(&request.filename, request.content_type.as_deref())
        .await?;

    Ok(Json(UploadUrlResponse {
        upload_url: intent.upload_url,
        object_name: intent.object_key,
        file_id: intent.file_id,
        expires_in: intent.expires_in,
    }))
}

/// POST /api/v1/async/create-task
pub async fn create_task(
    State(state): State<AppState>,
    payload: Result<Json<CreateTaskRequest>, JsonRejection>,
) -> Result<Json<CreateTaskResponse>, AppError> {
    let Json(request) = payload?;
    request.validate()?;

    if !request.object_name.starts_with(UPLOAD_PREFIX) || request.object_name.contains("..") {
        return Err(AppError::Validation(format!(
            "object_name must be an upload key under '{UPLOAD_PREFIX}'"
        )));
    }
    ensure_supported(&request.original_filename)?;

    let filename = request.original_filename.clone();
    let task_id = state
        .queue
        .submit(JobPayload {
            input_object_key: request.object_name,
            original_filename: request.original_filename,
            extract_images: request.extract_images,
            user_id: request.user_id,
        })
        .await?;

    Ok(Json(CreateTaskResponse {
        task_id,
        status: JobStatus::Pending.to_string(),
        filename,
        message: "Conversion task queued".to_string(),
    }))
}

/// GET /api/v1/async/task/{task_id}
pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<JobView>, AppError> {
    let task_id = parse_task_id(&task_id)?;
    Ok(Json(state.queue.get_status(task_id).await?))
}

/// GET /api/v1/async/download/{task_id}
///
/// Issues a fresh URL on every call; the one stored on the job may have
/// expired.
pub async fn get_download_url(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<DownloadResponse>, AppError> {
    let task_id = parse_task_id(&task_id)?;
    let record = state.queue.record(task_id).await?;

    let Some(output) = record.output() else {
        return Err(AppError::NotFound(format!(
            "task {task_id} has no result ({})",
            record.status()
        )));
    };

    let download_url = state
        .storage
        .issue_download_url(&output.object_key, &output.filename)
        .await?;

    Ok(Json(DownloadResponse {
        download_url,
        filename: output.filename.clone(),
        expires_in: state.storage.presigned_ttl().as_secs(),
    }))
}

/// DELETE /api/v1/async/task/{task_id}
pub async fn delete_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<DeleteTaskResponse>, AppError> {
    let task_id = parse_task_id(&task_id)?;
    let outcome = state.queue.delete(task_id, &state.storage).await?;

    Ok(Json(DeleteTaskResponse {
        task_id,
        cancelled: outcome.cancelled,
        result_removed: outcome.result_removed,
        message: "Task deleted".to_string(),
    }))
}
