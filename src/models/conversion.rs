use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Request for a presigned upload URL.
#[derive(Debug, Deserialize, Validate)]
pub struct UploadUrlRequest {
    #[garde(length(min = 1, max = 255))]
    pub filename: String,

    #[garde(length(min = 1, max = 127))]
    pub content_type: Option<String>,
}

/// Presigned upload capability handed back to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadUrlResponse {
    pub upload_url: String,
    pub object_name: String,
    pub file_id: Uuid,
    pub expires_in: u64,
}

/// Request to enqueue a conversion of an already uploaded object.
#[derive(Debug, Deserialize, Validate)]
pub struct CreateTaskRequest {
    #[garde(length(min = 1, max = 512))]
    pub object_name: String,

    #[garde(length(min = 1, max = 255))]
    pub original_filename: String,

    #[serde(default)]
    #[garde(skip)]
    pub extract_images: bool,

    #[garde(length(min = 1, max = 128))]
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateTaskResponse {
    pub task_id: Uuid,
    pub status: String,
    pub filename: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DownloadResponse {
    pub download_url: String,
    pub filename: String,
    pub expires_in: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteTaskResponse {
    pub task_id: Uuid,
    pub cancelled: bool,
    pub result_removed: bool,
    pub message: String,
}
