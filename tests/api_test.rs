//! API tests against the real router, served on an ephemeral port with
//! in-memory storage and queue backends. The worker side is driven in-process
//! with `JobRunner::drain`.
//!
//! Run with: cargo test --test api_test

mod fixtures;
mod helpers;

use fixtures::*;
use helpers::*;
use md_convert_async::{
    error::{ErrorBody, ErrorKind},
    models::conversion::{
        CreateTaskResponse, DeleteTaskResponse, DownloadResponse, UploadUrlResponse,
    },
    models::job::{JobStatus, JobView},
    routes::health::ServiceHealthResponse,
    services::auth::{RequestAuthenticator, SignatureContext, SIGNATURE_HEADER, TIMESTAMP_HEADER},
};
use reqwest::{Method, StatusCode};
use serde_json::json;
use uuid::Uuid;

async fn error_body(response: reqwest::Response) -> ErrorBody {
    response.json::<ErrorBody>().await.expect("error body")
}

async fn create_task(app: &TestApp, doc: &TestDocument) -> CreateTaskResponse {
    let upload = app
        .client
        .post_json(
            "/api/v1/async/upload-url",
            &json!({ "filename": doc.filename, "content_type": doc.content_type }),
        )
        .await
        .unwrap();
    assert_eq!(upload.status(), StatusCode::OK);
    let upload: UploadUrlResponse = upload.json().await.unwrap();

    app.upload(&upload.object_name, doc.body.as_bytes(), doc.content_type)
        .await;

    let response = app
        .client
        .post_json(
            "/api/v1/async/create-task",
            &json!({
                "object_name": upload.object_name,
                "original_filename": doc.filename,
                "user_id": "user-42",
            }),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    response.json().await.unwrap()
}

#[tokio::test]
async fn health_endpoints_are_public() {
    let app = spawn_app(Some(TEST_SECRET)).await;

    let response = app.client.raw(Method::GET, "/health").send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["checks"]["queue"]["status"], "ok");

    let response = app
        .client
        .raw(Method::GET, "/api/v1/async/health")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: ServiceHealthResponse = response.json().await.unwrap();
    assert_eq!(body.service, "async-markdown-converter");
    assert_eq!(body.queue_depth, Some(0));
    assert!(body.supported_formats.iter().any(|f| f == ".docx"));
    assert!(body.supported_formats.iter().any(|f| f == ".epub"));
}

#[tokio::test]
async fn unsigned_requests_are_rejected() {
    let app = spawn_app(Some(TEST_SECRET)).await;

    let response = app
        .client
        .raw(Method::GET, &format!("/api/v1/async/task/{}", Uuid::new_v4()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let body = error_body(response).await;
    assert_eq!(body.kind, ErrorKind::Unauthorized);
    assert_eq!(body.message, "Unauthorized: missing headers");
}

#[tokio::test]
async fn tampered_signature_is_rejected() {
    let app = spawn_app(Some(TEST_SECRET)).await;
    let path = "/api/v1/async/upload-url";
    let body = r#"{"filename":"report.docx"}"#;

    let (signature, timestamp) = RequestAuthenticator::new(TEST_SECRET).sign_now("POST", path, body);
    let mut tampered = signature.into_bytes();
    tampered[0] = if tampered[0] == b'0' { b'1' } else { b'0' };
    let tampered = String::from_utf8(tampered).unwrap();

    let response = app
        .client
        .raw(Method::POST, path)
        .header(SIGNATURE_HEADER, tampered)
        .header(TIMESTAMP_HEADER, timestamp.to_string())
        .header("content-type", "application/json")
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(error_body(response).await.message, "Unauthorized: bad signature");
}

#[tokio::test]
async fn body_is_covered_by_the_signature() {
    let app = spawn_app(Some(TEST_SECRET)).await;
    let path = "/api/v1/async/upload-url";

    let (signature, timestamp) = RequestAuthenticator::new(TEST_SECRET).sign_now(
        "POST",
        path,
        r#"{"filename":"report.docx"}"#,
    );

    let response = app
        .client
        .raw(Method::POST, path)
        .header(SIGNATURE_HEADER, signature)
        .header(TIMESTAMP_HEADER, timestamp.to_string())
        .header("content-type", "application/json")
        .body(r#"{"filename":"other.docx"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn stale_timestamp_is_rejected() {
    let app = spawn_app(Some(TEST_SECRET)).await;
    let path = format!("/api/v1/async/task/{}", Uuid::new_v4());
    let timestamp = chrono::Utc::now().timestamp() - 301;

    let signature = RequestAuthenticator::new(TEST_SECRET).sign(&SignatureContext {
        method: "GET",
        path: &path,
        timestamp,
        body: "",
    });

    let response = app
        .client
        .raw(Method::GET, &path)
        .header(SIGNATURE_HEADER, signature)
        .header(TIMESTAMP_HEADER, timestamp.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(error_body(response).await.message, "Unauthorized: expired");
}

#[tokio::test]
async fn upload_url_targets_the_uploads_namespace() {
    let app = spawn_app(Some(TEST_SECRET)).await;

    let response = app
        .client
        .post_json(
            "/api/v1/async/upload-url",
            &json!({ "filename": "../../Quarterly Report.DOCX" }),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body: UploadUrlResponse = response.json().await.unwrap();
    assert_eq!(body.object_name, format!("uploads/{}.docx", body.file_id));
    assert_eq!(body.expires_in, 3600);
    assert!(body.upload_url.starts_with("memory://markdown-converter/uploads/"));
}

#[tokio::test]
async fn invalid_upload_requests_are_validation_errors() {
    let app = spawn_app(Some(TEST_SECRET)).await;

    for body in [
        json!({ "filename": "setup.exe" }),
        json!({ "filename": "" }),
        json!({ "name": "report.docx" }),
    ] {
        let response = app
            .client
            .post_json("/api/v1/async/upload-url", &body)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{body}");
        assert_eq!(error_body(response).await.kind, ErrorKind::Validation);
    }
}

#[tokio::test]
async fn create_task_only_accepts_upload_keys() {
    let app = spawn_app(Some(TEST_SECRET)).await;

    for (object_name, filename) in [
        ("results/abc/report.md", "report.docx"),
        ("uploads/../secrets.pdf", "secrets.pdf"),
        ("uploads/abc.exe", "setup.exe"),
    ] {
        let response = app
            .client
            .post_json(
                "/api/v1/async/create-task",
                &json!({ "object_name": object_name, "original_filename": filename }),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{object_name}");
        assert_eq!(error_body(response).await.kind, ErrorKind::Validation);
    }
    assert_eq!(app.queue.depth().await.unwrap(), 0);
}

#[tokio::test]
async fn unknown_tasks_are_not_found() {
    let app = spawn_app(Some(TEST_SECRET)).await;

    for path in [
        format!("/api/v1/async/task/{}", Uuid::new_v4()),
        "/api/v1/async/task/not-a-task-id".to_string(),
        format!("/api/v1/async/download/{}", Uuid::new_v4()),
    ] {
        let response = app.client.get(&path).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{path}");
        assert_eq!(error_body(response).await.kind, ErrorKind::NotFound);
    }

    let response = app
        .client
        .delete(&format!("/api/v1/async/task/{}", Uuid::new_v4()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn conversion_round_trip() {
    let app = spawn_app(Some(TEST_SECRET)).await;
    let doc = document("meeting-notes.txt");

    let created = create_task(&app, doc).await;
    assert_eq!(created.status, "pending");
    assert_eq!(created.filename, doc.filename);

    let task_path = format!("/api/v1/async/task/{}", created.task_id);
    let pending: JobView = app.client.get(&task_path).await.unwrap().json().await.unwrap();
    assert_eq!(pending.status, JobStatus::Pending);
    assert_eq!(pending.progress, None);

    // Not finished yet: no result to download.
    let download_path = format!("/api/v1/async/download/{}", created.task_id);
    let response = app.client.get(&download_path).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    app.runner().drain().await.unwrap();

    let done: JobView = app.client.get(&task_path).await.unwrap().json().await.unwrap();
    assert_succeeded(&done);
    let result = done.result.unwrap();
    assert_eq!(
        result.object_key,
        format!("results/{}/{}", created.task_id, doc.expected_result)
    );
    assert_eq!(result.filename, doc.expected_result);
    assert!(done.completed_at.is_some());

    let markdown = app.storage.get(&result.object_key).await.unwrap();
    let markdown = String::from_utf8(markdown).unwrap();
    assert!(markdown.contains(doc.expected_text));
    assert_eq!(
        app.memory.content_type_of(&result.object_key).await.as_deref(),
        Some("text/markdown")
    );

    let download: DownloadResponse = app
        .client
        .get(&download_path)
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(download.filename, doc.expected_result);
    assert_eq!(download.expires_in, 3600);
    let url = url::Url::parse(&download.download_url).unwrap();
    let disposition = url
        .query_pairs()
        .find(|(k, _)| k == "response-content-disposition")
        .map(|(_, v)| v.into_owned());
    assert_eq!(
        disposition.as_deref(),
        Some(format!("attachment; filename=\"{}\"", doc.expected_result).as_str())
    );

    let deleted: DeleteTaskResponse = app
        .client
        .delete(&task_path)
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(deleted.result_removed);
    assert!(!deleted.cancelled);
    assert!(!app.storage.exists(&result.object_key).await.unwrap());

    let response = app.client.get(&task_path).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let response = app.client.get(&download_path).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn every_fixture_converts() {
    let app = spawn_app(Some(TEST_SECRET)).await;

    let mut created = Vec::new();
    for doc in TEST_DOCUMENTS {
        created.push((doc, create_task(&app, doc).await));
    }
    assert_eq!(app.queue.depth().await.unwrap(), TEST_DOCUMENTS.len() as u64);

    app.runner().drain().await.unwrap();

    for (doc, task) in created {
        let view: JobView = app
            .client
            .get(&format!("/api/v1/async/task/{}", task.task_id))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_succeeded(&view);
        assert_eq!(view.result.unwrap().filename, doc.expected_result, "{}", doc.description);
    }
}

#[tokio::test]
async fn deleting_a_queued_task_cancels_it() {
    let app = spawn_app(Some(TEST_SECRET)).await;
    let created = create_task(&app, document("inventory.csv")).await;

    let deleted: DeleteTaskResponse = app
        .client
        .delete(&format!("/api/v1/async/task/{}", created.task_id))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(deleted.cancelled);
    assert!(!deleted.result_removed);

    let processed = app.runner().drain().await.unwrap();
    assert_eq!(processed.len(), 1);
    assert_eq!(processed[0].status, None);
    assert!(!app
        .storage
        .exists(&format!("results/{}/inventory.md", created.task_id))
        .await
        .unwrap());
}

#[tokio::test]
async fn missing_upload_fails_after_retries() {
    let app = spawn_app(Some(TEST_SECRET)).await;

    let response = app
        .client
        .post_json(
            "/api/v1/async/create-task",
            &json!({
                "object_name": format!("uploads/{}.pdf", Uuid::new_v4()),
                "original_filename": "never-uploaded.pdf",
            }),
        )
        .await
        .unwrap();
    let created: CreateTaskResponse = response.json().await.unwrap();

    app.runner().drain().await.unwrap();

    let view: JobView = app
        .client
        .get(&format!("/api/v1/async/task/{}", created.task_id))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(view.status, JobStatus::Failed);
    assert_eq!(view.retry_count, 3);
    assert_eq!(view.error.unwrap().kind, ErrorKind::Exhausted);
}

#[tokio::test]
async fn signing_can_be_disabled() {
    let app = spawn_app(None).await;

    let response = app
        .client
        .raw(Method::POST, "/api/v1/async/upload-url")
        .json(&json!({ "filename": "report.pdf" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
