//! Test helper utilities: a signing HTTP client, an in-process server and a
//! stand-in conversion engine.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use md_convert_async::{
    app_state::AppState,
    models::job::{JobStatus, JobView},
    routes,
    services::{
        auth::{RequestAuthenticator, SIGNATURE_HEADER, TIMESTAMP_HEADER},
        converter::{ConversionError, ConvertOptions, Converter},
        lifecycle::{JobRunner, RetryPolicy},
        queue::{JobQueue, MemoryJobBackend},
        storage::{MemoryStorage, StorageGateway},
    },
};
use serde::Serialize;
use tokio::time::sleep;

pub const TEST_SECRET: &str = "test-shared-secret";

/// HTTP client that signs every request the way API clients must.
#[derive(Clone)]
pub struct SignedClient {
    pub client: reqwest::Client,
    pub base_url: String,
    auth: Option<Arc<RequestAuthenticator>>,
}

impl SignedClient {
    pub fn new(base_url: impl Into<String>, secret: Option<&str>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            auth: secret.map(|s| Arc::new(RequestAuthenticator::new(s))),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str, body: String) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method.clone(), format!("{}{}", self.base_url, path));
        if let Some(auth) = &self.auth {
            let (signature, timestamp) = auth.sign_now(method.as_str(), path, &body);
            builder = builder
                .header(SIGNATURE_HEADER, signature)
                .header(TIMESTAMP_HEADER, timestamp.to_string());
        }
        if !body.is_empty() {
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
        }
        builder
    }

    pub async fn get(&self, path: &str) -> reqwest::Result<reqwest::Response> {
        self.request(reqwest::Method::GET, path, String::new())
            .send()
            .await
    }

    pub async fn delete(&self, path: &str) -> reqwest::Result<reqwest::Response> {
        self.request(reqwest::Method::DELETE, path, String::new())
            .send()
            .await
    }

    pub async fn post_json<T: Serialize>(
        &self,
        path: &str,
        body: &T,
    ) -> reqwest::Result<reqwest::Response> {
        let body = serde_json::to_string(body).expect("request body serializes");
        self.request(reqwest::Method::POST, path, body).send().await
    }

    /// Unsigned request, for exercising the authenticator.
    pub fn raw(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client.request(method, format!("{}{}", self.base_url, path))
    }
}

/// Turns any text document into markdown by prefixing a heading.
pub struct EchoConverter;

#[async_trait::async_trait]
impl Converter for EchoConverter {
    async fn convert(&self, path: &Path, _: ConvertOptions) -> Result<String, ConversionError> {
        let text = tokio::fs::read_to_string(path).await?;
        Ok(format!("# Converted\n\n{text}"))
    }
}

/// API server on an ephemeral port, wired to in-memory backends.
pub struct TestApp {
    pub client: SignedClient,
    pub memory: Arc<MemoryStorage>,
    pub storage: StorageGateway,
    pub backend: Arc<MemoryJobBackend>,
    pub queue: JobQueue,
}

impl TestApp {
    /// Worker-side runner sharing this app's queue and storage.
    pub fn runner(&self) -> JobRunner {
        JobRunner::new(self.backend.clone(), self.storage.clone(), Arc::new(EchoConverter))
            .with_retry_policy(RetryPolicy {
                base_delay: Duration::ZERO,
                ..RetryPolicy::linear()
            })
    }

    /// Stand-in for the client's direct upload through a presigned URL.
    pub async fn upload(&self, object_name: &str, body: &[u8], content_type: &str) {
        self.storage
            .put(object_name, body, content_type)
            .await
            .expect("upload to memory storage");
    }
}

pub async fn spawn_app(secret: Option<&str>) -> TestApp {
    let memory = Arc::new(MemoryStorage::new("markdown-converter"));
    let storage = StorageGateway::new(memory.clone(), Duration::from_secs(3600));
    let backend = Arc::new(MemoryJobBackend::new(Duration::from_secs(3600)));
    let queue = JobQueue::new(backend.clone());

    let auth = secret.map(|s| {
        RequestAuthenticator::new(s).with_exempt_paths(routes::PUBLIC_PATHS.iter().copied())
    });
    let app = routes::app(AppState::new(storage.clone(), queue.clone(), auth), None);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local address");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("test server");
    });

    TestApp {
        client: SignedClient::new(format!("http://{addr}"), secret),
        memory,
        storage,
        backend,
        queue,
    }
}

/// Poll a task until it reaches a terminal status or `timeout_secs` passes.
pub async fn wait_for_task(
    client: &SignedClient,
    task_id: &str,
    timeout_secs: u64,
) -> Result<JobView, Box<dyn std::error::Error>> {
    let max_attempts = timeout_secs * 2; // Poll every 500ms

    for attempt in 0..max_attempts {
        let response = client
            .get(&format!("/api/v1/async/task/{task_id}"))
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await?;
            return Err(format!("Status check failed: {error_text}").into());
        }

        let view = response.json::<JobView>().await?;
        if view.status.is_terminal() {
            return Ok(view);
        }
        if attempt % 10 == 0 && attempt > 0 {
            println!(
                "  ... still {} at {:?}% (attempt {attempt}/{max_attempts})",
                view.status, view.progress
            );
        }
        sleep(Duration::from_millis(500)).await;
    }

    Err(format!("Task did not finish within {timeout_secs} seconds").into())
}

pub fn assert_succeeded(view: &JobView) {
    assert_eq!(
        view.status,
        JobStatus::Succeeded,
        "task {} ended as {} with error {:?}",
        view.task_id,
        view.status,
        view.error
    );
    assert!(view.result.is_some());
    assert!(view.error.is_none());
}
