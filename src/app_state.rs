use std::sync::Arc;

use crate::services::{auth::RequestAuthenticator, queue::JobQueue, storage::StorageGateway};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub storage: StorageGateway,
    pub queue: JobQueue,
    /// `None` when request signing is switched off.
    pub auth: Option<Arc<RequestAuthenticator>>,
}

impl AppState {
    pub fn new(
        storage: StorageGateway,
        queue: JobQueue,
        auth: Option<RequestAuthenticator>,
    ) -> Self {
        Self {
            storage,
            queue,
            auth: auth.map(Arc::new),
        }
    }
}
