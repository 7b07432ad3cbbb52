//! Asynchronous document-to-markdown conversion service.
//!
//! Clients upload documents straight to S3-compatible storage through
//! presigned URLs, enqueue a conversion job, poll its status and fetch a
//! signed download link for the markdown result. Jobs are executed by the
//! `worker` binary, which drives each one through
//! [`services::lifecycle::JobRunner`].

pub mod app_state;
pub mod config;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
