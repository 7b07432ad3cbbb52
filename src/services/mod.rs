pub mod auth;
pub mod converter;
pub mod lifecycle;
pub mod queue;
pub mod storage;
