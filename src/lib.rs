//! restkit - resilient HTTP client core for token-authenticated REST APIs
//!
//! Sits between an application and a backend HTTP service and takes care
//! of everything vendors have in common:
//! - Token lifecycle (basic-to-bearer and OAuth2 client credentials) with
//!   buffered refresh and a refresh-storm guard
//! - Semaphore-based admission control with adaptive capacity
//! - Response classification and retries with exponential backoff + jitter,
//!   honoring server rate-limit hints
//! - Streaming multipart uploads with base64 parts, progress accounting
//!   and resume-from-offset
//! - Streaming downloads into any `AsyncWrite` sink
//!
//! Vendor specifics (URL shaping, payload marshaling, response
//! deserialization, auth endpoints) live behind the [`Integration`] trait;
//! one implementation per backend is all it takes to plug a new API in.

pub mod auth;
pub mod backoff;
pub mod circuit_breaker;
pub mod client;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod integration;
pub mod multipart;
pub mod request;
pub mod response;

pub use auth::credentials::Credentials;
pub use client::{Client, ClientBuilder};
pub use concurrency::{ConcurrencyGovernor, RequestMetrics};
pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use integration::Integration;
pub use multipart::{FilePart, MultipartUpload, ProgressSink};
pub use response::ResponseCategory;
