//! Undertow Web - REST API server

#![warn(clippy::missing_errors_doc)]
#![deny(clippy::missing_panics_doc)]
#![warn(clippy::too_many_lines)]
//!
//! JSON API for managing downloads and streaming their files over HTTP
//! range requests.

pub mod error;
pub mod handlers;
pub mod range;
pub mod server;

// Re-export main types
pub use error::ApiError;
pub use server::{AppState, router, run_server};
