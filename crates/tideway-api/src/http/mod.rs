//! HTTP/REST API layer for Tideway.
//!
//! Axum-based REST API at `/api/v1/` with envelope response format, SSE
//! status streams and CORS support.

pub mod error;
pub mod handlers;
pub mod response;
pub mod router;
