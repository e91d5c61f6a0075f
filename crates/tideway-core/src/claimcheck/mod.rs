//! Claim-check pattern for oversized workflow payloads.
//!
//! - `store` -- blob store trait and type-erased wrapper
//! - `compress` -- gzip helpers
//! - `manager` -- threshold decisions, offload and retrieval
//! - `activity` -- offload/retrieve as substrate activities

pub mod activity;
pub mod compress;
pub mod manager;
pub mod store;

use thiserror::Error;
use tideway_types::error::BlobStoreError;

pub use manager::{ClaimCheckManager, ClaimCheckMetrics, Payload};
pub use store::{BlobStore, BoxBlobStore};

#[derive(Debug, Error)]
pub enum ClaimCheckError {
    #[error("claim-check is disabled")]
    Disabled,

    #[error("blob store error: {0}")]
    Store(#[from] BlobStoreError),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}
