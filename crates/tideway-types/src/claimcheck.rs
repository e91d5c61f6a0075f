//! Claim-check reference record.
//!
//! A `ClaimCheckRef` replaces an oversized payload inside execution state.
//! It is recognised structurally by its `_type` marker, so it survives a
//! round trip through arbitrary JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Marker value stored in the `_type` field of every reference.
pub const CLAIM_CHECK_REF_TYPE: &str = "claim_check_ref";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimCheckRef {
    #[serde(rename = "_type")]
    pub ref_type: String,
    /// Blob store key holding the payload.
    pub key: String,
    /// Size of the stored bytes (after compression, if any).
    pub size_bytes: u64,
    pub compressed: bool,
    pub stored_at: DateTime<Utc>,
}

impl ClaimCheckRef {
    pub fn new(key: String, size_bytes: u64, compressed: bool) -> Self {
        Self {
            ref_type: CLAIM_CHECK_REF_TYPE.to_string(),
            key,
            size_bytes,
            compressed,
            stored_at: Utc::now(),
        }
    }

    /// True if `value` looks like a serialized reference.
    pub fn is_ref(value: &Value) -> bool {
        value
            .get("_type")
            .and_then(Value::as_str)
            .is_some_and(|t| t == CLAIM_CHECK_REF_TYPE)
    }

    /// Decode a reference from a JSON value, or `None` for ordinary data.
    pub fn from_value(value: &Value) -> Option<Self> {
        if !Self::is_ref(value) {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
