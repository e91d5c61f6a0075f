//! Execution status plumbing.
//!
//! - `stream` -- per-execution fan-out of status snapshots
//! - `status` -- merge and persist partial status updates
//! - `progress` -- activity interceptor that reports task transitions

pub mod progress;
pub mod status;
pub mod stream;

pub use progress::ProgressInterceptor;
pub use status::{StatusError, StatusMerger, StatusReporter, UpdateStatusActivity, merge_status};
pub use stream::{StreamBroker, Subscription};
