//! Activity interceptors.
//!
//! Interceptors observe every activity attempt the substrate runs. They get
//! a start hook and a finish hook and nothing else: they can perform side
//! effects but have no way to alter inputs, results or control flow.

use futures_util::future::BoxFuture;
use serde_json::Value;

use super::activity::{ActivityError, ActivityInfo};

pub trait ActivityInterceptor: Send + Sync {
    /// Called after the attempt acquired its lane, before the activity runs.
    fn on_start<'a>(&'a self, info: &'a ActivityInfo) -> BoxFuture<'a, ()>;

    /// Called once the attempt produced a result (including timeouts).
    fn on_finish<'a>(
        &'a self,
        info: &'a ActivityInfo,
        outcome: Result<&'a Value, &'a ActivityError>,
    ) -> BoxFuture<'a, ()>;
}
