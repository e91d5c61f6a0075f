//! Durable execution substrate contract.
//!
//! The engine never schedules work itself. Activity dispatch, timers,
//! signals and history accounting all go through a [`Substrate`], which is
//! responsible for retries, timeouts and cancellation.
//!
//! - `run` -- ambient run metadata and typed search attributes
//! - `activity` -- activity trait, registry, request and error types
//! - `interceptor` -- side-effect-only hooks around each activity attempt
//! - `local` -- in-process substrate implementation

pub mod activity;
pub mod interceptor;
pub mod local;
pub mod run;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;

use activity::{ActivityError, ActivityRequest};
use run::RunMetadata;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubstrateError {
    #[error("run cancelled")]
    Cancelled,

    #[error("unknown run '{0}'")]
    UnknownRun(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),
}

/// What the engine requires from the durable substrate.
///
/// Uses RPITIT; see [`BoxSubstrate`] for dynamic dispatch.
pub trait Substrate: Send + Sync + 'static {
    /// Register a run so that history, signals and cancellation are tracked.
    /// Called once per run, including each continued run.
    fn begin_run(&self, run: &RunMetadata);

    /// Release bookkeeping for a run. `terminal` is false when the workflow
    /// is about to continue as new, in which case signals stay buffered.
    fn end_run(&self, run: &RunMetadata, terminal: bool);

    /// Dispatch an activity, honouring retry policy and timeouts.
    fn execute_activity(
        &self,
        run: &RunMetadata,
        request: ActivityRequest,
    ) -> impl Future<Output = Result<Value, ActivityError>> + Send;

    /// Durable timer. Returns early with `Cancelled` if the run is cancelled.
    fn sleep(
        &self,
        run: &RunMetadata,
        duration: Duration,
    ) -> impl Future<Output = Result<(), SubstrateError>> + Send;

    /// Wait for the next signal named `name`. Signals delivered before the
    /// wait started are buffered and returned in arrival order.
    fn receive_signal(
        &self,
        run: &RunMetadata,
        name: &str,
    ) -> impl Future<Output = Result<Value, SubstrateError>> + Send;

    fn continue_as_new_suggested(&self, run: &RunMetadata) -> bool;

    fn history_length(&self, run: &RunMetadata) -> u64;

    fn upsert_search_attributes(&self, run: &RunMetadata, attrs: Map<String, Value>);

    fn is_cancelled(&self, run: &RunMetadata) -> bool;
}

// ---------------------------------------------------------------------------
// Dynamic dispatch
// ---------------------------------------------------------------------------

type BoxFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Object-safe version of [`Substrate`] with boxed futures.
pub trait SubstrateDyn: Send + Sync {
    fn begin_run_dyn(&self, run: &RunMetadata);
    fn end_run_dyn(&self, run: &RunMetadata, terminal: bool);
    fn execute_activity_boxed<'a>(
        &'a self,
        run: &'a RunMetadata,
        request: ActivityRequest,
    ) -> BoxFut<'a, Result<Value, ActivityError>>;
    fn sleep_boxed<'a>(&'a self, run: &'a RunMetadata, duration: Duration) -> BoxFut<'a, Result<(), SubstrateError>>;
    fn receive_signal_boxed<'a>(
        &'a self,
        run: &'a RunMetadata,
        name: &'a str,
    ) -> BoxFut<'a, Result<Value, SubstrateError>>;
    fn continue_as_new_suggested_dyn(&self, run: &RunMetadata) -> bool;
    fn history_length_dyn(&self, run: &RunMetadata) -> u64;
    fn upsert_search_attributes_dyn(&self, run: &RunMetadata, attrs: Map<String, Value>);
    fn is_cancelled_dyn(&self, run: &RunMetadata) -> bool;
}

impl<T: Substrate> SubstrateDyn for T {
    fn begin_run_dyn(&self, run: &RunMetadata) {
        Substrate::begin_run(self, run)
    }

    fn end_run_dyn(&self, run: &RunMetadata, terminal: bool) {
        Substrate::end_run(self, run, terminal)
    }

    fn execute_activity_boxed<'a>(
        &'a self,
        run: &'a RunMetadata,
        request: ActivityRequest,
    ) -> BoxFut<'a, Result<Value, ActivityError>> {
        Box::pin(self.execute_activity(run, request))
    }

    fn sleep_boxed<'a>(&'a self, run: &'a RunMetadata, duration: Duration) -> BoxFut<'a, Result<(), SubstrateError>> {
        Box::pin(self.sleep(run, duration))
    }

    fn receive_signal_boxed<'a>(
        &'a self,
        run: &'a RunMetadata,
        name: &'a str,
    ) -> BoxFut<'a, Result<Value, SubstrateError>> {
        Box::pin(self.receive_signal(run, name))
    }

    fn continue_as_new_suggested_dyn(&self, run: &RunMetadata) -> bool {
        Substrate::continue_as_new_suggested(self, run)
    }

    fn history_length_dyn(&self, run: &RunMetadata) -> u64 {
        Substrate::history_length(self, run)
    }

    fn upsert_search_attributes_dyn(&self, run: &RunMetadata, attrs: Map<String, Value>) {
        Substrate::upsert_search_attributes(self, run, attrs)
    }

    fn is_cancelled_dyn(&self, run: &RunMetadata) -> bool {
        Substrate::is_cancelled(self, run)
    }
}

/// Type-erased, cheaply clonable substrate handle.
#[derive(Clone)]
pub struct BoxSubstrate {
    inner: Arc<dyn SubstrateDyn>,
}

impl BoxSubstrate {
    pub fn new<T: Substrate>(substrate: T) -> Self {
        Self {
            inner: Arc::new(substrate),
        }
    }

    pub fn from_arc<T: Substrate>(substrate: Arc<T>) -> Self {
        Self { inner: substrate }
    }

    pub fn begin_run(&self, run: &RunMetadata) {
        self.inner.begin_run_dyn(run)
    }

    pub fn end_run(&self, run: &RunMetadata, terminal: bool) {
        self.inner.end_run_dyn(run, terminal)
    }

    pub async fn execute_activity(
        &self,
        run: &RunMetadata,
        request: ActivityRequest,
    ) -> Result<Value, ActivityError> {
        self.inner.execute_activity_boxed(run, request).await
    }

    pub async fn sleep(&self, run: &RunMetadata, duration: Duration) -> Result<(), SubstrateError> {
        self.inner.sleep_boxed(run, duration).await
    }

    pub async fn receive_signal(&self, run: &RunMetadata, name: &str) -> Result<Value, SubstrateError> {
        self.inner.receive_signal_boxed(run, name).await
    }

    pub fn continue_as_new_suggested(&self, run: &RunMetadata) -> bool {
        self.inner.continue_as_new_suggested_dyn(run)
    }

    pub fn history_length(&self, run: &RunMetadata) -> u64 {
        self.inner.history_length_dyn(run)
    }

    pub fn upsert_search_attributes(&self, run: &RunMetadata, attrs: Map<String, Value>) {
        self.inner.upsert_search_attributes_dyn(run, attrs)
    }

    pub fn is_cancelled(&self, run: &RunMetadata) -> bool {
        self.inner.is_cancelled_dyn(run)
    }
}

impl std::fmt::Debug for BoxSubstrate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxSubstrate").finish_non_exhaustive()
    }
}
