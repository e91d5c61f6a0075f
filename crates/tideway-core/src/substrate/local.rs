//! In-process substrate.
//!
//! Serves registered activities on semaphore-bounded task queue lanes,
//! applies retry policy and timeouts per attempt, runs interceptors around
//! every attempt, buffers signals per workflow and counts history events so
//! long runs can continue as new.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::{Notify, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::activity::{
    ActivityContext, ActivityError, ActivityInfo, ActivityRegistry, ActivityRequest, BoxActivity,
    activity_id, error_type,
};
use super::interceptor::ActivityInterceptor;
use super::run::RunMetadata;
use super::{Substrate, SubstrateError};
use crate::workflow::options::ActivityOptions;

/// History events recorded per activity dispatch (scheduled, started, completed).
const EVENTS_PER_ACTIVITY: u64 = 3;
/// History events recorded per timer (started, fired).
const EVENTS_PER_TIMER: u64 = 2;
/// History events recorded per received signal.
const EVENTS_PER_SIGNAL: u64 = 1;

#[derive(Debug, Clone)]
pub struct LocalSubstrateConfig {
    /// Concurrent activity attempts per lane.
    pub max_concurrency: usize,
    /// History length at which continue-as-new is suggested.
    pub suggest_continue_as_new_at: u64,
}

impl Default for LocalSubstrateConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            suggest_continue_as_new_at: 10_000,
        }
    }
}

/// Per-workflow bookkeeping. Survives continue-as-new.
#[derive(Default)]
struct RunSlot {
    history: AtomicU64,
    signals: Mutex<HashMap<String, VecDeque<Value>>>,
    signal_arrived: Notify,
    cancel: CancellationToken,
    search_attributes: Mutex<Map<String, Value>>,
}

impl RunSlot {
    fn record(&self, events: u64) {
        self.history.fetch_add(events, Ordering::Relaxed);
    }

    fn take_signal(&self, name: &str) -> Option<Value> {
        let mut signals = self.signals.lock().unwrap_or_else(|e| e.into_inner());
        signals.get_mut(name).and_then(VecDeque::pop_front)
    }

    fn push_signal(&self, name: &str, payload: Value) {
        {
            let mut signals = self.signals.lock().unwrap_or_else(|e| e.into_inner());
            signals.entry(name.to_string()).or_default().push_back(payload);
        }
        self.signal_arrived.notify_waiters();
    }
}

pub struct LocalSubstrate {
    registry: ActivityRegistry,
    config: LocalSubstrateConfig,
    lanes: DashMap<String, Arc<Semaphore>>,
    runs: DashMap<String, Arc<RunSlot>>,
    interceptors: Vec<Arc<dyn ActivityInterceptor>>,
}

impl LocalSubstrate {
    pub fn new(registry: ActivityRegistry, config: LocalSubstrateConfig) -> Self {
        Self {
            registry,
            config,
            lanes: DashMap::new(),
            runs: DashMap::new(),
            interceptors: Vec::new(),
        }
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn ActivityInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn registry(&self) -> &ActivityRegistry {
        &self.registry
    }

    /// Make a workflow known before its first run starts, so that signals
    /// and cancellation sent in the meantime are not lost. Idempotent.
    pub fn open_run(&self, workflow_id: &str) {
        self.slot(workflow_id);
    }

    /// Deliver a signal to a workflow. Buffered until a listener takes it.
    pub fn signal(&self, workflow_id: &str, name: &str, payload: Value) -> Result<(), SubstrateError> {
        let slot = self
            .runs
            .get(workflow_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| SubstrateError::UnknownRun(workflow_id.to_string()))?;
        tracing::debug!(workflow_id, signal = name, "signal delivered");
        slot.push_signal(name, payload);
        Ok(())
    }

    /// Cancel a workflow. Returns false if the workflow is unknown.
    pub fn cancel(&self, workflow_id: &str) -> bool {
        match self.runs.get(workflow_id) {
            Some(slot) => {
                tracing::info!(workflow_id, "cancelling run");
                slot.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Custom search attributes upserted by a workflow.
    pub fn search_attributes(&self, workflow_id: &str) -> Option<Map<String, Value>> {
        self.runs.get(workflow_id).map(|slot| {
            slot.search_attributes
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
        })
    }

    fn slot(&self, workflow_id: &str) -> Arc<RunSlot> {
        Arc::clone(
            self.runs
                .entry(workflow_id.to_string())
                .or_insert_with(|| Arc::new(RunSlot::default()))
                .value(),
        )
    }

    fn lane(&self, queue: &str) -> Arc<Semaphore> {
        Arc::clone(
            self.lanes
                .entry(queue.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.config.max_concurrency.max(1))))
                .value(),
        )
    }

    async fn run_attempt(
        &self,
        activity: &BoxActivity,
        lane: &Arc<Semaphore>,
        slot: &RunSlot,
        info: ActivityInfo,
        input: Value,
        options: &ActivityOptions,
        deadline: Option<Instant>,
    ) -> Result<Value, ActivityError> {
        let acquire = Arc::clone(lane).acquire_owned();
        let permit = match options.schedule_to_start {
            Some(limit) => tokio::time::timeout(limit, acquire)
                .await
                .map_err(|_| ActivityError::timeout("schedule-to-start"))?,
            None => acquire.await,
        }
        .map_err(|_| ActivityError::non_retryable(error_type::RUNTIME, "task queue closed"))?;

        for interceptor in &self.interceptors {
            interceptor.on_start(&info).await;
        }

        let mut limit = options.start_to_close;
        if let Some(deadline) = deadline {
            limit = limit.min(deadline.saturating_duration_since(Instant::now()));
        }

        let ctx = ActivityContext {
            info: info.clone(),
            cancel: slot.cancel.child_token(),
        };
        let result = tokio::select! {
            res = tokio::time::timeout(limit, activity.execute(ctx, input)) => {
                res.unwrap_or_else(|_| Err(ActivityError::timeout("start-to-close")))
            }
            _ = slot.cancel.cancelled() => Err(ActivityError::cancelled()),
        };
        drop(permit);

        for interceptor in &self.interceptors {
            interceptor.on_finish(&info, result.as_ref()).await;
        }
        result
    }
}

impl Substrate for LocalSubstrate {
    fn begin_run(&self, run: &RunMetadata) {
        let slot = self.slot(&run.workflow_id);
        slot.history.store(0, Ordering::Relaxed);
        tracing::debug!(workflow_id = %run.workflow_id, run_id = %run.run_id, "run started");
    }

    fn end_run(&self, run: &RunMetadata, terminal: bool) {
        if terminal {
            self.runs.remove(&run.workflow_id);
        }
        tracing::debug!(workflow_id = %run.workflow_id, run_id = %run.run_id, terminal, "run ended");
    }

    async fn execute_activity(
        &self,
        run: &RunMetadata,
        request: ActivityRequest,
    ) -> Result<Value, ActivityError> {
        let Some(entry) = self.registry.get(&request.activity_type) else {
            return Err(ActivityError::non_retryable(
                error_type::NOT_REGISTERED,
                format!("activity '{}' is not registered", request.activity_type),
            ));
        };

        let slot = self.slot(&run.workflow_id);
        let queue = request
            .options
            .task_queue
            .clone()
            .unwrap_or_else(|| entry.task_queue.clone());
        let lane = self.lane(&queue);
        let scheduled_at = Utc::now();
        let id = activity_id(&request.task_name, scheduled_at);
        let deadline = request.options.schedule_to_close.map(|d| Instant::now() + d);
        slot.record(EVENTS_PER_ACTIVITY);

        let mut run_meta = run.clone();
        run_meta.search_attributes.custom.extend(
            slot.search_attributes
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        );

        let mut attempt = 0;
        loop {
            attempt += 1;
            let info = ActivityInfo {
                activity_id: id.clone(),
                activity_type: request.activity_type.clone(),
                task_queue: queue.clone(),
                attempt,
                scheduled_at,
                start_to_close: request.options.start_to_close,
                run: run_meta.clone(),
            };

            let err = match self
                .run_attempt(
                    &entry.activity,
                    &lane,
                    &slot,
                    info,
                    request.input.clone(),
                    &request.options,
                    deadline,
                )
                .await
            {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if err.is_cancelled()
                || !request
                    .options
                    .retry
                    .should_retry(attempt, &err.error_type, err.non_retryable)
            {
                return Err(err);
            }

            let delay = request.options.retry.delay_for_attempt(attempt);
            if deadline.is_some_and(|d| Instant::now() + delay >= d) {
                return Err(ActivityError {
                    message: format!("schedule-to-close deadline reached after {attempt} attempts: {}", err.message),
                    ..err
                });
            }

            tracing::warn!(
                activity = %request.activity_type,
                activity_id = %id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "activity attempt failed, retrying"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = slot.cancel.cancelled() => return Err(ActivityError::cancelled()),
            }
        }
    }

    async fn sleep(&self, run: &RunMetadata, duration: Duration) -> Result<(), SubstrateError> {
        let slot = self.slot(&run.workflow_id);
        slot.record(EVENTS_PER_TIMER);
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = slot.cancel.cancelled() => Err(SubstrateError::Cancelled),
        }
    }

    async fn receive_signal(&self, run: &RunMetadata, name: &str) -> Result<Value, SubstrateError> {
        let slot = self.slot(&run.workflow_id);
        loop {
            let notified = slot.signal_arrived.notified();
            tokio::pin!(notified);
            // Register interest before checking the buffer so a signal pushed
            // in between is not missed.
            notified.as_mut().enable();

            if let Some(payload) = slot.take_signal(name) {
                slot.record(EVENTS_PER_SIGNAL);
                return Ok(payload);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = slot.cancel.cancelled() => return Err(SubstrateError::Cancelled),
            }
        }
    }

    fn continue_as_new_suggested(&self, run: &RunMetadata) -> bool {
        self.history_length(run) >= self.config.suggest_continue_as_new_at
    }

    fn history_length(&self, run: &RunMetadata) -> u64 {
        self.runs
            .get(&run.workflow_id)
            .map(|slot| slot.history.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn upsert_search_attributes(&self, run: &RunMetadata, attrs: Map<String, Value>) {
        let slot = self.slot(&run.workflow_id);
        slot.search_attributes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(attrs);
    }

    fn is_cancelled(&self, run: &RunMetadata) -> bool {
        self.runs
            .get(&run.workflow_id)
            .is_some_and(|slot| slot.cancel.is_cancelled())
    }
}
