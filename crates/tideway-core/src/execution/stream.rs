//! Per-execution status broadcast.
//!
//! Each subscriber owns a bounded channel. Broadcasting never blocks: a
//! subscriber whose channel is full misses that update and nobody else is
//! affected.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use tideway_types::execution::WorkflowExecution;
use tokio::sync::mpsc;

/// Buffered updates per subscriber.
pub const SUBSCRIBER_CAPACITY: usize = 100;

/// Receiving side handed to a subscriber.
#[derive(Debug)]
pub struct Subscription {
    pub id: u64,
    pub execution_id: String,
    pub receiver: mpsc::Receiver<WorkflowExecution>,
}

type Senders = Vec<(u64, mpsc::Sender<WorkflowExecution>)>;

#[derive(Default)]
pub struct StreamBroker {
    subscribers: RwLock<HashMap<String, Senders>>,
    next_id: AtomicU64,
}

impl StreamBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, execution_id: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut subs = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        subs.entry(execution_id.to_string()).or_default().push((id, tx));
        tracing::debug!(execution_id, subscription_id = id, "stream subscriber added");
        Subscription {
            id,
            execution_id: execution_id.to_string(),
            receiver: rx,
        }
    }

    /// Close one subscription. Removing the last subscriber drops the entry.
    pub fn unsubscribe(&self, execution_id: &str, subscription_id: u64) {
        let mut subs = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(senders) = subs.get_mut(execution_id) {
            senders.retain(|(id, _)| *id != subscription_id);
            if senders.is_empty() {
                subs.remove(execution_id);
            }
        }
    }

    /// Deliver a snapshot to every subscriber of its execution.
    pub fn broadcast(&self, execution: &WorkflowExecution) {
        let execution_id = execution.id.to_string();
        let mut closed = Vec::new();
        {
            let subs = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
            let Some(senders) = subs.get(&execution_id) else {
                return;
            };
            for (id, tx) in senders {
                match tx.try_send(execution.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!(
                            execution_id = %execution_id,
                            subscription_id = id,
                            "subscriber channel full, dropping status update"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }
        for id in closed {
            self.unsubscribe(&execution_id, id);
        }
    }

    pub fn subscriber_count(&self, execution_id: &str) -> usize {
        let subs = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
        subs.get(execution_id).map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for StreamBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let subs = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("StreamBroker")
            .field("executions", &subs.len())
            .finish()
    }
}
