//! Pending tool-call confirmations and the per-stream notification sinks
//! used to tell a streaming caller that a decision is needed.
//!
//! A tool call that needs approval is registered under an operation id and
//! the engine parks on the returned oneshot receiver. Any other task may later
//! resolve it exactly once, or force every pending entry to `Quit` with
//! [`ConfirmationRegistry::reset_all`].

use crate::tools::{ConfirmationGate, ConfirmationOutcome};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

const NOTIFICATION_BUFFER: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallNotification {
    pub operation_id: String,
    pub function_name: String,
    pub arguments: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSummary {
    pub operation_id: String,
    pub function_name: String,
    pub arguments: String,
}

struct PendingOperation {
    function_name: String,
    arguments: String,
    decision: oneshot::Sender<ConfirmationOutcome>,
}

#[derive(Default)]
pub struct ConfirmationRegistry {
    pending: Mutex<HashMap<String, PendingOperation>>,
    sinks: Mutex<HashMap<String, mpsc::Sender<ToolCallNotification>>>,
}

impl ConfirmationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pending operation and returns the receiver its decision
    /// will arrive on. Re-registering an id drops the previous waiter, which
    /// then observes a closed channel.
    pub async fn register(
        &self,
        operation_id: &str,
        function_name: &str,
        arguments: &str,
    ) -> oneshot::Receiver<ConfirmationOutcome> {
        let (decision, receiver) = oneshot::channel();
        let previous = self.pending.lock().await.insert(
            operation_id.to_string(),
            PendingOperation {
                function_name: function_name.to_string(),
                arguments: arguments.to_string(),
                decision,
            },
        );

        if previous.is_some() {
            warn!(operation_id = %operation_id, "replaced pending operation with the same id");
        }
        info!(operation_id = %operation_id, tool = %function_name, "operation awaiting confirmation");
        receiver
    }

    /// Delivers `outcome` to the waiter of `operation_id`. Returns false when
    /// the id is unknown, was already resolved, or nobody waits on it anymore.
    pub async fn resolve(&self, operation_id: &str, outcome: ConfirmationOutcome) -> bool {
        let Some(operation) = self.pending.lock().await.remove(operation_id) else {
            warn!(operation_id = %operation_id, "operation not found");
            return false;
        };

        if operation.decision.send(outcome).is_err() {
            warn!(operation_id = %operation_id, "waiter went away before the decision arrived");
            return false;
        }
        info!(
            operation_id = %operation_id,
            tool = %operation.function_name,
            outcome = %outcome,
            "operation resolved"
        );
        true
    }

    /// Resolves every pending operation with `Quit` and returns how many there were.
    pub async fn reset_all(&self) -> usize {
        let drained: Vec<(String, PendingOperation)> =
            self.pending.lock().await.drain().collect();
        let mut count = 0;

        for (operation_id, operation) in drained {
            if operation.decision.send(ConfirmationOutcome::Quit).is_err() {
                debug!(operation_id = %operation_id, "waiter went away before reset");
            } else {
                count += 1;
            }
        }

        info!(count, "pending operations cancelled");
        count
    }

    pub async fn pending(&self) -> Vec<PendingSummary> {
        let mut pending = self.pending.lock().await;
        prune_abandoned(&mut pending);
        let mut summaries: Vec<PendingSummary> = pending
            .iter()
            .map(|(operation_id, operation)| PendingSummary {
                operation_id: operation_id.clone(),
                function_name: operation.function_name.clone(),
                arguments: operation.arguments.clone(),
            })
            .collect();
        summaries.sort_by(|a, b| a.operation_id.cmp(&b.operation_id));
        summaries
    }

    pub async fn len(&self) -> usize {
        let mut pending = self.pending.lock().await;
        prune_abandoned(&mut pending);
        pending.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Removes `operation_id` once its waiting future is dropped before a
    /// decision arrives.
    fn forget_abandoned(&self, operation_id: &str) {
        match self.pending.try_lock() {
            Ok(mut pending) => {
                if pending.remove(operation_id).is_some() {
                    debug!(operation_id = %operation_id, "abandoned operation removed");
                }
            }
            // Left for the next `pending`/`len` call to prune.
            Err(_) => debug!(operation_id = %operation_id, "registry busy, abandoned operation kept"),
        }
    }

    /// Attaches the notification sink for `sink_key`, replacing any earlier
    /// one. Streams use a key of their own so concurrent streams of one
    /// session never share or detach each other's sink.
    pub async fn attach_sink(&self, sink_key: &str) -> mpsc::Receiver<ToolCallNotification> {
        let (sender, receiver) = mpsc::channel(NOTIFICATION_BUFFER);
        if self
            .sinks
            .lock()
            .await
            .insert(sink_key.to_string(), sender)
            .is_some()
        {
            warn!(sink_key = %sink_key, "replaced notification sink");
        }
        receiver
    }

    pub async fn detach_sink(&self, sink_key: &str) {
        self.sinks.lock().await.remove(sink_key);
    }

    /// Pushes a notification to the sink of `sink_key`. Returns false when no
    /// sink is attached or it cannot take the event.
    pub async fn notify(&self, sink_key: &str, notification: ToolCallNotification) -> bool {
        let sinks = self.sinks.lock().await;
        let Some(sink) = sinks.get(sink_key) else {
            debug!(sink_key = %sink_key, "no notification sink attached");
            return false;
        };

        match sink.try_send(notification) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(sink_key = %sink_key, "notification sink full, dropping event");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(sink_key = %sink_key, "notification sink closed");
                false
            }
        }
    }
}

fn prune_abandoned(pending: &mut HashMap<String, PendingOperation>) {
    pending.retain(|operation_id, operation| {
        let alive = !operation.decision.is_closed();
        if !alive {
            debug!(operation_id = %operation_id, "pruned abandoned operation");
        }
        alive
    });
}

/// Forgets the operation when the waiting future is dropped undecided.
struct AbandonGuard<'a> {
    registry: &'a ConfirmationRegistry,
    operation_id: &'a str,
    decided: bool,
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        if !self.decided {
            self.registry.forget_abandoned(self.operation_id);
        }
    }
}

pub fn new_operation_id() -> String {
    format!("op_{}", Uuid::new_v4().simple())
}

/// Confirmation gate backed by the registry: the decision comes from
/// whoever resolves the operation id, typically an HTTP caller.
pub struct RegistryGate {
    registry: Arc<ConfirmationRegistry>,
    sink_key: String,
}

impl RegistryGate {
    pub fn new(registry: Arc<ConfirmationRegistry>, sink_key: impl Into<String>) -> Self {
        Self {
            registry,
            sink_key: sink_key.into(),
        }
    }
}

#[async_trait]
impl ConfirmationGate for RegistryGate {
    async fn confirm(&self, name: &str, arguments: &str) -> ConfirmationOutcome {
        let operation_id = new_operation_id();
        let decision = self.registry.register(&operation_id, name, arguments).await;
        let mut guard = AbandonGuard {
            registry: &self.registry,
            operation_id: &operation_id,
            decided: false,
        };

        let notification = ToolCallNotification {
            operation_id: operation_id.clone(),
            function_name: name.to_string(),
            arguments: arguments.to_string(),
            message: format!("Tool call detected: {}", name),
        };
        self.registry.notify(&self.sink_key, notification).await;

        let decision = decision.await;
        guard.decided = true;
        match decision {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(operation_id = %operation_id, "decision channel dropped, treating as quit");
                ConfirmationOutcome::Quit
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_delivers_outcome_exactly_once() {
        let registry = ConfirmationRegistry::new();
        let receiver = registry.register("op_1", "calculate_sum", "{}").await;

        assert!(registry.resolve("op_1", ConfirmationOutcome::Confirmed).await);
        assert_eq!(receiver.await.unwrap(), ConfirmationOutcome::Confirmed);

        assert!(!registry.resolve("op_1", ConfirmationOutcome::Denied).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn unknown_id_leaves_other_entries_untouched() {
        let registry = ConfirmationRegistry::new();
        let _a = registry.register("op_a", "one", "{}").await;
        let _b = registry.register("op_b", "two", "{}").await;

        assert!(!registry.resolve("op_missing", ConfirmationOutcome::Confirmed).await);
        assert_eq!(registry.len().await, 2);

        let pending = registry.pending().await;
        assert_eq!(pending[0].operation_id, "op_a");
        assert_eq!(pending[1].function_name, "two");
    }

    #[tokio::test]
    async fn reset_all_quits_every_pending_operation() {
        let registry = ConfirmationRegistry::new();
        let receivers = vec![
            registry.register("op_1", "a", "{}").await,
            registry.register("op_2", "b", "{}").await,
            registry.register("op_3", "c", "{}").await,
        ];

        assert_eq!(registry.reset_all().await, 3);
        assert!(registry.is_empty().await);
        for receiver in receivers {
            assert_eq!(receiver.await.unwrap(), ConfirmationOutcome::Quit);
        }
        assert_eq!(registry.reset_all().await, 0);
    }

    #[tokio::test]
    async fn operations_without_a_waiter_are_not_pending() {
        let registry = ConfirmationRegistry::new();
        drop(registry.register("op_1", "a", "{}").await);
        let _live = registry.register("op_2", "b", "{}").await;

        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.pending().await[0].operation_id, "op_2");
        assert!(!registry.resolve("op_1", ConfirmationOutcome::Confirmed).await);

        drop(registry.register("op_3", "c", "{}").await);
        assert!(!registry.resolve("op_3", ConfirmationOutcome::Confirmed).await);
        assert_eq!(registry.reset_all().await, 1);
    }

    #[tokio::test]
    async fn aborted_confirmation_is_forgotten() {
        let registry = Arc::new(ConfirmationRegistry::new());
        let mut sink = registry.attach_sink("session").await;
        let gate = RegistryGate::new(Arc::clone(&registry), "session");

        let waiter = tokio::spawn(async move { gate.confirm("calculate_sum", "{}").await });
        let notification = sink.recv().await.unwrap();
        assert_eq!(registry.len().await, 1);

        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());

        assert!(registry.pending().await.is_empty());
        assert!(
            !registry
                .resolve(&notification.operation_id, ConfirmationOutcome::Confirmed)
                .await
        );
    }

    #[tokio::test]
    async fn notifications_are_scoped_to_the_session() {
        let registry = ConfirmationRegistry::new();
        let mut first = registry.attach_sink("s1").await;
        let _second = registry.attach_sink("s2").await;

        let notification = ToolCallNotification {
            operation_id: "op_1".to_string(),
            function_name: "a".to_string(),
            arguments: "{}".to_string(),
            message: "Tool call detected: a".to_string(),
        };
        assert!(registry.notify("s1", notification.clone()).await);
        assert_eq!(first.recv().await.unwrap(), notification);

        assert!(!registry.notify("unknown", notification.clone()).await);

        registry.detach_sink("s1").await;
        assert!(!registry.notify("s1", notification).await);
        assert!(first.recv().await.is_none());
    }

    #[tokio::test]
    async fn stream_sinks_of_one_session_are_independent() {
        let registry = ConfirmationRegistry::new();
        let _first = registry.attach_sink("s1/a").await;
        let mut second = registry.attach_sink("s1/b").await;

        registry.detach_sink("s1/a").await;

        let notification = ToolCallNotification {
            operation_id: "op_1".to_string(),
            function_name: "a".to_string(),
            arguments: "{}".to_string(),
            message: "Tool call detected: a".to_string(),
        };
        assert!(registry.notify("s1/b", notification.clone()).await);
        assert_eq!(second.recv().await.unwrap(), notification);
    }

    #[tokio::test]
    async fn registry_gate_notifies_then_waits_for_decision() {
        let registry = Arc::new(ConfirmationRegistry::new());
        let mut sink = registry.attach_sink("session").await;
        let gate = RegistryGate::new(Arc::clone(&registry), "session");

        let waiter = tokio::spawn(async move { gate.confirm("calculate_sum", r#"{"a":1}"#).await });

        let notification = sink.recv().await.unwrap();
        assert_eq!(notification.function_name, "calculate_sum");
        assert_eq!(notification.message, "Tool call detected: calculate_sum");
        assert!(notification.operation_id.starts_with("op_"));

        assert!(
            registry
                .resolve(&notification.operation_id, ConfirmationOutcome::Denied)
                .await
        );
        assert_eq!(waiter.await.unwrap(), ConfirmationOutcome::Denied);
    }

    #[tokio::test]
    async fn registry_gate_returns_quit_on_reset() {
        let registry = Arc::new(ConfirmationRegistry::new());
        let mut sink = registry.attach_sink("session").await;
        let gate = RegistryGate::new(Arc::clone(&registry), "session");

        let waiter = tokio::spawn(async move { gate.confirm("say_hello", "{}").await });
        sink.recv().await.unwrap();

        assert_eq!(registry.reset_all().await, 1);
        assert_eq!(waiter.await.unwrap(), ConfirmationOutcome::Quit);
    }
}
