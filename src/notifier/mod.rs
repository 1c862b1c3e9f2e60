//! Notifier channel (component D): a bounded in-memory queue paired with a
//! run-loop that drains it and transmits to one outbound transport.

pub mod telegram;

use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::registry::{CommandId, TaskId};
use crate::id::InstanceId;

/// Identifier of a notifier channel, e.g. `"tg1"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NotifierId(String);

impl NotifierId {
    pub fn new(id: impl Into<String>) -> Result<Self, NotifierError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(NotifierError::InvalidInput(
                "notifier id must not be blank".into(),
            ));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NotifierId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifierError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// A human-readable outbound message, as dispatched by the task runtime or
/// the ad-hoc HTTP intake.
#[derive(Debug, Clone)]
pub struct Notification {
    pub notifier_id: Option<NotifierId>,
    pub task_id: Option<TaskId>,
    pub command_id: Option<CommandId>,
    pub instance_id: Option<InstanceId>,
    pub title: Option<String>,
    pub message: String,
    pub elapsed: Duration,
    pub error_occurred: bool,
    pub cancelable: bool,
}

impl Notification {
    pub fn validate(&self) -> Result<(), NotifierError> {
        if self.message.is_empty() {
            return Err(NotifierError::InvalidInput(
                "notification message must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Builds a bare error notification, as emitted by the engine itself
    /// (task-not-supported, already-running, cancel acks, and so on).
    pub fn error(notifier_id: Option<NotifierId>, message: impl Into<String>) -> Self {
        Self {
            notifier_id,
            task_id: None,
            command_id: None,
            instance_id: None,
            title: None,
            message: message.into(),
            elapsed: Duration::ZERO,
            error_occurred: true,
            cancelable: false,
        }
    }
}

/// One outbound transport with a bounded queue and a run-loop that drains
/// it. Transport errors and panics inside `run` are caught and logged; the
/// loop itself never dies because of a single bad send.
#[async_trait]
pub trait NotifierChannel: Send + Sync {
    fn id(&self) -> &NotifierId;

    /// Non-blocking enqueue. `true` if accepted, `false` if the queue is
    /// saturated or the channel has already shut down.
    fn enqueue(&self, notification: Notification) -> bool;

    /// Runs until `stop` is canceled. Implementations document whether
    /// they drain remaining messages on shutdown or drop them; this
    /// implementation drains until the queue is empty, then exits.
    async fn run(&self, stop: CancellationToken);

    /// Advisory hint for message rendering (HTML vs. plain text).
    fn supports_html(&self) -> bool;

    /// A token that is canceled once `run` has returned.
    fn done(&self) -> CancellationToken;
}

/// Shared bounded-queue plumbing used by every concrete channel
/// implementation: producers enqueue via `try_send`, `run` drains via
/// `recv`, and `done` is canceled in the `run` loop's `Drop`-adjacent tail.
pub struct BoundedQueue {
    sender: mpsc::Sender<Notification>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<Notification>>,
    done: CancellationToken,
}

impl BoundedQueue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
            done: CancellationToken::new(),
        }
    }

    pub fn enqueue(&self, notification: Notification) -> bool {
        if self.done.is_cancelled() {
            return false;
        }
        self.sender.try_send(notification).is_ok()
    }

    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Drives `transmit` for every message until `stop` fires, then drains
    /// whatever is left in the queue before signaling `done`.
    pub async fn run<F, Fut>(&self, stop: CancellationToken, transmit: F)
    where
        F: Fn(Notification) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<()>>,
    {
        let mut receiver = self.receiver.lock().await;
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                msg = receiver.recv() => {
                    match msg {
                        Some(msg) => Self::transmit_one(&transmit, msg).await,
                        None => break,
                    }
                }
            }
        }

        // Drain-on-shutdown: flush what's left without blocking forever.
        receiver.close();
        while let Ok(msg) = receiver.try_recv() {
            Self::transmit_one(&transmit, msg).await;
        }

        self.done.cancel();
    }

    async fn transmit_one<F, Fut>(transmit: &F, msg: Notification)
    where
        F: Fn(Notification) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<()>>,
    {
        let result = std::panic::AssertUnwindSafe(transmit(msg))
            .catch_unwind()
            .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "notifier transport failed, dropping message"),
            Err(_) => tracing::error!("notifier transport panicked, dropping message"),
        }
    }
}

fn test_notification(message: &str) -> Notification {
    Notification {
        notifier_id: None,
        task_id: None,
        command_id: None,
        instance_id: None,
        title: None,
        message: message.to_string(),
        elapsed: Duration::ZERO,
        error_occurred: false,
        cancelable: false,
    }
}
