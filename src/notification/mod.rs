//! Notification Service (component E): owns the set of notifier channels,
//! routes by `NotifierId`, and exposes `send`/`health`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::notifier::{Notification, NotifierChannel, NotifierId};

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("notification service is not running")]
    ServiceNotRunning,

    #[error("notifier {0:?} not found")]
    NotifierNotFound(String),

    #[error("notifier {0:?} queue is unavailable")]
    Unavailable(String),

    #[error("invalid notification: {0}")]
    InvalidInput(String),
}

pub struct NotificationService {
    channels: HashMap<NotifierId, Arc<dyn NotifierChannel>>,
    default_id: NotifierId,
    running: AtomicBool,
}

impl NotificationService {
    /// Builds the service from an already-constructed set of channels.
    /// Per the "no registry access from channel construction" design note,
    /// channel construction happens before this call, from configuration
    /// alone — never from this service or the task registry.
    pub fn new(
        channels: Vec<Arc<dyn NotifierChannel>>,
        default_id: NotifierId,
    ) -> anyhow::Result<Self> {
        let mut map = HashMap::with_capacity(channels.len());
        for channel in channels {
            let id = channel.id().clone();
            if map.insert(id.clone(), channel).is_some() {
                anyhow::bail!("duplicate notifier id in configuration: {id}");
            }
        }
        if !map.contains_key(&default_id) {
            anyhow::bail!("default notifier {default_id:?} not present in configuration");
        }
        Ok(Self {
            channels: map,
            default_id,
            running: AtomicBool::new(false),
        })
    }

    /// Spawns each channel's run-loop under `stop`. Returns a `JoinSet`
    /// the caller should await (with the same deadline semantics the Task
    /// Service uses) during shutdown.
    pub fn start(&self, stop: CancellationToken) -> JoinSet<()> {
        self.running.store(true, Ordering::SeqCst);
        let mut set = JoinSet::new();
        for channel in self.channels.values().cloned() {
            let stop = stop.clone();
            set.spawn(async move {
                channel.run(stop).await;
            });
        }
        set
    }

    /// Waits for every channel's run-loop to finish, bounded at 30s; logs
    /// and proceeds past the deadline rather than hanging shutdown forever.
    pub async fn join_with_deadline(&self, mut handles: JoinSet<()>) {
        self.running.store(false, Ordering::SeqCst);
        let wait_all = async {
            while handles.join_next().await.is_some() {}
        };
        if tokio::time::timeout(SHUTDOWN_DEADLINE, wait_all)
            .await
            .is_err()
        {
            tracing::warn!(
                "notifier channels did not all finish within {:?}; proceeding with shutdown",
                SHUTDOWN_DEADLINE
            );
            handles.abort_all();
        }
    }

    fn channel_for(&self, notifier_id: &Option<NotifierId>) -> Option<&Arc<dyn NotifierChannel>> {
        match notifier_id {
            Some(id) => self.channels.get(id),
            None => self.channels.get(&self.default_id),
        }
    }

    /// Routes by `notification.notifier_id` (default channel when blank).
    pub async fn send(&self, notification: Notification) -> Result<(), SendError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(SendError::ServiceNotRunning);
        }
        if let Err(e) = notification.validate() {
            return Err(SendError::InvalidInput(e.to_string()));
        }

        let requested = notification.notifier_id.clone();
        match self.channel_for(&requested) {
            Some(channel) => {
                if channel.enqueue(notification) {
                    Ok(())
                } else if channel.done().is_cancelled() {
                    Err(SendError::ServiceNotRunning)
                } else {
                    Err(SendError::Unavailable(channel.id().to_string()))
                }
            }
            None => {
                let id = requested
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| self.default_id.to_string());
                // Best-effort: tell the default channel about the miss.
                if let Some(default) = self.channels.get(&self.default_id) {
                    default.enqueue(Notification::error(
                        None,
                        format!("notifier {id:?} not found"),
                    ));
                }
                Err(SendError::NotifierNotFound(id))
            }
        }
    }

    pub async fn send_default(&self, message: impl Into<String>) -> Result<(), SendError> {
        self.send(Notification {
            notifier_id: None,
            task_id: None,
            command_id: None,
            instance_id: None,
            title: None,
            message: message.into(),
            elapsed: Duration::ZERO,
            error_occurred: false,
            cancelable: false,
        })
        .await
    }

    pub async fn send_default_with_error(&self, message: impl Into<String>) -> Result<(), SendError> {
        self.send(Notification::error(None, message)).await
    }

    pub fn health(&self) -> Result<(), SendError> {
        if self.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SendError::ServiceNotRunning)
        }
    }

    pub fn channel_supports_html(&self, notifier_id: &Option<NotifierId>) -> bool {
        self.channel_for(notifier_id)
            .map(|c| c.supports_html())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Mutex as AsyncMutex;

    struct FakeChannel {
        id: NotifierId,
        capacity: usize,
        sent: AsyncMutex<Vec<Notification>>,
        accepted: AtomicUsize,
        done: CancellationToken,
    }

    impl FakeChannel {
        fn new(id: &str, capacity: usize) -> Arc<Self> {
            Arc::new(Self {
                id: NotifierId::new(id).unwrap(),
                capacity,
                sent: AsyncMutex::new(Vec::new()),
                accepted: AtomicUsize::new(0),
                done: CancellationToken::new(),
            })
        }
    }

    #[async_trait::async_trait]
    impl NotifierChannel for FakeChannel {
        fn id(&self) -> &NotifierId {
            &self.id
        }

        fn enqueue(&self, notification: Notification) -> bool {
            if self.accepted.load(Ordering::SeqCst) >= self.capacity {
                return false;
            }
            self.accepted.fetch_add(1, Ordering::SeqCst);
            // best effort synchronous record for assertions
            if let Ok(mut guard) = self.sent.try_lock() {
                guard.push(notification);
            }
            true
        }

        async fn run(&self, stop: CancellationToken) {
            stop.cancelled().await;
            self.done.cancel();
        }

        fn supports_html(&self) -> bool {
            false
        }

        fn done(&self) -> CancellationToken {
            self.done.clone()
        }
    }

    fn msg(text: &str) -> Notification {
        Notification {
            notifier_id: None,
            task_id: None,
            command_id: None,
            instance_id: None,
            title: None,
            message: text.to_string(),
            elapsed: Duration::ZERO,
            error_occurred: false,
            cancelable: false,
        }
    }

    #[tokio::test]
    async fn send_before_start_is_service_not_running() {
        let chan = FakeChannel::new("tg1", 10);
        let svc = NotificationService::new(vec![chan], NotifierId::new("tg1").unwrap()).unwrap();
        let err = svc.send(msg("hi")).await.unwrap_err();
        assert!(matches!(err, SendError::ServiceNotRunning));
    }

    #[tokio::test]
    async fn empty_message_is_invalid_input_not_service_not_running() {
        let chan = FakeChannel::new("tg1", 10);
        let svc = NotificationService::new(vec![chan], NotifierId::new("tg1").unwrap()).unwrap();
        let stop = CancellationToken::new();
        let handles = svc.start(stop.clone());

        let err = svc.send(msg("")).await.unwrap_err();
        assert!(matches!(err, SendError::InvalidInput(_)));

        stop.cancel();
        svc.join_with_deadline(handles).await;
    }

    #[tokio::test]
    async fn unknown_notifier_falls_back_to_default_with_one_error_message() {
        let default = FakeChannel::new("tg1", 10);
        let svc = NotificationService::new(vec![default.clone()], NotifierId::new("tg1").unwrap())
            .unwrap();
        let stop = CancellationToken::new();
        let handles = svc.start(stop.clone());

        let mut bad = msg("hi");
        bad.notifier_id = Some(NotifierId::new("ghost").unwrap());
        let err = svc.send(bad).await.unwrap_err();
        assert!(matches!(err, SendError::NotifierNotFound(_)));
        assert_eq!(default.accepted.load(Ordering::SeqCst), 1);

        stop.cancel();
        svc.join_with_deadline(handles).await;
    }

    #[tokio::test]
    async fn queue_full_returns_unavailable() {
        let chan = FakeChannel::new("tg1", 1);
        let svc = NotificationService::new(vec![chan], NotifierId::new("tg1").unwrap()).unwrap();
        let stop = CancellationToken::new();
        let handles = svc.start(stop.clone());

        svc.send(msg("first")).await.unwrap();
        let err = svc.send(msg("second")).await.unwrap_err();
        assert!(matches!(err, SendError::Unavailable(_)));

        stop.cancel();
        svc.join_with_deadline(handles).await;
    }

    #[tokio::test]
    async fn duplicate_notifier_ids_are_rejected_at_construction() {
        let a = FakeChannel::new("tg1", 10);
        let b = FakeChannel::new("tg1", 10);
        let err = NotificationService::new(vec![a, b], NotifierId::new("tg1").unwrap())
            .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[tokio::test]
    async fn missing_default_is_rejected_at_construction() {
        let a = FakeChannel::new("tg1", 10);
        let err = NotificationService::new(vec![a], NotifierId::new("tg2").unwrap()).unwrap_err();
        assert!(err.to_string().contains("default"));
    }
}
