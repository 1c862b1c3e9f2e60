//! Task runtime (component F): the per-instance lifecycle — load snapshot,
//! invoke the task body, dispatch the result, save the new snapshot — run
//! as a supervised tokio task with its own panic recovery.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::mpsc;

use crate::id::InstanceId;
use crate::notification::NotificationService;
use crate::notifier::Notification;
use crate::registry::TaskBody;
use crate::snapshot::SnapshotStore;
use crate::task::instance::CancelFlag;
use crate::task::{RunBy, SubmitRequest};

pub struct RuntimeParams {
    pub instance_id: InstanceId,
    pub request: SubmitRequest,
    pub body: Box<dyn TaskBody>,
    pub new_snapshot: Arc<dyn Fn() -> serde_json::Value + Send + Sync>,
    pub store: Arc<SnapshotStore>,
    pub sender: Arc<NotificationService>,
    pub cancel: CancelFlag,
    pub done_tx: mpsc::Sender<InstanceId>,
}

/// Runs one task instance to completion. Always sends its own `InstanceId`
/// on `done_tx` when it returns, even on panic, so the event loop can
/// remove it from the live-instance map.
pub async fn run(params: RuntimeParams) {
    let instance_id = params.instance_id.clone();
    let done_tx = params.done_tx.clone();

    let outcome = std::panic::AssertUnwindSafe(execute(&params))
        .catch_unwind()
        .await;

    if let Err(panic) = outcome {
        let reason = panic_message(&panic);
        tracing::error!(instance_id = %instance_id, reason, "task instance panicked");
        let _ = params
            .sender
            .send(Notification {
                notifier_id: params.request.notifier_id.clone(),
                task_id: Some(params.request.task_id.clone()),
                command_id: Some(params.request.command_id.clone()),
                instance_id: Some(instance_id.clone()),
                title: None,
                message: format!("failed: {reason}"),
                elapsed: Duration::ZERO,
                error_occurred: true,
                cancelable: false,
            })
            .await;
    }

    let _ = done_tx.send(instance_id).await;
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn execute(params: &RuntimeParams) {
    let start = Instant::now();
    let cancelable = matches!(params.request.run_by, RunBy::User);

    let previous_snapshot = match params
        .store
        .load::<serde_json::Value>(params.request.task_id.as_str(), params.request.command_id.as_str())
        .await
    {
        Ok(Some(value)) => value,
        Ok(None) => (params.new_snapshot)(),
        Err(e) => {
            tracing::warn!(
                instance_id = %params.instance_id,
                error = %e,
                "failed to load snapshot, continuing with a fresh one"
            );
            let _ = params
                .sender
                .send(Notification {
                    notifier_id: params.request.notifier_id.clone(),
                    task_id: Some(params.request.task_id.clone()),
                    command_id: Some(params.request.command_id.clone()),
                    instance_id: Some(params.instance_id.clone()),
                    title: None,
                    message: format!("warning: failed to load previous snapshot: {e}"),
                    elapsed: start.elapsed(),
                    error_occurred: false,
                    cancelable,
                })
                .await;
            (params.new_snapshot)()
        }
    };

    if params.cancel.is_canceled() {
        return;
    }

    let supports_html = params
        .sender
        .channel_supports_html(&params.request.notifier_id);

    let result = params
        .body
        .execute(previous_snapshot, supports_html, params.cancel.clone())
        .await;

    if params.cancel.is_canceled() {
        // The cancel handler already emitted a user-visible notification.
        return;
    }

    match result {
        Ok(outcome) => {
            if let Some(message) = outcome.message.filter(|m| !m.is_empty()) {
                let _ = params
                    .sender
                    .send(Notification {
                        notifier_id: params.request.notifier_id.clone(),
                        task_id: Some(params.request.task_id.clone()),
                        command_id: Some(params.request.command_id.clone()),
                        instance_id: Some(params.instance_id.clone()),
                        title: None,
                        message,
                        elapsed: start.elapsed(),
                        error_occurred: false,
                        cancelable: false,
                    })
                    .await;
            }
            if let Some(new_snapshot) = outcome.new_snapshot {
                if let Err(e) = params
                    .store
                    .save(
                        params.request.task_id.as_str(),
                        params.request.command_id.as_str(),
                        &new_snapshot,
                    )
                    .await
                {
                    tracing::warn!(instance_id = %params.instance_id, error = %e, "failed to save snapshot");
                    let _ = params
                        .sender
                        .send(Notification {
                            notifier_id: params.request.notifier_id.clone(),
                            task_id: Some(params.request.task_id.clone()),
                            command_id: Some(params.request.command_id.clone()),
                            instance_id: Some(params.instance_id.clone()),
                            title: None,
                            message: format!("failed to persist result: {e}"),
                            elapsed: start.elapsed(),
                            error_occurred: true,
                            cancelable: false,
                        })
                        .await;
                }
            }
        }
        Err(e) => {
            let _ = params
                .sender
                .send(Notification {
                    notifier_id: params.request.notifier_id.clone(),
                    task_id: Some(params.request.task_id.clone()),
                    command_id: Some(params.request.command_id.clone()),
                    instance_id: Some(params.instance_id.clone()),
                    title: None,
                    message: format!("failed: {e}"),
                    elapsed: start.elapsed(),
                    error_occurred: true,
                    cancelable: false,
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::{BoundedQueue, NotifierChannel, NotifierId};
    use crate::registry::{CommandId, TaskId, TaskOutcome};
    use crate::task::instance::TaskInstance;
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    struct RecordingChannel {
        id: NotifierId,
        queue: BoundedQueue,
        received: std::sync::Mutex<Vec<Notification>>,
    }

    impl RecordingChannel {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                id: NotifierId::new("tg1").unwrap(),
                queue: BoundedQueue::new(16),
                received: std::sync::Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl NotifierChannel for RecordingChannel {
        fn id(&self) -> &NotifierId {
            &self.id
        }
        fn enqueue(&self, n: Notification) -> bool {
            self.received.lock().unwrap().push(n.clone());
            self.queue.enqueue(n)
        }
        async fn run(&self, stop: CancellationToken) {
            self.queue.run(stop, |_| async { Ok(()) }).await;
        }
        fn supports_html(&self) -> bool {
            false
        }
        fn done(&self) -> CancellationToken {
            self.queue.done()
        }
    }

    struct PanicBody;
    #[async_trait]
    impl TaskBody for PanicBody {
        async fn execute(
            &self,
            _previous_snapshot: serde_json::Value,
            _notifier_supports_html: bool,
            _cancel: CancelFlag,
        ) -> anyhow::Result<TaskOutcome> {
            panic!("boom");
        }
    }

    struct SuccessBody;
    #[async_trait]
    impl TaskBody for SuccessBody {
        async fn execute(
            &self,
            _previous_snapshot: serde_json::Value,
            _notifier_supports_html: bool,
            _cancel: CancelFlag,
        ) -> anyhow::Result<TaskOutcome> {
            Ok(TaskOutcome {
                message: Some("ok".to_string()),
                new_snapshot: Some(serde_json::json!({"n": 1})),
            })
        }
    }

    async fn harness() -> (
        Arc<crate::snapshot::SnapshotStore>,
        Arc<NotificationService>,
        Arc<RecordingChannel>,
        tempfile::TempDir,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            crate::snapshot::SnapshotStore::new(dir.path(), "notify-server")
                .await
                .unwrap(),
        );
        let chan = RecordingChannel::new();
        let sender = Arc::new(
            NotificationService::new(vec![chan.clone()], NotifierId::new("tg1").unwrap()).unwrap(),
        );
        (store, sender, chan, dir)
    }

    #[tokio::test]
    async fn panicking_body_yields_exactly_one_failure_notification() {
        let (store, sender, chan, _dir) = harness().await;
        let stop = CancellationToken::new();
        let handles = sender.start(stop.clone());

        let instance = TaskInstance::new(
            InstanceId::new(),
            TaskId::new("PING").unwrap(),
            CommandId::new("Ping").unwrap(),
            true,
        );
        let (done_tx, mut done_rx) = mpsc::channel(1);

        run(RuntimeParams {
            instance_id: instance.id.clone(),
            request: SubmitRequest {
                task_id: instance.task_id.clone(),
                command_id: instance.command_id.clone(),
                notifier_id: None,
                notify_on_start: false,
                run_by: RunBy::User,
            },
            body: Box::new(PanicBody),
            new_snapshot: Arc::new(|| serde_json::json!({})),
            store,
            sender: sender.clone(),
            cancel: instance.cancel_flag(),
            done_tx,
        })
        .await;

        assert_eq!(done_rx.recv().await, Some(instance.id.clone()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let received = chan.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert!(received[0].error_occurred);
        drop(received);

        stop.cancel();
        sender.join_with_deadline(handles).await;
    }

    #[tokio::test]
    async fn successful_run_persists_the_returned_snapshot() {
        let (store, sender, _chan, _dir) = harness().await;
        let stop = CancellationToken::new();
        let handles = sender.start(stop.clone());

        let instance = TaskInstance::new(
            InstanceId::new(),
            TaskId::new("PING").unwrap(),
            CommandId::new("Ping").unwrap(),
            true,
        );
        let (done_tx, mut done_rx) = mpsc::channel(1);

        run(RuntimeParams {
            instance_id: instance.id.clone(),
            request: SubmitRequest {
                task_id: instance.task_id.clone(),
                command_id: instance.command_id.clone(),
                notifier_id: None,
                notify_on_start: false,
                run_by: RunBy::User,
            },
            body: Box::new(SuccessBody),
            new_snapshot: Arc::new(|| serde_json::json!({})),
            store: store.clone(),
            sender: sender.clone(),
            cancel: instance.cancel_flag(),
            done_tx,
        })
        .await;

        assert_eq!(done_rx.recv().await, Some(instance.id));

        let saved: Option<serde_json::Value> = store.load("PING", "Ping").await.unwrap();
        assert_eq!(saved, Some(serde_json::json!({"n": 1})));

        stop.cancel();
        sender.join_with_deadline(handles).await;
    }
}
