//! Task Service (component G): the single-writer event loop. This is the
//! only code that ever mutates the live-instance map; every other access
//! goes through `submit`/`cancel` channels.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::id::InstanceId;
use crate::notification::NotificationService;
use crate::notifier::{Notification, NotifierId};
use crate::registry::{RegistryError, TaskRegistry};
use crate::snapshot::SnapshotStore;
use crate::task::instance::TaskInstance;
use crate::task::runtime::{self, RuntimeParams};
use crate::task::{RunBy, SubmitRequest};

const DEFAULT_CHANNEL_CAPACITY: usize = 10;
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);
const MAX_ID_ALLOCATION_RETRIES: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("task service is not running")]
    ServiceNotRunning,

    #[error("submit timed out")]
    Timeout,
}

#[derive(Debug, thiserror::Error)]
pub enum CancelError {
    #[error("task service is not running")]
    ServiceNotRunning,

    #[error("cancel queue is full")]
    QueueFull,
}

/// Cheap, cloneable handle used by the HTTP intake and cron scheduler to
/// talk to the event loop. The loop itself (`TaskService`) is never shared
/// directly.
#[derive(Clone)]
pub struct TaskServiceHandle {
    submit_tx: mpsc::Sender<SubmitRequest>,
    cancel_tx: mpsc::Sender<InstanceId>,
    running: Arc<Mutex<bool>>,
}

impl TaskServiceHandle {
    pub async fn submit(&self, request: SubmitRequest, timeout: Duration) -> Result<(), SubmitError> {
        if !*self.running.lock().expect("running mutex poisoned") {
            return Err(SubmitError::ServiceNotRunning);
        }
        match tokio::time::timeout(timeout, self.submit_tx.send(request)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SubmitError::ServiceNotRunning),
            Err(_) => Err(SubmitError::Timeout),
        }
    }

    /// Strictly non-blocking: a full cancel queue fails the call rather
    /// than waiting for room.
    pub fn cancel(&self, instance_id: InstanceId) -> Result<(), CancelError> {
        if !*self.running.lock().expect("running mutex poisoned") {
            return Err(CancelError::ServiceNotRunning);
        }
        match self.cancel_tx.try_send(instance_id) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(CancelError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(CancelError::ServiceNotRunning),
        }
    }

    pub fn is_running(&self) -> bool {
        *self.running.lock().expect("running mutex poisoned")
    }
}

struct TaskService {
    registry: Arc<TaskRegistry>,
    store: Arc<SnapshotStore>,
    sender: Arc<NotificationService>,
    instances: HashMap<InstanceId, TaskInstance>,
    running: Arc<Mutex<bool>>,
    submit_rx: mpsc::Receiver<SubmitRequest>,
    cancel_rx: mpsc::Receiver<InstanceId>,
    done_tx: mpsc::Sender<InstanceId>,
    done_rx: mpsc::Receiver<InstanceId>,
}

/// Spawns the event loop and returns a handle to it plus its `JoinHandle`
/// (so `main` can await clean shutdown before exiting).
pub fn start(
    registry: Arc<TaskRegistry>,
    store: Arc<SnapshotStore>,
    sender: Arc<NotificationService>,
    stop: CancellationToken,
) -> (tokio::task::JoinHandle<()>, TaskServiceHandle) {
    let (submit_tx, submit_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
    let (cancel_tx, cancel_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
    let (done_tx, done_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
    let running = Arc::new(Mutex::new(true));

    let service = TaskService {
        registry,
        store,
        sender,
        instances: HashMap::new(),
        running: running.clone(),
        submit_rx,
        cancel_rx,
        done_tx,
        done_rx,
    };

    let handle = TaskServiceHandle {
        submit_tx,
        cancel_tx,
        running,
    };

    let join = tokio::spawn(service.run(stop));
    (join, handle)
}

impl TaskService {
    async fn run(mut self, stop: CancellationToken) {
        loop {
            if stop.is_cancelled() {
                self.shutdown().await;
                break;
            }
            tokio::select! {
                _ = stop.cancelled() => {
                    self.shutdown().await;
                    break;
                }
                Some(req) = self.submit_rx.recv() => {
                    if let Err(_panic) = std::panic::AssertUnwindSafe(self.handle_submit(req))
                        .catch_unwind()
                        .await
                    {
                        tracing::error!("submit handler panicked; event loop continues");
                    }
                }
                Some(id) = self.cancel_rx.recv() => {
                    if let Err(_panic) = std::panic::AssertUnwindSafe(self.handle_cancel(id))
                        .catch_unwind()
                        .await
                    {
                        tracing::error!("cancel handler panicked; event loop continues");
                    }
                }
                Some(id) = self.done_rx.recv() => {
                    self.handle_done(id);
                }
            }
        }
    }

    async fn handle_submit(&mut self, request: SubmitRequest) {
        let (entry, command) = match self.registry.find(&request.task_id, &request.command_id) {
            Ok(v) => v,
            Err(RegistryError::TaskNotSupported(task_id)) => {
                self.notify_async(
                    request.notifier_id.clone(),
                    format!("task {task_id:?} is not supported"),
                    true,
                    false,
                )
                .await;
                return;
            }
            Err(RegistryError::CommandNotSupported(task_id, command_id)) => {
                self.notify_async(
                    request.notifier_id.clone(),
                    format!("command {command_id:?} is not supported for task {task_id:?}"),
                    true,
                    false,
                )
                .await;
                return;
            }
            Err(RegistryError::InvalidId(msg)) => {
                self.notify_async(request.notifier_id.clone(), msg, true, false)
                    .await;
                return;
            }
        };

        if !command.allow_multiple {
            let already_running = self.instances.values().any(|i| {
                i.task_id == request.task_id && i.command_id == request.command_id && !i.is_canceled()
            });
            if already_running {
                let cancelable = matches!(request.run_by, RunBy::User);
                self.notify_async(
                    request.notifier_id.clone(),
                    format!(
                        "{}/{} is already running",
                        request.task_id, request.command_id
                    ),
                    false,
                    cancelable,
                )
                .await;
                return;
            }
        }

        // Two-phase ID registration: generate, construct, then insert.
        // Because this event loop is the map's sole writer and `construct`
        // is synchronous, there is no real TOCTOU window here today — but
        // the retry-on-collision + re-check shape is kept so a future
        // (async) constructor can be dropped in without changing this
        // function's contract.
        let mut allocated = None;
        for _ in 0..MAX_ID_ALLOCATION_RETRIES {
            let candidate = InstanceId::new();
            if self.instances.contains_key(&candidate) {
                continue;
            }
            match entry.construct(&candidate, &request) {
                Ok(body) => {
                    if self.instances.contains_key(&candidate) {
                        continue;
                    }
                    allocated = Some((candidate, body));
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, task_id = %request.task_id, "failed to construct task instance");
                    self.notify_async(
                        request.notifier_id.clone(),
                        format!("failed to start {}: {e}", request.task_id),
                        true,
                        false,
                    )
                    .await;
                    return;
                }
            }
        }

        let (instance_id, body) = match allocated {
            Some(v) => v,
            None => {
                self.notify_async(
                    request.notifier_id.clone(),
                    "failed to allocate a unique instance id after retries".to_string(),
                    true,
                    false,
                )
                .await;
                return;
            }
        };

        let cancelable_by_user = matches!(request.run_by, RunBy::User);
        let instance = TaskInstance::new(
            instance_id.clone(),
            request.task_id.clone(),
            request.command_id.clone(),
            cancelable_by_user,
        );
        let cancel = instance.cancel_flag();
        self.instances.insert(instance_id.clone(), instance);

        let params = RuntimeParams {
            instance_id: instance_id.clone(),
            request: request.clone(),
            body,
            new_snapshot: command.new_snapshot.clone(),
            store: self.store.clone(),
            sender: self.sender.clone(),
            cancel,
            done_tx: self.done_tx.clone(),
        };
        // The runtime's own context is deliberately not tied to `stop`, so
        // shutdown cancels instances without cutting off their outgoing
        // notifications.
        tokio::spawn(runtime::run(params));

        if request.notify_on_start {
            self.notify_async(
                request.notifier_id.clone(),
                format!("{}/{} started", request.task_id, request.command_id),
                false,
                cancelable_by_user,
            )
            .await;
        }
    }

    async fn handle_cancel(&mut self, instance_id: InstanceId) {
        match self.instances.get(&instance_id) {
            Some(instance) => {
                instance.cancel();
                self.sender
                    .send(Notification {
                        notifier_id: None,
                        task_id: Some(instance.task_id.clone()),
                        command_id: Some(instance.command_id.clone()),
                        instance_id: Some(instance_id),
                        title: None,
                        message: "canceled by user".to_string(),
                        elapsed: Duration::ZERO,
                        error_occurred: false,
                        cancelable: false,
                    })
                    .await
                    .ok();
            }
            None => {
                self.sender
                    .send_default_with_error(format!("instance {instance_id} not found"))
                    .await
                    .ok();
            }
        }
    }

    fn handle_done(&mut self, instance_id: InstanceId) {
        if self.instances.remove(&instance_id).is_none() {
            tracing::warn!(%instance_id, "done signal for an unknown instance");
        }
    }

    async fn notify_async(
        &self,
        notifier_id: Option<NotifierId>,
        message: String,
        error_occurred: bool,
        cancelable: bool,
    ) {
        let _ = self
            .sender
            .send(Notification {
                notifier_id,
                task_id: None,
                command_id: None,
                instance_id: None,
                title: None,
                message,
                elapsed: Duration::ZERO,
                error_occurred,
                cancelable,
            })
            .await;
    }

    /// Ordered shutdown: mark not-running and cancel every live instance,
    /// then drain `done` signals (so exiting tasks never block on a full
    /// channel) until the registry empties or the deadline passes.
    async fn shutdown(&mut self) {
        *self.running.lock().expect("running mutex poisoned") = false;
        for instance in self.instances.values() {
            instance.cancel();
        }

        let deadline = tokio::time::Instant::now() + SHUTDOWN_DEADLINE;
        while !self.instances.is_empty() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                tracing::warn!(
                    live = self.instances.len(),
                    "shutdown deadline exceeded; proceeding with live instances unsettled"
                );
                break;
            }
            match tokio::time::timeout(remaining, self.done_rx.recv()).await {
                Ok(Some(id)) => {
                    self.instances.remove(&id);
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        live = self.instances.len(),
                        "shutdown deadline exceeded; proceeding with live instances unsettled"
                    );
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::{BoundedQueue, NotifierChannel};
    use crate::registry::{CommandConfig, CommandPattern, TaskBody, TaskEntry, TaskId, TaskOutcome};
    use crate::task::instance::CancelFlag;
    use async_trait::async_trait;

    struct RecordingChannel {
        id: NotifierId,
        queue: BoundedQueue,
        received: std::sync::Mutex<Vec<Notification>>,
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

    async fn test_harness() -> (
        Arc<TaskRegistry>,
        Arc<SnapshotStore>,
        Arc<NotificationService>,
        Arc<RecordingChannel>,
        CancellationToken,
        tempfile::TempDir,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SnapshotStore::new(dir.path(), "notify-server").await.unwrap());

        let chan = Arc::new(RecordingChannel {
            id: NotifierId::new("tg1").unwrap(),
            queue: BoundedQueue::new(16),
            received: std::sync::Mutex::new(Vec::new()),
        });
        let sender = Arc::new(
            NotificationService::new(vec![chan.clone()], NotifierId::new("tg1").unwrap()).unwrap(),
        );

        let mut registry = TaskRegistry::new();
        registry.register(TaskEntry::new(
            TaskId::new("PING").unwrap(),
            vec![CommandConfig {
                command_id: CommandPattern::new("Ping"),
                allow_multiple: false,
                new_snapshot: Arc::new(|| serde_json::json!({"count": 0})),
            }],
            |_iid, _req| Ok(Box::new(SlowBody) as Box<dyn TaskBody>),
        ));

        (Arc::new(registry), store, sender, chan, CancellationToken::new(), dir)
    }

    struct SlowBody;
    #[async_trait]
    impl TaskBody for SlowBody {
        async fn execute(
            &self,
            _previous_snapshot: serde_json::Value,
            _notifier_supports_html: bool,
            cancel: CancelFlag,
        ) -> anyhow::Result<TaskOutcome> {
            for _ in 0..50 {
                if cancel.is_canceled() {
                    return Ok(TaskOutcome::empty());
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Ok(TaskOutcome {
                message: Some("done".into()),
                new_snapshot: None,
            })
        }
    }

    #[tokio::test]
    async fn unknown_task_yields_one_not_supported_notification() {
        let (registry, store, sender, _chan, stop, _dir) = test_harness().await;
        let sender_handles = sender.start(stop.clone());
        let (_join, handle) = start(registry, store, sender.clone(), stop.clone());

        handle
            .submit(
                SubmitRequest {
                    task_id: TaskId::new("UNKNOWN").unwrap(),
                    command_id: crate::registry::CommandId::new("X").unwrap(),
                    notifier_id: None,
                    notify_on_start: false,
                    run_by: RunBy::User,
                },
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.cancel();
        sender.join_with_deadline(sender_handles).await;
    }

    #[tokio::test]
    async fn duplicate_submit_without_allow_multiple_is_refused() {
        let (registry, store, sender, _chan, stop, _dir) = test_harness().await;
        let sender_handles = sender.start(stop.clone());
        let (_join, handle) = start(registry, store, sender.clone(), stop.clone());

        let req = || SubmitRequest {
            task_id: TaskId::new("PING").unwrap(),
            command_id: crate::registry::CommandId::new("Ping").unwrap(),
            notifier_id: None,
            notify_on_start: false,
            run_by: RunBy::User,
        };

        handle.submit(req(), Duration::from_secs(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.submit(req(), Duration::from_secs(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        stop.cancel();
        sender.join_with_deadline(sender_handles).await;
    }

    #[tokio::test]
    async fn cancel_unknown_instance_is_a_no_op_on_the_registry() {
        let (registry, store, sender, _chan, stop, _dir) = test_harness().await;
        let sender_handles = sender.start(stop.clone());
        let (_join, handle) = start(registry, store, sender.clone(), stop.clone());

        handle.cancel(InstanceId::new()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        stop.cancel();
        sender.join_with_deadline(sender_handles).await;
    }

    #[tokio::test]
    async fn cancel_on_a_live_instance_notifies_once_and_marks_it_canceled() {
        let (registry, store, sender, chan, stop, _dir) = test_harness().await;
        let sender_handles = sender.start(stop.clone());

        let (submit_tx, submit_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let (cancel_tx, cancel_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let (done_tx, done_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let mut service = TaskService {
            registry,
            store,
            sender: sender.clone(),
            instances: HashMap::new(),
            running: Arc::new(Mutex::new(true)),
            submit_rx,
            cancel_rx,
            done_tx,
            done_rx,
        };
        // drop the unused senders/receivers' counterparts; this test drives
        // handle_submit/handle_cancel directly rather than through the loop.
        drop(submit_tx);
        drop(cancel_tx);

        service
            .handle_submit(SubmitRequest {
                task_id: TaskId::new("PING").unwrap(),
                command_id: crate::registry::CommandId::new("Ping").unwrap(),
                notifier_id: None,
                notify_on_start: false,
                run_by: RunBy::User,
            })
            .await;

        assert_eq!(service.instances.len(), 1);
        let instance_id = service.instances.keys().next().unwrap().clone();
        assert!(!service.instances[&instance_id].is_canceled());

        service.handle_cancel(instance_id.clone()).await;

        assert!(service.instances[&instance_id].is_canceled());
        tokio::time::sleep(Duration::from_millis(20)).await;
        let received = chan.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].message, "canceled by user");
        assert!(!received[0].error_occurred);
        drop(received);

        stop.cancel();
        sender.join_with_deadline(sender_handles).await;
    }

    #[tokio::test]
    async fn shutdown_cancels_live_instances_and_submit_then_fails() {
        let (registry, store, sender, _chan, stop, _dir) = test_harness().await;
        let sender_handles = sender.start(stop.clone());
        let (join, handle) = start(registry, store, sender.clone(), stop.clone());

        handle
            .submit(
                SubmitRequest {
                    task_id: TaskId::new("PING").unwrap(),
                    command_id: crate::registry::CommandId::new("Ping").unwrap(),
                    notifier_id: None,
                    notify_on_start: false,
                    run_by: RunBy::User,
                },
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        stop.cancel();
        join.await.unwrap();

        let err = handle
            .submit(
                SubmitRequest {
                    task_id: TaskId::new("PING").unwrap(),
                    command_id: crate::registry::CommandId::new("Ping").unwrap(),
                    notifier_id: None,
                    notify_on_start: false,
                    run_by: RunBy::User,
                },
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::ServiceNotRunning));

        sender.join_with_deadline(sender_handles).await;
    }
}
