//! Cron Scheduler (component H): a thin layer converting cron fires into
//! submit requests. Owns no state beyond its spawned timers.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use cron::Schedule;
use tokio_util::sync::CancellationToken;

use crate::config::TaskConfig;
use crate::notification::NotificationService;
use crate::registry::{CommandId, TaskId};
use crate::task::service::TaskServiceHandle;
use crate::task::{RunBy, SubmitRequest};

const SUBMIT_TIMEOUT: Duration = Duration::from_secs(5);

/// One parsed, running cron entry.
struct ScheduledEntry {
    task_id: TaskId,
    command_id: CommandId,
    schedule: Schedule,
}

/// Reads `{runnable, time_spec}` off every command in `tasks`, parses the
/// cron specs up front, and spawns one timer per entry. Parse failures are
/// reported to the default notifier and the entry is skipped, matching the
/// rest of startup's "skip and notify" policy for bad configuration.
pub struct CronScheduler {
    entries: Vec<ScheduledEntry>,
}

impl CronScheduler {
    pub async fn from_config(tasks: &[TaskConfig], sender: &NotificationService) -> Self {
        let mut entries = Vec::new();
        for task in tasks {
            for command in &task.commands {
                let Some(scheduler) = &command.scheduler else {
                    continue;
                };
                if !scheduler.runnable {
                    continue;
                }
                match Schedule::from_str(&scheduler.time_spec) {
                    Ok(schedule) => {
                        let task_id = match TaskId::new(task.id.clone()) {
                            Ok(v) => v,
                            Err(e) => {
                                tracing::error!(error = %e, "skipping cron entry with invalid task id");
                                continue;
                            }
                        };
                        let command_id = match CommandId::new(command.id.clone()) {
                            Ok(v) => v,
                            Err(e) => {
                                tracing::error!(error = %e, "skipping cron entry with invalid command id");
                                continue;
                            }
                        };
                        entries.push(ScheduledEntry {
                            task_id,
                            command_id,
                            schedule,
                        });
                    }
                    Err(e) => {
                        tracing::error!(
                            task = %task.id,
                            command = %command.id,
                            time_spec = %scheduler.time_spec,
                            error = %e,
                            "invalid cron spec, skipping this entry"
                        );
                        let _ = sender
                            .send_default_with_error(format!(
                                "cron: invalid time spec for {}/{}: {e}",
                                task.id, command.id
                            ))
                            .await;
                    }
                }
            }
        }
        Self { entries }
    }

    /// Spawns one timer per parsed entry. Idempotent: calling `start` twice
    /// on the same scheduler just spawns a second, independent set of
    /// timers — callers are expected to call it exactly once per process.
    pub fn start(
        &self,
        executor: TaskServiceHandle,
        sender: Arc<NotificationService>,
        stop: CancellationToken,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        self.entries
            .iter()
            .map(|entry| {
                let task_id = entry.task_id.clone();
                let command_id = entry.command_id.clone();
                let schedule = entry.schedule.clone();
                let executor = executor.clone();
                let sender = sender.clone();
                let stop = stop.clone();
                tokio::spawn(async move {
                    run_entry(task_id, command_id, schedule, executor, sender, stop).await;
                })
            })
            .collect()
    }
}

async fn run_entry(
    task_id: TaskId,
    command_id: CommandId,
    schedule: Schedule,
    executor: TaskServiceHandle,
    sender: Arc<NotificationService>,
    stop: CancellationToken,
) {
    loop {
        let now = chrono::Local::now();
        let Some(next) = schedule.after(&now).next() else {
            tracing::warn!(%task_id, %command_id, "cron schedule has no further fires; stopping entry");
            return;
        };
        let delay = (next - now)
            .to_std()
            .unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        let request = SubmitRequest {
            task_id: task_id.clone(),
            command_id: command_id.clone(),
            notifier_id: None,
            notify_on_start: false,
            run_by: RunBy::Scheduler,
        };

        if let Err(e) = executor.submit(request, SUBMIT_TIMEOUT).await {
            tracing::error!(%task_id, %command_id, error = %e, "cron-triggered submit failed");
            let _ = sender
                .send_default_with_error(format!(
                    "cron: failed to submit {task_id}/{command_id}: {e}"
                ))
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CommandConfigEntry, SchedulerConfig};
    use crate::notifier::{Notification, NotifierChannel, NotifierId};
    use async_trait::async_trait;

    struct FakeChannel {
        id: NotifierId,
        queue: crate::notifier::BoundedQueue,
    }

    impl FakeChannel {
        fn new(id: &str) -> Self {
            Self {
                id: NotifierId::new(id).unwrap(),
                queue: crate::notifier::BoundedQueue::new(16),
            }
        }
    }

    #[async_trait]
    impl NotifierChannel for FakeChannel {
        fn id(&self) -> &NotifierId {
            &self.id
        }
        fn enqueue(&self, n: Notification) -> bool {
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

    fn runnable_task(time_spec: &str) -> TaskConfig {
        TaskConfig {
            id: "PING".to_string(),
            data: serde_json::json!({}),
            commands: vec![CommandConfigEntry {
                id: "Ping".to_string(),
                default_notifier_id: None,
                allow_multiple: false,
                scheduler: Some(SchedulerConfig {
                    runnable: true,
                    time_spec: time_spec.to_string(),
                }),
                data: serde_json::json!({}),
            }],
        }
    }

    #[tokio::test]
    async fn valid_cron_spec_produces_one_entry() {
        let chan = Arc::new(FakeChannel::new("tg1"));
        let sender = NotificationService::new(vec![chan], crate::notifier::NotifierId::new("tg1").unwrap())
            .unwrap();

        let tasks = vec![runnable_task("0 * * * * *")];
        let scheduler = CronScheduler::from_config(&tasks, &sender).await;
        assert_eq!(scheduler.entries.len(), 1);
    }

    #[tokio::test]
    async fn invalid_cron_spec_is_skipped_and_reported() {
        let chan = Arc::new(FakeChannel::new("tg1"));
        let sender = NotificationService::new(vec![chan], crate::notifier::NotifierId::new("tg1").unwrap())
            .unwrap();
        let stop = CancellationToken::new();
        let handles = sender.start(stop.clone());

        let tasks = vec![runnable_task("not a cron spec")];
        let scheduler = CronScheduler::from_config(&tasks, &sender).await;
        assert!(scheduler.entries.is_empty());

        stop.cancel();
        sender.join_with_deadline(handles).await;
    }

    #[tokio::test]
    async fn non_runnable_entries_are_skipped_silently() {
        let mut task = runnable_task("0 * * * * *");
        task.commands[0].scheduler.as_mut().unwrap().runnable = false;

        let chan = Arc::new(FakeChannel::new("tg1"));
        let sender = NotificationService::new(vec![chan], crate::notifier::NotifierId::new("tg1").unwrap())
            .unwrap();

        let scheduler = CronScheduler::from_config(&[task], &sender).await;
        assert!(scheduler.entries.is_empty());
    }
}
