use async_trait::async_trait;

use crate::registry::{TaskBody, TaskOutcome};
use crate::task::instance::CancelFlag;

/// The simplest possible task body: bumps a counter in its snapshot and
/// reports it back. Useful for exercising submit/cancel/notify end to end
/// without any external dependency.
pub struct PingBody;

#[async_trait]
impl TaskBody for PingBody {
    async fn execute(
        &self,
        previous_snapshot: serde_json::Value,
        _notifier_supports_html: bool,
        _cancel: CancelFlag,
    ) -> anyhow::Result<TaskOutcome> {
        let count = previous_snapshot
            .get("pings")
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
            + 1;

        Ok(TaskOutcome {
            message: Some(format!("pong ({count})")),
            new_snapshot: Some(serde_json::json!({ "pings": count })),
        })
    }
}
