use std::hash::{Hash, Hasher};
use std::time::Duration;

use async_trait::async_trait;

use crate::registry::{TaskBody, TaskOutcome};
use crate::task::instance::CancelFlag;

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Polls `url` once per run and notifies only when the response body's hash
/// differs from the one recorded in the previous snapshot.
pub struct HttpWatchBody {
    url: String,
    client: reqwest::Client,
}

impl HttpWatchBody {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: reqwest::Client::builder()
                .timeout(FETCH_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }
}

fn hash_body(body: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    body.hash(&mut hasher);
    hasher.finish()
}

#[async_trait]
impl TaskBody for HttpWatchBody {
    async fn execute(
        &self,
        previous_snapshot: serde_json::Value,
        _notifier_supports_html: bool,
        cancel: CancelFlag,
    ) -> anyhow::Result<TaskOutcome> {
        if cancel.is_canceled() {
            return Ok(TaskOutcome::empty());
        }

        let response = self.client.get(&self.url).send().await?;
        let body = response.text().await?;

        if cancel.is_canceled() {
            return Ok(TaskOutcome::empty());
        }

        let hash = hash_body(&body);
        let previous_hash = previous_snapshot.get("last_body_hash").and_then(|v| v.as_u64());

        if previous_hash == Some(hash) {
            return Ok(TaskOutcome {
                message: None,
                new_snapshot: None,
            });
        }

        Ok(TaskOutcome {
            message: Some(format!("{} changed", self.url)),
            new_snapshot: Some(serde_json::json!({ "last_body_hash": hash })),
        })
    }
}
