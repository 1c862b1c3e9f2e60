//! Sample task kinds registered at startup: `PING` (a trivial heartbeat,
//! useful for exercising the engine end to end) and `HTTP_WATCH` (polls a
//! URL and notifies when the response body changes).

pub mod http_watch;
pub mod ping;

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::TaskConfig;
use crate::registry::{CommandConfig, CommandPattern, TaskBody, TaskEntry, TaskId};

/// Builds the built-in task entries. `task_configs` supplies each
/// `HTTP_WATCH` command's `url` (read from that command's `data` object);
/// commands without a configured url fail to construct with a clear error
/// rather than silently watching nothing.
pub fn builtin_entries(task_configs: &[TaskConfig]) -> anyhow::Result<Vec<TaskEntry>> {
    let mut urls: HashMap<(String, String), String> = HashMap::new();
    for task in task_configs {
        if task.id != "HTTP_WATCH" {
            continue;
        }
        for command in &task.commands {
            if let Some(url) = command.data.get("url").and_then(|v| v.as_str()) {
                urls.insert((task.id.clone(), command.id.clone()), url.to_string());
            }
        }
    }
    let urls = Arc::new(urls);

    Ok(vec![
        TaskEntry::new(
            TaskId::new("PING")?,
            vec![CommandConfig {
                command_id: CommandPattern::new("Ping"),
                allow_multiple: true,
                new_snapshot: Arc::new(|| serde_json::json!({ "pings": 0 })),
            }],
            |_instance_id, _request| Ok(Box::new(ping::PingBody) as Box<dyn TaskBody>),
        ),
        TaskEntry::new(
            TaskId::new("HTTP_WATCH")?,
            vec![CommandConfig {
                command_id: CommandPattern::new("Watch*"),
                allow_multiple: false,
                new_snapshot: Arc::new(|| serde_json::json!({ "last_body_hash": null })),
            }],
            move |_instance_id, request| {
                let key = (request.task_id.to_string(), request.command_id.to_string());
                let url = urls.get(&key).cloned().ok_or_else(|| {
                    anyhow::anyhow!(
                        "no url configured for {}/{}",
                        request.task_id,
                        request.command_id
                    )
                })?;
                Ok(Box::new(http_watch::HttpWatchBody::new(url)) as Box<dyn TaskBody>)
            },
        ),
    ])
}
