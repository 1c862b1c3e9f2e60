//! Task registry (component C): declarative task/command metadata, snapshot
//! factories, and task constructors. Populated once at process start.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::id::InstanceId;
use crate::task::{RunBy, SubmitRequest};

/// Identifier of a task kind, e.g. `"NAVER"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Result<Self, RegistryError> {
        let id = id.into();
        if id.is_empty() {
            return Err(RegistryError::InvalidId("task id must not be empty".into()));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of an operation within a task, e.g. `"WatchPrice"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommandId(String);

impl CommandId {
    pub fn new(id: impl Into<String>) -> Result<Self, RegistryError> {
        let id = id.into();
        if id.is_empty() {
            return Err(RegistryError::InvalidId(
                "command id must not be empty".into(),
            ));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A command id as it appears in registry configuration: either an exact
/// match or a prefix match when the configured id ends in `*`.
#[derive(Debug, Clone)]
pub struct CommandPattern(String);

impl CommandPattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self(pattern.into())
    }

    pub fn matches(&self, command_id: &CommandId) -> bool {
        match self.0.strip_suffix('*') {
            Some(prefix) => command_id.as_str().starts_with(prefix),
            None => self.0 == command_id.as_str(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("task {0:?} is not supported")]
    TaskNotSupported(String),

    #[error("command {1:?} is not supported for task {0:?}")]
    CommandNotSupported(String, String),
}

/// The outcome of running a task body once.
pub struct TaskOutcome {
    pub message: Option<String>,
    pub new_snapshot: Option<serde_json::Value>,
}

impl TaskOutcome {
    pub fn empty() -> Self {
        Self {
            message: None,
            new_snapshot: None,
        }
    }
}

/// One running task kind's business logic. The engine never inspects
/// `previous_snapshot` or the returned snapshot; it is opaque JSON handed
/// back and forth between the task body and the snapshot store.
///
/// `cancel` is advisory: implementations doing multi-step I/O should poll
/// it between steps and return early (with an empty `TaskOutcome`) once
/// it flips. The engine itself also checks it before and after `execute`
/// runs, so a body that ignores it entirely still cannot leak a result to
/// a canceled instance, only waste the work.
#[async_trait]
pub trait TaskBody: Send + Sync {
    async fn execute(
        &self,
        previous_snapshot: serde_json::Value,
        notifier_supports_html: bool,
        cancel: crate::task::instance::CancelFlag,
    ) -> anyhow::Result<TaskOutcome>;
}

/// Per-command metadata: whether concurrent executions are allowed, and the
/// factory for a fresh (zero-value) snapshot when none is on disk yet.
pub struct CommandConfig {
    pub command_id: CommandPattern,
    pub allow_multiple: bool,
    pub new_snapshot: Arc<dyn Fn() -> serde_json::Value + Send + Sync>,
}

type NewTaskFn = dyn Fn(&InstanceId, &SubmitRequest) -> anyhow::Result<Box<dyn TaskBody>> + Send + Sync;

/// One task kind: its command table and the constructor for live instances.
pub struct TaskEntry {
    pub task_id: TaskId,
    pub commands: Vec<CommandConfig>,
    new_task: Box<NewTaskFn>,
}

impl TaskEntry {
    pub fn new(
        task_id: TaskId,
        commands: Vec<CommandConfig>,
        new_task: impl Fn(&InstanceId, &SubmitRequest) -> anyhow::Result<Box<dyn TaskBody>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            task_id,
            commands,
            new_task: Box::new(new_task),
        }
    }

    pub fn construct(
        &self,
        instance_id: &InstanceId,
        request: &SubmitRequest,
    ) -> anyhow::Result<Box<dyn TaskBody>> {
        (self.new_task)(instance_id, request)
    }
}

/// Global registry of task kinds, keyed by `TaskId`.
#[derive(Default)]
pub struct TaskRegistry {
    entries: HashMap<TaskId, TaskEntry>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entry: TaskEntry) {
        self.entries.insert(entry.task_id.clone(), entry);
    }

    /// Exact task match plus the first command entry whose pattern matches
    /// `command_id`.
    pub fn find(
        &self,
        task_id: &TaskId,
        command_id: &CommandId,
    ) -> Result<(&TaskEntry, &CommandConfig), RegistryError> {
        let entry = self
            .entries
            .get(task_id)
            .ok_or_else(|| RegistryError::TaskNotSupported(task_id.to_string()))?;

        let command = entry
            .commands
            .iter()
            .find(|c| c.command_id.matches(command_id))
            .ok_or_else(|| {
                RegistryError::CommandNotSupported(task_id.to_string(), command_id.to_string())
            })?;

        Ok((entry, command))
    }
}

/// Used by call sites that need to reconstruct a `RunBy` from configuration;
/// kept here so `registry` and `task` don't need to depend on each other for
/// this single conversion.
pub fn run_by_from_str(s: &str) -> Option<RunBy> {
    match s {
        "User" | "user" => Some(RunBy::User),
        "Scheduler" | "scheduler" => Some(RunBy::Scheduler),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_pattern_matches_prefix() {
        let pattern = CommandPattern::new("Watch*");
        assert!(pattern.matches(&CommandId::new("WatchPrice").unwrap()));
        assert!(pattern.matches(&CommandId::new("WatchStock").unwrap()));
        assert!(!pattern.matches(&CommandId::new("Notify").unwrap()));
    }

    #[test]
    fn exact_pattern_matches_only_itself() {
        let pattern = CommandPattern::new("WatchPrice");
        assert!(pattern.matches(&CommandId::new("WatchPrice").unwrap()));
        assert!(!pattern.matches(&CommandId::new("WatchPriceToo").unwrap()));
    }

    #[test]
    fn find_reports_task_vs_command_not_supported_distinctly() {
        let mut registry = TaskRegistry::new();
        registry.register(TaskEntry::new(
            TaskId::new("NAVER").unwrap(),
            vec![CommandConfig {
                command_id: CommandPattern::new("WatchPrice"),
                allow_multiple: false,
                new_snapshot: Arc::new(|| serde_json::json!({})),
            }],
            |_iid, _req| Ok(Box::new(NoopBody) as Box<dyn TaskBody>),
        ));

        let err = registry
            .find(&TaskId::new("UNKNOWN").unwrap(), &CommandId::new("X").unwrap())
            .unwrap_err();
        assert!(matches!(err, RegistryError::TaskNotSupported(_)));

        let err = registry
            .find(
                &TaskId::new("NAVER").unwrap(),
                &CommandId::new("Missing").unwrap(),
            )
            .unwrap_err();
        assert!(matches!(err, RegistryError::CommandNotSupported(_, _)));

        assert!(registry
            .find(
                &TaskId::new("NAVER").unwrap(),
                &CommandId::new("WatchPrice").unwrap()
            )
            .is_ok());
    }

    struct NoopBody;
    #[async_trait]
    impl TaskBody for NoopBody {
        async fn execute(
            &self,
            _previous_snapshot: serde_json::Value,
            _notifier_supports_html: bool,
            _cancel: crate::task::instance::CancelFlag,
        ) -> anyhow::Result<TaskOutcome> {
            Ok(TaskOutcome::empty())
        }
    }
}
