//! Shared types used across the task runtime and task service.

pub mod instance;
pub mod runtime;
pub mod service;

use crate::notifier::NotifierId;
use crate::registry::{CommandId, TaskId};

/// Origin of a submit request; determines whether the resulting
/// notifications expose a user-clickable cancel action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunBy {
    User,
    Scheduler,
}

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub task_id: TaskId,
    pub command_id: CommandId,
    pub notifier_id: Option<NotifierId>,
    pub notify_on_start: bool,
    pub run_by: RunBy,
}
