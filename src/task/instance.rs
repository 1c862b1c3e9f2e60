//! Live task instance state: identity plus the cooperative cancel flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::id::InstanceId;
use crate::registry::{CommandId, TaskId};

/// A lock-free, one-way cancellation flag shared between the event loop
/// (which sets it) and the task body (which polls it). Re-arming is not
/// supported: once canceled, an instance stays canceled for its lifetime.
#[derive(Clone)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn set(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Registry-side bookkeeping for one live execution. Only the Task Service
/// event loop ever mutates the registry that holds these.
pub struct TaskInstance {
    pub id: InstanceId,
    pub task_id: TaskId,
    pub command_id: CommandId,
    pub cancelable_by_user: bool,
    canceled: CancelFlag,
}

impl TaskInstance {
    pub fn new(
        id: InstanceId,
        task_id: TaskId,
        command_id: CommandId,
        cancelable_by_user: bool,
    ) -> Self {
        Self {
            id,
            task_id,
            command_id,
            cancelable_by_user,
            canceled: CancelFlag::new(),
        }
    }

    pub fn cancel(&self) {
        self.canceled.set();
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.is_canceled()
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.canceled.clone()
    }
}
