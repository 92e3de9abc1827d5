//! Team task coordination.
//!
//! [`Coordinator`] owns the task state machine for one user in one team:
//! permission guards, timer start/stop, done and at-risk toggles, archive
//! and delete, and the reconciliation of local timers against pushed task
//! snapshots. The pure rules it applies live in [`rules`].

pub mod coordinator;
pub mod rules;

pub use coordinator::{Coordinator, DEFAULT_START_GRACE, StopOutcome};
pub use rules::{DisplayStatus, TaskFilter, display_status};

use contrimeter_proto::model::{
    MAX_DESCRIPTION_LENGTH, MAX_TASK_NAME_LENGTH, Task, TaskId, Team, TeamCode, UserId,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::StoreError;

/// Errors that can occur during task operations.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Task name cannot be empty.
    #[error("task name cannot be empty")]
    NameEmpty,
    /// Task name exceeds the maximum length.
    #[error("task name too long (max {MAX_TASK_NAME_LENGTH} characters)")]
    NameTooLong,
    /// Task description exceeds the maximum length.
    #[error("task description too long (max {MAX_DESCRIPTION_LENGTH} characters)")]
    DescriptionTooLong,
    /// The assignee is neither a team member nor the common assignee.
    #[error("invalid assignee: {0}")]
    InvalidAssignee(String),
    /// Task with the given ID was not found.
    #[error("task not found: {0}")]
    NotFound(TaskId),
    /// The team document does not exist.
    #[error("team not found: {0}")]
    TeamNotFound(TeamCode),
    /// The team has not been loaded yet.
    #[error("team not loaded")]
    TeamNotLoaded,
    /// The current user may not perform this action on the task.
    #[error("not permitted to {0} this task")]
    NotPermitted(&'static str),
    /// The task is already done.
    #[error("task is already done")]
    AlreadyDone,
    /// Another member holds the timer of this common task.
    #[error("task is being worked on by {0}")]
    ClaimedByOther(UserId),
    /// No local timer runs for the task.
    #[error("no timer is running for this task")]
    NotRunning,
    /// A timer already runs for the task.
    #[error("a timer is already running for this task")]
    AlreadyRunning,
    /// The timer was stopped on another device; the local run was dropped.
    #[error("timer was stopped elsewhere; local time discarded")]
    StoppedElsewhere,
    /// The action is refused while a timer runs on the task.
    #[error("stop the running timer first")]
    TimerRunning,
    /// The task is archived.
    #[error("task is archived")]
    Archived,
    /// The task is not archived.
    #[error("task is not archived")]
    NotArchived,
    /// The task changed underneath the request; refresh and retry.
    #[error("task {0} changed on another device")]
    Stale(TaskId),
    /// The store refused or failed the request.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Who, besides the obvious owners, may act on a common task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommonRule {
    /// Any team member.
    AnyMember,
    /// The member who created the task, or the team leader.
    CreatorOrLeader,
    /// Only the team leader.
    LeaderOnly,
}

impl CommonRule {
    /// Whether `user` may act on the common `task` under this rule.
    #[must_use]
    pub fn allows(self, team: &Team, task: &Task, user: &UserId) -> bool {
        match self {
            Self::AnyMember => team.is_member(user),
            Self::CreatorOrLeader => task.created_by == *user || team.is_leader(user),
            Self::LeaderOnly => team.is_leader(user),
        }
    }
}

/// Archive and delete permissions for common tasks.
///
/// Personal tasks are archived by their assignee and deleted by their
/// assignee or the team leader regardless of policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPolicy {
    /// Who may archive or unarchive a common task.
    pub common_archive: CommonRule,
    /// Who may delete a common task.
    pub common_delete: CommonRule,
}

impl Default for TaskPolicy {
    fn default() -> Self {
        Self {
            common_archive: CommonRule::AnyMember,
            common_delete: CommonRule::CreatorOrLeader,
        }
    }
}

/// Validates and normalizes a task name.
///
/// # Errors
///
/// Returns [`TaskError::NameEmpty`] or [`TaskError::NameTooLong`].
pub fn validate_name(name: &str) -> Result<String, TaskError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(TaskError::NameEmpty);
    }
    if trimmed.chars().count() > MAX_TASK_NAME_LENGTH {
        return Err(TaskError::NameTooLong);
    }
    Ok(trimmed.to_string())
}

/// Validates and normalizes an optional description; blank becomes `None`.
///
/// # Errors
///
/// Returns [`TaskError::DescriptionTooLong`].
pub fn validate_description(description: Option<&str>) -> Result<Option<String>, TaskError> {
    let Some(text) = description.map(str::trim).filter(|d| !d.is_empty()) else {
        return Ok(None);
    };
    if text.chars().count() > MAX_DESCRIPTION_LENGTH {
        return Err(TaskError::DescriptionTooLong);
    }
    Ok(Some(text.to_string()))
}
