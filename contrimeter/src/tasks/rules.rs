//! Pure task rules: derived display status, list filters, permission
//! guards and credit attribution.
//!
//! Nothing here touches the store; the [`Coordinator`](super::Coordinator)
//! evaluates these against its cached team and tasks before issuing writes.

use std::fmt;
use std::str::FromStr;

use contrimeter_proto::model::{Assignee, Task, Team, UserId};

use super::TaskPolicy;

/// Status shown for a task, derived from its stored fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisplayStatus {
    /// Stored status is done.
    Done,
    /// Manually flagged as at risk.
    AtRisk,
    /// A timer is running.
    Active,
    /// Nothing is happening.
    Inactive,
}

impl fmt::Display for DisplayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Done => write!(f, "done"),
            Self::AtRisk => write!(f, "at-risk"),
            Self::Active => write!(f, "active"),
            Self::Inactive => write!(f, "inactive"),
        }
    }
}

/// Derives the display status. Precedence: done, at-risk, active, inactive.
#[must_use]
pub fn display_status(task: &Task) -> DisplayStatus {
    if task.is_done() {
        DisplayStatus::Done
    } else if task.manually_marked_at_risk {
        DisplayStatus::AtRisk
    } else if task.is_active {
        DisplayStatus::Active
    } else {
        DisplayStatus::Inactive
    }
}

/// Task list filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskFilter {
    /// Every non-archived task.
    #[default]
    All,
    /// Tasks with a running timer.
    Active,
    /// Done tasks.
    Completed,
    /// Tasks flagged at risk.
    AtRisk,
    /// Idle tasks.
    Inactive,
}

impl TaskFilter {
    /// Whether a task with display status `status` passes the filter.
    #[must_use]
    pub const fn accepts(self, status: DisplayStatus) -> bool {
        matches!(
            (self, status),
            (Self::All, _)
                | (Self::Active, DisplayStatus::Active)
                | (Self::Completed, DisplayStatus::Done)
                | (Self::AtRisk, DisplayStatus::AtRisk)
                | (Self::Inactive, DisplayStatus::Inactive)
        )
    }
}

impl FromStr for TaskFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(Self::All),
            "active" => Ok(Self::Active),
            "completed" | "done" => Ok(Self::Completed),
            "at-risk" | "atrisk" | "risk" => Ok(Self::AtRisk),
            "inactive" => Ok(Self::Inactive),
            other => Err(format!(
                "unknown filter {other:?} (expected all, active, completed, at-risk or inactive)"
            )),
        }
    }
}

/// Whether `me` may work on the task at all: it is mine, or it is common.
#[must_use]
pub fn is_workable_by(task: &Task, me: &UserId) -> bool {
    task.assignee.is_common() || task.assignee.is(me)
}

/// Whether `me` may flip the done flag.
///
/// Reopening a done common task is reserved for its completer and the
/// team leader.
#[must_use]
pub fn can_toggle_done(task: &Task, me: &UserId, team: &Team) -> bool {
    if !is_workable_by(task, me) {
        return false;
    }
    if task.assignee.is_common() && task.is_done() {
        return task.completed_by.as_ref() == Some(me) || team.is_leader(me);
    }
    true
}

/// Whether `me` may flag the task at risk. Any member may.
#[must_use]
pub fn can_flag(me: &UserId, team: &Team) -> bool {
    team.is_member(me)
}

/// Whether `me` may archive or unarchive the task.
#[must_use]
pub fn can_archive(task: &Task, me: &UserId, team: &Team, policy: &TaskPolicy) -> bool {
    match &task.assignee {
        Assignee::Member(owner) => owner == me,
        Assignee::Common => policy.common_archive.allows(team, task, me),
    }
}

/// Whether `me` may delete the task.
#[must_use]
pub fn can_delete(task: &Task, me: &UserId, team: &Team, policy: &TaskPolicy) -> bool {
    match &task.assignee {
        Assignee::Member(owner) => owner == me || team.is_leader(me),
        Assignee::Common => policy.common_delete.allows(team, task, me),
    }
}

/// Whether `me` may rename or re-describe the task.
#[must_use]
pub fn can_edit(task: &Task, me: &UserId, team: &Team) -> bool {
    match &task.assignee {
        Assignee::Member(owner) => owner == me || task.created_by == *me || team.is_leader(me),
        Assignee::Common => team.is_member(me),
    }
}

/// Whether `me` may hand the task to another assignee.
#[must_use]
pub fn can_reassign(task: &Task, me: &UserId, team: &Team) -> bool {
    match &task.assignee {
        Assignee::Member(owner) => owner == me || team.is_leader(me),
        Assignee::Common => task.created_by == *me || team.is_leader(me),
    }
}

/// Who is credited with time tracked by `me` on the task: the assignee of a
/// personal task, otherwise the timer holder (falling back to `me`).
#[must_use]
pub fn time_credit(task: &Task, me: &UserId) -> UserId {
    match &task.assignee {
        Assignee::Member(owner) => owner.clone(),
        Assignee::Common => task.active_user.clone().unwrap_or_else(|| me.clone()),
    }
}

/// Who is credited with the completion of a done task: the assignee of a
/// personal task, the completer of a common one.
#[must_use]
pub fn completion_credit(task: &Task) -> Option<UserId> {
    match &task.assignee {
        Assignee::Member(owner) => Some(owner.clone()),
        Assignee::Common => task.completed_by.clone(),
    }
}

/// Whole minutes in `seconds`, rounding down.
#[must_use]
pub const fn whole_minutes(seconds: u64) -> u64 {
    seconds / 60
}
