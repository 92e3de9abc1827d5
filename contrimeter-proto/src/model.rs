//! Document model for `Contrimeter` teams.
//!
//! Every type here is stored as (or inside) a document in the remote
//! document store: `teams/{code}`, `tasks/{id}`, `contributions/{team_user}`,
//! `sessions/{id}`, `messages/{id}` and `users/{uid}`. Timestamps are
//! milliseconds since the UNIX epoch as observed by the writing client.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// String form of the shared assignee that any team member may work on.
pub const COMMON: &str = "common";

/// Maximum task name length in characters.
pub const MAX_TASK_NAME_LENGTH: usize = 256;

/// Maximum task description length in characters.
pub const MAX_DESCRIPTION_LENGTH: usize = 250;

/// Number of characters in a team invite code.
pub const TEAM_CODE_LENGTH: usize = 6;

/// Characters a team code is drawn from (no `0`, `O`, `1` or `I`).
pub const TEAM_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Errors produced when parsing identifiers from user input.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IdError {
    /// The user id was empty after trimming.
    #[error("user id cannot be empty")]
    EmptyUserId,

    /// The user id collides with the shared assignee sentinel.
    #[error("\"{COMMON}\" is reserved and cannot be used as a user id")]
    ReservedUserId,

    /// The team code has the wrong length or an invalid character.
    #[error("invalid team code {0:?}: expected {TEAM_CODE_LENGTH} characters (A-Z, 2-9)")]
    InvalidTeamCode(String),
}

/// Stable user identifier issued by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Wraps an identifier without validation.
    ///
    /// Use [`UserId::parse`] for anything that came from user input.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Parses a user id, rejecting empty ids and the `common` sentinel.
    ///
    /// # Errors
    ///
    /// Returns [`IdError::EmptyUserId`] or [`IdError::ReservedUserId`].
    pub fn parse(raw: &str) -> Result<Self, IdError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(IdError::EmptyUserId);
        }
        if trimmed == COMMON {
            return Err(IdError::ReservedUserId);
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Returns the string representation of this id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Human-shareable team code, also the team's document id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TeamCode(String);

impl TeamCode {
    /// Parses a team code typed by a user: trims, upper-cases and validates.
    ///
    /// # Errors
    ///
    /// Returns [`IdError::InvalidTeamCode`] if the code is not exactly
    /// [`TEAM_CODE_LENGTH`] characters from [`TEAM_CODE_ALPHABET`].
    pub fn parse(raw: &str) -> Result<Self, IdError> {
        let code = raw.trim().to_ascii_uppercase();
        let valid = code.len() == TEAM_CODE_LENGTH
            && code.bytes().all(|b| TEAM_CODE_ALPHABET.contains(&b));
        if valid {
            Ok(Self(code))
        } else {
            Err(IdError::InvalidTeamCode(raw.to_string()))
        }
    }

    /// Returns the code as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TeamCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a new time-ordered identifier (UUID v7).
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Creates an identifier from an existing UUID.
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the inner UUID value.
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s.trim()).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Task identifier, generated client-side before the task is persisted.
    TaskId
);
uuid_id!(
    /// Identifier of a completed timer run.
    SessionId
);
uuid_id!(
    /// Identifier of a team chat message.
    MessageId
);

/// Who a task belongs to: one member, or the whole team.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Assignee {
    /// Shared task; any member may claim, work on, or complete it.
    Common,
    /// Personally assigned task.
    Member(UserId),
}

impl Assignee {
    /// Parses an assignee from user input (`common` or a user id).
    ///
    /// # Errors
    ///
    /// Returns [`IdError::EmptyUserId`] for blank input.
    pub fn parse(raw: &str) -> Result<Self, IdError> {
        if raw.trim() == COMMON {
            Ok(Self::Common)
        } else {
            UserId::parse(raw).map(Self::Member)
        }
    }

    /// Whether this is the shared assignee.
    #[must_use]
    pub const fn is_common(&self) -> bool {
        matches!(self, Self::Common)
    }

    /// The assigned member, if the task is personal.
    #[must_use]
    pub const fn member(&self) -> Option<&UserId> {
        match self {
            Self::Common => None,
            Self::Member(user) => Some(user),
        }
    }

    /// Whether the task is personally assigned to `user`.
    #[must_use]
    pub fn is(&self, user: &UserId) -> bool {
        self.member() == Some(user)
    }
}

impl From<UserId> for Assignee {
    fn from(user: UserId) -> Self {
        Self::Member(user)
    }
}

impl fmt::Display for Assignee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Common => f.write_str(COMMON),
            Self::Member(user) => write!(f, "{user}"),
        }
    }
}

/// Stored completion state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Not yet completed.
    Pending,
    /// Completed; no timer may run.
    Done,
}

impl TaskStatus {
    /// The opposite status, used by the done toggle.
    #[must_use]
    pub const fn toggled(self) -> Self {
        match self {
            Self::Pending => Self::Done,
            Self::Done => Self::Pending,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Done => write!(f, "done"),
        }
    }
}

/// A unit of team work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: TaskId,
    /// Team this task belongs to.
    pub team_id: TeamCode,
    /// Task name.
    pub name: String,
    /// Optional longer description.
    pub description: Option<String>,
    /// Member the task is assigned to, or [`Assignee::Common`].
    pub assignee: Assignee,
    /// Stored completion state.
    pub status: TaskStatus,
    /// Accumulated whole minutes of tracked work.
    pub time_spent: u64,
    /// Whether a timer is currently running for this task.
    pub is_active: bool,
    /// Last time anything happened to the task.
    pub last_activity: u64,
    /// When the task was created.
    pub created_at: u64,
    /// Member who created the task.
    pub created_by: UserId,
    /// Advisory flag, independent of the activity-derived status.
    pub manually_marked_at_risk: bool,
    /// For common tasks: the member currently holding the running timer.
    pub active_user: Option<UserId>,
    /// For common tasks: the member who completed it.
    pub completed_by: Option<UserId>,
    /// Archived tasks are hidden from default views but retained.
    pub archived: bool,
}

impl Task {
    /// Creates a fresh pending task.
    #[must_use]
    pub fn new(
        id: TaskId,
        team_id: TeamCode,
        name: impl Into<String>,
        assignee: Assignee,
        created_by: UserId,
        now: u64,
    ) -> Self {
        Self {
            id,
            team_id,
            name: name.into(),
            description: None,
            assignee,
            status: TaskStatus::Pending,
            time_spent: 0,
            is_active: false,
            last_activity: now,
            created_at: now,
            created_by,
            manually_marked_at_risk: false,
            active_user: None,
            completed_by: None,
            archived: false,
        }
    }

    /// Whether the stored status is [`TaskStatus::Done`].
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.status == TaskStatus::Done
    }
}

/// A team and its membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    /// Invite code, also the document id.
    pub code: TeamCode,
    /// Display name.
    pub name: String,
    /// Current leader; `None` once the last member has left.
    pub leader: Option<UserId>,
    /// Ordered members, always including [`Assignee::Common`].
    pub members: Vec<Assignee>,
    /// When the team was created.
    pub created_at: u64,
}

impl Team {
    /// Creates a team led by `leader` with members `[leader, common]`.
    #[must_use]
    pub fn new(code: TeamCode, name: impl Into<String>, leader: UserId, now: u64) -> Self {
        Self {
            code,
            name: name.into(),
            members: vec![Assignee::Member(leader.clone()), Assignee::Common],
            leader: Some(leader),
            created_at: now,
        }
    }

    /// Whether `user` is a member of this team.
    #[must_use]
    pub fn is_member(&self, user: &UserId) -> bool {
        self.members.iter().any(|m| m.is(user))
    }

    /// Whether `user` currently leads this team.
    #[must_use]
    pub fn is_leader(&self, user: &UserId) -> bool {
        self.leader.as_ref() == Some(user)
    }

    /// Whether `assignee` may be given tasks in this team.
    #[must_use]
    pub fn accepts(&self, assignee: &Assignee) -> bool {
        self.members.contains(assignee)
    }

    /// Human members, in membership order.
    pub fn users(&self) -> impl Iterator<Item = &UserId> {
        self.members.iter().filter_map(Assignee::member)
    }
}

/// Per-team, per-user running totals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contribution {
    /// Team the counters belong to.
    pub team_id: TeamCode,
    /// User the counters belong to.
    pub user_id: UserId,
    /// Number of tasks completed (net of un-marks).
    pub tasks_completed: u64,
    /// Tracked time in seconds.
    pub total_time_spent: u64,
    /// Last time a delta was applied.
    pub last_active: u64,
    /// When the document was first written.
    pub created_at: u64,
}

impl Contribution {
    /// Document id: `{team}_{user}`.
    #[must_use]
    pub fn key(team: &TeamCode, user: &UserId) -> String {
        format!("{team}_{user}")
    }
}

/// Immutable record of one completed timer run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Session identifier.
    pub id: SessionId,
    /// Member who ran the timer.
    pub user_id: UserId,
    /// Team the task belonged to.
    pub team_id: TeamCode,
    /// Snapshot of the task name at stop time.
    pub task_name: String,
    /// Run length in seconds.
    pub duration: u64,
    /// When the run was recorded.
    pub created_at: u64,
}

/// A file shared in team chat. The bytes live in external file storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Download URL in file storage.
    pub url: String,
    /// Original file name.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
}

/// A team chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message identifier.
    pub id: MessageId,
    /// Team the message was posted to.
    pub team_id: TeamCode,
    /// Author.
    pub user_id: UserId,
    /// Author display name at send time.
    pub user_name: String,
    /// Message text (may be empty when an attachment is present).
    pub message: String,
    /// Optional shared file.
    pub attachment: Option<Attachment>,
    /// When the message was sent.
    pub created_at: u64,
}

/// A user's profile document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    /// User id from the identity provider.
    pub uid: UserId,
    /// Display name.
    pub name: String,
    /// Contact email (may be empty).
    pub email: String,
    /// Free-form role label.
    pub role: String,
    /// Codes of the teams the user has joined.
    pub joined_teams: Vec<TeamCode>,
    /// When the profile was created.
    pub created_at: u64,
}

impl UserProfile {
    /// Creates a profile with no joined teams.
    #[must_use]
    pub fn new(uid: UserId, name: impl Into<String>, email: impl Into<String>, now: u64) -> Self {
        Self {
            uid,
            name: name.into(),
            email: email.into(),
            role: String::new(),
            joined_teams: Vec::new(),
            created_at: now,
        }
    }
}
