//! Document store protocol for `Contrimeter`.
//!
//! Clients read with [`Query`] values, receive [`Snapshot`]s, and mutate the
//! store exclusively through [`WriteBatch`]es. A batch is atomic: every
//! [`TaskCondition`] it carries is checked before anything is applied, so a
//! conditional write doubles as a compare-and-swap and a multi-document flow
//! (stop timer + session + contribution) either lands completely or not at
//! all.
//!
//! Over the network the protocol is carried in postcard-encoded
//! [`ClientFrame`] / [`ServerFrame`] values inside binary WebSocket frames.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::call::{CallTokenRequest, CallTokenResponse};
use crate::model::{
    Assignee, ChatMessage, Contribution, Session, Task, TaskId, TaskStatus, Team, TeamCode,
    UserId, UserProfile,
};

/// Which tasks of a team a query returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArchiveScope {
    /// Only tasks that are not archived (the default views).
    Active,
    /// Only archived tasks.
    Archived,
    /// Everything.
    All,
}

impl ArchiveScope {
    /// Whether a task with the given archived flag falls in this scope.
    #[must_use]
    pub const fn includes(self, archived: bool) -> bool {
        match self {
            Self::Active => !archived,
            Self::Archived => archived,
            Self::All => true,
        }
    }
}

/// A read against the store. Every query may also be subscribed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Query {
    /// One team document.
    Team(TeamCode),
    /// Every team the user is a member of.
    TeamsOf(UserId),
    /// One user profile.
    User(UserId),
    /// One task document.
    Task(TaskId),
    /// A team's tasks, oldest first.
    TeamTasks {
        /// Team to read.
        team: TeamCode,
        /// Archived filter.
        scope: ArchiveScope,
    },
    /// Archived tasks of one assignee in a team.
    ArchivedTasksOf {
        /// Team to read.
        team: TeamCode,
        /// Whose archived tasks.
        assignee: Assignee,
    },
    /// All contribution counters of a team.
    Contributions(TeamCode),
    /// Most recent sessions of a team, newest first.
    RecentSessions {
        /// Team to read.
        team: TeamCode,
        /// Maximum number of sessions returned.
        limit: u32,
    },
    /// Every session of a team, oldest first.
    SessionLog(TeamCode),
    /// Team chat, oldest first.
    Messages(TeamCode),
}

impl Query {
    /// Whether a committed [`Change`] may have altered this query's result.
    #[must_use]
    pub fn is_affected_by(&self, change: &Change) -> bool {
        match self {
            Self::Team(team)
            | Self::TeamTasks { team, .. }
            | Self::ArchivedTasksOf { team, .. }
            | Self::Contributions(team)
            | Self::RecentSessions { team, .. }
            | Self::SessionLog(team)
            | Self::Messages(team) => change.teams.contains(team),
            Self::TeamsOf(user) => !change.teams.is_empty() || change.users.contains(user),
            Self::User(user) => change.users.contains(user),
            Self::Task(id) => change.tasks.contains(id),
        }
    }
}

/// What a committed batch touched, used to drive live queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Change {
    /// Teams whose documents (or dependent collections) changed.
    pub teams: Vec<TeamCode>,
    /// Users whose profiles changed.
    pub users: Vec<UserId>,
    /// Individual tasks that changed.
    pub tasks: Vec<TaskId>,
}

impl Change {
    /// Records a team, ignoring duplicates.
    pub fn touch_team(&mut self, team: &TeamCode) {
        if !self.teams.contains(team) {
            self.teams.push(team.clone());
        }
    }

    /// Records a user, ignoring duplicates.
    pub fn touch_user(&mut self, user: &UserId) {
        if !self.users.contains(user) {
            self.users.push(user.clone());
        }
    }

    /// Records a task (and its team), ignoring duplicates.
    pub fn touch_task(&mut self, task: &TaskId, team: &TeamCode) {
        if !self.tasks.contains(task) {
            self.tasks.push(*task);
        }
        self.touch_team(team);
    }

    /// Whether nothing was touched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.teams.is_empty() && self.users.is_empty() && self.tasks.is_empty()
    }
}

/// The typed result of a [`Query`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Snapshot {
    /// Result of [`Query::Team`].
    Team(Option<Team>),
    /// Result of [`Query::TeamsOf`].
    Teams(Vec<Team>),
    /// Result of [`Query::User`].
    User(Option<UserProfile>),
    /// Result of [`Query::Task`].
    Task(Option<Task>),
    /// Result of the task-list queries.
    Tasks(Vec<Task>),
    /// Result of [`Query::Contributions`].
    Contributions(Vec<Contribution>),
    /// Result of the session queries.
    Sessions(Vec<Session>),
    /// Result of [`Query::Messages`].
    Messages(Vec<ChatMessage>),
}

impl Snapshot {
    /// Short name of the variant, for diagnostics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Team(_) => "team",
            Self::Teams(_) => "teams",
            Self::User(_) => "user",
            Self::Task(_) => "task",
            Self::Tasks(_) => "tasks",
            Self::Contributions(_) => "contributions",
            Self::Sessions(_) => "sessions",
            Self::Messages(_) => "messages",
        }
    }
}

/// A guard evaluated against a task before a [`Write::PatchTask`] applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskCondition {
    /// The stored status equals the given one.
    Status(TaskStatus),
    /// `is_active` equals the given value.
    Active(bool),
    /// No member holds the timer.
    Unclaimed,
    /// No member holds the timer, or the given member does.
    UnclaimedOrHeldBy(UserId),
    /// The task is not archived.
    NotArchived,
    /// The assignee equals the given one.
    AssignedTo(Assignee),
    /// `completed_by` equals the given value.
    CompletedBy(Option<UserId>),
}

impl TaskCondition {
    /// Evaluates the condition against the current task document.
    #[must_use]
    pub fn holds(&self, task: &Task) -> bool {
        match self {
            Self::Status(status) => task.status == *status,
            Self::Active(active) => task.is_active == *active,
            Self::Unclaimed => task.active_user.is_none(),
            Self::UnclaimedOrHeldBy(user) => {
                task.active_user.as_ref().is_none_or(|holder| holder == user)
            }
            Self::NotArchived => !task.archived,
            Self::AssignedTo(assignee) => task.assignee == *assignee,
            Self::CompletedBy(completer) => task.completed_by == *completer,
        }
    }
}

impl fmt::Display for TaskCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(status) => write!(f, "status is {status}"),
            Self::Active(true) => write!(f, "timer is running"),
            Self::Active(false) => write!(f, "timer is stopped"),
            Self::Unclaimed => write!(f, "no member holds the timer"),
            Self::UnclaimedOrHeldBy(user) => write!(f, "timer is free or held by {user}"),
            Self::NotArchived => write!(f, "task is not archived"),
            Self::AssignedTo(assignee) => write!(f, "task is assigned to {assignee}"),
            Self::CompletedBy(Some(user)) => write!(f, "task was completed by {user}"),
            Self::CompletedBy(None) => write!(f, "task has no completer"),
        }
    }
}

/// Partial update of a task. `None` fields are left untouched.
///
/// Nested options distinguish "leave alone" (`None`) from "clear"
/// (`Some(None)`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPatch {
    /// New name.
    pub name: Option<String>,
    /// New description.
    pub description: Option<Option<String>>,
    /// New assignee.
    pub assignee: Option<Assignee>,
    /// New stored status.
    pub status: Option<TaskStatus>,
    /// Minutes to add to `time_spent` (an increment, not an assignment).
    pub add_time_spent: Option<u64>,
    /// New `is_active`.
    pub is_active: Option<bool>,
    /// New timer holder.
    pub active_user: Option<Option<UserId>>,
    /// New completer.
    pub completed_by: Option<Option<UserId>>,
    /// New at-risk flag.
    pub manually_marked_at_risk: Option<bool>,
    /// New archived flag.
    pub archived: Option<bool>,
    /// New last-activity timestamp.
    pub last_activity: Option<u64>,
}

impl TaskPatch {
    /// Applies every set field to `task`.
    pub fn apply_to(&self, task: &mut Task) {
        if let Some(name) = &self.name {
            task.name.clone_from(name);
        }
        if let Some(description) = &self.description {
            task.description.clone_from(description);
        }
        if let Some(assignee) = &self.assignee {
            task.assignee = assignee.clone();
        }
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(minutes) = self.add_time_spent {
            task.time_spent = task.time_spent.saturating_add(minutes);
        }
        if let Some(active) = self.is_active {
            task.is_active = active;
        }
        if let Some(holder) = &self.active_user {
            task.active_user.clone_from(holder);
        }
        if let Some(completer) = &self.completed_by {
            task.completed_by.clone_from(completer);
        }
        if let Some(at_risk) = self.manually_marked_at_risk {
            task.manually_marked_at_risk = at_risk;
        }
        if let Some(archived) = self.archived {
            task.archived = archived;
        }
        if let Some(at) = self.last_activity {
            task.last_activity = at;
        }
    }
}

/// Partial update of a team document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamPatch {
    /// New display name.
    pub name: Option<String>,
    /// New leader (`Some(None)` leaves the team leaderless).
    pub leader: Option<Option<UserId>>,
    /// Member to append (no-op if already present).
    pub add_member: Option<UserId>,
    /// Member to remove.
    pub remove_member: Option<UserId>,
}

impl TeamPatch {
    /// Applies every set field to `team`.
    pub fn apply_to(&self, team: &mut Team) {
        if let Some(name) = &self.name {
            team.name.clone_from(name);
        }
        if let Some(user) = &self.remove_member {
            team.members.retain(|m| !m.is(user));
        }
        if let Some(user) = &self.add_member
            && !team.is_member(user)
        {
            team.members.push(Assignee::Member(user.clone()));
        }
        if let Some(leader) = &self.leader {
            team.leader.clone_from(leader);
        }
    }
}

/// Partial update of a user profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPatch {
    /// New display name.
    pub name: Option<String>,
    /// New email.
    pub email: Option<String>,
    /// New role label.
    pub role: Option<String>,
}

impl UserPatch {
    /// Applies every set field to `profile`.
    pub fn apply_to(&self, profile: &mut UserProfile) {
        if let Some(name) = &self.name {
            profile.name.clone_from(name);
        }
        if let Some(email) = &self.email {
            profile.email.clone_from(email);
        }
        if let Some(role) = &self.role {
            profile.role.clone_from(role);
        }
    }
}

/// One mutation inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Write {
    /// Create a team; fails with [`StoreFailure::Conflict`] if the code is taken.
    CreateTeam(Team),
    /// Update an existing team.
    PatchTeam {
        /// Team to update.
        code: TeamCode,
        /// Fields to change.
        patch: TeamPatch,
    },
    /// Delete a team with its tasks, contributions, sessions and messages,
    /// and unlink it from every member profile.
    DeleteTeamCascade(TeamCode),
    /// Insert or replace a task.
    PutTask(Task),
    /// Conditionally update a task.
    PatchTask {
        /// Task to update.
        id: TaskId,
        /// Guards that must all hold.
        expect: Vec<TaskCondition>,
        /// Fields to change.
        patch: TaskPatch,
    },
    /// Delete one task.
    DeleteTask(TaskId),
    /// Hand every non-archived task of a departing member to the team.
    ReassignTasks {
        /// Team whose tasks are reassigned.
        team: TeamCode,
        /// Departing member.
        from: UserId,
    },
    /// Apply a signed delta to a contribution counter, creating it lazily.
    AdjustContribution {
        /// Team of the counter.
        team: TeamCode,
        /// Credited user.
        user: UserId,
        /// Signed change to `tasks_completed`.
        tasks_completed: i64,
        /// Signed change to `total_time_spent` (seconds).
        seconds: i64,
        /// Timestamp recorded as `last_active`.
        at: u64,
    },
    /// Overwrite a contribution counter (used by reconciliation). Fails
    /// with [`StoreFailure::PreconditionFailed`] unless the stored counter
    /// still equals `expect` (`None`: no counter stored).
    SetContribution {
        /// Counter as read before the overwrite was computed.
        expect: Option<Contribution>,
        /// New counter.
        contribution: Contribution,
    },
    /// Append a session record.
    AddSession(Session),
    /// Append a chat message.
    PutMessage(ChatMessage),
    /// Write a profile, optionally only when none exists yet.
    PutUser {
        /// Profile to write.
        profile: UserProfile,
        /// Skip the write when the profile already exists.
        only_if_absent: bool,
    },
    /// Update an existing profile.
    PatchUser {
        /// Profile to update.
        uid: UserId,
        /// Fields to change.
        patch: UserPatch,
    },
    /// Add a team code to a profile, creating a placeholder profile if needed.
    LinkTeam {
        /// Profile to update.
        uid: UserId,
        /// Code to add.
        team: TeamCode,
        /// Timestamp used if a placeholder profile is created.
        at: u64,
    },
    /// Remove a team code from a profile (no-op for unknown profiles).
    UnlinkTeam {
        /// Profile to update.
        uid: UserId,
        /// Code to remove.
        team: TeamCode,
    },
    /// Replace a profile's joined teams.
    SetJoinedTeams {
        /// Profile to update.
        uid: UserId,
        /// New list of codes.
        teams: Vec<TeamCode>,
    },
}

/// An ordered list of writes committed atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteBatch {
    writes: Vec<Write>,
}

impl WriteBatch {
    /// Creates an empty batch.
    #[must_use]
    pub const fn new() -> Self {
        Self { writes: Vec::new() }
    }

    /// Appends a write.
    pub fn push(&mut self, write: Write) {
        self.writes.push(write);
    }

    /// Appends a write, builder style.
    #[must_use]
    pub fn with(mut self, write: Write) -> Self {
        self.writes.push(write);
        self
    }

    /// Appends every write of `other`.
    pub fn extend(&mut self, other: Self) {
        self.writes.extend(other.writes);
    }

    /// Writes in commit order.
    #[must_use]
    pub fn writes(&self) -> &[Write] {
        &self.writes
    }

    /// Number of writes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Whether the batch has no writes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

impl From<Write> for WriteBatch {
    fn from(write: Write) -> Self {
        Self::new().with(write)
    }
}

/// Why the store refused a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum StoreFailure {
    /// A referenced document does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// A [`TaskCondition`] did not hold; nothing was written.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    /// A document that must not exist already does.
    #[error("conflict: {0}")]
    Conflict(String),
    /// The request was malformed.
    #[error("invalid request: {0}")]
    Invalid(String),
    /// The store (or a backing service) cannot serve the request.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

/// A client request carried in a [`ClientFrame`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Atomically apply a batch.
    Commit(WriteBatch),
    /// Run a query once.
    Query(Query),
    /// Start a live query; snapshots arrive as [`ServerFrame::Snapshot`].
    Subscribe {
        /// Client-chosen subscription id.
        subscription: u64,
        /// Query to keep live.
        query: Query,
    },
    /// Stop a live query.
    Unsubscribe {
        /// Subscription to stop.
        subscription: u64,
    },
    /// Mint a video-call token.
    CallToken(CallTokenRequest),
}

/// Successful outcome of a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    /// The batch was applied.
    Committed,
    /// Query result.
    Snapshot(Snapshot),
    /// The live query is registered; its first snapshot follows.
    Subscribed,
    /// The live query was stopped.
    Unsubscribed,
    /// Minted call credentials.
    CallToken(CallTokenResponse),
}

/// Frame sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientFrame {
    /// Correlation id echoed in the reply.
    pub id: u64,
    /// The request.
    pub request: Request,
}

/// Frame sent from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerFrame {
    /// Answer to the client frame with the same id.
    Reply {
        /// Correlation id of the request.
        id: u64,
        /// Outcome.
        result: Result<Reply, StoreFailure>,
    },
    /// Pushed result of a live query.
    Snapshot {
        /// Subscription the snapshot belongs to.
        subscription: u64,
        /// Fresh result.
        snapshot: Snapshot,
    },
    /// Connection-level problem not tied to a request.
    Error {
        /// Human-readable description.
        reason: String,
    },
}

/// Encodes a [`ClientFrame`] into bytes using postcard.
///
/// # Errors
///
/// Returns an error string if serialization fails.
pub fn encode_client(frame: &ClientFrame) -> Result<Vec<u8>, String> {
    postcard::to_allocvec(frame).map_err(|e| format!("client frame encode error: {e}"))
}

/// Decodes a [`ClientFrame`] from bytes using postcard.
///
/// # Errors
///
/// Returns an error string if deserialization fails.
pub fn decode_client(bytes: &[u8]) -> Result<ClientFrame, String> {
    postcard::from_bytes(bytes).map_err(|e| format!("client frame decode error: {e}"))
}

/// Encodes a [`ServerFrame`] into bytes using postcard.
///
/// # Errors
///
/// Returns an error string if serialization fails.
pub fn encode_server(frame: &ServerFrame) -> Result<Vec<u8>, String> {
    postcard::to_allocvec(frame).map_err(|e| format!("server frame encode error: {e}"))
}

/// Decodes a [`ServerFrame`] from bytes using postcard.
///
/// # Errors
///
/// Returns an error string if deserialization fails.
pub fn decode_server(bytes: &[u8]) -> Result<ServerFrame, String> {
    postcard::from_bytes(bytes).map_err(|e| format!("server frame decode error: {e}"))
}
