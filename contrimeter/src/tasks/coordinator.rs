//! Per-user, per-team task coordinator.
//!
//! The coordinator keeps a cache of the team document and its non-archived
//! tasks (replaced wholesale by every pushed snapshot), validates each user
//! action against [`rules`](super::rules), and turns it into one atomic
//! [`WriteBatch`]. Conditional writes make the store the arbiter of races:
//! when a precondition fails the task is re-read and the refusal is mapped
//! to a typed [`TaskError`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use contrimeter_proto::model::{
    Assignee, Session, SessionId, Task, TaskId, TaskStatus, Team, TeamCode, UserId,
};
use contrimeter_proto::store::{
    ArchiveScope, Query, Snapshot, TaskCondition, TaskPatch, Write, WriteBatch,
};
use parking_lot::Mutex;

use super::rules::{self, display_status, whole_minutes};
use super::{TaskError, TaskFilter, TaskPolicy, validate_description, validate_name};
use crate::store::{self, DocumentStore, StoreError, Subscription};
use crate::timer::{Clock, SystemClock, TimerBoard};

/// How long after a local start a snapshot that does not yet show the
/// task as running is ignored by timer reconciliation.
pub const DEFAULT_START_GRACE: Duration = Duration::from_secs(1);

/// Result of a successful timer stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopOutcome {
    /// Stopped task.
    pub task: TaskId,
    /// Elapsed seconds, credited to the contribution counter.
    pub seconds: u64,
    /// Whole minutes added to the task's `time_spent`.
    pub minutes: u64,
}

/// What the caller was attempting when a precondition failed.
#[derive(Debug, Clone, Copy)]
enum Attempt {
    Start,
    Finish,
    Edit,
    Reassign,
}

#[derive(Default)]
struct Cache {
    team: Option<Team>,
    tasks: Vec<Task>,
    /// Created locally, not yet seen in a snapshot.
    pending: HashSet<TaskId>,
}

/// Task state machine for one user in one team.
pub struct Coordinator<S> {
    store: Arc<S>,
    me: UserId,
    team_code: TeamCode,
    policy: TaskPolicy,
    cache: Mutex<Cache>,
    timers: Arc<TimerBoard>,
    start_grace: Duration,
}

impl<S: DocumentStore> Coordinator<S> {
    /// Creates a coordinator on the wall clock with the default policy.
    #[must_use]
    pub fn new(store: Arc<S>, me: UserId, team_code: TeamCode) -> Self {
        Self {
            store,
            me,
            team_code,
            policy: TaskPolicy::default(),
            cache: Mutex::new(Cache::default()),
            timers: Arc::new(TimerBoard::new(Arc::new(SystemClock))),
            start_grace: DEFAULT_START_GRACE,
        }
    }

    /// Uses `clock` for timers and timestamps. Discards any running timer.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.timers = Arc::new(TimerBoard::new(clock));
        self
    }

    /// Sets the archive/delete policy for common tasks.
    #[must_use]
    pub fn with_policy(mut self, policy: TaskPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the start grace window used by timer reconciliation.
    #[must_use]
    pub fn with_start_grace(mut self, grace: Duration) -> Self {
        self.start_grace = grace;
        self
    }

    /// The acting user.
    #[must_use]
    pub const fn me(&self) -> &UserId {
        &self.me
    }

    /// The coordinated team.
    #[must_use]
    pub const fn team_code(&self) -> &TeamCode {
        &self.team_code
    }

    /// The local timers.
    #[must_use]
    pub const fn timers(&self) -> &Arc<TimerBoard> {
        &self.timers
    }

    /// Cached team document.
    #[must_use]
    pub fn team(&self) -> Option<Team> {
        self.cache.lock().team.clone()
    }

    /// Cached non-archived tasks, oldest first.
    #[must_use]
    pub fn tasks(&self) -> Vec<Task> {
        self.cache.lock().tasks.clone()
    }

    /// One cached task.
    #[must_use]
    pub fn task(&self, id: TaskId) -> Option<Task> {
        self.cache.lock().tasks.iter().find(|t| t.id == id).cloned()
    }

    /// Elapsed seconds of the local timer for `id`.
    #[must_use]
    pub fn elapsed(&self, id: TaskId) -> Option<u64> {
        self.timers.elapsed(id)
    }

    /// Cached tasks passing `filter`; with `mine_only`, only tasks assigned
    /// to me or common tasks whose timer I hold.
    #[must_use]
    pub fn visible_tasks(&self, filter: TaskFilter, mine_only: bool) -> Vec<Task> {
        self.cache
            .lock()
            .tasks
            .iter()
            .filter(|t| !t.archived && filter.accepts(display_status(t)))
            .filter(|t| {
                !mine_only || t.assignee.is(&self.me) || t.active_user.as_ref() == Some(&self.me)
            })
            .cloned()
            .collect()
    }

    // --- sync ---

    /// Reads the team and its tasks once and replaces the cache.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::TeamNotFound`] if the team does not exist, or
    /// [`TaskError::Store`] if a query fails.
    pub async fn load(&self) -> Result<(), TaskError> {
        let team = store::into_team(self.store.query(Query::Team(self.team_code.clone())).await?)?
            .ok_or_else(|| TaskError::TeamNotFound(self.team_code.clone()))?;
        let tasks = store::into_tasks(self.store.query(self.tasks_query()).await?)?;
        self.apply_team(Some(team));
        let dropped = self.apply_tasks(tasks);
        if !dropped.is_empty() {
            tracing::debug!(count = dropped.len(), "dropped stale local timers on load");
        }
        Ok(())
    }

    /// Live query over the team's non-archived tasks.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the subscription cannot be registered.
    pub async fn subscribe_tasks(&self) -> Result<Subscription, StoreError> {
        self.store.subscribe(self.tasks_query()).await
    }

    /// Live query over the team document.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the subscription cannot be registered.
    pub async fn subscribe_team(&self) -> Result<Subscription, StoreError> {
        self.store
            .subscribe(Query::Team(self.team_code.clone()))
            .await
    }

    /// Feeds a pushed snapshot (team or tasks) into the cache. Returns the
    /// tasks whose local timers were dropped.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnexpectedReply`] for any other snapshot kind.
    pub fn apply_snapshot(&self, snapshot: Snapshot) -> Result<Vec<TaskId>, StoreError> {
        match snapshot {
            Snapshot::Team(team) => {
                self.apply_team(team);
                Ok(Vec::new())
            }
            Snapshot::Tasks(tasks) => Ok(self.apply_tasks(tasks)),
            other => Err(StoreError::UnexpectedReply {
                expected: "team or tasks",
                got: other.kind().to_string(),
            }),
        }
    }

    /// Replaces the cached team document.
    pub fn apply_team(&self, team: Option<Team>) {
        if team.is_none() {
            tracing::info!(team = %self.team_code, "team no longer exists");
        }
        self.cache.lock().team = team;
    }

    /// Replaces the cached task list and reconciles local timers with it.
    ///
    /// A local timer is dropped, without flushing its time, when its task
    /// is gone, done, archived, no longer active, or (for a common task)
    /// held by someone else; the authoritative stop already happened
    /// elsewhere. Timers started within the grace window are left alone.
    /// Locally created tasks not yet in the snapshot are kept. Returns the
    /// tasks whose timers were dropped.
    pub fn apply_tasks(&self, snapshot: Vec<Task>) -> Vec<TaskId> {
        let now = self.now();
        let grace = u64::try_from(self.start_grace.as_millis()).unwrap_or(u64::MAX);
        let mut dropped = Vec::new();
        for id in self.timers.running() {
            let Some(timer) = self.timers.get(id) else {
                continue;
            };
            if now.saturating_sub(timer.started_at) < grace {
                continue;
            }
            let still_running = snapshot
                .iter()
                .find(|t| t.id == id)
                .is_some_and(|t| self.runs_here(t));
            if !still_running && self.timers.discard(id) {
                tracing::debug!(task = %id, "timer stopped elsewhere, dropping local run");
                dropped.push(id);
            }
        }

        let mut cache = self.cache.lock();
        let mut tasks: Vec<Task> = snapshot.into_iter().filter(|t| !t.archived).collect();
        cache.pending.retain(|id| !tasks.iter().any(|t| t.id == *id));
        let provisional: Vec<Task> = cache
            .tasks
            .iter()
            .filter(|t| cache.pending.contains(&t.id))
            .cloned()
            .collect();
        tasks.extend(provisional);
        cache.tasks = tasks;
        dropped
    }

    // --- task editing ---

    /// Creates a task. It enters the cache immediately under its
    /// provisional id and is then persisted.
    ///
    /// # Errors
    ///
    /// Returns a validation error, [`TaskError::InvalidAssignee`] if the
    /// assignee is not in the team, [`TaskError::NotPermitted`] if I am not
    /// a member, or [`TaskError::Store`] if the write fails (the
    /// provisional task is then removed).
    pub async fn create_task(
        &self,
        name: &str,
        description: Option<&str>,
        assignee: Assignee,
    ) -> Result<TaskId, TaskError> {
        let name = validate_name(name)?;
        let description = validate_description(description)?;
        let team = self.loaded_team()?;
        if !team.is_member(&self.me) {
            return Err(TaskError::NotPermitted("create"));
        }
        if !team.accepts(&assignee) {
            return Err(TaskError::InvalidAssignee(assignee.to_string()));
        }

        let mut task = Task::new(
            TaskId::new(),
            self.team_code.clone(),
            name,
            assignee,
            self.me.clone(),
            self.now(),
        );
        task.description = description;
        let id = task.id;
        {
            let mut cache = self.cache.lock();
            cache.pending.insert(id);
            cache.tasks.push(task.clone());
        }

        if let Err(e) = self.store.commit(Write::PutTask(task).into()).await {
            tracing::warn!(task = %id, error = %e, "failed to persist new task");
            let mut cache = self.cache.lock();
            cache.pending.remove(&id);
            cache.tasks.retain(|t| t.id != id);
            return Err(e.into());
        }
        tracing::info!(task = %id, team = %self.team_code, "task created");
        Ok(id)
    }

    /// Renames a task.
    ///
    /// # Errors
    ///
    /// Returns a validation error, [`TaskError::NotPermitted`], or a store
    /// error.
    pub async fn rename_task(&self, id: TaskId, name: &str) -> Result<(), TaskError> {
        let name = validate_name(name)?;
        let team = self.loaded_team()?;
        let task = self.cached(id)?;
        if !rules::can_edit(&task, &self.me, &team) {
            return Err(TaskError::NotPermitted("rename"));
        }
        let patch = TaskPatch {
            name: Some(name),
            last_activity: Some(self.now()),
            ..TaskPatch::default()
        };
        self.patch(id, vec![TaskCondition::NotArchived], patch, Attempt::Edit)
            .await
    }

    /// Sets or clears a task's description.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::DescriptionTooLong`], [`TaskError::NotPermitted`],
    /// or a store error.
    pub async fn describe_task(
        &self,
        id: TaskId,
        description: Option<&str>,
    ) -> Result<(), TaskError> {
        let description = validate_description(description)?;
        let team = self.loaded_team()?;
        let task = self.cached(id)?;
        if !rules::can_edit(&task, &self.me, &team) {
            return Err(TaskError::NotPermitted("describe"));
        }
        let patch = TaskPatch {
            description: Some(description),
            last_activity: Some(self.now()),
            ..TaskPatch::default()
        };
        self.patch(id, vec![TaskCondition::NotArchived], patch, Attempt::Edit)
            .await
    }

    /// Hands a pending task to another member or to the team. Done tasks
    /// keep their assignee, since it carries the completion credit.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::NotPermitted`], [`TaskError::InvalidAssignee`],
    /// [`TaskError::AlreadyDone`], [`TaskError::TimerRunning`], or a store
    /// error.
    pub async fn reassign_task(&self, id: TaskId, to: Assignee) -> Result<(), TaskError> {
        let team = self.loaded_team()?;
        let task = self.cached(id)?;
        if !rules::can_reassign(&task, &self.me, &team) {
            return Err(TaskError::NotPermitted("reassign"));
        }
        if !team.accepts(&to) {
            return Err(TaskError::InvalidAssignee(to.to_string()));
        }
        if task.is_done() {
            return Err(TaskError::AlreadyDone);
        }
        if task.is_active {
            return Err(TaskError::TimerRunning);
        }
        let patch = TaskPatch {
            assignee: Some(to),
            last_activity: Some(self.now()),
            ..TaskPatch::default()
        };
        let expect = vec![
            TaskCondition::NotArchived,
            TaskCondition::Active(false),
            TaskCondition::Status(TaskStatus::Pending),
        ];
        self.patch(id, expect, patch, Attempt::Reassign).await
    }

    // --- state transitions ---

    /// Flips a task between pending and done and returns the new status.
    ///
    /// Completing stops a local timer and flushes its time in the same
    /// batch and credits the completion (+1); reopening debits the credited
    /// user (-1). A common task cannot be completed while another member
    /// holds its timer.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::NotPermitted`], [`TaskError::ClaimedByOther`],
    /// [`TaskError::Archived`], [`TaskError::Stale`], or a store error.
    pub async fn toggle_done(&self, id: TaskId) -> Result<TaskStatus, TaskError> {
        let team = self.loaded_team()?;
        let task = self.cached(id)?;
        if task.archived {
            return Err(TaskError::Archived);
        }
        if !rules::is_workable_by(&task, &self.me) {
            return Err(TaskError::NotPermitted("complete"));
        }

        let now = self.now();
        let status = task.status.toggled();
        let mut expect = vec![
            TaskCondition::Status(task.status),
            TaskCondition::AssignedTo(task.assignee.clone()),
        ];
        let mut patch = TaskPatch {
            status: Some(status),
            last_activity: Some(now),
            ..TaskPatch::default()
        };
        let mut extra = Vec::new();
        let mut flushed = false;

        match status {
            TaskStatus::Done => {
                if task.assignee.is_common() {
                    if let Some(holder) = task.active_user.as_ref().filter(|h| **h != self.me) {
                        return Err(TaskError::ClaimedByOther(holder.clone()));
                    }
                    expect.push(TaskCondition::UnclaimedOrHeldBy(self.me.clone()));
                    patch.completed_by = Some(Some(self.me.clone()));
                    patch.active_user = Some(None);
                }
                patch.is_active = Some(false);
                if let Some(seconds) = self.timers.elapsed(id) {
                    let minutes = whole_minutes(seconds);
                    patch.add_time_spent = (minutes > 0).then_some(minutes);
                    extra = self.flush_writes(&task, seconds, now);
                    flushed = true;
                }
                let credited = task
                    .assignee
                    .member()
                    .cloned()
                    .unwrap_or_else(|| self.me.clone());
                extra.push(self.completion_delta(credited, 1, now));
            }
            TaskStatus::Pending => {
                if !rules::can_toggle_done(&task, &self.me, &team) {
                    return Err(TaskError::NotPermitted("reopen"));
                }
                if task.assignee.is_common() {
                    expect.push(TaskCondition::CompletedBy(task.completed_by.clone()));
                    patch.completed_by = Some(None);
                }
                match rules::completion_credit(&task) {
                    Some(credited) => extra.push(self.completion_delta(credited, -1, now)),
                    None => tracing::warn!(
                        task = %id,
                        "reopened common task has no completer, no contribution debited"
                    ),
                }
            }
        }

        let mut batch = WriteBatch::from(Write::PatchTask {
            id,
            expect,
            patch: patch.clone(),
        });
        for write in extra {
            batch.push(write);
        }
        if let Err(e) = self.store.commit(batch).await {
            return Err(self.explain(id, e, Attempt::Finish).await);
        }
        if flushed {
            self.timers.discard(id);
        }
        self.apply_local(id, &patch);
        tracing::info!(task = %id, %status, "task status changed");
        Ok(status)
    }

    /// Flips the advisory at-risk flag and returns its new value.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::AlreadyDone`], [`TaskError::NotPermitted`], or a
    /// store error.
    pub async fn toggle_at_risk(&self, id: TaskId) -> Result<bool, TaskError> {
        let team = self.loaded_team()?;
        let task = self.cached(id)?;
        if task.is_done() {
            return Err(TaskError::AlreadyDone);
        }
        if !rules::can_flag(&self.me, &team) {
            return Err(TaskError::NotPermitted("flag"));
        }
        let flag = !task.manually_marked_at_risk;
        let patch = TaskPatch {
            manually_marked_at_risk: Some(flag),
            ..TaskPatch::default()
        };
        let expect = vec![
            TaskCondition::Status(TaskStatus::Pending),
            TaskCondition::NotArchived,
        ];
        self.patch(id, expect, patch, Attempt::Start).await?;
        Ok(flag)
    }

    /// Starts a timer. For a common task this claims it: the write only
    /// lands if nobody else holds the timer.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::AlreadyDone`], [`TaskError::Archived`],
    /// [`TaskError::NotPermitted`], [`TaskError::ClaimedByOther`],
    /// [`TaskError::AlreadyRunning`], or a store error. No local timer is
    /// started on error.
    pub async fn start_timer(&self, id: TaskId) -> Result<(), TaskError> {
        let task = self.cached(id)?;
        if task.archived {
            return Err(TaskError::Archived);
        }
        if task.is_done() {
            return Err(TaskError::AlreadyDone);
        }
        if !rules::is_workable_by(&task, &self.me) {
            return Err(TaskError::NotPermitted("start"));
        }
        if self.timers.is_running(id) {
            return Err(TaskError::AlreadyRunning);
        }
        if task.is_active {
            return Err(match &task.active_user {
                Some(holder) if *holder != self.me => TaskError::ClaimedByOther(holder.clone()),
                _ => TaskError::AlreadyRunning,
            });
        }

        let now = self.now();
        let mut expect = vec![
            TaskCondition::Status(TaskStatus::Pending),
            TaskCondition::NotArchived,
            TaskCondition::Active(false),
        ];
        let mut patch = TaskPatch {
            is_active: Some(true),
            last_activity: Some(now),
            ..TaskPatch::default()
        };
        if task.assignee.is_common() {
            expect.push(TaskCondition::UnclaimedOrHeldBy(self.me.clone()));
            patch.active_user = Some(Some(self.me.clone()));
        }

        let batch = WriteBatch::from(Write::PatchTask {
            id,
            expect,
            patch: patch.clone(),
        });
        if let Err(e) = self.store.commit(batch).await {
            return Err(self.explain(id, e, Attempt::Start).await);
        }
        self.timers.start_at(id, now);
        self.apply_local(id, &patch);
        tracing::info!(task = %id, "timer started");
        Ok(())
    }

    /// Stops the local timer and commits, in one batch: the task patch
    /// (whole minutes added to `time_spent`), a session record, and the
    /// contribution time delta in seconds.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::NotRunning`] if no local timer runs,
    /// [`TaskError::StoppedElsewhere`] if the task was stopped on another
    /// device (the local run is dropped without flushing), or a store error
    /// (the local timer keeps running so the stop can be retried).
    pub async fn stop_timer(&self, id: TaskId) -> Result<StopOutcome, TaskError> {
        let Some(seconds) = self.timers.elapsed(id) else {
            return Err(TaskError::NotRunning);
        };
        let task = match self.task(id) {
            Some(task) => task,
            None => match self.fetch(id).await? {
                Some(task) => task,
                None => {
                    self.timers.discard(id);
                    return Err(TaskError::StoppedElsewhere);
                }
            },
        };

        let now = self.now();
        let minutes = whole_minutes(seconds);
        let patch = Self::stop_patch(&task, minutes, now);
        let mut batch = WriteBatch::from(Write::PatchTask {
            id,
            expect: self.held_conditions(&task),
            patch: patch.clone(),
        });
        for write in self.flush_writes(&task, seconds, now) {
            batch.push(write);
        }

        match self.store.commit(batch).await {
            Ok(()) => {
                self.timers.discard(id);
                self.apply_local(id, &patch);
                tracing::info!(task = %id, seconds, minutes, "timer stopped");
                Ok(StopOutcome {
                    task: id,
                    seconds,
                    minutes,
                })
            }
            Err(e) if e.is_precondition_failed() || e.is_not_found() => {
                self.timers.discard(id);
                tracing::warn!(task = %id, seconds, "timer already stopped elsewhere, discarding local run");
                Err(TaskError::StoppedElsewhere)
            }
            Err(e) => {
                tracing::warn!(task = %id, error = %e, "failed to stop timer, keeping local run");
                Err(e.into())
            }
        }
    }

    /// Stops every local timer.
    pub async fn stop_all_timers(&self) -> Vec<(TaskId, Result<StopOutcome, TaskError>)> {
        let mut results = Vec::new();
        for id in self.timers.running() {
            results.push((id, self.stop_timer(id).await));
        }
        results
    }

    // --- archive and delete ---

    /// Archives a task. A timer running locally is flushed in the same
    /// batch; a timer running elsewhere blocks the archive.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::NotPermitted`], [`TaskError::TimerRunning`],
    /// [`TaskError::Archived`], or a store error.
    pub async fn archive(&self, id: TaskId) -> Result<(), TaskError> {
        let team = self.loaded_team()?;
        let task = self.cached(id)?;
        if task.archived {
            return Err(TaskError::Archived);
        }
        if !rules::can_archive(&task, &self.me, &team, &self.policy) {
            return Err(TaskError::NotPermitted("archive"));
        }
        let local = self.timers.elapsed(id);
        if task.is_active && local.is_none() {
            return Err(TaskError::TimerRunning);
        }

        let now = self.now();
        let mut expect = vec![TaskCondition::NotArchived];
        let mut patch = TaskPatch {
            archived: Some(true),
            last_activity: Some(now),
            ..TaskPatch::default()
        };
        let mut extra = Vec::new();
        if let Some(seconds) = local {
            let stop = Self::stop_patch(&task, whole_minutes(seconds), now);
            patch.is_active = stop.is_active;
            patch.active_user = stop.active_user;
            patch.add_time_spent = stop.add_time_spent;
            expect.extend(self.held_conditions(&task));
            extra = self.flush_writes(&task, seconds, now);
        } else {
            expect.push(TaskCondition::Active(false));
        }

        let mut batch = WriteBatch::from(Write::PatchTask { id, expect, patch });
        for write in extra {
            batch.push(write);
        }
        if let Err(e) = self.store.commit(batch).await {
            return Err(self.explain(id, e, Attempt::Edit).await);
        }
        self.timers.discard(id);
        self.forget(id);
        tracing::info!(task = %id, "task archived");
        Ok(())
    }

    /// Restores an archived task to the default views.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::NotFound`], [`TaskError::NotArchived`],
    /// [`TaskError::NotPermitted`], or a store error.
    pub async fn unarchive(&self, id: TaskId) -> Result<(), TaskError> {
        let team = self.loaded_team()?;
        let mut task = self.fetch(id).await?.ok_or(TaskError::NotFound(id))?;
        if !task.archived {
            return Err(TaskError::NotArchived);
        }
        if !rules::can_archive(&task, &self.me, &team, &self.policy) {
            return Err(TaskError::NotPermitted("unarchive"));
        }
        let patch = TaskPatch {
            archived: Some(false),
            last_activity: Some(self.now()),
            ..TaskPatch::default()
        };
        self.store
            .commit(
                Write::PatchTask {
                    id,
                    expect: Vec::new(),
                    patch: patch.clone(),
                }
                .into(),
            )
            .await
            .map_err(|e| Self::not_found_as_task(id, e))?;
        patch.apply_to(&mut task);
        self.upsert(task);
        tracing::info!(task = %id, "task unarchived");
        Ok(())
    }

    /// Archived tasks of the team, or only mine.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn archived_tasks(&self, mine_only: bool) -> Result<Vec<Task>, TaskError> {
        let query = if mine_only {
            Query::ArchivedTasksOf {
                team: self.team_code.clone(),
                assignee: Assignee::Member(self.me.clone()),
            }
        } else {
            Query::TeamTasks {
                team: self.team_code.clone(),
                scope: ArchiveScope::Archived,
            }
        };
        Ok(store::into_tasks(self.store.query(query).await?)?)
    }

    /// Deletes a task permanently. Refused while any timer runs on it.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::NotFound`], [`TaskError::NotPermitted`],
    /// [`TaskError::TimerRunning`], or a store error.
    pub async fn delete(&self, id: TaskId) -> Result<(), TaskError> {
        let team = self.loaded_team()?;
        let task = match self.task(id) {
            Some(task) => task,
            None => self.fetch(id).await?.ok_or(TaskError::NotFound(id))?,
        };
        if !rules::can_delete(&task, &self.me, &team, &self.policy) {
            return Err(TaskError::NotPermitted("delete"));
        }
        if task.is_active {
            return Err(TaskError::TimerRunning);
        }

        let batch = WriteBatch::new()
            .with(Write::PatchTask {
                id,
                expect: vec![TaskCondition::Active(false)],
                patch: TaskPatch::default(),
            })
            .with(Write::DeleteTask(id));
        if let Err(e) = self.store.commit(batch).await {
            return Err(self.explain(id, e, Attempt::Edit).await);
        }
        self.timers.discard(id);
        self.forget(id);
        tracing::info!(task = %id, "task deleted");
        Ok(())
    }

    /// Archives every done task I may archive, in one batch. Returns the
    /// archived ids.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Stale`] if any of them changed meanwhile
    /// (nothing is archived), or a store error.
    pub async fn archive_completed(&self) -> Result<Vec<TaskId>, TaskError> {
        let team = self.loaded_team()?;
        let now = self.now();
        let ids: Vec<TaskId> = self
            .tasks()
            .iter()
            .filter(|t| t.is_done() && !t.archived)
            .filter(|t| rules::can_archive(t, &self.me, &team, &self.policy))
            .map(|t| t.id)
            .collect();
        let Some(first) = ids.first().copied() else {
            return Ok(Vec::new());
        };

        let mut batch = WriteBatch::new();
        for id in &ids {
            batch.push(Write::PatchTask {
                id: *id,
                expect: vec![
                    TaskCondition::Status(TaskStatus::Done),
                    TaskCondition::NotArchived,
                ],
                patch: TaskPatch {
                    archived: Some(true),
                    last_activity: Some(now),
                    ..TaskPatch::default()
                },
            });
        }
        if let Err(e) = self.store.commit(batch).await {
            if e.is_precondition_failed() || e.is_not_found() {
                return Err(TaskError::Stale(first));
            }
            return Err(e.into());
        }
        for id in &ids {
            self.forget(*id);
        }
        tracing::info!(count = ids.len(), "completed tasks archived");
        Ok(ids)
    }

    // --- helpers ---

    fn now(&self) -> u64 {
        self.timers.clock().now_ms()
    }

    fn tasks_query(&self) -> Query {
        Query::TeamTasks {
            team: self.team_code.clone(),
            scope: ArchiveScope::Active,
        }
    }

    fn loaded_team(&self) -> Result<Team, TaskError> {
        self.team().ok_or(TaskError::TeamNotLoaded)
    }

    fn cached(&self, id: TaskId) -> Result<Task, TaskError> {
        self.task(id).ok_or(TaskError::NotFound(id))
    }

    /// Whether a snapshot task still backs a timer running on this client.
    fn runs_here(&self, task: &Task) -> bool {
        !task.is_done()
            && !task.archived
            && task.is_active
            && (!task.assignee.is_common() || task.active_user.as_ref() == Some(&self.me))
    }

    fn held_conditions(&self, task: &Task) -> Vec<TaskCondition> {
        let mut expect = vec![TaskCondition::Active(true)];
        if task.assignee.is_common() {
            expect.push(TaskCondition::UnclaimedOrHeldBy(self.me.clone()));
        }
        expect
    }

    fn stop_patch(task: &Task, minutes: u64, now: u64) -> TaskPatch {
        TaskPatch {
            is_active: Some(false),
            active_user: task.assignee.is_common().then_some(None),
            add_time_spent: (minutes > 0).then_some(minutes),
            last_activity: Some(now),
            ..TaskPatch::default()
        }
    }

    /// Session record and contribution time delta for a finished run.
    /// Empty runs write nothing.
    fn flush_writes(&self, task: &Task, seconds: u64, now: u64) -> Vec<Write> {
        if seconds == 0 {
            return Vec::new();
        }
        let credited = rules::time_credit(task, &self.me);
        vec![
            Write::AddSession(Session {
                id: SessionId::new(),
                user_id: credited.clone(),
                team_id: self.team_code.clone(),
                task_name: task.name.clone(),
                duration: seconds,
                created_at: now,
            }),
            Write::AdjustContribution {
                team: self.team_code.clone(),
                user: credited,
                tasks_completed: 0,
                seconds: i64::try_from(seconds).unwrap_or(i64::MAX),
                at: now,
            },
        ]
    }

    fn completion_delta(&self, user: UserId, delta: i64, now: u64) -> Write {
        Write::AdjustContribution {
            team: self.team_code.clone(),
            user,
            tasks_completed: delta,
            seconds: 0,
            at: now,
        }
    }

    async fn patch(
        &self,
        id: TaskId,
        expect: Vec<TaskCondition>,
        patch: TaskPatch,
        attempt: Attempt,
    ) -> Result<(), TaskError> {
        let write = Write::PatchTask {
            id,
            expect,
            patch: patch.clone(),
        };
        if let Err(e) = self.store.commit(write.into()).await {
            return Err(self.explain(id, e, attempt).await);
        }
        self.apply_local(id, &patch);
        Ok(())
    }

    async fn fetch(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        store::into_task(self.store.query(Query::Task(id)).await?)
    }

    /// Maps a refused write to the reason the task now gives, refreshing
    /// the cached copy along the way.
    async fn explain(&self, id: TaskId, err: StoreError, attempt: Attempt) -> TaskError {
        if !err.is_precondition_failed() {
            tracing::warn!(task = %id, error = %err, "task write failed");
            return Self::not_found_as_task(id, err);
        }
        let current = match self.fetch(id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                self.forget(id);
                return TaskError::NotFound(id);
            }
            Err(e) => return e.into(),
        };
        let holder = current.active_user.clone().filter(|h| *h != self.me);
        let reason = if current.archived {
            TaskError::Archived
        } else {
            match (attempt, holder) {
                (Attempt::Start, _) if current.is_done() => TaskError::AlreadyDone,
                (Attempt::Start | Attempt::Finish, Some(holder)) => {
                    TaskError::ClaimedByOther(holder)
                }
                (Attempt::Start, None) if current.is_active => TaskError::AlreadyRunning,
                (Attempt::Edit | Attempt::Reassign, _) if current.is_active => {
                    TaskError::TimerRunning
                }
                (Attempt::Reassign, _) if current.is_done() => TaskError::AlreadyDone,
                _ => TaskError::Stale(id),
            }
        };
        tracing::debug!(task = %id, %reason, "task write refused");
        self.upsert(current);
        reason
    }

    fn not_found_as_task(id: TaskId, err: StoreError) -> TaskError {
        if err.is_not_found() {
            TaskError::NotFound(id)
        } else {
            err.into()
        }
    }

    fn apply_local(&self, id: TaskId, patch: &TaskPatch) {
        let mut cache = self.cache.lock();
        if let Some(task) = cache.tasks.iter_mut().find(|t| t.id == id) {
            patch.apply_to(task);
        }
        cache.tasks.retain(|t| !t.archived);
    }

    fn upsert(&self, task: Task) {
        let mut cache = self.cache.lock();
        cache.tasks.retain(|t| t.id != task.id);
        if !task.archived {
            cache.tasks.push(task);
            cache.tasks.sort_by_key(|t| t.created_at);
        }
    }

    fn forget(&self, id: TaskId) {
        let mut cache = self.cache.lock();
        cache.tasks.retain(|t| t.id != id);
        cache.pending.remove(&id);
    }
}
