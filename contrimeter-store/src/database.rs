//! In-memory document database with atomic, conditional write batches.
//!
//! All collections sit behind one lock. A batch is applied in place under
//! the write lock while an undo log records the prior state of every
//! document it touches; if any write (or precondition) fails the log is
//! replayed backwards, so readers never observe a half-applied batch. Each
//! successful commit publishes a [`Change`] on a broadcast channel that
//! drives live queries.

use std::collections::HashMap;
use std::sync::Arc;

use contrimeter_proto::model::{
    Assignee, ChatMessage, Contribution, Session, Task, TaskId, Team, TeamCode, UserId,
    UserProfile,
};
use contrimeter_proto::store::{Change, Query, Snapshot, StoreFailure, Write, WriteBatch};
use parking_lot::RwLock;
use tokio::sync::broadcast;

/// Capacity of the change broadcast channel. Slow subscribers that fall
/// further behind are told they lagged and re-query.
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Every collection of the store.
#[derive(Debug, Default)]
struct Collections {
    teams: HashMap<TeamCode, Team>,
    tasks: HashMap<TaskId, Task>,
    contributions: HashMap<String, Contribution>,
    sessions: Vec<Session>,
    messages: Vec<ChatMessage>,
    users: HashMap<UserId, UserProfile>,
}

/// Prior state of one document touched by an in-flight batch.
enum Undo {
    Team(TeamCode, Option<Team>),
    Task(TaskId, Option<Task>),
    Contribution(String, Option<Contribution>),
    User(UserId, Option<UserProfile>),
    SessionPushed,
    MessagePushed,
    /// Removed entries with their original positions, ascending.
    SessionsRemoved(Vec<(usize, Session)>),
    MessagesRemoved(Vec<(usize, ChatMessage)>),
}

/// The document database shared by every connection.
pub struct Database {
    collections: RwLock<Collections>,
    changes: broadcast::Sender<Arc<Change>>,
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

impl Database {
    /// Creates an empty database.
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            collections: RwLock::new(Collections::default()),
            changes,
        }
    }

    /// Applies `batch` atomically.
    ///
    /// Writes are applied in order; a precondition sees the state produced
    /// by earlier writes in the same batch. If any write fails the writes
    /// already applied are rolled back before the lock is released, so
    /// nothing is persisted and no change is published.
    ///
    /// # Errors
    ///
    /// Returns the [`StoreFailure`] of the first write that failed.
    pub fn commit(&self, batch: &WriteBatch) -> Result<(), StoreFailure> {
        let change = {
            let mut current = self.collections.write();
            let mut undo = Vec::new();
            let mut change = Change::default();
            for write in batch.writes() {
                if let Err(failure) = current.apply(write, &mut change, &mut undo) {
                    current.rollback(undo);
                    return Err(failure);
                }
            }
            change
        };

        tracing::debug!(
            writes = batch.len(),
            teams = change.teams.len(),
            users = change.users.len(),
            tasks = change.tasks.len(),
            "batch committed"
        );

        if !change.is_empty() {
            // No receivers is fine: nobody is subscribed.
            let _ = self.changes.send(Arc::new(change));
        }
        Ok(())
    }

    /// Runs a query against the current state.
    #[must_use]
    pub fn query(&self, query: &Query) -> Snapshot {
        self.collections.read().query(query)
    }

    /// Subscribes to the change feed.
    #[must_use]
    pub fn changes(&self) -> broadcast::Receiver<Arc<Change>> {
        self.changes.subscribe()
    }
}

impl Collections {
    /// Applies one write, recording in `undo` the prior state of every
    /// document it is about to modify.
    #[allow(clippy::too_many_lines)]
    fn apply(
        &mut self,
        write: &Write,
        change: &mut Change,
        undo: &mut Vec<Undo>,
    ) -> Result<(), StoreFailure> {
        match write {
            Write::CreateTeam(team) => {
                if self.teams.contains_key(&team.code) {
                    return Err(StoreFailure::Conflict(format!(
                        "team {} already exists",
                        team.code
                    )));
                }
                validate_team(team)?;
                change.touch_team(&team.code);
                undo.push(Undo::Team(team.code.clone(), None));
                self.teams.insert(team.code.clone(), team.clone());
            }
            Write::PatchTeam { code, patch } => {
                let mut team = self
                    .teams
                    .get(code)
                    .cloned()
                    .ok_or_else(|| not_found("team", code))?;
                patch.apply_to(&mut team);
                validate_team(&team)?;
                change.touch_team(code);
                let before = self.teams.insert(code.clone(), team);
                undo.push(Undo::Team(code.clone(), before));
            }
            Write::DeleteTeamCascade(code) => {
                let team = self.teams.remove(code).ok_or_else(|| not_found("team", code))?;
                undo.push(Undo::Team(code.clone(), Some(team)));
                let doomed: Vec<TaskId> = self
                    .tasks
                    .values()
                    .filter(|t| t.team_id == *code)
                    .map(|t| t.id)
                    .collect();
                for id in doomed {
                    let task = self.tasks.remove(&id);
                    undo.push(Undo::Task(id, task));
                    change.touch_task(&id, code);
                }
                let counters: Vec<String> = self
                    .contributions
                    .iter()
                    .filter(|(_, c)| c.team_id == *code)
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in counters {
                    let counter = self.contributions.remove(&key);
                    undo.push(Undo::Contribution(key, counter));
                }
                let sessions = drain_team(&mut self.sessions, |s| s.team_id == *code);
                undo.push(Undo::SessionsRemoved(sessions));
                let messages = drain_team(&mut self.messages, |m| m.team_id == *code);
                undo.push(Undo::MessagesRemoved(messages));
                for profile in self.users.values_mut() {
                    if profile.joined_teams.contains(code) {
                        undo.push(Undo::User(profile.uid.clone(), Some(profile.clone())));
                        profile.joined_teams.retain(|t| t != code);
                        change.touch_user(&profile.uid);
                    }
                }
                change.touch_team(code);
            }
            Write::PutTask(task) => {
                self.require_team(&task.team_id)?;
                validate_task(task)?;
                change.touch_task(&task.id, &task.team_id);
                let before = self.tasks.insert(task.id, task.clone());
                undo.push(Undo::Task(task.id, before));
            }
            Write::PatchTask { id, expect, patch } => {
                let mut task = self
                    .tasks
                    .get(id)
                    .cloned()
                    .ok_or_else(|| not_found("task", id))?;
                if let Some(failed) = expect.iter().find(|cond| !cond.holds(&task)) {
                    return Err(StoreFailure::PreconditionFailed(format!(
                        "task {id}: expected {failed}"
                    )));
                }
                patch.apply_to(&mut task);
                validate_task(&task)?;
                change.touch_task(id, &task.team_id);
                let before = self.tasks.insert(*id, task);
                undo.push(Undo::Task(*id, before));
            }
            Write::DeleteTask(id) => {
                let task = self.tasks.remove(id).ok_or_else(|| not_found("task", id))?;
                change.touch_task(id, &task.team_id);
                undo.push(Undo::Task(*id, Some(task)));
            }
            Write::ReassignTasks { team, from } => {
                self.require_team(team)?;
                for task in self.tasks.values_mut().filter(|t| t.team_id == *team) {
                    let handed_over = !task.archived && task.assignee.is(from);
                    let held = task.active_user.as_ref() == Some(from);
                    if !handed_over && !held {
                        continue;
                    }
                    undo.push(Undo::Task(task.id, Some(task.clone())));
                    if handed_over {
                        task.assignee = Assignee::Common;
                        // Keep the completion credited to the departing member.
                        if task.is_done() && task.completed_by.is_none() {
                            task.completed_by = Some(from.clone());
                        }
                        // A personal timer has no holder; it cannot survive the handover.
                        if task.active_user.is_none() {
                            task.is_active = false;
                        }
                    }
                    if held {
                        task.active_user = None;
                        task.is_active = false;
                    }
                    change.touch_task(&task.id, team);
                }
                change.touch_team(team);
            }
            Write::AdjustContribution {
                team,
                user,
                tasks_completed,
                seconds,
                at,
            } => {
                self.require_team(team)?;
                let key = Contribution::key(team, user);
                undo.push(Undo::Contribution(
                    key.clone(),
                    self.contributions.get(&key).cloned(),
                ));
                let entry = self.contributions.entry(key).or_insert_with(|| Contribution {
                    team_id: team.clone(),
                    user_id: user.clone(),
                    tasks_completed: 0,
                    total_time_spent: 0,
                    last_active: *at,
                    created_at: *at,
                });
                entry.tasks_completed = apply_delta(entry.tasks_completed, *tasks_completed);
                entry.total_time_spent = apply_delta(entry.total_time_spent, *seconds);
                entry.last_active = *at;
                change.touch_team(team);
            }
            Write::SetContribution {
                expect,
                contribution,
            } => {
                self.require_team(&contribution.team_id)?;
                let key = Contribution::key(&contribution.team_id, &contribution.user_id);
                if self.contributions.get(&key) != expect.as_ref() {
                    return Err(StoreFailure::PreconditionFailed(format!(
                        "contribution {key} changed since it was read"
                    )));
                }
                let before = self.contributions.insert(key.clone(), contribution.clone());
                undo.push(Undo::Contribution(key, before));
                change.touch_team(&contribution.team_id);
            }
            Write::AddSession(session) => {
                self.require_team(&session.team_id)?;
                change.touch_team(&session.team_id);
                self.sessions.push(session.clone());
                undo.push(Undo::SessionPushed);
            }
            Write::PutMessage(message) => {
                self.require_team(&message.team_id)?;
                change.touch_team(&message.team_id);
                self.messages.push(message.clone());
                undo.push(Undo::MessagePushed);
            }
            Write::PutUser {
                profile,
                only_if_absent,
            } => {
                if *only_if_absent && self.users.contains_key(&profile.uid) {
                    return Ok(());
                }
                change.touch_user(&profile.uid);
                let before = self.users.insert(profile.uid.clone(), profile.clone());
                undo.push(Undo::User(profile.uid.clone(), before));
            }
            Write::PatchUser { uid, patch } => {
                let profile = self.users.get_mut(uid).ok_or_else(|| not_found("user", uid))?;
                undo.push(Undo::User(uid.clone(), Some(profile.clone())));
                patch.apply_to(profile);
                change.touch_user(uid);
            }
            Write::LinkTeam { uid, team, at } => {
                undo.push(Undo::User(uid.clone(), self.users.get(uid).cloned()));
                let profile = self
                    .users
                    .entry(uid.clone())
                    .or_insert_with(|| UserProfile::new(uid.clone(), "", "", *at));
                if !profile.joined_teams.contains(team) {
                    profile.joined_teams.push(team.clone());
                }
                change.touch_user(uid);
            }
            Write::UnlinkTeam { uid, team } => {
                if let Some(profile) = self.users.get_mut(uid) {
                    undo.push(Undo::User(uid.clone(), Some(profile.clone())));
                    profile.joined_teams.retain(|t| t != team);
                    change.touch_user(uid);
                }
            }
            Write::SetJoinedTeams { uid, teams } => {
                let profile = self.users.get_mut(uid).ok_or_else(|| not_found("user", uid))?;
                undo.push(Undo::User(uid.clone(), Some(profile.clone())));
                profile.joined_teams.clone_from(teams);
                change.touch_user(uid);
            }
        }
        Ok(())
    }

    /// Restores every document recorded in `undo`, newest first.
    fn rollback(&mut self, undo: Vec<Undo>) {
        for entry in undo.into_iter().rev() {
            match entry {
                Undo::Team(code, before) => restore(&mut self.teams, code, before),
                Undo::Task(id, before) => restore(&mut self.tasks, id, before),
                Undo::Contribution(key, before) => restore(&mut self.contributions, key, before),
                Undo::User(uid, before) => restore(&mut self.users, uid, before),
                Undo::SessionPushed => {
                    self.sessions.pop();
                }
                Undo::MessagePushed => {
                    self.messages.pop();
                }
                Undo::SessionsRemoved(removed) => {
                    for (index, session) in removed {
                        self.sessions.insert(index, session);
                    }
                }
                Undo::MessagesRemoved(removed) => {
                    for (index, message) in removed {
                        self.messages.insert(index, message);
                    }
                }
            }
        }
    }

    fn require_team(&self, code: &TeamCode) -> Result<(), StoreFailure> {
        if self.teams.contains_key(code) {
            Ok(())
        } else {
            Err(not_found("team", code))
        }
    }

    fn query(&self, query: &Query) -> Snapshot {
        match query {
            Query::Team(code) => Snapshot::Team(self.teams.get(code).cloned()),
            Query::TeamsOf(user) => {
                let mut teams: Vec<Team> = self
                    .teams
                    .values()
                    .filter(|t| t.is_member(user))
                    .cloned()
                    .collect();
                teams.sort_by(|a, b| (a.created_at, &a.code).cmp(&(b.created_at, &b.code)));
                Snapshot::Teams(teams)
            }
            Query::User(uid) => Snapshot::User(self.users.get(uid).cloned()),
            Query::Task(id) => Snapshot::Task(self.tasks.get(id).cloned()),
            Query::TeamTasks { team, scope } => Snapshot::Tasks(
                self.tasks_where(|t| t.team_id == *team && scope.includes(t.archived)),
            ),
            Query::ArchivedTasksOf { team, assignee } => Snapshot::Tasks(
                self.tasks_where(|t| t.team_id == *team && t.archived && t.assignee == *assignee),
            ),
            Query::Contributions(team) => {
                let mut rows: Vec<Contribution> = self
                    .contributions
                    .values()
                    .filter(|c| c.team_id == *team)
                    .cloned()
                    .collect();
                rows.sort_by(|a, b| a.user_id.cmp(&b.user_id));
                Snapshot::Contributions(rows)
            }
            Query::RecentSessions { team, limit } => {
                let mut rows: Vec<Session> = self
                    .sessions
                    .iter()
                    .rev()
                    .filter(|s| s.team_id == *team)
                    .cloned()
                    .collect();
                // Stable sort keeps later inserts first among equal timestamps.
                rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                rows.truncate(usize::try_from(*limit).unwrap_or(usize::MAX));
                Snapshot::Sessions(rows)
            }
            Query::SessionLog(team) => {
                let mut rows: Vec<Session> = self
                    .sessions
                    .iter()
                    .filter(|s| s.team_id == *team)
                    .cloned()
                    .collect();
                rows.sort_by_key(|s| s.created_at);
                Snapshot::Sessions(rows)
            }
            Query::Messages(team) => {
                let mut rows: Vec<ChatMessage> = self
                    .messages
                    .iter()
                    .filter(|m| m.team_id == *team)
                    .cloned()
                    .collect();
                rows.sort_by_key(|m| m.created_at);
                Snapshot::Messages(rows)
            }
        }
    }

    fn tasks_where(&self, keep: impl Fn(&Task) -> bool) -> Vec<Task> {
        let mut rows: Vec<Task> = self.tasks.values().filter(|t| keep(t)).cloned().collect();
        rows.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        rows
    }
}

fn not_found(kind: &str, id: impl std::fmt::Display) -> StoreFailure {
    StoreFailure::NotFound(format!("{kind} {id}"))
}

fn validate_team(team: &Team) -> Result<(), StoreFailure> {
    if !team.members.contains(&Assignee::Common) {
        return Err(StoreFailure::Invalid(format!(
            "team {} must keep the common member",
            team.code
        )));
    }
    if let Some(leader) = &team.leader
        && !team.is_member(leader)
    {
        return Err(StoreFailure::Invalid(format!(
            "leader {leader} is not a member of team {}",
            team.code
        )));
    }
    Ok(())
}

fn validate_task(task: &Task) -> Result<(), StoreFailure> {
    if task.is_done() && task.is_active {
        return Err(StoreFailure::Invalid(format!(
            "task {} cannot be done with a running timer",
            task.id
        )));
    }
    Ok(())
}

fn restore<K: Eq + std::hash::Hash, V>(map: &mut HashMap<K, V>, key: K, before: Option<V>) {
    match before {
        Some(value) => {
            map.insert(key, value);
        }
        None => {
            map.remove(&key);
        }
    }
}

/// Removes the entries matching `doomed`, returning them with their
/// original positions in ascending order.
fn drain_team<T>(items: &mut Vec<T>, doomed: impl Fn(&T) -> bool) -> Vec<(usize, T)> {
    let mut removed = Vec::new();
    let mut kept = Vec::with_capacity(items.len());
    for (index, item) in std::mem::take(items).into_iter().enumerate() {
        if doomed(&item) {
            removed.push((index, item));
        } else {
            kept.push(item);
        }
    }
    *items = kept;
    removed
}

/// Adds a signed delta to a counter, clamping at zero.
fn apply_delta(value: u64, delta: i64) -> u64 {
    if delta >= 0 {
        value.saturating_add(delta.unsigned_abs())
    } else {
        value.saturating_sub(delta.unsigned_abs())
    }
}
