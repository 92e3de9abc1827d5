//! Contribution scoring and self-healing reconciliation.
//!
//! Counters are written as signed deltas by the task coordinator. This
//! module turns them into per-member standings for display and can rebuild
//! them from the session log and the done tasks when they drift.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use contrimeter_proto::model::{Contribution, Session, Task, Team, TeamCode, UserId};
use contrimeter_proto::store::{ArchiveScope, Query, StoreFailure, Write, WriteBatch};
use serde::{Deserialize, Serialize};

use crate::store::{self, DocumentStore, StoreError, Subscription};
use crate::tasks::rules::completion_credit;
use crate::timer::{Clock, SystemClock};

/// Passes [`ContributionBoard::reconcile`] makes before giving up on
/// counters that keep moving under it.
pub const RECONCILE_ATTEMPTS: u32 = 3;

/// Scoring constants. Tunable; nothing structural depends on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringPolicy {
    /// Score points per completed task.
    pub task_weight: u64,
    /// Fewer completed tasks than this (and little time) is at risk.
    pub at_risk_max_tasks: u64,
    /// Less tracked time than this many minutes (and few tasks) is at risk.
    pub at_risk_max_minutes: u64,
    /// Idle for longer than this many minutes is inactive.
    pub inactive_after_minutes: u64,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            task_weight: 10,
            at_risk_max_tasks: 2,
            at_risk_max_minutes: 30,
            inactive_after_minutes: 60,
        }
    }
}

/// Engagement of a member, derived from their counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityStatus {
    /// Good engagement.
    Active,
    /// Low activity.
    AtRisk,
    /// Idle, or nothing recorded at all.
    Inactive,
}

impl fmt::Display for ActivityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::AtRisk => write!(f, "at-risk"),
            Self::Inactive => write!(f, "inactive"),
        }
    }
}

impl ScoringPolicy {
    /// `tasks_completed * task_weight + total_seconds`.
    #[must_use]
    pub const fn score(&self, tasks_completed: u64, total_seconds: u64) -> u64 {
        tasks_completed
            .saturating_mul(self.task_weight)
            .saturating_add(total_seconds)
    }

    /// Classifies a member. Tracked time is compared in whole minutes.
    #[must_use]
    pub const fn activity_status(
        &self,
        tasks_completed: u64,
        total_seconds: u64,
        minutes_since_active: u64,
    ) -> ActivityStatus {
        let minutes = total_seconds / 60;
        if minutes_since_active > self.inactive_after_minutes
            || (tasks_completed == 0 && minutes == 0)
        {
            ActivityStatus::Inactive
        } else if tasks_completed < self.at_risk_max_tasks && minutes < self.at_risk_max_minutes {
            ActivityStatus::AtRisk
        } else {
            ActivityStatus::Active
        }
    }
}

/// One member's row in the contribution view.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberStanding {
    /// Member.
    pub user: UserId,
    /// Completed tasks (counter).
    pub tasks_completed: u64,
    /// Non-archived tasks assigned to the member.
    pub tasks_assigned: u64,
    /// Tracked time in seconds (counter).
    pub total_seconds: u64,
    /// `completed / assigned * 100`, capped at 100; 0 with nothing assigned.
    pub progress: f64,
    /// Composite score.
    pub score: u64,
    /// Score relative to the top score in the team, in `0.0..=1.0`.
    pub share: f64,
    /// Derived engagement.
    pub status: ActivityStatus,
    /// Minutes since the counter last moved.
    pub minutes_since_active: u64,
}

/// Builds one standing per human member, in membership order.
///
/// Members without a counter count as zero and as active just now.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn standings(
    policy: &ScoringPolicy,
    team: &Team,
    contributions: &[Contribution],
    tasks: &[Task],
    now: u64,
) -> Vec<MemberStanding> {
    let mut rows: Vec<MemberStanding> = team
        .users()
        .map(|user| {
            let counter = contributions.iter().find(|c| c.user_id == *user);
            let tasks_completed = counter.map_or(0, |c| c.tasks_completed);
            let total_seconds = counter.map_or(0, |c| c.total_time_spent);
            let last_active = counter.map_or(now, |c| c.last_active);
            let minutes_since_active = now.saturating_sub(last_active) / 60_000;
            let tasks_assigned = tasks
                .iter()
                .filter(|t| !t.archived && t.assignee.is(user))
                .count() as u64;
            let progress = if tasks_assigned == 0 {
                0.0
            } else {
                (tasks_completed as f64 / tasks_assigned as f64 * 100.0).min(100.0)
            };
            MemberStanding {
                user: user.clone(),
                tasks_completed,
                tasks_assigned,
                total_seconds,
                progress,
                score: policy.score(tasks_completed, total_seconds),
                share: 0.0,
                status: policy.activity_status(tasks_completed, total_seconds, minutes_since_active),
                minutes_since_active,
            }
        })
        .collect();

    let top = rows.iter().map(|r| r.score).max().unwrap_or(0).max(1);
    for row in &mut rows {
        row.share = row.score as f64 / top as f64;
    }
    rows
}

/// Authoritative totals for one user, rebuilt from the record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Totals {
    /// Done tasks credited to the user.
    pub tasks_completed: u64,
    /// Sum of the user's session durations.
    pub seconds: u64,
}

/// Rebuilds per-user totals: time from `sessions`, completions from done
/// `tasks` (archived included). A done common task without a completer
/// credits nobody.
#[must_use]
pub fn recompute(
    team: &TeamCode,
    sessions: &[Session],
    tasks: &[Task],
) -> BTreeMap<UserId, Totals> {
    let mut totals: BTreeMap<UserId, Totals> = BTreeMap::new();
    for session in sessions.iter().filter(|s| s.team_id == *team) {
        let entry = totals.entry(session.user_id.clone()).or_default();
        entry.seconds = entry.seconds.saturating_add(session.duration);
    }
    for task in tasks.iter().filter(|t| t.team_id == *team && t.is_done()) {
        if let Some(user) = completion_credit(task) {
            totals.entry(user).or_default().tasks_completed += 1;
        }
    }
    totals
}

/// Difference between a stored counter and its rebuilt value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Drift {
    /// Affected user.
    pub user: UserId,
    /// Counter values before reconciliation.
    pub before: Totals,
    /// Rebuilt values now stored.
    pub after: Totals,
}

/// Contribution view and reconciliation for one team.
pub struct ContributionBoard<S> {
    store: Arc<S>,
    team: TeamCode,
    policy: ScoringPolicy,
    clock: Arc<dyn Clock>,
}

impl<S: DocumentStore> ContributionBoard<S> {
    /// Creates a board with the default policy on the wall clock.
    #[must_use]
    pub fn new(store: Arc<S>, team: TeamCode) -> Self {
        Self {
            store,
            team,
            policy: ScoringPolicy::default(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Overrides the scoring policy.
    #[must_use]
    pub fn with_policy(mut self, policy: ScoringPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Overrides the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Current counters of every member.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the query fails.
    pub async fn counters(&self) -> Result<Vec<Contribution>, StoreError> {
        store::into_contributions(
            self.store
                .query(Query::Contributions(self.team.clone()))
                .await?,
        )
    }

    /// Live query over the team's counters.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the subscription cannot be registered.
    pub async fn subscribe(&self) -> Result<Subscription, StoreError> {
        self.store
            .subscribe(Query::Contributions(self.team.clone()))
            .await
    }

    /// Reads the team, its counters and its open tasks and scores every
    /// member.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if a query fails or the team is gone.
    pub async fn standings(&self) -> Result<Vec<MemberStanding>, StoreError> {
        let team = self.team().await?;
        let counters = self.counters().await?;
        let tasks = store::into_tasks(
            self.store
                .query(Query::TeamTasks {
                    team: self.team.clone(),
                    scope: ArchiveScope::Active,
                })
                .await?,
        )?;
        Ok(standings(
            &self.policy,
            &team,
            &counters,
            &tasks,
            self.clock.now_ms(),
        ))
    }

    /// Recomputes every counter from the session log and the done tasks
    /// and overwrites the ones that drifted, in one batch. Returns the
    /// corrections made.
    ///
    /// Each overwrite is conditional on the counter still holding the value
    /// that was read. Counters are read before the ledger, so a commit that
    /// lands between the reads moves a counter and fails the batch; the
    /// pass is then redone from fresh reads, up to
    /// [`RECONCILE_ATTEMPTS`] times.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if a query or the commit fails, or
    /// [`StoreError::Rejected`] with a precondition failure if the counters
    /// kept moving on every attempt.
    pub async fn reconcile(&self) -> Result<Vec<Drift>, StoreError> {
        let mut attempt = 1;
        loop {
            match self.reconcile_once().await {
                Err(e) if e.is_precondition_failed() && attempt < RECONCILE_ATTEMPTS => {
                    tracing::debug!(
                        team = %self.team,
                        attempt,
                        "counters moved during reconcile, retrying"
                    );
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn reconcile_once(&self) -> Result<Vec<Drift>, StoreError> {
        let counters = self.counters().await?;
        let team = self.team().await?;
        let sessions = store::into_sessions(
            self.store
                .query(Query::SessionLog(self.team.clone()))
                .await?,
        )?;
        let tasks = store::into_tasks(
            self.store
                .query(Query::TeamTasks {
                    team: self.team.clone(),
                    scope: ArchiveScope::All,
                })
                .await?,
        )?;
        let rebuilt = recompute(&self.team, &sessions, &tasks);
        let now = self.clock.now_ms();

        let users: BTreeSet<UserId> = team
            .users()
            .cloned()
            .chain(counters.iter().map(|c| c.user_id.clone()))
            .chain(rebuilt.keys().cloned())
            .collect();

        let mut batch = WriteBatch::new();
        let mut drift = Vec::new();
        for user in users {
            let existing = counters.iter().find(|c| c.user_id == user);
            let before = existing.map_or_else(Totals::default, |c| Totals {
                tasks_completed: c.tasks_completed,
                seconds: c.total_time_spent,
            });
            let after = rebuilt.get(&user).copied().unwrap_or_default();
            if before == after && (existing.is_some() || after == Totals::default()) {
                continue;
            }
            let last_seen = sessions
                .iter()
                .filter(|s| s.user_id == user)
                .map(|s| s.created_at)
                .max();
            batch.push(Write::SetContribution {
                expect: existing.cloned(),
                contribution: Contribution {
                    team_id: self.team.clone(),
                    user_id: user.clone(),
                    tasks_completed: after.tasks_completed,
                    total_time_spent: after.seconds,
                    last_active: existing
                        .map_or_else(|| last_seen.unwrap_or(now), |c| c.last_active),
                    created_at: existing.map_or(now, |c| c.created_at),
                },
            });
            tracing::debug!(%user, ?before, ?after, "contribution drift");
            drift.push(Drift {
                user,
                before,
                after,
            });
        }

        if !batch.is_empty() {
            self.store.commit(batch).await?;
        }
        tracing::info!(team = %self.team, corrected = drift.len(), "contributions reconciled");
        Ok(drift)
    }

    async fn team(&self) -> Result<Team, StoreError> {
        store::into_team(self.store.query(Query::Team(self.team.clone())).await?)?.ok_or_else(
            || StoreError::Rejected(StoreFailure::NotFound(format!("team {}", self.team))),
        )
    }
}
