//! Session history for display.
//!
//! Sessions are immutable records of finished timer runs. For display,
//! adjacent runs of the same task by the same user are folded into one
//! entry; storage is never touched.

use std::collections::HashMap;
use std::sync::Arc;

use contrimeter_proto::model::{Session, TeamCode, UserId};
use contrimeter_proto::store::Query;

use crate::store::{self, DocumentStore, StoreError, Subscription};

/// Number of recent sessions shown by default.
pub const DEFAULT_HISTORY_LIMIT: u32 = 20;

const DAY_MS: u64 = 24 * 60 * 60 * 1000;

/// One displayed history row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEntry {
    /// Who ran the timer.
    pub user: UserId,
    /// Their display name, when known.
    pub user_name: String,
    /// Task name at stop time.
    pub task_name: String,
    /// Total seconds of the folded runs.
    pub duration: u64,
    /// Timestamp of the first (newest) run in the group.
    pub created_at: u64,
}

/// Folds adjacent sessions with the same task name and user, summing
/// their durations. Order is preserved; the first session of each group
/// supplies the timestamp.
#[must_use]
pub fn merge_consecutive(sessions: &[Session]) -> Vec<Session> {
    let mut merged: Vec<Session> = Vec::with_capacity(sessions.len());
    for session in sessions {
        match merged.last_mut() {
            Some(last) if last.task_name == session.task_name && last.user_id == session.user_id => {
                last.duration = last.duration.saturating_add(session.duration);
            }
            _ => merged.push(session.clone()),
        }
    }
    merged
}

/// `"Ys"` under a minute, otherwise `"Xm Ys"`.
#[must_use]
pub fn format_duration(seconds: u64) -> String {
    let mins = seconds / 60;
    let secs = seconds % 60;
    if mins == 0 {
        format!("{secs}s")
    } else {
        format!("{mins}m {secs}s")
    }
}

/// Relative day label: `Today`, `Yesterday`, or `N days ago`.
#[must_use]
pub fn format_day(created_at: u64, now: u64) -> String {
    match now.saturating_sub(created_at) / DAY_MS {
        0 => "Today".to_string(),
        1 => "Yesterday".to_string(),
        days => format!("{days} days ago"),
    }
}

/// Session history of one team.
pub struct SessionHistory<S> {
    store: Arc<S>,
    team: TeamCode,
}

impl<S: DocumentStore> SessionHistory<S> {
    /// Creates a history reader for `team`.
    #[must_use]
    pub const fn new(store: Arc<S>, team: TeamCode) -> Self {
        Self { store, team }
    }

    /// The most recent `limit` sessions, newest first.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the query fails.
    pub async fn recent(&self, limit: u32) -> Result<Vec<Session>, StoreError> {
        store::into_sessions(self.store.query(self.recent_query(limit)).await?)
    }

    /// Live query over the most recent `limit` sessions.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the subscription cannot be registered.
    pub async fn subscribe(&self, limit: u32) -> Result<Subscription, StoreError> {
        self.store.subscribe(self.recent_query(limit)).await
    }

    /// Recent sessions folded for display, with author names resolved.
    /// Unknown authors are shown as `Unknown User`.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if a query fails.
    pub async fn entries(&self, limit: u32) -> Result<Vec<SessionEntry>, StoreError> {
        let merged = merge_consecutive(&self.recent(limit).await?);
        let mut names: HashMap<UserId, String> = HashMap::new();
        for session in &merged {
            if names.contains_key(&session.user_id) {
                continue;
            }
            let profile =
                store::into_user(self.store.query(Query::User(session.user_id.clone())).await?)?;
            let name = profile
                .map(|p| p.name)
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| "Unknown User".to_string());
            names.insert(session.user_id.clone(), name);
        }
        Ok(merged
            .into_iter()
            .map(|s| SessionEntry {
                user_name: names.get(&s.user_id).cloned().unwrap_or_default(),
                user: s.user_id,
                task_name: s.task_name,
                duration: s.duration,
                created_at: s.created_at,
            })
            .collect())
    }

    fn recent_query(&self, limit: u32) -> Query {
        Query::RecentSessions {
            team: self.team.clone(),
            limit,
        }
    }
}
