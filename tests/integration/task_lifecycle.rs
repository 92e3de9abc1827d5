//! Integration tests for the personal task lifecycle.
//!
//! Drives a task from creation through timed work, completion, reopening
//! and archiving, checking the task document, the session log and the
//! contribution counters after every step.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use contrimeter::contributions::{ActivityStatus, ContributionBoard};
use contrimeter::sessions::SessionHistory;
use contrimeter::store::{self, DocumentStore, EmbeddedStore};
use contrimeter::tasks::{Coordinator, TaskError, TaskFilter};
use contrimeter::timer::ManualClock;
use contrimeter_proto::model::{
    Assignee, Contribution, Task, TaskId, TaskStatus, Team, TeamCode, UserId,
};
use contrimeter_proto::store::{Query, Write};

// ---------------------------------------------------------------------------
// Helper functions
// ---------------------------------------------------------------------------

fn code() -> TeamCode {
    TeamCode::parse("QW7ER2").unwrap()
}

fn lead() -> UserId {
    UserId::new("lead")
}

fn dev() -> UserId {
    UserId::new("dev")
}

/// Creates a store holding one team: `lead` leads, `dev` is a member.
async fn team_store() -> Arc<EmbeddedStore> {
    let store = Arc::new(EmbeddedStore::new());
    let mut team = Team::new(code(), "Platform", lead(), 0);
    team.members.push(Assignee::Member(dev()));
    store.commit(Write::CreateTeam(team).into()).await.unwrap();
    store
}

async fn coordinator_for(
    store: &Arc<EmbeddedStore>,
    me: UserId,
    clock: &ManualClock,
) -> Coordinator<EmbeddedStore> {
    let c = Coordinator::new(Arc::clone(store), me, code())
        .with_clock(Arc::new(clock.clone()))
        .with_start_grace(Duration::ZERO);
    c.load().await.unwrap();
    c
}

async fn stored_task(store: &EmbeddedStore, id: TaskId) -> Task {
    store::into_task(store.query(Query::Task(id)).await.unwrap())
        .unwrap()
        .expect("task should exist")
}

async fn counter(store: &EmbeddedStore, user: &UserId) -> Option<Contribution> {
    store::into_contributions(store.query(Query::Contributions(code())).await.unwrap())
        .unwrap()
        .into_iter()
        .find(|c| c.user_id == *user)
}

// ===========================================================================
// Lifecycle
// ===========================================================================

#[tokio::test]
async fn personal_task_full_lifecycle() {
    let store = team_store().await;
    let clock = ManualClock::new(1_000_000);
    let c = coordinator_for(&store, dev(), &clock).await;

    let id = c
        .create_task("Migrate schema", None, Assignee::Member(dev()))
        .await
        .unwrap();

    // First run: 2m 5s.
    c.start_timer(id).await.unwrap();
    assert!(stored_task(&store, id).await.is_active);
    clock.advance(Duration::from_secs(125));
    let outcome = c.stop_timer(id).await.unwrap();
    assert_eq!(outcome.seconds, 125);
    assert_eq!(outcome.minutes, 2);

    // Second run: 50s, below a whole minute.
    c.start_timer(id).await.unwrap();
    clock.advance(Duration::from_secs(50));
    c.stop_timer(id).await.unwrap();

    let task = stored_task(&store, id).await;
    assert!(!task.is_active);
    assert_eq!(task.time_spent, 2);
    let contribution = counter(&store, &dev()).await.unwrap();
    assert_eq!(contribution.total_time_spent, 175);
    assert_eq!(contribution.tasks_completed, 0);

    let history = SessionHistory::new(Arc::clone(&store), code());
    let entries = history.entries(20).await.unwrap();
    assert_eq!(entries.len(), 1, "both runs fold into one entry");
    assert_eq!(entries[0].duration, 175);

    // Complete while a third run is going: the run is flushed.
    c.start_timer(id).await.unwrap();
    clock.advance(Duration::from_secs(60));
    assert_eq!(c.toggle_done(id).await.unwrap(), TaskStatus::Done);
    assert!(c.timers().is_empty());

    let task = stored_task(&store, id).await;
    assert!(task.is_done());
    assert!(!task.is_active);
    assert_eq!(task.time_spent, 3);
    let contribution = counter(&store, &dev()).await.unwrap();
    assert_eq!(contribution.tasks_completed, 1);
    assert_eq!(contribution.total_time_spent, 235);

    // Done tasks cannot be restarted.
    assert!(matches!(
        c.start_timer(id).await,
        Err(TaskError::AlreadyDone)
    ));

    // Archive, then it is gone from the live list but listed as archived.
    c.archive(id).await.unwrap();
    assert!(c.visible_tasks(TaskFilter::All, false).is_empty());
    let archived = c.archived_tasks(true).await.unwrap();
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].id, id);

    c.unarchive(id).await.unwrap();
    c.load().await.unwrap();
    assert_eq!(c.visible_tasks(TaskFilter::Completed, false).len(), 1);
}

#[tokio::test]
async fn reopen_debits_the_assignee() {
    let store = team_store().await;
    let clock = ManualClock::new(10_000);
    let c = coordinator_for(&store, dev(), &clock).await;
    let id = c
        .create_task("Write docs", Some("README and guide"), Assignee::Member(dev()))
        .await
        .unwrap();

    c.toggle_done(id).await.unwrap();
    assert_eq!(counter(&store, &dev()).await.unwrap().tasks_completed, 1);
    assert_eq!(c.toggle_done(id).await.unwrap(), TaskStatus::Pending);
    assert_eq!(counter(&store, &dev()).await.unwrap().tasks_completed, 0);
}

#[tokio::test]
async fn leader_manages_member_task_but_cannot_work_it() {
    let store = team_store().await;
    let clock = ManualClock::new(10_000);
    let lead_c = coordinator_for(&store, lead(), &clock).await;
    let id = lead_c
        .create_task("Review PRs", None, Assignee::Member(dev()))
        .await
        .unwrap();

    lead_c.rename_task(id, "Review open PRs").await.unwrap();
    assert_eq!(stored_task(&store, id).await.name, "Review open PRs");

    assert!(matches!(
        lead_c.start_timer(id).await,
        Err(TaskError::NotPermitted(_))
    ));
    assert!(matches!(
        lead_c.toggle_done(id).await,
        Err(TaskError::NotPermitted(_))
    ));
    // Only the assignee archives a personal task.
    assert!(matches!(
        lead_c.archive(id).await,
        Err(TaskError::NotPermitted(_))
    ));

    lead_c.delete(id).await.unwrap();
    assert!(
        store::into_task(store.query(Query::Task(id)).await.unwrap())
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn standings_reflect_tracked_work() {
    let store = team_store().await;
    let clock = ManualClock::new(5 * 60 * 60 * 1000);
    let c = coordinator_for(&store, dev(), &clock).await;

    for name in ["One", "Two"] {
        let id = c
            .create_task(name, None, Assignee::Member(dev()))
            .await
            .unwrap();
        c.start_timer(id).await.unwrap();
        clock.advance(Duration::from_secs(20 * 60));
        c.toggle_done(id).await.unwrap();
    }

    let board = ContributionBoard::new(Arc::clone(&store), code())
        .with_clock(Arc::new(clock.clone()));
    let rows = board.standings().await.unwrap();
    let dev_row = rows.iter().find(|r| r.user == dev()).unwrap();
    assert_eq!(dev_row.tasks_completed, 2);
    assert_eq!(dev_row.tasks_assigned, 2);
    assert_eq!(dev_row.total_seconds, 2400);
    assert_eq!(dev_row.score, 2 * 10 + 2400);
    assert!((dev_row.progress - 100.0).abs() < f64::EPSILON);
    assert!((dev_row.share - 1.0).abs() < f64::EPSILON);
    assert_eq!(dev_row.status, ActivityStatus::Active);

    let lead_row = rows.iter().find(|r| r.user == lead()).unwrap();
    assert_eq!(lead_row.score, 0);
    assert_eq!(lead_row.status, ActivityStatus::Inactive);

    assert!(board.reconcile().await.unwrap().is_empty());
}
