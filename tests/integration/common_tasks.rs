//! Integration tests for common (team-wide) tasks.
//!
//! Several members work against one database through separate
//! coordinators, each with its own cache, to exercise the claim and
//! completion races.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use contrimeter::contributions::ContributionBoard;
use contrimeter::store::{self, DocumentStore, EmbeddedStore};
use contrimeter::tasks::{CommonRule, Coordinator, TaskError, TaskPolicy};
use contrimeter::timer::ManualClock;
use contrimeter_proto::model::{
    Assignee, Contribution, Task, TaskId, TaskStatus, Team, TeamCode, UserId,
};
use contrimeter_proto::store::{Query, Snapshot, Write};

// ---------------------------------------------------------------------------
// Helper functions
// ---------------------------------------------------------------------------

fn code() -> TeamCode {
    TeamCode::parse("HX4KP7").unwrap()
}

fn lead() -> UserId {
    UserId::new("lead")
}

fn ana() -> UserId {
    UserId::new("ana")
}

fn ben() -> UserId {
    UserId::new("ben")
}

async fn team_store() -> Arc<EmbeddedStore> {
    let store = Arc::new(EmbeddedStore::new());
    let mut team = Team::new(code(), "Launch", lead(), 0);
    team.members.push(Assignee::Member(ana()));
    team.members.push(Assignee::Member(ben()));
    store.commit(Write::CreateTeam(team).into()).await.unwrap();
    store
}

async fn member(
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
        .unwrap()
}

async fn completed(store: &EmbeddedStore, user: &UserId) -> u64 {
    store::into_contributions(store.query(Query::Contributions(code())).await.unwrap())
        .unwrap()
        .iter()
        .find(|c| c.user_id == *user)
        .map_or(0, |c: &Contribution| c.tasks_completed)
}

/// Creates a common task as `lead` and loads every coordinator afterwards.
async fn common_task(
    store: &Arc<EmbeddedStore>,
    clock: &ManualClock,
) -> (TaskId, Coordinator<EmbeddedStore>, Coordinator<EmbeddedStore>) {
    let lead_c = member(store, lead(), clock).await;
    let id = lead_c
        .create_task("Launch checklist", None, Assignee::Common)
        .await
        .unwrap();
    (id, member(store, ana(), clock).await, member(store, ben(), clock).await)
}

// ===========================================================================
// Claiming
// ===========================================================================

#[tokio::test]
async fn only_one_member_can_claim_the_timer() {
    let store = team_store().await;
    let clock = ManualClock::new(1_000);
    let (id, ana_c, ben_c) = common_task(&store, &clock).await;

    // Both caches say the task is free; the store decides.
    ana_c.start_timer(id).await.unwrap();
    match ben_c.start_timer(id).await {
        Err(TaskError::ClaimedByOther(holder)) => assert_eq!(holder, ana()),
        other => panic!("expected ClaimedByOther, got {other:?}"),
    }
    assert!(ben_c.timers().is_empty());

    let task = stored_task(&store, id).await;
    assert!(task.is_active);
    assert_eq!(task.active_user, Some(ana()));

    // Ben's cache was refreshed by the refusal.
    assert_eq!(ben_c.task(id).unwrap().active_user, Some(ana()));
}

#[tokio::test]
async fn concurrent_claims_have_exactly_one_winner() {
    let store = team_store().await;
    let clock = ManualClock::new(1_000);
    let (id, ana_c, ben_c) = common_task(&store, &clock).await;

    let (a, b) = tokio::join!(ana_c.start_timer(id), ben_c.start_timer(id));
    assert!(a.is_ok() ^ b.is_ok(), "exactly one claim must win: {a:?} / {b:?}");
    let loser = if a.is_ok() { b } else { a };
    assert!(matches!(loser, Err(TaskError::ClaimedByOther(_))));
}

#[tokio::test]
async fn holder_time_is_credited_to_holder() {
    let store = team_store().await;
    let clock = ManualClock::new(1_000);
    let (id, ana_c, ben_c) = common_task(&store, &clock).await;

    ana_c.start_timer(id).await.unwrap();
    clock.advance(Duration::from_secs(90));
    ana_c.stop_timer(id).await.unwrap();

    // Released: ben can claim it now.
    ben_c.load().await.unwrap();
    ben_c.start_timer(id).await.unwrap();
    clock.advance(Duration::from_secs(30));
    ben_c.stop_timer(id).await.unwrap();

    let counters =
        store::into_contributions(store.query(Query::Contributions(code())).await.unwrap())
            .unwrap();
    let seconds = |u: UserId| {
        counters
            .iter()
            .find(|c| c.user_id == u)
            .map_or(0, |c| c.total_time_spent)
    };
    assert_eq!(seconds(ana()), 90);
    assert_eq!(seconds(ben()), 30);
    assert_eq!(stored_task(&store, id).await.time_spent, 1);
}

#[tokio::test]
async fn remote_stop_is_picked_up_from_snapshot() {
    let store = team_store().await;
    let clock = ManualClock::new(1_000);
    let (id, ana_c, _ben_c) = common_task(&store, &clock).await;

    // Two devices of the same user: the phone completes the task while the
    // laptop's timer is running.
    let ana_phone = member(&store, ana(), &clock).await;
    ana_c.start_timer(id).await.unwrap();
    let mut sub = ana_c.subscribe_tasks().await.unwrap();
    let _initial = sub.next().await.unwrap();

    ana_phone.load().await.unwrap();
    clock.advance(Duration::from_secs(10));
    assert_eq!(ana_phone.toggle_done(id).await.unwrap(), TaskStatus::Done);

    let snapshot = sub.next().await.unwrap();
    assert!(matches!(snapshot, Snapshot::Tasks(_)));
    let dropped = ana_c.apply_snapshot(snapshot).unwrap();
    assert_eq!(dropped, vec![id]);
    assert!(ana_c.timers().is_empty());
}

// ===========================================================================
// Completion
// ===========================================================================

#[tokio::test]
async fn cannot_complete_while_someone_else_holds_the_timer() {
    let store = team_store().await;
    let clock = ManualClock::new(1_000);
    let (id, ana_c, ben_c) = common_task(&store, &clock).await;

    ana_c.start_timer(id).await.unwrap();

    // Ben's cache is stale: it still believes the task is unclaimed.
    match ben_c.toggle_done(id).await {
        Err(TaskError::ClaimedByOther(holder)) => assert_eq!(holder, ana()),
        other => panic!("expected ClaimedByOther, got {other:?}"),
    }
    // With a fresh cache the refusal happens before any write.
    assert!(matches!(
        ben_c.toggle_done(id).await,
        Err(TaskError::ClaimedByOther(_))
    ));
    assert!(!stored_task(&store, id).await.is_done());
    assert_eq!(completed(&store, &ben()).await, 0);
}

#[tokio::test]
async fn completer_is_credited_and_reopen_debits_them() {
    let store = team_store().await;
    let clock = ManualClock::new(1_000);
    let (id, _ana_c, ben_c) = common_task(&store, &clock).await;

    assert_eq!(ben_c.toggle_done(id).await.unwrap(), TaskStatus::Done);
    let task = stored_task(&store, id).await;
    assert_eq!(task.completed_by, Some(ben()));
    assert_eq!(completed(&store, &ben()).await, 1);

    // The leader reopens: the completer loses the credit.
    let lead_c = member(&store, lead(), &clock).await;
    assert_eq!(lead_c.toggle_done(id).await.unwrap(), TaskStatus::Pending);
    let task = stored_task(&store, id).await;
    assert_eq!(task.completed_by, None);
    assert_eq!(completed(&store, &ben()).await, 0);
    assert_eq!(completed(&store, &lead()).await, 0);
}

#[tokio::test]
async fn only_completer_or_leader_may_reopen() {
    let store = team_store().await;
    let clock = ManualClock::new(1_000);
    let (id, ana_c, ben_c) = common_task(&store, &clock).await;

    ben_c.toggle_done(id).await.unwrap();
    ana_c.load().await.unwrap();
    assert!(matches!(
        ana_c.toggle_done(id).await,
        Err(TaskError::NotPermitted(_))
    ));
    assert_eq!(ben_c.toggle_done(id).await.unwrap(), TaskStatus::Pending);
}

#[tokio::test]
async fn double_completion_from_stale_caches_counts_once() {
    let store = team_store().await;
    let clock = ManualClock::new(1_000);
    let (id, ana_c, ben_c) = common_task(&store, &clock).await;

    ana_c.toggle_done(id).await.unwrap();
    // Ben still sees a pending task; the status precondition stops him.
    assert!(ben_c.toggle_done(id).await.is_err());
    assert_eq!(completed(&store, &ana()).await, 1);
    assert_eq!(completed(&store, &ben()).await, 0);

    let board = ContributionBoard::new(Arc::clone(&store), code());
    assert!(board.reconcile().await.unwrap().is_empty());
}

#[tokio::test]
async fn stale_reopen_cannot_debit_a_previous_completer() {
    let store = team_store().await;
    let clock = ManualClock::new(1_000);
    let (id, ana_c, ben_c) = common_task(&store, &clock).await;

    ana_c.toggle_done(id).await.unwrap();
    let lead_c = member(&store, lead(), &clock).await;
    assert_eq!(lead_c.task(id).unwrap().completed_by, Some(ana()));

    // Ana reopens and Ben completes it again behind the leader's back.
    assert_eq!(ana_c.toggle_done(id).await.unwrap(), TaskStatus::Pending);
    ben_c.load().await.unwrap();
    assert_eq!(ben_c.toggle_done(id).await.unwrap(), TaskStatus::Done);

    assert!(matches!(
        lead_c.toggle_done(id).await,
        Err(TaskError::Stale(_))
    ));
    assert_eq!(completed(&store, &ana()).await, 0);
    assert_eq!(completed(&store, &ben()).await, 1);

    // The refusal refreshed the cache; the retry debits the real completer.
    assert_eq!(lead_c.toggle_done(id).await.unwrap(), TaskStatus::Pending);
    assert_eq!(completed(&store, &ben()).await, 0);
    assert_eq!(stored_task(&store, id).await.completed_by, None);
}

// ===========================================================================
// Policy
// ===========================================================================

#[tokio::test]
async fn delete_policy_is_configurable() {
    let store = team_store().await;
    let clock = ManualClock::new(1_000);
    let (id, ana_c, _ben_c) = common_task(&store, &clock).await;

    // Default: creator or leader.
    assert!(matches!(
        ana_c.delete(id).await,
        Err(TaskError::NotPermitted(_))
    ));

    let permissive = Coordinator::new(Arc::clone(&store), ana(), code())
        .with_clock(Arc::new(clock.clone()))
        .with_policy(TaskPolicy {
            common_archive: CommonRule::AnyMember,
            common_delete: CommonRule::AnyMember,
        });
    permissive.load().await.unwrap();
    permissive.delete(id).await.unwrap();
    assert!(
        store::into_task(store.query(Query::Task(id)).await.unwrap())
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn any_member_may_archive_common_task_by_default() {
    let store = team_store().await;
    let clock = ManualClock::new(1_000);
    let (id, ana_c, _ben_c) = common_task(&store, &clock).await;
    ana_c.archive(id).await.unwrap();
    assert!(stored_task(&store, id).await.archived);
}
