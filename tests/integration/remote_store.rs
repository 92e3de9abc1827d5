//! Integration tests for the WebSocket store client.
//!
//! Starts an in-process store server on an ephemeral port and drives the
//! task, team and call operations through [`RemoteStore`].

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use contrimeter::call::{self, CallError};
use contrimeter::contributions::ContributionBoard;
use contrimeter::store::{self, DocumentStore, RemoteStore, StoreError, Subscription};
use contrimeter::tasks::{Coordinator, TaskError};
use contrimeter::teams::{TeamError, TeamService};
use contrimeter::timer::ManualClock;
use contrimeter_proto::model::{Assignee, Task, TeamCode, UserId};
use contrimeter_proto::store::{Query, Snapshot, Write};
use contrimeter_store::database::Database;
use contrimeter_store::server::{ServerState, start_server_with_state};
use contrimeter_store::token::{CallCredentials, TokenMinter};

// ---------------------------------------------------------------------------
// Helper functions
// ---------------------------------------------------------------------------

fn lead() -> UserId {
    UserId::new("lead")
}

fn ana() -> UserId {
    UserId::new("ana")
}

fn credentials() -> CallCredentials {
    CallCredentials {
        api_key: "devkey".into(),
        api_secret: "devsecret-devsecret-devsecret-32".into(),
        server_url: "wss://sfu.test".into(),
    }
}

/// Starts a server and returns its database and WebSocket URL.
async fn start(minter: TokenMinter) -> (Arc<Database>, String) {
    let db = Arc::new(Database::new());
    let state = Arc::new(ServerState::new(Arc::clone(&db), minter));
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", state)
        .await
        .expect("server should start");
    (db, format!("ws://{addr}/ws"))
}

async fn connect(url: &str) -> Arc<RemoteStore> {
    Arc::new(RemoteStore::connect(url).await.expect("should connect"))
}

/// Waits for the first pushed snapshot that satisfies `pred`.
async fn wait_for(sub: &mut Subscription, pred: impl Fn(&Snapshot) -> bool) -> Snapshot {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let snapshot = sub.next().await.expect("subscription closed");
            if pred(&snapshot) {
                return snapshot;
            }
        }
    })
    .await
    .expect("timed out waiting for snapshot")
}

/// Creates a team led by `lead` and joined by `ana`, both over the wire.
async fn shared_team(url: &str) -> (Arc<RemoteStore>, Arc<RemoteStore>, TeamCode) {
    let lead_store = connect(url).await;
    let ana_store = connect(url).await;
    let team = TeamService::new(Arc::clone(&lead_store), lead())
        .create("Remote")
        .await
        .unwrap();
    TeamService::new(Arc::clone(&ana_store), ana())
        .join(&team.code)
        .await
        .unwrap();
    (lead_store, ana_store, team.code)
}

fn coordinator(
    store: &Arc<RemoteStore>,
    me: UserId,
    code: &TeamCode,
    clock: &ManualClock,
) -> Coordinator<RemoteStore> {
    Coordinator::new(Arc::clone(store), me, code.clone())
        .with_clock(Arc::new(clock.clone()))
        .with_start_grace(Duration::ZERO)
}

// ===========================================================================
// Connection
// ===========================================================================

#[tokio::test]
async fn connect_rejects_bad_urls() {
    assert!(matches!(
        RemoteStore::connect("http://127.0.0.1:1/ws").await,
        Err(StoreError::Unreachable { .. })
    ));
    assert!(matches!(
        RemoteStore::connect("not a url").await,
        Err(StoreError::Unreachable { .. })
    ));
}

#[tokio::test]
async fn commit_is_visible_to_other_clients() {
    let (db, url) = start(TokenMinter::new(None)).await;
    let (_lead_store, ana_store, code) = shared_team(&url).await;

    let team = store::into_team(ana_store.query(Query::Team(code.clone())).await.unwrap())
        .unwrap()
        .unwrap();
    assert!(team.is_member(&ana()));
    assert_eq!(db.query(&Query::Team(code)), Snapshot::Team(Some(team)));
}

#[tokio::test]
async fn rejected_commit_surfaces_as_store_error() {
    let (_db, url) = start(TokenMinter::new(None)).await;
    let remote = connect(&url).await;
    let missing = TeamCode::parse("NNNNNN").unwrap();
    let err = TeamService::new(Arc::clone(&remote), lead())
        .rename(&missing, "Nope")
        .await
        .unwrap_err();
    assert!(matches!(err, TeamError::NotFound(_)));

    // A batch touching a missing team is refused as a whole.
    let err = remote
        .commit(Write::DeleteTeamCascade(missing).into())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

// ===========================================================================
// Tasks over the wire
// ===========================================================================

#[tokio::test]
async fn common_claim_race_is_decided_by_server() {
    let (_db, url) = start(TokenMinter::new(None)).await;
    let (lead_store, ana_store, code) = shared_team(&url).await;
    let clock = ManualClock::new(1_000);

    let lead_c = coordinator(&lead_store, lead(), &code, &clock);
    lead_c.load().await.unwrap();
    let id = lead_c
        .create_task("Deploy", None, Assignee::Common)
        .await
        .unwrap();

    let ana_c = coordinator(&ana_store, ana(), &code, &clock);
    ana_c.load().await.unwrap();

    ana_c.start_timer(id).await.unwrap();
    match lead_c.start_timer(id).await {
        Err(TaskError::ClaimedByOther(holder)) => assert_eq!(holder, ana()),
        other => panic!("expected ClaimedByOther, got {other:?}"),
    }

    clock.advance(Duration::from_secs(45));
    let outcome = ana_c.stop_timer(id).await.unwrap();
    assert_eq!(outcome.seconds, 45);

    let board = ContributionBoard::new(Arc::clone(&lead_store), code.clone());
    let counters = board.counters().await.unwrap();
    let ana_row = counters.iter().find(|c| c.user_id == ana()).unwrap();
    assert_eq!(ana_row.total_time_spent, 45);
}

#[tokio::test]
async fn task_subscription_pushes_remote_changes() {
    let (_db, url) = start(TokenMinter::new(None)).await;
    let (lead_store, ana_store, code) = shared_team(&url).await;
    let clock = ManualClock::new(1_000);

    let ana_c = coordinator(&ana_store, ana(), &code, &clock);
    ana_c.load().await.unwrap();
    let mut sub = ana_c.subscribe_tasks().await.unwrap();
    let initial = wait_for(&mut sub, |_| true).await;
    assert_eq!(initial, Snapshot::Tasks(Vec::new()));

    let lead_c = coordinator(&lead_store, lead(), &code, &clock);
    lead_c.load().await.unwrap();
    let id = lead_c
        .create_task("Pair on review", None, Assignee::Member(ana()))
        .await
        .unwrap();

    let pushed = wait_for(&mut sub, |s| matches!(s, Snapshot::Tasks(t) if !t.is_empty())).await;
    ana_c.apply_snapshot(pushed).unwrap();
    let task: Task = ana_c.task(id).unwrap();
    assert_eq!(task.assignee, Assignee::Member(ana()));
}

#[tokio::test]
async fn subscription_survives_unrelated_team_traffic() {
    let (_db, url) = start(TokenMinter::new(None)).await;
    let (lead_store, _ana_store, code) = shared_team(&url).await;

    let mut sub = lead_store.subscribe(Query::Team(code.clone())).await.unwrap();
    let _initial = wait_for(&mut sub, |_| true).await;

    // Another team's churn must not wake this query.
    TeamService::new(Arc::clone(&lead_store), lead())
        .create("Elsewhere")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(sub.try_next().is_none());

    TeamService::new(Arc::clone(&lead_store), lead())
        .rename(&code, "Renamed")
        .await
        .unwrap();
    let pushed = wait_for(&mut sub, |_| true).await;
    let team = store::into_team(pushed).unwrap().unwrap();
    assert_eq!(team.name, "Renamed");
}

// ===========================================================================
// Calls
// ===========================================================================

#[tokio::test]
async fn join_call_over_remote_store() {
    let (_db, url) = start(TokenMinter::new(Some(credentials()))).await;
    let remote = connect(&url).await;
    let code = TeamCode::parse("CALL22").unwrap();

    let response = call::join_call(remote.as_ref(), &code, &ana(), "Ana")
        .await
        .unwrap();
    assert!(!response.token.is_empty());
    assert_eq!(response.server_url, "wss://sfu.test");
}

#[tokio::test]
async fn join_call_without_credentials_is_unavailable() {
    let (_db, url) = start(TokenMinter::new(None)).await;
    let remote = connect(&url).await;
    let code = TeamCode::parse("CALL22").unwrap();

    assert!(matches!(
        call::join_call(remote.as_ref(), &code, &ana(), "Ana").await,
        Err(CallError::Unavailable(_))
    ));
}

#[tokio::test]
async fn join_call_without_name_is_rejected() {
    let (_db, url) = start(TokenMinter::new(Some(credentials()))).await;
    let remote = connect(&url).await;
    let code = TeamCode::parse("CALL22").unwrap();

    assert!(matches!(
        call::join_call(remote.as_ref(), &code, &ana(), "   ").await,
        Err(CallError::MissingFields)
    ));
}
