//! Integration tests for team membership.
//!
//! Covers creating and joining teams, leaving with tasks in hand,
//! leadership handover, member removal and cascading deletion.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use contrimeter::chat::TeamChat;
use contrimeter::store::{self, DocumentStore, EmbeddedStore};
use contrimeter::tasks::Coordinator;
use contrimeter::teams::{TeamError, TeamService};
use contrimeter::timer::ManualClock;
use contrimeter::users::Profiles;
use contrimeter_proto::model::{Assignee, Task, TaskId, TeamCode, UserId};
use contrimeter_proto::store::{ArchiveScope, Query};

// ---------------------------------------------------------------------------
// Helper functions
// ---------------------------------------------------------------------------

fn lead() -> UserId {
    UserId::new("lead")
}

fn ana() -> UserId {
    UserId::new("ana")
}

fn ben() -> UserId {
    UserId::new("ben")
}

fn service(store: &Arc<EmbeddedStore>, me: UserId) -> TeamService<EmbeddedStore> {
    TeamService::new(Arc::clone(store), me)
}

/// Creates a team led by `lead` that `ana` and `ben` have joined.
async fn full_team(store: &Arc<EmbeddedStore>) -> TeamCode {
    let profiles = Profiles::new(Arc::clone(store));
    for (uid, name) in [(lead(), "Lead"), (ana(), "Ana"), (ben(), "Ben")] {
        profiles
            .bootstrap_profile(&uid, name, "", None)
            .await
            .unwrap();
    }
    let team = service(store, lead()).create("Research").await.unwrap();
    service(store, ana()).join(&team.code).await.unwrap();
    service(store, ben()).join(&team.code).await.unwrap();
    team.code
}

async fn coordinator(
    store: &Arc<EmbeddedStore>,
    me: UserId,
    code: &TeamCode,
    clock: &ManualClock,
) -> Coordinator<EmbeddedStore> {
    let c = Coordinator::new(Arc::clone(store), me, code.clone())
        .with_clock(Arc::new(clock.clone()))
        .with_start_grace(Duration::ZERO);
    c.load().await.unwrap();
    c
}

async fn joined(store: &EmbeddedStore, uid: &UserId) -> Vec<TeamCode> {
    store::into_user(store.query(Query::User(uid.clone())).await.unwrap())
        .unwrap()
        .map(|p| p.joined_teams)
        .unwrap_or_default()
}

async fn stored_task(store: &EmbeddedStore, id: TaskId) -> Task {
    store::into_task(store.query(Query::Task(id)).await.unwrap())
        .unwrap()
        .unwrap()
}

// ===========================================================================
// Create and join
// ===========================================================================

#[tokio::test]
async fn create_and_join_link_profiles() {
    let store = Arc::new(EmbeddedStore::new());
    let code = full_team(&store).await;

    let team = service(&store, lead()).team(&code).await.unwrap().unwrap();
    let users: Vec<&UserId> = team.users().collect();
    assert_eq!(users, vec![&lead(), &ana(), &ben()]);
    assert!(team.members.contains(&Assignee::Common));
    assert!(team.is_leader(&lead()));

    for uid in [lead(), ana(), ben()] {
        assert_eq!(joined(&store, &uid).await, vec![code.clone()]);
        let mine = service(&store, uid).my_teams().await.unwrap();
        assert_eq!(mine.len(), 1);
    }
}

#[tokio::test]
async fn invalid_names_and_codes_are_rejected() {
    let store = Arc::new(EmbeddedStore::new());
    let svc = service(&store, lead());
    assert!(matches!(svc.create("   ").await, Err(TeamError::NameEmpty)));
    assert!(matches!(
        svc.create(&"x".repeat(65)).await,
        Err(TeamError::NameTooLong)
    ));
    let unknown = TeamCode::parse("ZZZZZZ").unwrap();
    assert!(matches!(
        svc.join(&unknown).await,
        Err(TeamError::NotFound(_))
    ));
}

// ===========================================================================
// Leaving
// ===========================================================================

#[tokio::test]
async fn leaving_member_hands_tasks_to_the_team() {
    let store = Arc::new(EmbeddedStore::new());
    let code = full_team(&store).await;
    let clock = ManualClock::new(1_000);
    let ana_c = coordinator(&store, ana(), &code, &clock).await;

    let open = ana_c
        .create_task("Interview notes", None, Assignee::Member(ana()))
        .await
        .unwrap();
    let done = ana_c
        .create_task("Survey", None, Assignee::Member(ana()))
        .await
        .unwrap();
    ana_c.toggle_done(done).await.unwrap();
    let running = ana_c
        .create_task("Synthesis", None, Assignee::Member(ana()))
        .await
        .unwrap();
    ana_c.start_timer(running).await.unwrap();

    service(&store, ana()).leave(&code).await.unwrap();

    let open = stored_task(&store, open).await;
    assert_eq!(open.assignee, Assignee::Common);

    let done = stored_task(&store, done).await;
    assert_eq!(done.assignee, Assignee::Common);
    assert_eq!(done.completed_by, Some(ana()));

    let running = stored_task(&store, running).await;
    assert_eq!(running.assignee, Assignee::Common);
    assert!(!running.is_active);

    let team = service(&store, lead()).team(&code).await.unwrap().unwrap();
    assert!(!team.is_member(&ana()));
    assert!(joined(&store, &ana()).await.is_empty());

    // The local run can no longer be flushed.
    ana_c.load().await.unwrap();
    assert!(ana_c.timers().is_empty());
}

#[tokio::test]
async fn leaving_member_releases_common_claim() {
    let store = Arc::new(EmbeddedStore::new());
    let code = full_team(&store).await;
    let clock = ManualClock::new(1_000);
    let lead_c = coordinator(&store, lead(), &code, &clock).await;
    let id = lead_c
        .create_task("Shared doc", None, Assignee::Common)
        .await
        .unwrap();

    let ben_c = coordinator(&store, ben(), &code, &clock).await;
    ben_c.start_timer(id).await.unwrap();
    service(&store, ben()).leave(&code).await.unwrap();

    let task = stored_task(&store, id).await;
    assert!(!task.is_active);
    assert_eq!(task.active_user, None);

    // Anyone else can claim it again.
    let ana_c = coordinator(&store, ana(), &code, &clock).await;
    ana_c.start_timer(id).await.unwrap();
}

#[tokio::test]
async fn leader_leaving_hands_over_to_next_member() {
    let store = Arc::new(EmbeddedStore::new());
    let code = full_team(&store).await;

    service(&store, lead()).leave(&code).await.unwrap();
    let team = service(&store, ana()).team(&code).await.unwrap().unwrap();
    assert!(team.is_leader(&ana()));

    service(&store, ana()).leave(&code).await.unwrap();
    service(&store, ben()).leave(&code).await.unwrap();
    let team = service(&store, ben()).team(&code).await.unwrap().unwrap();
    assert_eq!(team.leader, None);
    assert_eq!(team.users().count(), 0);
}

#[tokio::test]
async fn non_member_cannot_leave() {
    let store = Arc::new(EmbeddedStore::new());
    let code = full_team(&store).await;
    assert!(matches!(
        service(&store, UserId::new("stranger")).leave(&code).await,
        Err(TeamError::NotMember(_))
    ));
}

// ===========================================================================
// Leader operations
// ===========================================================================

#[tokio::test]
async fn only_leader_removes_members() {
    let store = Arc::new(EmbeddedStore::new());
    let code = full_team(&store).await;

    assert!(matches!(
        service(&store, ana()).remove_member(&code, &ben()).await,
        Err(TeamError::NotLeader)
    ));
    assert!(matches!(
        service(&store, lead()).remove_member(&code, &lead()).await,
        Err(TeamError::CannotRemoveSelf)
    ));

    service(&store, lead())
        .remove_member(&code, &ben())
        .await
        .unwrap();
    assert!(joined(&store, &ben()).await.is_empty());
    assert!(service(&store, ben()).my_teams().await.unwrap().is_empty());
    assert!(matches!(
        service(&store, lead()).remove_member(&code, &ben()).await,
        Err(TeamError::NotMember(_))
    ));
}

#[tokio::test]
async fn rename_is_leader_only() {
    let store = Arc::new(EmbeddedStore::new());
    let code = full_team(&store).await;
    assert!(matches!(
        service(&store, ana()).rename(&code, "Mine now").await,
        Err(TeamError::NotLeader)
    ));
    service(&store, lead())
        .rename(&code, " User Research ")
        .await
        .unwrap();
    let team = service(&store, ana()).team(&code).await.unwrap().unwrap();
    assert_eq!(team.name, "User Research");
}

#[tokio::test]
async fn delete_cascades_everything() {
    let store = Arc::new(EmbeddedStore::new());
    let code = full_team(&store).await;
    let clock = ManualClock::new(1_000);

    let ana_c = coordinator(&store, ana(), &code, &clock).await;
    let id = ana_c
        .create_task("Recruit", None, Assignee::Member(ana()))
        .await
        .unwrap();
    ana_c.start_timer(id).await.unwrap();
    clock.advance(Duration::from_secs(75));
    ana_c.toggle_done(id).await.unwrap();
    TeamChat::new(Arc::clone(&store), code.clone(), ana())
        .send_message("done!", None)
        .await
        .unwrap();

    assert!(matches!(
        service(&store, ana()).delete(&code).await,
        Err(TeamError::NotLeader)
    ));
    service(&store, lead()).delete(&code).await.unwrap();

    assert!(service(&store, lead()).team(&code).await.unwrap().is_none());
    assert!(
        store::into_tasks(
            store
                .query(Query::TeamTasks {
                    team: code.clone(),
                    scope: ArchiveScope::All,
                })
                .await
                .unwrap()
        )
        .unwrap()
        .is_empty()
    );
    assert!(
        store::into_contributions(store.query(Query::Contributions(code.clone())).await.unwrap())
            .unwrap()
            .is_empty()
    );
    assert!(
        store::into_sessions(store.query(Query::SessionLog(code.clone())).await.unwrap())
            .unwrap()
            .is_empty()
    );
    assert!(
        store::into_messages(store.query(Query::Messages(code.clone())).await.unwrap())
            .unwrap()
            .is_empty()
    );
    for uid in [lead(), ana(), ben()] {
        assert!(joined(&store, &uid).await.is_empty());
    }
}
