//! Property-based tests for contribution counters.
//!
//! Uses proptest to verify:
//! 1. `recompute` sums session time and credits each done task once.
//! 2. Counters maintained by the coordinator never drift from the record,
//!    whatever interleaving of timer and completion actions produced them.
//! 3. Reconciliation repairs corrupted counters and is idempotent.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use contrimeter::contributions::{ContributionBoard, Totals, recompute};
use contrimeter::store::{self, DocumentStore, EmbeddedStore};
use contrimeter::tasks::Coordinator;
use contrimeter::timer::ManualClock;
use contrimeter_proto::model::{
    Assignee, Contribution, Session, SessionId, Task, TaskId, TaskStatus, Team, TeamCode, UserId,
};
use contrimeter_proto::store::{Query, Write};
use proptest::prelude::*;

// --- Helpers ---

const USERS: [&str; 3] = ["ana", "ben", "cy"];

fn code() -> TeamCode {
    TeamCode::parse("PR9P37").unwrap()
}

fn user(i: usize) -> UserId {
    UserId::new(USERS[i % USERS.len()])
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// One step a member can take against the shared task list.
#[derive(Debug, Clone)]
enum Action {
    Start { who: usize, task: usize },
    Stop { who: usize, task: usize },
    Toggle { who: usize, task: usize },
    Wait(u64),
}

fn arb_action() -> impl Strategy<Value = Action> {
    prop_oneof![
        (0..USERS.len(), 0..4usize).prop_map(|(who, task)| Action::Start { who, task }),
        (0..USERS.len(), 0..4usize).prop_map(|(who, task)| Action::Stop { who, task }),
        (0..USERS.len(), 0..4usize).prop_map(|(who, task)| Action::Toggle { who, task }),
        (1u64..400).prop_map(Action::Wait),
    ]
}

fn arb_session() -> impl Strategy<Value = Session> {
    (0..USERS.len(), 0u64..10_000).prop_map(|(who, duration)| Session {
        id: SessionId::new(),
        user_id: user(who),
        team_id: code(),
        task_name: "work".into(),
        duration,
        created_at: 0,
    })
}

fn arb_done_task() -> impl Strategy<Value = Task> {
    (any::<bool>(), 0..USERS.len(), prop::option::of(0..USERS.len()), any::<bool>()).prop_map(
        |(common, who, completer, done)| {
            let assignee = if common {
                Assignee::Common
            } else {
                Assignee::Member(user(who))
            };
            let mut task = Task::new(TaskId::new(), code(), "t", assignee, user(0), 0);
            if done {
                task.status = TaskStatus::Done;
                task.completed_by = completer.filter(|_| common).map(user);
            }
            task
        },
    )
}

/// A team of three with one personal task each and one common task.
async fn seeded() -> (Arc<EmbeddedStore>, Vec<TaskId>) {
    let store = Arc::new(EmbeddedStore::new());
    let mut team = Team::new(code(), "Props", user(0), 0);
    team.members.push(Assignee::Member(user(1)));
    team.members.push(Assignee::Member(user(2)));
    store.commit(Write::CreateTeam(team).into()).await.unwrap();

    let mut ids = Vec::new();
    for assignee in [
        Assignee::Member(user(0)),
        Assignee::Member(user(1)),
        Assignee::Member(user(2)),
        Assignee::Common,
    ] {
        let id = TaskId::new();
        let task = Task::new(id, code(), "task", assignee, user(0), 0);
        store.commit(Write::PutTask(task).into()).await.unwrap();
        ids.push(id);
    }
    (store, ids)
}

async fn counters(store: &EmbeddedStore) -> Vec<Contribution> {
    store::into_contributions(store.query(Query::Contributions(code())).await.unwrap()).unwrap()
}

// --- Properties ---

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn recompute_sums_sessions_and_credits_done_tasks(
        sessions in prop::collection::vec(arb_session(), 0..20),
        tasks in prop::collection::vec(arb_done_task(), 0..20),
    ) {
        let totals = recompute(&code(), &sessions, &tasks);

        let seconds: u64 = totals.values().map(|t| t.seconds).sum();
        prop_assert_eq!(seconds, sessions.iter().map(|s| s.duration).sum::<u64>());

        let credited = tasks
            .iter()
            .filter(|t| t.is_done())
            .filter(|t| !t.assignee.is_common() || t.completed_by.is_some())
            .count() as u64;
        let completed: u64 = totals.values().map(|t| t.tasks_completed).sum();
        prop_assert_eq!(completed, credited);
    }

    #[test]
    fn coordinated_counters_never_drift(actions in prop::collection::vec(arb_action(), 1..40)) {
        runtime().block_on(async {
            let (store, ids) = seeded().await;
            let clock = ManualClock::new(1_000_000);
            let members: Vec<Coordinator<EmbeddedStore>> = (0..USERS.len())
                .map(|i| {
                    Coordinator::new(Arc::clone(&store), user(i), code())
                        .with_clock(Arc::new(clock.clone()))
                        .with_start_grace(Duration::ZERO)
                })
                .collect();
            for c in &members {
                c.load().await.unwrap();
            }

            for action in actions {
                // Refusals are expected; only the resulting counters matter.
                match action {
                    Action::Start { who, task } => {
                        let _ = members[who].start_timer(ids[task]).await;
                    }
                    Action::Stop { who, task } => {
                        let _ = members[who].stop_timer(ids[task]).await;
                    }
                    Action::Toggle { who, task } => {
                        let _ = members[who].toggle_done(ids[task]).await;
                    }
                    Action::Wait(secs) => clock.advance(Duration::from_secs(secs)),
                }
            }
            for c in &members {
                c.stop_all_timers().await;
            }

            let board = ContributionBoard::new(Arc::clone(&store), code());
            let drift = board.reconcile().await.unwrap();
            assert!(drift.is_empty(), "counters drifted: {drift:?}");
        });
    }

    #[test]
    fn reconcile_repairs_and_is_idempotent(
        corrupt in prop::collection::vec((0..USERS.len(), 0u64..50, 0u64..5_000), 1..4),
        work in 1u64..3_000,
    ) {
        runtime().block_on(async {
            let (store, ids) = seeded().await;
            let clock = ManualClock::new(1_000_000);
            let c = Coordinator::new(Arc::clone(&store), user(1), code())
                .with_clock(Arc::new(clock.clone()))
                .with_start_grace(Duration::ZERO);
            c.load().await.unwrap();
            c.start_timer(ids[1]).await.unwrap();
            clock.advance(Duration::from_secs(work));
            c.toggle_done(ids[1]).await.unwrap();

            for (who, tasks_completed, seconds) in corrupt {
                let expect = counters(&store).await.into_iter().find(|c| c.user_id == user(who));
                let counter = Contribution {
                    team_id: code(),
                    user_id: user(who),
                    tasks_completed,
                    total_time_spent: seconds,
                    last_active: 0,
                    created_at: 0,
                };
                store
                    .commit(Write::SetContribution { expect, contribution: counter }.into())
                    .await
                    .unwrap();
            }

            let board = ContributionBoard::new(Arc::clone(&store), code());
            board.reconcile().await.unwrap();
            assert!(board.reconcile().await.unwrap().is_empty());

            let repaired = counters(&store).await;
            for c in &repaired {
                let expected = if c.user_id == user(1) {
                    Totals { tasks_completed: 1, seconds: work }
                } else {
                    Totals::default()
                };
                assert_eq!(
                    Totals { tasks_completed: c.tasks_completed, seconds: c.total_time_spent },
                    expected,
                );
            }
            assert!(repaired.iter().any(|c| c.user_id == user(1)));
        });
    }
}
