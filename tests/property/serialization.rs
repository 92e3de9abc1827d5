//! Property-based tests for the store wire protocol.
//!
//! Uses proptest to verify:
//! 1. Commit frames carrying task writes survive encode → decode.
//! 2. Snapshot pushes survive encode → decode.
//! 3. Random bytes never cause a panic in either decoder.
//! 4. Team code parsing accepts exactly the codes the alphabet can form.

use contrimeter_proto::model::{
    Assignee, Task, TaskId, TaskStatus, TEAM_CODE_ALPHABET, TEAM_CODE_LENGTH, TeamCode, UserId,
};
use contrimeter_proto::store::{
    self, ClientFrame, Reply, Request, ServerFrame, Snapshot, StoreFailure, TaskCondition,
    TaskPatch, Write, WriteBatch,
};
use proptest::prelude::*;
use uuid::Uuid;

// --- Strategies ---

fn arb_task_id() -> impl Strategy<Value = TaskId> {
    any::<u128>().prop_map(|n| TaskId::from_uuid(Uuid::from_u128(n)))
}

fn arb_user() -> impl Strategy<Value = UserId> {
    "[a-zA-Z0-9]{1,28}".prop_map(UserId::new)
}

fn arb_team_code() -> impl Strategy<Value = TeamCode> {
    prop::collection::vec(prop::sample::select(TEAM_CODE_ALPHABET), TEAM_CODE_LENGTH).prop_map(
        |bytes| {
            let raw: String = bytes.into_iter().map(char::from).collect();
            TeamCode::parse(&raw).unwrap()
        },
    )
}

fn arb_assignee() -> impl Strategy<Value = Assignee> {
    prop_oneof![Just(Assignee::Common), arb_user().prop_map(Assignee::Member)]
}

fn arb_task() -> impl Strategy<Value = Task> {
    (
        arb_task_id(),
        arb_team_code(),
        "[^\x00]{1,64}",
        arb_assignee(),
        arb_user(),
        any::<u64>(),
        any::<bool>(),
        0u64..10_000,
        prop::option::of(arb_user()),
    )
        .prop_map(
            |(id, team, name, assignee, creator, now, done, minutes, holder)| {
                let mut task = Task::new(id, team, name, assignee, creator, now);
                if done {
                    task.status = TaskStatus::Done;
                }
                task.time_spent = minutes;
                task.is_active = holder.is_some();
                task.active_user = holder;
                task
            },
        )
}

fn arb_condition() -> impl Strategy<Value = TaskCondition> {
    prop_oneof![
        Just(TaskCondition::Status(TaskStatus::Pending)),
        Just(TaskCondition::Status(TaskStatus::Done)),
        any::<bool>().prop_map(TaskCondition::Active),
        Just(TaskCondition::Unclaimed),
        arb_user().prop_map(TaskCondition::UnclaimedOrHeldBy),
        Just(TaskCondition::NotArchived),
    ]
}

fn arb_write() -> impl Strategy<Value = Write> {
    prop_oneof![
        arb_task().prop_map(Write::PutTask),
        arb_task_id().prop_map(Write::DeleteTask),
        (
            arb_task_id(),
            prop::collection::vec(arb_condition(), 0..4),
            prop::option::of(0u64..600),
            prop::option::of(prop::option::of(arb_user())),
        )
            .prop_map(|(id, expect, minutes, holder)| Write::PatchTask {
                id,
                expect,
                patch: TaskPatch {
                    add_time_spent: minutes,
                    active_user: holder,
                    ..TaskPatch::default()
                },
            }),
        (arb_team_code(), arb_user(), any::<i64>(), any::<i64>(), any::<u64>()).prop_map(
            |(team, user, tasks_completed, seconds, at)| Write::AdjustContribution {
                team,
                user,
                tasks_completed,
                seconds,
                at,
            }
        ),
    ]
}

fn arb_failure() -> impl Strategy<Value = StoreFailure> {
    prop_oneof![
        ".*".prop_map(StoreFailure::NotFound),
        ".*".prop_map(StoreFailure::PreconditionFailed),
        ".*".prop_map(StoreFailure::Conflict),
        ".*".prop_map(StoreFailure::Unavailable),
    ]
}

// --- Properties ---

proptest! {
    #[test]
    fn commit_frame_roundtrip(id in any::<u64>(), writes in prop::collection::vec(arb_write(), 0..8)) {
        let mut batch = WriteBatch::new();
        for write in writes {
            batch.push(write);
        }
        let frame = ClientFrame { id, request: Request::Commit(batch) };
        let bytes = store::encode_client(&frame).unwrap();
        prop_assert_eq!(store::decode_client(&bytes).unwrap(), frame);
    }

    #[test]
    fn snapshot_push_roundtrip(
        subscription in any::<u64>(),
        tasks in prop::collection::vec(arb_task(), 0..6),
    ) {
        let frame = ServerFrame::Snapshot { subscription, snapshot: Snapshot::Tasks(tasks) };
        let bytes = store::encode_server(&frame).unwrap();
        prop_assert_eq!(store::decode_server(&bytes).unwrap(), frame);
    }

    #[test]
    fn reply_outcome_roundtrip(id in any::<u64>(), failure in prop::option::of(arb_failure())) {
        let result = failure.map_or(Ok(Reply::Committed), Err);
        let frame = ServerFrame::Reply { id, result };
        let bytes = store::encode_server(&frame).unwrap();
        prop_assert_eq!(store::decode_server(&bytes).unwrap(), frame);
    }

    #[test]
    fn random_bytes_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = store::decode_client(&bytes);
        let _ = store::decode_server(&bytes);
    }

    #[test]
    fn team_code_parse_is_case_insensitive(code in arb_team_code()) {
        let lower = code.as_str().to_ascii_lowercase();
        prop_assert_eq!(TeamCode::parse(&format!("  {lower} ")).unwrap(), code);
    }

    #[test]
    fn team_code_rejects_foreign_characters(raw in "[01IO]{6}") {
        prop_assert!(TeamCode::parse(&raw).is_err());
    }
}
