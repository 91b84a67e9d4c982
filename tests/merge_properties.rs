//! Property tests for the last-writer-wins merge.

use chrono::{DateTime, TimeZone, Utc};
use eremois_sync::crypto::EncryptionManager;
use eremois_sync::model::{
    BlockType, MeetingPreferences, SyncableData, Task, TimeBlock, UserPattern,
};
use eremois_sync::storage::MemoryStorage;
use eremois_sync::sync::{merge_entities, SyncManager};
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

fn at(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).unwrap()
}

fn task(id: u8, title: &str, updated_ms: i64) -> Task {
    Task {
        id: format!("t{}", id),
        title: title.to_string(),
        created_at: at(updated_ms),
        updated_at: at(updated_ms),
        ..Task::new(title)
    }
}

fn time_block(id: u8, title: &str, updated_ms: i64) -> TimeBlock {
    TimeBlock {
        id: format!("b{}", id),
        block_type: BlockType::Focus,
        start_time: at(0),
        end_time: at(25 * 60 * 1_000),
        title: Some(title.to_string()),
        description: None,
        color: None,
        updated_at: at(updated_ms),
    }
}

fn user_pattern(focus_minutes: u32, updated_ms: i64) -> UserPattern {
    UserPattern {
        id: "pattern".to_string(),
        preferred_focus_duration: focus_minutes,
        preferred_break_duration: 5,
        productive_periods: Vec::new(),
        meeting_preferences: MeetingPreferences::default(),
        updated_at: at(updated_ms),
    }
}

/// Which timestamps a generated store may use. `Even` and `Odd` never tie
/// with each other; `Any` may tie with both.
#[derive(Debug, Clone, Copy)]
enum Clock {
    Any,
    Even,
    Odd,
}

impl Clock {
    fn stamp(self, raw: i64) -> i64 {
        match self {
            Clock::Any => (raw * 7) % 1_000,
            Clock::Even => raw * 2,
            Clock::Odd => raw * 2 + 1,
        }
    }
}

/// A whole store: tasks, time blocks and maybe a user pattern. `label`
/// marks every entity so a wrong winner is visible in the diff.
fn store(label: &'static str, clock: Clock) -> impl Strategy<Value = SyncableData> {
    (
        prop::collection::hash_map(0u8..8, 0i64..500, 0..6),
        prop::collection::hash_map(0u8..8, 0i64..500, 0..6),
        prop::option::of((1u32..120, 0i64..500)),
    )
        .prop_map(move |(tasks, blocks, pattern)| SyncableData {
            tasks: tasks
                .into_iter()
                .map(|(id, raw)| task(id, label, clock.stamp(raw)))
                .collect(),
            time_blocks: blocks
                .into_iter()
                .map(|(id, raw)| time_block(id, label, clock.stamp(raw)))
                .collect(),
            user_pattern: pattern.map(|(focus, raw)| user_pattern(focus, clock.stamp(raw))),
        })
}

fn normalized(mut data: SyncableData) -> SyncableData {
    data.tasks.sort_by(|a, b| a.id.cmp(&b.id));
    data.time_blocks.sort_by(|a, b| a.id.cmp(&b.id));
    data
}

/// Merge `updates` into a fresh manager holding `base`, in order.
fn merged_through_manager(base: &SyncableData, updates: [&SyncableData; 2]) -> SyncableData {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async {
        let manager = SyncManager::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(EncryptionManager::with_new_key()),
            "device-under-test",
        )
        .await
        .unwrap();

        manager.merge_data(base.clone()).await.unwrap();
        for update in updates {
            manager.merge_data(update.clone()).await.unwrap();
        }
        normalized(manager.snapshot().await.unwrap())
    })
}

/// Up to eight tasks with unique ids drawn from a small pool so that local
/// and remote overlap often.
fn tasks(side: &'static str) -> impl Strategy<Value = Vec<Task>> {
    prop::collection::hash_map(0u8..12, 0i64..1_000, 0..8).prop_map(move |entries| {
        let mut list: Vec<Task> = entries
            .into_iter()
            .map(|(id, updated)| task(id, side, updated))
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    })
}

fn by_id(mut list: Vec<Task>) -> Vec<Task> {
    list.sort_by(|a, b| a.id.cmp(&b.id));
    list
}

proptest! {
    #[test]
    fn merge_is_idempotent(local in tasks("local"), remote in tasks("remote")) {
        let (once, _) = merge_entities(local, remote.clone());
        let (twice, taken) = merge_entities(once.clone(), remote);
        prop_assert_eq!(taken, 0);
        prop_assert_eq!(twice, once);
    }

    #[test]
    fn merge_with_self_changes_nothing(local in tasks("local")) {
        let (merged, taken) = merge_entities(local.clone(), local.clone());
        prop_assert_eq!(taken, 0);
        prop_assert_eq!(merged, local);
    }

    #[test]
    fn merge_keeps_union_and_newest(local in tasks("local"), remote in tasks("remote")) {
        let (merged, _) = merge_entities(local.clone(), remote.clone());

        let mut expected: HashMap<String, Task> =
            local.into_iter().map(|t| (t.id.clone(), t)).collect();
        for theirs in remote {
            match expected.get(&theirs.id) {
                Some(ours) if theirs.updated_at <= ours.updated_at => {}
                _ => {
                    expected.insert(theirs.id.clone(), theirs);
                }
            }
        }

        prop_assert_eq!(merged.len(), expected.len());
        for t in &merged {
            prop_assert_eq!(Some(t), expected.get(&t.id));
        }
    }

    #[test]
    fn merge_commutes_for_distinct_timestamps(local in tasks("a"), remote in tasks("b")) {
        // Shift one side onto odd timestamps so no shared id ties
        let remote: Vec<Task> = remote
            .into_iter()
            .map(|mut t| {
                t.updated_at = at(t.updated_at.timestamp_millis() * 2 + 1);
                t
            })
            .collect();
        let local: Vec<Task> = local
            .into_iter()
            .map(|mut t| {
                t.updated_at = at(t.updated_at.timestamp_millis() * 2);
                t
            })
            .collect();

        let (ab, _) = merge_entities(local.clone(), remote.clone());
        let (ba, _) = merge_entities(remote, local);
        prop_assert_eq!(by_id(ab), by_id(ba));
    }

    #[test]
    fn store_merge_is_order_independent(
        base in store("base", Clock::Any),
        a in store("a", Clock::Even),
        b in store("b", Clock::Odd),
    ) {
        let ab = merged_through_manager(&base, [&a, &b]);
        let ba = merged_through_manager(&base, [&b, &a]);
        prop_assert_eq!(ab, ba);
    }

    #[test]
    fn store_merge_keeps_newest_user_pattern(
        base in store("base", Clock::Any),
        a in store("a", Clock::Even),
        b in store("b", Clock::Odd),
    ) {
        let merged = merged_through_manager(&base, [&a, &b]);

        let newest = [&base, &a, &b]
            .into_iter()
            .filter_map(|data| data.user_pattern.as_ref())
            .map(|pattern| pattern.updated_at)
            .max();
        prop_assert_eq!(merged.user_pattern.map(|p| p.updated_at), newest);
    }
}
