//! Property-based tests for the research engine
//!
//! Invariants of task drawing, queue accounting, result storage, filtering
//! and device partitioning.
//! Run with ProptestConfig::with_cases(64)

use proptest::prelude::*;
use research_engine::config::Config;
use research_engine::domain::{Domain, Opt};
use research_engine::experiment::{ExperimentResults, Series};
use research_engine::research::{
    partition, ConfigFilter, Devices, DynamicQueue, ResearchResults, Task, TaskQueue,
};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::thread;

// ============================================================================
// Strategies
// ============================================================================

fn queue_for(size: usize, n_branches: usize) -> DynamicQueue {
    let domain = Domain::grid(vec![Opt::new("x", 0..size as i64)]);
    let feedback = Arc::new(ResearchResults::new("prop", false));
    DynamicQueue::new(domain, feedback, n_branches)
}

fn drain(queue: &DynamicQueue) -> Vec<Task> {
    let handle = queue.handle();
    let mut tasks = Vec::new();
    while !handle.is_empty() {
        if let Some(task) = handle.get() {
            tasks.push(task);
        }
        handle.task_done();
    }
    tasks
}

fn arb_results() -> impl Strategy<Value = ExperimentResults> {
    proptest::collection::btree_map(
        "[a-c]",
        proptest::collection::btree_map(0usize..20, (0i64..100).prop_map(|v| json!(v)), 0..5)
            .prop_map(|m| m.into_iter().collect::<Series>()),
        0..3,
    )
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: a finite domain of size S yields ceil(S / B) distinct task ids
    #[test]
    fn prop_task_count_is_ceil(size in 0usize..60, n_branches in 1usize..6, per_call in 1usize..5) {
        let mut queue = queue_for(size, n_branches);
        while queue.next_tasks(per_call) > 0 {}
        let tasks = drain(&queue);

        let ids: BTreeSet<usize> = tasks.iter().map(|t| t.id).collect();
        prop_assert_eq!(ids.len(), size.div_ceil(n_branches));
        prop_assert_eq!(ids.len(), tasks.len());
        prop_assert_eq!(queue.withdrawn_tasks(), tasks.len());
    }

    /// Property: never more configs than the domain holds; only the last batch may be short
    #[test]
    fn prop_partial_batch_only_at_end(size in 0usize..60, n_branches in 1usize..6, per_call in 1usize..5) {
        let mut queue = queue_for(size, n_branches);
        while queue.next_tasks(per_call) > 0 {}
        let tasks = drain(&queue);

        let total: usize = tasks.iter().map(|t| t.configs.len()).sum();
        prop_assert_eq!(total, size);
        for (i, task) in tasks.iter().enumerate() {
            prop_assert!(!task.configs.is_empty());
            if i + 1 < tasks.len() {
                prop_assert_eq!(task.configs.len(), n_branches);
            }
        }
        let xs: Vec<i64> = tasks
            .iter()
            .flat_map(|t| t.configs.iter().filter_map(|c| c.get("x")?.as_i64()))
            .collect();
        prop_assert_eq!(xs, (0..size as i64).collect::<Vec<_>>());
    }

    /// Property: join increments finished_tasks by exactly one per wave
    #[test]
    fn prop_join_counts_waves(waves in proptest::collection::vec(1usize..6, 1..6)) {
        let mut queue = queue_for(1000, 1);
        for (i, n) in waves.iter().enumerate() {
            queue.next_tasks(*n);
            drain(&queue);
            queue.join();
            prop_assert_eq!(queue.finished_tasks(), i + 1);
            prop_assert!(queue.withdrawn_tasks() >= queue.finished_tasks());
        }
        prop_assert_eq!(queue.withdrawn_tasks(), waves.iter().sum::<usize>());
    }

    /// Property: repeated identical puts leave one row per (id, name, iteration)
    #[test]
    fn prop_put_idempotent(results in arb_results(), repeats in 1usize..4) {
        let store = ResearchResults::new("prop", false);
        for _ in 0..repeats {
            store.put("exp", results.clone(), Config::new().with("x", 1));
        }
        let expected: usize = results.values().map(BTreeMap::len).sum();
        let df = store.to_df(false, false).unwrap();
        prop_assert_eq!(df.num_rows(), expected);
        prop_assert_eq!(store.len(), 1);
    }

    /// Property: config and extra keyword filters combine with AND
    #[test]
    fn prop_filter_and_semantics(
        configs in proptest::collection::vec((0i64..3, 0i64..3), 1..12),
        a in 0i64..3,
        b in 0i64..3,
    ) {
        let store = ResearchResults::new("prop", false);
        for (i, (x, y)) in configs.iter().enumerate() {
            store.put(format!("e{i:02}"), ExperimentResults::new(), Config::new().with("x", *x).with("y", *y));
        }

        let both = ConfigFilter::new()
            .config(Config::new().with("x", a).config())
            .with("y", b);
        let found = store.filter_ids_by_configs(&both).unwrap();
        let expected: Vec<String> = configs
            .iter()
            .enumerate()
            .filter(|(_, (x, y))| *x == a && *y == b)
            .map(|(i, _)| format!("e{i:02}"))
            .collect();
        prop_assert_eq!(found, expected);

        let clash = ConfigFilter::new()
            .config(Config::new().with("x", a).config())
            .alias([("y", b.to_string())]);
        prop_assert!(store.filter_ids_by_configs(&clash).is_err());
    }

    /// Property: stop_workers(n) delivers exactly one sentinel to each of n consumers
    /// and draining the sentinels leaves the wave counter untouched
    #[test]
    fn prop_one_sentinel_per_consumer(n in 1usize..8, tasks in 0usize..10) {
        let mut queue = queue_for(tasks, 1);
        queue.next_tasks(tasks);
        queue.stop_workers(n);
        let handle = queue.handle();

        let consumers: Vec<_> = (0..n)
            .map(|_| {
                let handle = Arc::clone(&handle);
                thread::spawn(move || {
                    let mut processed = 0;
                    loop {
                        let item = handle.get();
                        handle.task_done();
                        match item {
                            Some(_) => processed += 1,
                            None => return processed,
                        }
                    }
                })
            })
            .collect();
        let processed: usize = consumers.into_iter().map(|c| c.join().unwrap()).sum();

        prop_assert_eq!(processed, tasks);
        prop_assert!(handle.is_empty());
        handle.join();
        prop_assert_eq!(queue.finished_tasks(), 0);
        prop_assert!(queue.withdrawn_tasks() >= queue.finished_tasks());
    }

    /// Property: listed devices never overlap across branches unless shared by division
    #[test]
    fn prop_partition_covers_grid(workers in 1usize..4, branches in 1usize..4, per_slot in 1usize..3) {
        let n_devices = workers * branches * per_slot;
        let p = partition(&Devices::list(0..n_devices), workers, branches).unwrap();

        prop_assert_eq!(p.len(), workers);
        let mut seen = BTreeSet::new();
        for slots in &p {
            prop_assert_eq!(slots.len(), branches);
            for devices in slots {
                prop_assert_eq!(devices.len(), per_slot);
                for d in devices {
                    prop_assert!(seen.insert(d.clone()), "device {} assigned twice", d);
                }
            }
        }
        prop_assert_eq!(seen.len(), n_devices);
    }
}
