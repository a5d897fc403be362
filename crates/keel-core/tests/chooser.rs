//! 反应器池分配器的公平性与聚合终止。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use keel_core::executor::{EventExecutor, ReactorGroup};
use keel_core::test_stubs::StubSelectorProvider;
use proptest::prelude::*;

fn group_of(size: usize, prefix: &str) -> Arc<ReactorGroup> {
    ReactorGroup::builder(Arc::new(StubSelectorProvider))
        .size(size)
        .name_prefix(prefix)
        .build()
        .expect("group")
}

fn round_robin_counts(group: &ReactorGroup, rounds: usize) -> HashMap<String, usize> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for _ in 0..group.len() * rounds {
        *counts.entry(group.next().name().to_string()).or_default() += 1;
    }
    counts
}

#[test]
fn power_of_two_chooser_is_exactly_fair() {
    let group = group_of(4, "fair-pow2");
    let counts = round_robin_counts(&group, 5);
    assert_eq!(counts.len(), 4);
    assert!(counts.values().all(|&n| n == 5), "uneven counts: {counts:?}");
}

#[test]
fn modulo_chooser_is_exactly_fair() {
    let group = group_of(3, "fair-mod");
    let counts = round_robin_counts(&group, 7);
    assert_eq!(counts.len(), 3);
    assert!(counts.values().all(|&n| n == 7), "uneven counts: {counts:?}");
}

#[test]
fn round_robin_starts_at_the_first_member() {
    let group = group_of(2, "fair-order");
    assert_eq!(group.next().name(), "fair-order-0");
    assert_eq!(group.next().name(), "fair-order-1");
    assert_eq!(group.next().name(), "fair-order-0");
}

#[test]
fn group_shutdown_aggregates_member_termination() {
    let group = group_of(2, "agg-shutdown");
    // 启动两个成员的工作线程。
    for reactor in group.iter() {
        reactor.execute(Box::new(|| {}));
    }
    let terminated = group.shutdown_gracefully(Duration::ZERO, Duration::from_secs(2));
    terminated
        .await_outcome(Some(Duration::from_secs(5)))
        .expect("aggregate completes");
    assert!(group.is_shutting_down());
    assert!(group.is_shutdown());
    assert!(group.is_terminated());
    assert!(group.await_termination(Duration::from_secs(1)));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// 任意规模、任意窗口长度下，每个成员的命中次数完全相等。
    #[test]
    fn chooser_fairness_holds_for_any_size(size in 1usize..=8, rounds in 1usize..=16) {
        let group = group_of(size, "fair-prop");
        let counts = round_robin_counts(&group, rounds);
        prop_assert_eq!(counts.len(), size);
        prop_assert!(counts.values().all(|&n| n == rounds));
    }
}
