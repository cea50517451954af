//! Property-based tests for bounded memory tiers

use proptest::prelude::*;
use strata_cache::{BoundedObjectCache, CapacityProfile};

fn operation_strategy() -> impl Strategy<Value = (u8, u64)> {
    (0u8..32, 1u64..400)
}

/// Property: after any sequence of inserts, a tier never holds more entries or more
/// cost than its profile allows.
#[test]
fn prop_limits_hold_after_every_insert() {
    proptest!(|(
        count_limit in 1usize..16,
        cost_limit in 100u64..2_000,
        operations in prop::collection::vec(operation_strategy(), 1..200),
    )| {
        let cache = BoundedObjectCache::new("prop", CapacityProfile::new(count_limit, cost_limit));

        for (key, cost) in operations {
            cache.set(format!("key_{}", key), u64::from(key), cost);

            prop_assert!(cache.current_count() <= count_limit);
            prop_assert!(cache.current_cost() <= cost_limit);
        }
    });
}

/// Property: the reported cost always equals the sum of the costs of retained entries.
#[test]
fn prop_cost_accounting_matches_entries() {
    proptest!(|(operations in prop::collection::vec(operation_strategy(), 1..100))| {
        let cache = BoundedObjectCache::new("prop", CapacityProfile::new(8, 1_000));
        let mut costs = std::collections::HashMap::new();

        for (key, cost) in operations {
            let key = format!("key_{}", key);
            let evicted = cache.set(key.clone(), cost, cost);
            costs.insert(key, cost);
            for (evicted_key, _) in evicted {
                costs.remove(&evicted_key);
            }
        }

        let expected: u64 = cache
            .keys_by_recency()
            .iter()
            .map(|key| costs[key])
            .sum();
        prop_assert_eq!(cache.current_cost(), expected);
        prop_assert_eq!(cache.keys_by_recency().len(), cache.current_count());
    });
}

/// Property: the most recently inserted entry survives unless it alone exceeds the
/// cost limit.
#[test]
fn prop_latest_insert_retained() {
    proptest!(|(operations in prop::collection::vec(operation_strategy(), 1..100))| {
        let cost_limit = 500;
        let cache = BoundedObjectCache::new("prop", CapacityProfile::new(4, cost_limit));

        for (key, cost) in operations {
            let key = format!("key_{}", key);
            cache.set(key.clone(), cost, cost);
            prop_assert_eq!(cache.contains(&key), cost <= cost_limit);
        }
    });
}
