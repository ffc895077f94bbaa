mod support;

use std::collections::BTreeMap;

use permissionsex_store::{ContextSet, Segment};
use proptest::prelude::*;
use support::open_store;

fn arb_key() -> impl Strategy<Value = String> {
    "[a-z]{1,8}"
}

fn arb_permission_value() -> impl Strategy<Value = i32> {
    -5..5i32
}

proptest! {
    /// Invariant 3: setting a permission to 0 is equivalent to clearing it,
    /// whether or not a prior value existed.
    #[test]
    fn zero_permission_equals_clear(key in arb_key(), value in arb_permission_value()) {
        let seg = Segment::new(ContextSet::global()).with_permission(&key, value);
        let via_zero = seg.with_permission(&key, 0);
        let via_clear = seg.without_permission(&key);
        prop_assert_eq!(via_zero.permissions().clone(), via_clear.permissions().clone());
        prop_assert!(!via_zero.permissions().contains_key(&key));
    }

    /// Invariant 5: a segment touched only by mutations that net out to
    /// empty carries the same content as one that never existed.
    #[test]
    fn segment_emptied_by_mutation_matches_a_fresh_one(key in arb_key(), value in 1..10i32) {
        let ctx = ContextSet::global();
        let built = Segment::new(ctx.clone()).with_permission(&key, value).without_permission(&key);
        let fresh = Segment::new(ctx);
        prop_assert_eq!(built.permissions().clone(), fresh.permissions().clone());
        prop_assert!(built.is_empty());
    }

    /// Invariant 2 (restricted to one field, one context): flushing a
    /// snapshot, reloading it, and reading back its permissions yields the
    /// same map as applying the mutation to an in-memory segment directly —
    /// the SQL round trip doesn't lose or reorder permission entries.
    #[test]
    fn permission_map_survives_a_flush_and_reload(entries in proptest::collection::btree_map(arb_key(), 1..10i32, 0..4)) {
        let expected: BTreeMap<String, i32> = entries.clone();
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async move {
            let store = open_store().await;
            let data = store.get_data("user", "proptest-subject").await.unwrap();
            let ctx = ContextSet::global();
            let updated = data.set_permissions(&ctx, entries);
            store.set_data("user", "proptest-subject", &updated).await.unwrap().await.unwrap();

            let reloaded = store.get_data("user", "proptest-subject").await.unwrap();
            prop_assert_eq!(reloaded.permissions(&ctx), expected);
            Ok(())
        })?;
    }
}
