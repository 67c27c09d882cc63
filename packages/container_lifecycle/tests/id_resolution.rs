use proptest::prelude::*;
use std::collections::BTreeSet;

use container_lifecycle::{ContainerId, DEFAULT_MIN_PREFIX_LEN, IdResolver, LifecycleError};

fn arb_ids() -> impl Strategy<Value = BTreeSet<String>> {
    prop::collection::btree_set("[0-9a-f]{8}", 1..16)
}

proptest! {
    #[test]
    fn full_ids_always_resolve(ids in arb_ids()) {
        let mut resolver = IdResolver::default();
        for id in &ids {
            resolver.register(ContainerId::from(id.as_str()));
        }
        for id in &ids {
            let resolved = resolver.resolve(id).unwrap();
            prop_assert_eq!(resolved.as_str(), id.as_str());
        }
    }

    #[test]
    fn prefix_outcome_matches_brute_force(
        ids in arb_ids(),
        len in DEFAULT_MIN_PREFIX_LEN..8usize,
        pick in any::<prop::sample::Index>(),
    ) {
        let mut resolver = IdResolver::default();
        for id in &ids {
            resolver.register(ContainerId::from(id.as_str()));
        }
        let target = pick.get(&ids.iter().collect::<Vec<_>>()).to_string();
        let prefix = &target[..len];
        let expected: Vec<&String> = ids.iter().filter(|id| id.starts_with(prefix)).collect();

        match resolver.resolve(prefix) {
            Ok(id) => {
                prop_assert_eq!(expected.len(), 1);
                prop_assert_eq!(id.as_str(), target.as_str());
            }
            Err(LifecycleError::AmbiguousId { matches, .. }) => {
                prop_assert_eq!(matches, expected.len());
                prop_assert!(matches >= 2);
            }
            Err(other) => prop_assert!(false, "unexpected error: {}", other),
        }
    }

    #[test]
    fn short_inputs_never_resolve(ids in arb_ids(), len in 0..DEFAULT_MIN_PREFIX_LEN) {
        let mut resolver = IdResolver::default();
        for id in &ids {
            resolver.register(ContainerId::from(id.as_str()));
        }
        let first = ids.iter().next().unwrap();
        let is_not_found = matches!(resolver.resolve(&first[..len]), Err(LifecycleError::NotFound(_)));
        prop_assert!(is_not_found);
    }
}
