/// PROPERTY-BASED TESTS: path handling invariants
///
/// Key invariants:
/// 1. Normalizing is idempotent and classification only depends on the
///    normalized form
/// 2. Alias resolution stops after MAX_ALIAS_DEPTH substitutions, cycles
///    included
/// 3. `*` never crosses a separator, `#` does
use proptest::prelude::*;

use reslink_shared::{
    is_normalized, match_single, Directory, DirectoryConfig, MAX_ALIAS_DEPTH,
};

fn directory() -> Directory {
    Directory::new(
        DirectoryConfig::new("alpha")
            .with_host("beta", "127.0.0.1", 4700)
            .with_driver("gpio")
            .with_alias("lights", "/local/gpio/lights"),
    )
    .unwrap()
}

/// Directory whose aliases `a0` .. `a<n-1>` each point to the next one;
/// the last points to `last`
fn chained(n: usize, last: &str) -> Directory {
    let mut config = DirectoryConfig::new("alpha").with_driver("gpio");
    for i in 0..n {
        let target = if i + 1 == n {
            last.to_string()
        } else {
            format!("/alias/a{}", i + 1)
        };
        config = config.with_alias(&format!("a{}", i), &target);
    }
    Directory::new(config).unwrap()
}

// Path segments including the ones normalization has to remove
fn segment_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        Just(String::new()),
        Just(".".to_string()),
        Just("..".to_string()),
        Just("host".to_string()),
        Just("local".to_string()),
        Just("alias".to_string()),
        Just("env".to_string()),
        Just("alpha".to_string()),
        Just("beta".to_string()),
        Just("gpio".to_string()),
        "[a-z0-9_]{1,6}",
    ]
}

fn raw_path_strategy() -> impl Strategy<Value = String> {
    (any::<bool>(), prop::collection::vec(segment_strategy(), 0..8), any::<bool>()).prop_map(
        |(absolute, segments, trailing)| {
            let mut path = segments.join("/");
            if absolute {
                path.insert(0, '/');
            }
            if trailing {
                path.push('/');
            }
            path
        },
    )
}

fn plain_segment_strategy() -> impl Strategy<Value = String> {
    "[a-z0-9_]{1,8}"
}

proptest! {
    #[test]
    fn prop_normalize_is_idempotent(raw in raw_path_strategy()) {
        let dir = directory();
        let once = dir.normalize(&raw).into_owned();
        prop_assert!(is_normalized(&once), "'{}' normalized to '{}'", raw, once);
        let twice = dir.normalize(&once);
        prop_assert_eq!(twice.as_ref(), once.as_str());
    }

    #[test]
    fn prop_classification_ignores_redundant_segments(raw in raw_path_strategy()) {
        let dir = directory();
        let once = dir.normalize(&raw).into_owned();
        let twice = dir.normalize(&once).into_owned();
        prop_assert_eq!(dir.classify(&once), dir.classify(&twice));
    }

    #[test]
    fn prop_resolved_paths_are_normalized(raw in raw_path_strategy()) {
        let dir = directory();
        let resolution = dir.resolve(&raw, None);
        prop_assert!(is_normalized(&resolution.path));
        if !resolution.resolved {
            prop_assert_eq!(resolution.path, dir.normalize(&raw));
        }
    }

    #[test]
    fn prop_alias_cycles_terminate(n in 1usize..24, start in 0usize..24) {
        prop_assume!(start < n);
        let dir = chained(n, "/alias/a0");
        let uri = format!("/alias/a{}", start);
        let resolution = dir.resolve(&uri, None);
        prop_assert!(!resolution.resolved);
        prop_assert_eq!(resolution.path.as_ref(), uri.as_str());
    }

    #[test]
    fn prop_alias_chains_resolve_within_depth(n in 1usize..16) {
        let dir = chained(n, "/local/gpio/x");
        let resolution = dir.resolve("/alias/a0", None);
        // n alias hops plus the `/local` rewrite
        let substitutions = n + 1;
        prop_assert_eq!(resolution.resolved, substitutions <= MAX_ALIAS_DEPTH);
        if resolution.resolved {
            prop_assert_eq!(resolution.path.as_ref(), "/host/alpha/gpio/x");
        } else {
            prop_assert_eq!(resolution.path.as_ref(), "/alias/a0");
        }
    }

    #[test]
    fn prop_star_stays_within_a_segment(
        parent in plain_segment_strategy(),
        child in plain_segment_strategy(),
        grandchild in plain_segment_strategy(),
    ) {
        let pattern = format!("/local/drv/{}/*", parent);
        let hash = format!("/local/drv/{}/#", parent);
        let one = format!("/local/drv/{}/{}", parent, child);
        let two = format!("{}/{}", one, grandchild);
        prop_assert!(match_single(&one, &pattern));
        prop_assert!(!match_single(&two, &pattern));
        prop_assert!(match_single(&one, &hash));
        prop_assert!(match_single(&two, &hash));
    }
}
