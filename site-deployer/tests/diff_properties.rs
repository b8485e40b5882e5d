use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use site_deployer::diff::diff;
use site_deployer::fs::Fingerprint;
use site_deployer::manifest::{Manifest, ManifestEntry};
use std::collections::{BTreeMap, BTreeSet};

fn manifest_from(files: &BTreeMap<String, u8>) -> Manifest {
    let mut manifest = Manifest::with_timestamp(1, Utc.timestamp_opt(0, 0).unwrap());
    for (path, content) in files {
        manifest.insert(ManifestEntry {
            path: path.clone(),
            fingerprint: Fingerprint::from_bytes(&[*content]),
            size: 1,
            mtime: Utc.timestamp_opt(0, 0).unwrap(),
        });
    }
    manifest
}

fn tree() -> impl Strategy<Value = BTreeMap<String, u8>> {
    prop::collection::btree_map("[a-d]{1,2}(/[a-d]{1,2})?", 0u8..4, 0..12)
}

proptest! {
    #[test]
    fn diff_against_itself_is_empty(files in tree()) {
        let manifest = manifest_from(&files);
        let changes = diff(Some(&manifest), &manifest);
        prop_assert!(changes.is_empty());
        prop_assert_eq!(changes.unchanged.len(), manifest.len());
    }

    #[test]
    fn diff_partitions_union_exactly_once(before in tree(), after in tree()) {
        let baseline = manifest_from(&before);
        let current = manifest_from(&after);
        let changes = diff(Some(&baseline), &current);

        let union: BTreeSet<String> = before.keys().chain(after.keys()).cloned().collect();
        let categories = [&changes.added, &changes.removed, &changes.modified, &changes.unchanged];

        let total: usize = categories.iter().map(|c| c.len()).sum();
        prop_assert_eq!(total, union.len());
        for path in &union {
            let hits = categories.iter().filter(|c| c.contains(path)).count();
            prop_assert_eq!(hits, 1, "{} classified {} times", path, hits);
        }

        for path in &changes.modified {
            prop_assert_ne!(before[path], after[path]);
        }
        for path in &changes.unchanged {
            prop_assert_eq!(before[path], after[path]);
        }
    }

    #[test]
    fn first_run_adds_everything(files in tree()) {
        let current = manifest_from(&files);
        let changes = diff(None, &current);
        prop_assert_eq!(changes.added.len(), files.len());
        prop_assert!(changes.removed.is_empty() && changes.modified.is_empty() && changes.unchanged.is_empty());
    }
}
