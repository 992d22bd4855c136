use small_store::{btree::IntegrityReport, StorageEngine, Tree};

use super::{key, key_of, value};

/// Check the structure of the tree and that it holds exactly `expected`,
/// which must be sorted.
pub fn assert_tree_content(
    engine: &StorageEngine,
    tree: &Tree,
    expected: &[u32],
) -> IntegrityReport {
    let report = tree.check_integrity(engine).unwrap();
    assert_eq!(expected.len(), report.entries);

    let entries = tree.entries(engine).unwrap();
    let keys: Vec<u32> = entries.iter().map(|(k, _)| key_of(k)).collect();
    assert_eq!(expected, &keys[..]);
    for (k, v) in &entries {
        assert_eq!(&value(key_of(k)), v);
    }
    report
}

pub fn assert_keys_present(engine: &StorageEngine, tree: &Tree, keys: &[u32]) {
    for &i in keys {
        assert_eq!(Some(value(i)), tree.get(engine, &key(i)).unwrap(), "key {}", i);
    }
}

pub fn assert_keys_absent(engine: &StorageEngine, tree: &Tree, keys: &[u32]) {
    for &i in keys {
        assert_eq!(None, tree.get(engine, &key(i)).unwrap(), "key {}", i);
    }
}
