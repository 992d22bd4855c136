mod test_utils;

use std::cmp::Ordering;

use small_store::{
    btree::{TreePage, MAX_RECORD_SIZE},
    tx_log::LogRecord,
    ErrorKind, TreeKind,
};
use test_utils::{
    assert_keys_present, assert_tree_content, insert_committed, insert_keys, key, new_context,
    setup, shuffled, value,
};

#[test]
fn test_insert_single_page() {
    setup();
    let ctx = new_context();
    let tree = ctx.new_tree(TreeKind::Primary);

    insert_committed(&ctx.engine, &tree, 0..90);

    let expected: Vec<u32> = (0..90).collect();
    let report = assert_tree_content(&ctx.engine, &tree, &expected);
    assert_eq!(0, report.depth);
    assert_eq!(1, report.leaves);
    assert_eq!(0, report.branches);
}

#[test]
fn test_sequential_splits() {
    setup();
    let ctx = new_context();
    let tree = ctx.new_tree(TreeKind::Primary);

    insert_committed(&ctx.engine, &tree, 0..1000);

    let expected: Vec<u32> = (0..1000).collect();
    let report = assert_tree_content(&ctx.engine, &tree, &expected);
    assert_eq!(1, report.depth);
    assert_eq!(1, report.branches);

    // appending at the end leaves full pages behind
    assert!(report.leaves >= 10 && report.leaves <= 11, "{:?}", report);
}

#[test]
fn test_random_inserts() {
    setup();
    let ctx = new_context();
    let tree = ctx.new_tree(TreeKind::Secondary);

    insert_committed(&ctx.engine, &tree, shuffled(0..3000));

    let expected: Vec<u32> = (0..3000).collect();
    let report = assert_tree_content(&ctx.engine, &tree, &expected);
    assert!(report.leaves >= 20, "{:?}", report);
    assert_keys_present(&ctx.engine, &tree, &[0, 1, 1500, 2999]);
}

#[test]
fn test_split_keeps_structure() {
    setup();
    let ctx = new_context();
    let tree = ctx.new_tree(TreeKind::Primary);
    let tx = ctx.engine.begin_transaction();

    let mut previous = tree.check_integrity(&ctx.engine).unwrap();
    for (n, i) in shuffled(0..1500).into_iter().enumerate() {
        tree.insert(&ctx.engine, &tx, &key(i), &value(i)).unwrap();

        let report = tree.check_integrity(&ctx.engine).unwrap();
        assert_eq!(n + 1, report.entries);
        // one insert splits at most one leaf
        assert!(
            report.leaves == previous.leaves || report.leaves == previous.leaves + 1,
            "{:?} -> {:?}",
            previous,
            report
        );
        previous = report;
    }
    ctx.engine.commit_transaction(&tx);

    assert!(previous.leaves > 15, "{:?}", previous);
}

#[test]
fn test_deep_tree_with_large_keys() {
    setup();
    let ctx = new_context();
    let tree = ctx.new_tree(TreeKind::Primary);
    let tx = ctx.engine.begin_transaction();

    // about 15 records per leaf and 16 children per branch
    let large_key = |i: u32| format!("{:0>1000}", i).into_bytes();
    for i in shuffled(0..2000) {
        tree.insert(&ctx.engine, &tx, &large_key(i), &i.to_le_bytes()).unwrap();
    }
    ctx.engine.commit_transaction(&tx);

    let report = tree.check_integrity(&ctx.engine).unwrap();
    assert_eq!(2000, report.entries);
    assert!(report.depth >= 2, "{:?}", report);

    for i in (0..2000u32).step_by(7) {
        assert_eq!(
            Some(i.to_le_bytes().to_vec()),
            tree.get(&ctx.engine, &large_key(i)).unwrap()
        );
    }
}

#[test]
fn test_duplicate_key() {
    setup();
    let ctx = new_context();
    let tree = ctx.new_tree(TreeKind::Primary);
    insert_committed(&ctx.engine, &tree, 0..500);

    let tx = ctx.engine.begin_transaction();
    for i in &[0, 250, 499] {
        let err = tree.insert(&ctx.engine, &tx, &key(*i), b"other").unwrap_err();
        assert_eq!(ErrorKind::Duplicate, err.kind());
    }
    ctx.engine.commit_transaction(&tx);

    let expected: Vec<u32> = (0..500).collect();
    assert_tree_content(&ctx.engine, &tree, &expected);
}

#[test]
fn test_record_too_large() {
    setup();
    let ctx = new_context();
    let tree = ctx.new_tree(TreeKind::Primary);
    let tx = ctx.engine.begin_transaction();

    let err = tree.insert(&ctx.engine, &tx, &[7; 1025], b"v").unwrap_err();
    assert_eq!(ErrorKind::RecordTooLarge, err.kind());

    let err = tree
        .insert(&ctx.engine, &tx, b"k", &vec![0; MAX_RECORD_SIZE])
        .unwrap_err();
    assert_eq!(ErrorKind::RecordTooLarge, err.kind());

    // records at the limit still split cleanly, a few per page
    for i in 0..40 {
        tree.insert(&ctx.engine, &tx, &key(i), &vec![i as u8; MAX_RECORD_SIZE - 4])
            .unwrap();
    }
    ctx.engine.commit_transaction(&tx);

    let report = tree.check_integrity(&ctx.engine).unwrap();
    assert_eq!(40, report.entries);
    assert!(report.leaves >= 10, "{:?}", report);
    assert_eq!(
        Some(vec![39; MAX_RECORD_SIZE - 4]),
        tree.get(&ctx.engine, &key(39)).unwrap()
    );
}

#[test]
fn test_version_header() {
    setup();
    let ctx = new_context();
    let primary = ctx.new_tree(TreeKind::Primary);
    let secondary = ctx.new_tree(TreeKind::Secondary);

    let tx = ctx.engine.begin_transaction();
    insert_keys(&ctx.engine, &primary, &tx, 0..1);
    insert_keys(&ctx.engine, &secondary, &tx, 0..1);
    ctx.engine.commit_transaction(&tx);

    let pool = ctx.engine.pool();
    let latch = pool.fetch(&primary.root().position()).unwrap().latch_read();
    assert_eq!(
        Some((tx.get_id() as i64, 0)),
        TreePage::new(latch.page()).version(0).unwrap()
    );
    drop(latch);

    let latch = pool.fetch(&secondary.root().position()).unwrap().latch_read();
    assert_eq!(None, TreePage::new(latch.page()).version(0).unwrap());
}

#[test]
fn test_insert_is_logged() {
    setup();
    let ctx = new_context();
    let tree = ctx.new_tree(TreeKind::Primary);

    insert_committed(&ctx.engine, &tree, 0..1);
    let records = ctx.sink.records().unwrap();
    match records.last() {
        Some(LogRecord::LeafInsert { pos, key: k, .. }) => {
            assert_eq!(tree.root().position(), *pos);
            assert_eq!(key(0), *k);
        }
        other => panic!("unexpected last record {:?}", other),
    }
    assert_eq!(records.len(), ctx.sink.records_count());
    assert_eq!(
        Some(tree.root().position()),
        records.last().and_then(|r| r.position())
    );
    assert!(ctx.sink.size() > 0);

    // the page carries the lsn of its last change
    let latch = ctx
        .engine
        .pool()
        .fetch(&tree.root().position())
        .unwrap()
        .latch_read();
    assert_eq!(ctx.sink.last_lsn(), latch.page().lsn().unwrap());
    drop(latch);

    // the first split is one multi-page operation
    let before = records.len();
    insert_committed(&ctx.engine, &tree, 1..200);
    let records = ctx.sink.records().unwrap();
    let records = &records[before..];

    let begin = records
        .iter()
        .position(|r| matches!(r, LogRecord::BeginMulti))
        .unwrap();
    let end = records
        .iter()
        .position(|r| matches!(r, LogRecord::EndMulti))
        .unwrap();
    assert!(begin < end);

    let split = &records[begin..end];
    assert!(split.iter().any(|r| matches!(r, LogRecord::RootSplit { .. })));
    assert!(split.iter().any(|r| matches!(r, LogRecord::PageCreated { .. })));
    assert!(split.iter().any(|r| matches!(r, LogRecord::CopyEntries { .. })));
    assert!(split.iter().any(|r| matches!(r, LogRecord::BranchInsert { .. })));
    assert!(split.iter().any(|r| matches!(r, LogRecord::LeafInsert { .. })));
}

fn reverse_compare(a: &[u8], b: &[u8]) -> Ordering {
    b.cmp(a)
}

#[test]
fn test_custom_comparator() {
    setup();
    let ctx = new_context();
    let tree = ctx
        .new_tree(TreeKind::Secondary)
        .with_comparator(reverse_compare);

    insert_committed(&ctx.engine, &tree, shuffled(0..800));
    let report = tree.check_integrity(&ctx.engine).unwrap();
    assert_eq!(800, report.entries);

    let keys: Vec<Vec<u8>> = tree
        .entries(&ctx.engine)
        .unwrap()
        .into_iter()
        .map(|(k, _)| k)
        .collect();
    let expected: Vec<Vec<u8>> = (0..800).rev().map(key).collect();
    assert_eq!(expected, keys);
}
