mod test_utils;

use small_store::TreeKind;
use test_utils::{insert_committed, key, key_of, new_context, setup, shuffled, value};

#[test]
fn test_cursor_from_key() {
    setup();
    let ctx = new_context();
    let tree = ctx.new_tree(TreeKind::Primary);

    // even keys only
    insert_committed(&ctx.engine, &tree, (0..2000).map(|i| i * 2));

    let entries: Vec<(Vec<u8>, Vec<u8>)> = tree
        .cursor(&ctx.engine, &key(1001))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    let keys: Vec<u32> = entries.iter().map(|(k, _)| key_of(k)).collect();
    let expected: Vec<u32> = (501..2000).map(|i| i * 2).collect();
    assert_eq!(expected, keys);
    for (k, v) in &entries {
        assert_eq!(&value(key_of(k)), v);
    }

    // an existing key is included
    let first = tree.cursor(&ctx.engine, &key(1002)).unwrap().next();
    assert_eq!(key(1002), first.unwrap().unwrap().0);
}

#[test]
fn test_cursor_past_the_end() {
    setup();
    let ctx = new_context();
    let tree = ctx.new_tree(TreeKind::Secondary);
    insert_committed(&ctx.engine, &tree, 0..500);

    assert_eq!(0, tree.cursor(&ctx.engine, &key(500)).unwrap().count());
    assert_eq!(500, tree.cursor(&ctx.engine, &[]).unwrap().count());
}

#[test]
fn test_cursor_first_orders_keys() {
    setup();
    let ctx = new_context();
    let tree = ctx.new_tree(TreeKind::Primary);
    insert_committed(&ctx.engine, &tree, shuffled(0..2500));

    let mut expected = 0;
    for entry in tree.cursor_first(&ctx.engine).unwrap() {
        let (k, v) = entry.unwrap();
        assert_eq!(expected, key_of(&k));
        assert_eq!(value(expected), v);
        expected += 1;
    }
    assert_eq!(2500, expected);
}

#[test]
fn test_scan_empty_tree() {
    setup();
    let ctx = new_context();
    let tree = ctx.new_tree(TreeKind::Primary);

    assert!(tree.entries(&ctx.engine).unwrap().is_empty());
    assert!(tree.cursor(&ctx.engine, &key(3)).unwrap().next().is_none());
}

#[test]
fn test_scan_after_deletes() {
    setup();
    let ctx = new_context();
    let tree = ctx.new_tree(TreeKind::Primary);
    insert_committed(&ctx.engine, &tree, 0..1000);

    // empties whole leaves in the middle of the chain
    let tx = ctx.engine.begin_transaction();
    for i in 200..800 {
        assert!(tree.delete(&ctx.engine, &tx, &key(i)).unwrap());
    }
    ctx.engine.commit_transaction(&tx);

    let keys: Vec<u32> = tree
        .cursor(&ctx.engine, &key(150))
        .unwrap()
        .map(|entry| key_of(&entry.unwrap().0))
        .collect();
    let expected: Vec<u32> = (150..200).chain(800..1000).collect();
    assert_eq!(expected, keys);
}
