mod test_utils;

use std::collections::BTreeSet;

use crossbeam::channel::unbounded;
use small_store::{storage::PagePosition, TreeKind};
use test_utils::{
    assert_tree_content, insert_committed, key, key_of, new_context, setup, value, FILE_ID,
};

#[test]
fn test_concurrent_inserts() {
    setup();
    let ctx = new_context();
    let tree = ctx.new_tree(TreeKind::Primary);
    let workers = 4;

    crossbeam::scope(|s| {
        for t in 0..workers {
            let (ctx, tree) = (&ctx, &tree);
            s.spawn(move |_| {
                let keys = (0..1000).map(|i| i * workers + t);
                insert_committed(&ctx.engine, tree, keys);
            });
        }
    })
    .unwrap();

    let expected: Vec<u32> = (0..1000 * workers).collect();
    assert_tree_content(&ctx.engine, &tree, &expected);
    assert_eq!(0, ctx.engine.lock_manager().entries_count());
}

#[test]
fn test_mixed_workload() {
    setup();
    let ctx = new_context();
    let tree = ctx.new_tree(TreeKind::Primary);
    insert_committed(&ctx.engine, &tree, 0..2000);

    let (sender, receiver) = unbounded();
    crossbeam::scope(|s| {
        // deleters, one residue class each
        for class in 0..2 {
            let (ctx, tree) = (&ctx, &tree);
            s.spawn(move |_| {
                let tx = ctx.engine.begin_transaction();
                for i in (0..2000).filter(|i| i % 4 == class) {
                    assert!(tree.delete(&ctx.engine, &tx, &key(i)).unwrap());
                }
                ctx.engine.commit_transaction(&tx);
            });
        }

        {
            let (ctx, tree) = (&ctx, &tree);
            s.spawn(move |_| insert_committed(&ctx.engine, tree, 2000..4000));
        }

        // readers see ordered keys whatever the writers do
        for _ in 0..2 {
            let (ctx, tree, sender) = (&ctx, &tree, sender.clone());
            s.spawn(move |_| {
                for _ in 0..20 {
                    let keys: Vec<u32> = tree
                        .cursor_first(&ctx.engine)
                        .unwrap()
                        .map(|entry| {
                            let (k, v) = entry.unwrap();
                            assert_eq!(value(key_of(&k)), v);
                            key_of(&k)
                        })
                        .collect();
                    assert!(keys.windows(2).all(|w| w[0] < w[1]));
                    sender.send(keys.len()).unwrap();
                }
            });
        }
    })
    .unwrap();
    drop(sender);

    assert_eq!(40, receiver.iter().count());
    let expected: Vec<u32> = (0..2000)
        .filter(|i| i % 4 >= 2)
        .chain(2000..4000)
        .collect();
    assert_tree_content(&ctx.engine, &tree, &expected);
}

#[test]
fn test_trees_sharing_a_file() {
    setup();
    let ctx = new_context();
    let trees = [
        ctx.new_tree(TreeKind::Primary),
        ctx.new_tree(TreeKind::Secondary),
    ];

    // pages freed by one tree get picked up by the other
    crossbeam::scope(|s| {
        for tree in trees.iter() {
            let ctx = &ctx;
            s.spawn(move |_| {
                for round in 0..3 {
                    insert_committed(&ctx.engine, tree, 0..1500);
                    if round < 2 {
                        let tx = ctx.engine.begin_transaction();
                        for i in 0..1500 {
                            assert!(tree.delete(&ctx.engine, &tx, &key(i)).unwrap());
                        }
                        ctx.engine.commit_transaction(&tx);
                    }
                }
            });
        }
    })
    .unwrap();

    let expected: Vec<u32> = (0..1500).collect();
    for tree in trees.iter() {
        assert_tree_content(&ctx.engine, tree, &expected);
    }
}

#[test]
fn test_concurrent_page_allocation() {
    setup();
    let ctx = new_context();
    let engine = &ctx.engine;

    let (sender, receiver) = unbounded();
    crossbeam::scope(|s| {
        for _ in 0..4 {
            let sender = sender.clone();
            s.spawn(move |_| {
                for _ in 0..50 {
                    sender.send(engine.allocate_page(FILE_ID).unwrap()).unwrap();
                }
            });
        }
    })
    .unwrap();
    drop(sender);

    let pages: Vec<PagePosition> = receiver.iter().collect();
    let distinct: BTreeSet<i64> = pages.iter().map(|p| p.page_number).collect();
    assert_eq!(200, distinct.len());
    assert_eq!(201, engine.file_length(FILE_ID).unwrap());

    crossbeam::scope(|s| {
        for chunk in pages.chunks(50) {
            s.spawn(move |_| {
                for pos in chunk {
                    engine.free_page(pos).unwrap();
                }
            });
        }
    })
    .unwrap();

    let free: Vec<i64> = distinct.into_iter().collect();
    assert_eq!(free, engine.free_pages(FILE_ID).unwrap());
}

#[test]
fn test_concurrent_fixed_tree() {
    setup();
    let ctx = new_context();
    let tree = ctx.new_fixed_tree(8);

    crossbeam::scope(|s| {
        for t in 0..4i64 {
            let (ctx, tree) = (&ctx, &tree);
            s.spawn(move |_| {
                for i in 0..2000i64 {
                    let k = i * 4 + t;
                    let mut llt = ctx.engine.llt();
                    assert!(tree.insert(&ctx.engine, &mut llt, k, &k.to_le_bytes()).unwrap());
                    llt.commit().unwrap();
                    assert_eq!(Some(k.to_le_bytes().to_vec()), tree.get(&ctx.engine, k).unwrap());
                }
            });
        }
    })
    .unwrap();

    let report = tree.check_integrity(&ctx.engine).unwrap();
    assert_eq!(8000, report.entries);
    let expected: Vec<i64> = (0..8000).collect();
    assert_eq!(expected, tree.keys(&ctx.engine).unwrap());
}
