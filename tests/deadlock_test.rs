mod test_utils;

use std::{
    sync::atomic::{AtomicUsize, Ordering},
    thread,
    time::Duration,
};

use small_store::{
    lock::{LockManager, LockMode, LockRequest, LockStatus},
    storage::PagePosition,
    transaction::TransactionState,
    ErrorKind, TreeKind,
};
use test_utils::{insert_committed, key, new_context, setup};

fn record(index: usize) -> LockRequest {
    LockRequest::document(1, PagePosition::new(1, 3), index, 8, LockMode::Exclusive)
}

#[test]
fn test_detect_cycle() {
    setup();
    let ctx = new_context();
    let manager = LockManager::new();
    let a = ctx.engine.begin_transaction();
    let b = ctx.engine.begin_transaction();

    assert_eq!(LockStatus::Success, manager.lock(&a, &record(1)).unwrap());
    assert_eq!(LockStatus::Success, manager.lock(&b, &record(2)).unwrap());
    assert_eq!(LockStatus::WaitLock, manager.lock(&a, &record(2)).unwrap());

    // b waiting on a would close the cycle, nothing is queued
    assert_eq!(LockStatus::DeadLock, manager.lock(&b, &record(1)).unwrap());
    assert_eq!(TransactionState::Running, b.state());
    assert_eq!(TransactionState::Waiting, a.state());

    // the victim aborts, which unblocks the survivor
    manager.release_all(&b);
    assert_eq!(TransactionState::Running, a.state());
    assert!(a.is_signaled());
    assert_eq!(LockStatus::Success, manager.lock(&a, &record(2)).unwrap());
}

#[test]
fn test_longer_cycle() {
    setup();
    let ctx = new_context();
    let manager = LockManager::new();
    let txs: Vec<_> = (0..4).map(|_| ctx.engine.begin_transaction()).collect();

    for (i, tx) in txs.iter().enumerate() {
        assert_eq!(LockStatus::Success, manager.lock(tx, &record(i)).unwrap());
    }
    for i in 0..3 {
        assert_eq!(
            LockStatus::WaitLock,
            manager.lock(&txs[i], &record(i + 1)).unwrap()
        );
    }
    assert_eq!(
        LockStatus::DeadLock,
        manager.lock(&txs[3], &record(0)).unwrap()
    );
}

#[test]
fn test_exactly_one_victim() {
    setup();
    let ctx = new_context();
    let manager = LockManager::new();
    let a = ctx.engine.begin_transaction();
    let b = ctx.engine.begin_transaction();
    manager.lock(&a, &record(1)).unwrap();
    manager.lock(&b, &record(2)).unwrap();

    let jobs = [(&a, 2), (&b, 1)];
    let victims = AtomicUsize::new(0);
    crossbeam::scope(|s| {
        for &(tx, wanted) in jobs.iter() {
            let manager = &manager;
            let victims = &victims;
            s.spawn(move |_| match manager.lock_blocking(tx, &record(wanted)) {
                Ok(()) => manager.release_all(tx),
                Err(e) => {
                    assert!(e.is_deadlock());
                    victims.fetch_add(1, Ordering::SeqCst);
                    manager.release_all(tx);
                }
            });
        }
    })
    .unwrap();

    assert_eq!(1, victims.load(Ordering::SeqCst));
    assert_eq!(0, manager.entries_count());
}

#[test]
fn test_tree_deadlock() {
    setup();
    let ctx = new_context();
    let tree = ctx.new_tree(TreeKind::Primary);
    insert_committed(&ctx.engine, &tree, 0..500);

    // each transaction owns a fresh record and goes after the other one
    let a = ctx.engine.begin_transaction();
    let b = ctx.engine.begin_transaction();
    tree.insert(&ctx.engine, &a, &key(1000), b"a").unwrap();
    tree.insert(&ctx.engine, &b, &key(2000), b"b").unwrap();

    let jobs = [(&a, 2000), (&b, 1000)];
    let victims = AtomicUsize::new(0);
    let deleted = AtomicUsize::new(0);
    crossbeam::scope(|s| {
        for (i, &(tx, wanted)) in jobs.iter().enumerate() {
            let (engine, tree) = (&ctx.engine, &tree);
            let (victims, deleted) = (&victims, &deleted);
            s.spawn(move |_| {
                // let the first transaction block before the second one
                // closes the cycle
                thread::sleep(Duration::from_millis(100 * i as u64));
                match tree.delete(engine, tx, &key(wanted)) {
                    Ok(found) => {
                        assert!(found);
                        deleted.fetch_add(1, Ordering::SeqCst);
                        engine.commit_transaction(tx);
                    }
                    Err(e) => {
                        assert_eq!(ErrorKind::DeadLock, e.kind());
                        victims.fetch_add(1, Ordering::SeqCst);
                        engine.abort_transaction(tx);
                    }
                }
            });
        }
    })
    .unwrap();

    assert_eq!(1, victims.load(Ordering::SeqCst));
    assert_eq!(1, deleted.load(Ordering::SeqCst));
    let report = tree.check_integrity(&ctx.engine).unwrap();
    assert_eq!(501, report.entries);
    assert_eq!(0, ctx.engine.lock_manager().entries_count());
}
