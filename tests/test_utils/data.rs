use std::sync::Arc;

use rand::prelude::*;
use small_store::{StorageEngine, Transaction, Tree};

pub const VALUE_SIZE: usize = 128;

/// Big-endian so byte order matches numeric order.
pub fn key(i: u32) -> Vec<u8> {
    i.to_be_bytes().to_vec()
}

pub fn key_of(bytes: &[u8]) -> u32 {
    let mut buf = [0; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_be_bytes(buf)
}

/// A value tied to its key, so misplaced values show up.
pub fn value(i: u32) -> Vec<u8> {
    let mut v = vec![(i % 251) as u8; VALUE_SIZE];
    v[..4].copy_from_slice(&i.to_le_bytes());
    v
}

pub fn shuffled(range: std::ops::Range<u32>) -> Vec<u32> {
    let mut keys: Vec<u32> = range.collect();
    keys.shuffle(&mut thread_rng());
    keys
}

pub fn insert_keys<I: IntoIterator<Item = u32>>(
    engine: &StorageEngine,
    tree: &Tree,
    tx: &Arc<Transaction>,
    keys: I,
) {
    for i in keys {
        tree.insert(engine, tx, &key(i), &value(i)).unwrap();
    }
}

/// Insert `keys` in a transaction of their own, committed before
/// returning.
pub fn insert_committed<I: IntoIterator<Item = u32>>(engine: &StorageEngine, tree: &Tree, keys: I) {
    let tx = engine.begin_transaction();
    insert_keys(engine, tree, &tx, keys);
    engine.commit_transaction(&tx);
}
