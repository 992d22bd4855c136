mod test_utils;

use small_store::{storage::PagePosition, ErrorKind};
use test_utils::{new_context, setup, FILE_ID};

fn element(i: i64) -> Vec<u8> {
    i.to_le_bytes().to_vec()
}

#[test]
fn test_upsert() {
    setup();
    let ctx = new_context();
    let tree = ctx.new_fixed_tree(8);

    let mut llt = ctx.engine.llt();
    assert!(tree.insert(&ctx.engine, &mut llt, 7, &element(1)).unwrap());
    assert!(tree.insert(&ctx.engine, &mut llt, -3, &element(2)).unwrap());
    llt.commit().unwrap();

    let mut llt = ctx.engine.llt();
    assert!(!tree.insert(&ctx.engine, &mut llt, 7, &element(3)).unwrap());
    llt.commit().unwrap();

    assert_eq!(Some(element(3)), tree.get(&ctx.engine, 7).unwrap());
    assert_eq!(Some(element(2)), tree.get(&ctx.engine, -3).unwrap());
    assert_eq!(None, tree.get(&ctx.engine, 8).unwrap());
    assert_eq!(vec![-3, 7], tree.keys(&ctx.engine).unwrap());
}

#[test]
fn test_element_size() {
    setup();
    let ctx = new_context();
    let tree = ctx.new_fixed_tree(8);

    let mut llt = ctx.engine.llt();
    let err = tree.insert(&ctx.engine, &mut llt, 1, &[0; 9]).unwrap_err();
    assert_eq!(ErrorKind::RecordTooLarge, err.kind());
    llt.rollback();

    let mut llt = ctx.engine.llt();
    let err = small_store::FixedSizeTree::create(&ctx.engine, &mut llt, FILE_ID, 2000).unwrap_err();
    assert_eq!(ErrorKind::RecordTooLarge, err.kind());
    llt.rollback();
}

#[test]
fn test_splits() {
    setup();
    let ctx = new_context();
    let tree = ctx.new_fixed_tree(8);

    let mut keys: Vec<i64> = (0..6000).map(|i| i * 3 - 9000).collect();
    let mut shuffled = keys.clone();
    rand::seq::SliceRandom::shuffle(&mut shuffled[..], &mut rand::thread_rng());

    for chunk in shuffled.chunks(100) {
        let mut llt = ctx.engine.llt();
        for &k in chunk {
            assert!(tree.insert(&ctx.engine, &mut llt, k, &element(k * 2)).unwrap());
        }
        llt.commit().unwrap();
    }

    let report = tree.check_integrity(&ctx.engine).unwrap();
    assert_eq!(6000, report.entries);
    assert!(report.depth >= 1, "{:?}", report);
    assert!(report.leaves >= 6, "{:?}", report);

    keys.sort_unstable();
    assert_eq!(keys, tree.keys(&ctx.engine).unwrap());
    for &k in keys.iter().step_by(11) {
        assert_eq!(Some(element(k * 2)), tree.get(&ctx.engine, k).unwrap());
    }
}

#[test]
fn test_sequential_splits() {
    setup();
    let ctx = new_context();
    let tree = ctx.new_fixed_tree(0);

    let mut llt = ctx.engine.llt();
    for k in 0..20_000 {
        tree.insert(&ctx.engine, &mut llt, k, &[]).unwrap();
    }
    llt.commit().unwrap();

    let report = tree.check_integrity(&ctx.engine).unwrap();
    assert_eq!(20_000, report.entries);
    assert_eq!(20_000, tree.len(&ctx.engine).unwrap());
}

#[test]
fn test_delete_and_pop_first() {
    setup();
    let ctx = new_context();
    let tree = ctx.new_fixed_tree(8);

    let mut llt = ctx.engine.llt();
    for k in 0..3000 {
        tree.insert(&ctx.engine, &mut llt, k, &element(k)).unwrap();
    }
    llt.commit().unwrap();

    // empty the first leaves entirely
    let mut llt = ctx.engine.llt();
    for k in 0..2000 {
        assert!(tree.delete(&mut llt, k).unwrap());
    }
    assert!(!tree.delete(&mut llt, 0).unwrap());
    llt.commit().unwrap();
    tree.check_integrity(&ctx.engine).unwrap();

    for expected in 2000..3000 {
        let mut llt = ctx.engine.llt();
        let (k, v) = tree.pop_first(&mut llt).unwrap().unwrap();
        llt.commit().unwrap();
        assert_eq!(expected, k);
        assert_eq!(element(expected), v);
    }

    let mut llt = ctx.engine.llt();
    assert_eq!(None, tree.pop_first(&mut llt).unwrap());
    llt.rollback();
    assert!(tree.is_empty(&ctx.engine).unwrap());
    tree.check_integrity(&ctx.engine).unwrap();
}

#[test]
fn test_free_page_map() {
    setup();
    let ctx = new_context();
    let engine = &ctx.engine;

    let pages: Vec<PagePosition> = (0..5).map(|_| engine.allocate_page(FILE_ID).unwrap()).collect();
    let numbers: Vec<i64> = pages.iter().map(|p| p.page_number).collect();
    assert_eq!(vec![1, 2, 3, 4, 5], numbers);
    assert_eq!(6, engine.file_length(FILE_ID).unwrap());

    engine.free_page(&pages[3]).unwrap();
    engine.free_page(&pages[1]).unwrap();
    assert_eq!(vec![2, 4], engine.free_pages(FILE_ID).unwrap());

    let err = engine.free_page(&pages[1]).unwrap_err();
    assert_eq!(ErrorKind::StructuralCorruption, err.kind());
    assert!(err.details().contains("freed twice"), "{}", err);

    // smallest free page first, then the file grows again
    assert_eq!(2, engine.allocate_page(FILE_ID).unwrap().page_number);
    assert_eq!(4, engine.allocate_page(FILE_ID).unwrap().page_number);
    assert_eq!(6, engine.allocate_page(FILE_ID).unwrap().page_number);
    assert!(engine.free_pages(FILE_ID).unwrap().is_empty());
}

#[test]
fn test_file_lifecycle() {
    setup();
    let ctx = new_context();
    let engine = &ctx.engine;

    let err = engine.create_file(FILE_ID).unwrap_err();
    assert_eq!(ErrorKind::Duplicate, err.kind());

    let err = engine.allocate_page(42).unwrap_err();
    assert_eq!(ErrorKind::NotFound, err.kind());

    // a file unknown to the store is created on open
    engine.open_file(2).unwrap();
    assert_eq!(1, engine.file_length(2).unwrap());
    assert_eq!(1, engine.allocate_page(2).unwrap().page_number);
}
