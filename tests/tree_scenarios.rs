//! End-to-end tree scenarios: bulk load, churn, structural invariants, and
//! a randomized comparison against an in-memory model.

use std::collections::BTreeMap;

use proptest::prelude::*;

use burrowdb::btree::{
    apply_keyvalue_change, find_keyvalue_location_for_write, get, scan, tree_depth, DeleteMode,
    InternalNode, LeafNode, NodeHeader, NodeType, NoopDeleter, NoopModificationCallback,
};
use burrowdb::buffer::{population, AccessMode, BlockId, BufCache, Superblock, NULL_BLOCK_ID};
use burrowdb::Recency;

const BLOCK: usize = 512;

fn setup() -> (BufCache, burrowdb::btree::MaxBlockSizer) {
    let cache = BufCache::new(BLOCK).expect("cache");
    Superblock::create(&cache).expect("superblock");
    (cache, burrowdb::btree::MaxBlockSizer::new(BLOCK, 200))
}

fn put(
    cache: &BufCache,
    sizer: &burrowdb::btree::MaxBlockSizer,
    key: &[u8],
    value: &[u8],
    ts: u64,
) {
    let loc =
        find_keyvalue_location_for_write(cache, sizer, &mut NoopDeleter, key, Recency(ts), None)
            .expect("descent");
    apply_keyvalue_change(
        cache,
        sizer,
        &mut NoopDeleter,
        &mut NoopModificationCallback,
        loc,
        Some(value),
        Recency(ts),
        DeleteMode::RegularQuery,
    )
    .expect("apply");
}

fn remove(
    cache: &BufCache,
    sizer: &burrowdb::btree::MaxBlockSizer,
    key: &[u8],
    ts: u64,
    mode: DeleteMode,
) {
    let loc =
        find_keyvalue_location_for_write(cache, sizer, &mut NoopDeleter, key, Recency(ts), None)
            .expect("descent");
    apply_keyvalue_change(
        cache,
        sizer,
        &mut NoopDeleter,
        &mut NoopModificationCallback,
        loc,
        None,
        Recency(ts),
        mode,
    )
    .expect("apply");
}

fn key_of(i: u64) -> Vec<u8> {
    format!("key{:05}", i).into_bytes()
}

/// Walks the whole tree checking, per node: keys are strictly sorted, every
/// key sits inside the (exclusive-lower, inclusive-upper] range its
/// separators promise, and recency dominates everything beneath.
fn check_invariants(cache: &BufCache) {
    let sb = Superblock::acquire_read(cache).expect("superblock");
    let root = sb.root();
    drop(sb);
    if root != NULL_BLOCK_ID {
        check_node(cache, root, None, None, None);
    }
}

fn check_node(
    cache: &BufCache,
    id: BlockId,
    lower: Option<&[u8]>,
    upper: Option<&[u8]>,
    parent_recency: Option<Recency>,
) {
    let lock = cache.acquire(id, AccessMode::Read).expect("node lock");
    let header = NodeHeader::from_bytes(lock.data()).expect("header");
    let recency = header.node_recency();
    if let Some(parent) = parent_recency {
        assert!(
            parent >= recency,
            "block {}: recency {:?} exceeds its parent's {:?}",
            id,
            recency,
            parent
        );
    }

    let in_range = |key: &[u8]| {
        if let Some(lo) = lower {
            assert!(key > lo, "block {}: key below its subtree range", id);
        }
        if let Some(hi) = upper {
            assert!(key <= hi, "block {}: key above its subtree range", id);
        }
    };

    match header.node_type() {
        NodeType::Leaf => {
            let view = LeafNode::from_block(lock.data()).expect("leaf view");
            let mut previous: Option<Vec<u8>> = None;
            for i in 0..view.entry_count() as usize {
                let key = view.key_at(i).expect("key");
                in_range(key);
                if let Some(prev) = &previous {
                    assert!(key > prev.as_slice(), "block {}: keys out of order", id);
                }
                let ts = view.timestamp_at(i).expect("timestamp");
                assert!(
                    recency >= ts,
                    "block {}: entry timestamp {:?} exceeds node recency {:?}",
                    id,
                    ts,
                    recency
                );
                previous = Some(key.to_vec());
            }
        }
        NodeType::Internal => {
            let view = InternalNode::from_block(lock.data()).expect("internal view");
            let count = view.entry_count() as usize;
            assert!(count > 0 || view.right_child() != NULL_BLOCK_ID);
            // only the root may sit with zero separators (a single child,
            // pending collapse on the next write descent)
            if parent_recency.is_some() {
                assert!(count >= 1, "block {}: non-root internal node with no separators", id);
            }
            let mut child_lower = lower.map(|l| l.to_vec());
            for i in 0..count {
                let separator = view.key_at(i).expect("separator").to_vec();
                in_range(&separator);
                if let Some(lo) = &child_lower {
                    if i > 0 {
                        assert!(
                            separator.as_slice() > lo.as_slice(),
                            "block {}: separators out of order",
                            id
                        );
                    }
                }
                let child = view.child_at(i).expect("child");
                check_node(
                    cache,
                    child,
                    child_lower.as_deref(),
                    Some(&separator),
                    Some(recency),
                );
                child_lower = Some(separator);
            }
            check_node(
                cache,
                view.right_child(),
                child_lower.as_deref(),
                upper,
                Some(recency),
            );
        }
        NodeType::Unknown => panic!("walker hit unformatted block {}", id),
    }
}

#[test]
fn thousand_keys_build_a_deep_ordered_tree() {
    let (cache, sizer) = setup();
    let value = vec![0xA5u8; 32];
    for i in 0..1000u64 {
        put(&cache, &sizer, &key_of(i), &value, i + 1);
    }

    let depth = tree_depth(&cache).expect("depth");
    assert!(depth >= 3, "1000 keys in 512-byte blocks, got depth {depth}");
    assert!(depth <= 8, "tree unexpectedly deep: {depth}");

    let entries = scan(&cache).expect("scan");
    assert_eq!(entries.len(), 1000);
    for (i, (key, _)) in entries.iter().enumerate() {
        assert_eq!(key, &key_of(i as u64));
    }

    let sb = Superblock::acquire_read(&cache).expect("superblock");
    let stat = sb.stat_block();
    drop(sb);
    assert_eq!(population(&cache, stat).expect("population"), 1000);

    check_invariants(&cache);
}

#[test]
fn churn_shrinks_the_tree_back_down() {
    let (cache, sizer) = setup();
    let value = vec![0x3Cu8; 32];
    for i in 0..1000u64 {
        put(&cache, &sizer, &key_of(i), &value, i + 1);
    }
    let grown_depth = tree_depth(&cache).expect("depth");

    for i in 0..900u64 {
        remove(&cache, &sizer, &key_of(i), 2000 + i, DeleteMode::Erase);
    }

    let entries = scan(&cache).expect("scan");
    assert_eq!(entries.len(), 100);
    assert_eq!(entries[0].0, key_of(900));
    assert_eq!(entries[99].0, key_of(999));

    let shrunk_depth = tree_depth(&cache).expect("depth");
    assert!(
        shrunk_depth < grown_depth,
        "depth {grown_depth} -> {shrunk_depth} after erasing 90% of the keys"
    );

    let sb = Superblock::acquire_read(&cache).expect("superblock");
    let stat = sb.stat_block();
    drop(sb);
    assert_eq!(population(&cache, stat).expect("population"), 100);

    check_invariants(&cache);
}

#[test]
fn deleting_everything_empties_the_tree() {
    let (cache, sizer) = setup();
    let value = vec![0x11u8; 32];
    for i in 0..300u64 {
        put(&cache, &sizer, &key_of(i), &value, i + 1);
    }
    for i in 0..300u64 {
        remove(&cache, &sizer, &key_of(i), 1000 + i, DeleteMode::Erase);
    }

    assert_eq!(tree_depth(&cache).expect("depth"), 0);
    assert!(scan(&cache).expect("scan").is_empty());

    // and the tree comes back after re-insertion
    put(&cache, &sizer, b"reborn", b"value", 5000);
    assert_eq!(get(&cache, b"reborn").expect("get"), Some(b"value".to_vec()));
    check_invariants(&cache);
}

#[test]
fn stale_timestamps_never_lower_recency() {
    let (cache, sizer) = setup();
    let value = vec![0x77u8; 32];
    for i in 0..200u64 {
        put(&cache, &sizer, &key_of(i), &value, 1000 + i);
    }

    // a write carrying an old timestamp still lands, but the node recency
    // keeps the superseding value
    put(&cache, &sizer, &key_of(0), b"old-clock", 3);
    assert_eq!(get(&cache, &key_of(0)).expect("get"), Some(b"old-clock".to_vec()));

    let sb = Superblock::acquire_read(&cache).expect("superblock");
    let root = cache.acquire(sb.root(), AccessMode::Read).expect("root");
    let header = NodeHeader::from_bytes(root.data()).expect("header");
    assert!(header.node_recency() >= Recency(1199));

    drop(root);
    drop(sb);
    check_invariants(&cache);
}

#[test]
fn tombstones_survive_splits_and_merges() {
    let (cache, sizer) = setup();
    let value = vec![0x42u8; 32];
    for i in 0..400u64 {
        put(&cache, &sizer, &key_of(i), &value, i + 1);
    }
    for i in (0..400u64).step_by(2) {
        remove(&cache, &sizer, &key_of(i), 1000 + i, DeleteMode::RegularQuery);
    }
    // churn around the tombstones to force rebalancing
    for i in 400..600u64 {
        put(&cache, &sizer, &key_of(i), &value, 2000 + i);
    }

    for i in (0..400u64).step_by(2) {
        assert_eq!(get(&cache, &key_of(i)).expect("get"), None);
    }
    for i in (1..400u64).step_by(2) {
        assert_eq!(get(&cache, &key_of(i)).expect("get"), Some(value.clone()));
    }
    assert_eq!(scan(&cache).expect("scan").len(), 400);
    check_invariants(&cache);
}

#[derive(Debug, Clone)]
enum Op {
    Insert(u8, u8),
    Delete(u8),
    Erase(u8),
    Backfill(u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u8..48, 1u8..60).prop_map(|(k, len)| Op::Insert(k, len)),
        2 => (0u8..48).prop_map(Op::Delete),
        1 => (0u8..48).prop_map(Op::Erase),
        1 => (0u8..48).prop_map(Op::Backfill),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn random_ops_match_an_in_memory_model(ops in proptest::collection::vec(op_strategy(), 1..250)) {
        let (cache, sizer) = setup();
        let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        let mut clock = 0u64;

        for op in &ops {
            clock += 1;
            match *op {
                Op::Insert(k, len) => {
                    let key = key_of(k as u64);
                    let value = vec![k; len as usize];
                    put(&cache, &sizer, &key, &value, clock);
                    model.insert(key, value);
                }
                Op::Delete(k) => {
                    let key = key_of(k as u64);
                    remove(&cache, &sizer, &key, clock, DeleteMode::RegularQuery);
                    model.remove(&key);
                }
                Op::Erase(k) => {
                    let key = key_of(k as u64);
                    remove(&cache, &sizer, &key, clock, DeleteMode::Erase);
                    model.remove(&key);
                }
                Op::Backfill(k) => {
                    let key = key_of(k as u64);
                    remove(&cache, &sizer, &key, clock, DeleteMode::MakeTombstone);
                    model.remove(&key);
                }
            }
        }

        let entries = scan(&cache).expect("scan");
        let expected: Vec<_> = model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        prop_assert_eq!(entries, expected);

        for k in 0u64..48 {
            let key = key_of(k);
            prop_assert_eq!(get(&cache, &key).expect("get"), model.get(&key).cloned());
        }

        let sb = Superblock::acquire_read(&cache).expect("superblock");
        let stat = sb.stat_block();
        drop(sb);
        prop_assert_eq!(
            population(&cache, stat).expect("population"),
            model.len() as i64
        );

        check_invariants(&cache);
    }
}
