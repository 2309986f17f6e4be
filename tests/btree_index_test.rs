use std::sync::Arc;
use std::thread;

use anyhow::Result;
use rand::seq::SliceRandom;
use rand::SeedableRng;

mod common;
use common::create_test_buffer_pool;

use keeldb::common::types::Rid;
use keeldb::index::btree::GenericKey;
use keeldb::transaction::concurrency::{IsolationLevel, Transaction};
use keeldb::BTreeIndex;

type Key = GenericKey<8>;

fn key(value: u64) -> Key {
    Key::from_u64(value)
}

fn rid(value: u64) -> Rid {
    Rid::new(value as i32, value as u32)
}

fn test_txn(id: u32) -> Transaction {
    Transaction::new(id, IsolationLevel::RepeatableRead)
}

#[test]
fn test_sequential_insert_and_scan() -> Result<()> {
    let (buffer_pool, _disk, _file) = create_test_buffer_pool(64)?;
    let tree = BTreeIndex::<Key>::new("seq", buffer_pool, 4, 4)?;
    let txn = test_txn(1);

    assert!(tree.is_empty());
    for i in 1..=10 {
        assert!(tree.insert(&key(i), rid(i), &txn)?);
    }
    assert!(!tree.is_empty());
    tree.verify_integrity()?;

    for i in 1..=10 {
        assert_eq!(tree.get_value(&key(i), &txn)?, Some(rid(i)));
    }
    assert_eq!(tree.get_value(&key(11), &txn)?, None);

    let scanned: Vec<u64> = tree.iter()?.map(|(k, _)| k.to_u64()).collect();
    assert_eq!(scanned, (1..=10).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn test_duplicate_insert_is_rejected() -> Result<()> {
    let (buffer_pool, _disk, _file) = create_test_buffer_pool(64)?;
    let tree = BTreeIndex::<Key>::new("dup", buffer_pool, 4, 4)?;
    let txn = test_txn(1);

    assert!(tree.insert(&key(7), rid(7), &txn)?);
    assert!(!tree.insert(&key(7), rid(99), &txn)?);
    assert_eq!(tree.get_value(&key(7), &txn)?, Some(rid(7)));

    let count = tree.iter()?.count();
    assert_eq!(count, 1);
    Ok(())
}

#[test]
fn test_random_permutation_roundtrip() -> Result<()> {
    let (buffer_pool, _disk, _file) = create_test_buffer_pool(128)?;
    let tree = BTreeIndex::<Key>::new("perm", buffer_pool, 8, 8)?;
    let txn = test_txn(1);

    let mut values: Vec<u64> = (1..=300).collect();
    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    values.shuffle(&mut rng);

    for &v in &values {
        assert!(tree.insert(&key(v), rid(v), &txn)?);
    }
    tree.verify_integrity()?;

    for &v in &values {
        assert_eq!(tree.get_value(&key(v), &txn)?, Some(rid(v)));
    }
    let scanned: Vec<u64> = tree.iter()?.map(|(k, _)| k.to_u64()).collect();
    assert_eq!(scanned, (1..=300).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn test_remove_subset() -> Result<()> {
    let (buffer_pool, _disk, _file) = create_test_buffer_pool(64)?;
    let tree = BTreeIndex::<Key>::new("rm", buffer_pool, 4, 4)?;
    let txn = test_txn(1);

    for i in 1..=10 {
        tree.insert(&key(i), rid(i), &txn)?;
    }
    for i in [5u64, 6, 7] {
        tree.remove(&key(i), &txn)?;
    }
    tree.verify_integrity()?;
    // The merges reclaimed pages and recorded them against the transaction.
    assert!(!txn.take_deleted_pages().is_empty());

    for i in 1..=10u64 {
        let expected = if (5..=7).contains(&i) { None } else { Some(rid(i)) };
        assert_eq!(tree.get_value(&key(i), &txn)?, expected);
    }
    let scanned: Vec<u64> = tree.iter()?.map(|(k, _)| k.to_u64()).collect();
    assert_eq!(scanned, vec![1, 2, 3, 4, 8, 9, 10]);
    Ok(())
}

#[test]
fn test_remove_missing_key_is_noop() -> Result<()> {
    let (buffer_pool, _disk, _file) = create_test_buffer_pool(64)?;
    let tree = BTreeIndex::<Key>::new("rm_missing", buffer_pool, 4, 4)?;
    let txn = test_txn(1);

    tree.remove(&key(1), &txn)?;
    tree.insert(&key(1), rid(1), &txn)?;
    tree.remove(&key(2), &txn)?;
    assert_eq!(tree.get_value(&key(1), &txn)?, Some(rid(1)));
    Ok(())
}

#[test]
fn test_remove_everything_then_reinsert() -> Result<()> {
    let (buffer_pool, _disk, _file) = create_test_buffer_pool(128)?;
    let tree = BTreeIndex::<Key>::new("drain", buffer_pool, 4, 4)?;
    let txn = test_txn(1);

    for i in 1..=50 {
        tree.insert(&key(i), rid(i), &txn)?;
    }
    for i in 1..=50 {
        tree.remove(&key(i), &txn)?;
    }
    assert!(tree.is_empty());
    assert!(tree.iter()?.next().is_none());

    for i in 1..=20 {
        assert!(tree.insert(&key(i), rid(i), &txn)?);
    }
    tree.verify_integrity()?;
    let scanned: Vec<u64> = tree.iter()?.map(|(k, _)| k.to_u64()).collect();
    assert_eq!(scanned, (1..=20).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn test_remove_in_reverse_order() -> Result<()> {
    let (buffer_pool, _disk, _file) = create_test_buffer_pool(128)?;
    let tree = BTreeIndex::<Key>::new("reverse", buffer_pool, 4, 4)?;
    let txn = test_txn(1);

    for i in 1..=40 {
        tree.insert(&key(i), rid(i), &txn)?;
    }
    for i in (11..=40).rev() {
        tree.remove(&key(i), &txn)?;
        tree.verify_integrity()?;
    }
    let scanned: Vec<u64> = tree.iter()?.map(|(k, _)| k.to_u64()).collect();
    assert_eq!(scanned, (1..=10).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn test_iter_from_mid_key() -> Result<()> {
    let (buffer_pool, _disk, _file) = create_test_buffer_pool(64)?;
    let tree = BTreeIndex::<Key>::new("seek", buffer_pool, 4, 4)?;
    let txn = test_txn(1);

    for i in (2..=20).step_by(2) {
        tree.insert(&key(i), rid(i), &txn)?;
    }

    // Seek to a present key and to a gap.
    let from_present: Vec<u64> = tree.iter_from(&key(8))?.map(|(k, _)| k.to_u64()).collect();
    assert_eq!(from_present, vec![8, 10, 12, 14, 16, 18, 20]);

    let from_gap: Vec<u64> = tree.iter_from(&key(9))?.map(|(k, _)| k.to_u64()).collect();
    assert_eq!(from_gap, vec![10, 12, 14, 16, 18, 20]);

    let mut past_end = tree.iter_from(&key(21))?;
    assert!(past_end.is_end());
    assert!(past_end.next().is_none());
    Ok(())
}

#[test]
fn test_reopen_by_name() -> Result<()> {
    let (buffer_pool, _disk, _file) = create_test_buffer_pool(64)?;
    let txn = test_txn(1);

    {
        let tree = BTreeIndex::<Key>::new("orders_pk", Arc::clone(&buffer_pool), 4, 4)?;
        for i in 1..=25 {
            tree.insert(&key(i), rid(i), &txn)?;
        }
    }

    // A new handle under the same name picks up the persisted root.
    let tree = BTreeIndex::<Key>::new("orders_pk", buffer_pool, 4, 4)?;
    assert!(!tree.is_empty());
    for i in 1..=25 {
        assert_eq!(tree.get_value(&key(i), &txn)?, Some(rid(i)));
    }
    Ok(())
}

#[test]
fn test_concurrent_disjoint_ranges() -> Result<()> {
    let (buffer_pool, _disk, _file) = create_test_buffer_pool(256)?;
    let tree = Arc::new(BTreeIndex::<Key>::new("conc", buffer_pool, 16, 16)?);

    const THREADS: u64 = 4;
    const PER_THREAD: u64 = 1000;

    let mut handles = Vec::new();
    for t in 0..THREADS {
        let tree = Arc::clone(&tree);
        handles.push(thread::spawn(move || -> Result<()> {
            let txn = test_txn(t as u32 + 1);
            let base = t * PER_THREAD;
            for i in 0..PER_THREAD {
                let v = base + i + 1;
                assert!(tree.insert(&key(v), rid(v), &txn)?);
            }
            // Remove every third key in our range.
            for i in (0..PER_THREAD).step_by(3) {
                let v = base + i + 1;
                tree.remove(&key(v), &txn)?;
            }
            for i in 0..PER_THREAD {
                let v = base + i + 1;
                let expected = if i % 3 == 0 { None } else { Some(rid(v)) };
                assert_eq!(tree.get_value(&key(v), &txn)?, expected);
            }
            Ok(())
        }));
    }
    for handle in handles {
        handle.join().expect("worker panicked")?;
    }

    tree.verify_integrity()?;
    let expected: Vec<u64> = (0..THREADS)
        .flat_map(|t| {
            (0..PER_THREAD).filter_map(move |i| {
                if i % 3 == 0 {
                    None
                } else {
                    Some(t * PER_THREAD + i + 1)
                }
            })
        })
        .collect();
    let scanned: Vec<u64> = tree.iter()?.map(|(k, _)| k.to_u64()).collect();
    assert_eq!(scanned, expected);
    Ok(())
}

#[test]
fn test_concurrent_readers_during_writes() -> Result<()> {
    let (buffer_pool, _disk, _file) = create_test_buffer_pool(256)?;
    let tree = Arc::new(BTreeIndex::<Key>::new("mixed", buffer_pool, 8, 8)?);

    // Preload a stable range that readers can always expect to find.
    let txn = test_txn(1);
    for i in 1..=500 {
        tree.insert(&key(i), rid(i), &txn)?;
    }

    let writer = {
        let tree = Arc::clone(&tree);
        thread::spawn(move || -> Result<()> {
            let txn = test_txn(2);
            for i in 501..=1500u64 {
                tree.insert(&key(i), rid(i), &txn)?;
            }
            for i in 501..=1500u64 {
                tree.remove(&key(i), &txn)?;
            }
            Ok(())
        })
    };
    let readers: Vec<_> = (0..3)
        .map(|r| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || -> Result<()> {
                let txn = test_txn(10 + r);
                for round in 0..20 {
                    for i in 1..=500u64 {
                        assert_eq!(tree.get_value(&key(i), &txn)?, Some(rid(i)));
                    }
                    let scanned = tree.iter_from(&key(1))?.take(500).count();
                    assert!(scanned >= 500, "round {}: lost stable keys", round);
                }
                Ok(())
            })
        })
        .collect();

    writer.join().expect("writer panicked")?;
    for reader in readers {
        reader.join().expect("reader panicked")?;
    }

    tree.verify_integrity()?;
    let scanned: Vec<u64> = tree.iter()?.map(|(k, _)| k.to_u64()).collect();
    assert_eq!(scanned, (1..=500).collect::<Vec<_>>());
    Ok(())
}
