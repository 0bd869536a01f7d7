use std::sync::Arc;
use std::time::{Duration, Instant};

use mergeset::{Table, TableOptions, TableSearch};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tempfile::tempdir;

fn collect_all(table: &Table) -> Vec<Vec<u8>> {
    let mut ts = TableSearch::new(table);
    ts.seek(b"").unwrap();
    let mut items = Vec::new();
    while ts.next_item().unwrap() {
        items.push(ts.item().to_vec());
    }
    items
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

#[test]
fn test_concurrent_add_items() {
    let dir = tempdir().unwrap();
    let table = Table::open(dir.path(), TableOptions::default_for_test()).unwrap();

    let threads: Vec<_> = (0..8u32)
        .map(|t| {
            let table = table.clone();
            std::thread::spawn(move || {
                for batch in 0..50u32 {
                    let items: Vec<Vec<u8>> = (0..20u32)
                        .map(|i| format!("t{t}/b{batch:03}/i{i:02}").into_bytes())
                        .collect();
                    table.add_items(&items).unwrap();
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }
    table.flush_pending_items().unwrap();

    let mut expected: Vec<Vec<u8>> = (0..8u32)
        .flat_map(|t| {
            (0..50u32).flat_map(move |batch| {
                (0..20u32).map(move |i| format!("t{t}/b{batch:03}/i{i:02}").into_bytes())
            })
        })
        .collect();
    expected.sort();
    assert_eq!(collect_all(&table), expected);
    assert_eq!(table.stats().items, 8 * 50 * 20);
}

#[test]
fn test_background_merge_reduces_parts() {
    let dir = tempdir().unwrap();
    let table = Table::open(dir.path(), TableOptions::default_for_test()).unwrap();
    let mut expected = Vec::new();
    for i in 0..40u32 {
        let items = vec![format!("{i:04}-a").into_bytes(), format!("{i:04}-b").into_bytes()];
        table.add_items(&items).unwrap();
        table.flush_pending_items().unwrap();
        expected.extend(items);
    }
    assert!(wait_until(Duration::from_secs(10), || {
        let stats = table.stats();
        stats.merges_completed > 0 && stats.parts < 40
    }));
    assert_eq!(collect_all(&table), expected);
    assert!(table.stats().file_parts > 0);
}

#[test]
fn test_flusher_makes_items_searchable() {
    let dir = tempdir().unwrap();
    let options = TableOptions {
        enable_background_merge: false,
        ..TableOptions::default_for_test()
    };
    let table = Table::open(dir.path(), options).unwrap();
    table.add_items(&[b"pending"]).unwrap();
    assert!(wait_until(Duration::from_secs(10), || {
        collect_all(&table) == vec![b"pending".to_vec()]
    }));
    assert_eq!(table.stats().pending_items, 0);
}

#[test]
fn test_search_during_compaction() {
    let dir = tempdir().unwrap();
    let table = Table::open(dir.path(), TableOptions::default_for_test()).unwrap();
    let mut rng = SmallRng::seed_from_u64(17);
    let mut expected: Vec<Vec<u8>> = Vec::new();
    for _ in 0..10 {
        let items: Vec<Vec<u8>> = (0..300)
            .map(|_| format!("{:08}", rng.gen_range(0..1_000_000)).into_bytes())
            .collect();
        table.add_items(&items).unwrap();
        table.flush_pending_items().unwrap();
        expected.extend(items);
    }
    expected.sort();

    let writer = {
        let table = table.clone();
        std::thread::spawn(move || {
            for i in 0..200u32 {
                table
                    .add_items(&[format!("z{i:05}").into_bytes()])
                    .unwrap();
                if i % 20 == 0 {
                    table.flush_pending_items().unwrap();
                }
            }
        })
    };
    // Every snapshot holds at least the initial items, whatever compaction does.
    for _ in 0..20 {
        let found: Vec<Vec<u8>> = collect_all(&table)
            .into_iter()
            .filter(|item| !item.starts_with(b"z"))
            .collect();
        assert_eq!(found, expected);
    }
    writer.join().unwrap();
}

#[test]
fn test_close_persists_items_added_concurrently() {
    let dir = tempdir().unwrap();
    let options = TableOptions {
        shards: 1,
        max_blocks_per_shard: 1,
        ..TableOptions::default_for_test()
    };
    let accepted = {
        let table = Table::open(dir.path(), options.clone()).unwrap();
        let writers: Vec<_> = (0..4u32)
            .map(|t| {
                let table = table.clone();
                std::thread::spawn(move || {
                    let mut accepted = 0u64;
                    for batch in 0u32.. {
                        let items: Vec<Vec<u8>> = (0..64u32)
                            .map(|i| format!("t{t}/b{batch:06}/i{i:02}-{:040}", 0).into_bytes())
                            .collect();
                        match table.add_items(&items) {
                            Ok(()) => accepted += items.len() as u64,
                            Err(mergeset::Error::Closed) => return accepted,
                            Err(e) => panic!("unexpected error: {e}"),
                        }
                    }
                    accepted
                })
            })
            .collect();
        std::thread::sleep(Duration::from_millis(200));
        table.close().unwrap();
        writers
            .into_iter()
            .map(|w| w.join().unwrap())
            .sum::<u64>()
    };
    assert!(accepted > 0);

    let table = Table::open(dir.path(), options).unwrap();
    assert_eq!(table.stats().items, accepted);
    assert_eq!(collect_all(&table).len() as u64, accepted);
}

#[test]
fn test_reopen_after_merges() {
    let dir = tempdir().unwrap();
    let expected: Vec<Vec<u8>> = (0..2000u32).map(|i| format!("key{i:06}").into_bytes()).collect();
    {
        let table = Table::open(dir.path(), TableOptions::default_for_test()).unwrap();
        for chunk in expected.chunks(97) {
            table.add_items(chunk).unwrap();
        }
        table.force_merge_all().unwrap();
        table.add_items(&expected[..10]).unwrap();
        table.close().unwrap();
    }
    let table = Table::open(dir.path(), TableOptions::default_for_test()).unwrap();
    let stats = table.stats();
    assert_eq!(stats.in_memory_parts, 0);
    assert_eq!(stats.items, 2010);

    let mut with_dups = expected.clone();
    with_dups.extend_from_slice(&expected[..10]);
    with_dups.sort();
    assert_eq!(collect_all(&table), with_dups);

    let mut ts = TableSearch::new(&table);
    assert_eq!(
        ts.first_item_with_prefix(b"key0015").unwrap(),
        Some(b"key001500".to_vec())
    );
}

#[test]
fn test_prepare_block_dedup_on_force_merge() {
    let dir = tempdir().unwrap();
    let options = TableOptions {
        enable_background_merge: false,
        ..TableOptions::default_for_test()
    };
    let table = Table::open(dir.path(), options).unwrap();
    table.set_prepare_block(Arc::new(|data: Vec<u8>, items: Vec<mergeset::Item>| {
        let mut kept: Vec<mergeset::Item> = Vec::with_capacity(items.len());
        for item in items {
            if kept.last().is_some_and(|last| last.bytes(&data) == item.bytes(&data)) {
                continue;
            }
            kept.push(item);
        }
        (data, kept)
    }));
    for _ in 0..5 {
        table.add_items(&[b"x1", b"x2", b"x3"]).unwrap();
        table.flush_pending_items().unwrap();
    }
    table.force_merge_all().unwrap();
    assert_eq!(
        collect_all(&table),
        vec![b"x1".to_vec(), b"x2".to_vec(), b"x3".to_vec()]
    );
    let stats = table.stats();
    assert_eq!((stats.parts, stats.file_parts, stats.items), (1, 1, 3));
}

#[test]
fn test_leftover_tmp_is_cleared() {
    let dir = tempdir().unwrap();
    {
        let table = Table::open(dir.path(), TableOptions::default_for_test()).unwrap();
        table.add_items(&[b"a"]).unwrap();
    }
    let stale = dir.path().join("tmp").join("00000000000000FF");
    std::fs::create_dir_all(&stale).unwrap();
    std::fs::write(stale.join("items.bin"), b"partial").unwrap();

    let table = Table::open(dir.path(), TableOptions::default_for_test()).unwrap();
    assert!(!stale.exists());
    assert_eq!(collect_all(&table), vec![b"a".to_vec()]);
}
