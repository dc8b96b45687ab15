use arrow_array::cast::AsArray;
use arrow_array::types::{Int64Type, UInt8Type};
use arrow_array::{Array, RecordBatch};
use mutascope_core::{
    Predicate, ReplicatedMergeTree, SystemMutations, SystemTablesConfig, TableRegistry,
    MUTATIONS_COLUMNS,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const TABLES: usize = 4;
const MUTATIONS_PER_TABLE: usize = 50;

fn setup() -> (TableRegistry, Vec<Arc<ReplicatedMergeTree>>) {
    let registry = TableRegistry::new();
    registry.create_database("db").unwrap();
    let tables: Vec<_> = (0..TABLES)
        .map(|i| Arc::new(ReplicatedMergeTree::new("db", &format!("t{i}"))))
        .collect();
    for table in &tables {
        registry.attach_table(table.clone()).unwrap();
    }
    (registry, tables)
}

/// (table, mutation_id) -> (parts_to_do, is_done) for every row.
fn observe(batches: &[RecordBatch]) -> HashMap<(String, String), (i64, u8)> {
    let mut rows = HashMap::new();
    for batch in batches {
        let tables = batch.column(1).as_string::<i32>();
        let ids = batch.column(2).as_string::<i32>();
        let partitions = batch.column(5).as_list::<i32>();
        let numbers = batch.column(6).as_list::<i32>();
        let parts = batch.column(7).as_primitive::<Int64Type>();
        let done = batch.column(8).as_primitive::<UInt8Type>();
        for row in 0..batch.num_rows() {
            assert_eq!(partitions.value_length(row), numbers.value_length(row));
            assert!(parts.value(row) >= 0);
            rows.insert(
                (tables.value(row).to_string(), ids.value(row).to_string()),
                (parts.value(row), done.value(row)),
            );
        }
    }
    rows
}

#[test]
fn test_reads_during_concurrent_mutation_progress() {
    let (registry, tables) = setup();
    let system = SystemMutations::new(SystemTablesConfig::new().with_max_block_size(16)).unwrap();
    let writers_done = AtomicBool::new(false);

    std::thread::scope(|s| {
        for table in &tables {
            let table = table.clone();
            s.spawn(move || {
                let log = table.mutations();
                for i in 0..MUTATIONS_PER_TABLE {
                    let id = log
                        .append(
                            &format!("DELETE WHERE k = {i}"),
                            [("p1", i as i64), ("p0", i as i64 + 1)],
                            3,
                        )
                        .unwrap();
                    log.part_done(&id).unwrap();
                    if i % 2 == 0 {
                        log.mark_done(&id).unwrap();
                    }
                }
            });
        }

        s.spawn(|| {
            // Once a row reports is_done = 1 it must stay that way.
            let mut seen_done = HashSet::new();
            let mut last_count = 0;
            while !writers_done.load(Ordering::Acquire) {
                let out = system
                    .read(&MUTATIONS_COLUMNS, &Predicate::True, &registry)
                    .unwrap();
                let rows = observe(&out.batches);
                assert!(rows.len() >= last_count, "entries never disappear");
                last_count = rows.len();
                for key in &seen_done {
                    assert_eq!(rows.get(key).map(|r| r.1), Some(1), "{key:?}");
                }
                for (key, (_, done)) in rows {
                    if done == 1 {
                        seen_done.insert(key);
                    }
                }
            }
        });

        // Stops the reader once every log is full.
        s.spawn(|| {
            while tables
                .iter()
                .any(|t| t.mutations().len() < MUTATIONS_PER_TABLE)
            {
                std::thread::yield_now();
            }
            writers_done.store(true, Ordering::Release);
        });
    });

    let out = system
        .read(&MUTATIONS_COLUMNS, &Predicate::True, &registry)
        .unwrap();
    assert_eq!(out.num_rows(), TABLES * MUTATIONS_PER_TABLE);
    assert!(out.batches.iter().all(|b| b.num_rows() <= 16));

    let rows = observe(&out.batches);
    let done = rows.values().filter(|(_, d)| *d == 1).count();
    assert_eq!(done, TABLES * MUTATIONS_PER_TABLE / 2);
    assert!(rows.values().all(|(parts, _)| *parts == 2));
}

#[test]
fn test_reads_while_tables_are_dropped() {
    let (registry, tables) = setup();
    for table in &tables {
        table
            .mutations()
            .append("DELETE WHERE 1", [("all", 1)], 1)
            .unwrap();
    }
    let system = SystemMutations::new(SystemTablesConfig::default()).unwrap();

    std::thread::scope(|s| {
        s.spawn(|| {
            for i in 0..TABLES {
                registry.drop_table("db", &format!("t{i}")).unwrap();
            }
        });
        s.spawn(|| {
            for _ in 0..100 {
                let out = system
                    .read(&["database", "table"], &Predicate::eq("database", "db"), &registry)
                    .unwrap();
                assert!(out.num_rows() <= TABLES);
                assert_eq!(
                    out.num_rows() + out.stats.skipped_tables,
                    out.stats.survivors
                );
            }
        });
    });

    let out = system
        .read(&["table"], &Predicate::True, &registry)
        .unwrap();
    assert_eq!(out.num_rows(), 0);
    assert_eq!(out.stats.candidates, 0);
    assert!(tables.iter().all(|t| t.mutations().len() == 1));
}

#[test]
fn test_concurrent_readers_share_one_table() {
    let (registry, tables) = setup();
    let log = tables[0].mutations();
    for i in 0..10 {
        log.append(&format!("UPDATE v = {i} WHERE 1"), [("all", i)], 1)
            .unwrap();
    }
    let system = SystemMutations::new(SystemTablesConfig::default()).unwrap();

    std::thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..20 {
                    let out = system
                        .read(&["mutation_id"], &Predicate::eq("table", "t0"), &registry)
                        .unwrap();
                    assert_eq!(out.num_rows(), 10);
                    let ids = out.batches[0].column(2).as_string::<i32>();
                    assert_eq!(ids.null_count(), 0);
                    assert_eq!(ids.value(0), "0000000000");
                    assert_eq!(ids.value(9), "0000000009");
                }
            });
        }
    });

    let metrics = system.metrics();
    assert_eq!(metrics.reads, 80);
    assert_eq!(metrics.rows_read, 800);
    assert_eq!(metrics.status_fetches, 80);
    assert_eq!(metrics.tables_pruned, 80 * (TABLES as u64 - 1));
}
