//! Change detection over the in-memory backend: a poller noticing a
//! burst of writes, and serial gap scans noticing deletions between
//! two reads.

use sqlentity::prelude::*;
use sqlentity::SerialGapScan;
use sqlentity_mem::MemDatabase;
use std::sync::mpsc;
use std::time::Duration;

#[derive(Debug, Default)]
struct Gadget {
    state: PersistState,
    label: String,
}

const GADGET_COLUMNS: &[ColumnDef] = &[ColumnDef::new("label", ColumnType::Text)];

impl Entity for Gadget {
    const TABLE: &'static str = "gadget";
    const USES_TABLE_SERIAL: bool = true;
    const COUNTS_CHANGES: bool = true;

    fn columns() -> &'static [ColumnDef] {
        GADGET_COLUMNS
    }

    fn state(&self) -> &PersistState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut PersistState {
        &mut self.state
    }

    fn column_values(&self) -> Vec<Value> {
        vec![Value::Text(self.label.clone())]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            state: PersistState::default(),
            label: row.get_named("label")?,
        })
    }
}

fn database() -> Database {
    let mem = MemDatabase::new();
    Database::builder(ConnectConfig::new("mem://", "tester").id_source("memory"))
        .driver(Backend::Memory, Box::new(mem.factory()))
        .pool(PoolConfig::new(4))
        .register::<Gadget>()
        .create_schema(true)
        .build()
        .unwrap()
}

fn gadget(label: &str) -> Gadget {
    Gadget {
        state: PersistState::default(),
        label: label.to_string(),
    }
}

/// Stamped serials above `old`, ascending.
fn stamps_above(conn: &mut LogicalConnection, old: i64) -> Vec<i64> {
    let stmt = conn.prepare_statement(StatementDesc::new(
        "SELECT tableserial FROM gadget WHERE tableserial > ? ORDER BY tableserial",
    ));
    let mut rows = conn.execute_query(stmt, &[Value::BigInt(old)]).unwrap();
    let mut stamps = Vec::new();
    while rows.next() {
        stamps.push(rows.fetch().unwrap().get_named("tableserial").unwrap());
    }
    stamps
}

fn deletion_between(conn: &mut LogicalConnection, old: i64) -> bool {
    let max = select_modification(conn, "gadget").unwrap();
    let mut scan = SerialGapScan::new(old, max);
    for stamp in stamps_above(conn, old) {
        scan.offer(stamp);
    }
    scan.finish()
}

#[test]
fn test_watcher_notices_a_burst_and_catches_up() {
    let db = database();
    let mut conn = db.connect().unwrap();

    let watcher = db.watch(WatchConfig::new(20)).unwrap();
    let (fire_tx, fire_rx) = mpsc::channel();
    watcher.watch("gadget", move |serial| {
        let _ = fire_tx.send(serial);
    });
    // Let the baseline poll run before mutating.
    std::thread::sleep(Duration::from_millis(100));

    for label in ["a", "b", "c"] {
        assert!(gadget(label).insert(&mut conn).unwrap());
    }

    let mut reported = fire_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    // The burst may land across two poll cycles; keep the last report.
    while let Ok(serial) = fire_rx.recv_timeout(Duration::from_millis(200)) {
        reported = serial;
    }
    assert_eq!(reported, select_modification(&mut conn, "gadget").unwrap());

    // Caught up: a quiet table fires nothing.
    assert!(
        fire_rx
            .recv_timeout(Duration::from_millis(300))
            .is_err()
    );
    watcher.terminate();
}

#[test]
fn test_gap_scan_detects_a_deletion_between_reads() {
    let db = database();
    let mut conn = db.connect().unwrap();

    let mut one = gadget("one");
    let mut two = gadget("two");
    let mut three = gadget("three");
    assert!(one.insert(&mut conn).unwrap());
    assert!(two.insert(&mut conn).unwrap());
    assert!(three.insert(&mut conn).unwrap());

    // First read sees stamps 1..=3, nothing missing.
    assert!(!deletion_between(&mut conn, 0));
    let seen = select_modification(&mut conn, "gadget").unwrap();
    assert_eq!(seen, 3);

    // Updates alone leave no hole.
    one.label = "one'".to_string();
    assert!(one.update(&mut conn).unwrap());
    two.label = "two'".to_string();
    assert!(two.update(&mut conn).unwrap());
    assert!(!deletion_between(&mut conn, seen));

    // Deleting a row stamped inside the unseen window, then writing
    // past it, leaves a hole the second read trips over.
    assert!(one.delete(&mut conn).unwrap());
    three.label = "three'".to_string();
    assert!(three.update(&mut conn).unwrap());
    assert!(deletion_between(&mut conn, seen));
}
