//! Two connections racing on one object over the in-memory backend.
//! The serial check lets exactly one update through per round; the
//! loser gets `Ok(false)` and reloads.

use sqlentity::prelude::*;
use sqlentity_mem::MemDatabase;

#[derive(Debug, Default)]
struct Account {
    state: PersistState,
    name: String,
    balance: i64,
}

const ACCOUNT_COLUMNS: &[ColumnDef] = &[
    ColumnDef::new("name", ColumnType::Text),
    ColumnDef::new("balance", ColumnType::BigInt),
];

impl Entity for Account {
    const TABLE: &'static str = "account";

    fn columns() -> &'static [ColumnDef] {
        ACCOUNT_COLUMNS
    }

    fn state(&self) -> &PersistState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut PersistState {
        &mut self.state
    }

    fn column_values(&self) -> Vec<Value> {
        vec![
            Value::Text(self.name.clone()),
            Value::BigInt(self.balance),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            state: PersistState::default(),
            name: row.get_named("name")?,
            balance: row.get_named("balance")?,
        })
    }
}

fn database() -> Database {
    let mem = MemDatabase::new();
    Database::builder(ConnectConfig::new("mem://", "tester").id_source("memory"))
        .driver(Backend::Memory, Box::new(mem.factory()))
        .pool(PoolConfig::new(4))
        .register::<Account>()
        .create_schema(true)
        .build()
        .unwrap()
}

#[test]
fn test_stale_serial_loses_the_race() {
    let db = database();
    let mut writer = db.connect().unwrap();
    let mut rival = db.connect().unwrap();

    let mut original = Account {
        name: "shared".to_string(),
        balance: 100,
        ..Account::default()
    };
    assert!(original.insert(&mut writer).unwrap());
    let id = original.state().id;

    // Both sides load serial 1.
    let mut ours = Account::select(&mut writer, id).unwrap().unwrap();
    let mut theirs = Account::select(&mut rival, id).unwrap().unwrap();
    assert_eq!(ours.state().serial, theirs.state().serial);

    ours.balance = 150;
    assert!(ours.update(&mut writer).unwrap());
    assert_eq!(ours.state().serial, 2);

    theirs.balance = 125;
    assert!(!theirs.update(&mut rival).unwrap());
    // The losing object is untouched.
    assert_eq!(theirs.state().serial, 1);

    // The winner's write stands and the serial moved exactly once.
    let fresh = Account::select(&mut rival, id).unwrap().unwrap();
    assert_eq!(fresh.balance, 150);
    assert_eq!(fresh.state().serial, 2);
}

#[test]
fn test_loser_succeeds_after_reloading() {
    let db = database();
    let mut writer = db.connect().unwrap();
    let mut rival = db.connect().unwrap();

    let mut original = Account {
        name: "shared".to_string(),
        balance: 10,
        ..Account::default()
    };
    assert!(original.insert(&mut writer).unwrap());
    let id = original.state().id;

    let mut ours = Account::select(&mut writer, id).unwrap().unwrap();
    let mut theirs = Account::select(&mut rival, id).unwrap().unwrap();

    ours.balance = 20;
    assert!(ours.update(&mut writer).unwrap());
    theirs.balance = 30;
    assert!(!theirs.update(&mut rival).unwrap());

    let mut retried = Account::select(&mut rival, id).unwrap().unwrap();
    retried.balance = 30;
    assert!(retried.update(&mut rival).unwrap());
    assert_eq!(retried.state().serial, 3);

    let fresh = Account::select(&mut writer, id).unwrap().unwrap();
    assert_eq!(fresh.balance, 30);
}

#[test]
fn test_update_after_delete_reports_a_miss() {
    let db = database();
    let mut writer = db.connect().unwrap();
    let mut rival = db.connect().unwrap();

    let mut original = Account {
        name: "doomed".to_string(),
        balance: 1,
        ..Account::default()
    };
    assert!(original.insert(&mut writer).unwrap());
    let id = original.state().id;

    let mut theirs = Account::select(&mut rival, id).unwrap().unwrap();

    assert!(original.delete(&mut writer).unwrap());

    theirs.balance = 2;
    assert!(!theirs.update(&mut rival).unwrap());
    assert!(Account::select(&mut rival, id).unwrap().is_none());
}
