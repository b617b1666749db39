//! SQLite implementation of a checkpoint store.

use std::path::Path;

use rusqlite::Connection;
use rusqlite::OpenFlags;
use rusqlite::OptionalExtension;
use rusqlite_migration::Migrations;
use rusqlite_migration::M;

use super::CheckpointStore;
use crate::errors::RecoveryError;
use crate::recovery::model::*;

fn get_migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(
        "CREATE TABLE snaps ( \
         created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP, \
         step_id TEXT NOT NULL, \
         checkpoint_id INTEGER NOT NULL CHECK (checkpoint_id >= 0), \
         snapshot BLOB NOT NULL, \
         PRIMARY KEY (step_id, checkpoint_id) \
         ) STRICT",
    )])
}

#[test]
fn migrations_valid() -> Result<(), rusqlite_migration::Error> {
    get_migrations().validate()
}

/// Setup our connection-level pragmas. Run this on each connection.
fn setup_conn(conn: &mut Connection) -> Result<(), RecoveryError> {
    // These are recommended by Litestream.
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "busy_timeout", "5000")?;
    get_migrations().to_latest(conn)?;
    Ok(())
}

/// Checkpoint store backed by a single SQLite file.
///
/// Each snapshot is one row in the `snaps` table.
pub struct SqliteCheckpointStore {
    conn: Connection,
}

impl SqliteCheckpointStore {
    /// Open or create the DB file at this path and run any pending
    /// migrations.
    pub fn open(file: &Path) -> Result<Self, RecoveryError> {
        tracing::info!("Opening checkpoint store at {file:?}");
        let mut conn = Connection::open_with_flags(
            file,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        setup_conn(&mut conn)?;
        Ok(Self { conn })
    }

    /// A store that disappears when dropped.
    pub fn open_in_memory() -> Result<Self, RecoveryError> {
        let mut conn = Connection::open_in_memory()?;
        setup_conn(&mut conn)?;
        Ok(Self { conn })
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn write(
        &mut self,
        step_id: &StepId,
        checkpoint: CheckpointId,
        state: StateBytes,
    ) -> Result<(), RecoveryError> {
        tracing::trace!("Writing {} bytes for {step_id} at checkpoint {checkpoint}", state.len());
        let txn = self.conn.transaction()?;
        txn.execute(
            "INSERT INTO snaps (step_id, checkpoint_id, snapshot) \
             VALUES (?1, ?2, ?3) \
             ON CONFLICT (step_id, checkpoint_id) DO UPDATE \
             SET snapshot = EXCLUDED.snapshot",
            (step_id.0.as_str(), checkpoint.0, state.0),
        )?;
        txn.commit()?;
        Ok(())
    }

    fn read_latest(
        &mut self,
        step_id: &StepId,
    ) -> Result<Option<(CheckpointId, StateBytes)>, RecoveryError> {
        let found = self
            .conn
            .query_row(
                "SELECT checkpoint_id, snapshot \
                 FROM snaps \
                 WHERE step_id = ?1 \
                 ORDER BY checkpoint_id DESC \
                 LIMIT 1",
                (step_id.0.as_str(),),
                |row| Ok((CheckpointId(row.get(0)?), StateBytes(row.get(1)?))),
            )
            .optional()?;
        Ok(found)
    }

    fn discard_before(
        &mut self,
        step_id: &StepId,
        before: CheckpointId,
    ) -> Result<usize, RecoveryError> {
        let deleted = self.conn.execute(
            "DELETE FROM snaps \
             WHERE step_id = ?1 AND checkpoint_id < ?2",
            (step_id.0.as_str(), before.0),
        )?;
        tracing::debug!("Discarded {deleted} snapshots of {step_id} before checkpoint {before}");
        Ok(deleted)
    }
}

#[test]
fn read_latest_empty() {
    let mut store = SqliteCheckpointStore::open_in_memory().unwrap();

    let found = store.read_latest(&StepId::new("op1")).unwrap();
    assert_eq!(found, None);
}

#[test]
fn read_latest_picks_newest() {
    let mut store = SqliteCheckpointStore::open_in_memory().unwrap();
    let step = StepId::new("op1");

    store
        .write(&step, CheckpointId(2), StateBytes(vec![2]))
        .unwrap();
    store
        .write(&step, CheckpointId(3), StateBytes(vec![3]))
        .unwrap();
    store
        .write(&StepId::new("op2"), CheckpointId(9), StateBytes(vec![9]))
        .unwrap();

    let found = store.read_latest(&step).unwrap();
    let expected = Some((CheckpointId(3), StateBytes(vec![3])));
    assert_eq!(found, expected);
}

#[test]
fn write_upserts() {
    let mut store = SqliteCheckpointStore::open_in_memory().unwrap();
    let step = StepId::new("op1");

    store
        .write(&step, CheckpointId(1), StateBytes(vec![1]))
        .unwrap();
    store
        .write(&step, CheckpointId(1), StateBytes(vec![7]))
        .unwrap();

    let found = store.read_latest(&step).unwrap();
    assert_eq!(found, Some((CheckpointId(1), StateBytes(vec![7]))));
}

#[test]
fn discard_before_deletes_older() {
    let mut store = SqliteCheckpointStore::open_in_memory().unwrap();
    let step = StepId::new("op1");

    for checkpoint in 1..=3 {
        store
            .write(&step, CheckpointId(checkpoint), StateBytes(vec![]))
            .unwrap();
    }

    let found = store.discard_before(&step, CheckpointId(3)).unwrap();
    assert_eq!(found, 2);
    assert_eq!(
        store.read_latest(&step).unwrap().map(|(id, _)| id),
        Some(CheckpointId(3))
    );
}
