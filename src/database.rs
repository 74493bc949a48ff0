use crate::dlog;
use crate::timeutil::{DB_DATETIME_FMT, dedup_key, truncate_to_second};
use crate::types::{FullRun, InsertedRun, MetricRow, NewRun};
use anyhow::{Context, Result, bail};
use chrono::{DateTime, TimeZone};
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use std::collections::HashSet;
use std::path::Path;

/// SQLite store for workout types, workouts, runs and per-second metrics.
///
/// One connection per process. The UNIQUE constraint on `runs.datetime` is
/// the real dedup guard; [`Database::run_exists`] is only a fast pre-check.
pub struct Database {
    conn: Connection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResetReport {
    pub metrics: usize,
    pub runs: usize,
    pub workouts: usize,
    pub workout_types: usize,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating dir: {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Opening SQLite DB: {}", path.display()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Opening in-memory SQLite DB")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("Enabling foreign keys")?;
        let db = Self { conn };
        db.ensure_schema()?;
        Ok(db)
    }

    pub const fn conn(&self) -> &Connection {
        &self.conn
    }

    fn ensure_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(
                r"
                CREATE TABLE IF NOT EXISTS workout_types (
                  id    INTEGER PRIMARY KEY AUTOINCREMENT,
                  name  TEXT NOT NULL UNIQUE
                );

                CREATE TABLE IF NOT EXISTS workouts (
                  id               INTEGER PRIMARY KEY AUTOINCREMENT,
                  workout_name     TEXT NOT NULL,
                  notes            TEXT,
                  workout_type_id  INTEGER NOT NULL REFERENCES workout_types(id)
                );

                CREATE TABLE IF NOT EXISTS runs (
                  id            INTEGER PRIMARY KEY AUTOINCREMENT,
                  workout_id    INTEGER NOT NULL REFERENCES workouts(id),
                  datetime      TEXT NOT NULL UNIQUE,
                  duration_sec  INTEGER NOT NULL,
                  avg_power     REAL,
                  distance_m    REAL,
                  avg_hr        INTEGER
                );

                CREATE TABLE IF NOT EXISTS metrics (
                  id                    INTEGER PRIMARY KEY AUTOINCREMENT,
                  run_id                INTEGER NOT NULL REFERENCES runs(id),
                  datetime              TEXT NOT NULL,
                  power                 REAL,
                  distance_m            REAL,
                  ground_time           REAL,
                  stiffness             REAL,
                  cadence               REAL,
                  vertical_oscillation  REAL
                );

                CREATE INDEX IF NOT EXISTS metrics_run_idx ON metrics (run_id, datetime);
                CREATE INDEX IF NOT EXISTS runs_datetime_id_idx ON runs (datetime, id);
                ",
            )
            .context("Ensuring SQLite schema")?;
        Ok(())
    }

    pub fn run_exists<Z: TimeZone>(&self, start: &DateTime<Z>) -> Result<bool> {
        Ok(self.run_id_for(&dedup_key(start))?.is_some())
    }

    fn run_id_for(&self, key: &str) -> Result<Option<i64>> {
        self.conn
            .query_row("SELECT id FROM runs WHERE datetime = ?1", [key], |r| {
                r.get(0)
            })
            .optional()
            .context("Looking up run by start time")
    }

    /// Every stored dedup key.
    pub fn existing_start_times(&self) -> Result<HashSet<String>> {
        let mut stmt = self.conn.prepare("SELECT datetime FROM runs")?;
        let keys = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<HashSet<_>>>()
            .context("Reading run start times")?;
        Ok(keys)
    }

    pub fn get_or_create_workout_type(&self, name: &str) -> Result<i64> {
        get_or_create_workout_type(&self.conn, name)
    }

    pub fn insert_workout(&self, name: &str, notes: &str, workout_type_id: i64) -> Result<i64> {
        insert_workout(&self.conn, name, notes, workout_type_id)
    }

    /// Insert a run, or return the id of the run already stored at that second.
    pub fn insert_run(&self, run: &NewRun) -> Result<i64> {
        insert_run(&self.conn, run)
    }

    pub fn insert_metrics(&self, run_id: i64, rows: &[MetricRow]) -> Result<usize> {
        insert_metrics(&self.conn, run_id, rows)
    }

    /// Type, workout, run and metrics for one file, as one transaction.
    ///
    /// A run already stored at the same start second is returned untouched
    /// with `created = false`; no workout row is written in that case.
    pub fn insert_full_run(&mut self, run: &FullRun) -> Result<InsertedRun> {
        let key = dedup_key(&run.start);
        if let Some(run_id) = self.run_id_for(&key)? {
            tracing::info!(run_id, start = %key, "run already stored");
            return Ok(InsertedRun {
                workout_id: None,
                run_id,
                created: false,
            });
        }

        let tx = self
            .conn
            .transaction()
            .context("Starting transaction for run")?;

        let type_id = get_or_create_workout_type(&tx, &run.workout_type)?;
        let workout_id = insert_workout(&tx, &run.workout_name, &run.notes, type_id)?;
        let (run_id, created) = try_insert_run(
            &tx,
            &NewRun {
                workout_id,
                start: run.start,
                duration_sec: run.duration_sec,
                avg_power: run.avg_power,
                distance_m: run.distance_m,
                avg_hr: run.avg_hr,
            },
        )?;

        if !created {
            // Lost a race with another writer: drop our workout row with the transaction.
            tx.rollback().context("Rolling back duplicate run")?;
            return Ok(InsertedRun {
                workout_id: None,
                run_id,
                created: false,
            });
        }

        let samples = insert_metrics(&tx, run_id, &run.samples)?;
        tx.commit().context("Committing run transaction")?;

        tracing::info!(workout_id, run_id, samples, start = %key, "run saved");
        Ok(InsertedRun {
            workout_id: Some(workout_id),
            run_id,
            created: true,
        })
    }

    /// Delete everything and restart the id counters. Needs `confirmation == "yes"`.
    pub fn reset(&mut self, confirmation: &str) -> Result<ResetReport> {
        if !confirmation.trim().eq_ignore_ascii_case("yes") {
            bail!("Reset not confirmed; type 'yes' to delete all data");
        }

        let tx = self
            .conn
            .transaction()
            .context("Starting reset transaction")?;
        let report = ResetReport {
            metrics: tx.execute("DELETE FROM metrics", [])?,
            runs: tx.execute("DELETE FROM runs", [])?,
            workouts: tx.execute("DELETE FROM workouts", [])?,
            workout_types: tx.execute("DELETE FROM workout_types", [])?,
        };
        tx.execute(
            "DELETE FROM sqlite_sequence
             WHERE name IN ('metrics', 'runs', 'workouts', 'workout_types')",
            [],
        )
        .context("Resetting id counters")?;
        tx.commit().context("Committing reset")?;

        tracing::warn!(
            metrics = report.metrics,
            runs = report.runs,
            workouts = report.workouts,
            workout_types = report.workout_types,
            "database reset"
        );
        Ok(report)
    }
}

fn get_or_create_workout_type(conn: &Connection, name: &str) -> Result<i64> {
    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM workout_types WHERE name = ?1",
            [name],
            |r| r.get(0),
        )
        .optional()
        .context("Looking up workout type")?;
    if let Some(id) = existing {
        return Ok(id);
    }

    conn.execute("INSERT INTO workout_types (name) VALUES (?1)", [name])
        .context("Inserting workout type")?;
    dlog!("workout_type_created name={name}");
    Ok(conn.last_insert_rowid())
}

fn insert_workout(conn: &Connection, name: &str, notes: &str, workout_type_id: i64) -> Result<i64> {
    conn.execute(
        "INSERT INTO workouts (workout_name, notes, workout_type_id) VALUES (?1, ?2, ?3)",
        params![name, notes, workout_type_id],
    )
    .context("Inserting workout")?;
    Ok(conn.last_insert_rowid())
}

fn insert_run(conn: &Connection, run: &NewRun) -> Result<i64> {
    try_insert_run(conn, run).map(|(id, _)| id)
}

/// Returns `(id, created)`.
fn try_insert_run(conn: &Connection, run: &NewRun) -> Result<(i64, bool)> {
    let key = dedup_key(&truncate_to_second(&run.start));
    let res = conn.execute(
        r"
        INSERT INTO runs (workout_id, datetime, duration_sec, avg_power, distance_m, avg_hr)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ",
        params![
            run.workout_id,
            key,
            run.duration_sec,
            run.avg_power,
            run.distance_m,
            run.avg_hr
        ],
    );

    match res {
        Ok(_) => Ok((conn.last_insert_rowid(), true)),
        Err(e) if is_unique_violation(&e) => {
            let id = conn
                .query_row("SELECT id FROM runs WHERE datetime = ?1", [&key], |r| {
                    r.get(0)
                })
                .context("Re-selecting existing run")?;
            dlog!("run_duplicate start={key} run_id={id}");
            Ok((id, false))
        }
        Err(e) => Err(e).context("Inserting run"),
    }
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    // 2067 = SQLITE_CONSTRAINT_UNIQUE
    e.sqlite_error().is_some_and(|s| {
        s.code == ErrorCode::ConstraintViolation && s.extended_code == 2067
    })
}

fn insert_metrics(conn: &Connection, run_id: i64, rows: &[MetricRow]) -> Result<usize> {
    let mut stmt = conn
        .prepare(
            r"
            INSERT INTO metrics (
              run_id, datetime, power, distance_m,
              ground_time, stiffness, cadence, vertical_oscillation
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ",
        )
        .context("Preparing metric insert")?;

    let mut inserted = 0usize;
    let mut dropped = 0usize;
    for row in rows {
        let Some(ts) = row.timestamp else {
            dropped += 1;
            continue;
        };
        stmt.execute(params![
            run_id,
            ts.format(DB_DATETIME_FMT).to_string(),
            row.power,
            row.distance_m,
            row.ground_ms,
            row.stiffness,
            row.cadence,
            row.vertical_oscillation,
        ])
        .context("Inserting metric")?;
        inserted += 1;
    }

    if dropped > 0 {
        tracing::warn!(run_id, dropped, "dropped metric rows without a timestamp");
    }
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn full_run(start: DateTime<Utc>) -> FullRun {
        FullRun {
            workout_name: "Easy 8k".into(),
            workout_type: "Easy Run".into(),
            notes: String::new(),
            start,
            duration_sec: 2,
            avg_power: 3.1,
            distance_m: 6.0,
            avg_hr: Some(140),
            samples: (0..3)
                .map(|i| MetricRow {
                    timestamp: Some(start + Duration::seconds(i)),
                    power: Some(3.1),
                    distance_m: Some(3.0 * i as f64),
                    ground_ms: Some(240.0),
                    stiffness: None,
                    cadence: Some(176.0),
                    vertical_oscillation: Some(7.5),
                })
                .collect(),
        }
    }

    fn count(db: &Database, table: &str) -> i64 {
        db.conn()
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
            .unwrap()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 5, 0, 0).unwrap()
    }

    #[test]
    fn insert_full_run_is_idempotent() {
        let mut db = Database::open_in_memory().unwrap();
        let first = db.insert_full_run(&full_run(t0())).unwrap();
        let second = db.insert_full_run(&full_run(t0())).unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.run_id, second.run_id);
        assert_eq!(count(&db, "runs"), 1);
        assert_eq!(count(&db, "workouts"), 1);
        assert_eq!(count(&db, "metrics"), 3);
        assert!(db.run_exists(&t0()).unwrap());
    }

    #[test]
    fn subsecond_jitter_is_the_same_run() {
        let mut db = Database::open_in_memory().unwrap();
        let a = db.insert_full_run(&full_run(t0() + Duration::milliseconds(200))).unwrap();
        let b = db.insert_full_run(&full_run(t0() + Duration::milliseconds(900))).unwrap();
        let c = db.insert_full_run(&full_run(t0() + Duration::seconds(1))).unwrap();
        assert_eq!(a.run_id, b.run_id);
        assert_ne!(a.run_id, c.run_id);
        assert_eq!(count(&db, "runs"), 2);
    }

    #[test]
    fn insert_run_returns_existing_id_on_conflict() {
        let db = Database::open_in_memory().unwrap();
        let type_id = db.get_or_create_workout_type("Other").unwrap();
        let w1 = db.insert_workout("Unknown", "", type_id).unwrap();
        let w2 = db.insert_workout("Unknown", "", type_id).unwrap();
        assert_ne!(w1, w2);

        let mk = |workout_id| NewRun {
            workout_id,
            start: t0(),
            duration_sec: 60,
            avg_power: 0.0,
            distance_m: 100.0,
            avg_hr: None,
        };
        let id1 = db.insert_run(&mk(w1)).unwrap();
        let id2 = db.insert_run(&mk(w2)).unwrap();
        assert_eq!(id1, id2);
        assert_eq!(count(&db, "runs"), 1);
    }

    #[test]
    fn run_exists_normalizes_zone() {
        let mut db = Database::open_in_memory().unwrap();
        db.insert_full_run(&full_run(t0())).unwrap();
        let athens: chrono_tz::Tz = "Europe/Athens".parse().unwrap();
        let local = athens.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();
        assert!(db.run_exists(&local).unwrap());
        assert!(!db.run_exists(&(local + Duration::seconds(1))).unwrap());
    }

    #[test]
    fn workout_types_are_shared() {
        let db = Database::open_in_memory().unwrap();
        let a = db.get_or_create_workout_type("Race").unwrap();
        let b = db.get_or_create_workout_type("Race").unwrap();
        let c = db.get_or_create_workout_type("Long Run").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn metrics_without_timestamp_are_dropped() {
        let mut db = Database::open_in_memory().unwrap();
        let mut run = full_run(t0());
        run.samples[1].timestamp = None;
        db.insert_full_run(&run).unwrap();
        assert_eq!(count(&db, "metrics"), 2);
    }

    #[test]
    fn foreign_keys_are_enforced() {
        let db = Database::open_in_memory().unwrap();
        let res = db.insert_workout("orphan", "", 999);
        assert!(res.is_err());
    }

    #[test]
    fn reset_requires_confirmation_and_restarts_ids() {
        let mut db = Database::open_in_memory().unwrap();
        let first = db.insert_full_run(&full_run(t0())).unwrap();

        assert!(db.reset("no").is_err());
        assert_eq!(count(&db, "runs"), 1);

        let report = db.reset("yes").unwrap();
        assert_eq!(report.runs, 1);
        assert_eq!(report.metrics, 3);
        for t in ["metrics", "runs", "workouts", "workout_types"] {
            assert_eq!(count(&db, t), 0);
        }

        let again = db.insert_full_run(&full_run(t0())).unwrap();
        assert_eq!(again.run_id, first.run_id);
        assert_eq!(again.run_id, 1);
    }

    #[test]
    fn existing_start_times_lists_keys() {
        let mut db = Database::open_in_memory().unwrap();
        db.insert_full_run(&full_run(t0())).unwrap();
        let keys = db.existing_start_times().unwrap();
        assert!(keys.contains("2024-06-01 05:00:00"));
    }
}
