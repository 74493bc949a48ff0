//! End-to-end import tests: CSV files on disk, SQLite in memory.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use stridelog::config::Session;
use stridelog::database::Database;
use stridelog::ingest::{self, Hooks, Outcome};
use stridelog::query::{self, RunFilter};
use stridelog::utils;

/// 2024-06-01T07:00:00+02:00
const START: i64 = 1_717_218_000;

fn sensor_csv(start: i64, seconds: i64) -> String {
    let mut s = String::from(
        "Timestamp,Stryd Speed (m/s),Power (w/kg),Ground Time (ms),Cadence (spm)\n",
    );
    for i in 0..seconds {
        s.push_str(&format!("{},3.0,3.5,240,178\n", start + i));
    }
    s
}

fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
    let p = dir.join(name);
    fs::write(&p, body).unwrap();
    p
}

fn activities(dir: &Path) -> PathBuf {
    write(
        dir,
        "Activities.csv",
        "Activity Type,Date,Title,Avg HR\n\
         Running,2024-06-01 05:00:30,Easy recovery,139\n\
         Running,2024-06-03 18:00:00,Threshold 3x10,162\n",
    )
}

fn count(db: &Database, table: &str) -> i64 {
    db.conn()
        .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
        .unwrap()
}

#[test]
fn matched_run_is_stored_once() {
    let tmp = tempfile::tempdir().unwrap();
    let sensor = tmp.path().join("sensor");
    fs::create_dir(&sensor).unwrap();
    write(&sensor, "2024-06-01.csv", &sensor_csv(START, 120));
    let log = activities(tmp.path());

    let mut db = Database::open_in_memory().unwrap();
    let session = Session::new("UTC");

    let first = ingest::batch_import(&sensor, &log, &mut db, &session, Hooks::new()).unwrap();
    assert_eq!(first.parsed, 1);
    let report = &first.reports[0];
    assert!(matches!(report.outcome, Outcome::Ok { .. }));
    assert_eq!(report.start.as_deref(), Some("2024-06-01 05:00:00"));
    assert_eq!(report.workout_name.as_deref(), Some("Easy recovery"));

    let runs = query::fetch_all(db.conn(), &RunFilter::default()).unwrap();
    assert_eq!(runs.len(), 1);
    let run = &runs[0];
    assert_eq!(run.workout_type.as_deref(), Some("Easy Run"));
    assert_eq!(run.avg_hr, Some(139));
    assert_eq!(run.duration_sec, 119);
    assert!((run.distance_m.unwrap() - 357.0).abs() < 1e-9);
    assert_eq!(count(&db, "metrics"), 120);

    let second = ingest::batch_import(&sensor, &log, &mut db, &session, Hooks::new()).unwrap();
    assert_eq!(second.reports[0].outcome, Outcome::AlreadyExists);
    assert_eq!(count(&db, "runs"), 1);
    assert_eq!(count(&db, "workouts"), 1);
}

#[test]
fn zip_source_and_unparsed_scan() {
    let tmp = tempfile::tempdir().unwrap();
    let zip_path = tmp.path().join("stryd.zip");
    {
        let mut zw = zip::ZipWriter::new(fs::File::create(&zip_path).unwrap());
        let opts = zip::write::SimpleFileOptions::default();
        zw.start_file("a.csv", opts).unwrap();
        zw.write_all(sensor_csv(START, 30).as_bytes()).unwrap();
        zw.start_file("b.csv", opts).unwrap();
        zw.write_all(sensor_csv(START + 86_400, 30).as_bytes()).unwrap();
        zw.finish().unwrap();
    }
    let log = activities(tmp.path());
    let mut db = Database::open_in_memory().unwrap();

    let source = utils::open_source(&zip_path).unwrap();
    let summary =
        ingest::batch_import(source.dir(), &log, &mut db, &Session::new("UTC"), Hooks::new())
            .unwrap();
    assert_eq!(summary.parsed, 1);
    assert_eq!(summary.reports[1].outcome, Outcome::NoMatch);

    let unparsed = ingest::find_unparsed(source.dir(), &db, Hooks::new()).unwrap();
    assert_eq!(unparsed.total, 2);
    assert_eq!(unparsed.parsed_count, 1);
    assert!(unparsed.unparsed[0].ends_with("b.csv"));
}

#[test]
fn wrong_zone_then_reset() {
    let tmp = tempfile::tempdir().unwrap();
    let sensor = tmp.path().join("sensor");
    fs::create_dir(&sensor).unwrap();
    write(&sensor, "run.csv", &sensor_csv(START, 10));
    let log = activities(tmp.path());
    let mut db = Database::open_in_memory().unwrap();

    // Log read as Berlin time puts the activity two hours early.
    let berlin = Session::new("Europe/Berlin");
    let summary = ingest::batch_import(&sensor, &log, &mut db, &berlin, Hooks::new()).unwrap();
    assert_eq!(summary.reports[0].outcome, Outcome::NoMatch);
    assert_eq!(count(&db, "runs"), 0);

    let summary =
        ingest::batch_import(&sensor, &log, &mut db, &Session::new("UTC"), Hooks::new()).unwrap();
    assert_eq!(summary.parsed, 1);

    let done = db.reset("yes").unwrap();
    assert_eq!(done.runs, 1);
    assert_eq!(count(&db, "metrics"), 0);
}
