//! Drives the per-file pipeline over a set of sensor exports.
//!
//! Batch import and interactive reconciliation are the same loop; they only
//! differ in the [`Resolver`] consulted when a file has no activity match.

use crate::config::Session;
use crate::correlate::{ActivityLog, Correlation, NoMatch};
use crate::database::Database;
use crate::dlog;
use crate::error::{ImportError, ImportResult};
use crate::pipeline::{ProcessedRun, process_in};
use crate::schema::{self, SENSOR_FIELDS, sensor};
use crate::table::{Table, parse_number};
use crate::timeutil::{dedup_key, epoch_to_utc, parse_tz};
use crate::utils::{file_label, list_csv_files};
use anyhow::{Context, Result, anyhow};
use chrono::Duration;
use chrono_tz::Tz;
use std::path::{Path, PathBuf};

/// Zone retries allowed for one file before it is given up on.
pub const MAX_TZ_RETRIES: usize = 5;

/// Terminal state of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ok { run_id: i64 },
    NoMatch,
    ZeroData,
    AlreadyExists,
    Error(String),
    Skipped,
}

impl Outcome {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ok { .. } => "ok",
            Self::NoMatch => "no_garmin",
            Self::ZeroData => "zero_data",
            Self::AlreadyExists => "already_exists",
            Self::Error(_) => "error",
            Self::Skipped => "skipped",
        }
    }

    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileReport {
    pub file: String,
    pub outcome: Outcome,
    /// Dedup key of the run, when the file got far enough to have one.
    pub start: Option<String>,
    pub workout_name: Option<String>,
    pub distance_m: Option<f64>,
}

impl FileReport {
    fn new(file: &str, outcome: Outcome) -> Self {
        Self {
            file: file.to_string(),
            outcome,
            start: None,
            workout_name: None,
            distance_m: None,
        }
    }

    fn for_run(run: &ProcessedRun, outcome: Outcome) -> Self {
        Self {
            file: run.label.clone(),
            outcome,
            start: Some(dedup_key(&run.start_utc())),
            workout_name: Some(run.workout_name.clone()),
            distance_m: Some(run.total_distance_m),
        }
    }
}

/// What one pass of the pipeline says about a file, before anything is written.
#[derive(Debug, Clone)]
pub enum Evaluation {
    Ready(Box<ProcessedRun>),
    NoMatch(Box<ProcessedRun>, NoMatch),
    ZeroData(String),
    AlreadyExists { start: String },
    Failed(String),
}

/// Run the pipeline on a loaded sensor table and check the store for the run.
///
/// `Err` only for store failures; everything file-related is an [`Evaluation`].
pub fn evaluate_table(
    table: &Table,
    log: &ActivityLog,
    label: &str,
    db: &Database,
    tz: Tz,
    tolerance: Duration,
) -> Result<Evaluation> {
    let run = match process_in(table, log, tz, label, tolerance) {
        Ok(run) => run,
        Err(e) if e.is_zero_data() => {
            tracing::info!(file = label, err = %e, "run skipped, sensor recorded nothing");
            return Ok(Evaluation::ZeroData(e.to_string()));
        }
        Err(e) => {
            tracing::error!(file = label, err = %e, "failed to process file");
            return Ok(Evaluation::Failed(e.to_string()));
        }
    };

    if db.run_exists(&run.start_utc())? {
        let start = dedup_key(&run.start_utc());
        tracing::info!(file = label, start = %start, "run already in database");
        return Ok(Evaluation::AlreadyExists { start });
    }

    Ok(match &run.correlation {
        Correlation::Matched(_) => Evaluation::Ready(Box::new(run)),
        Correlation::NoMatch(nm) => {
            let nm = nm.clone();
            Evaluation::NoMatch(Box::new(run), nm)
        }
    })
}

/// Answer to an unmatched file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    InsertUnmatched,
    RetryTimezone(String),
    Skip,
    Quit,
}

/// Everything a resolver gets to look at for an unmatched file.
pub struct Unmatched<'a> {
    pub file: &'a str,
    pub tz_name: &'a str,
    pub no_match: &'a NoMatch,
    pub run: &'a ProcessedRun,
    /// Zone retries already spent on this file.
    pub attempt: usize,
}

impl Unmatched<'_> {
    pub fn suggested_timezones(&self) -> Vec<String> {
        self.no_match.suggested_timezones()
    }
}

pub trait Resolver {
    fn on_no_match(&mut self, ctx: &Unmatched<'_>) -> Resolution;
}

/// Unattended default: leave unmatched files alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct SkipUnmatched;

impl Resolver for SkipUnmatched {
    fn on_no_match(&mut self, _ctx: &Unmatched<'_>) -> Resolution {
        Resolution::Skip
    }
}

/// Store unmatched files as "Unknown" workouts.
#[derive(Debug, Default, Clone, Copy)]
pub struct InsertUnmatched;

impl Resolver for InsertUnmatched {
    fn on_no_match(&mut self, _ctx: &Unmatched<'_>) -> Resolution {
        Resolution::InsertUnmatched
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Batch,
    Reconcile,
    Single,
}

impl Mode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Batch => "batch",
            Self::Reconcile => "reconcile",
            Self::Single => "single",
        }
    }
}

#[derive(Debug)]
pub enum ProgressEvent<'a> {
    Started { mode: Mode, total: usize },
    FileStarted { index: usize, total: usize, name: &'a str },
    FileFinished { report: &'a FileReport },
    Notice { file: &'a str, message: &'a str },
    Finished,
}

type ProgressFn<'a> = Box<dyn FnMut(&ProgressEvent<'_>) + 'a>;
type CancelFn<'a> = Box<dyn Fn() -> bool + 'a>;

/// Optional progress callback and cancellation flag, polled between files.
#[derive(Default)]
pub struct Hooks<'a> {
    progress: Option<ProgressFn<'a>>,
    cancel: Option<CancelFn<'a>>,
}

impl<'a> Hooks<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn on_progress(mut self, f: impl FnMut(&ProgressEvent<'_>) + 'a) -> Self {
        self.progress = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn cancel_when(mut self, f: impl Fn() -> bool + 'a) -> Self {
        self.cancel = Some(Box::new(f));
        self
    }

    fn emit(&mut self, ev: &ProgressEvent<'_>) {
        if let Some(f) = self.progress.as_mut() {
            f(ev);
        }
    }

    fn is_canceled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|f| f())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportSummary {
    pub mode: Mode,
    pub files_total: usize,
    pub parsed: usize,
    pub skipped: usize,
    pub not_attempted: usize,
    pub canceled: bool,
    pub quit: bool,
    /// Store error that stopped the batch.
    pub aborted: Option<String>,
    pub reports: Vec<FileReport>,
}

impl ImportSummary {
    const fn new(mode: Mode, files_total: usize) -> Self {
        Self {
            mode,
            files_total,
            parsed: 0,
            skipped: 0,
            not_attempted: 0,
            canceled: false,
            quit: false,
            aborted: None,
            reports: Vec::new(),
        }
    }

    pub const fn attempted(&self) -> usize {
        self.parsed + self.skipped
    }

    fn record(&mut self, report: FileReport) {
        if report.outcome.is_ok() {
            self.parsed += 1;
        } else {
            self.skipped += 1;
        }
        self.reports.push(report);
    }
}

enum Step {
    Next(FileReport),
    Quit(FileReport),
}

/// Import every CSV in `dir`; unmatched files are skipped.
pub fn batch_import(
    dir: &Path,
    activity_file: &Path,
    db: &mut Database,
    session: &Session,
    hooks: Hooks<'_>,
) -> Result<ImportSummary> {
    let files = list_csv_files(dir)?;
    tracing::info!(dir = %dir.display(), files = files.len(), "found sensor files");
    let log = load_activity_log(activity_file)?;
    Ok(import_files(
        Mode::Batch,
        &files,
        &log,
        db,
        session,
        &mut SkipUnmatched,
        hooks,
    ))
}

/// Import `files`, asking `resolver` what to do with each unmatched one.
pub fn reconcile(
    files: &[PathBuf],
    activity_file: &Path,
    db: &mut Database,
    session: &Session,
    resolver: &mut dyn Resolver,
    hooks: Hooks<'_>,
) -> Result<ImportSummary> {
    let log = load_activity_log(activity_file)?;
    Ok(import_files(
        Mode::Reconcile,
        files,
        &log,
        db,
        session,
        resolver,
        hooks,
    ))
}

pub fn single_file(
    path: &Path,
    activity_file: &Path,
    db: &mut Database,
    session: &Session,
    resolver: &mut dyn Resolver,
) -> Result<FileReport> {
    let log = load_activity_log(activity_file)?;
    let mut summary = import_files(
        Mode::Single,
        &[path.to_path_buf()],
        &log,
        db,
        session,
        resolver,
        Hooks::new(),
    );
    if let Some(err) = summary.aborted {
        return Err(anyhow!(err));
    }
    summary
        .reports
        .pop()
        .ok_or_else(|| anyhow!("no report for {}", path.display()))
}

fn load_activity_log(path: &Path) -> Result<ActivityLog> {
    let log = ActivityLog::from_path(path)
        .with_context(|| format!("Loading activity log: {}", path.display()))?;
    dlog!("activity_log rows={} path={}", log.len(), path.display());
    Ok(log)
}

/// The shared engine. Never fails: a store error is recorded in
/// [`ImportSummary::aborted`] and ends the loop.
pub fn import_files(
    mode: Mode,
    files: &[PathBuf],
    log: &ActivityLog,
    db: &mut Database,
    session: &Session,
    resolver: &mut dyn Resolver,
    mut hooks: Hooks<'_>,
) -> ImportSummary {
    let total = files.len();
    let mut summary = ImportSummary::new(mode, total);
    hooks.emit(&ProgressEvent::Started { mode, total });

    'files: for (index, path) in files.iter().enumerate() {
        if hooks.is_canceled() {
            summary.canceled = true;
            summary.not_attempted = total - index;
            tracing::warn!(remaining = summary.not_attempted, "import canceled");
            break 'files;
        }

        let name = file_label(path);
        tracing::info!(file = %name, index, total, "processing");
        hooks.emit(&ProgressEvent::FileStarted {
            index,
            total,
            name: &name,
        });

        let step = import_one(mode, path, &name, log, db, session, resolver, &mut hooks);
        let (report, stop) = match step {
            Ok(Step::Next(report)) => (report, false),
            Ok(Step::Quit(report)) => {
                summary.quit = true;
                (report, true)
            }
            Err(e) => {
                let msg = format!("{e:#}");
                tracing::error!(file = %name, err = %msg, "store failure, stopping import");
                summary.aborted = Some(msg.clone());
                (FileReport::new(&name, Outcome::Error(msg)), true)
            }
        };

        hooks.emit(&ProgressEvent::FileFinished { report: &report });
        summary.record(report);

        if stop {
            summary.not_attempted = total - index - 1;
            break 'files;
        }
    }

    tracing::info!(
        mode = mode.as_str(),
        parsed = summary.parsed,
        skipped = summary.skipped,
        not_attempted = summary.not_attempted,
        total,
        "import finished"
    );
    hooks.emit(&ProgressEvent::Finished);
    summary
}

#[allow(clippy::too_many_arguments)]
fn import_one(
    mode: Mode,
    path: &Path,
    name: &str,
    log: &ActivityLog,
    db: &mut Database,
    session: &Session,
    resolver: &mut dyn Resolver,
    hooks: &mut Hooks<'_>,
) -> Result<Step> {
    let table = match Table::from_path(path) {
        Ok(t) => t,
        Err(e) => {
            tracing::error!(file = name, err = %e, "failed to read file");
            return Ok(Step::Next(FileReport::new(name, Outcome::Error(e.to_string()))));
        }
    };

    let mut tz = session.tz;
    let mut tz_name = session.tz_name.clone();
    let mut retries = 0usize;

    'eval: loop {
        let (run, no_match) = match evaluate_table(&table, log, name, db, tz, session.tolerance)? {
            Evaluation::Ready(run) => return insert(db, &run).map(Step::Next),
            Evaluation::NoMatch(run, nm) => (run, nm),
            Evaluation::ZeroData(_) => {
                return Ok(Step::Next(FileReport::new(name, Outcome::ZeroData)));
            }
            Evaluation::AlreadyExists { start } => {
                let mut report = FileReport::new(name, Outcome::AlreadyExists);
                report.start = Some(start);
                return Ok(Step::Next(report));
            }
            Evaluation::Failed(msg) => {
                return Ok(Step::Next(FileReport::new(name, Outcome::Error(msg))));
            }
        };

        loop {
            let ctx = Unmatched {
                file: name,
                tz_name: &tz_name,
                no_match: &no_match,
                run: &run,
                attempt: retries,
            };
            match resolver.on_no_match(&ctx) {
                Resolution::InsertUnmatched => return insert(db, &run).map(Step::Next),
                // Batch mode skips by policy and reports the missing match;
                // an answer from the user is a decline.
                Resolution::Skip => {
                    let outcome = match mode {
                        Mode::Batch => Outcome::NoMatch,
                        Mode::Reconcile | Mode::Single => Outcome::Skipped,
                    };
                    return Ok(Step::Next(FileReport::for_run(&run, outcome)));
                }
                Resolution::Quit => {
                    return Ok(Step::Quit(FileReport::for_run(&run, Outcome::Skipped)));
                }
                Resolution::RetryTimezone(candidate) => {
                    if retries >= MAX_TZ_RETRIES {
                        let msg = format!("gave up after {MAX_TZ_RETRIES} timezone retries");
                        hooks.emit(&ProgressEvent::Notice {
                            file: name,
                            message: &msg,
                        });
                        return Ok(Step::Next(FileReport::for_run(&run, Outcome::Skipped)));
                    }
                    retries += 1;

                    if let Some(new_tz) = parse_tz(candidate.trim()) {
                        tracing::info!(file = name, tz = %new_tz, "retrying with timezone");
                        tz = new_tz;
                        tz_name = new_tz.name().to_string();
                        continue 'eval;
                    }
                    let msg = format!("unknown timezone {candidate:?}");
                    tracing::warn!(file = name, tz = %candidate, "unknown timezone");
                    hooks.emit(&ProgressEvent::Notice {
                        file: name,
                        message: &msg,
                    });
                }
            }
        }
    }
}

fn insert(db: &mut Database, run: &ProcessedRun) -> Result<FileReport> {
    let inserted = db
        .insert_full_run(&run.to_full_run(""))
        .with_context(|| format!("Saving run from {}", run.label))?;
    let outcome = if inserted.created {
        tracing::info!(
            file = %run.label,
            run_id = inserted.run_id,
            km = run.total_distance_m / 1000.0,
            "run imported"
        );
        Outcome::Ok {
            run_id: inserted.run_id,
        }
    } else {
        Outcome::AlreadyExists
    };
    Ok(FileReport::for_run(run, outcome))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnparsedReport {
    pub total: usize,
    pub unparsed: Vec<PathBuf>,
    pub parsed_count: usize,
    pub canceled: bool,
    /// Files left unchecked after a cancel.
    pub not_attempted: usize,
}

/// Sensor files in `dir` whose start time is not in the store yet.
///
/// Only the timestamp column is read. Files that cannot be read count as
/// unparsed.
pub fn find_unparsed(dir: &Path, db: &Database, mut hooks: Hooks<'_>) -> Result<UnparsedReport> {
    let files = list_csv_files(dir)?;
    let existing = db.existing_start_times()?;
    let total = files.len();
    let mut report = UnparsedReport {
        total,
        ..UnparsedReport::default()
    };
    hooks.emit(&ProgressEvent::Started {
        mode: Mode::Reconcile,
        total,
    });

    for (index, path) in files.into_iter().enumerate() {
        if hooks.is_canceled() {
            report.canceled = true;
            report.not_attempted = total - index;
            tracing::warn!(remaining = report.not_attempted, "unparsed scan canceled");
            break;
        }
        let name = file_label(&path);
        hooks.emit(&ProgressEvent::FileStarted {
            index,
            total,
            name: &name,
        });

        match first_start_key(&path) {
            Ok(Some(key)) if existing.contains(&key) => report.parsed_count += 1,
            Ok(Some(key)) => {
                dlog!("unparsed file={name} start={key}");
                report.unparsed.push(path);
            }
            Ok(None) => {
                dlog!("unparsed file={name} no timestamps");
                report.unparsed.push(path);
            }
            Err(e) => {
                let msg = format!("failed to check: {e}");
                tracing::warn!(file = %name, err = %e, "failed to check file");
                hooks.emit(&ProgressEvent::Notice {
                    file: &name,
                    message: &msg,
                });
                report.unparsed.push(path);
            }
        }
    }

    tracing::info!(
        total,
        parsed = report.parsed_count,
        unparsed = report.unparsed.len(),
        "unparsed scan done"
    );
    hooks.emit(&ProgressEvent::Finished);
    Ok(report)
}

/// Dedup key of the earliest timestamp in a sensor file.
fn first_start_key(path: &Path) -> ImportResult<Option<String>> {
    let table = schema::align_keys(Table::from_path(path)?, SENSOR_FIELDS, &[sensor::TIMESTAMP]);
    let col = table
        .column(sensor::TIMESTAMP)
        .ok_or_else(|| ImportError::MissingColumn(sensor::TIMESTAMP.to_string()))?;

    let first = (0..table.len())
        .filter_map(|row| parse_number(table.cell(row, col)))
        .filter(|v| v.is_finite())
        .min_by(f64::total_cmp);

    Ok(first.and_then(epoch_to_utc).map(|utc| dedup_key(&utc)))
}
