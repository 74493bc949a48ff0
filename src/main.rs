#![deny(warnings, clippy::all, clippy::pedantic, clippy::nursery)]

use anyhow::{Context, Result, bail};
use chrono::{Duration, Local};
use clap::Parser;
use std::io;
use std::path::{Path, PathBuf};
use stridelog::cli::{self, Cmd, PromptResolver, WindowKind};
use stridelog::config::{self, Session, Settings};
use stridelog::database::Database;
use stridelog::ingest::{self, Hooks, ImportSummary, InsertUnmatched, ProgressEvent, Resolver};
use stridelog::query::{self, OffsetPager, RunFilter};
use stridelog::report::{self, ReportWindow, Totals};
use stridelog::utils::{self, format_pace, format_seconds};

#[macro_use]
extern crate stridelog;

fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    utils::init_logging(cli.verbose, cli.quiet);

    let settings_path = config::settings_path();
    let settings = cli.settings().or(Settings::load(&settings_path)?);
    if cli.remember {
        settings.save(&settings_path)?;
        tracing::info!(path = %settings_path.display(), "settings remembered");
    }

    let session = Session::new(&settings.timezone_name())
        .with_tolerance(Duration::seconds(cli.tolerance.max(0)));
    let db_path = settings.database_path();
    dlog!(
        "session tz={} tolerance={}s db={}",
        session.tz_name,
        session.tolerance.num_seconds(),
        db_path.display()
    );
    let mut db = Database::open(&db_path)?;

    match cli.cmd {
        Cmd::Import { .. } => {
            let source = utils::open_source(sensor_source(&settings)?)?;
            let summary = ingest::batch_import(
                source.dir(),
                activity_file(&settings)?,
                &mut db,
                &session,
                Hooks::new().on_progress(print_progress),
            )?;
            finish(&summary)
        }
        Cmd::File {
            path,
            insert_unmatched,
            ..
        } => {
            let activities = activity_file(&settings)?;
            let report = if insert_unmatched {
                ingest::single_file(&path, activities, &mut db, &session, &mut InsertUnmatched)?
            } else {
                let mut prompt = PromptResolver::new(io::stdin().lock(), io::stdout());
                ingest::single_file(&path, activities, &mut db, &session, &mut prompt)?
            };
            println!(
                "{}\t{}\t{}",
                report.file,
                report.outcome.as_str(),
                report.start.as_deref().unwrap_or("-")
            );
            Ok(())
        }
        Cmd::Unparsed { reconcile, .. } => {
            let source = utils::open_source(sensor_source(&settings)?)?;
            let found = ingest::find_unparsed(source.dir(), &db, Hooks::new())?;
            println!("Sensor files:   {}", found.total);
            println!("In database:    {}", found.parsed_count);
            println!("Not imported:   {}", found.unparsed.len());
            for path in &found.unparsed {
                println!("  {}", utils::file_label(path));
            }
            if !reconcile || found.unparsed.is_empty() {
                return Ok(());
            }

            let activities = activity_file(&settings)?;
            let mut prompt = PromptResolver::new(io::stdin().lock(), io::stdout());
            let summary = run_reconcile(
                &found.unparsed,
                activities,
                &mut db,
                &session,
                &mut prompt,
            )?;
            finish(&summary)
        }
        Cmd::Runs {
            from,
            to,
            keyword,
            page,
            page_size,
            id,
        } => {
            if let Some(id) = id {
                return print_run(&db, id, &session);
            }
            let mut filter = RunFilter {
                start: from.and_then(|d| d.and_hms_opt(0, 0, 0)).map(|d| d.and_utc()),
                end: to.and_then(|d| d.and_hms_opt(23, 59, 59)).map(|d| d.and_utc()),
                keyword: None,
            };
            if let Some(kw) = keyword.as_deref() {
                filter = filter.with_keyword(kw);
            }

            let rows = if let Some(page) = page {
                let mut pager = OffsetPager::load(db.conn(), &filter, page_size)?;
                pager.go_to(page);
                println!("page {} of {} ({} runs)", pager.page(), pager.pages(), pager.total);
                pager.fetch(db.conn(), &filter)?
            } else {
                query::fetch_all(db.conn(), &filter)?
            };
            for r in rows {
                println!(
                    "{}\t{}\t{}\t{}\t{:.2} km\t{}",
                    r.run_id,
                    report::local_start(&r, session.tz).format("%Y-%m-%d %H:%M"),
                    r.workout_name,
                    r.workout_type.as_deref().unwrap_or("-"),
                    r.distance_m.unwrap_or(0.0) / 1000.0,
                    format_seconds(r.duration_sec),
                );
            }
            Ok(())
        }
        Cmd::Report {
            window,
            weeks,
            anchor,
            from,
            to,
            summary,
        } => {
            let anchor =
                anchor.unwrap_or_else(|| Local::now().with_timezone(&session.tz).date_naive());
            let window = match (window, from, to) {
                (WindowKind::Calendar, ..) => ReportWindow::Calendar { weeks, anchor },
                (WindowKind::Rolling, ..) => ReportWindow::Rolling { weeks, anchor },
                (WindowKind::Custom, Some(start), Some(end)) => ReportWindow::Custom { start, end },
                (WindowKind::Custom, ..) => bail!("--window custom needs --from and --to"),
            };

            if summary {
                let (bounds, totals) = report::window_summary(db.conn(), session.tz, &window)?;
                println!("{}", bounds.label);
                println!("{}", totals_line(&totals));
                return Ok(());
            }

            let weekly = report::weekly_report(db.conn(), session.tz, &window)?;
            println!("{}", weekly.window.label);
            if weekly.weeks.is_empty() {
                println!("no runs");
            }
            for w in &weekly.weeks {
                println!("{}\t{}", w.week_start.format("%Y-%m-%d"), totals_line(&w.totals));
            }
            Ok(())
        }
        Cmd::Reset { yes } => {
            let answer = if yes {
                "yes".to_string()
            } else {
                cli::confirm_reset(&mut io::stdin().lock(), &mut io::stdout())?
            };
            let done = db.reset(&answer)?;
            println!(
                "deleted {} runs, {} workouts, {} samples",
                done.runs, done.workouts, done.metrics
            );
            Ok(())
        }
    }
}

fn sensor_source(settings: &Settings) -> Result<&Path> {
    settings
        .sensor_dir
        .as_deref()
        .context("No sensor source given and none remembered (pass SOURCE, optionally with --remember)")
}

fn activity_file(settings: &Settings) -> Result<&Path> {
    settings
        .activity_file
        .as_deref()
        .context("No activity log given and none remembered (pass --activities)")
}

fn run_reconcile(
    files: &[PathBuf],
    activities: &Path,
    db: &mut Database,
    session: &Session,
    resolver: &mut dyn Resolver,
) -> Result<ImportSummary> {
    ingest::reconcile(
        files,
        activities,
        db,
        session,
        resolver,
        Hooks::new().on_progress(print_progress),
    )
}

fn print_progress(ev: &ProgressEvent<'_>) {
    match ev {
        ProgressEvent::FileFinished { report } => println!(
            "{}\t{}\t{}\t{}",
            report.file,
            report.outcome.as_str(),
            report.workout_name.as_deref().unwrap_or("-"),
            report
                .distance_m
                .map_or_else(|| "-".to_string(), |m| format!("{:.2} km", m / 1000.0)),
        ),
        ProgressEvent::Notice { file, message } => eprintln!("{file}: {message}"),
        _ => {}
    }
}

fn finish(summary: &ImportSummary) -> Result<()> {
    println!(
        "{} files: {} imported, {} skipped, {} not attempted",
        summary.files_total, summary.parsed, summary.skipped, summary.not_attempted
    );
    if let Some(err) = &summary.aborted {
        bail!("import stopped: {err}");
    }
    Ok(())
}

fn totals_line(t: &Totals) -> String {
    let pace = if t.distance_km > 0.0 {
        #[allow(clippy::cast_precision_loss)]
        let secs = t.duration_sec as f64;
        format_pace(secs / t.distance_km)
    } else {
        String::new()
    };
    format!(
        "{} runs\t{:.2} km\t{}\t{}\tpower {}\thr {}",
        t.runs,
        t.distance_km,
        format_seconds(t.duration_sec),
        pace,
        t.avg_power.map_or_else(|| "-".into(), |p| format!("{p:.1}")),
        t.avg_hr.map_or_else(|| "-".into(), |h| format!("{h:.0}")),
    )
}

fn print_run(db: &Database, id: i64, session: &Session) -> Result<()> {
    let Some(detail) = report::run_detail(db.conn(), id)? else {
        bail!("No run with id {id}");
    };
    let run = &detail.run;
    let fmt = |v: Option<f64>| v.map_or_else(|| "-".to_string(), |v| format!("{v:.1}"));
    println!("run {}: {}", run.run_id, run.workout_name);
    println!("  type:       {}", run.workout_type.as_deref().unwrap_or("-"));
    println!(
        "  start:      {}",
        report::local_start(run, session.tz).format("%Y-%m-%d %H:%M:%S %Z")
    );
    println!("  duration:   {}", format_seconds(run.duration_sec));
    println!("  distance:   {:.2} km", run.distance_m.unwrap_or(0.0) / 1000.0);
    println!("  avg power:  {}", fmt(run.avg_power));
    println!("  avg hr:     {}", run.avg_hr.map_or_else(|| "-".into(), |h| h.to_string()));
    println!("  ground ms:  {}", fmt(detail.avg_ground_ms));
    println!("  stiffness:  {}", fmt(detail.avg_stiffness));
    println!("  cadence:    {}", fmt(detail.avg_cadence));
    println!("  vert. osc.: {}", fmt(detail.avg_vertical_oscillation));
    println!("  samples:    {}", detail.samples.len());
    if let Some(pace) = detail.pace().last().copied().flatten() {
        println!("  pace:       {}", format_pace(pace));
    }
    Ok(())
}
