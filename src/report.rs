use crate::query::{RunFilter, fetch_all, fetch_run, fetch_samples};
use crate::types::{RunRow, StoredSample};
use anyhow::{Result, bail};
use chrono::{DateTime, Datelike, Days, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use rusqlite::Connection;
use std::collections::BTreeMap;

/// Which days a report covers, in the session's zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportWindow {
    /// Completed Monday-to-Sunday weeks before the anchor's week.
    Calendar { weeks: u32, anchor: NaiveDate },
    /// `weeks * 7` days ending with the anchor day.
    Rolling { weeks: u32, anchor: NaiveDate },
    /// Inclusive dates.
    Custom { start: NaiveDate, end: NaiveDate },
}

/// Resolved window: local dates `[start, end)` and the matching UTC instants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowBounds {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub start_utc: DateTime<Utc>,
    pub end_utc: DateTime<Utc>,
    pub label: String,
}

impl WindowBounds {
    /// Last day inside the window.
    pub fn last_day(&self) -> NaiveDate {
        self.end.pred_opt().unwrap_or(self.end)
    }

    fn filter(&self) -> RunFilter {
        RunFilter {
            start: Some(self.start_utc),
            end: Some(self.end_utc - chrono::Duration::seconds(1)),
            keyword: None,
        }
    }
}

impl ReportWindow {
    pub fn bounds(&self, tz: Tz) -> Result<WindowBounds> {
        let (start, end, kind) = match *self {
            Self::Calendar { weeks, anchor } => {
                let weeks = check_weeks(weeks)?;
                let monday = anchor - Days::new(u64::from(anchor.weekday().num_days_from_monday()));
                (monday - Days::new(7 * weeks), monday, Some(("calendar", weeks)))
            }
            Self::Rolling { weeks, anchor } => {
                let weeks = check_weeks(weeks)?;
                let end = anchor + Days::new(1);
                (end - Days::new(7 * weeks), end, Some(("rolling", weeks)))
            }
            Self::Custom { start, end } => {
                if end < start {
                    bail!("Report window ends ({end}) before it starts ({start})");
                }
                (start, end + Days::new(1), None)
            }
        };

        let last = end.pred_opt().unwrap_or(end);
        let span = format!("{} - {}", start.format("%b %d"), last.format("%b %d"));
        let label = match kind {
            Some((kind, 1)) => format!("1 {kind} week ({span})"),
            Some((kind, n)) => format!("{n} {kind} weeks ({span})"),
            None => span,
        };

        Ok(WindowBounds {
            start,
            end,
            start_utc: local_midnight(tz, start),
            end_utc: local_midnight(tz, end),
            label,
        })
    }
}

fn check_weeks(weeks: u32) -> Result<u64> {
    if weeks == 0 {
        bail!("Report window needs at least one week");
    }
    Ok(u64::from(weeks))
}

/// Start of `day` in `tz`, as UTC. Midnight inside a DST gap falls back to
/// the first valid instant of that day.
fn local_midnight(tz: Tz, day: NaiveDate) -> DateTime<Utc> {
    let naive = day.and_time(chrono::NaiveTime::MIN);
    let local = tz
        .from_local_datetime(&naive)
        .earliest()
        .or_else(|| {
            let hour_later = naive + chrono::Duration::hours(1);
            tz.from_local_datetime(&hour_later).earliest()
        });
    local.map_or_else(|| naive.and_utc(), |dt| dt.with_timezone(&Utc))
}

/// Aggregate over a set of runs.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Totals {
    pub runs: usize,
    pub distance_km: f64,
    pub duration_sec: i64,
    pub avg_power: Option<f64>,
    pub avg_hr: Option<f64>,
}

#[derive(Default)]
struct Acc {
    runs: usize,
    meters: f64,
    secs: i64,
    power: Vec<f64>,
    hr: Vec<f64>,
}

impl Acc {
    fn add(&mut self, run: &RunRow) {
        self.runs += 1;
        self.meters += run.distance_m.unwrap_or(0.0);
        self.secs += run.duration_sec;
        if let Some(p) = run.avg_power {
            self.power.push(p);
        }
        if let Some(hr) = run.avg_hr {
            #[allow(clippy::cast_precision_loss)]
            self.hr.push(hr as f64);
        }
    }

    fn totals(&self) -> Totals {
        Totals {
            runs: self.runs,
            distance_km: self.meters / 1000.0,
            duration_sec: self.secs,
            avg_power: mean(&self.power),
            avg_hr: mean(&self.hr),
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeekRow {
    pub week_start: NaiveDate,
    /// Exclusive.
    pub week_end: NaiveDate,
    pub totals: Totals,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeeklyReport {
    pub window: WindowBounds,
    pub weeks: Vec<WeekRow>,
}

/// Runs in the window grouped into 7-day buckets counted from its first day.
/// Weeks without runs are left out.
pub fn weekly_report(conn: &Connection, tz: Tz, window: &ReportWindow) -> Result<WeeklyReport> {
    let bounds = window.bounds(tz)?;
    let runs = fetch_all(conn, &bounds.filter())?;
    tracing::debug!(window = %bounds.label, runs = runs.len(), "weekly report");

    let mut buckets: BTreeMap<i64, Acc> = BTreeMap::new();
    for run in &runs {
        let day = run.datetime.with_timezone(&tz).date_naive();
        let idx = (day - bounds.start).num_days().div_euclid(7);
        if idx < 0 {
            continue;
        }
        buckets.entry(idx).or_default().add(run);
    }

    let weeks = buckets
        .into_iter()
        .map(|(idx, acc)| {
            #[allow(clippy::cast_sign_loss)]
            let week_start = bounds.start + Days::new(idx as u64 * 7);
            WeekRow {
                week_start,
                week_end: week_start + Days::new(7),
                totals: acc.totals(),
            }
        })
        .collect();

    Ok(WeeklyReport {
        window: bounds,
        weeks,
    })
}

/// One aggregate for the whole window.
pub fn window_summary(
    conn: &Connection,
    tz: Tz,
    window: &ReportWindow,
) -> Result<(WindowBounds, Totals)> {
    let bounds = window.bounds(tz)?;
    let mut acc = Acc::default();
    for run in fetch_all(conn, &bounds.filter())? {
        acc.add(&run);
    }
    Ok((bounds, acc.totals()))
}

/// Seconds per km at each sample, from the start of the run.
/// `None` until the run has covered some distance.
pub fn pace_series(samples: &[StoredSample]) -> Vec<Option<f64>> {
    let Some(first) = samples.first() else {
        return Vec::new();
    };
    samples
        .iter()
        .map(|s| {
            let km = s.distance_m.unwrap_or(0.0) / 1000.0;
            if km <= 0.0 {
                return None;
            }
            #[allow(clippy::cast_precision_loss)]
            let secs = (s.timestamp - first.timestamp).num_milliseconds() as f64 / 1000.0;
            Some(secs / km)
        })
        .collect()
}

/// A stored run with its samples and per-sample averages.
#[derive(Debug, Clone, PartialEq)]
pub struct RunDetail {
    pub run: RunRow,
    pub samples: Vec<StoredSample>,
    pub avg_ground_ms: Option<f64>,
    pub avg_stiffness: Option<f64>,
    pub avg_cadence: Option<f64>,
    pub avg_vertical_oscillation: Option<f64>,
}

impl RunDetail {
    pub fn pace(&self) -> Vec<Option<f64>> {
        pace_series(&self.samples)
    }
}

pub fn run_detail(conn: &Connection, run_id: i64) -> Result<Option<RunDetail>> {
    let Some(run) = fetch_run(conn, run_id)? else {
        return Ok(None);
    };
    let samples = fetch_samples(conn, run_id)?;
    let avg = |f: fn(&StoredSample) -> Option<f64>| {
        mean(&samples.iter().filter_map(f).collect::<Vec<_>>())
    };

    Ok(Some(RunDetail {
        avg_ground_ms: avg(|s| s.ground_ms),
        avg_stiffness: avg(|s| s.stiffness),
        avg_cadence: avg(|s| s.cadence),
        avg_vertical_oscillation: avg(|s| s.vertical_oscillation),
        run,
        samples,
    }))
}

/// Timestamp of a run in the report zone, for display.
pub fn local_start(run: &RunRow, tz: Tz) -> DateTime<Tz> {
    run.datetime.with_timezone(&tz)
}
