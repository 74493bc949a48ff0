use crate::dlog;
use crate::error::{ImportError, ImportResult};
use crate::schema::{self, ACTIVITY_FIELDS, activity};
use crate::sensor::NormalizedRun;
use crate::table::{Table, parse_number};
use crate::timeutil::{localize, parse_local_datetime, resolve_tz, suggest_timezones};
use crate::types::ActivityMatch;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use chrono_tz::Tz;
use std::path::Path;

#[derive(Debug, Clone)]
struct ActivityEntry {
    row: usize,
    local: Option<NaiveDateTime>,
    title: Option<String>,
    avg_hr: Option<f64>,
}

/// The watch activity log, parsed once and reused for every sensor file.
///
/// Dates are kept as wall-clock times: the zone they belong to is only
/// known at correlation time, and may change when the user retries.
#[derive(Debug, Clone, Default)]
pub struct ActivityLog {
    entries: Vec<ActivityEntry>,
}

impl ActivityLog {
    pub fn from_path(path: &Path) -> ImportResult<Self> {
        Self::from_table(Table::from_path(path)?)
    }

    pub fn from_table(table: Table) -> ImportResult<Self> {
        let table = schema::align(table, ACTIVITY_FIELDS);
        let date_col = table
            .column(activity::DATE)
            .ok_or_else(|| ImportError::MissingColumn(activity::DATE.to_string()))?;
        let title_col = table.column(activity::TITLE);
        let hr_col = table.column(activity::AVG_HR);

        let entries = (0..table.len())
            .map(|row| {
                let raw = table.cell(row, date_col).unwrap_or_default();
                let local = parse_local_datetime(raw);
                if local.is_none() {
                    dlog!("activity_bad_date row={row} raw={raw:?}");
                }
                ActivityEntry {
                    row,
                    local,
                    title: title_col
                        .and_then(|c| table.cell(row, c))
                        .filter(|s| !s.is_empty())
                        .map(str::to_string),
                    avg_hr: parse_number(hr_col.and_then(|c| table.cell(row, c))),
                }
            })
            .collect();

        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Closest activity that was still outside the tolerance.
#[derive(Debug, Clone, PartialEq)]
pub struct Nearest {
    pub row: usize,
    pub activity_utc: DateTime<Utc>,
    /// Activity start minus sensor start.
    pub delta: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NoMatch {
    pub sensor_utc: DateTime<Utc>,
    pub tz: Tz,
    pub nearest: Option<Nearest>,
}

impl NoMatch {
    /// Zones that would have lined the nearest activity up with the sensor.
    pub fn suggested_timezones(&self) -> Vec<String> {
        self.nearest
            .as_ref()
            .map(|n| suggest_timezones(self.tz, n.delta, &self.sensor_utc))
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Correlation {
    Matched(ActivityMatch),
    NoMatch(NoMatch),
}

impl Correlation {
    pub const fn matched(&self) -> Option<&ActivityMatch> {
        match self {
            Self::Matched(m) => Some(m),
            Self::NoMatch(_) => None,
        }
    }
}

pub fn correlate(
    run: &NormalizedRun,
    log: &ActivityLog,
    tz_name: &str,
    tolerance: Duration,
) -> Correlation {
    correlate_at(run.start_utc(), log, resolve_tz(tz_name), tolerance)
}

/// Nearest activity start to `sensor_utc`, with log dates read in `tz`.
///
/// The tolerance is inclusive. On equal distances the earlier row wins.
pub fn correlate_at(
    sensor_utc: DateTime<Utc>,
    log: &ActivityLog,
    tz: Tz,
    tolerance: Duration,
) -> Correlation {
    let nearest = log
        .entries
        .iter()
        .filter_map(|e| {
            let local = e.local.as_ref()?;
            let Some(dt) = localize(local, tz) else {
                dlog!("activity_unmappable_local row={} local={local} tz={tz}", e.row);
                return None;
            };
            let utc = dt.with_timezone(&Utc);
            Some((e, utc, utc - sensor_utc))
        })
        .min_by_key(|(_, _, delta)| delta.abs());

    match nearest {
        Some((e, activity_utc, delta)) if delta.abs() <= tolerance => {
            tracing::debug!(
                row = e.row,
                title = e.title.as_deref().unwrap_or(""),
                delta_ms = delta.num_milliseconds(),
                "activity matched"
            );
            Correlation::Matched(ActivityMatch {
                row: e.row,
                title: e.title.clone(),
                avg_hr: e.avg_hr,
                start_utc: activity_utc,
                delta,
            })
        }
        other => Correlation::NoMatch(NoMatch {
            sensor_utc,
            tz,
            nearest: other.map(|(e, activity_utc, delta)| Nearest {
                row: e.row,
                activity_utc,
                delta,
            }),
        }),
    }
}
