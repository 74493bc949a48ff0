//! Read access to stored runs: keyset pages for scrolling, offset pages for
//! tables that show "page N of M".

use crate::timeutil::{DB_DATETIME_FMT, parse_db_datetime};
use crate::types::{RunRow, StoredSample};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};

pub const DEFAULT_PAGE_SIZE: usize = 15;

const BASE_SELECT: &str = r"
    SELECT
      r.id, r.datetime, w.workout_name, wt.name,
      r.distance_m, r.duration_sec, r.avg_power, r.avg_hr
    FROM runs r
    JOIN workouts w ON r.workout_id = w.id
    LEFT JOIN workout_types wt ON w.workout_type_id = wt.id
";

const ORDER: &str = " ORDER BY r.datetime, r.id";

/// Filter applied before any pagination. Bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunFilter {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// Substring of the workout name or type, case-insensitive.
    pub keyword: Option<String>,
}

impl RunFilter {
    /// Whole UTC days from `start` through `end`.
    pub fn between_dates(start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            start: start.and_hms_opt(0, 0, 0).map(|d| d.and_utc()),
            end: end.and_hms_opt(23, 59, 59).map(|d| d.and_utc()),
            keyword: None,
        }
    }

    #[must_use]
    pub fn with_keyword(mut self, keyword: &str) -> Self {
        let kw = keyword.trim();
        self.keyword = (!kw.is_empty()).then(|| kw.to_string());
        self
    }

    fn where_clause(&self) -> (Vec<String>, Vec<Value>) {
        let mut clauses = Vec::new();
        let mut params = Vec::new();
        if let Some(start) = self.start {
            clauses.push("r.datetime >= ?".to_string());
            params.push(Value::Text(start.format(DB_DATETIME_FMT).to_string()));
        }
        if let Some(end) = self.end {
            clauses.push("r.datetime <= ?".to_string());
            params.push(Value::Text(end.format(DB_DATETIME_FMT).to_string()));
        }
        if let Some(kw) = &self.keyword {
            clauses.push(
                r"(w.workout_name LIKE ? ESCAPE '\' OR wt.name LIKE ? ESCAPE '\')".to_string(),
            );
            let pattern = format!("%{}%", escape_like(kw));
            params.push(Value::Text(pattern.clone()));
            params.push(Value::Text(pattern));
        }
        (clauses, params)
    }
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn datetime_at(r: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = r.get(idx)?;
    parse_db_datetime(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("bad datetime {raw:?}").into(),
        )
    })
}

fn map_run(r: &Row<'_>) -> rusqlite::Result<RunRow> {
    Ok(RunRow {
        run_id: r.get(0)?,
        datetime: datetime_at(r, 1)?,
        workout_name: r.get(2)?,
        workout_type: r.get(3)?,
        distance_m: r.get(4)?,
        duration_sec: r.get(5)?,
        avg_power: r.get(6)?,
        avg_hr: r.get(7)?,
    })
}

fn select_runs(conn: &Connection, sql: &str, params: Vec<Value>) -> Result<Vec<RunRow>> {
    let mut stmt = conn.prepare(sql).context("Preparing run query")?;
    let rows = stmt
        .query_map(params_from_iter(params), map_run)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("Reading runs")?;
    Ok(rows)
}

/// Position after the last row of a keyset page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub datetime: String,
    pub id: i64,
}

impl Cursor {
    fn after(row: &RunRow) -> Self {
        Self {
            datetime: row.datetime.format(DB_DATETIME_FMT).to_string(),
            id: row.run_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct KeysetPage {
    pub rows: Vec<RunRow>,
    /// `None` on the last page.
    pub next: Option<Cursor>,
}

/// One page ordered by `(datetime, id)`, starting after `after`.
///
/// `page_size == None` returns every matching row.
pub fn fetch_page(
    conn: &Connection,
    filter: &RunFilter,
    after: Option<&Cursor>,
    page_size: Option<usize>,
) -> Result<KeysetPage> {
    let (mut clauses, mut params) = filter.where_clause();

    let Some(size) = page_size.filter(|n| *n > 0) else {
        let sql = format!("{BASE_SELECT}{}{ORDER}", join_where(&clauses));
        return Ok(KeysetPage {
            rows: select_runs(conn, &sql, params)?,
            next: None,
        });
    };

    if let Some(c) = after {
        clauses.push("(r.datetime > ? OR (r.datetime = ? AND r.id > ?))".to_string());
        params.push(Value::Text(c.datetime.clone()));
        params.push(Value::Text(c.datetime.clone()));
        params.push(Value::Integer(c.id));
    }
    // One extra row tells us whether another page exists.
    params.push(Value::Integer(to_i64(size + 1)));

    let sql = format!("{BASE_SELECT}{}{ORDER} LIMIT ?", join_where(&clauses));
    let mut rows = select_runs(conn, &sql, params)?;

    let next = if rows.len() > size {
        rows.truncate(size);
        rows.last().map(Cursor::after)
    } else {
        None
    };
    Ok(KeysetPage { rows, next })
}

/// Every run matching `filter`, oldest first.
pub fn fetch_all(conn: &Connection, filter: &RunFilter) -> Result<Vec<RunRow>> {
    Ok(fetch_page(conn, filter, None, None)?.rows)
}

fn join_where(clauses: &[String]) -> String {
    if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    }
}

fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Start cursors of the pages visited so far; the top is the current page.
#[derive(Debug, Clone)]
pub struct CursorStack {
    starts: Vec<Option<Cursor>>,
}

impl Default for CursorStack {
    fn default() -> Self {
        Self { starts: vec![None] }
    }
}

impl CursorStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cursor to fetch the current page with.
    pub fn current(&self) -> Option<&Cursor> {
        self.starts.last().and_then(Option::as_ref)
    }

    /// 1-based.
    pub fn page_number(&self) -> usize {
        self.starts.len()
    }

    pub fn forward(&mut self, next: Cursor) {
        self.starts.push(Some(next));
    }

    /// Step back one page; false when already on the first.
    pub fn back(&mut self) -> bool {
        if self.starts.len() > 1 {
            self.starts.pop();
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.starts.truncate(1);
    }
}

pub fn count_runs(conn: &Connection, filter: &RunFilter) -> Result<usize> {
    let (clauses, params) = filter.where_clause();
    let sql = format!("SELECT COUNT(*) FROM ({BASE_SELECT}{})", join_where(&clauses));
    let n: i64 = conn
        .query_row(&sql, params_from_iter(params), |r| r.get(0))
        .context("Counting runs")?;
    Ok(usize::try_from(n).unwrap_or(0))
}

/// Rows of 1-based `page`. Pages past the end are empty.
pub fn fetch_offset_page(
    conn: &Connection,
    filter: &RunFilter,
    page: usize,
    page_size: usize,
) -> Result<Vec<RunRow>> {
    let (clauses, mut params) = filter.where_clause();
    let size = page_size.max(1);
    let offset = page.saturating_sub(1).saturating_mul(size);
    params.push(Value::Integer(to_i64(size)));
    params.push(Value::Integer(to_i64(offset)));

    let sql = format!(
        "{BASE_SELECT}{}{ORDER} LIMIT ? OFFSET ?",
        join_where(&clauses)
    );
    select_runs(conn, &sql, params)
}

/// Page arithmetic for offset pagination over a known total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetPager {
    pub total: usize,
    pub page_size: usize,
    page: usize,
}

impl OffsetPager {
    pub fn new(total: usize, page_size: usize) -> Self {
        Self {
            total,
            page_size: page_size.max(1),
            page: 1,
        }
    }

    pub fn load(conn: &Connection, filter: &RunFilter, page_size: usize) -> Result<Self> {
        Ok(Self::new(count_runs(conn, filter)?, page_size))
    }

    /// At least one, so an empty result still shows "page 1 of 1".
    pub const fn pages(&self) -> usize {
        if self.total == 0 {
            1
        } else {
            self.total.div_ceil(self.page_size)
        }
    }

    pub const fn page(&self) -> usize {
        self.page
    }

    pub fn go_to(&mut self, page: usize) -> usize {
        self.page = page.clamp(1, self.pages());
        self.page
    }

    pub fn next(&mut self) -> usize {
        self.go_to(self.page + 1)
    }

    pub fn prev(&mut self) -> usize {
        self.go_to(self.page.saturating_sub(1))
    }

    pub fn fetch(&self, conn: &Connection, filter: &RunFilter) -> Result<Vec<RunRow>> {
        fetch_offset_page(conn, filter, self.page, self.page_size)
    }
}

pub fn fetch_run(conn: &Connection, run_id: i64) -> Result<Option<RunRow>> {
    let sql = format!("{BASE_SELECT} WHERE r.id = ?1");
    conn.query_row(&sql, [run_id], map_run)
        .optional()
        .with_context(|| format!("Reading run {run_id}"))
}

/// Metric samples of one run, in time order.
pub fn fetch_samples(conn: &Connection, run_id: i64) -> Result<Vec<StoredSample>> {
    let mut stmt = conn.prepare(
        r"
        SELECT datetime, power, distance_m, ground_time, stiffness, cadence, vertical_oscillation
        FROM metrics
        WHERE run_id = ?1
        ORDER BY datetime, id
        ",
    )?;
    let samples = stmt
        .query_map(params![run_id], |r| {
            Ok(StoredSample {
                timestamp: datetime_at(r, 0)?,
                power: r.get(1)?,
                distance_m: r.get(2)?,
                ground_ms: r.get(3)?,
                stiffness: r.get(4)?,
                cadence: r.get(5)?,
                vertical_oscillation: r.get(6)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()
        .with_context(|| format!("Reading samples of run {run_id}"))?;
    Ok(samples)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::database::Database;
    use crate::types::{FullRun, MetricRow};
    use chrono::{Duration, TimeZone};

    pub(crate) fn seed(db: &mut Database, runs: &[(DateTime<Utc>, &str, &str, f64)]) {
        for (start, name, kind, meters) in runs {
            db.insert_full_run(&FullRun {
                workout_name: (*name).to_string(),
                workout_type: (*kind).to_string(),
                notes: String::new(),
                start: *start,
                duration_sec: 1800,
                avg_power: 3.0,
                distance_m: *meters,
                avg_hr: Some(150),
                samples: vec![
                    MetricRow {
                        timestamp: Some(*start + Duration::seconds(1)),
                        power: Some(3.0),
                        distance_m: Some(3.0),
                        ground_ms: None,
                        stiffness: None,
                        cadence: None,
                        vertical_oscillation: None,
                    },
                    MetricRow {
                        timestamp: Some(*start),
                        power: Some(2.9),
                        distance_m: Some(0.0),
                        ground_ms: None,
                        stiffness: None,
                        cadence: None,
                        vertical_oscillation: None,
                    },
                ],
            })
            .unwrap();
        }
    }

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, d, 6, 0, 0).unwrap()
    }

    fn db_with(n: u32) -> Database {
        let mut db = Database::open_in_memory().unwrap();
        let runs: Vec<_> = (1..=n)
            .map(|d| (day(d), if d % 2 == 0 { "Tempo 5k" } else { "Easy 8k" }, "Other", 5000.0))
            .collect();
        seed(&mut db, &runs);
        db
    }

    #[test]
    fn keyset_walks_forward_and_back() {
        let db = db_with(5);
        let filter = RunFilter::default();
        let mut stack = CursorStack::new();

        let p1 = fetch_page(db.conn(), &filter, stack.current(), Some(2)).unwrap();
        assert_eq!(p1.rows.len(), 2);
        stack.forward(p1.next.clone().unwrap());

        let p2 = fetch_page(db.conn(), &filter, stack.current(), Some(2)).unwrap();
        assert_eq!(p2.rows[0].datetime, day(3));
        stack.forward(p2.next.clone().unwrap());

        let p3 = fetch_page(db.conn(), &filter, stack.current(), Some(2)).unwrap();
        assert_eq!(p3.rows.len(), 1);
        assert!(p3.next.is_none());
        assert_eq!(stack.page_number(), 3);

        assert!(stack.back());
        let again = fetch_page(db.conn(), &filter, stack.current(), Some(2)).unwrap();
        assert_eq!(again.rows[0].run_id, p2.rows[0].run_id);
        assert!(stack.back());
        assert!(!stack.back());
    }

    #[test]
    fn exact_multiple_has_no_next_page() {
        let db = db_with(4);
        let p1 = fetch_page(db.conn(), &RunFilter::default(), None, Some(4)).unwrap();
        assert_eq!(p1.rows.len(), 4);
        assert!(p1.next.is_none());
    }

    #[test]
    fn no_page_size_returns_everything() {
        let db = db_with(5);
        let page = fetch_page(db.conn(), &RunFilter::default(), None, None).unwrap();
        assert_eq!(page.rows.len(), 5);
        assert!(page.next.is_none());
    }

    #[test]
    fn filters_by_date_and_keyword() {
        let db = db_with(6);
        let june = |d| NaiveDate::from_ymd_opt(2024, 6, d).unwrap();
        let f = RunFilter::between_dates(june(2), june(4));
        assert_eq!(count_runs(db.conn(), &f).unwrap(), 3);

        let f = f.with_keyword("TEMPO");
        let rows = fetch_all(db.conn(), &f).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.workout_name == "Tempo 5k"));

        let by_type = RunFilter::default().with_keyword("other");
        assert_eq!(count_runs(db.conn(), &by_type).unwrap(), 6);
    }

    #[test]
    fn like_wildcards_are_literal() {
        let mut db = Database::open_in_memory().unwrap();
        seed(
            &mut db,
            &[(day(1), "100% effort", "Race", 1.0), (day(2), "100 easy", "Easy Run", 1.0)],
        );
        let f = RunFilter::default().with_keyword("100%");
        assert_eq!(count_runs(db.conn(), &f).unwrap(), 1);
        let f = RunFilter::default().with_keyword("_");
        assert_eq!(count_runs(db.conn(), &f).unwrap(), 0);
    }

    #[test]
    fn offset_pager_clamps() {
        let db = db_with(7);
        let mut pager = OffsetPager::load(db.conn(), &RunFilter::default(), 3).unwrap();
        assert_eq!(pager.pages(), 3);
        assert_eq!(pager.go_to(9), 3);
        assert_eq!(pager.fetch(db.conn(), &RunFilter::default()).unwrap().len(), 1);
        assert_eq!(pager.prev(), 2);
        assert_eq!(pager.go_to(0), 1);
        assert_eq!(pager.prev(), 1);

        assert_eq!(OffsetPager::new(0, 15).pages(), 1);
    }

    #[test]
    fn single_run_and_samples() {
        let db = db_with(1);
        let run = fetch_run(db.conn(), 1).unwrap().unwrap();
        assert_eq!(run.workout_type.as_deref(), Some("Other"));
        assert_eq!(run.avg_hr, Some(150));
        assert!(fetch_run(db.conn(), 99).unwrap().is_none());

        let samples = fetch_samples(db.conn(), 1).unwrap();
        assert_eq!(samples.len(), 2);
        assert!(samples[0].timestamp < samples[1].timestamp);
    }
}
