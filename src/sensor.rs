use crate::dlog;
use crate::error::{ImportError, ImportResult};
use crate::schema::{self, SENSOR_FIELDS, sensor};
use crate::table::{Table, parse_number};
use crate::timeutil::{epoch_to_utc, resolve_tz};
use crate::types::SensorSample;
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;

/// A sensor file after normalization: local timestamps in `tz`, sorted,
/// with distance integrated from speed. Never empty.
#[derive(Debug, Clone)]
pub struct NormalizedRun {
    tz: Tz,
    samples: Vec<SensorSample>,
}

impl NormalizedRun {
    pub const fn tz(&self) -> Tz {
        self.tz
    }

    pub fn samples(&self) -> &[SensorSample] {
        &self.samples
    }

    pub fn start_local(&self) -> DateTime<Tz> {
        self.samples[0].ts_local
    }

    pub fn start_utc(&self) -> DateTime<Utc> {
        self.start_local().with_timezone(&Utc)
    }

    pub fn end_local(&self) -> DateTime<Tz> {
        self.samples[self.samples.len() - 1].ts_local
    }

    pub fn duration(&self) -> Duration {
        self.end_local() - self.start_local()
    }

    pub fn total_distance_m(&self) -> f64 {
        self.samples[self.samples.len() - 1].distance_m
    }

    /// Mean over the samples that carry a power value; 0 when none do.
    pub fn avg_power(&self) -> f64 {
        let (sum, n) = self
            .samples
            .iter()
            .filter_map(|s| s.power)
            .fold((0.0, 0u32), |(sum, n), p| (sum + p, n + 1));
        if n == 0 { 0.0 } else { sum / f64::from(n) }
    }
}

/// Normalize a sensor table in the named zone (host zone if the name is unknown).
pub fn normalize(table: &Table, tz_name: &str) -> ImportResult<NormalizedRun> {
    normalize_in(table, resolve_tz(tz_name))
}

pub fn normalize_in(table: &Table, tz: Tz) -> ImportResult<NormalizedRun> {
    let table = schema::align(table.clone(), SENSOR_FIELDS);

    let ts_col = table
        .column(sensor::TIMESTAMP)
        .ok_or_else(|| ImportError::MissingColumn(sensor::TIMESTAMP.to_string()))?;
    let speed_col = table.column(sensor::SPEED);
    let distance_col = table.column(sensor::DISTANCE);

    if speed_col.is_none() && distance_col.is_none() {
        return Err(ImportError::MissingColumn(sensor::SPEED.to_string()));
    }

    let optional = |key: &str| table.column(key);
    let power_col = optional(sensor::POWER);
    let ground_col = optional(sensor::GROUND);
    let cadence_col = optional(sensor::CADENCE);
    let vo_col = optional(sensor::VERTICAL_OSC);
    let stiffness_col = optional(sensor::STIFFNESS);
    let num = |row: usize, col: Option<usize>| parse_number(col.and_then(|c| table.cell(row, c)));

    let mut samples = Vec::with_capacity(table.len());
    for row in 0..table.len() {
        let raw = table.cell(row, ts_col).unwrap_or_default();
        if raw.is_empty() {
            dlog!("sensor_blank_timestamp row={row}");
            continue;
        }

        let ts_utc = raw
            .parse::<f64>()
            .ok()
            .and_then(epoch_to_utc)
            .ok_or_else(|| ImportError::BadValue {
                column: sensor::TIMESTAMP.to_string(),
                row,
                value: raw.to_string(),
            })?;

        samples.push(SensorSample {
            ts_local: ts_utc.with_timezone(&tz),
            elapsed_s: 0.0,
            speed: num(row, speed_col).unwrap_or(0.0),
            distance_m: 0.0,
            power: num(row, power_col),
            ground_ms: num(row, ground_col),
            cadence: num(row, cadence_col),
            vertical_oscillation: num(row, vo_col),
            stiffness: num(row, stiffness_col),
        });
    }

    if samples.is_empty() {
        if table.is_empty() {
            return Err(ImportError::ZeroData("no samples".to_string()));
        }
        // Rows exist but none is dated: malformed, not an empty recording.
        return Err(ImportError::MissingColumn(sensor::TIMESTAMP.to_string()));
    }

    if speed_col.is_some() {
        if samples.iter().all(|s| s.speed.abs() <= 0.0) {
            return Err(ImportError::ZeroData("speed is zero for every sample".to_string()));
        }
    } else {
        let all_zero = (0..table.len()).all(|row| num(row, distance_col).unwrap_or(0.0).abs() <= 0.0);
        if all_zero {
            return Err(ImportError::ZeroData(
                "distance is zero for every sample".to_string(),
            ));
        }
        return Err(ImportError::MissingColumn(sensor::SPEED.to_string()));
    }

    samples.sort_by_key(|s| s.ts_local);
    integrate_distance(&mut samples);

    Ok(NormalizedRun { tz, samples })
}

/// Elapsed time per row (clamped at zero) and cumulative `speed x elapsed`.
fn integrate_distance(samples: &mut [SensorSample]) {
    let mut prev = None;
    let mut total = 0.0;
    for s in samples.iter_mut() {
        let elapsed = prev.map_or(0.0, |p: DateTime<Tz>| {
            #[allow(clippy::cast_precision_loss)]
            let secs = (s.ts_local - p).num_milliseconds() as f64 / 1000.0;
            secs.max(0.0)
        });
        total += s.speed * elapsed;
        s.elapsed_s = elapsed;
        s.distance_m = total;
        prev = Some(s.ts_local);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sensor_table(rows: &[(&str, &str)]) -> Table {
        Table::new(
            vec![
                "Timestamp".into(),
                "Stryd Speed (m/s)".into(),
                "Power (w/kg)".into(),
            ],
            rows.iter()
                .map(|(ts, speed)| vec![(*ts).to_string(), (*speed).to_string(), "3.0".into()])
                .collect(),
        )
    }

    #[test]
    fn integrates_speed_into_distance() {
        let t = sensor_table(&[
            ("1717218000", "3.0"),
            ("1717218001", "3.0"),
            ("1717218003", "2.5"),
        ]);
        let run = normalize(&t, "UTC").unwrap();
        let d: Vec<f64> = run.samples().iter().map(|s| s.distance_m).collect();
        assert_eq!(d, vec![0.0, 3.0, 8.0]);
        assert_eq!(run.total_distance_m(), 8.0);
        assert_eq!(run.duration(), Duration::seconds(3));
        assert!((run.avg_power() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn sorts_unordered_rows_and_stays_monotonic() {
        let t = sensor_table(&[
            ("1717218005", "2.0"),
            ("1717218000", "2.0"),
            ("1717218002", "2.0"),
            ("1717218002", "4.0"),
        ]);
        let run = normalize(&t, "UTC").unwrap();
        let ts: Vec<i64> = run.samples().iter().map(|s| s.ts_local.timestamp()).collect();
        assert_eq!(ts, vec![1_717_218_000, 1_717_218_002, 1_717_218_002, 1_717_218_005]);
        let d: Vec<f64> = run.samples().iter().map(|s| s.distance_m).collect();
        assert!(d.windows(2).all(|w| w[1] >= w[0]));
        assert!(run.samples().iter().all(|s| s.elapsed_s >= 0.0));
    }

    #[test]
    fn local_time_follows_zone() {
        let t = sensor_table(&[("1717218000", "3.0"), ("1717218001", "3.0")]);
        let run = normalize(&t, "Europe/Berlin").unwrap();
        assert_eq!(
            run.start_local().to_rfc3339(),
            "2024-06-01T07:00:00+02:00"
        );
        assert_eq!(run.start_utc().timestamp(), 1_717_218_000);
    }

    #[test]
    fn unknown_zone_does_not_fail() {
        let t = sensor_table(&[("1717218000", "3.0"), ("1717218001", "3.0")]);
        let run = normalize(&t, "Not/AZone").unwrap();
        assert_eq!(run.start_utc().timestamp(), 1_717_218_000);
    }

    #[test]
    fn all_zero_speed_is_zero_data() {
        let t = sensor_table(&[("1717218000", "0"), ("1717218001", "0.0"), ("1717218002", "")]);
        let err = normalize(&t, "UTC").unwrap_err();
        assert!(err.is_zero_data());
    }

    #[test]
    fn single_nonzero_speed_is_accepted() {
        let t = sensor_table(&[("1717218000", "0"), ("1717218001", "0.1"), ("1717218002", "0")]);
        assert!(normalize(&t, "UTC").is_ok());
    }

    #[test]
    fn distance_only_files() {
        let zero = Table::new(
            vec!["Timestamp".into(), "Distance".into()],
            vec![vec!["1717218000".into(), "0".into()]],
        );
        assert!(normalize(&zero, "UTC").unwrap_err().is_zero_data());

        let moving = Table::new(
            vec!["Timestamp".into(), "Distance".into()],
            vec![vec!["1717218000".into(), "12.5".into()]],
        );
        assert!(matches!(
            normalize(&moving, "UTC"),
            Err(ImportError::MissingColumn(c)) if c == sensor::SPEED
        ));
    }

    #[test]
    fn missing_timestamp_column() {
        let t = Table::new(vec!["Stryd Speed (m/s)".into()], vec![vec!["3".into()]]);
        assert!(matches!(
            normalize(&t, "UTC"),
            Err(ImportError::MissingColumn(c)) if c == sensor::TIMESTAMP
        ));
    }

    #[test]
    fn garbage_timestamp_fails_the_file() {
        let t = sensor_table(&[("1717218000", "3.0"), ("soon", "3.0")]);
        assert!(matches!(
            normalize(&t, "UTC"),
            Err(ImportError::BadValue { row: 1, .. })
        ));
    }

    #[test]
    fn blank_timestamps_fail_the_file() {
        let t = sensor_table(&[("", "3.0"), ("", "3.2")]);
        let err = normalize(&t, "UTC").unwrap_err();
        assert!(!err.is_zero_data());
        assert!(matches!(err, ImportError::MissingColumn(c) if c == sensor::TIMESTAMP));
    }

    #[test]
    fn empty_file_is_zero_data() {
        let t = sensor_table(&[]);
        assert!(normalize(&t, "UTC").unwrap_err().is_zero_data());
    }
}
