use crate::correlate::{ActivityLog, Correlation, correlate_at};
use crate::error::ImportResult;
use crate::sensor::{NormalizedRun, normalize_in};
use crate::table::Table;
use crate::timeutil::{default_tolerance, resolve_tz};
use crate::types::{FullRun, MetricRow};
use crate::utils::format_duration;
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use once_cell::sync::Lazy;
use regex::Regex;

pub const UNKNOWN_WORKOUT: &str = "Unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkoutCategory {
    EasyRun,
    LongRun,
    Threshold,
    Vo2Max,
    TimeTrial,
    Race,
    Other,
}

impl WorkoutCategory {
    pub const fn name(self) -> &'static str {
        match self {
            Self::EasyRun => "Easy Run",
            Self::LongRun => "Long Run",
            Self::Threshold => "Threshold",
            Self::Vo2Max => "VO2 Max",
            Self::TimeTrial => "Time Trial",
            Self::Race => "Race",
            Self::Other => "Other",
        }
    }
}

// Evaluated top to bottom, first hit wins.
static RULES: Lazy<Vec<(Regex, WorkoutCategory)>> = Lazy::new(|| {
    [
        (r"\b(easy|ez|recovery)\b", WorkoutCategory::EasyRun),
        (r"\blong\b", WorkoutCategory::LongRun),
        (r"threshold|tempo|\bintervals?\b", WorkoutCategory::Threshold),
        (r"vo2", WorkoutCategory::Vo2Max),
        (r"time[\s-]?trial|\btt\b|\btest\b", WorkoutCategory::TimeTrial),
        (r"\brac(e|es|ing)\b", WorkoutCategory::Race),
    ]
    .into_iter()
    .map(|(pat, cat)| {
        let re = Regex::new(&format!("(?i){pat}")).expect("workout rule regex");
        (re, cat)
    })
    .collect()
});

pub fn classify(title: &str) -> WorkoutCategory {
    let hit = RULES
        .iter()
        .find(|(re, _)| re.is_match(title))
        .map(|(_, cat)| *cat);

    hit.unwrap_or_else(|| {
        tracing::warn!(title, "workout title matches no category, using Other");
        WorkoutCategory::Other
    })
}

/// One sensor file, normalized and correlated, with its summary figures.
#[derive(Debug, Clone)]
pub struct ProcessedRun {
    pub label: String,
    pub run: NormalizedRun,
    pub correlation: Correlation,
    pub workout_name: String,
    pub category: WorkoutCategory,
    pub duration: Duration,
    pub duration_str: String,
    pub avg_power: f64,
    pub avg_hr: Option<i64>,
    pub total_distance_m: f64,
}

impl ProcessedRun {
    pub const fn is_matched(&self) -> bool {
        matches!(self.correlation, Correlation::Matched(_))
    }

    pub fn start_utc(&self) -> DateTime<Utc> {
        self.run.start_utc()
    }

    pub fn to_full_run(&self, notes: &str) -> FullRun {
        FullRun {
            workout_name: self.workout_name.clone(),
            workout_type: self.category.name().to_string(),
            notes: notes.to_string(),
            start: self.start_utc(),
            duration_sec: self.duration.num_seconds(),
            avg_power: self.avg_power,
            distance_m: self.total_distance_m,
            avg_hr: self.avg_hr,
            samples: self.run.samples().iter().map(MetricRow::from).collect(),
        }
    }
}

/// Normalize, correlate and summarise one sensor table with the default tolerance.
pub fn process(
    sensor: &Table,
    log: &ActivityLog,
    tz_name: &str,
    label: &str,
) -> ImportResult<ProcessedRun> {
    process_with(sensor, log, tz_name, label, default_tolerance())
}

pub fn process_with(
    sensor: &Table,
    log: &ActivityLog,
    tz_name: &str,
    label: &str,
    tolerance: Duration,
) -> ImportResult<ProcessedRun> {
    process_in(sensor, log, resolve_tz(tz_name), label, tolerance)
}

/// [`process_with`] for an already resolved zone.
pub fn process_in(
    sensor: &Table,
    log: &ActivityLog,
    tz: Tz,
    label: &str,
    tolerance: Duration,
) -> ImportResult<ProcessedRun> {
    tracing::debug!(file = label, rows = sensor.len(), "loaded sensor rows");

    let run = normalize_in(sensor, tz)?;
    let correlation = correlate_at(run.start_utc(), log, tz, tolerance);

    let (workout_name, avg_hr) = match &correlation {
        Correlation::Matched(m) => {
            let name = m
                .title
                .clone()
                .unwrap_or_else(|| UNKNOWN_WORKOUT.to_string());
            tracing::info!(file = label, workout = %name, at = %m.start_utc, "activity match found");
            #[allow(clippy::cast_possible_truncation)]
            let hr = m.avg_hr.map(|hr| hr.round() as i64);
            (name, hr)
        }
        Correlation::NoMatch(_) => {
            tracing::info!(file = label, "no activity match within tolerance");
            (UNKNOWN_WORKOUT.to_string(), None)
        }
    };

    let duration = run.duration();
    let duration_str = format_duration(duration);
    tracing::info!(file = label, duration = %duration_str, "run duration");

    Ok(ProcessedRun {
        label: label.to_string(),
        category: classify(&workout_name),
        avg_power: run.avg_power(),
        total_distance_m: run.total_distance_m(),
        duration,
        duration_str,
        avg_hr,
        workout_name,
        correlation,
        run,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_rules_in_priority_order() {
        assert_eq!(classify("Easy 10k"), WorkoutCategory::EasyRun);
        assert_eq!(classify("EZ shakeout"), WorkoutCategory::EasyRun);
        assert_eq!(classify("Long easy run"), WorkoutCategory::EasyRun);
        assert_eq!(classify("Sunday long run"), WorkoutCategory::LongRun);
        assert_eq!(classify("Threshold 3x10'"), WorkoutCategory::Threshold);
        assert_eq!(classify("VO2 max 5x3'"), WorkoutCategory::Vo2Max);
        assert_eq!(classify("vo2 session"), WorkoutCategory::Vo2Max);
        assert_eq!(classify("VO2max intervals"), WorkoutCategory::Threshold);
        assert_eq!(WorkoutCategory::Vo2Max.name(), "VO2 Max");
        assert_eq!(classify("5k time trial"), WorkoutCategory::TimeTrial);
        assert_eq!(classify("CP test"), WorkoutCategory::TimeTrial);
        assert_eq!(classify("Half marathon race"), WorkoutCategory::Race);
        assert_eq!(classify("Unknown"), WorkoutCategory::Other);
        assert_eq!(classify("Breezy jog"), WorkoutCategory::Other);
    }

    fn sensor() -> Table {
        Table::new(
            vec![
                "Timestamp".into(),
                "Stryd Speed (m/s)".into(),
                "Power (w/kg)".into(),
            ],
            vec![
                vec!["1717218000".into(), "3.0".into(), "3.0".into()],
                vec!["1717218001".into(), "3.0".into(), "4.0".into()],
                vec!["1717218061".into(), "3.0".into(), String::new()],
            ],
        )
    }

    fn activities(date: &str) -> ActivityLog {
        ActivityLog::from_table(Table::new(
            vec!["Date".into(), "Title".into(), "Average Heart Rate".into()],
            vec![vec![date.into(), "Threshold session".into(), "151.6".into()]],
        ))
        .unwrap()
    }

    #[test]
    fn matched_run_summary() {
        let p = process(&sensor(), &activities("2024-06-01 07:00:30"), "Europe/Berlin", "a.csv").unwrap();
        assert!(p.is_matched());
        assert_eq!(p.workout_name, "Threshold session");
        assert_eq!(p.category, WorkoutCategory::Threshold);
        assert_eq!(p.avg_hr, Some(152));
        assert_eq!(p.duration, Duration::seconds(61));
        assert_eq!(p.duration_str, "00:01:01");
        assert!((p.avg_power - 3.5).abs() < 1e-9);
        assert!((p.total_distance_m - 183.0).abs() < 1e-9);
    }

    #[test]
    fn unmatched_run_is_unknown() {
        let p = process(&sensor(), &activities("2024-06-01 09:00:00"), "Europe/Berlin", "a.csv").unwrap();
        assert!(!p.is_matched());
        assert_eq!(p.workout_name, UNKNOWN_WORKOUT);
        assert_eq!(p.category, WorkoutCategory::Other);
        assert_eq!(p.avg_hr, None);

        let full = p.to_full_run("");
        assert_eq!(full.workout_type, "Other");
        assert_eq!(full.samples.len(), 3);
        assert_eq!(full.duration_sec, 61);
    }
}
