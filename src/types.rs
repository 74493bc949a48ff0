use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;

/// One normalized sensor row.
#[derive(Debug, Clone)]
pub struct SensorSample {
    pub ts_local: DateTime<Tz>,
    pub elapsed_s: f64,
    pub speed: f64,
    pub distance_m: f64,

    pub power: Option<f64>,
    pub ground_ms: Option<f64>,
    pub cadence: Option<f64>,
    pub vertical_oscillation: Option<f64>,
    pub stiffness: Option<f64>,
}

/// The activity-log row a sensor file was matched to.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityMatch {
    pub row: usize,
    pub title: Option<String>,
    pub avg_hr: Option<f64>,
    pub start_utc: DateTime<Utc>,
    /// Activity start minus sensor start.
    pub delta: Duration,
}

/// A metric row on its way into the database.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRow {
    pub timestamp: Option<DateTime<Utc>>,
    pub power: Option<f64>,
    pub distance_m: Option<f64>,
    pub ground_ms: Option<f64>,
    pub stiffness: Option<f64>,
    pub cadence: Option<f64>,
    pub vertical_oscillation: Option<f64>,
}

impl From<&SensorSample> for MetricRow {
    fn from(s: &SensorSample) -> Self {
        Self {
            timestamp: Some(s.ts_local.with_timezone(&Utc)),
            power: s.power,
            distance_m: Some(s.distance_m),
            ground_ms: s.ground_ms,
            stiffness: s.stiffness,
            cadence: s.cadence,
            vertical_oscillation: s.vertical_oscillation,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewRun {
    pub workout_id: i64,
    pub start: DateTime<Utc>,
    pub duration_sec: i64,
    pub avg_power: f64,
    pub distance_m: f64,
    pub avg_hr: Option<i64>,
}

/// Everything `Database::insert_full_run` needs for one run.
#[derive(Debug, Clone)]
pub struct FullRun {
    pub workout_name: String,
    pub workout_type: String,
    pub notes: String,
    pub start: DateTime<Utc>,
    pub duration_sec: i64,
    pub avg_power: f64,
    pub distance_m: f64,
    pub avg_hr: Option<i64>,
    pub samples: Vec<MetricRow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertedRun {
    pub workout_id: Option<i64>,
    pub run_id: i64,
    pub created: bool,
}

/// A stored run joined with its workout and type, as listed by queries.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRow {
    pub run_id: i64,
    pub datetime: DateTime<Utc>,
    pub workout_name: String,
    pub workout_type: Option<String>,
    pub distance_m: Option<f64>,
    pub duration_sec: i64,
    pub avg_power: Option<f64>,
    pub avg_hr: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredSample {
    pub timestamp: DateTime<Utc>,
    pub power: Option<f64>,
    pub distance_m: Option<f64>,
    pub ground_ms: Option<f64>,
    pub stiffness: Option<f64>,
    pub cadence: Option<f64>,
    pub vertical_oscillation: Option<f64>,
}
