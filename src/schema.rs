//! Canonical column keys for the two source exports.
//!
//! The foot-pod export and the watch activity log use unrelated header
//! vocabularies, and both have changed across firmware/app versions. Each
//! source gets its own alias table; [`align`] renames whatever aliases are
//! present to the canonical key and leaves every other column alone.

use crate::dlog;
use crate::table::Table;

pub struct FieldSpec {
    pub key: &'static str,
    pub aliases: &'static [&'static str],
}

pub mod sensor {
    pub const TIMESTAMP: &str = "timestamp_s";
    pub const SPEED: &str = "speed_ms";
    pub const DISTANCE: &str = "distance_m";
    pub const POWER: &str = "power";
    pub const GROUND: &str = "ground_ms";
    pub const CADENCE: &str = "cadence";
    pub const VERTICAL_OSC: &str = "vertical_osc_cm";
    pub const STIFFNESS: &str = "stiffness";
}

pub mod activity {
    pub const DATE: &str = "date";
    pub const TITLE: &str = "title";
    pub const AVG_HR: &str = "avg_hr";
}

pub const SENSOR_FIELDS: &[FieldSpec] = &[
    FieldSpec {
        key: sensor::TIMESTAMP,
        aliases: &["Timestamp", "Unix Timestamp", "Timestamp (s)"],
    },
    FieldSpec {
        key: sensor::SPEED,
        aliases: &["Stryd Speed (m/s)", "Speed (m/s)", "Watch Speed (m/s)", "Speed"],
    },
    FieldSpec {
        key: sensor::DISTANCE,
        aliases: &[
            "Stryd Distance (meters)",
            "Distance (meters)",
            "Watch Distance (meters)",
            "Distance",
        ],
    },
    FieldSpec {
        key: sensor::POWER,
        aliases: &["Power (w/kg)", "Power (W)", "Power"],
    },
    FieldSpec {
        key: "form_power",
        aliases: &["Form Power (w/kg)", "Form Power (W)"],
    },
    FieldSpec {
        key: "air_power",
        aliases: &["Air Power (w/kg)", "Air Power (W)"],
    },
    FieldSpec {
        key: sensor::GROUND,
        aliases: &["Ground Time (ms)", "Ground Contact Time (ms)", "GCT (ms)"],
    },
    FieldSpec {
        key: sensor::CADENCE,
        aliases: &["Cadence (spm)", "Cadence"],
    },
    FieldSpec {
        key: sensor::VERTICAL_OSC,
        aliases: &["Vertical Oscillation (cm)", "Vertical Oscillation"],
    },
    FieldSpec {
        key: sensor::STIFFNESS,
        aliases: &["Stiffness", "Leg Spring Stiffness (kN/m)", "LSS (kN/m)"],
    },
    FieldSpec {
        key: "elevation_m",
        aliases: &["Stryd Elevation (m)", "Watch Elevation (m)", "Elevation (m)"],
    },
];

pub const ACTIVITY_FIELDS: &[FieldSpec] = &[
    FieldSpec {
        key: activity::DATE,
        aliases: &["Date", "Start Time", "Activity Date"],
    },
    FieldSpec {
        key: activity::TITLE,
        aliases: &["Title", "Workout Name", "Activity Name", "Name"],
    },
    FieldSpec {
        key: activity::AVG_HR,
        aliases: &[
            "Avg HR",
            "Average HR",
            "Average Heart Rate",
            "Avg. HR",
            "Avg HR (bpm)",
        ],
    },
    FieldSpec {
        key: "activity_type",
        aliases: &["Activity Type", "Type"],
    },
    FieldSpec {
        key: "distance",
        aliases: &["Distance"],
    },
];

/// Rename every recognised alias to its canonical key.
pub fn align(table: Table, spec: &[FieldSpec]) -> Table {
    align_impl(table, spec, None)
}

/// Like [`align`] but only for the listed canonical keys.
pub fn align_keys(table: Table, spec: &[FieldSpec], keys: &[&str]) -> Table {
    align_impl(table, spec, Some(keys))
}

fn align_impl(mut table: Table, spec: &[FieldSpec], keys: Option<&[&str]>) -> Table {
    for field in spec {
        if keys.is_some_and(|k| !k.contains(&field.key)) {
            continue;
        }
        if table.has_column(field.key) {
            continue;
        }

        let found = field.aliases.iter().find_map(|alias| {
            table
                .headers()
                .iter()
                .position(|h| h.trim().eq_ignore_ascii_case(alias))
        });

        if let Some(col) = found {
            dlog!(
                "align column={:?} key={}",
                table.headers()[col],
                field.key
            );
            table.rename_header(col, field.key);
        }
    }
    table
}
