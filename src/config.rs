use crate::timeutil::{default_tolerance, resolve_tz};
use anyhow::{Context, Result};
use chrono::Duration;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_ENV: &str = "STRIDELOG_CONFIG";
const CONFIG_FILE: &str = "settings.json";
const DB_FILE: &str = "runs.db";

/// Paths and defaults remembered between invocations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub sensor_dir: Option<PathBuf>,
    pub activity_file: Option<PathBuf>,
    pub timezone: Option<String>,
    pub database: Option<PathBuf>,
}

impl Settings {
    /// Read settings; a missing file gives defaults, a broken one too (with a warning).
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading settings: {}", path.display()))?;
        match serde_json::from_str(&text) {
            Ok(s) => Ok(s),
            Err(e) => {
                tracing::warn!(path = %path.display(), err = %e, "could not parse settings, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Atomic write: temp file next to the target, then rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating dir: {}", parent.display()))?;
        }
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(self).context("serializing settings")?;
        fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("replacing settings: {}", path.display()))?;
        tracing::debug!(path = %path.display(), "settings saved");
        Ok(())
    }

    /// Fill unset fields from `other`.
    #[must_use]
    pub fn or(self, other: Self) -> Self {
        Self {
            sensor_dir: self.sensor_dir.or(other.sensor_dir),
            activity_file: self.activity_file.or(other.activity_file),
            timezone: self.timezone.or(other.timezone),
            database: self.database.or(other.database),
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.database
            .clone()
            .unwrap_or_else(|| config_dir().join(DB_FILE))
    }

    pub fn timezone_name(&self) -> String {
        self.timezone
            .clone()
            .unwrap_or_else(|| crate::timeutil::host_tz().name().to_string())
    }
}

fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("stridelog")
}

/// `$STRIDELOG_CONFIG`, else `<config dir>/stridelog/settings.json`.
pub fn settings_path() -> PathBuf {
    std::env::var_os(CONFIG_ENV)
        .map_or_else(|| config_dir().join(CONFIG_FILE), PathBuf::from)
}

/// Read-only context for one import session: which zone the activity log
/// is read in and how far apart two starts may be to count as the same run.
#[derive(Debug, Clone)]
pub struct Session {
    pub tz_name: String,
    pub tz: Tz,
    pub tolerance: Duration,
}

impl Session {
    pub fn new(tz_name: &str) -> Self {
        Self {
            tz_name: tz_name.to_string(),
            tz: resolve_tz(tz_name),
            tolerance: default_tolerance(),
        }
    }

    #[must_use]
    pub fn with_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = tolerance;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let s = Settings::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(s, Settings::default());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("settings.json");
        let s = Settings {
            sensor_dir: Some(PathBuf::from("/data/stryd")),
            activity_file: Some(PathBuf::from("/data/Activities.csv")),
            timezone: Some("Europe/Athens".into()),
            database: None,
        };
        s.save(&path).unwrap();
        assert_eq!(Settings::load(&path).unwrap(), s);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn broken_json_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(Settings::load(&path).unwrap(), Settings::default());
    }

    #[test]
    fn flags_override_saved_values() {
        let saved = Settings {
            timezone: Some("UTC".into()),
            sensor_dir: Some(PathBuf::from("/old")),
            ..Settings::default()
        };
        let flags = Settings {
            sensor_dir: Some(PathBuf::from("/new")),
            ..Settings::default()
        };
        let merged = flags.or(saved);
        assert_eq!(merged.sensor_dir, Some(PathBuf::from("/new")));
        assert_eq!(merged.timezone.as_deref(), Some("UTC"));
    }

    #[test]
    fn session_resolves_zone() {
        let s = Session::new("Europe/Athens").with_tolerance(Duration::seconds(90));
        assert_eq!(s.tz.name(), "Europe/Athens");
        assert_eq!(s.tolerance, Duration::seconds(90));
    }
}
