use anyhow::{Context, Result, bail};
use chrono::Duration;
use std::collections::HashSet;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing_subscriber::{EnvFilter, fmt};
use walkdir::WalkDir;
use zip::ZipArchive;

#[macro_export]
macro_rules! dlog {
    ($($arg:tt)*) => {
        tracing::debug!($($arg)*);
    };
}

/// Initialize colorful logging.
///
/// Default level is INFO.
/// - `-v` => DEBUG
/// - `-vv` => TRACE
/// - `-q` => WARN
/// - `-qq` => ERROR
///
/// `RUST_LOG` overrides everything (e.g. `RUST_LOG=trace`).
pub fn init_logging(verbose: u8, quiet: u8) {
    let net = i16::from(verbose) - i16::from(quiet);
    let level = match net {
        i16::MIN..=-2 => "error",
        -1 => "warn",
        0 => "info",
        1 => "debug",
        2..=i16::MAX => "trace",
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,stridelog={level}")));

    let show_src = matches!(level, "debug" | "trace");

    fmt()
        .with_env_filter(filter)
        .with_ansi(true)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_target(true)
        .with_level(true)
        .with_file(show_src)
        .with_line_number(show_src)
        .compact()
        .init();
}

/// Handle that keeps a tempdir alive if we extracted a ZIP.
pub struct SourceHandle {
    dir: PathBuf,
    _tmp: Option<TempDir>,
}

impl SourceHandle {
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Accepts either:
/// - a directory holding sensor CSV exports
/// - a `.zip` of such exports
///
/// Only the CSV entries of a ZIP are extracted, flattened into one temp dir
/// whatever folders they sit in. macOS resource forks are ignored and a file
/// name seen twice keeps its first copy.
pub fn open_source(path: &Path) -> Result<SourceHandle> {
    if path.is_dir() {
        tracing::info!(path = %path.display(), "using sensor directory");
        return Ok(SourceHandle {
            dir: path.to_path_buf(),
            _tmp: None,
        });
    }

    if !has_extension(path, "zip") {
        bail!(
            "Sensor source must be a directory or a .zip file: {}",
            path.display()
        );
    }

    let zip_file = File::open(path).with_context(|| format!("opening zip: {}", path.display()))?;
    let mut zip =
        ZipArchive::new(zip_file).with_context(|| format!("reading zip: {}", path.display()))?;

    let tmp = tempfile::tempdir().context("creating tempdir for sensor zip")?;
    dlog!(
        "sensor_zip path={} tmp={} entries={}",
        path.display(),
        tmp.path().display(),
        zip.len()
    );

    let mut extracted = HashSet::new();
    for i in 0..zip.len() {
        let mut f = zip.by_index(i).context("reading zip entry")?;
        if f.is_dir() {
            continue;
        }

        // Entries escaping the archive root are refused outright.
        let Some(rel) = f.enclosed_name() else {
            tracing::warn!(name = %f.name(), "skipping unsafe zip entry path");
            continue;
        };
        if !is_csv(&rel) || is_resource_fork(&rel) {
            dlog!("sensor_zip_skip entry={}", rel.display());
            continue;
        }
        let Some(name) = rel.file_name().map(ToOwned::to_owned) else {
            continue;
        };
        if !extracted.insert(name.clone()) {
            tracing::warn!(entry = %rel.display(), "duplicate file name in zip, keeping the first");
            continue;
        }

        let out_path = tmp.path().join(&name);
        let mut out = File::create(&out_path)
            .with_context(|| format!("creating file: {}", out_path.display()))?;
        io::copy(&mut f, &mut out)
            .with_context(|| format!("extracting {} from {}", rel.display(), path.display()))?;
    }

    if extracted.is_empty() {
        bail!("ZIP holds no CSV files: {}", path.display());
    }
    tracing::info!(
        zip = %path.display(),
        files = extracted.len(),
        "sensor zip extracted"
    );

    Ok(SourceHandle {
        dir: tmp.path().to_path_buf(),
        _tmp: Some(tmp),
    })
}

fn is_resource_fork(rel: &Path) -> bool {
    rel.components().any(|c| c.as_os_str() == "__MACOSX")
        || rel
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("._"))
}

/// `*.csv` files directly inside `dir`, sorted by name.
pub fn list_csv_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.with_context(|| format!("listing {}", dir.display()))?;
        if entry.file_type().is_file() && is_csv(entry.path()) {
            out.push(entry.into_path());
        }
    }
    out.sort();
    Ok(out)
}

fn is_csv(path: &Path) -> bool {
    has_extension(path, "csv")
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .is_some_and(|s| s.eq_ignore_ascii_case(ext))
}

pub fn file_label(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned())
}

pub fn format_duration(d: Duration) -> String {
    format_seconds(d.num_seconds())
}

pub fn format_seconds(secs: i64) -> String {
    let secs = secs.unsigned_abs();
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;
    format!("{h:02}:{m:02}:{s:02}")
}

/// `m:ss/km` from seconds per kilometre; empty for non-positive input.
pub fn format_pace(sec_per_km: f64) -> String {
    if !sec_per_km.is_finite() || sec_per_km <= 0.0 {
        return String::new();
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let total = sec_per_km.round() as u64;
    format!("{}:{:02}/km", total / 60, total % 60)
}
