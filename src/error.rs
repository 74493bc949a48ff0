use std::path::PathBuf;
use thiserror::Error;

/// Failures that end the import of a single file.
///
/// These never abort a batch: the engine turns each one into a per-file
/// outcome. `ZeroData` is kept apart from the rest because callers skip it
/// quietly instead of reporting it as a failure.
#[derive(Error, Debug)]
pub enum ImportError {
    #[error("missing required column `{0}`")]
    MissingColumn(String),

    #[error("unparsable `{column}` value {value:?} on row {row}")]
    BadValue {
        column: String,
        row: usize,
        value: String,
    },

    #[error("sensor speed/distance is all zeros: {0}")]
    ZeroData(String),

    #[error("reading {}: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ImportError {
    pub const fn is_zero_data(&self) -> bool {
        matches!(self, Self::ZeroData(_))
    }
}

pub type ImportResult<T> = Result<T, ImportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_data_is_distinguishable() {
        let err = ImportError::ZeroData("run.csv".to_string());
        assert!(err.is_zero_data());
        assert!(!ImportError::MissingColumn("speed_ms".into()).is_zero_data());
    }

    #[test]
    fn error_display() {
        let err = ImportError::BadValue {
            column: "timestamp_s".into(),
            row: 3,
            value: "abc".into(),
        };
        assert_eq!(
            err.to_string(),
            "unparsable `timestamp_s` value \"abc\" on row 3"
        );
    }
}
