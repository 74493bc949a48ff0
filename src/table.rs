use crate::error::{ImportError, ImportResult};
use std::io::Read;
use std::path::Path;

/// A delimited file held in memory as strings, one header row.
///
/// Both source exports are small (a few thousand rows at most), so the
/// whole file is read up front and columns are looked up by name.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self { headers, rows }
    }

    pub fn from_path(path: &Path) -> ImportResult<Self> {
        let reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(|source| ImportError::Csv {
                path: path.to_path_buf(),
                source,
            })?;
        Self::collect(reader).map_err(|source| ImportError::Csv {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_reader<R: Read>(rdr: R) -> Result<Self, csv::Error> {
        let reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(rdr);
        Self::collect(reader)
    }

    fn collect<R: Read>(mut reader: csv::Reader<R>) -> Result<Self, csv::Error> {
        let headers = reader
            .headers()?
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').to_string())
            .collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            if record.iter().all(str::is_empty) {
                continue;
            }
            rows.push(record.iter().map(str::to_string).collect());
        }

        Ok(Self { headers, rows })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column(&self, key: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == key)
    }

    pub fn has_column(&self, key: &str) -> bool {
        self.column(key).is_some()
    }

    /// Cell by row index and column position. Short rows yield `None`.
    pub fn cell(&self, row: usize, col: usize) -> Option<&str> {
        self.rows.get(row)?.get(col).map(String::as_str)
    }

    pub fn get(&self, row: usize, key: &str) -> Option<&str> {
        self.cell(row, self.column(key)?)
    }

    pub(crate) fn rename_header(&mut self, col: usize, key: &str) {
        if let Some(h) = self.headers.get_mut(col) {
            *h = key.to_string();
        }
    }
}

/// Parse a numeric cell; blanks and junk become `None`.
pub fn parse_number(raw: Option<&str>) -> Option<f64> {
    let s = raw?.trim();
    if s.is_empty() {
        return None;
    }
    s.parse::<f64>().ok().filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_headers_and_skips_blank_lines() {
        let data = "\u{feff}Timestamp, Power (w/kg)\n1717218000,3.1\n,\n1717218001,3.2\n";
        let t = Table::from_reader(data.as_bytes()).unwrap();
        assert_eq!(t.headers(), &["Timestamp", "Power (w/kg)"]);
        assert_eq!(t.len(), 2);
        assert_eq!(t.get(1, "Power (w/kg)"), Some("3.2"));
    }

    #[test]
    fn short_rows_are_tolerated() {
        let data = "a,b,c\n1,2\n";
        let t = Table::from_reader(data.as_bytes()).unwrap();
        assert_eq!(t.get(0, "b"), Some("2"));
        assert_eq!(t.get(0, "c"), None);
    }

    #[test]
    fn parse_number_handles_blanks() {
        assert_eq!(parse_number(Some(" 2.5 ")), Some(2.5));
        assert_eq!(parse_number(Some("")), None);
        assert_eq!(parse_number(Some("n/a")), None);
        assert_eq!(parse_number(None), None);
    }
}
