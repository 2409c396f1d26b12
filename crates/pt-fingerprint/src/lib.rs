#![forbid(unsafe_code)]

//! Fingerprint tables and the metric collector.
//!
//! A [`FingerprintTable`] maps a run-relative file path to whichever of
//! `checksum` / `line_count` were computed for it. The same tab-separated
//! shape is used for the current run (`<test>.stats`) and for the accepted
//! reference snapshot (`<test>.ref`).

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;

use csv::{ReaderBuilder, Trim, WriterBuilder};
use pt_types::MetricKind;
use serde::{Deserialize, Serialize};
use thiserror::Error;

macro_rules! trace_event {
    ($level:ident, $($arg:tt)+) => {
        #[cfg(feature = "tracing")]
        tracing::$level!($($arg)+);
    };
}

mod collector;

pub use collector::{
    CollectError, CollectorOptions, ContentDigest, DEFAULT_COMMENT_MARKER, DEFAULT_REPORT_PREFIX,
    DEFAULT_RESERVED_PREFIXES, ExclusionRules, collect_fingerprints, digest_file,
    open_decompressed, requested_columns,
};

pub const PATH_COLUMN: &str = "path";
const LEGACY_CHECKSUM_COLUMN: &str = "md5";
const LEGACY_LINE_COUNT_COLUMN: &str = "nlines";

#[derive(Debug, Error)]
pub enum TableError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error("fingerprint table has no header row")]
    MissingHeader,
    #[error("fingerprint table declares the {0} column more than once")]
    DuplicateColumn(MetricKind),
    #[error("fingerprint table has more than one row for {0}")]
    DuplicatePath(String),
    #[error("fingerprint table row at line {line} has an empty path")]
    EmptyPath { line: u64 },
    #[error("invalid line count {value:?} for {path}")]
    InvalidLineCount { path: String, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricValue<'a> {
    Checksum(&'a str),
    LineCount(u64),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_count: Option<u64>,
    /// Read failure while fingerprinting; never persisted to TSV.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FingerprintRecord {
    #[must_use]
    pub fn present() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_checksum(checksum: impl Into<String>) -> Self {
        Self {
            checksum: Some(checksum.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_line_count(line_count: u64) -> Self {
        Self {
            line_count: Some(line_count),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn unreadable(detail: impl Into<String>) -> Self {
        Self {
            error: Some(detail.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_unreadable(&self) -> bool {
        self.error.is_some()
    }

    #[must_use]
    pub fn value(&self, metric: MetricKind) -> Option<MetricValue<'_>> {
        match metric {
            MetricKind::Existence => None,
            MetricKind::LineCount => self.line_count.map(MetricValue::LineCount),
            MetricKind::Checksum => self.checksum.as_deref().map(MetricValue::Checksum),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintTable {
    columns: Vec<MetricKind>,
    rows: BTreeMap<String, FingerprintRecord>,
}

impl FingerprintTable {
    /// Existence is implicit in a row's presence and never gets a column.
    #[must_use]
    pub fn new<I>(columns: I) -> Self
    where
        I: IntoIterator<Item = MetricKind>,
    {
        let requested = columns.into_iter().collect::<Vec<_>>();
        let columns = [MetricKind::Checksum, MetricKind::LineCount]
            .into_iter()
            .filter(|metric| requested.contains(metric))
            .collect();
        Self {
            columns,
            rows: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn columns(&self) -> &[MetricKind] {
        &self.columns
    }

    #[must_use]
    pub fn has_column(&self, metric: MetricKind) -> bool {
        self.columns.contains(&metric)
    }

    pub fn insert(
        &mut self,
        path: impl Into<String>,
        record: FingerprintRecord,
    ) -> Result<(), TableError> {
        let path = path.into();
        if self.rows.contains_key(&path) {
            return Err(TableError::DuplicatePath(path));
        }
        self.rows.insert(path, record);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, path: &str) -> Option<&FingerprintRecord> {
        self.rows.get(path)
    }

    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.rows.contains_key(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.rows.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FingerprintRecord)> {
        self.rows.iter().map(|(path, record)| (path.as_str(), record))
    }

    /// Re-key every row relative to `prefix` when all of them live under
    /// it, as in tables keyed `<test>.dir/...` from the run's parent
    /// directory. Any row outside the prefix leaves the table untouched.
    #[must_use]
    pub fn strip_path_prefix(self, prefix: &str) -> Self {
        let all_prefixed = !self.rows.is_empty()
            && self
                .rows
                .keys()
                .all(|path| path.len() > prefix.len() && path.starts_with(prefix));
        if !all_prefixed {
            return self;
        }
        let rows = self
            .rows
            .into_iter()
            .map(|(path, record)| (path[prefix.len()..].to_owned(), record))
            .collect();
        Self {
            columns: self.columns,
            rows,
        }
    }

    /// Rows whose content could not be read, with the recorded failure.
    pub fn unreadable(&self) -> impl Iterator<Item = (&str, &str)> {
        self.rows.iter().filter_map(|(path, record)| {
            record
                .error
                .as_deref()
                .map(|error| (path.as_str(), error))
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn write_tsv<W: Write>(&self, writer: W) -> Result<(), TableError> {
        let mut writer = WriterBuilder::new().delimiter(b'\t').from_writer(writer);

        let mut header = vec![PATH_COLUMN];
        header.extend(self.columns.iter().map(|metric| metric.column_name()));
        writer.write_record(&header)?;

        for (path, record) in &self.rows {
            let mut row = vec![path.clone()];
            for metric in &self.columns {
                row.push(match metric {
                    MetricKind::Checksum => record.checksum.clone().unwrap_or_default(),
                    MetricKind::LineCount => record
                        .line_count
                        .map(|count| count.to_string())
                        .unwrap_or_default(),
                    MetricKind::Existence => String::new(),
                });
            }
            writer.write_record(&row)?;
        }

        writer.flush()?;
        Ok(())
    }

    pub fn to_tsv_string(&self) -> Result<String, TableError> {
        let mut out = Vec::new();
        self.write_tsv(&mut out)?;
        String::from_utf8(out).map_err(|err| {
            TableError::Io(io::Error::new(io::ErrorKind::InvalidData, err))
        })
    }

    pub fn write_path(&self, path: &Path) -> Result<(), TableError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        self.write_tsv(BufWriter::new(file))
    }

    /// Parse a headered, tab-separated table. The first column is the path
    /// key whatever its name; `md5` and `nlines` are read as `checksum` and
    /// `line_count`. Unknown columns are ignored.
    ///
    /// Path keys are taken verbatim, whitespace included, so a file name
    /// with leading or trailing blanks keys the same row it was written
    /// under. Header names and value cells are trimmed.
    ///
    /// Legacy `md5` cells still hold MD5 digests and never equal a SHA-256
    /// checksum; such references have to be re-snapshotted before their
    /// checksum-graded files can pass.
    pub fn read_tsv<R: Read>(reader: R) -> Result<Self, TableError> {
        let mut reader = ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(true)
            .flexible(true)
            .trim(Trim::Headers)
            .from_reader(reader);

        let headers = reader.headers()?.clone();
        if headers.is_empty() || headers.get(0).is_none_or(str::is_empty) {
            return Err(TableError::MissingHeader);
        }

        let mut checksum_idx = None;
        let mut line_count_idx = None;
        for (idx, name) in headers.iter().enumerate().skip(1) {
            let (metric, slot) = match name {
                "checksum" | LEGACY_CHECKSUM_COLUMN => (MetricKind::Checksum, &mut checksum_idx),
                "line_count" | LEGACY_LINE_COUNT_COLUMN => {
                    (MetricKind::LineCount, &mut line_count_idx)
                }
                _ => continue,
            };
            if slot.is_some() {
                return Err(TableError::DuplicateColumn(metric));
            }
            *slot = Some(idx);
        }

        let mut columns = Vec::new();
        if checksum_idx.is_some() {
            columns.push(MetricKind::Checksum);
        }
        if line_count_idx.is_some() {
            columns.push(MetricKind::LineCount);
        }
        let mut table = Self::new(columns);

        for row in reader.records() {
            let row = row?;
            let path = row.get(0).unwrap_or_default();
            if path.is_empty() {
                return Err(TableError::EmptyPath {
                    line: row.position().map_or(0, |pos| pos.line()),
                });
            }

            let cell = |idx: Option<usize>| {
                idx.and_then(|idx| row.get(idx))
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
            };
            let line_count = cell(line_count_idx)
                .map(|value| parse_line_count(path, value))
                .transpose()?;
            let record = FingerprintRecord {
                checksum: cell(checksum_idx).map(str::to_owned),
                line_count,
                error: None,
            };
            table.insert(path, record)?;
        }

        Ok(table)
    }

    pub fn from_tsv_str(input: &str) -> Result<Self, TableError> {
        Self::read_tsv(input.as_bytes())
    }

    pub fn read_path(path: &Path) -> Result<Self, TableError> {
        Self::read_tsv(File::open(path)?)
    }
}

/// Tables written by dataframe tools store counts as floats (`12.0`) once a
/// column holds a missing value.
fn parse_line_count(path: &str, value: &str) -> Result<u64, TableError> {
    if let Ok(count) = value.parse::<u64>() {
        return Ok(count);
    }
    match value.parse::<f64>() {
        Ok(count) if count.is_finite() && count >= 0.0 && count.fract() == 0.0 => {
            Ok(count as u64)
        }
        _ => Err(TableError::InvalidLineCount {
            path: path.to_owned(),
            value: value.to_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use pt_types::MetricKind;

    use super::{FingerprintRecord, FingerprintTable, MetricValue, TableError};

    fn sample_table() -> FingerprintTable {
        let mut table = FingerprintTable::new([MetricKind::LineCount, MetricKind::Checksum]);
        table
            .insert(
                "bwa.dir/a.bam",
                FingerprintRecord {
                    checksum: Some("0e1c4ee8".to_owned()),
                    line_count: Some(12),
                    error: None,
                },
            )
            .expect("insert");
        table
            .insert("bwa.dir/a.bam.bai", FingerprintRecord::present())
            .expect("insert");
        table
    }

    #[test]
    fn header_lists_only_requested_metric_columns() {
        let table = FingerprintTable::new([MetricKind::Existence, MetricKind::LineCount]);
        let out = table.to_tsv_string().expect("write");
        assert_eq!(out, "path\tline_count\n");
        assert_eq!(table.columns(), [MetricKind::LineCount]);
    }

    #[test]
    fn written_table_reads_back_identically() {
        let table = sample_table();
        let out = table.to_tsv_string().expect("write");
        assert!(out.starts_with("path\tchecksum\tline_count\n"));
        assert!(out.contains("bwa.dir/a.bam.bai\t\t\n"));

        let back = FingerprintTable::from_tsv_str(&out).expect("read");
        assert_eq!(back, table);
    }

    #[test]
    fn legacy_column_names_and_float_counts_are_accepted() {
        let input = "filename\tmd5\tnlines\textra\n\
                     a.tsv.gz\tabc\t10.0\tignored\n\
                     b.bed.gz\t\t\n\
                     c.txt\n";
        let table = FingerprintTable::from_tsv_str(input).expect("read");
        assert_eq!(table.columns(), [MetricKind::Checksum, MetricKind::LineCount]);
        assert_eq!(table.len(), 3);

        let a = table.get("a.tsv.gz").expect("row a");
        assert_eq!(a.value(MetricKind::Checksum), Some(MetricValue::Checksum("abc")));
        assert_eq!(a.value(MetricKind::LineCount), Some(MetricValue::LineCount(10)));
        assert_eq!(a.value(MetricKind::Existence), None);

        let c = table.get("c.txt").expect("row c");
        assert_eq!(c, &FingerprintRecord::present());
    }

    #[test]
    fn path_keys_keep_surrounding_whitespace() {
        let mut table = FingerprintTable::new([MetricKind::Checksum]);
        table
            .insert(" sample.bam", FingerprintRecord::with_checksum("ab12"))
            .expect("insert");
        table
            .insert("trailing.bam ", FingerprintRecord::present())
            .expect("insert");

        let out = table.to_tsv_string().expect("write");
        let back = FingerprintTable::from_tsv_str(&out).expect("read");
        assert_eq!(back, table);
        assert!(back.contains(" sample.bam"));
        assert!(!back.contains("sample.bam"));

        let padded = FingerprintTable::from_tsv_str(" path \t checksum \na.bam\t ab12 \n")
            .expect("padded header and cells");
        assert_eq!(
            padded.get("a.bam").and_then(|row| row.value(MetricKind::Checksum)),
            Some(MetricValue::Checksum("ab12"))
        );
    }

    #[test]
    fn legacy_run_directory_prefix_is_stripped_only_when_shared() {
        let input = "filename\tnlines\n\
                     test_mapping.dir/bwa.dir/s1.counts.tsv\t2\n\
                     test_mapping.dir/s1.bam.bai\t\n";
        let table = FingerprintTable::from_tsv_str(input)
            .expect("read")
            .strip_path_prefix("test_mapping.dir/");
        assert_eq!(
            table.paths().collect::<Vec<_>>(),
            vec!["bwa.dir/s1.counts.tsv", "s1.bam.bai"]
        );
        assert_eq!(
            table
                .get("bwa.dir/s1.counts.tsv")
                .and_then(|row| row.value(MetricKind::LineCount)),
            Some(MetricValue::LineCount(2))
        );

        let mut mixed = sample_table();
        mixed
            .insert("top.bam", FingerprintRecord::present())
            .expect("insert");
        assert_eq!(mixed.clone().strip_path_prefix("bwa.dir/"), mixed);
        let untouched = sample_table().strip_path_prefix("test_mapping.dir/");
        assert_eq!(untouched, sample_table());
    }

    #[test]
    fn duplicate_paths_violate_one_row_per_file() {
        let input = "path\tchecksum\na.bam\tx\na.bam\ty\n";
        let err = FingerprintTable::from_tsv_str(input).expect_err("duplicate");
        assert!(matches!(err, TableError::DuplicatePath(path) if path == "a.bam"));
    }

    #[test]
    fn malformed_tables_are_rejected() {
        let err = FingerprintTable::from_tsv_str("").expect_err("no header");
        assert!(matches!(err, TableError::MissingHeader));

        let err = FingerprintTable::from_tsv_str("path\tchecksum\tmd5\n").expect_err("dup col");
        assert!(matches!(err, TableError::DuplicateColumn(MetricKind::Checksum)));

        let err = FingerprintTable::from_tsv_str("path\tnlines\na.tsv\tmany\n").expect_err("count");
        assert_eq!(err.to_string(), "invalid line count \"many\" for a.tsv");

        let err = FingerprintTable::from_tsv_str("path\tnlines\na.tsv\t-3\n").expect_err("neg");
        assert!(matches!(err, TableError::InvalidLineCount { .. }));
    }

    #[test]
    fn unreadable_rows_are_listed_but_not_persisted() {
        let mut table = FingerprintTable::new([MetricKind::Checksum]);
        table
            .insert("broken.bam", FingerprintRecord::unreadable("corrupt deflate stream"))
            .expect("insert");
        assert_eq!(
            table.unreadable().collect::<Vec<_>>(),
            vec![("broken.bam", "corrupt deflate stream")]
        );
        let out = table.to_tsv_string().expect("write");
        assert_eq!(out, "path\tchecksum\nbroken.bam\t\n");
    }
}
