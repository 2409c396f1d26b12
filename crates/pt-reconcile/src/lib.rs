#![forbid(unsafe_code)]

//! Reconciliation of a run's fingerprint table against its reference.
//!
//! Every path present on both sides is graded under exactly one metric,
//! chosen by [`PolicySet::classify`]: existence first, then line count,
//! then checksum. Paths matching none are reported as unclassified.

use std::collections::BTreeSet;

use pt_fingerprint::{FingerprintRecord, FingerprintTable};
use pt_types::{MetricKind, PolicySet};
use serde::{Deserialize, Serialize};

macro_rules! trace_event {
    ($level:ident, $($arg:tt)+) => {
        #[cfg(feature = "tracing")]
        tracing::$level!($($arg)+);
    };
}

mod verdict;

pub use verdict::{SUMMARY_COLUMNS, Verdict, VerdictStatus, aggregate, write_summary_tsv};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationResult {
    pub missing: BTreeSet<String>,
    pub extra: BTreeSet<String>,
    pub same_checksum: BTreeSet<String>,
    pub different_checksum: BTreeSet<String>,
    pub same_linecount: BTreeSet<String>,
    pub different_linecount: BTreeSet<String>,
    pub same_existence_only: BTreeSet<String>,
    pub unclassified: BTreeSet<String>,
    /// Shared paths whose current content could not be read.
    pub unreadable: BTreeSet<String>,
}

impl ReconciliationResult {
    #[must_use]
    pub fn different_total(&self) -> usize {
        self.different_checksum.len() + self.different_linecount.len()
    }

    #[must_use]
    pub fn same_total(&self) -> usize {
        self.same_checksum.len() + self.same_linecount.len() + self.same_existence_only.len()
    }

    /// Number of paths present on both sides.
    #[must_use]
    pub fn shared_total(&self) -> usize {
        self.same_total() + self.different_total() + self.unclassified.len() + self.unreadable.len()
    }

    /// All shared paths, in path order.
    #[must_use]
    pub fn shared(&self) -> BTreeSet<&str> {
        [
            &self.same_existence_only,
            &self.same_linecount,
            &self.different_linecount,
            &self.same_checksum,
            &self.different_checksum,
            &self.unclassified,
            &self.unreadable,
        ]
        .into_iter()
        .flatten()
        .map(String::as_str)
        .collect()
    }
}

pub fn reconcile(
    current: &FingerprintTable,
    reference: &FingerprintTable,
    policies: &PolicySet,
) -> ReconciliationResult {
    let mut result = ReconciliationResult::default();

    for path in reference.paths() {
        if !current.contains(path) {
            result.missing.insert(path.to_owned());
        }
    }

    for (path, record) in current.iter() {
        let Some(expected) = reference.get(path) else {
            result.extra.insert(path.to_owned());
            continue;
        };

        let bucket = match policies.classify(path) {
            None => &mut result.unclassified,
            Some(MetricKind::Existence) => &mut result.same_existence_only,
            Some(_) if record.is_unreadable() => &mut result.unreadable,
            Some(metric @ MetricKind::LineCount) => {
                if values_match(record, expected, metric) {
                    &mut result.same_linecount
                } else {
                    &mut result.different_linecount
                }
            }
            Some(metric @ MetricKind::Checksum) => {
                if values_match(record, expected, metric) {
                    &mut result.same_checksum
                } else {
                    &mut result.different_checksum
                }
            }
        };
        bucket.insert(path.to_owned());
    }

    result
}

/// A value absent on either side never matches.
fn values_match(current: &FingerprintRecord, expected: &FingerprintRecord, metric: MetricKind) -> bool {
    match (current.value(metric), expected.value(metric)) {
        (Some(current), Some(expected)) => current == expected,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use proptest::prelude::*;
    use pt_fingerprint::{FingerprintRecord, FingerprintTable};
    use pt_types::{MetricKind, PolicySet};

    use super::reconcile;

    fn set(paths: &[&str]) -> BTreeSet<String> {
        paths.iter().map(|path| (*path).to_owned()).collect()
    }

    fn checksums(rows: &[(&str, &str)]) -> FingerprintTable {
        let mut table = FingerprintTable::new([MetricKind::Checksum]);
        for (path, checksum) in rows {
            table
                .insert(*path, FingerprintRecord::with_checksum(*checksum))
                .expect("insert");
        }
        table
    }

    #[test]
    fn shared_paths_are_graded_under_their_policy() {
        let reference = checksums(&[("a.tsv.gz", "X"), ("b.bam", "Y")]);
        let current = checksums(&[("a.tsv.gz", "X"), ("b.bam", "Z"), ("c.bed.gz", "W")]);
        let policies = PolicySet::from_comma_lists("", "", ".tsv.gz,.bam,.bed.gz").expect("set");

        let result = reconcile(&current, &reference, &policies);
        assert!(result.missing.is_empty());
        assert_eq!(result.extra, set(&["c.bed.gz"]));
        assert_eq!(result.same_checksum, set(&["a.tsv.gz"]));
        assert_eq!(result.different_checksum, set(&["b.bam"]));
        assert_eq!(result.shared_total(), 2);
    }

    #[test]
    fn existence_takes_precedence_over_checksum() {
        let reference = checksums(&[("x/rates.gff.gz", "old")]);
        let current = checksums(&[("x/rates.gff.gz", "new")]);
        let policies = PolicySet::from_comma_lists("rates.gff.gz", "", "gff.gz").expect("set");

        let result = reconcile(&current, &reference, &policies);
        assert_eq!(result.same_existence_only, set(&["x/rates.gff.gz"]));
        assert!(result.different_checksum.is_empty());
        assert!(result.same_checksum.is_empty());
    }

    #[test]
    fn linecount_takes_precedence_over_checksum() {
        let mut reference = FingerprintTable::new([MetricKind::Checksum, MetricKind::LineCount]);
        let mut current = reference.clone();
        reference
            .insert(
                "counts.tsv",
                FingerprintRecord {
                    checksum: Some("aaa".to_owned()),
                    line_count: Some(10),
                    error: None,
                },
            )
            .expect("insert");
        current
            .insert(
                "counts.tsv",
                FingerprintRecord {
                    checksum: Some("bbb".to_owned()),
                    line_count: Some(10),
                    error: None,
                },
            )
            .expect("insert");
        let policies = PolicySet::from_comma_lists("", "tsv", "tsv").expect("set");

        let result = reconcile(&current, &reference, &policies);
        assert_eq!(result.same_linecount, set(&["counts.tsv"]));
        assert!(result.different_checksum.is_empty());
    }

    #[test]
    fn missing_values_and_unreadable_files_are_separated() {
        let mut reference = FingerprintTable::new([MetricKind::LineCount]);
        reference
            .insert("a.tsv", FingerprintRecord::with_line_count(3))
            .expect("insert");
        reference
            .insert("b.tsv", FingerprintRecord::present())
            .expect("insert");
        reference
            .insert("c.tsv", FingerprintRecord::with_line_count(7))
            .expect("insert");
        reference
            .insert("notes.txt", FingerprintRecord::present())
            .expect("insert");

        let mut current = FingerprintTable::new([MetricKind::LineCount]);
        current
            .insert("a.tsv", FingerprintRecord::with_line_count(3))
            .expect("insert");
        current
            .insert("b.tsv", FingerprintRecord::with_line_count(3))
            .expect("insert");
        current
            .insert("c.tsv", FingerprintRecord::unreadable("permission denied"))
            .expect("insert");
        current
            .insert("notes.txt", FingerprintRecord::present())
            .expect("insert");

        let policies = PolicySet::from_comma_lists("", "tsv", "").expect("set");
        let result = reconcile(&current, &reference, &policies);
        assert_eq!(result.same_linecount, set(&["a.tsv"]));
        assert_eq!(result.different_linecount, set(&["b.tsv"]));
        assert_eq!(result.unreadable, set(&["c.tsv"]));
        assert_eq!(result.unclassified, set(&["notes.txt"]));
        assert!(result.missing.is_empty());
    }

    #[test]
    fn table_reconciled_against_itself_has_no_differences() {
        let table = checksums(&[("a.bam", "1"), ("b.bed.gz", "2"), ("c.txt", "3")]);
        let policies = PolicySet::from_comma_lists("", "", "bam,bed.gz").expect("set");
        let result = reconcile(&table, &table, &policies);
        assert!(result.missing.is_empty());
        assert!(result.extra.is_empty());
        assert_eq!(result.different_total(), 0);
        assert_eq!(result.same_checksum, set(&["a.bam", "b.bed.gz"]));
        assert_eq!(result.unclassified, set(&["c.txt"]));
    }

    #[derive(Debug, Clone)]
    enum Cell {
        Checksum(u8),
        LineCount(u8),
        Both(u8, u8),
        Bare,
        Unreadable,
    }

    fn cell() -> impl Strategy<Value = Cell> {
        prop_oneof![
            (0_u8..3).prop_map(Cell::Checksum),
            (0_u8..3).prop_map(Cell::LineCount),
            ((0_u8..3), (0_u8..3)).prop_map(|(c, l)| Cell::Both(c, l)),
            Just(Cell::Bare),
            Just(Cell::Unreadable),
        ]
    }

    fn table_from(rows: &std::collections::BTreeMap<String, Cell>) -> FingerprintTable {
        let mut table = FingerprintTable::new([MetricKind::Checksum, MetricKind::LineCount]);
        for (path, cell) in rows {
            let record = match cell {
                Cell::Checksum(c) => FingerprintRecord::with_checksum(c.to_string()),
                Cell::LineCount(l) => FingerprintRecord::with_line_count(u64::from(*l)),
                Cell::Both(c, l) => FingerprintRecord {
                    checksum: Some(c.to_string()),
                    line_count: Some(u64::from(*l)),
                    error: None,
                },
                Cell::Bare => FingerprintRecord::present(),
                Cell::Unreadable => FingerprintRecord::unreadable("io"),
            };
            table.insert(path.clone(), record).expect("unique keys");
        }
        table
    }

    fn run_tables() -> impl Strategy<Value = std::collections::BTreeMap<String, Cell>> {
        prop::collection::btree_map("[a-c]{1,2}\\.(bam|tsv|gff|txt)", cell(), 0..12)
    }

    proptest! {
        #[test]
        fn every_shared_path_lands_in_exactly_one_bucket(
            current_rows in run_tables(),
            reference_rows in run_tables(),
        ) {
            let current = table_from(&current_rows);
            let reference = table_from(&reference_rows);
            let policies = PolicySet::from_comma_lists("gff", "tsv", "bam,tsv,gff").expect("set");
            let result = reconcile(&current, &reference, &policies);

            let shared: BTreeSet<&str> = current_rows
                .keys()
                .filter(|path| reference_rows.contains_key(*path))
                .map(String::as_str)
                .collect();
            prop_assert_eq!(result.shared(), shared.clone());
            prop_assert_eq!(result.shared_total(), shared.len());

            for path in &result.missing {
                prop_assert!(reference_rows.contains_key(path) && !current_rows.contains_key(path));
            }
            for path in &result.extra {
                prop_assert!(current_rows.contains_key(path) && !reference_rows.contains_key(path));
            }
            prop_assert_eq!(
                result.missing.len() + shared.len(),
                reference_rows.len()
            );
            prop_assert_eq!(result.extra.len() + shared.len(), current_rows.len());
        }
    }
}
