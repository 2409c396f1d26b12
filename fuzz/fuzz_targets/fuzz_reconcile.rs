//! Reconcile two tables decoded from fuzz input and check that every shared
//! path lands in exactly one bucket.

#![no_main]
use libfuzzer_sys::fuzz_target;
use pt_fingerprint::{FingerprintRecord, FingerprintTable};
use pt_reconcile::reconcile;
use pt_types::{MetricKind, PolicySet};

const SUFFIXES: [&str; 4] = ["bam", "tsv", "gff", "txt"];

fn table_from(bytes: &[u8]) -> FingerprintTable {
    let mut table = FingerprintTable::new([MetricKind::Checksum, MetricKind::LineCount]);
    for pair in bytes.chunks_exact(2) {
        let path = format!("f{}.{}", pair[0] % 8, SUFFIXES[usize::from(pair[0] >> 6)]);
        let record = match pair[1] % 4 {
            0 => FingerprintRecord::with_checksum((pair[1] >> 2).to_string()),
            1 => FingerprintRecord::with_line_count(u64::from(pair[1] >> 2)),
            2 => FingerprintRecord::present(),
            _ => FingerprintRecord::unreadable("io"),
        };
        let _ = table.insert(path, record);
    }
    table
}

fuzz_target!(|data: &[u8]| {
    let (left, right) = data.split_at(data.len() / 2);
    let current = table_from(left);
    let reference = table_from(right);
    let policies =
        PolicySet::from_comma_lists("gff", "tsv", "bam,tsv,gff").expect("static policies");

    let result = reconcile(&current, &reference, &policies);
    let shared = current
        .paths()
        .filter(|path| reference.contains(path))
        .count();
    assert_eq!(result.shared_total(), shared);
    assert_eq!(result.shared().len(), shared);
    assert_eq!(result.missing.len() + shared, reference.len());
    assert_eq!(result.extra.len() + shared, current.len());
});
