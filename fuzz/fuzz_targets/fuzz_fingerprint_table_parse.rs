//! Arbitrary bytes through the fingerprint table reader: it must return an
//! error or a table that survives a write/read cycle unchanged.

#![no_main]
use libfuzzer_sys::fuzz_target;
use pt_fingerprint::FingerprintTable;

fuzz_target!(|data: &[u8]| {
    let Ok(table) = FingerprintTable::read_tsv(data) else {
        return;
    };
    let Ok(written) = table.to_tsv_string() else {
        return;
    };
    let reread = FingerprintTable::from_tsv_str(&written).expect("written table parses");
    assert_eq!(reread.columns(), table.columns());
    assert_eq!(reread.len(), table.len());
});
