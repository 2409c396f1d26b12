#![no_main]
use libfuzzer_sys::fuzz_target;
use pt_fingerprint::ContentDigest;

fuzz_target!(|data: &[u8]| {
    let digest = ContentDigest::from_reader(data, b"#").expect("in-memory read");
    let newlines = data.iter().filter(|byte| **byte == b'\n').count() as u64;
    assert_eq!(digest.line_count, newlines);
    assert_eq!(digest.checksum.len(), 64);
});
