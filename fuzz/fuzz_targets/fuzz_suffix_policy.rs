#![no_main]
use libfuzzer_sys::fuzz_target;
use pt_types::{MetricKind, SuffixPolicy};

fuzz_target!(|data: &[u8]| {
    let text = String::from_utf8_lossy(data);
    let (list, path) = text.split_once('\n').unwrap_or((&text, ""));
    let Ok(policy) = SuffixPolicy::from_comma_list(MetricKind::Checksum, list) else {
        return;
    };

    let expected = policy
        .fragments()
        .iter()
        .any(|fragment| path.ends_with(fragment.as_str()));
    assert_eq!(policy.matches(path), expected);
});
