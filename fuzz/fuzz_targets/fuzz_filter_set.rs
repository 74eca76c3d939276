#![no_main]

use libfuzzer_sys::fuzz_target;
use matchbook_core::filter::parse_filter_set;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        let _ = parse_filter_set(Some(s));
    }
});
