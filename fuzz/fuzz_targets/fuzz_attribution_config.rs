#![no_main]

use libfuzzer_sys::fuzz_target;
use matchbook_core::xna::{extract_network_ids, parse_attribution_configs};

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        let _ = parse_attribution_configs(s);
        let _ = extract_network_ids(s);
    }
});
