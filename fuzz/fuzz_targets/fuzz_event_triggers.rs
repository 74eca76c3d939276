#![no_main]

use libfuzzer_sys::fuzz_target;
use matchbook_core::testing::pending_trigger;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        let mut trigger = pending_trigger("fuzz", 0);
        trigger.event_triggers = Some(s.to_string());
        let _ = trigger.parse_event_triggers();

        trigger.aggregatable_values = Some(s.to_string());
        trigger.aggregatable_trigger_data = Some(s.to_string());
        trigger.aggregatable_dedup_keys = Some(s.to_string());
        let _ = trigger.aggregatable_trigger();
    }
});
