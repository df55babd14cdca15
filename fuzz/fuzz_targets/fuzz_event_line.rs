//! Fuzz target for persisted event line parsing.
//!
//! Event files are read back after a restart and may be truncated or
//! damaged; parsing must reject bad lines without panicking.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tq_events::EventRecord;

fuzz_target!(|data: &[u8]| {
    if let Ok(event) = EventRecord::deserialize(data) {
        // Anything accepted must survive another trip through the line format.
        let again = EventRecord::deserialize(event.serialize().as_bytes())
            .expect("re-serialized event parses");
        assert_eq!(again, event);
    }
});
