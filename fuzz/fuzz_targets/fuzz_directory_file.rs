//! Fuzz target for directory file parsing.
//!
//! Tests that strict and lossy parsing handle arbitrary input without
//! panicking, and that a lossy rebuild always persists to a file the
//! strict parser accepts.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tq_events::FileIndex;

fuzz_target!(|data: &[u8]| {
    let _ = FileIndex::parse(data);

    let rebuilt = FileIndex::rebuild(data);
    let reparsed = FileIndex::parse(&rebuilt.persist()).expect("persisted index parses");
    assert_eq!(reparsed.len(), rebuilt.len());
    assert!(reparsed.iter().eq(rebuilt.iter()));
});
