//! Fuzz target for the event line format round trip.
//!
//! Builds events from structured input, including strings with tabs and
//! newlines, and checks that deserialize inverts serialize.

#![no_main]

use arbitrary::Arbitrary;
use chrono::DateTime;
use libfuzzer_sys::fuzz_target;
use serde_json::{json, Map, Value};
use tq_common::UserId;
use tq_events::EventRecord;

#[derive(Debug, Arbitrary)]
struct Input {
    owner: u64,
    name_suffix: Vec<u8>,
    key: String,
    text: String,
    number: i64,
    ratio: f64,
    secs: u32,
    nanos: u32,
}

fuzz_target!(|input: Input| {
    let suffix: String = input
        .name_suffix
        .iter()
        .map(|b| match b % 3 {
            0 => char::from(b'a' + b % 26),
            1 => char::from(b'0' + b % 10),
            _ => '_',
        })
        .collect();
    let Some(timestamp) = DateTime::from_timestamp(i64::from(input.secs), input.nanos % 1_000_000_000)
    else {
        return;
    };
    let mut dimensions = Map::new();
    dimensions.insert(input.key, Value::String(input.text));
    let measurements = if input.number % 2 == 0 {
        Value::Null
    } else if input.ratio.is_finite() {
        json!({ "n": input.number, "ratio": input.ratio })
    } else {
        json!({ "n": input.number })
    };

    let event = EventRecord::new(
        UserId(input.owner),
        format!("E{suffix}"),
        Value::Object(dimensions),
        measurements,
        timestamp,
    )
    .expect("generated name is valid");
    let line = event.serialize();
    assert!(!line.contains('\n'));
    let parsed = EventRecord::deserialize(line.as_bytes()).expect("serialized event parses");
    assert_eq!(parsed, event);
});
