//! End-to-end queue scenarios over a recording in-memory backend.
//!
//! Storage runs on inline execution contexts, so every scenario is
//! deterministic: a call either completes before the triggering method
//! returns or is held back explicitly by the backend.

mod support;

use chrono::Utc;
use serde_json::{json, Value};
use support::memory_backend::{Call, MemoryBackend, USER};
use tq_common::{QueueConfig, TenantLimits};
use tq_events::directory::directory_key;
use tq_events::{EventQueue, EventRecord, QueueMode};

const OLD_FILE: &str = "evq_0000000000000001.json";

fn event(name: &str) -> EventRecord {
    EventRecord::now(USER, name, json!({"source": "scenario"}), Value::Null).unwrap()
}

/// An event whose persisted line, newline included, is exactly `line_bytes`.
fn sized_event(name: &str, line_bytes: usize) -> EventRecord {
    let ts = Utc::now();
    let base = EventRecord::new(USER, name, json!({"pad": ""}), Value::Null, ts).unwrap();
    let overhead = base.serialize().len() + 1;
    let pad = "p".repeat(line_bytes - overhead);
    EventRecord::new(USER, name, json!({"pad": pad}), Value::Null, ts).unwrap()
}

fn lines(events: &[&EventRecord]) -> Vec<u8> {
    let mut out = Vec::new();
    for e in events {
        out.extend_from_slice(e.serialize().as_bytes());
        out.push(b'\n');
    }
    out
}

fn drain_names(queue: &EventQueue) -> Vec<String> {
    let mut names = Vec::new();
    while let Some(payload) = queue.get_next_payload(1) {
        names.extend(payload.events().map(|e| e.name().to_string()));
    }
    names
}

fn dir_key() -> String {
    directory_key("evq_", USER)
}

fn reads_of(backend: &MemoryBackend, key: &str) -> usize {
    backend
        .calls()
        .iter()
        .filter(|c| matches!(c, Call::Read { key: k } if k == key))
        .count()
}

#[test]
fn second_flush_while_first_outstanding_issues_no_write() {
    let backend = MemoryBackend::new();
    let queue = backend.queue(TenantLimits::default(), QueueConfig::default());
    queue.set_mode(QueueMode::Offline);

    backend.set_deferred(true);
    queue.add_event(event("First"));
    assert_eq!(backend.event_writes().len(), 1);
    assert!(queue.stats().flush_in_progress);

    queue.flush();
    queue.flush();
    queue.add_event(event("Second"));
    assert_eq!(backend.event_writes().len(), 1);
    assert_eq!(queue.stats().buffered_events, 1);

    // Completing the write drains the backlog with a follow-up flush.
    backend.release_all();
    assert_eq!(backend.event_writes().len(), 2);
    let stats = queue.stats();
    assert!(!stats.flush_in_progress);
    assert_eq!(stats.buffered_events, 0);
    assert_eq!(stats.files, 1);
}

#[test]
fn offline_add_schedules_write_before_returning() {
    let backend = MemoryBackend::new();
    let queue = backend.queue(TenantLimits::default(), QueueConfig::default());
    queue.set_mode(QueueMode::Offline);
    assert!(backend.event_writes().is_empty());

    queue.add_event(event("Immediate"));

    let writes = backend.event_writes();
    assert_eq!(writes.len(), 1);
    let blob = backend.blob(writes[0].key()).unwrap();
    let persisted = EventRecord::deserialize(&blob).unwrap();
    assert_eq!(persisted.name(), "Immediate");

    let directory = String::from_utf8(backend.blob(&dir_key()).unwrap()).unwrap();
    assert_eq!(directory, format!("{}\t{}\n", writes[0].key(), blob.len()));
}

#[test]
fn normal_mode_add_does_not_touch_storage() {
    let backend = MemoryBackend::new();
    let queue = backend.queue(TenantLimits::default(), QueueConfig::default());
    queue.add_events(vec![event("A"), event("B")]);
    assert!(backend.calls().is_empty());
    assert_eq!(queue.stats().buffered_events, 2);
}

#[test]
fn initialize_recovers_files_in_order_and_clears_them() {
    let backend = MemoryBackend::new();
    let (a1, a2, b1) = (event("A1"), event("A2"), event("B1"));
    backend.seed(&dir_key(), "f1\t100\nf2\t50\n");
    backend.seed("f1", lines(&[&a1, &a2]));
    backend.seed("f2", lines(&[&b1]));

    let queue = backend.queue(TenantLimits::default(), QueueConfig::default());
    queue.initialize();

    assert_eq!(drain_names(&queue), ["A1", "A2", "B1"]);
    assert!(backend.blob("f1").is_none());
    assert!(backend.blob("f2").is_none());
    assert!(queue.files().is_empty());
    assert_eq!(queue.stats().total_files_size, 0);
    assert_eq!(backend.blob(&dir_key()).unwrap(), b"");

    let clears: Vec<String> = backend
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::Clear { .. }))
        .map(|c| c.key().to_string())
        .collect();
    assert_eq!(clears, ["f1", "f2"]);
}

#[test]
fn events_survive_a_restart() {
    let backend = MemoryBackend::new();
    let limits = TenantLimits {
        max_events_per_payload: 2,
        ..Default::default()
    };
    {
        let queue = backend.queue(limits, QueueConfig::default());
        queue.add_events(vec![event("One"), event("Two"), event("Three")]);
        queue.cleanup();
        assert_eq!(queue.stats().buffered_events, 0);
    }

    let restarted = backend.queue(limits, QueueConfig::default());
    restarted.initialize();
    assert_eq!(restarted.stats().payloads, 2);
    assert_eq!(drain_names(&restarted), ["One", "Two", "Three"]);
}

#[test]
fn eviction_removes_oldest_file_first() {
    let backend = MemoryBackend::new();
    backend.seed(&dir_key(), format!("{OLD_FILE}\t1000\n"));
    backend.seed(OLD_FILE, vec![b'x'; 1000]);
    let config = QueueConfig {
        max_file_size: 1000,
        storage_allotment: 1000,
    };
    let queue = backend.queue(TenantLimits::default(), config);
    queue.set_mode(QueueMode::Offline);
    queue.initialize();
    assert_eq!(queue.stats().total_files_size, 1000);

    queue.add_event(sized_event("Big", 1000));

    let stats = queue.stats();
    assert_eq!(stats.total_files_size, 1000);
    assert_eq!(stats.files, 1);
    let files = queue.files();
    let (newest, size) = files.newest().unwrap();
    assert!(newest > OLD_FILE);
    assert_eq!(size, 1000);
    assert!(backend.blob(OLD_FILE).is_none());
    assert!(backend.calls().contains(&Call::Clear {
        key: OLD_FILE.to_string()
    }));
}

#[test]
fn failed_eviction_is_restored_and_retried() {
    let backend = MemoryBackend::new();
    backend.seed(&dir_key(), format!("{OLD_FILE}\t1000\n"));
    backend.seed(OLD_FILE, vec![b'x'; 1000]);
    let config = QueueConfig {
        max_file_size: 1000,
        storage_allotment: 1000,
    };
    let queue = backend.queue(TenantLimits::default(), config);
    queue.set_mode(QueueMode::Offline);
    queue.initialize();

    backend.set_fail_clears(true);
    queue.add_event(sized_event("Big", 1000));

    let stats = queue.stats();
    assert_eq!(stats.files, 2);
    assert_eq!(stats.total_files_size, 2000);
    assert!(backend.blob(OLD_FILE).is_some());
    let directory = String::from_utf8(backend.blob(&dir_key()).unwrap()).unwrap();
    assert!(directory.contains(OLD_FILE));

    backend.set_fail_clears(false);
    queue.add_event(sized_event("Small", 200));

    let stats = queue.stats();
    assert_eq!(stats.files, 1);
    assert_eq!(stats.total_files_size, 200);
    assert!(backend.blob(OLD_FILE).is_none());
}

#[test]
fn storage_stays_within_allotment() {
    let backend = MemoryBackend::new();
    let config = QueueConfig {
        max_file_size: 1024,
        storage_allotment: 4096,
    };
    let queue = backend.queue(TenantLimits::default(), config);
    queue.set_mode(QueueMode::Offline);

    for i in 0..200 {
        queue.add_event(EventRecord::now(USER, "Tick", json!({ "i": i }), Value::Null).unwrap());
        let stats = queue.stats();
        assert!(
            stats.total_files_size <= config.storage_allotment,
            "after event {i}: {} bytes on disk",
            stats.total_files_size
        );
        assert!(!stats.flush_in_progress);
    }
    assert!(queue.stats().files > 1);
    let on_disk: u64 = queue.files().iter().map(|(_, size)| size).sum();
    assert_eq!(on_disk, queue.stats().total_files_size);
}

#[test]
fn populate_never_reads_a_file_twice_concurrently() {
    let backend = MemoryBackend::new();
    backend.seed(&dir_key(), "f1\t10\n");
    backend.seed("f1", lines(&[&event("Once")]));
    let queue = backend.queue(TenantLimits::default(), QueueConfig::default());

    backend.set_deferred(true);
    queue.initialize();
    assert!(backend.release_one()); // directory read
    assert_eq!(reads_of(&backend, "f1"), 1);

    queue.set_mode(QueueMode::Offline);
    queue.set_mode(QueueMode::Normal);
    queue.populate();
    backend.release_all();

    assert_eq!(reads_of(&backend, "f1"), 1);
    assert_eq!(drain_names(&queue), ["Once"]);
    assert!(queue.files().is_empty());
}

#[test]
fn flush_starts_a_new_file_instead_of_appending_to_one_being_recovered() {
    let backend = MemoryBackend::new();
    backend.seed(&dir_key(), format!("{OLD_FILE}\t10\n"));
    backend.seed(OLD_FILE, lines(&[&event("Recovered")]));
    let queue = backend.queue(TenantLimits::default(), QueueConfig::default());

    backend.set_deferred(true);
    queue.initialize();
    assert!(backend.release_one());

    queue.add_event(event("Fresh"));
    queue.flush();
    backend.release_all();

    let writes = backend.event_writes();
    assert_eq!(writes.len(), 1);
    assert_ne!(writes[0].key(), OLD_FILE);
    assert_eq!(drain_names(&queue), ["Recovered"]);
    assert_eq!(queue.files().len(), 1);
}

#[test]
fn read_failure_skips_file_and_retries_on_next_populate() {
    let backend = MemoryBackend::new();
    backend.seed(&dir_key(), "f1\t10\nf2\t10\n");
    backend.seed("f2", lines(&[&event("Good")]));
    backend.fail_reads_of("f1");
    let queue = backend.queue(TenantLimits::default(), QueueConfig::default());

    queue.initialize();
    assert_eq!(drain_names(&queue), ["Good"]);
    let files = queue.files();
    assert_eq!(files.len(), 1);
    assert!(files.contains("f1"));

    queue.populate();
    assert_eq!(reads_of(&backend, "f1"), 2);
}

#[test]
fn going_offline_during_recovery_keeps_the_file() {
    let backend = MemoryBackend::new();
    backend.seed(&dir_key(), "f1\t10\n");
    backend.seed("f1", lines(&[&event("Kept")]));
    let queue = backend.queue(TenantLimits::default(), QueueConfig::default());

    backend.set_deferred(true);
    queue.initialize();
    assert!(backend.release_one());
    queue.set_mode(QueueMode::Offline);
    backend.release_all();

    assert_eq!(queue.stats().buffered_events, 0);
    assert!(queue.files().contains("f1"));
    assert!(backend.blob("f1").is_some());
}

#[test]
fn failed_append_returns_events_to_the_queue() {
    let backend = MemoryBackend::new();
    let queue = backend.queue(TenantLimits::default(), QueueConfig::default());
    queue.set_mode(QueueMode::Offline);

    backend.set_fail_appends(true);
    queue.add_events(vec![event("A"), event("B")]);

    let stats = queue.stats();
    assert_eq!(backend.event_writes().len(), 1);
    assert_eq!(stats.buffered_events, 2);
    assert_eq!(stats.files, 0);
    assert!(!stats.flush_in_progress);

    // The next add writes the restored events ahead of the new one.
    backend.set_fail_appends(false);
    queue.add_event(event("C"));
    assert_eq!(queue.stats().buffered_events, 0);
    assert_eq!(queue.stats().files, 1);

    queue.set_mode(QueueMode::Normal);
    assert_eq!(drain_names(&queue), ["A", "B", "C"]);
}

#[test]
fn large_backlog_flushes_in_thousands_of_chunks() {
    let backend = MemoryBackend::new();
    let config = QueueConfig {
        max_file_size: 1024,
        storage_allotment: 64 * 1024,
    };
    let queue = backend.queue(TenantLimits::default(), config);
    queue.add_events(
        (0..50_000)
            .map(|i| EventRecord::now(USER, "Tick", json!({ "i": i }), Value::Null).unwrap())
            .collect(),
    );

    queue.cleanup();

    let stats = queue.stats();
    assert_eq!(stats.buffered_events, 0);
    assert!(!stats.flush_in_progress);
    assert!(stats.total_files_size <= config.storage_allotment);
    assert!(backend.event_writes().len() > 2_000);
}
