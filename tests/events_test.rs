//! Integration tests for event channels: retention and the long-poll read.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tempfile::TempDir;
use taskq::{Engine, EngineConfig};

const INITIAL_WAIT: Duration = Duration::from_millis(20);
const MAX_WAIT: Duration = Duration::from_millis(200);

fn fast_config(dir: &TempDir) -> EngineConfig {
    EngineConfig::new(dir.path().join("events.db")).poll_backoff(INITIAL_WAIT, MAX_WAIT)
}

fn test_engine() -> (TempDir, Arc<Engine>) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let engine = Engine::open(&fast_config(&dir)).expect("failed to open engine");
    (dir, Arc::new(engine))
}

/// Start a bounded long-poll on another thread and give it time to capture
/// its baseline before the caller emits.
fn spawn_reader(
    engine: &Arc<Engine>,
    channel: &'static str,
) -> thread::JoinHandle<taskq::Result<Vec<Value>>> {
    let engine = Arc::clone(engine);
    let handle =
        thread::spawn(move || engine.read_events_timeout(channel, Duration::from_secs(10)));
    thread::sleep(Duration::from_millis(200));
    handle
}

fn stored_messages(dir: &TempDir, channel: &str) -> Vec<Value> {
    let conn = rusqlite::Connection::open(dir.path().join("events.db")).unwrap();
    let mut stmt = conn
        .prepare(&format!("SELECT message FROM taskq_events_{channel} ORDER BY id"))
        .unwrap();
    stmt.query_map([], |row| row.get::<_, String>(0))
        .unwrap()
        .map(|text| serde_json::from_str(&text.unwrap()).unwrap())
        .collect()
}

// ---------------------------------------------------------------------------
// Retention
// ---------------------------------------------------------------------------

#[test]
fn channel_never_exceeds_cap_and_keeps_newest() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(&fast_config(&dir).event_retention(50, 30)).unwrap();

    for n in 0..100 {
        engine.emit_event("status", &json!({ "n": n })).unwrap();
        assert!(engine.event_count("status").unwrap() <= 50);
    }

    let stored = stored_messages(&dir, "status");
    assert!(!stored.is_empty());
    assert!(stored.len() <= 50);
    let first = 100 - stored.len() as i64;
    for (offset, message) in stored.iter().enumerate() {
        assert_eq!(message["n"], json!(first + offset as i64));
    }
}

#[test]
fn trim_leaves_floor_rows() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(&fast_config(&dir).event_retention(10, 4)).unwrap();

    for n in 0..10 {
        engine.emit_event("status", &json!(n)).unwrap();
    }
    assert_eq!(engine.event_count("status").unwrap(), 10);

    engine.emit_event("status", &json!(10)).unwrap();
    assert_eq!(engine.event_count("status").unwrap(), 4);
    assert_eq!(
        stored_messages(&dir, "status"),
        vec![json!(7), json!(8), json!(9), json!(10)]
    );
}

#[test]
fn small_configured_cap_keeps_the_newest_message() {
    let dir = tempfile::tempdir().unwrap();
    let config = taskq::config::Config::from_toml(&format!(
        "[engine]\nlocation = {:?}\nevent_cap = 150\npoll_initial_wait_ms = 20\npoll_max_wait_ms = 200\n",
        dir.path().join("events.db")
    ))
    .unwrap();
    let engine = Arc::new(Engine::open(&config.engine).unwrap());

    for n in 0..150 {
        engine.emit_event("status", &n).unwrap();
    }
    let reader = spawn_reader(&engine, "status");
    engine.emit_event("status", "newest").unwrap();

    assert_eq!(reader.join().unwrap().unwrap(), vec![json!("newest")]);
    let stored = stored_messages(&dir, "status");
    assert_eq!(stored.len(), 75);
    assert_eq!(stored.last(), Some(&json!("newest")));
}

#[test]
fn channels_are_independent() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(&fast_config(&dir).event_retention(5, 2)).unwrap();

    engine.emit_event("quiet", "only one").unwrap();
    for n in 0..20 {
        engine.emit_event("noisy", &n).unwrap();
    }

    assert_eq!(engine.event_count("quiet").unwrap(), 1);
    assert!(engine.event_count("noisy").unwrap() <= 5);
}

// ---------------------------------------------------------------------------
// Long-poll
// ---------------------------------------------------------------------------

#[test]
fn long_poll_returns_only_messages_emitted_after_it_started() {
    let (_dir, engine) = test_engine();

    engine.emit_event("status", "before").unwrap();
    let reader = spawn_reader(&engine, "status");
    engine.emit_event("status", "m1").unwrap();

    let events = reader.join().unwrap().unwrap();
    assert_eq!(events, vec![json!("m1")]);
}

#[test]
fn observed_message_is_not_returned_again() {
    let (_dir, engine) = test_engine();

    let reader = spawn_reader(&engine, "status");
    engine.emit_event("status", "m1").unwrap();
    assert_eq!(reader.join().unwrap().unwrap(), vec![json!("m1")]);

    let again = engine
        .read_events_timeout("status", Duration::from_millis(300))
        .unwrap();
    assert!(again.is_empty());
}

#[test]
fn long_poll_times_out_empty() {
    let (_dir, engine) = test_engine();

    let started = Instant::now();
    let events = engine
        .read_events_timeout("status", Duration::from_millis(300))
        .unwrap();
    assert!(events.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn long_poll_wakes_within_bounded_time() {
    let (_dir, engine) = test_engine();

    let reader = spawn_reader(&engine, "status");
    let emitted_at = Instant::now();
    engine.emit_event("status", &json!({ "status": "done" })).unwrap();

    let events = reader.join().unwrap().unwrap();
    assert_eq!(events.len(), 1);
    assert!(emitted_at.elapsed() < MAX_WAIT + Duration::from_secs(1));
}

#[test]
fn long_poll_sees_emits_from_another_handle() {
    // Two engines on one file share no in-process notifier, so the reader
    // only finds the message by polling.
    let dir = tempfile::tempdir().unwrap();
    let listener = Arc::new(Engine::open(&fast_config(&dir)).unwrap());
    let emitter = Engine::open(&fast_config(&dir)).unwrap();
    emitter.emit_event("status", "warm-up").unwrap();

    let reader = spawn_reader(&listener, "status");
    let emitted_at = Instant::now();
    emitter.emit_event("status", "m1").unwrap();

    assert_eq!(reader.join().unwrap().unwrap(), vec![json!("m1")]);
    assert!(emitted_at.elapsed() < MAX_WAIT + Duration::from_secs(1));
}

#[test]
fn non_json_message_is_returned_as_string() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(Engine::open(&fast_config(&dir)).unwrap());
    engine.emit_event("raw", "seed").unwrap();

    let reader = spawn_reader(&engine, "raw");
    let conn = rusqlite::Connection::open(dir.path().join("events.db")).unwrap();
    conn.execute(
        "INSERT INTO taskq_events_raw (message) VALUES (?1)",
        ["not json at all"],
    )
    .unwrap();

    assert_eq!(
        reader.join().unwrap().unwrap(),
        vec![json!("not json at all")]
    );
}
