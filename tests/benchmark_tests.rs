//! Performance benchmarks for the message hot paths

use client::flightlog::dedup_adjacent;
use client::router::{AutoProcessor, Inbox, Route, Router};
use client::store::MemoryStore;
use client::telemetry::TelemetryEngine;
use client::transport::{LineFramer, Outbound};
use client::waiter::WaiterRegistry;
use serde_json::json;
use shared::{parse_chat_line, InboundMessage, RatingCategory, RatingTable, TAG_CHAT};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Benchmarks the chat matchers over a mix of connect, kill and noise lines
#[test]
fn benchmark_chat_parsing() {
    let lines = [
        "Ace has connected.",
        "Rival has disconnected.",
        "Big Ace killed F/A-26B (The Rival) with AIM-120C.",
        "gg everyone",
    ];

    let iterations = 100_000;
    let start = Instant::now();

    let mut recognised = 0;
    for i in 0..iterations {
        if parse_chat_line(lines[i % lines.len()]).is_some() {
            recognised += 1;
        }
    }

    let duration = start.elapsed();
    println!(
        "Chat parsing: {} lines in {:?} ({:.2} ns/line)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert_eq!(recognised, iterations / 4 * 3);
    // Should complete in under 2 seconds
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks the rating formula lookup
#[test]
fn benchmark_rating_delta() {
    let table = RatingTable::default();
    let weapons = ["AIM-9", "AIM-120C", "GAU-8", "unknown"];
    let aircraft = ["F-45A", "T-55", "EF-24G", "unknown"];

    let iterations = 1_000_000;
    let start = Instant::now();

    let mut total = 0.0;
    for i in 0..iterations {
        total += table.delta(weapons[i % 4], aircraft[(i / 4) % 4]);
    }

    let duration = start.elapsed();
    println!(
        "Rating delta: {} lookups in {:?} ({:.2} ns/lookup)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert!(total > 0.0);
    // Should complete in under 2 seconds
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks framing a chunked byte stream into lines
#[test]
fn benchmark_line_framing() {
    let line = InboundMessage::tagged(TAG_CHAT, json!({ "steamid": "1", "msg": "Ace has connected." }))
        .to_line();
    let mut stream = String::new();
    for _ in 0..10_000 {
        stream.push_str(&line);
        stream.push('\n');
    }
    let bytes = stream.as_bytes();

    let start = Instant::now();

    let mut framer = LineFramer::new();
    let mut lines = 0;
    for chunk in bytes.chunks(1500) {
        lines += framer.push(chunk).len();
    }

    let duration = start.elapsed();
    println!(
        "Line framing: {} bytes into {} lines in {:?}",
        bytes.len(),
        lines,
        duration
    );

    assert_eq!(lines, 10_000);
    assert_eq!(framer.pending(), 0);
    // Should complete in under 1 second
    assert!(duration.as_millis() < 1000);
}

/// Benchmarks routing untagged, raw and unclaimed tagged lines
#[test]
fn benchmark_router_dispatch() {
    let registry = WaiterRegistry::new();
    registry.set_online();
    let inbox = Arc::new(Inbox::new(256));
    let (outbound, _rx) = Outbound::channel();
    let mut router = Router::new(registry, Arc::clone(&inbox), outbound);

    let lines = [
        InboundMessage::tagged("Status", json!({ "players": 4 })).to_line(),
        r#"{"type":"heartbeat"}"#.to_string(),
        "not json at all".to_string(),
    ];

    let iterations = 50_000;
    let start = Instant::now();

    for i in 0..iterations {
        assert_eq!(router.route_line(&lines[i % lines.len()]), Route::Inbox);
    }

    let duration = start.elapsed();
    println!(
        "Router dispatch: {} lines in {:?} ({:.2} μs/line)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    // Inbox is bounded
    assert_eq!(inbox.len(), 256);
    // Should complete in under 3 seconds
    assert!(duration.as_millis() < 3000);
}

/// Benchmarks delivery into a registry holding many outstanding waiters
#[test]
fn benchmark_waiter_delivery() {
    let registry = WaiterRegistry::new();
    registry.set_online();

    let tags: Vec<String> = (0..1000).map(|i| format!("Reply{}", i)).collect();
    let handles: Vec<_> = tags
        .iter()
        .map(|tag| registry.register(&[tag.as_str()], Duration::from_secs(60), true))
        .collect();

    let start = Instant::now();

    let mut delivered = 0;
    for tag in &tags {
        delivered += registry.deliver(&InboundMessage::tagged(tag, json!(null)));
    }

    let duration = start.elapsed();
    println!(
        "Waiter delivery: {} messages across {} waiters in {:?}",
        tags.len(),
        handles.len(),
        duration
    );

    assert_eq!(delivered, 1000);
    assert!(registry.is_empty());
    // Should complete in under 2 seconds
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks kill processing for a full lobby
#[test]
fn benchmark_telemetry_kills() {
    let engine = TelemetryEngine::new(
        Arc::new(MemoryStore::new()),
        RatingTable::default(),
        RatingCategory::Bvr,
    );
    let (outbound, mut rx) = Outbound::channel();

    let players = 16;
    for i in 0..players {
        let connect = InboundMessage::tagged(
            TAG_CHAT,
            json!({ "steamid": i.to_string(), "msg": format!("Pilot{} has connected.", i) }),
        );
        assert!(engine.process(&connect, &outbound));
    }

    let iterations = 10_000;
    let start = Instant::now();

    for i in 0..iterations {
        let killer = i % players;
        let target = (i + 1) % players;
        let kill = InboundMessage::tagged(
            TAG_CHAT,
            json!({
                "steamid": killer.to_string(),
                "msg": format!("Pilot{} killed F-45A (Pilot{}) with AIM-120C.", killer, target),
            }),
        );
        engine.process(&kill, &outbound);
    }

    let duration = start.elapsed();
    println!(
        "Telemetry kills: {} kills in {:?} ({:.2} μs/kill)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert_eq!(engine.event_count(), iterations);
    let mut announced = 0;
    while rx.try_recv().is_ok() {
        announced += 1;
    }
    assert_eq!(announced, iterations);
    // Should complete in under 5 seconds
    assert!(duration.as_millis() < 5000);
}

/// Benchmarks flight log de-duplication
#[test]
fn benchmark_flight_log_dedup() {
    let lines: Vec<String> = (0..100_000).map(|i| format!("[{}] event", i / 3)).collect();

    let start = Instant::now();
    let deduped = dedup_adjacent(&lines);
    let duration = start.elapsed();

    println!("Flight log dedup: 100000 lines in {:?}", duration);

    assert_eq!(deduped.len(), 33_334);
    // Should complete in under 1 second
    assert!(duration.as_millis() < 1000);
}
