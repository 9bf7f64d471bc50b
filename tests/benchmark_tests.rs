//! Performance benchmarks for the relay hot paths

use serde_json::json;
use server::client_manager::Outbox;
use server::config::RelayConfig;
use server::lobby::LobbySession;
use server::router::{parse_driver_line, Router};
use server::services::Services;
use shared::{Event, Lz4Codec, PacketCodec};
use std::time::Instant;
use uuid::Uuid;

fn entity_event(method: &str, entity: u32) -> Event {
    Event::new("MessageHandler", method, vec![json!(format!("E{entity}")), json!("F-45A")])
        .with_lobby("L1")
}

fn traffic(count: usize) -> Vec<Event> {
    (0..count)
        .map(|i| {
            Event::new(
                "PlayerVehicle",
                "UpdatePosition",
                vec![json!(i), json!(i as f64 * 0.5), json!(1200.0), json!([0.1, 0.2, 0.3])],
            )
            .with_entity(format!("{}", i % 64))
            .with_lobby("L1")
        })
        .collect()
}

/// Benchmarks resync maintenance under spawn/destroy churn
#[test]
fn benchmark_resync_maintenance() {
    let mut lobby = LobbySession::new("L1");
    let iterations = 2_000;
    let start = Instant::now();

    for i in 0..iterations {
        lobby.maintain_resync(&entity_event("NetInstantiate", i));
        if i % 2 == 0 {
            lobby.maintain_resync(&entity_event("NetDestroy", i));
        }
    }

    let duration = start.elapsed();
    println!(
        "Resync maintenance: {} spawns in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert_eq!(lobby.resync_set().len(), iterations as usize / 2);
    // Pruning scans the set, so this stays loose
    assert!(duration.as_secs() < 10);
}

/// Benchmarks block encoding and decoding of one busy tick
#[test]
fn benchmark_codec_throughput() {
    let codec = Lz4Codec;
    let batch = traffic(500);
    let iterations = 200;
    let start = Instant::now();
    let mut bytes = Vec::new();

    for _ in 0..iterations {
        bytes = codec.encode(&batch).unwrap();
        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded.len(), batch.len());
    }

    let duration = start.elapsed();
    println!(
        "Codec: {} ticks of {} events in {:?}, {} bytes per block",
        iterations,
        batch.len(),
        duration,
        bytes.len()
    );

    assert!(duration.as_secs() < 10);
}

/// Benchmarks parsing of newline-delimited driver traffic
#[test]
fn benchmark_driver_line_parsing() {
    let lines: Vec<String> = traffic(1_000)
        .iter()
        .map(|event| serde_json::to_string(event).unwrap())
        .collect();
    let start = Instant::now();

    for line in &lines {
        assert!(parse_driver_line(line).is_ok());
    }

    let duration = start.elapsed();
    println!("Driver parsing: {} lines in {:?}", lines.len(), duration);

    assert!(duration.as_millis() < 2_000);
}

/// Stress test: one tick fanning a busy lobby out to many subscribers
#[test]
fn stress_test_fan_out() {
    let config = RelayConfig {
        driver_secret: "secret".to_string(),
        ..RelayConfig::default()
    };
    let (mut router, _rx) = Router::channel(config, Services::in_memory());
    router.register_lobby("L1").unwrap();

    let mut receivers = Vec::new();
    for _ in 0..100 {
        let (outbox, rx) = Outbox::channel();
        let id = Uuid::new_v4();
        router.connect_client(id, None, outbox);
        router.subscribe_client(id, "L1");
        receivers.push(rx);
    }

    let now = Instant::now();
    for event in traffic(1_000) {
        router.route_inbound_event(event, now);
    }

    let start = Instant::now();
    router.network_tick(now);
    let duration = start.elapsed();
    println!("Fan-out: 1000 events to {} subscribers in {:?}", receivers.len(), duration);

    assert_eq!(router.stats().pooled_events, 0);
    assert!(duration.as_millis() < 2_000);
}
