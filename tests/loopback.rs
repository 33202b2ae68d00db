//! End-to-end runs over the in-memory loopback pair.
//!
//! The loopback delay is known exactly, so the measured RTT can be checked
//! against ground truth instead of just sanity bounds.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use linkprobe::channel::{arbiter, LoopbackPair};
use linkprobe::config::{Config, ProbeConfig};
use linkprobe::probe::ProbeExchange;
use linkprobe::profile::{SizeMode, SizeProfile};
use linkprobe::session::{LinkBackend, Scenario, Session};
use linkprobe::traffic::TrafficGenerator;

#[test]
fn baseline_rtt_matches_the_configured_delay() {
    // 5 ms per direction: every probe should come back in roughly 10 ms.
    let pair = LoopbackPair::symmetric(Duration::from_millis(5));
    let reader = pair.master.clone();
    let write = arbiter(Box::new(pair.master));

    let config = ProbeConfig {
        interval: Duration::from_millis(50),
        timeout: Duration::from_millis(500),
        packet_size: 64,
        size_mode: None,
        history_capacity: 1000,
    };

    let mut exchange = ProbeExchange::new(write, Box::new(reader), &config)
        .with_responder(Box::new(pair.slave));
    exchange.start().unwrap();
    thread::sleep(Duration::from_secs(1));
    exchange.stop().unwrap();

    let stats = exchange.statistics();
    assert!(stats.sent >= 19, "sent only {} probes", stats.sent);
    assert!(
        stats.received >= stats.sent - 1,
        "received {} of {}",
        stats.received,
        stats.sent
    );
    assert!(stats.loss_rate < 0.1);

    let mean = stats.rtt.mean;
    assert!(
        mean >= Duration::from_millis(9) && mean <= Duration::from_millis(15),
        "mean rtt {mean:?} outside the expected window around 10 ms"
    );
    // Jitter over a constant-delay link stays small.
    assert!(stats.jitter.mean < Duration::from_millis(5));
}

#[test]
fn traffic_generator_hits_its_target_rate() {
    let pair = LoopbackPair::instant();
    let _sink = pair.slave;
    let write = arbiter(Box::new(pair.master));

    let target = 10_000.0;
    let mut generator = TrafficGenerator::new(
        write,
        Arc::new(SizeProfile::default_telemetry()),
        SizeMode::Realistic,
        target,
    );
    generator.start().unwrap();
    thread::sleep(Duration::from_secs(5));
    generator.stop().unwrap();

    let snapshot = generator.snapshot();
    let accuracy = snapshot.accuracy();
    assert!(
        (0.85..=1.15).contains(&accuracy),
        "achieved {:.0} B/s against {target:.0} B/s target (accuracy {accuracy:.2})",
        snapshot.achieved_bandwidth.bytes_per_sec
    );
    assert!(snapshot.errors == 0);
}

#[test]
fn silent_link_resolves_every_overdue_probe_as_lost() {
    let pair = LoopbackPair::instant();
    let reader = pair.master.clone();
    let write = arbiter(Box::new(pair.master));
    let _silent_slave = pair.slave;

    let config = ProbeConfig {
        interval: Duration::from_millis(50),
        timeout: Duration::from_millis(100),
        packet_size: 64,
        size_mode: None,
        history_capacity: 1000,
    };

    let mut exchange = ProbeExchange::new(write, Box::new(reader), &config);
    exchange.start().unwrap();
    thread::sleep(Duration::from_millis(500));
    exchange.stop().unwrap();

    let stats = exchange.statistics();
    assert!(stats.sent >= 8);
    assert_eq!(stats.received, 0);
    assert_eq!(stats.rtt.count, 0);
    assert!(stats.loss_rate > 0.5);

    // Everything older than the timeout was swept; only probes younger
    // than 100 ms at shutdown may still be pending.
    assert!(
        exchange.pending_count() <= 3,
        "{} probes left pending",
        exchange.pending_count()
    );
    assert!(stats.timed_out >= stats.sent.saturating_sub(3));
}

#[test]
fn probes_survive_heavy_background_traffic() {
    let pair = LoopbackPair::symmetric(Duration::from_millis(1));
    let reader = pair.master.clone();
    let write = arbiter(Box::new(pair.master));

    let config = ProbeConfig {
        interval: Duration::from_millis(40),
        timeout: Duration::from_millis(400),
        packet_size: 64,
        size_mode: None,
        history_capacity: 1000,
    };

    let mut exchange = ProbeExchange::new(Arc::clone(&write), Box::new(reader), &config)
        .with_responder(Box::new(pair.slave));
    let mut generator = TrafficGenerator::new(
        write,
        Arc::new(SizeProfile::default_telemetry()),
        SizeMode::Realistic,
        Scenario::Heavy.bandwidth(),
    );

    generator.start().unwrap();
    exchange.start().unwrap();
    thread::sleep(Duration::from_millis(800));
    generator.stop().unwrap();
    exchange.stop().unwrap();

    let stats = exchange.statistics();
    let traffic = generator.snapshot();

    // The responder filters traffic frames out and still echoes probes.
    assert!(traffic.packets_sent > 0);
    assert!(stats.sent >= 10);
    assert!(
        stats.received > stats.sent / 2,
        "received only {} of {} under load",
        stats.received,
        stats.sent
    );
}

#[test]
fn suite_reports_all_scenarios() {
    let mut config = Config::default();
    config.probe.interval = Duration::from_millis(25);
    config.probe.timeout = Duration::from_millis(300);

    let session = Session::new(config);
    let report = session
        .run_suite(
            LinkBackend::Loopback {
                delay: Duration::from_millis(1),
            },
            Duration::from_millis(400),
        )
        .unwrap();

    assert_eq!(report.scenarios.len(), 4);
    assert_eq!(report.scenarios[0].scenario, "baseline");
    assert!(report.scenarios[0].traffic.is_none());
    for scenario in &report.scenarios[1..] {
        assert!(scenario.traffic.is_some(), "{} lost its traffic snapshot", scenario.scenario);
    }
    for scenario in &report.scenarios {
        assert!(scenario.probes.sent > 0, "{} sent nothing", scenario.scenario);
    }

    // Reports must serialize for the --output path.
    let json = serde_json::to_string(&report).unwrap();
    assert!(json.contains("baseline"));
}

#[test]
fn detailed_mode_decomposes_the_round_trip() {
    let mut config = Config::default();
    config.probe.timeout = Duration::from_millis(500);

    let session = Session::new(config);
    let report = session
        .run_detailed(
            LinkBackend::Loopback {
                delay: Duration::from_millis(3),
            },
            10,
        )
        .unwrap();

    assert!(report.ok >= 9, "only {} of 10 detailed probes resolved", report.ok);
    assert_eq!(report.mismatches, 0);
    // 3 ms each way plus polling overhead.
    assert!(report.rtt.mean >= Duration::from_millis(6));
    assert!(report.rtt.mean <= Duration::from_millis(20));
}
