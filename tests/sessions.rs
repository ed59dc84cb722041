mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pretty_assertions::assert_eq;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use common::{fast_config, hr, wait_state, wait_until};
use polar_rec::protocol::{
    encode_start_stream, encode_stop_stream, HEART_RATE_MEASUREMENT_UUID, PMD_CONTROL_UUID,
    PMD_DATA_UUID, PMD_MEASUREMENT_PPG, PPG_FREQUENCY, PPG_RESOLUTION,
};
use polar_rec::registry::{DeviceAssignment, SessionRegistry};
use polar_rec::session::{DeviceSession, SessionMode};
use polar_rec::transport::simulated::SimulatedTransport;
use polar_rec::types::{DeviceIdentity, Sample, SessionEvent, SessionState, Subject};

const HR_ONLY: SessionMode = SessionMode::Record { ppg: false };

fn session_for(
    transport: &Arc<SimulatedTransport>,
    device: &DeviceIdentity,
    mode: SessionMode,
) -> DeviceSession {
    DeviceSession::new(
        device.clone(),
        Arc::clone(transport) as _,
        Arc::new(fast_config()),
        mode,
        None,
        CancellationToken::new(),
    )
}

#[tokio::test(start_paused = true)]
async fn streams_heart_rate_in_arrival_order() {
    let transport = Arc::new(SimulatedTransport::new());
    let dev = transport.add_device(DeviceIdentity::named("Polar OH1 85E77F28"));
    let mut session = session_for(&transport, dev.identity(), HR_ONLY);
    let mut samples = session.outbound_samples().unwrap();
    assert!(session.outbound_samples().is_none());

    let mut states = session.watch_state();
    session.start();
    wait_state(&mut states, SessionState::Streaming).await;
    assert!(dev.is_subscribed(HEART_RATE_MEASUREMENT_UUID));
    assert!(!dev.is_subscribed(PMD_DATA_UUID));

    for bpm in [61, 62, 63] {
        assert!(dev.notify(HEART_RATE_MEASUREMENT_UUID, hr(bpm)).await);
    }
    let mut bpms = Vec::new();
    for _ in 0..3 {
        match samples.recv().await {
            Some(Sample::HeartRate(s)) => bpms.push(s.bpm),
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(bpms, vec![61, 62, 63]);

    session.stop().await;
    assert_eq!(session.state(), SessionState::Closed);
    assert!(!dev.is_connected());
    assert!(samples.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn link_loss_reconnects_with_monotonic_timestamps() {
    let transport = Arc::new(SimulatedTransport::new());
    let dev = transport.add_device(DeviceIdentity::named("Polar OH1 6EFADA2E"));
    let mut session = session_for(&transport, dev.identity(), HR_ONLY);
    let mut samples = session.outbound_samples().unwrap();
    let mut states = session.watch_state();
    session.start();
    wait_state(&mut states, SessionState::Streaming).await;

    let t0 = Utc::now();
    assert!(dev.notify_at(HEART_RATE_MEASUREMENT_UUID, hr(70), t0).await);
    let before = samples.recv().await.unwrap();

    dev.drop_link();
    wait_state(&mut states, SessionState::Reconnecting).await;
    assert!(!dev.notify(HEART_RATE_MEASUREMENT_UUID, hr(71)).await);
    assert!(
        tokio::time::timeout(Duration::from_millis(5), samples.recv())
            .await
            .is_err(),
        "no samples while reconnecting"
    );

    wait_state(&mut states, SessionState::Streaming).await;
    assert_eq!(dev.connections(), 2);

    // A receive time from before the gap must not move the stream backwards.
    let stale = t0 - chrono::Duration::seconds(5);
    assert!(dev.notify_at(HEART_RATE_MEASUREMENT_UUID, hr(72), stale).await);
    let after = samples.recv().await.unwrap();
    assert!(after.timestamp() >= before.timestamp());
    assert_eq!(after.timestamp(), t0);

    session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_close_the_session() {
    let transport = Arc::new(SimulatedTransport::new());
    let dev = transport.add_device(DeviceIdentity::named("Polar OH1 84BF0B2D"));
    dev.set_unreachable(true);

    let (events_tx, mut events) = tokio::sync::mpsc::unbounded_channel();
    let mut session = DeviceSession::new(
        dev.identity().clone(),
        Arc::clone(&transport) as _,
        Arc::new(fast_config()),
        HR_ONLY,
        Some(events_tx),
        CancellationToken::new(),
    );
    session.start();
    assert_eq!(session.wait_settled().await, SessionState::Closed);
    assert_eq!(dev.connections(), 0);
    assert!(session.last_error().unwrap().contains("3 attempt"));

    let mut lost = Vec::new();
    let mut reconnecting = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            SessionEvent::DeviceLost { device, .. } => lost.push(device),
            SessionEvent::StateChanged {
                state: SessionState::Reconnecting,
                ..
            } => reconnecting += 1,
            _ => {}
        }
    }
    assert_eq!(lost, vec![dev.identity().clone()]);
    assert_eq!(reconnecting, 2);
}

#[tokio::test(start_paused = true)]
async fn backoff_doubles_between_failed_attempts() {
    let transport = Arc::new(SimulatedTransport::new());
    let dev = transport.add_device(DeviceIdentity::named("Polar OH1 6E85CB22"));
    dev.fail_next_connects(2);

    let mut session = session_for(&transport, dev.identity(), HR_ONLY);
    let started = Instant::now();
    session.start();
    assert_eq!(session.wait_settled().await, SessionState::Streaming);
    // 20 ms after the first failure, 40 ms after the second.
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(60) && elapsed < Duration::from_millis(70),
        "{elapsed:?}"
    );
    session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn missing_characteristic_retries_then_gives_up() {
    let transport = Arc::new(SimulatedTransport::new());
    let dev = transport.add_device(DeviceIdentity::named("Polar OH1 84BF1A2F"));
    dev.remove_characteristic(HEART_RATE_MEASUREMENT_UUID);

    let (events_tx, mut events) = tokio::sync::mpsc::unbounded_channel();
    let mut session = DeviceSession::new(
        dev.identity().clone(),
        Arc::clone(&transport) as _,
        Arc::new(fast_config()),
        HR_ONLY,
        Some(events_tx),
        CancellationToken::new(),
    );
    session.start();
    assert_eq!(session.wait_settled().await, SessionState::Closed);

    // Every attempt connects, fails to subscribe and hands the link back.
    assert_eq!(dev.connections(), 3);
    assert_eq!(dev.disconnects(), 3);
    assert!(!dev.is_connected());
    assert!(session.last_error().unwrap().contains("3 attempt"));

    let mut lost = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::DeviceLost { device, reason } = event {
            assert!(reason.contains("subscribe error"), "{reason}");
            lost.push(device);
        }
    }
    assert_eq!(lost, vec![dev.identity().clone()]);
}

#[tokio::test(start_paused = true)]
async fn malformed_notifications_are_dropped_not_fatal() {
    let transport = Arc::new(SimulatedTransport::new());
    let dev = transport.add_device(DeviceIdentity::named("Polar OH1 D025F429"));
    let (events_tx, mut events) = tokio::sync::mpsc::unbounded_channel();
    let mut session = DeviceSession::new(
        dev.identity().clone(),
        Arc::clone(&transport) as _,
        Arc::new(fast_config()),
        HR_ONLY,
        Some(events_tx),
        CancellationToken::new(),
    );
    let mut samples = session.outbound_samples().unwrap();
    session.start();
    assert_eq!(session.wait_settled().await, SessionState::Streaming);

    assert!(dev.notify(HEART_RATE_MEASUREMENT_UUID, vec![0x01, 0x48]).await);
    assert!(dev.notify(HEART_RATE_MEASUREMENT_UUID, hr(64)).await);
    match samples.recv().await {
        Some(Sample::HeartRate(s)) => assert_eq!(s.bpm, 64),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(session.state(), SessionState::Streaming);

    let mut malformed = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, SessionEvent::MalformedPayload { .. }) {
            malformed += 1;
        }
    }
    assert_eq!(malformed, 1);
    session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn ppg_mode_starts_the_pmd_stream() {
    let transport = Arc::new(SimulatedTransport::new());
    let dev = transport.add_device(DeviceIdentity::named("Polar OH1 85EA7F2B"));
    let mut session = session_for(&transport, dev.identity(), SessionMode::Record { ppg: true });
    let mut samples = session.outbound_samples().unwrap();
    session.start();
    assert_eq!(session.wait_settled().await, SessionState::Streaming);

    assert!(dev.is_subscribed(PMD_DATA_UUID));
    assert_eq!(
        dev.writes(),
        vec![(
            PMD_CONTROL_UUID,
            encode_start_stream(PMD_MEASUREMENT_PPG, PPG_FREQUENCY, PPG_RESOLUTION)
        )]
    );

    let mut frame = vec![PMD_MEASUREMENT_PPG];
    frame.extend_from_slice(&0u64.to_le_bytes());
    frame.push(0x00);
    frame.extend_from_slice(&[1, 0, 0, 2, 0, 0, 3, 0, 0, 0xff, 0xff, 0xff]);
    frame.extend_from_slice(&[4, 0, 0, 5, 0, 0, 6, 0, 0, 0, 0, 0x80]);
    assert!(dev.notify(PMD_DATA_UUID, frame).await);

    let mut readings = Vec::new();
    for _ in 0..2 {
        match samples.recv().await {
            Some(Sample::Ppg(s)) => readings.push(s.channel_readings),
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(readings, vec![vec![1, 2, 3, -1], vec![4, 5, 6, -8_388_608]]);

    session.stop().await;
    assert_eq!(
        dev.writes().last(),
        Some(&(PMD_CONTROL_UUID, encode_stop_stream(PMD_MEASUREMENT_PPG).to_vec()))
    );
}

#[tokio::test(start_paused = true)]
async fn stop_hands_off_a_whole_decoded_batch() {
    let transport = Arc::new(SimulatedTransport::new());
    let dev = transport.add_device(DeviceIdentity::named("Polar OH1 85EA7F2B"));
    let config = polar_rec::config::RecorderConfig {
        channel_capacity: 1,
        ..fast_config()
    };
    let mut session = DeviceSession::new(
        dev.identity().clone(),
        Arc::clone(&transport) as _,
        Arc::new(config),
        SessionMode::Record { ppg: true },
        None,
        CancellationToken::new(),
    );
    let mut samples = session.outbound_samples().unwrap();
    session.start();
    assert_eq!(session.wait_settled().await, SessionState::Streaming);

    let mut frame = vec![PMD_MEASUREMENT_PPG];
    frame.extend_from_slice(&0u64.to_le_bytes());
    frame.push(0x00);
    for i in 1..=5u8 {
        frame.extend_from_slice(&[i, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    }
    assert!(dev.notify(PMD_DATA_UUID, frame).await);

    // The first sample proves the batch is decoded; the rest are still queued
    // behind a full channel when the stop arrives.
    let mut firsts = Vec::new();
    match samples.recv().await {
        Some(Sample::Ppg(s)) => firsts.push(s.channel_readings[0]),
        other => panic!("unexpected {other:?}"),
    }
    let drain = async {
        while let Some(sample) = samples.recv().await {
            match sample {
                Sample::Ppg(s) => firsts.push(s.channel_readings[0]),
                other => panic!("unexpected {other:?}"),
            }
        }
    };
    tokio::join!(session.stop(), drain);

    assert_eq!(firsts, vec![1, 2, 3, 4, 5]);
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn reads_require_a_live_link() {
    let transport = Arc::new(SimulatedTransport::new());
    let dev = transport.add_device(DeviceIdentity::named("Polar OH1 84BF1A2F"));
    dev.set_battery(42);
    let mut session = session_for(&transport, dev.identity(), SessionMode::Query);

    assert!(matches!(
        session.query_battery().await,
        Err(polar_rec::Error::NotConnected)
    ));
    session.start();
    assert_eq!(session.wait_settled().await, SessionState::Streaming);
    assert_eq!(session.query_battery().await.unwrap(), 42);
    assert!(!dev.is_subscribed(HEART_RATE_MEASUREMENT_UUID));

    session.stop().await;
    session.stop().await;
    assert!(matches!(
        session.query_battery().await,
        Err(polar_rec::Error::NotConnected)
    ));
}

// ── Registry ─────────────────────────────────────────────────────────────────

fn pool(transport: &SimulatedTransport, n: usize) -> Vec<DeviceIdentity> {
    (1..=n)
        .map(|i| {
            transport
                .add_device(DeviceIdentity::named(format!("Polar OH1 d{i}")))
                .identity()
                .clone()
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn unassigned_devices_are_never_connected() {
    let transport = Arc::new(SimulatedTransport::new());
    let devices = pool(&transport, 3);
    let subjects = [Subject::from("A"), Subject::from("B")];
    let assignment = Arc::new(DeviceAssignment::new(&devices, &subjects).unwrap());

    let cancel = CancellationToken::new();
    let mut registry = SessionRegistry::new(
        Arc::clone(&transport) as _,
        assignment,
        Arc::new(fast_config()),
        HR_ONLY,
        &cancel,
    );
    assert_eq!(registry.sessions().len(), 2);
    assert!(registry.session(&devices[2]).is_none());

    let report = registry.start_all().await;
    assert_eq!(report.streaming, devices[..2].to_vec());
    assert!(report.failed.is_empty() && report.pending.is_empty());

    let streams = registry.take_streams();
    let pairs: Vec<(String, String)> = streams
        .iter()
        .map(|s| (s.subject.to_string(), s.device.name.clone()))
        .collect();
    assert_eq!(
        pairs,
        vec![
            ("A".to_string(), "Polar OH1 d1".to_string()),
            ("B".to_string(), "Polar OH1 d2".to_string()),
        ]
    );

    let connected: Vec<bool> = devices
        .iter()
        .map(|d| transport.device(d).unwrap().is_connected())
        .collect();
    assert_eq!(connected, vec![true, true, false]);

    registry.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn partial_start_is_not_fatal() {
    let transport = Arc::new(SimulatedTransport::new());
    let good = transport.add_device(DeviceIdentity::named("Polar OH1 good"));
    let bad = transport.add_device(DeviceIdentity::named("Polar OH1 bad"));
    bad.set_unreachable(true);
    let devices = vec![good.identity().clone(), bad.identity().clone()];
    let assignment = DeviceAssignment::new(&devices, &[Subject::from("A"), Subject::from("B")])
        .unwrap();

    let cancel = CancellationToken::new();
    let mut registry = SessionRegistry::new(
        Arc::clone(&transport) as _,
        Arc::new(assignment),
        Arc::new(fast_config()),
        HR_ONLY,
        &cancel,
    );
    let report = registry.start_all().await;
    assert_eq!(report.streaming, vec![good.identity().clone()]);
    assert_eq!(report.failed, vec![bad.identity().clone()]);
    registry.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn stop_all_during_hanging_connect_returns_within_grace() {
    let transport = Arc::new(SimulatedTransport::new());
    let devices = pool(&transport, 2);
    let hanging = transport.add_device(DeviceIdentity::named("Polar OH1 hang"));
    hanging.set_connect_delay(Duration::from_secs(600));
    let mut all = devices.clone();
    all.push(hanging.identity().clone());

    let config = polar_rec::config::RecorderConfig {
        connect_timeout_ms: 10_000,
        start_timeout_ms: 100,
        ..fast_config()
    };
    let grace = config.stop_grace();
    let subjects = [Subject::from("A"), Subject::from("B"), Subject::from("C")];
    let cancel = CancellationToken::new();
    let mut registry = SessionRegistry::new(
        Arc::clone(&transport) as _,
        Arc::new(DeviceAssignment::new(&all, &subjects).unwrap()),
        Arc::new(config),
        HR_ONLY,
        &cancel,
    );

    let report = registry.start_all().await;
    assert_eq!(report.pending, vec![hanging.identity().clone()]);
    assert_eq!(report.streaming.len(), 2);

    let started = Instant::now();
    registry.stop_all().await;
    assert!(started.elapsed() <= grace);
    assert!(registry
        .sessions()
        .iter()
        .all(|s| s.state() == SessionState::Closed));
    assert_eq!(hanging.connections(), 0);

    // Stopping twice is harmless.
    registry.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn queued_connects_do_not_spend_a_siblings_timeout() {
    // One connect at a time: the sibling waits behind two devices that each
    // hold the adapter for a full connect timeout.
    let transport = Arc::new(SimulatedTransport::serialized());
    let absent: Vec<_> = ["Polar OH1 gone1", "Polar OH1 gone2"]
        .into_iter()
        .map(|name| {
            let dev = transport.add_device(DeviceIdentity::named(name));
            dev.set_connect_delay(Duration::from_secs(600));
            dev
        })
        .collect();
    let sibling = transport.add_device(DeviceIdentity::named("Polar OH1 here"));
    let devices = vec![
        absent[0].identity().clone(),
        absent[1].identity().clone(),
        sibling.identity().clone(),
    ];

    let subjects = [Subject::from("A"), Subject::from("B"), Subject::from("C")];
    let cancel = CancellationToken::new();
    let mut registry = SessionRegistry::new(
        Arc::clone(&transport) as _,
        Arc::new(DeviceAssignment::new(&devices, &subjects).unwrap()),
        Arc::new(fast_config()),
        HR_ONLY,
        &cancel,
    );
    let report = registry.start_all().await;
    assert_eq!(report.streaming, vec![sibling.identity().clone()]);

    let session = registry.session(sibling.identity()).unwrap();
    assert_eq!(session.state(), SessionState::Streaming);
    assert_eq!(session.last_error(), None);
    assert_eq!(sibling.connections(), 1);
    assert!(absent.iter().all(|d| d.connections() == 0));

    registry.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn cancelling_the_run_token_closes_every_session() {
    let transport = Arc::new(SimulatedTransport::new());
    let devices = pool(&transport, 2);
    let cancel = CancellationToken::new();
    let mut registry = SessionRegistry::new(
        Arc::clone(&transport) as _,
        Arc::new(DeviceAssignment::new(&devices, &[Subject::from("A"), Subject::from("B")]).unwrap()),
        Arc::new(fast_config()),
        HR_ONLY,
        &cancel,
    );
    registry.start_all().await;

    let mut watchers: Vec<_> = registry.sessions().iter().map(|s| s.watch_state()).collect();
    cancel.cancel();
    for states in &mut watchers {
        wait_state(states, SessionState::Closed).await;
    }
    wait_until(|| devices.iter().all(|d| !transport.device(d).unwrap().is_connected())).await;
}
