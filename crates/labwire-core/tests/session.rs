//! End-to-end session tests against simulated instruments

use labwire_core::prelude::*;
use labwire_core::sim::{AckStyle, LineFault, Silent, SimMotor, SimOpener, SimSensor, WireEvent};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn fast_motor() -> MotorConfig {
    MotorConfig {
        port: Some("MOTOR".to_string()),
        probe_timeout_ms: 100,
        ack_timeout_ms: 200,
        settle_ms: 0,
        direction: DirectionPolicy::Manual,
        timing: LinkTiming {
            rts_settle_ms: 1,
            ..LinkTiming::default()
        },
        ..MotorConfig::default()
    }
}

fn fast_sensor() -> SensorConfig {
    SensorConfig {
        read_timeout_ms: 200,
        discovery_timeout_ms: 150,
        open_settle_ms: 0,
        ..SensorConfig::default()
    }
}

#[tokio::test]
async fn test_prober_walks_baud_rates_in_order() {
    init_tracing();
    let opener = SimOpener::new().with_device("MOTOR", SimMotor::new(BaudRate::B38400));
    let session = MotorSession::new(MotorDriver::new(fast_motor()), Arc::new(opener.clone()));

    let connected = session.connect(None).await.unwrap();
    assert_eq!(connected.params.baud_rate, BaudRate::B38400);

    let tried: Vec<BaudRate> = opener.attempts().iter().map(|p| p.baud_rate).collect();
    assert_eq!(tried, vec![BaudRate::B9600, BaudRate::B19200, BaudRate::B38400]);

    // Each rejected candidate is closed before the next one opens
    let lifecycle: Vec<&'static str> = opener
        .wire_log()
        .events()
        .iter()
        .filter_map(|e| match e {
            WireEvent::Open { .. } => Some("open"),
            WireEvent::Close { .. } => Some("close"),
            _ => None,
        })
        .collect();
    assert_eq!(lifecycle, vec!["open", "close", "open", "close", "open"]);
}

#[tokio::test]
async fn test_no_device_reports_last_response() {
    init_tracing();
    let opener = SimOpener::new().with_device("MOTOR", Silent);
    let session = MotorSession::new(MotorDriver::new(fast_motor()), Arc::new(opener));

    match session.connect(None).await {
        Err(ProtocolError::NoDeviceFound {
            attempts,
            last_response,
        }) => {
            assert_eq!(attempts, BaudRate::ALL.len());
            assert_eq!(last_response, None);
        }
        other => panic!("expected NoDeviceFound, got {:?}", other.map(|c| c.params)),
    }
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_quirk_acknowledgement_through_session() {
    init_tracing();
    let motor = SimMotor::new(BaudRate::B9600).with_ack(AckStyle::Quirk(vec![0x7e, 0x25, 0x41, 0x0d]));
    let opener = SimOpener::new().with_device("MOTOR", motor.clone());
    let session = MotorSession::new(MotorDriver::new(fast_motor()), Arc::new(opener));

    session.connect(None).await.unwrap();
    let ack = session.move_to(-900).await.unwrap();
    assert!(matches!(ack.pattern, AckPattern::Literal(_)));
    assert_eq!(motor.moves(), vec![-900]);
}

#[tokio::test]
async fn test_transactions_never_interleave() {
    init_tracing();
    let motor = SimMotor::new(BaudRate::B9600).with_latency(Duration::from_millis(30));
    let opener = SimOpener::new().with_device("MOTOR", motor.clone());
    let log = opener.wire_log();
    let session = MotorSession::new(MotorDriver::new(fast_motor()), Arc::new(opener));
    session.connect(None).await.unwrap();
    let before = log.events().len();

    let a = {
        let session = session.clone();
        tokio::spawn(async move { session.move_to(100).await })
    };
    let b = {
        let session = session.clone();
        tokio::spawn(async move { session.move_to(200).await })
    };
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    // Every write is answered before the next write goes out
    let mut awaiting_reply = false;
    for event in &log.events()[before..] {
        match event {
            WireEvent::Write { .. } => {
                assert!(!awaiting_reply, "second request sent before first reply");
                awaiting_reply = true;
            }
            WireEvent::Read { .. } => awaiting_reply = false,
            _ => {}
        }
    }
    let mut moves = motor.moves();
    moves.sort();
    assert_eq!(moves, vec![100, 200]);
}

#[tokio::test]
async fn test_silent_sensor_poll_is_deadline_bounded() {
    init_tracing();
    let sensor_opener = SimOpener::new().with_device("THP", SimSensor::new(20.0, 45.0, 1005.0));
    let session = SensorSession::new(SensorPoller::new(fast_sensor()), Arc::new(sensor_opener));
    session.connect(None).await.unwrap();
    assert!(session.poll_sensor().await.is_ok());

    let silent_opener = SimOpener::new().with_device("THP", Silent);
    let silent = SensorSession::new(SensorPoller::new(fast_sensor()), Arc::new(silent_opener));
    let start = Instant::now();
    assert!(matches!(
        silent.connect(None).await,
        Err(ProtocolError::PortNotFound { .. })
    ));
    assert!(start.elapsed() < Duration::from_millis(150 + 300));
}

#[tokio::test]
async fn test_reconnect_replaces_link() {
    init_tracing();
    let opener = SimOpener::new().with_device("MOTOR", SimMotor::new(BaudRate::B9600));
    let session = MotorSession::new(MotorDriver::new(fast_motor()), Arc::new(opener));

    session.connect(None).await.unwrap();
    let mut states = session.subscribe();
    session.connect(None).await.unwrap();
    assert!(session.is_connected());
    assert!(states.has_changed().unwrap());
    session.move_to(5).await.unwrap();
}

/// Most handles open at once on `port`, replayed from the wire log
fn peak_open_handles(events: &[WireEvent], port: &str) -> usize {
    let mut open = 0usize;
    let mut peak = 0usize;
    for event in events {
        match event {
            WireEvent::Open { port: p, .. } if p == port => {
                open += 1;
                peak = peak.max(open);
            }
            WireEvent::Close { port: p } if p == port => open = open.saturating_sub(1),
            _ => {}
        }
    }
    peak
}

#[tokio::test]
async fn test_reconnect_during_transaction_closes_link_first() {
    init_tracing();
    let motor = SimMotor::new(BaudRate::B9600).with_ack(AckStyle::Silent);
    let opener = SimOpener::new().with_device("MOTOR", motor);
    let log = opener.wire_log();
    let config = MotorConfig {
        ack_timeout_ms: 5000,
        ..fast_motor()
    };
    let session = MotorSession::new(MotorDriver::new(config), Arc::new(opener));
    session.connect(None).await.unwrap();

    let pending = {
        let session = session.clone();
        tokio::spawn(async move { session.move_to(90).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let connected = session.connect(None).await.unwrap();
    assert_eq!(connected.params.baud_rate, BaudRate::B9600);
    assert!(matches!(
        pending.await.unwrap(),
        Err(MotorError::Transport(TransportError::Closed))
    ));

    let events = log.events();
    assert_eq!(peak_open_handles(&events, "MOTOR"), 1);
    let opens = events
        .iter()
        .filter(|e| matches!(e, WireEvent::Open { .. }))
        .count();
    assert_eq!(opens, 2);
    assert!(session.is_connected());
}

#[tokio::test]
async fn test_link_failure_forces_disconnected() {
    init_tracing();
    let opener = SimOpener::new().with_device("MOTOR", SimMotor::new(BaudRate::B9600));
    let session = MotorSession::new(MotorDriver::new(fast_motor()), Arc::new(opener.clone()));
    let mut states = session.subscribe();
    session.connect(None).await.unwrap();
    let _ = states.borrow_and_update();

    opener.set_fault("MOTOR", LineFault::Unplugged);
    assert!(matches!(session.move_to(45).await, Err(MotorError::Transport(_))));
    assert_eq!(session.state(), SessionState::Disconnected);
    assert_eq!(session.parameters(), None);
    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), SessionState::Disconnected);

    // No automatic reconnect
    opener.clear_fault("MOTOR");
    assert!(matches!(session.move_to(45).await, Err(MotorError::NotConnected)));
}

#[tokio::test]
async fn test_sensor_poll_timeout_keeps_session() {
    init_tracing();
    let opener = SimOpener::new().with_device("THP", SimSensor::new(20.0, 45.0, 1005.0));
    let config = fast_sensor();
    let read_timeout = config.read_timeout();
    let session = SensorSession::new(SensorPoller::new(config), Arc::new(opener.clone()));
    session.connect(None).await.unwrap();

    opener.set_fault("THP", LineFault::Mute);
    let start = Instant::now();
    assert!(matches!(
        session.poll_sensor().await,
        Err(SensorError::Timeout { .. })
    ));
    assert!(start.elapsed() >= read_timeout);
    assert!(start.elapsed() < read_timeout + Duration::from_millis(300));
    assert!(session.is_connected());

    opener.clear_fault("THP");
    let reading = session.poll_sensor().await.unwrap();
    assert_eq!(reading.temperature, Some(20.0));
}
