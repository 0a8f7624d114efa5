//! Device sessions
//!
//! A [`DeviceSession`] owns the lifecycle of one instrument link:
//!
//! ```text
//! Disconnected --connect--> Probing --found--> Connected
//!      ^                       |                   |
//!      +------ probe failed ---+                   |
//!      +------ disconnect / transport failure -----+
//! ```
//!
//! Discovery runs in the background through the [`Prober`]. Once connected,
//! transactions are serialized on the session's single transport: each one
//! holds the link until it completes (acknowledged, rejected or timed out).
//! Operations outside `Connected` fail with a not-connected error without
//! touching hardware, and a transport failure drops the session back to
//! `Disconnected`. Reconnecting is left to the caller.

use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::motor::{AckInfo, MotorDriver, MotorError};
use crate::protocol::{
    ConnectionParameters, PortOpener, Probe, ProbeSuccess, Prober, ProtocolError, SerialOpener,
    Transport, TransportError,
};
use crate::sensor::{SensorError, SensorPoller, SensorReading};

/// An instrument that can be discovered and driven over a transport
pub trait Device: Clone + Send + Sync + 'static {
    /// What a successful probe learned about the device
    type Evidence: fmt::Debug + Send + 'static;

    /// Short name used in logs
    fn kind(&self) -> &'static str;

    /// Discovery plan; `params` pins the link, otherwise candidates are scanned
    fn probe(&self, params: Option<&ConnectionParameters>, opener: &dyn PortOpener) -> Probe<Self::Evidence>;
}

/// Errors a session transaction can end with
pub trait TransactionError: From<TransportError> + Send + 'static {
    /// Error for an operation attempted outside `Connected`
    fn not_connected() -> Self;

    /// Does this error mean the link itself failed?
    fn is_transport_failure(&self) -> bool;
}

/// Connection state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    /// No link
    Disconnected,
    /// Discovery in progress
    Probing,
    /// A verified link is held
    Connected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Probing => write!(f, "probing"),
            SessionState::Connected => write!(f, "connected"),
        }
    }
}

/// Result of a successful connect
#[derive(Debug)]
pub struct Connected<E> {
    /// Parameters of the verified link
    pub params: ConnectionParameters,
    /// What the probe learned
    pub evidence: E,
}

struct Status {
    state: SessionState,
    params: Option<ConnectionParameters>,
    closer: Option<CancellationToken>,
    probe: Option<CancellationToken>,
    /// Bumped on every connect and disconnect so stale work can tell it was superseded
    generation: u64,
}

struct Inner<D> {
    device: D,
    opener: Arc<dyn PortOpener>,
    status: Mutex<Status>,
    link: Arc<tokio::sync::Mutex<Option<Transport>>>,
    state_tx: watch::Sender<SessionState>,
}

impl<D> Inner<D> {
    fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, status: &mut Status, state: SessionState) {
        status.state = state;
        self.state_tx.send_replace(state);
    }

    /// Drop back to `Disconnected` after a link failure, unless superseded
    fn mark_failed(&self, generation: u64) {
        let mut status = self.status();
        if status.generation == generation && status.state == SessionState::Connected {
            status.params = None;
            status.closer = None;
            self.set_state(&mut status, SessionState::Disconnected);
        }
    }
}

/// Lifecycle and exclusive access for one instrument
pub struct DeviceSession<D: Device> {
    inner: Arc<Inner<D>>,
}

impl<D: Device> Clone for DeviceSession<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: Device> DeviceSession<D> {
    /// Session opening links through `opener`
    pub fn new(device: D, opener: Arc<dyn PortOpener>) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                device,
                opener,
                status: Mutex::new(Status {
                    state: SessionState::Disconnected,
                    params: None,
                    closer: None,
                    probe: None,
                    generation: 0,
                }),
                link: Arc::new(tokio::sync::Mutex::new(None)),
                state_tx,
            }),
        }
    }

    /// Session on real serial ports
    pub fn serial(device: D) -> Self {
        Self::new(device, Arc::new(SerialOpener))
    }

    /// The driven device
    pub fn device(&self) -> &D {
        &self.inner.device
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.inner.status().state
    }

    /// Is a verified link held?
    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Parameters of the current link
    pub fn parameters(&self) -> Option<ConnectionParameters> {
        self.inner.status().params.clone()
    }

    /// Receiver notified on every state change
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    /// Connect and wait for the probe to finish
    pub async fn connect(
        &self,
        params: Option<ConnectionParameters>,
    ) -> Result<Connected<D::Evidence>, ProtocolError> {
        self.spawn_connect(params)?.wait().await
    }

    /// Start connecting in the background
    ///
    /// A connected session is disconnected first, and its transport is
    /// dropped before discovery opens any port. Fails with
    /// [`ProtocolError::ProbeInProgress`] while another probe runs.
    pub fn spawn_connect(
        &self,
        params: Option<ConnectionParameters>,
    ) -> Result<ConnectHandle<D::Evidence>, ProtocolError> {
        if self.state() == SessionState::Probing {
            return Err(ProtocolError::ProbeInProgress);
        }
        if self.is_connected() {
            self.disconnect();
        }

        let probe = self.inner.device.probe(params.as_ref(), self.inner.opener.as_ref());
        let generation = {
            let mut status = self.inner.status();
            if status.state == SessionState::Probing {
                return Err(ProtocolError::ProbeInProgress);
            }
            status.generation += 1;
            status.params = None;
            self.inner.set_state(&mut status, SessionState::Probing);
            status.generation
        };
        info!(
            device = self.inner.device.kind(),
            candidates = probe.candidates().len(),
            "connecting"
        );

        let cancel = CancellationToken::new();
        {
            let mut status = self.inner.status();
            if status.generation == generation && status.state == SessionState::Probing {
                status.probe = Some(cancel.clone());
            }
        }

        let session = self.clone();
        let token = cancel.clone();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            // A transaction may still hold the previous link; it is closed
            // and dropped before any candidate port is opened again
            if let Some(previous) = session.inner.link.lock().await.take() {
                previous.close();
            }
            let opener = session.inner.opener.clone();
            let result = Prober::spawn_with(probe, opener, token).wait().await;
            let outcome = session.finish_connect(generation, result).await;
            // The session state is already updated; nobody may be waiting
            let _ = tx.send(outcome);
        });

        Ok(ConnectHandle { rx, cancel })
    }

    async fn finish_connect(
        &self,
        generation: u64,
        result: Result<ProbeSuccess<D::Evidence>, ProtocolError>,
    ) -> Result<Connected<D::Evidence>, ProtocolError> {
        let kind = self.inner.device.kind();
        let success = match result {
            Ok(success) => success,
            Err(e) => {
                let mut status = self.inner.status();
                if status.generation == generation {
                    status.probe = None;
                    self.inner.set_state(&mut status, SessionState::Disconnected);
                }
                warn!(device = kind, error = %e, "connect failed");
                return Err(e);
            }
        };

        let mut slot = self.inner.link.clone().lock_owned().await;
        let ProbeSuccess {
            transport,
            params,
            evidence,
        } = success;
        {
            let mut status = self.inner.status();
            if status.generation != generation {
                drop(status);
                transport.close();
                return Err(ProtocolError::Cancelled);
            }
            status.probe = None;
            status.params = Some(params.clone());
            status.closer = Some(transport.closer());
            self.inner.set_state(&mut status, SessionState::Connected);
        }
        *slot = Some(transport);
        info!(device = kind, link = %params, "connected");

        Ok(Connected { params, evidence })
    }

    /// Release the link
    ///
    /// A probe in progress is cancelled, and a transaction blocked in
    /// receive fails with a transport error within one polling slice.
    pub fn disconnect(&self) {
        let (closer, probe) = {
            let mut status = self.inner.status();
            status.generation += 1;
            status.params = None;
            self.inner.set_state(&mut status, SessionState::Disconnected);
            (status.closer.take(), status.probe.take())
        };
        if let Some(token) = probe {
            token.cancel();
        }
        if let Some(token) = closer {
            token.cancel();
        }
        // A busy link is dropped by the transaction holding it
        if let Ok(mut slot) = self.inner.link.try_lock() {
            if let Some(transport) = slot.take() {
                transport.close();
            }
        }
        info!(device = self.inner.device.kind(), "disconnected");
    }

    /// Run `op` with exclusive use of the link
    ///
    /// Callers queue on the link; each transaction runs to completion on a
    /// blocking worker before the next starts.
    pub async fn transact<T, E, F>(&self, op: F) -> Result<T, E>
    where
        T: Send + 'static,
        E: TransactionError,
        F: FnOnce(&D, &mut Transport) -> Result<T, E> + Send + 'static,
    {
        let generation = {
            let status = self.inner.status();
            if status.state != SessionState::Connected {
                return Err(E::not_connected());
            }
            status.generation
        };

        let mut slot = self.inner.link.clone().lock_owned().await;
        if self.inner.status().generation != generation {
            return Err(E::not_connected());
        }

        let inner = self.inner.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let result = match (*slot).as_mut() {
                Some(transport) => op(&inner.device, transport),
                None => Err(E::not_connected()),
            };
            if result.as_ref().err().is_some_and(|e| e.is_transport_failure()) {
                warn!(device = inner.device.kind(), "link failed, disconnecting");
                slot.take();
                inner.mark_failed(generation);
            } else if (*slot).as_ref().is_some_and(|t| t.is_closed()) {
                // Disconnected while this transaction held the link
                slot.take();
            }
            result
        })
        .await;

        joined.unwrap_or_else(|e| {
            debug!(error = %e, "transaction worker failed");
            Err(E::from(TransportError::SerialError(format!(
                "transaction worker failed: {}",
                e
            ))))
        })
    }
}

/// Session driving a motor controller
pub type MotorSession = DeviceSession<MotorDriver>;

/// Session polling a THP sensor
pub type SensorSession = DeviceSession<SensorPoller>;

impl DeviceSession<MotorDriver> {
    /// Move to `angle` and wait for the acknowledgement
    pub async fn move_to(&self, angle: i32) -> Result<AckInfo, MotorError> {
        self.transact(move |driver, transport| driver.move_to(transport, angle))
            .await
    }
}

impl DeviceSession<SensorPoller> {
    /// Take one reading with the configured deadline
    pub async fn poll_sensor(&self) -> Result<SensorReading, SensorError> {
        self.transact(|poller, transport| poller.read(transport, poller.config().read_timeout()))
            .await
    }
}

/// Pending result of [`DeviceSession::spawn_connect`]
pub struct ConnectHandle<E> {
    rx: oneshot::Receiver<Result<Connected<E>, ProtocolError>>,
    cancel: CancellationToken,
}

impl<E> ConnectHandle<E> {
    /// Abort discovery; the session returns to `Disconnected`
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Result if discovery has finished, without waiting
    pub fn try_result(&mut self) -> Option<Result<Connected<E>, ProtocolError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(ProtocolError::Cancelled)),
        }
    }

    /// Wait for discovery to finish
    pub async fn wait(self) -> Result<Connected<E>, ProtocolError> {
        self.rx.await.unwrap_or(Err(ProtocolError::Cancelled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MotorConfig, SensorConfig};
    use crate::protocol::{BaudRate, DirectionPolicy};
    use crate::sim::{AckStyle, SimMotor, SimOpener, SimSensor};
    use std::time::Duration;

    fn motor_config() -> MotorConfig {
        MotorConfig {
            probe_timeout_ms: 100,
            ack_timeout_ms: 100,
            settle_ms: 0,
            direction: DirectionPolicy::None,
            ..MotorConfig::default()
        }
    }

    fn motor_session(opener: SimOpener) -> MotorSession {
        DeviceSession::new(MotorDriver::new(motor_config()), Arc::new(opener))
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let opener = SimOpener::new().with_device("M", SimMotor::new(BaudRate::B9600));
        let log = opener.wire_log();
        let session = motor_session(opener);

        assert!(matches!(session.move_to(100).await, Err(MotorError::NotConnected)));
        assert!(!session.is_connected());
        assert!(log.events().is_empty());
    }

    #[tokio::test]
    async fn test_connect_move_disconnect() {
        let motor = SimMotor::new(BaudRate::B19200);
        let session = motor_session(SimOpener::new().with_device("M", motor.clone()));
        let mut states = session.subscribe();

        let connected = session.connect(None).await.unwrap();
        assert_eq!(connected.params, ConnectionParameters::new("M", BaudRate::B19200));
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.parameters(), Some(connected.params.clone()));
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), SessionState::Connected);

        session.move_to(450).await.unwrap();
        assert_eq!(motor.moves(), vec![450]);

        session.disconnect();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.parameters(), None);
        assert!(matches!(session.move_to(1).await, Err(MotorError::NotConnected)));
    }

    #[tokio::test]
    async fn test_failed_probe_returns_to_disconnected() {
        let session = motor_session(SimOpener::new());
        let err = session
            .connect(Some(ConnectionParameters::new("GONE", BaudRate::B9600)))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::NoDeviceFound { attempts: 1, .. }));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_second_connect_while_probing_is_refused() {
        let session = motor_session(SimOpener::new().with_device("M", SimMotor::new(BaudRate::B115200)));
        let mut handle = session.spawn_connect(None).unwrap();
        assert_eq!(session.state(), SessionState::Probing);
        assert!(matches!(session.spawn_connect(None), Err(ProtocolError::ProbeInProgress)));
        assert!(handle.try_result().is_none());
        handle.wait().await.unwrap();
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn test_cancel_connect() {
        let session = motor_session(SimOpener::new().with_device("M", SimMotor::new(BaudRate::B115200)));
        let handle = session.spawn_connect(None).unwrap();
        handle.cancel();
        assert!(matches!(handle.wait().await, Err(ProtocolError::Cancelled)));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_unblocks_transaction() {
        let motor = SimMotor::new(BaudRate::B9600).with_ack(AckStyle::Silent);
        let mut config = motor_config();
        config.ack_timeout_ms = 10_000;
        let opener = SimOpener::new().with_device("M", motor);
        let session = DeviceSession::new(MotorDriver::new(config), Arc::new(opener));

        // Probing reads holding registers, which the silent motor still answers
        session.connect(None).await.unwrap();

        let pending = {
            let session = session.clone();
            tokio::spawn(async move { session.move_to(90).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = std::time::Instant::now();
        session.disconnect();

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(MotorError::Transport(TransportError::Closed))));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_sensor_session_polls() {
        let opener = SimOpener::new()
            .with_device("M", SimMotor::new(BaudRate::B9600))
            .with_device("T", SimSensor::new(19.5, 50.0, 990.0));
        let config = SensorConfig {
            discovery_timeout_ms: 150,
            read_timeout_ms: 300,
            open_settle_ms: 0,
            ..SensorConfig::default()
        };
        let session = SensorSession::new(SensorPoller::new(config), Arc::new(opener));

        let connected = session.connect(None).await.unwrap();
        assert_eq!(connected.params.port, "T");
        assert_eq!(connected.evidence.temperature, Some(19.5));

        let reading = session.poll_sensor().await.unwrap();
        assert_eq!(reading.pressure, Some(990.0));
    }
}
