//! Link discovery
//!
//! One routine serves every instrument: for each candidate in order, open a
//! transport, run the instrument's attempt (flush, send probe, receive with a
//! deadline, classify), and stop at the first accepted reply. Rejected or
//! failed candidates are closed before the next one is opened, so two
//! transports never hold the same port.
//!
//! [`Prober::spawn`] runs the scan on a blocking worker and hands back a
//! [`ProbeHandle`] that delivers exactly one terminal result.

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{format_hex, ConnectionParameters, DirectionPolicy, PortOpener, ProtocolError, Transport, TransportError};
use crate::config::LinkTiming;

/// Outcome of one attempt on an open transport
#[derive(Debug)]
pub enum ProbeVerdict<E> {
    /// The device answered; `E` is what the attempt learned
    Accept(E),
    /// Something (or nothing) came back, but not an acknowledgement
    Reject { raw: Vec<u8> },
}

/// What to report when every candidate failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exhausted {
    /// Report [`ProtocolError::NoDeviceFound`]
    NoDevice,
    /// Report [`ProtocolError::PortNotFound`]
    NoPort,
}

type Attempt<E> = Box<dyn Fn(&mut Transport) -> Result<ProbeVerdict<E>, TransportError> + Send + Sync>;

/// A discovery plan: candidates plus the attempt run against each
pub struct Probe<E> {
    label: &'static str,
    candidates: Vec<ConnectionParameters>,
    direction: DirectionPolicy,
    timing: LinkTiming,
    exhausted: Exhausted,
    attempt: Attempt<E>,
}

impl<E> Probe<E> {
    /// Build a plan; `attempt` is run once per candidate, in order
    pub fn new(
        label: &'static str,
        candidates: Vec<ConnectionParameters>,
        direction: DirectionPolicy,
        timing: LinkTiming,
        exhausted: Exhausted,
        attempt: impl Fn(&mut Transport) -> Result<ProbeVerdict<E>, TransportError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            label,
            candidates,
            direction,
            timing,
            exhausted,
            attempt: Box::new(attempt),
        }
    }

    /// Candidates in the order they will be tried
    pub fn candidates(&self) -> &[ConnectionParameters] {
        &self.candidates
    }

    fn exhausted_error(&self, last_response: Option<Vec<u8>>) -> ProtocolError {
        match self.exhausted {
            Exhausted::NoDevice => ProtocolError::NoDeviceFound {
                attempts: self.candidates.len(),
                last_response,
            },
            Exhausted::NoPort => {
                let mut candidates: Vec<String> = Vec::new();
                for c in &self.candidates {
                    if !candidates.contains(&c.port) {
                        candidates.push(c.port.clone());
                    }
                }
                ProtocolError::PortNotFound { candidates }
            }
        }
    }

    /// Run the scan on the calling thread
    ///
    /// The accepted transport is returned still open and detached from
    /// `cancel`.
    pub fn run(
        &self,
        opener: &dyn PortOpener,
        cancel: &CancellationToken,
    ) -> Result<ProbeSuccess<E>, ProtocolError> {
        let mut last_response: Option<Vec<u8>> = None;

        for params in &self.candidates {
            if cancel.is_cancelled() {
                return Err(ProtocolError::Cancelled);
            }

            let started = Instant::now();
            let mut transport = match opener.open(params, self.direction, &self.timing) {
                Ok(t) => t,
                Err(e) => {
                    warn!(probe = self.label, port = %params.port, baud = %params.baud_rate, error = %e, "open failed");
                    continue;
                }
            };
            transport.close_on(cancel);

            match (self.attempt)(&mut transport) {
                Ok(ProbeVerdict::Accept(evidence)) => {
                    transport.detach();
                    info!(
                        probe = self.label,
                        port = %params.port,
                        baud = %params.baud_rate,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "device answered"
                    );
                    return Ok(ProbeSuccess {
                        transport,
                        params: params.clone(),
                        evidence,
                    });
                }
                Ok(ProbeVerdict::Reject { raw }) => {
                    debug!(
                        probe = self.label,
                        port = %params.port,
                        baud = %params.baud_rate,
                        response = %format_hex(&raw),
                        "candidate rejected"
                    );
                    if !raw.is_empty() {
                        last_response = Some(raw);
                    }
                }
                Err(TransportError::Closed) if cancel.is_cancelled() => {
                    return Err(ProtocolError::Cancelled);
                }
                Err(e) => {
                    warn!(probe = self.label, port = %params.port, baud = %params.baud_rate, error = %e, "attempt failed");
                }
            }

            transport.close();
        }

        info!(probe = self.label, attempts = self.candidates.len(), "no candidate answered");
        Err(self.exhausted_error(last_response))
    }
}

/// A working link found by a probe
#[derive(Debug)]
pub struct ProbeSuccess<E> {
    /// The open transport that answered
    pub transport: Transport,
    /// Its parameters
    pub params: ConnectionParameters,
    /// What the accepting attempt learned (ack bytes, first reading, ...)
    pub evidence: E,
}

/// Runs probes off the caller's thread
pub struct Prober;

impl Prober {
    /// Start `probe` on a blocking worker
    ///
    /// Must be called within a Tokio runtime.
    pub fn spawn<E: Send + 'static>(probe: Probe<E>, opener: Arc<dyn PortOpener>) -> ProbeHandle<E> {
        Self::spawn_with(probe, opener, CancellationToken::new())
    }

    /// Start `probe` on a blocking worker, aborted by `cancel`
    pub fn spawn_with<E: Send + 'static>(
        probe: Probe<E>,
        opener: Arc<dyn PortOpener>,
        cancel: CancellationToken,
    ) -> ProbeHandle<E> {
        let (tx, rx) = oneshot::channel();
        let token = cancel.clone();
        tokio::task::spawn_blocking(move || {
            let result = probe.run(opener.as_ref(), &token);
            // A dropped receiver means nobody wants the link any more
            if let Err(Ok(success)) = tx.send(result) {
                success.transport.close();
            }
        });
        ProbeHandle { rx, cancel }
    }
}

/// Terminal result of a background probe
pub struct ProbeHandle<E> {
    rx: oneshot::Receiver<Result<ProbeSuccess<E>, ProtocolError>>,
    cancel: CancellationToken,
}

impl<E> ProbeHandle<E> {
    /// Abort the scan; an attempt in progress is interrupted within one polling slice
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Result if the scan has finished, without waiting
    pub fn try_result(&mut self) -> Option<Result<ProbeSuccess<E>, ProtocolError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(ProtocolError::Cancelled)),
        }
    }

    /// Wait for the scan to finish
    pub async fn wait(self) -> Result<ProbeSuccess<E>, ProtocolError> {
        self.rx.await.unwrap_or(Err(ProtocolError::Cancelled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::BaudRate;
    use crate::sim::{SimDevice, SimOpener, SimReply};
    use std::time::Duration;

    /// Answers "OK" to anything, but only at its own baud rate
    struct OnlyAt(BaudRate);

    impl SimDevice for OnlyAt {
        fn respond(&self, baud: BaudRate, _request: &[u8]) -> Vec<SimReply> {
            if baud == self.0 {
                vec![SimReply::now(b"OK".to_vec())]
            } else {
                vec![SimReply::now(vec![0xff])]
            }
        }
    }

    fn ok_probe(port: &str) -> Probe<Vec<u8>> {
        let candidates = BaudRate::ALL
            .iter()
            .map(|b| ConnectionParameters::new(port, *b))
            .collect();
        Probe::new(
            "test",
            candidates,
            DirectionPolicy::None,
            LinkTiming::default(),
            Exhausted::NoDevice,
            |t| {
                t.flush()?;
                t.send(b"?")?;
                let raw = t.receive(Duration::from_millis(100), Some(2))?;
                Ok(if raw == b"OK" {
                    ProbeVerdict::Accept(raw)
                } else {
                    ProbeVerdict::Reject { raw }
                })
            },
        )
    }

    #[test]
    fn test_run_stops_at_first_accept() {
        let opener = SimOpener::new().with_device("SIM0", OnlyAt(BaudRate::B57600));
        let success = ok_probe("SIM0").run(&opener, &CancellationToken::new()).unwrap();
        assert_eq!(success.params.baud_rate, BaudRate::B57600);
        assert_eq!(success.evidence, b"OK".to_vec());
        assert!(!success.transport.is_closed());
        let tried: Vec<BaudRate> = opener.attempts().iter().map(|p| p.baud_rate).collect();
        assert_eq!(
            tried,
            vec![BaudRate::B9600, BaudRate::B19200, BaudRate::B38400, BaudRate::B57600]
        );
    }

    #[test]
    fn test_run_exhausted_keeps_last_response() {
        let opener = SimOpener::new().with_device("SIM0", OnlyAt(BaudRate::B57600));
        let mut probe = ok_probe("SIM0");
        probe.candidates.retain(|c| c.baud_rate != BaudRate::B57600);
        match probe.run(&opener, &CancellationToken::new()) {
            Err(ProtocolError::NoDeviceFound {
                attempts,
                last_response,
            }) => {
                assert_eq!(attempts, 4);
                assert_eq!(last_response, Some(vec![0xff]));
            }
            other => panic!("expected NoDeviceFound, got {:?}", other.map(|s| s.params)),
        }
    }

    #[test]
    fn test_run_skips_ports_that_fail_to_open() {
        let opener = SimOpener::new().with_device("SIM1", OnlyAt(BaudRate::B9600));
        let probe = Probe::new(
            "ports",
            vec![
                ConnectionParameters::new("MISSING", BaudRate::B9600),
                ConnectionParameters::new("SIM1", BaudRate::B9600),
            ],
            DirectionPolicy::None,
            LinkTiming::default(),
            Exhausted::NoPort,
            |t| {
                t.send(b"?")?;
                let raw = t.receive(Duration::from_millis(100), Some(2))?;
                Ok(ProbeVerdict::Accept(raw))
            },
        );
        let success = probe.run(&opener, &CancellationToken::new()).unwrap();
        assert_eq!(success.params.port, "SIM1");
    }

    #[test]
    fn test_exhausted_ports_report_port_not_found() {
        let opener = SimOpener::new();
        let probe: Probe<()> = Probe::new(
            "ports",
            vec![
                ConnectionParameters::new("A", BaudRate::B9600),
                ConnectionParameters::new("B", BaudRate::B9600),
            ],
            DirectionPolicy::None,
            LinkTiming::default(),
            Exhausted::NoPort,
            |_| Ok(ProbeVerdict::Reject { raw: Vec::new() }),
        );
        match probe.run(&opener, &CancellationToken::new()) {
            Err(ProtocolError::PortNotFound { candidates }) => {
                assert_eq!(candidates, vec!["A".to_string(), "B".to_string()])
            }
            _ => panic!("expected PortNotFound"),
        }
    }

    #[test]
    fn test_cancelled_before_start() {
        let opener = SimOpener::new().with_device("SIM0", OnlyAt(BaudRate::B9600));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            ok_probe("SIM0").run(&opener, &cancel),
            Err(ProtocolError::Cancelled)
        ));
        assert!(opener.attempts().is_empty());
    }

    #[tokio::test]
    async fn test_spawned_probe_delivers_result() {
        let opener = Arc::new(SimOpener::new().with_device("SIM0", OnlyAt(BaudRate::B19200)));
        let handle = Prober::spawn(ok_probe("SIM0"), opener);
        let success = handle.wait().await.unwrap();
        assert_eq!(success.params.baud_rate, BaudRate::B19200);
    }

    #[tokio::test]
    async fn test_spawned_probe_cancel_interrupts_attempt() {
        let opener = Arc::new(SimOpener::new().with_device("SILENT", crate::sim::Silent));
        let probe: Probe<()> = Probe::new(
            "slow",
            vec![ConnectionParameters::new("SILENT", BaudRate::B9600)],
            DirectionPolicy::None,
            LinkTiming::default(),
            Exhausted::NoDevice,
            |t| {
                let raw = t.receive(Duration::from_secs(30), None)?;
                Ok(ProbeVerdict::Reject { raw })
            },
        );
        let mut handle = Prober::spawn(probe, opener);
        assert!(handle.try_result().is_none());
        tokio::time::sleep(Duration::from_millis(50)).await;
        let started = Instant::now();
        handle.cancel();
        let result = handle.wait().await;
        assert!(matches!(result, Err(ProtocolError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
