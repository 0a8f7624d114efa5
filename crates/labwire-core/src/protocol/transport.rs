//! Half-duplex transport
//!
//! Owns one open serial link and performs the flush / send / timed receive
//! steps every transaction is made of. Transmit direction is switched either
//! by the driver (native RS-485 mode) or by toggling RTS around each write.

use serialport::SerialPort;
use std::fmt;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{format_hex, ConnectionParameters, TransportError};
use crate::config::LinkTiming;

/// Byte-level access to a serial line
pub trait SerialLink: Read + Write + Send {
    /// Get number of bytes available to read
    fn bytes_to_read(&mut self) -> io::Result<u32>;

    /// Discard buffered input and output
    fn clear_buffers(&mut self) -> io::Result<()>;

    /// Drive the RTS line
    fn set_request_to_send(&mut self, level: bool) -> io::Result<()>;
}

/// Serial port wrapper implementing SerialLink
pub struct SerialChannel {
    port: Box<dyn SerialPort>,
}

impl SerialChannel {
    /// Wrap an open port
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }
}

impl Read for SerialChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl SerialLink for SerialChannel {
    fn bytes_to_read(&mut self) -> io::Result<u32> {
        self.port.bytes_to_read().map_err(io::Error::other)
    }

    fn clear_buffers(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::All)
            .map_err(io::Error::other)
    }

    fn set_request_to_send(&mut self, level: bool) -> io::Result<()> {
        self.port
            .write_request_to_send(level)
            .map_err(io::Error::other)
    }
}

/// How the transport switches the line to transmit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectionControl {
    /// The driver raises RTS while sending, with optional lead/lag times
    Native {
        delay_before_send: Duration,
        delay_after_send: Duration,
    },
    /// RTS is raised and released around every write by the transport
    Manual,
    /// Full-duplex line
    None,
}

/// Time the UART needs to shift out `len` bytes at 8N1
fn transmit_time(len: usize, baud_rate: u32) -> Duration {
    // Each byte = 10 bits (1 start + 8 data + 1 stop)
    let bits = (len * 10) as u64;
    Duration::from_micros(bits * 1_000_000 / baud_rate.max(1) as u64)
}

/// An open serial link at fixed parameters
pub struct Transport {
    link: Box<dyn SerialLink>,
    params: ConnectionParameters,
    direction: DirectionControl,
    timing: LinkTiming,
    closed: CancellationToken,
    tx_bytes: u64,
    rx_bytes: u64,
}

impl Transport {
    /// Take ownership of an open link
    pub fn new(
        link: Box<dyn SerialLink>,
        params: ConnectionParameters,
        direction: DirectionControl,
        timing: LinkTiming,
    ) -> Self {
        Self {
            link,
            params,
            direction,
            timing,
            closed: CancellationToken::new(),
            tx_bytes: 0,
            rx_bytes: 0,
        }
    }

    /// Parameters the link was opened with
    pub fn params(&self) -> &ConnectionParameters {
        &self.params
    }

    /// Active direction control
    pub fn direction(&self) -> DirectionControl {
        self.direction
    }

    /// Cumulative bytes sent and received
    pub fn counters(&self) -> (u64, u64) {
        (self.tx_bytes, self.rx_bytes)
    }

    /// Token that closes this transport when cancelled
    ///
    /// Any send or receive in progress fails with [`TransportError::Closed`]
    /// within one polling slice.
    pub fn closer(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Close this transport whenever `parent` is cancelled
    pub fn close_on(&mut self, parent: &CancellationToken) {
        self.closed = parent.child_token();
    }

    /// Stop following a parent token; the transport gets a fresh closer
    pub fn detach(&mut self) {
        self.closed = CancellationToken::new();
    }

    /// Has the transport been closed?
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration` in polling slices, failing early if closed
    pub fn pause(&self, duration: Duration) -> Result<(), TransportError> {
        let start = Instant::now();
        loop {
            self.ensure_open()?;
            let elapsed = start.elapsed();
            if elapsed >= duration {
                return Ok(());
            }
            std::thread::sleep((duration - elapsed).min(self.timing.poll_slice()));
        }
    }

    /// Discard stale input and output from an earlier exchange
    pub fn flush(&mut self) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.link.clear_buffers()?;
        Ok(())
    }

    /// Transmit `bytes`, switching line direction as configured
    pub fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.ensure_open()?;
        trace!(port = %self.params.port, bytes = %format_hex(bytes), "send");

        match self.direction {
            DirectionControl::Manual => {
                self.link.set_request_to_send(true)?;
                let sent = self.write_while_asserted(bytes);
                // Release the line even when the write failed
                let released = self.link.set_request_to_send(false);
                sent?;
                released?;
            }
            DirectionControl::Native { .. } | DirectionControl::None => {
                // No flush(): it drains via tcdrain, which blocks indefinitely
                // on some USB adapters. The receive loop absorbs the latency.
                self.link.write_all(bytes)?;
            }
        }

        self.tx_bytes = self.tx_bytes.saturating_add(bytes.len() as u64);
        Ok(())
    }

    fn write_while_asserted(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.pause(self.timing.rts_settle())?;
        self.link.write_all(bytes)?;
        // RTS must stay high until the last stop bit is out
        let drain = transmit_time(bytes.len(), self.params.baud_rate.as_u32());
        self.pause(drain.max(self.timing.rts_settle()))
    }

    /// Accumulate received bytes until `target_len` is reached or `deadline` elapses
    ///
    /// Elapsing the deadline is not an error: whatever arrived (possibly
    /// nothing) is returned for the caller to classify.
    pub fn receive(
        &mut self,
        deadline: Duration,
        target_len: Option<usize>,
    ) -> Result<Vec<u8>, TransportError> {
        self.receive_until(deadline, |buf| target_len.is_some_and(|len| buf.len() >= len))
    }

    /// Accumulate received bytes until `done` accepts the buffer or `deadline` elapses
    pub fn receive_until(
        &mut self,
        deadline: Duration,
        mut done: impl FnMut(&[u8]) -> bool,
    ) -> Result<Vec<u8>, TransportError> {
        let start = Instant::now();
        let mut response = Vec::new();
        let mut buffer = [0u8; 512];

        loop {
            self.ensure_open()?;

            let available = self.link.bytes_to_read()? as usize;
            let mut got_data = false;
            if available > 0 {
                let to_read = available.min(buffer.len());
                match self.link.read(&mut buffer[..to_read]) {
                    Ok(0) => {}
                    Ok(n) => {
                        got_data = true;
                        response.extend_from_slice(&buffer[..n]);
                        trace!(
                            port = %self.params.port,
                            bytes = %format_hex(&buffer[..n]),
                            total = response.len(),
                            "recv"
                        );
                        if done(&response) {
                            break;
                        }
                    }
                    Err(ref e)
                        if e.kind() == io::ErrorKind::TimedOut
                            || e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e.into()),
                }
            }

            let elapsed = start.elapsed();
            if elapsed >= deadline {
                debug!(
                    port = %self.params.port,
                    received = response.len(),
                    deadline_ms = deadline.as_millis() as u64,
                    "receive deadline elapsed"
                );
                break;
            }
            if !got_data {
                std::thread::sleep((deadline - elapsed).min(self.timing.poll_slice()));
            }
        }

        self.rx_bytes = self.rx_bytes.saturating_add(response.len() as u64);
        Ok(response)
    }

    /// Close the link
    pub fn close(self) {
        debug!(port = %self.params.port, "closing transport");
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.closed.cancel();
        if self.direction == DirectionControl::Manual {
            let _ = self.link.set_request_to_send(false);
        }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("params", &self.params)
            .field("direction", &self.direction)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}
