//! Simulated instruments
//!
//! In-memory links that answer like the real hardware, for tests and for the
//! CLI's `--simulate` mode. Replies are scheduled with a delay after each
//! write and released through `bytes_to_read`/`read` exactly like a UART
//! buffer, so the real transport, prober and session code run unmodified.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::config::LinkTiming;
use crate::protocol::{
    append_crc, BaudRate, ConnectionParameters, DirectionControl, DirectionPolicy, FunctionCode,
    PortOpener, SerialLink, Transport, TransportError,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Something that happened on a simulated wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
    /// A port was opened
    Open { port: String, baud: BaudRate },
    /// Bytes written by the host
    Write { port: String, bytes: Vec<u8> },
    /// Bytes handed to the host
    Read { port: String, bytes: Vec<u8> },
    /// Buffers cleared
    Clear { port: String },
    /// RTS driven
    Rts { port: String, level: bool },
    /// A port was closed
    Close { port: String },
}

/// Shared, ordered record of wire events across every simulated port
#[derive(Debug, Clone, Default)]
pub struct WireLog(Arc<Mutex<Vec<WireEvent>>>);

impl WireLog {
    fn push(&self, event: WireEvent) {
        lock(&self.0).push(event);
    }

    /// Snapshot of everything recorded so far
    pub fn events(&self) -> Vec<WireEvent> {
        lock(&self.0).clone()
    }
}

/// One scheduled reply chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimReply {
    /// Delay after the triggering write
    pub delay: Duration,
    /// Bytes that become readable
    pub bytes: Vec<u8>,
}

impl SimReply {
    /// Chunk available immediately
    pub fn now(bytes: Vec<u8>) -> Self {
        Self::after(Duration::ZERO, bytes)
    }

    /// Chunk available after `delay`
    pub fn after(delay: Duration, bytes: Vec<u8>) -> Self {
        Self { delay, bytes }
    }
}

/// Behaviour of a simulated instrument
pub trait SimDevice: Send + Sync {
    /// Replies to `request` received at `baud`
    fn respond(&self, baud: BaudRate, request: &[u8]) -> Vec<SimReply>;
}

/// Never answers
#[derive(Debug, Clone, Copy, Default)]
pub struct Silent;

impl SimDevice for Silent {
    fn respond(&self, _baud: BaudRate, _request: &[u8]) -> Vec<SimReply> {
        Vec::new()
    }
}

/// A failure injected on one simulated port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineFault {
    /// The device stops answering; the line itself stays up
    Mute,
    /// Every I/O call fails, like a pulled USB adapter
    Unplugged,
}

type Faults = Arc<Mutex<HashMap<String, LineFault>>>;

fn unplugged() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "simulated adapter unplugged")
}

/// How the simulated motor acknowledges a move
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckStyle {
    /// Standard write-multiple echo with CRC
    Echo,
    /// A fixed vendor sequence
    Quirk(Vec<u8>),
    /// No reply at all (the move is still recorded)
    Silent,
}

/// A motor controller answering at one baud rate
#[derive(Debug, Clone)]
pub struct SimMotor {
    slave_id: u8,
    baud: BaudRate,
    ack: AckStyle,
    latency: Duration,
    moves: Arc<Mutex<Vec<i32>>>,
}

impl SimMotor {
    /// Controller with slave id 1 that echoes at `baud`
    pub fn new(baud: BaudRate) -> Self {
        Self {
            slave_id: 1,
            baud,
            ack: AckStyle::Echo,
            latency: Duration::from_millis(5),
            moves: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Change how moves are acknowledged
    pub fn with_ack(mut self, ack: AckStyle) -> Self {
        self.ack = ack;
        self
    }

    /// Change the reply latency
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Angles of every move received so far
    pub fn moves(&self) -> Vec<i32> {
        lock(&self.moves).clone()
    }

    fn reply(&self, bytes: Vec<u8>) -> Vec<SimReply> {
        vec![SimReply::after(self.latency, bytes)]
    }
}

impl SimDevice for SimMotor {
    fn respond(&self, baud: BaudRate, request: &[u8]) -> Vec<SimReply> {
        if baud != self.baud {
            // Line noise from a mis-matched rate
            return self.reply(vec![0xf8, 0x00]);
        }
        if request.len() < 8 || request[0] != self.slave_id {
            return Vec::new();
        }

        match request[1] {
            f if f == FunctionCode::ReadHoldingRegisters.code() => {
                let count = u16::from_be_bytes([request[4], request[5]]) as usize;
                let mut bytes = vec![self.slave_id, f, (count * 2) as u8];
                bytes.resize(3 + count * 2, 0);
                append_crc(&mut bytes);
                self.reply(bytes)
            }
            f if f == FunctionCode::WriteMultipleRegisters.code() => {
                // Angle follows the 8 flag bytes of the payload
                if let Some(angle) = request.get(15..19) {
                    let angle = i32::from_be_bytes([angle[0], angle[1], angle[2], angle[3]]);
                    lock(&self.moves).push(angle);
                }
                match &self.ack {
                    AckStyle::Echo => {
                        let mut bytes = request[..6].to_vec();
                        append_crc(&mut bytes);
                        self.reply(bytes)
                    }
                    AckStyle::Quirk(bytes) => self.reply(bytes.clone()),
                    AckStyle::Silent => Vec::new(),
                }
            }
            _ => Vec::new(),
        }
    }
}

/// A THP sensor answering `p\r\n` with a JSON document in chunks
#[derive(Debug, Clone)]
pub struct SimSensor {
    body: String,
    chunk_size: usize,
    chunk_gap: Duration,
}

impl SimSensor {
    /// Sensor reporting fixed values
    pub fn new(temperature: f64, humidity: f64, pressure: f64) -> Self {
        Self::raw(format!(
            "{{\"Sensors\":[{{\"ID\":\"THP-1\",\"Temperature\":{},\"Humidity\":{},\"Pressure\":{}}}]}}\r\n",
            temperature, humidity, pressure
        ))
    }

    /// Sensor answering with arbitrary text
    pub fn raw(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            chunk_size: usize::MAX,
            chunk_gap: Duration::from_millis(5),
        }
    }

    /// Deliver the answer in pieces of `size` bytes, `gap` apart
    pub fn chunked(mut self, size: usize, gap: Duration) -> Self {
        self.chunk_size = size.max(1);
        self.chunk_gap = gap;
        self
    }
}

impl SimDevice for SimSensor {
    fn respond(&self, baud: BaudRate, request: &[u8]) -> Vec<SimReply> {
        if baud != BaudRate::B9600 || !request.starts_with(b"p") {
            return Vec::new();
        }
        self.body
            .as_bytes()
            .chunks(self.chunk_size)
            .enumerate()
            .map(|(i, chunk)| SimReply::after(self.chunk_gap * (i as u32 + 1), chunk.to_vec()))
            .collect()
    }
}

/// A simulated serial line bound to one device
pub struct SimLink {
    port: String,
    baud: BaudRate,
    device: Arc<dyn SimDevice>,
    pending: VecDeque<(Instant, Vec<u8>)>,
    inbox: VecDeque<u8>,
    log: WireLog,
    faults: Faults,
}

impl SimLink {
    /// Attach `device` to a new line
    pub fn new(port: impl Into<String>, baud: BaudRate, device: Arc<dyn SimDevice>, log: WireLog) -> Self {
        Self {
            port: port.into(),
            baud,
            device,
            pending: VecDeque::new(),
            inbox: VecDeque::new(),
            log,
            faults: Faults::default(),
        }
    }

    fn fault(&self) -> Option<LineFault> {
        lock(&self.faults).get(&self.port).copied()
    }

    fn check_plugged(&self) -> io::Result<()> {
        match self.fault() {
            Some(LineFault::Unplugged) => Err(unplugged()),
            _ => Ok(()),
        }
    }

    fn deliver_due(&mut self) {
        let now = Instant::now();
        while self.pending.front().is_some_and(|(due, _)| *due <= now) {
            if let Some((_, bytes)) = self.pending.pop_front() {
                self.inbox.extend(bytes);
            }
        }
    }
}

impl Read for SimLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.check_plugged()?;
        self.deliver_due();
        if self.inbox.is_empty() {
            return Err(io::ErrorKind::TimedOut.into());
        }
        let n = buf.len().min(self.inbox.len());
        for (slot, byte) in buf.iter_mut().zip(self.inbox.drain(..n)) {
            *slot = byte;
        }
        self.log.push(WireEvent::Read {
            port: self.port.clone(),
            bytes: buf[..n].to_vec(),
        });
        Ok(n)
    }
}

impl Write for SimLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.check_plugged()?;
        self.log.push(WireEvent::Write {
            port: self.port.clone(),
            bytes: buf.to_vec(),
        });
        if self.fault() == Some(LineFault::Mute) {
            return Ok(buf.len());
        }
        let now = Instant::now();
        for reply in self.device.respond(self.baud, buf) {
            self.pending.push_back((now + reply.delay, reply.bytes));
        }
        // Keep the queue ordered by due time
        self.pending.make_contiguous().sort_by_key(|(due, _)| *due);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SerialLink for SimLink {
    fn bytes_to_read(&mut self) -> io::Result<u32> {
        self.check_plugged()?;
        self.deliver_due();
        Ok(self.inbox.len() as u32)
    }

    fn clear_buffers(&mut self) -> io::Result<()> {
        self.check_plugged()?;
        self.deliver_due();
        self.inbox.clear();
        self.log.push(WireEvent::Clear {
            port: self.port.clone(),
        });
        Ok(())
    }

    fn set_request_to_send(&mut self, level: bool) -> io::Result<()> {
        self.check_plugged()?;
        self.log.push(WireEvent::Rts {
            port: self.port.clone(),
            level,
        });
        Ok(())
    }
}

impl Drop for SimLink {
    fn drop(&mut self) {
        self.log.push(WireEvent::Close {
            port: self.port.clone(),
        });
    }
}

/// Opens simulated ports by name
#[derive(Clone, Default)]
pub struct SimOpener {
    devices: HashMap<String, Arc<dyn SimDevice>>,
    attempts: Arc<Mutex<Vec<ConnectionParameters>>>,
    log: WireLog,
    faults: Faults,
}

impl SimOpener {
    /// An opener with no ports
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `device` to port `name`
    pub fn with_device(mut self, name: impl Into<String>, device: impl SimDevice + 'static) -> Self {
        self.devices.insert(name.into(), Arc::new(device));
        self
    }

    /// A motor on SIM-MOTOR at 38400 and a sensor on SIM-THP
    pub fn demo() -> Self {
        Self::new()
            .with_device("SIM-MOTOR", SimMotor::new(BaudRate::B38400))
            .with_device(
                "SIM-THP",
                SimSensor::new(22.5, 40.0, 1011.0).chunked(24, Duration::from_millis(20)),
            )
    }

    /// Every open request so far, in order
    pub fn attempts(&self) -> Vec<ConnectionParameters> {
        lock(&self.attempts).clone()
    }

    /// Wire events across all ports
    pub fn wire_log(&self) -> WireLog {
        self.log.clone()
    }

    /// Inject `fault` on `port`, including links already open
    pub fn set_fault(&self, port: impl Into<String>, fault: LineFault) {
        lock(&self.faults).insert(port.into(), fault);
    }

    /// Restore normal behaviour on `port`
    pub fn clear_fault(&self, port: &str) {
        lock(&self.faults).remove(port);
    }
}

impl PortOpener for SimOpener {
    fn open(
        &self,
        params: &ConnectionParameters,
        policy: DirectionPolicy,
        timing: &LinkTiming,
    ) -> Result<Transport, TransportError> {
        lock(&self.attempts).push(params.clone());
        let device = self.devices.get(&params.port).cloned().ok_or_else(|| TransportError::Open {
            port: params.port.clone(),
            reason: "no such simulated port".to_string(),
        })?;
        if lock(&self.faults).get(&params.port) == Some(&LineFault::Unplugged) {
            return Err(TransportError::Open {
                port: params.port.clone(),
                reason: "simulated adapter unplugged".to_string(),
            });
        }

        self.log.push(WireEvent::Open {
            port: params.port.clone(),
            baud: params.baud_rate,
        });
        let mut link = SimLink::new(params.port.clone(), params.baud_rate, device, self.log.clone());
        link.faults = self.faults.clone();
        let direction = match policy {
            DirectionPolicy::None => DirectionControl::None,
            DirectionPolicy::Manual | DirectionPolicy::Auto => DirectionControl::Manual,
        };
        Ok(Transport::new(Box::new(link), params.clone(), direction, timing.clone()))
    }

    fn available_ports(&self) -> Vec<String> {
        let mut names: Vec<String> = self.devices.keys().cloned().collect();
        names.sort();
        names
    }
}
