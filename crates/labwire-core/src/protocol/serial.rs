//! Serial port handling
//!
//! Port enumeration and opening real serial ports as [`Transport`]s.

use serialport::{DataBits, FlowControl, Parity, SerialPortInfo, SerialPortType, StopBits};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use tracing::{debug, warn};

use super::{ConnectionParameters, DirectionControl, DirectionPolicy, SerialChannel, Transport, TransportError};
use crate::config::LinkTiming;

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyUSB0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Manufacturer name (if available)
    pub manufacturer: Option<String>,

    /// Product name (if available)
    pub product: Option<String>,

    /// Serial number (if available)
    pub serial_number: Option<String>,
}

impl PortInfo {
    fn bare(name: String) -> Self {
        Self {
            name,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial_number: None,
        }
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        match info.port_type {
            SerialPortType::UsbPort(usb_info) => Self {
                name: info.port_name,
                vid: Some(usb_info.vid),
                pid: Some(usb_info.pid),
                manufacturer: usb_info.manufacturer,
                product: usb_info.product,
                serial_number: usb_info.serial_number,
            },
            _ => Self::bare(info.port_name),
        }
    }
}

/// Sort key putting ttyACM*, then ttyUSB*, then COM* first, each numerically
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    for (rank, prefix) in [(0u8, "ttyACM"), (1, "ttyUSB"), (2, "COM")] {
        if let Some(rest) = basename.strip_prefix(prefix) {
            let num = rest.parse::<usize>().unwrap_or(usize::MAX);
            return (rank, num, basename.to_string());
        }
    }
    (3, 0, basename.to_string())
}

/// List all available serial ports, with /dev fallbacks and deterministic ordering
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    match serialport::available_ports() {
        Ok(ports) => {
            for info in ports {
                let p = PortInfo::from(info);
                map.entry(p.name.clone()).or_insert(p);
            }
        }
        Err(e) => warn!(error = %e, "serial port enumeration failed"),
    }

    // Linux-only: add /dev/ttyACM* and /dev/ttyUSB* entries the API missed
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyACM") || fname.starts_with("ttyUSB") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone()).or_insert_with(|| PortInfo::bare(full));
                }
            }
        }
    }

    let mut v: Vec<PortInfo> = map.into_values().collect();
    v.sort_by_key(|p| port_sort_key(&p.name));
    v
}

/// Opens links for the prober and the session
///
/// Real hardware goes through [`SerialOpener`]; tests and demos substitute
/// simulated instruments.
pub trait PortOpener: Send + Sync {
    /// Open `params` as a transport with the requested direction control
    fn open(
        &self,
        params: &ConnectionParameters,
        policy: DirectionPolicy,
        timing: &LinkTiming,
    ) -> Result<Transport, TransportError>;

    /// Names of the ports discovery should try when none are configured
    fn available_ports(&self) -> Vec<String>;
}

/// Opens real serial ports (8N1, no flow control)
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialOpener;

impl PortOpener for SerialOpener {
    fn open(
        &self,
        params: &ConnectionParameters,
        policy: DirectionPolicy,
        timing: &LinkTiming,
    ) -> Result<Transport, TransportError> {
        let builder = serialport::new(&params.port, params.baud_rate.as_u32())
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            // Short timeout keeps reads responsive; the transport polls bytes_to_read
            .timeout(timing.poll_slice());

        let mut port = builder.open_native().map_err(|e| TransportError::Open {
            port: params.port.clone(),
            reason: e.to_string(),
        })?;

        let direction = select_direction(&mut port, policy, timing);
        if direction == DirectionControl::Manual {
            // Idle in receive mode
            serialport::SerialPort::write_request_to_send(&mut port, false)?;
        }
        debug!(port = %params.port, baud = %params.baud_rate, ?direction, "port opened");

        Ok(Transport::new(
            Box::new(SerialChannel::new(Box::new(port))),
            params.clone(),
            direction,
            timing.clone(),
        ))
    }

    fn available_ports(&self) -> Vec<String> {
        list_ports().into_iter().map(|p| p.name).collect()
    }
}

#[cfg(target_os = "linux")]
fn select_direction(
    port: &mut serialport::TTYPort,
    policy: DirectionPolicy,
    timing: &LinkTiming,
) -> DirectionControl {
    use std::os::unix::io::AsRawFd;

    match policy {
        DirectionPolicy::None => DirectionControl::None,
        DirectionPolicy::Manual => DirectionControl::Manual,
        DirectionPolicy::Auto => match rs485::enable(port.as_raw_fd(), timing.native_delay_ms) {
            Ok(()) => {
                let delay = std::time::Duration::from_millis(timing.native_delay_ms as u64);
                DirectionControl::Native {
                    delay_before_send: delay,
                    delay_after_send: delay,
                }
            }
            Err(e) => {
                debug!(error = %e, "native RS-485 unavailable, toggling RTS manually");
                DirectionControl::Manual
            }
        },
    }
}

#[cfg(not(target_os = "linux"))]
fn select_direction<P>(_port: &mut P, policy: DirectionPolicy, _timing: &LinkTiming) -> DirectionControl {
    // serialport exposes no RS-485 mode outside Linux
    match policy {
        DirectionPolicy::None => DirectionControl::None,
        DirectionPolicy::Manual | DirectionPolicy::Auto => DirectionControl::Manual,
    }
}

#[cfg(target_os = "linux")]
mod rs485 {
    use std::io;
    use std::os::unix::io::RawFd;

    // libc leaves the request out for mips/glibc and sparc, where it differs
    #[cfg(not(any(
        target_arch = "mips",
        target_arch = "mips32r6",
        target_arch = "mips64",
        target_arch = "mips64r6",
        target_arch = "sparc",
        target_arch = "sparc64"
    )))]
    use libc::TIOCSRS485;
    #[cfg(any(
        target_arch = "mips",
        target_arch = "mips32r6",
        target_arch = "mips64",
        target_arch = "mips64r6"
    ))]
    const TIOCSRS485: libc::c_ulong = 0xC020_542F;
    #[cfg(any(target_arch = "sparc", target_arch = "sparc64"))]
    const TIOCSRS485: libc::c_ulong = 0xC020_5442;
    const SER_RS485_ENABLED: u32 = 1 << 0;
    const SER_RS485_RTS_ON_SEND: u32 = 1 << 1;

    /// Layout of the kernel's `struct serial_rs485`
    #[repr(C)]
    struct SerialRs485 {
        flags: u32,
        delay_rts_before_send: u32,
        delay_rts_after_send: u32,
        padding: [u32; 5],
    }

    /// Put the UART in RS-485 mode with RTS high while sending
    pub(super) fn enable(fd: RawFd, delay_ms: u32) -> io::Result<()> {
        let config = SerialRs485 {
            flags: SER_RS485_ENABLED | SER_RS485_RTS_ON_SEND,
            delay_rts_before_send: delay_ms,
            delay_rts_after_send: delay_ms,
            padding: [0; 5],
        };
        // SAFETY: fd is an open tty owned by the caller and `config` matches
        // the layout TIOCSRS485 reads; the kernel does not keep the pointer.
        let rc = unsafe { libc::ioctl(fd, TIOCSRS485 as _, &config as *const SerialRs485) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

}
