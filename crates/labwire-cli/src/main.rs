use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use labwire_core::prelude::*;
use labwire_core::sim::SimOpener;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "labwire")]
#[command(about = "Talk to the lab motor controller and THP sensor", version)]
struct Cli {
    /// JSON instrument configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Use simulated instruments instead of serial ports
    #[arg(long)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List serial ports
    Ports,

    /// Connect to the motor controller and move it
    Motor {
        /// Port to use (scanned when omitted)
        #[arg(long)]
        port: Option<String>,

        /// Baud rate (requires --port; every rate is tried when omitted)
        #[arg(long, requires = "port")]
        baud: Option<u32>,

        /// Target angle in device units
        #[arg(long, allow_hyphen_values = true)]
        angle: i32,
    },

    /// Discover the THP sensor and print readings as JSON lines
    Sensor {
        /// Candidate port (repeatable; every listed port when omitted)
        #[arg(long)]
        port: Vec<String>,

        /// Number of readings
        #[arg(long, default_value_t = 1)]
        count: u32,

        /// Pause between readings
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },
}

fn load_config(path: Option<&Path>) -> anyhow::Result<InstrumentConfig> {
    let Some(path) = path else {
        return Ok(InstrumentConfig::default());
    };
    info!(path = ?path, "Loading configuration");
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    InstrumentConfig::from_json(&text).with_context(|| format!("parsing {}", path.display()))
}

fn opener(simulate: bool) -> Arc<dyn PortOpener> {
    if simulate {
        Arc::new(SimOpener::demo())
    } else {
        Arc::new(SerialOpener)
    }
}

fn print_ports(opener: &dyn PortOpener, simulate: bool) {
    if simulate {
        for name in opener.available_ports() {
            println!("{}", name);
        }
        return;
    }
    for port in list_ports() {
        match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => println!(
                "{}\t{:04x}:{:04x}\t{}",
                port.name,
                vid,
                pid,
                port.product.as_deref().unwrap_or("")
            ),
            _ => println!("{}", port.name),
        }
    }
}

async fn run_motor(
    config: MotorConfig,
    opener: Arc<dyn PortOpener>,
    port: Option<String>,
    baud: Option<u32>,
    angle: i32,
) -> anyhow::Result<()> {
    let params = match (port.clone(), baud) {
        (Some(port), Some(baud)) => Some(ConnectionParameters::new(port, BaudRate::try_from(baud)?)),
        _ => None,
    };
    let config = MotorConfig {
        port: port.or(config.port),
        ..config
    };

    let session = MotorSession::new(MotorDriver::new(config), opener);
    let connected = session.connect(params).await.context("connecting to motor")?;
    info!(link = %connected.params, probe = %connected.evidence, "motor connected");

    let result = session.move_to(angle).await;
    session.disconnect();
    let ack = result.with_context(|| format!("moving to {}", angle))?;
    println!("{}", ack);
    Ok(())
}

async fn run_sensor(
    mut config: SensorConfig,
    opener: Arc<dyn PortOpener>,
    ports: Vec<String>,
    count: u32,
    interval: Duration,
) -> anyhow::Result<()> {
    if !ports.is_empty() {
        config.ports = ports;
    }
    let session = SensorSession::new(SensorPoller::new(config), opener);
    let connected = session.connect(None).await.context("discovering sensor")?;
    info!(link = %connected.params, "sensor connected");

    let mut ticker = tokio::time::interval(interval);
    for _ in 0..count {
        ticker.tick().await;
        match session.poll_sensor().await {
            Ok(reading) => println!("{}", serde_json::to_string(&reading)?),
            Err(e @ (SensorError::Timeout { .. } | SensorError::Parse { .. })) => {
                warn!(error = %e, "reading skipped")
            }
            Err(e) => {
                session.disconnect();
                bail!("sensor link lost: {}", e);
            }
        }
    }
    session.disconnect();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("labwire=info,labwire_core=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let opener = opener(cli.simulate);

    match cli.command {
        Command::Ports => print_ports(opener.as_ref(), cli.simulate),
        Command::Motor { port, baud, angle } => {
            run_motor(config.motor, opener, port, baud, angle).await?
        }
        Command::Sensor {
            port,
            count,
            interval_ms,
        } => {
            run_sensor(
                config.sensor,
                opener,
                port,
                count,
                Duration::from_millis(interval_ms),
            )
            .await?
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_cli_parses_motor_command() {
        let cli = Cli::try_parse_from([
            "labwire", "motor", "--port", "COM3", "--baud", "38400", "--angle", "-450",
        ])
        .unwrap();
        match cli.command {
            Command::Motor { port, baud, angle } => {
                assert_eq!(port.as_deref(), Some("COM3"));
                assert_eq!(baud, Some(38400));
                assert_eq!(angle, -450);
            }
            _ => panic!("expected motor command"),
        }
    }

    #[test]
    fn test_baud_requires_port() {
        assert!(Cli::try_parse_from(["labwire", "motor", "--baud", "9600", "--angle", "1"]).is_err());
    }

    #[test]
    fn test_load_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"sensor": {{"ports": ["/dev/ttyACM0"], "read_timeout_ms": 250}}}}"#).unwrap();
        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.sensor.ports, vec!["/dev/ttyACM0".to_string()]);
        assert_eq!(config.sensor.read_timeout_ms, 250);
        assert_eq!(config.motor, MotorConfig::default());
    }

    #[test]
    fn test_load_config_rejects_bad_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(load_config(Some(file.path())).is_err());
    }

    #[tokio::test]
    async fn test_simulated_motor_move() {
        let config = MotorConfig {
            probe_timeout_ms: 100,
            settle_ms: 0,
            ..MotorConfig::default()
        };
        run_motor(config, opener(true), Some("SIM-MOTOR".to_string()), None, 2250)
            .await
            .unwrap();
    }
}
