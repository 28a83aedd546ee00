use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand};
use omvp_session::{connect, Session, SessionConfig};
use omvp_transport::SerialStream;

use crate::exit::{io_error, session_error, CliError, CliResult, DATA_INVALID, USAGE};
use crate::output::OutputFormat;

pub mod info;
pub mod profile;
pub mod run;
pub mod stats;
pub mod stop;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a script and follow its output until it ends.
    Run(RunArgs),
    /// Stop the running script.
    Stop(StopArgs),
    /// Print firmware version, channels and negotiated link settings.
    Info(InfoArgs),
    /// Print host and device link counters.
    Stats(StatsArgs),
    /// Configure the profiler and print a snapshot.
    Profile(ProfileArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Run(args) => run::run(args, format),
        Command::Stop(args) => stop::run(args, format),
        Command::Info(args) => info::run(args, format),
        Command::Stats(args) => stats::run(args, format),
        Command::Profile(args) => profile::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

/// How to reach the device. Flags override values from `--config`.
#[derive(Args, Debug, Default)]
pub struct ConnectArgs {
    /// Serial port, or `unix:<path>` for a socket-bridged line.
    #[arg(long, short = 'p', env = "OMVP_PORT")]
    pub port: Option<String>,
    /// Line speed in baud.
    #[arg(long, env = "OMVP_BAUDRATE")]
    pub baudrate: Option<u32>,
    /// JSON file with session settings.
    #[arg(long, value_name = "FILE", env = "OMVP_CONFIG")]
    pub config: Option<PathBuf>,
    /// Per-attempt reply timeout (e.g. 1s, 250ms).
    #[arg(long)]
    pub timeout: Option<String>,
    /// Resends after the first attempt.
    #[arg(long)]
    pub max_retry: Option<u32>,
    /// Requested packet payload limit in bytes.
    #[arg(long)]
    pub max_payload: Option<usize>,
    /// Skip CRC verification of received packets.
    #[arg(long)]
    pub no_crc: bool,
    /// Skip sequence verification of received packets.
    #[arg(long)]
    pub no_seq: bool,
    /// Acknowledge device events and request acks for channel writes.
    #[arg(long)]
    pub ack: bool,
    /// Poll the device instead of letting it push events.
    #[arg(long)]
    pub no_events: bool,
    /// Discard this fraction of outbound writes (fault injection).
    #[arg(long, value_name = "RATE")]
    pub drop_rate: Option<f64>,
    /// Seed for reproducible fault injection.
    #[arg(long, requires = "drop_rate")]
    pub drop_seed: Option<u64>,
}

impl ConnectArgs {
    /// Build the session settings: defaults, then the config file, then flags.
    pub fn resolve(&self) -> CliResult<SessionConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .map_err(|err| io_error(&format!("read {}", path.display()), err))?;
                serde_json::from_str::<SessionConfig>(&text).map_err(|err| {
                    CliError::new(DATA_INVALID, format!("invalid config {}: {err}", path.display()))
                })?
            }
            None => SessionConfig::default(),
        };

        if let Some(port) = &self.port {
            config.port = port.clone();
        }
        if let Some(baudrate) = self.baudrate {
            config.baudrate = baudrate;
        }
        if let Some(timeout) = &self.timeout {
            config.timeout = parse_duration(timeout)?;
        }
        if let Some(max_retry) = self.max_retry {
            config.max_retry = max_retry;
        }
        if let Some(max_payload) = self.max_payload {
            config.max_payload = max_payload;
        }
        if self.no_crc {
            config.crc = false;
        }
        if self.no_seq {
            config.seq = false;
        }
        if self.ack {
            config.ack = true;
        }
        if self.no_events {
            config.events = false;
        }
        if let Some(rate) = self.drop_rate {
            config.drop_rate = rate;
        }
        if self.drop_seed.is_some() {
            config.drop_seed = self.drop_seed;
        }

        config
            .validate()
            .map_err(|err| CliError::new(USAGE, err.to_string()))?;
        Ok(config)
    }

    pub fn open(&self) -> CliResult<Session<SerialStream>> {
        let config = self.resolve()?;
        connect(&config).map_err(|err| session_error("connect failed", err))
    }
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Script file to execute on the device.
    pub script: PathBuf,
    #[command(flatten)]
    pub connect: ConnectArgs,
    /// Stop following after this long (e.g. 30s). Default: until the script ends.
    #[arg(long)]
    pub duration: Option<String>,
    /// Delay between polls.
    #[arg(long, default_value = "20ms")]
    pub poll_interval: String,
    /// Enable the frame stream and report received frames.
    #[arg(long)]
    pub stream: bool,
    /// Request uncompressed frames.
    #[arg(long, requires = "stream")]
    pub raw: bool,
    /// Requested frame width; 0 keeps the sensor size.
    #[arg(long, default_value_t = 0)]
    pub width: u16,
    /// Requested frame height; 0 keeps the sensor size.
    #[arg(long, default_value_t = 0)]
    pub height: u16,
    /// Loop a test pattern through the `buffer` channel before running.
    #[arg(long)]
    pub echo_check: bool,
    /// Leave the script running on exit.
    #[arg(long)]
    pub keep_running: bool,
}

#[derive(Args, Debug)]
pub struct StopArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,
}

#[derive(Args, Debug)]
pub struct InfoArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,
}

#[derive(Args, Debug)]
pub struct StatsArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,
    /// Only print host-side counters.
    #[arg(long)]
    pub host_only: bool,
}

#[derive(Args, Debug)]
pub struct ProfileArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,
    /// Assign a hardware event to a counter slot (SLOT=EVENT, repeatable).
    #[arg(long = "event", value_name = "SLOT=EVENT", value_parser = parse_event_slot)]
    pub events: Vec<(u32, u32)>,
    /// Clear all counters before reading.
    #[arg(long)]
    pub reset: bool,
    /// Exclude callee time from each function's totals.
    #[arg(long, conflicts_with = "inclusive")]
    pub exclusive: bool,
    /// Include callee time in each function's totals.
    #[arg(long)]
    pub inclusive: bool,
    /// Only print the N functions with the most ticks.
    #[arg(long)]
    pub top: Option<usize>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Parse `SLOT=EVENT`; the event id accepts decimal or `0x` hex.
pub fn parse_event_slot(input: &str) -> Result<(u32, u32), String> {
    let (slot, event) = input
        .split_once('=')
        .ok_or_else(|| format!("expected SLOT=EVENT, got '{input}'"))?;
    let slot = slot
        .trim()
        .parse()
        .map_err(|_| format!("invalid slot '{slot}'"))?;
    let event = event.trim();
    let event = match event.strip_prefix("0x").or_else(|| event.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => event.parse(),
    }
    .map_err(|_| format!("invalid event id '{event}'"))?;
    Ok((slot, event))
}

/// Parse `5s`, `250ms` or a bare number of seconds.
pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}
