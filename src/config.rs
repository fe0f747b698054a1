use std::fs::read_to_string;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

use codec::Dscp;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json5::Error,
    },
    #[error("session {id} has no destination address")]
    MissingDestination { id: u32 },
}

impl ConfigError {
    fn from_raw_sessions(raw: Vec<RawSessionSpec>) -> Result<Vec<SessionSpec>, Self> {
        raw.into_iter()
            .map(|r| {
                let dst = r.dst.ok_or(ConfigError::MissingDestination { id: r.id })?;
                Ok(SessionSpec {
                    id: r.id,
                    dst,
                    interval_micros: r.interval_micros,
                    dscp: r.dscp,
                })
            })
            .collect()
    }
}

/// The three ways `probed` can run, mirroring the original `-s`/`-c`/`-d`
/// flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Respond to PINGs, send PONGs and time reports. No sessions of its own.
    Server,
    /// PING a single destination given on the command line, print results
    /// to stdout and a summary on SIGINT.
    Client,
    /// Server and client together, driven by a session list from a
    /// configuration file, reporting through the [`crate::reporter::Reporter`].
    #[default]
    Daemon,
}

/// Where T1/T4 timestamps are taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampMode {
    /// NIC-assisted hardware timestamping (`SO_TIMESTAMPING` with
    /// `SOF_TIMESTAMPING_TX/RX_HARDWARE`).
    #[default]
    Hardware,
    /// Kernel/software timestamping on the socket.
    Kernel,
    /// `clock_gettime` called from userland immediately around the syscall.
    Userland,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }
}

/// One entry of the daemon-mode session list: a destination to PING, at
/// what interval, with what DSCP.
#[derive(Deserialize, Debug, Clone)]
pub struct SessionSpec {
    pub id: u32,
    pub dst: SocketAddr,
    /// Probe interval in microseconds, matching the original's single-field
    /// unit rather than a split seconds/microseconds pair.
    #[serde(default = "SessionSpec::default_interval_micros")]
    pub interval_micros: u64,
    #[serde(default)]
    pub dscp: u8,
}

impl SessionSpec {
    fn default_interval_micros() -> u64 {
        500_000
    }
}

/// The on-wire shape of a session entry: `dst` is optional here so a config
/// that omits it produces [`ConfigError::MissingDestination`] instead of a
/// generic parse failure.
#[derive(Deserialize, Debug, Clone)]
struct RawSessionSpec {
    id: u32,
    dst: Option<SocketAddr>,
    #[serde(default = "SessionSpec::default_interval_micros")]
    interval_micros: u64,
    #[serde(default)]
    dscp: u8,
}

#[derive(Deserialize, Debug, Default)]
pub struct Log {
    #[serde(default)]
    pub level: LogLevel,
}

/// The full daemon configuration: the merge of command-line flags and an
/// optional JSON5 configuration file, matching `-f file`.
#[derive(Debug)]
pub struct Config {
    pub mode: Mode,
    /// UDP/TCP port, source and destination, matching `-p port`.
    pub port: u16,
    /// Client-mode destination, matching `-c addr`.
    pub client_dst: Option<SocketAddr>,
    /// Client-mode PING interval in microseconds, matching `-w usecs`.
    pub client_interval_micros: u64,
    pub client_dscp: Dscp,
    pub timestamp_mode: TimestampMode,
    /// Network interface used for hardware timestamping, matching `-i iface`.
    pub interface: String,
    pub sessions: Vec<SessionSpec>,
    pub log: Log,
    /// Daemon-mode named pipe path results are written to.
    pub pipe_path: Option<PathBuf>,
    /// Per-probe deadline after which an outstanding round trip is
    /// classified `Timeout`/`PongLoss`/`TimestampError`.
    pub probe_timeout_micros: u64,
    /// `-f file`, kept around so SIGHUP can re-read the same file; `None`
    /// means sessions came from the CLI only and a reload is a no-op.
    pub config_path: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Default)]
struct FileConfig {
    #[serde(default)]
    timestamp_mode: TimestampMode,
    #[serde(default)]
    sessions: Vec<RawSessionSpec>,
    #[serde(default)]
    log: Log,
    pipe_path: Option<PathBuf>,
    #[serde(default = "FileConfig::default_probe_timeout_micros")]
    probe_timeout_micros: u64,
}

impl FileConfig {
    fn default_probe_timeout_micros() -> u64 {
        2_000_000
    }
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    /// Client mode: PING `addr`, fetch UDP timestamps.
    #[arg(short = 'c', long = "client")]
    client: Option<SocketAddr>,

    /// Server mode: respond to PING, send UDP timestamps.
    #[arg(short = 's', long = "server")]
    server: bool,

    /// Daemon mode: both server and client, output to pipe or stdout.
    #[arg(short = 'd', long = "daemon")]
    daemon: bool,

    /// Create timestamps in the kernel instead of hardware.
    #[arg(short = 'k', long = "kernel-timestamps")]
    kernel_timestamps: bool,

    /// Create timestamps in userland instead of hardware.
    #[arg(short = 'u', long = "userland-timestamps")]
    userland_timestamps: bool,

    /// Network interface used for hardware timestamping.
    #[arg(short = 'i', long = "iface", default_value = "eth0")]
    iface: String,

    /// UDP/TCP port, both source and destination.
    #[arg(short = 'p', long = "port", default_value_t = 60666)]
    port: u16,

    /// Client mode wait time between PINGs, in microseconds.
    #[arg(short = 'w', long = "wait", default_value_t = 500_000)]
    wait: u64,

    /// Output more debugging.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Be quiet, log errors only.
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,

    /// Path to configuration file.
    #[arg(short = 'f', long = "config")]
    config: Option<PathBuf>,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let cli = Cli::parse();

        let file = match &cli.config {
            Some(path) => load_file_config(path)?,
            None => FileConfig::default(),
        };

        let mode = if let Some(dst) = cli.client {
            let _ = dst;
            Mode::Client
        } else if cli.server {
            Mode::Server
        } else {
            Mode::Daemon
        };

        let timestamp_mode = if cli.kernel_timestamps {
            TimestampMode::Kernel
        } else if cli.userland_timestamps {
            TimestampMode::Userland
        } else {
            file.timestamp_mode
        };

        let mut log = file.log;
        if cli.verbose {
            log.level = LogLevel::Debug;
        } else if cli.quiet {
            log.level = LogLevel::Error;
        }

        Ok(Self {
            mode,
            port: cli.port,
            client_dst: cli.client,
            client_interval_micros: cli.wait,
            client_dscp: Dscp::new(1),
            timestamp_mode,
            interface: cli.iface,
            sessions: ConfigError::from_raw_sessions(file.sessions)?,
            log,
            pipe_path: file.pipe_path,
            probe_timeout_micros: file.probe_timeout_micros,
            config_path: cli.config,
        })
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), self.port)
    }

    /// Re-reads the session list from `config_path` for a SIGHUP reload.
    /// Only the session list changes on reload; port, timestamp mode and
    /// output sink are fixed for the process lifetime.
    pub fn reload_sessions(&self) -> Result<Vec<SessionSpec>, ConfigError> {
        match &self.config_path {
            Some(path) => ConfigError::from_raw_sessions(load_file_config(path)?.sessions),
            None => Ok(self.sessions.clone()),
        }
    }
}

fn load_file_config(path: &std::path::Path) -> Result<FileConfig, ConfigError> {
    let text = read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json5::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_config_defaults_are_lenient() {
        let cfg: FileConfig = serde_json5::from_str("{}").unwrap();
        assert_eq!(cfg.timestamp_mode, TimestampMode::Hardware);
        assert_eq!(cfg.probe_timeout_micros, 2_000_000);
        assert!(cfg.sessions.is_empty());
    }

    #[test]
    fn session_spec_parses_from_json5() {
        let cfg: FileConfig = serde_json5::from_str(
            r#"{
                sessions: [
                    { id: 1, dst: "198.51.100.9:60666", dscp: 46 },
                ],
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.sessions.len(), 1);
        assert_eq!(cfg.sessions[0].interval_micros, 500_000);
        assert_eq!(cfg.sessions[0].dscp, 46);
    }

    #[test]
    fn session_without_a_destination_is_rejected() {
        let cfg: FileConfig = serde_json5::from_str(r#"{ sessions: [ { id: 7 } ] }"#).unwrap();
        let err = ConfigError::from_raw_sessions(cfg.sessions).unwrap_err();
        assert!(matches!(err, ConfigError::MissingDestination { id: 7 }));
    }
}
