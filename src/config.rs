//! Configuration: bind URI parsing, allow-list, and the on-disk/CLI layers.
//!
//! Mirrors the grounding daemon crate's pattern of a `serde`-deserializable
//! config struct with a `[daemon]`-style TOML section, individually
//! overridable by `clap` flags in the binary entry point.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::errors::{ServerError, Result};

/// Default log level when neither `RUST_LOG` nor configuration sets one.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// A parsed `bind` target: which transport to listen on and its address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindSpec {
    Tcp(SocketAddr),
    Unix(PathBuf),
    Tls {
        addr: SocketAddr,
        cert_path: PathBuf,
        key_path: PathBuf,
    },
}

impl BindSpec {
    /// The wire-level kind string used in `SERVER_INHERITED_KIND`.
    pub fn kind(&self) -> &'static str {
        match self {
            BindSpec::Tcp(_) => "tcp",
            BindSpec::Unix(_) => "unix",
            BindSpec::Tls { .. } => "tls",
        }
    }

    /// Parse a `tcp://host:port`, `unix:///path`, or `tls://host:port` URI.
    ///
    /// TLS requires `cert_path` and `key_path` to already be known (supplied
    /// separately via configuration); this function only resolves the scheme
    /// and address, mirroring the data model's `TLS(host, port, cert_chain,
    /// key, protocol_version)` tuple where certificate material is loaded by
    /// an external collaborator and merely passed in here.
    pub fn parse(uri: &str, tls_cert_path: Option<&PathBuf>, tls_key_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(rest) = uri.strip_prefix("tcp://") {
            let addr = rest
                .parse::<SocketAddr>()
                .map_err(|e| ServerError::ConfigInvalid(format!("invalid tcp bind address {rest:?}: {e}")))?;
            Ok(BindSpec::Tcp(addr))
        } else if let Some(rest) = uri.strip_prefix("unix://") {
            Ok(BindSpec::Unix(PathBuf::from(rest)))
        } else if let Some(rest) = uri.strip_prefix("tls://") {
            let addr = rest
                .parse::<SocketAddr>()
                .map_err(|e| ServerError::ConfigInvalid(format!("invalid tls bind address {rest:?}: {e}")))?;
            let cert_path = tls_cert_path
                .cloned()
                .ok_or_else(|| ServerError::ConfigInvalid("tls:// bind requires tls_cert_path".into()))?;
            let key_path = tls_key_path
                .cloned()
                .ok_or_else(|| ServerError::ConfigInvalid("tls:// bind requires tls_key_path".into()))?;
            Ok(BindSpec::Tls { addr, cert_path, key_path })
        } else {
            Err(ServerError::ConfigInvalid(format!(
                "bind URI {uri:?} must start with tcp://, unix://, or tls://"
            )))
        }
    }
}

/// Ordered allow-list of CIDR ranges. Empty means allow all.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllowList(Vec<IpNet>);

impl AllowList {
    pub fn new(nets: Vec<IpNet>) -> Self {
        Self(nets)
    }

    pub fn parse_all(entries: &[String]) -> Result<Self> {
        let mut nets = Vec::with_capacity(entries.len());
        for entry in entries {
            let net = entry
                .parse::<IpNet>()
                .map_err(|e| ServerError::ConfigInvalid(format!("invalid CIDR {entry:?}: {e}")))?;
            nets.push(net);
        }
        Ok(Self(nets))
    }

    /// Whether `addr` is permitted. An empty allow-list permits everything.
    pub fn allows(&self, addr: &std::net::IpAddr) -> bool {
        self.0.is_empty() || self.0.iter().any(|net| net.contains(addr))
    }
}

/// Full runtime configuration for the supervisor.
///
/// Read from a TOML file (if present) and overridden field-by-field by CLI
/// flags, matching the grounding crate's config-then-CLI precedence.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
    pub pid_path: PathBuf,
    pub allowed_networks: AllowList,
    pub log_level: String,
    pub start_command: Vec<String>,
    pub drain_timeout: Option<Duration>,
}

impl ServerConfig {
    pub fn bind_spec(&self) -> Result<BindSpec> {
        BindSpec::parse(&self.bind, self.tls_cert_path.as_ref(), self.tls_key_path.as_ref())
    }

    pub fn validate(&self) -> Result<()> {
        self.bind_spec()?;
        if self.start_command.is_empty() {
            return Err(ServerError::ConfigInvalid("start_command must not be empty".into()));
        }
        match (&self.tls_cert_path, &self.tls_key_path) {
            (Some(_), None) => {
                return Err(ServerError::ConfigInvalid("tls_cert_path is set but tls_key_path is missing".into()));
            }
            (None, Some(_)) => {
                return Err(ServerError::ConfigInvalid("tls_key_path is set but tls_cert_path is missing".into()));
            }
            _ => {}
        }
        Ok(())
    }
}

/// On-disk representation of `ServerConfig`, as loaded from a TOML file.
///
/// Every field optional: a field left unset falls through to the CLI flag's
/// own default, then to the hard-coded defaults below.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    pub bind: Option<String>,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
    pub pid_path: Option<PathBuf>,
    #[serde(default)]
    pub allowed_networks: Vec<String>,
    pub log_level: Option<String>,
    pub start_command: Option<Vec<String>>,
    pub drain_timeout_secs: Option<u64>,
}

/// Command-line flags. Each overrides the matching TOML field when present.
#[derive(Parser, Debug, Default)]
#[command(name = "gracefuld", version, about = "A network server with uninterruptible restart")]
pub struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// `tcp://host:port`, `unix:///path`, or `tls://host:port`.
    #[arg(long)]
    pub bind: Option<String>,

    #[arg(long)]
    pub tls_cert_path: Option<PathBuf>,

    #[arg(long)]
    pub tls_key_path: Option<PathBuf>,

    #[arg(long)]
    pub pid_path: Option<PathBuf>,

    /// May be repeated; each value is one CIDR range.
    #[arg(long = "allow")]
    pub allowed_networks: Vec<String>,

    #[arg(long)]
    pub log_level: Option<String>,

    #[arg(long)]
    pub drain_timeout_secs: Option<u64>,
}

/// Load configuration from an optional TOML file, then apply CLI overrides.
///
/// `start_command` always defaults to the current executable's own argv (the
/// program re-execs itself on restart), matching §6's "the supervisor when
/// exec-ing the successor on restart" default.
pub fn load_config(cli: Cli) -> Result<ServerConfig> {
    let file = match &cli.config {
        Some(path) => {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<ConfigFile>(&contents)?
        }
        None => ConfigFile::default(),
    };

    let bind = cli
        .bind
        .or(file.bind)
        .ok_or_else(|| ServerError::ConfigInvalid("bind is required (set --bind or [bind] in config)".into()))?;

    let tls_cert_path = cli.tls_cert_path.or(file.tls_cert_path);
    let tls_key_path = cli.tls_key_path.or(file.tls_key_path);

    let pid_path = cli.pid_path.or(file.pid_path).unwrap_or_else(default_pid_path);

    let mut allowed = file.allowed_networks;
    allowed.extend(cli.allowed_networks);
    let allowed_networks = AllowList::parse_all(&allowed)?;

    let log_level = cli.log_level.or(file.log_level).unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());

    let start_command = file.start_command.unwrap_or_else(default_start_command);

    let drain_timeout = cli
        .drain_timeout_secs
        .or(file.drain_timeout_secs)
        .map(Duration::from_secs);

    let config = ServerConfig {
        bind,
        tls_cert_path,
        tls_key_path,
        pid_path,
        allowed_networks,
        log_level,
        start_command,
        drain_timeout,
    };
    config.validate()?;
    Ok(config)
}

/// `./<program>.pid`, per §6's default.
fn default_pid_path() -> PathBuf {
    let program = std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_os_string()))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("gracefuld"));
    let mut path = program;
    path.set_extension("pid");
    PathBuf::from(".").join(path)
}

fn default_start_command() -> Vec<String> {
    std::env::args().collect()
}
