use std::fs::File;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use cidr::{Ipv4Cidr, Ipv6Cidr};
use clap::Parser;
use serde::Deserialize;
use thiserror::Error;

use crate::log_warn;
use crate::services::geo::RemoteSettings;

// Listener defaults
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 4343;
pub const DEFAULT_SERVER_NAME: &str = "geo.whois.local";
pub const DEFAULT_CONFIG_PATH: &str = "./whois-geo.toml";

// Geo enrichment defaults
pub const DEFAULT_CACHE_TTL: u64 = 86400; // 1 day in seconds
pub const DEFAULT_REMOTE_TIMEOUT: u64 = 10;
pub const IPINFO_API_BASE: &str = "https://ipinfo.io";
pub const IPINFO_TOKEN_ENV: &str = "IPINFO_API_TOKEN";

/// Peers that are treated as operators when no list is configured
pub const DEFAULT_OPER_NETWORKS: &[&str] = &[
    "127.0.0.0/8", // Localhost
    "::1/128",     // Localhost
];

#[derive(Parser, Debug)]
#[command(author, version, about = "WHOIS geolocation enrichment server")]
pub struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Listen address
    #[arg(short = 'H', long, default_value = DEFAULT_HOST)]
    pub host: String,

    /// Listen port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Enable debug output
    #[arg(short, long)]
    pub debug: bool,

    /// Enable trace output (adds module paths)
    #[arg(short, long)]
    pub trace: bool,

    /// Write journald-style records instead of terminal lines
    #[arg(long)]
    pub journald: bool,

    /// Maximum concurrent connections
    #[arg(long, default_value_t = 100)]
    pub max_connections: usize,

    /// Idle connection timeout in seconds
    #[arg(long, default_value_t = 300)]
    pub timeout: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("No geo source configured: set geo.database_path, geo.apikey or IPINFO_API_TOKEN")]
    MissingSource,

    #[error("Cannot access DB file '{path}': {reason}")]
    DatabaseUnreadable { path: PathBuf, reason: String },

    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },

    #[error("Invalid operator network '{0}'")]
    InvalidNetwork(String),
}

/// `[server]` section as written in the file
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    pub name: String,
    pub oper_networks: Vec<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            name: DEFAULT_SERVER_NAME.to_string(),
            oper_networks: DEFAULT_OPER_NETWORKS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// `[geo]` section as written in the file
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GeoSection {
    /// MaxMind City database; takes precedence over the API
    pub database_path: Option<PathBuf>,
    pub apikey: Option<String>,
    pub endpoint: String,
    pub cache_ttl_seconds: u64,
    pub request_timeout_seconds: u64,
    /// Snapshot restored at startup and written at shutdown
    pub cache_file: Option<PathBuf>,
    /// 0 disables the periodic sweep
    pub sweep_interval_seconds: u64,
    pub coalesce_inflight: bool,
}

impl Default for GeoSection {
    fn default() -> Self {
        Self {
            database_path: None,
            apikey: None,
            endpoint: IPINFO_API_BASE.to_string(),
            cache_ttl_seconds: DEFAULT_CACHE_TTL,
            request_timeout_seconds: DEFAULT_REMOTE_TIMEOUT,
            cache_file: None,
            sweep_interval_seconds: 0,
            coalesce_inflight: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub server: ServerSection,
    pub geo: GeoSection,
}

/// Networks whose peers may see enrichment data
#[derive(Debug, Clone, Default)]
pub struct OperNetworks {
    v4: Vec<Ipv4Cidr>,
    v6: Vec<Ipv6Cidr>,
}

impl OperNetworks {
    pub fn parse<S: AsRef<str>>(networks: &[S]) -> Result<Self, ConfigError> {
        let mut parsed = Self::default();
        for network in networks {
            let network = network.as_ref().trim();
            if let Ok(cidr) = network.parse::<Ipv4Cidr>() {
                parsed.v4.push(cidr);
            } else if let Ok(cidr) = network.parse::<Ipv6Cidr>() {
                parsed.v6.push(cidr);
            } else {
                return Err(ConfigError::InvalidNetwork(network.to_string()));
            }
        }
        Ok(parsed)
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        match addr {
            IpAddr::V4(ip) => self.v4.iter().any(|cidr| cidr.contains(&ip)),
            IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
                Some(mapped) => self.contains(IpAddr::V4(mapped)),
                None => self.v6.iter().any(|cidr| cidr.contains(&ip)),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub enum SourceConfig {
    Local { database_path: PathBuf },
    Remote(RemoteSettings),
}

#[derive(Debug, Clone)]
pub struct GeoConfig {
    pub source: SourceConfig,
    pub cache_ttl: Duration,
    pub cache_file: Option<PathBuf>,
    pub sweep_interval: Option<Duration>,
    pub coalesce_inflight: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub oper_networks: OperNetworks,
}

/// Validated configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub geo: GeoConfig,
}

impl FromStr for FileConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(toml::from_str(s)?)
    }
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        content.parse()
    }

    /// Validate the file values. `env_token` is the API key from the
    /// environment, used when the file has none.
    pub fn validate(self, env_token: Option<String>) -> Result<AppConfig, ConfigError> {
        let geo = self.geo;

        if geo.cache_ttl_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                key: "geo.cache_ttl_seconds",
                reason: "must be greater than zero".to_string(),
            });
        }

        let apikey = geo
            .apikey
            .filter(|key| !key.trim().is_empty())
            .or_else(|| env_token.filter(|key| !key.trim().is_empty()));

        let source = match (geo.database_path, apikey) {
            (Some(database_path), apikey) => {
                // The database must be readable before the listener starts
                File::open(&database_path).map_err(|e| ConfigError::DatabaseUnreadable {
                    path: database_path.clone(),
                    reason: e.to_string(),
                })?;
                if apikey.is_some() {
                    log_warn!(
                        "Both geo.database_path and an API key are set, using the local database"
                    );
                }
                SourceConfig::Local { database_path }
            }
            (None, Some(apikey)) => {
                if geo.request_timeout_seconds == 0 {
                    return Err(ConfigError::InvalidValue {
                        key: "geo.request_timeout_seconds",
                        reason: "must be greater than zero".to_string(),
                    });
                }
                url::Url::parse(&geo.endpoint).map_err(|e| ConfigError::InvalidValue {
                    key: "geo.endpoint",
                    reason: e.to_string(),
                })?;
                SourceConfig::Remote(RemoteSettings {
                    endpoint: geo.endpoint,
                    apikey,
                    timeout: Duration::from_secs(geo.request_timeout_seconds),
                })
            }
            (None, None) => return Err(ConfigError::MissingSource),
        };

        let server = ServerConfig {
            name: self.server.name,
            oper_networks: OperNetworks::parse(&self.server.oper_networks)?,
        };

        Ok(AppConfig {
            server,
            geo: GeoConfig {
                source,
                cache_ttl: Duration::from_secs(geo.cache_ttl_seconds),
                cache_file: geo.cache_file,
                sweep_interval: (geo.sweep_interval_seconds > 0)
                    .then(|| Duration::from_secs(geo.sweep_interval_seconds)),
                coalesce_inflight: geo.coalesce_inflight,
            },
        })
    }
}

/// Load the configuration named on the command line, or the default file if
/// it exists, and validate it against the environment's API token.
pub fn load_config(cli_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let file = match cli_path {
        Some(path) => FileConfig::load(path)?,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            FileConfig::load(Path::new(DEFAULT_CONFIG_PATH))?
        }
        None => FileConfig::default(),
    };

    // .env is optional
    let _ = dotenv::dotenv();
    file.validate(std::env::var(IPINFO_TOKEN_ENV).ok())
}
