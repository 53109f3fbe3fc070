//! Process configuration.
//!
//! Settings are read from `conf/xmppeeker.toml` under the process root and
//! may then be overridden per key with `PEEKER_<KEY>` environment variables.
//! A missing or invalid configuration is fatal at startup.

use std::env;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use chrono::format::{Item, StrftimeItems};
use serde::Deserialize;
use thiserror::Error;

pub const CONFIG_DIR: &str = "conf";
pub const CONFIG_FILE: &str = "xmppeeker.toml";

const DEFAULT_LOG_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";
const DEFAULT_FILE_TIME_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: &'static str,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(rename = "BackendHost")]
    pub backend_host: String,
    #[serde(rename = "BackendPort")]
    pub backend_port: u16,
    #[serde(rename = "ListenHost")]
    pub listen_host: String,
    #[serde(rename = "ListenPort")]
    pub listen_port: u16,
    #[serde(rename = "ConnectTimeout")]
    pub connect_timeout: u64,
    #[serde(rename = "LogTimeFormat")]
    pub log_time_format: String,
    #[serde(rename = "FileTimeFormat")]
    pub file_time_format: String,
    #[serde(rename = "Certificate")]
    pub certificate: PathBuf,
    #[serde(rename = "CertificateKey")]
    pub certificate_key: PathBuf,
    #[serde(rename = "LogPath")]
    pub log_path: PathBuf,
    #[serde(rename = "MaxConnections")]
    pub max_connections: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_host: String::new(),
            backend_port: 5222,
            listen_host: "0.0.0.0".to_string(),
            listen_port: 5222,
            connect_timeout: 10,
            log_time_format: DEFAULT_LOG_TIME_FORMAT.to_string(),
            file_time_format: DEFAULT_FILE_TIME_FORMAT.to_string(),
            certificate: PathBuf::from("certs/xmppeeker.crt"),
            certificate_key: PathBuf::from("certs/xmppeeker.key"),
            log_path: PathBuf::from("logs"),
            max_connections: 256,
        }
    }
}

impl Config {
    /// Loads the configuration file under `root`, applies environment
    /// overrides, and validates the result.
    pub fn load(root: &Path) -> Result<Self, ConfigError> {
        let path = root.join(CONFIG_DIR).join(CONFIG_FILE);
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let mut config: Config =
            toml::from_str(&text).map_err(|source| ConfigError::Parse { path, source })?;
        config.apply_overrides(|key| env::var(format!("PEEKER_{key}")).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Applies per-key overrides from a lookup of uppercased key names.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("BACKENDHOST") {
            self.backend_host = v;
        }
        if let Some(v) = lookup("BACKENDPORT") {
            self.backend_port = parse_number("BackendPort", &v)?;
        }
        if let Some(v) = lookup("LISTENHOST") {
            self.listen_host = v;
        }
        if let Some(v) = lookup("LISTENPORT") {
            self.listen_port = parse_number("ListenPort", &v)?;
        }
        if let Some(v) = lookup("CONNECTTIMEOUT") {
            self.connect_timeout = parse_number("ConnectTimeout", &v)?;
        }
        if let Some(v) = lookup("LOGTIMEFORMAT") {
            self.log_time_format = v;
        }
        if let Some(v) = lookup("FILETIMEFORMAT") {
            self.file_time_format = v;
        }
        if let Some(v) = lookup("CERTIFICATE") {
            self.certificate = PathBuf::from(v);
        }
        if let Some(v) = lookup("CERTIFICATEKEY") {
            self.certificate_key = PathBuf::from(v);
        }
        if let Some(v) = lookup("LOGPATH") {
            self.log_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("MAXCONNECTIONS") {
            self.max_connections = parse_number("MaxConnections", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !validator::is_address(&self.backend_host) {
            return Err(ConfigError::Invalid {
                key: "BackendHost",
                value: self.backend_host.clone(),
                reason: "must be either an IP address or hostname",
            });
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid {
                key: "MaxConnections",
                value: self.max_connections.to_string(),
                reason: "must be at least 1",
            });
        }
        check_time_format("LogTimeFormat", &self.log_time_format)?;
        check_time_format("FileTimeFormat", &self.file_time_format)?;
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: "not a valid number",
    })
}

/// Rejects chrono format strings that would fail at render time; these are
/// used on every logged byte, so a bad one must be caught at startup.
fn check_time_format(key: &'static str, format: &str) -> Result<(), ConfigError> {
    let valid = StrftimeItems::new(format).all(|item| !matches!(item, Item::Error));
    if valid {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            key,
            value: format.to_string(),
            reason: "not a valid time format string",
        })
    }
}

/// Host string validation for the backend address.
pub mod validator {
    use super::IpAddr;
    use regex::Regex;
    use std::sync::OnceLock;

    const DNS_NAME: &str =
        r"^([A-Za-z0-9_]{1}[A-Za-z0-9_-]{0,62})(\.[A-Za-z0-9_]{1}[A-Za-z0-9_-]{0,62})*[\._]?$";

    fn dns_name_pattern() -> &'static Regex {
        static PATTERN: OnceLock<Regex> = OnceLock::new();
        PATTERN.get_or_init(|| Regex::new(DNS_NAME).expect("DNS name pattern must compile"))
    }

    pub fn is_address(value: &str) -> bool {
        is_ip(value) || is_dns_name(value)
    }

    pub fn is_ip(value: &str) -> bool {
        value.parse::<IpAddr>().is_ok()
    }

    pub fn is_dns_name(value: &str) -> bool {
        if value.is_empty() || value.replace('.', "").len() > 255 {
            return false;
        }
        dns_name_pattern().is_match(value)
    }
}
