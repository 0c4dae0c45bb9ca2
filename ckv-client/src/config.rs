//! # Store Configuration
//!
//! Purpose: Describe where the store lives and how the pool behaves, read once
//! at process start.
//!
//! ## Sources
//! - `StoreConfig::default()`: localhost:6379, database 1, no password.
//! - `StoreConfig::from_json`: serde document, missing fields keep defaults.
//! - `StoreConfig::from_env`: `CKV_REDIS_ADDRESS`, `CKV_REDIS_PORT`,
//!   `CKV_REDIS_DATABASE`, `CKV_REDIS_PASSWORD` layered over the defaults.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ClientError, ClientResult};
use crate::pool::PoolConfig;

/// Environment variable prefix used by [`StoreConfig::from_env`].
pub const ENV_PREFIX: &str = "CKV_REDIS_";

const URL_SCHEME: &str = "redis://";

/// Connection and pool settings.
///
/// Durations are whole seconds; `0` disables the corresponding limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub address: String,
    pub port: u16,
    pub database: u32,
    pub password: Option<String>,
    /// Maximum idle connections kept in the pool.
    pub max_idle: usize,
    /// Maximum connections (idle + in use); `0` means unbounded.
    pub max_active: usize,
    pub idle_timeout_secs: u64,
    pub max_lifetime_secs: u64,
    /// Idle time after which a borrowed connection is pinged first.
    pub test_on_borrow_secs: u64,
    /// Block instead of failing when `max_active` is reached.
    pub wait: bool,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            address: "localhost".to_string(),
            port: 6379,
            database: 1,
            password: None,
            max_idle: 10,
            max_active: 0,
            idle_timeout_secs: 300,
            max_lifetime_secs: 0,
            test_on_borrow_secs: 60,
            wait: false,
            connect_timeout_secs: 10,
            read_timeout_secs: 600,
            write_timeout_secs: 10,
        }
    }
}

impl StoreConfig {
    /// Parses a JSON document; absent fields keep their defaults.
    pub fn from_json(raw: &str) -> ClientResult<Self> {
        serde_json::from_str(raw).map_err(|err| ClientError::Config(err.to_string()))
    }

    /// Layers `CKV_REDIS_*` environment variables over the defaults.
    pub fn from_env() -> ClientResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`StoreConfig::from_env`] with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> ClientResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |suffix: &str| {
            lookup(&format!("{ENV_PREFIX}{suffix}")).filter(|value| !value.trim().is_empty())
        };

        let mut config = StoreConfig::default();
        if let Some(address) = read("ADDRESS") {
            config.address = address;
        }
        if let Some(port) = read("PORT") {
            config.port = parse_field("port", &port)?;
        }
        if let Some(database) = read("DATABASE") {
            config.database = parse_field("database", &database)?;
        }
        if let Some(password) = read("PASSWORD") {
            config.password = Some(password);
        }
        Ok(config)
    }

    /// Connection URL derived from the address fields.
    pub fn url(&self) -> ConnectionUrl {
        ConnectionUrl {
            host: self.address.clone(),
            port: self.port,
            database: self.database,
            password: self.password.clone().filter(|password| !password.is_empty()),
        }
    }

    /// Pool settings derived from this configuration.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            url: self.url(),
            max_idle: self.max_idle,
            max_active: self.max_active,
            idle_timeout: secs(self.idle_timeout_secs),
            max_lifetime: secs(self.max_lifetime_secs),
            test_on_borrow: Some(Duration::from_secs(self.test_on_borrow_secs)),
            wait: self.wait,
            connect_timeout: secs(self.connect_timeout_secs),
            read_timeout: secs(self.read_timeout_secs),
            write_timeout: secs(self.write_timeout_secs),
        }
    }
}

fn secs(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}

fn parse_field<T: FromStr>(field: &str, raw: &str) -> ClientResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| ClientError::Config(format!("{field}: {raw:?} is not a number")))
}

/// `redis://[x:password@]host:port/database`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionUrl {
    pub host: String,
    pub port: u16,
    pub database: u32,
    pub password: Option<String>,
}

impl ConnectionUrl {
    /// URL with the password masked, safe for logs.
    pub fn redacted(&self) -> String {
        let masked = ConnectionUrl {
            password: self.password.as_ref().map(|_| "***".to_string()),
            ..self.clone()
        };
        masked.to_string()
    }
}

impl fmt::Display for ConnectionUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(URL_SCHEME)?;
        if let Some(password) = &self.password {
            write!(f, "x:{password}@")?;
        }
        write!(f, "{}:{}/{}", self.host, self.port, self.database)
    }
}

impl FromStr for ConnectionUrl {
    type Err = ClientError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ClientError::InvalidUrl(format!("{raw}: {reason}"));

        let rest = raw.strip_prefix(URL_SCHEME).ok_or_else(|| invalid("expected redis:// scheme"))?;
        let (userinfo, rest) = match rest.rfind('@') {
            Some(idx) => (Some(&rest[..idx]), &rest[idx + 1..]),
            None => (None, rest),
        };
        let password = userinfo
            .map(|info| match info.split_once(':') {
                Some((_, password)) => password.to_string(),
                None => info.to_string(),
            })
            .filter(|password| !password.is_empty());

        let (authority, database) = match rest.split_once('/') {
            Some((authority, "")) => (authority, 0),
            Some((authority, db)) => (authority, db.parse().map_err(|_| invalid("bad database index"))?),
            None => (rest, 0),
        };
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => (host, port.parse().map_err(|_| invalid("bad port"))?),
            None => (authority, 6379),
        };
        if host.is_empty() {
            return Err(invalid("missing host"));
        }

        Ok(ConnectionUrl {
            host: host.to_string(),
            port,
            database,
            password,
        })
    }
}
