//! This module controls configuration parsing from the end user. The
//! collector is configured once at startup from YAML, environment variables
//! or both, and the resulting [`Config`] is passed down by reference. Crashes
//! are most likely to originate from this code, intentionally.

use std::{
    fs,
    io::{self, ErrorKind},
    net::{AddrParseError, SocketAddr},
    path::{Path, PathBuf},
};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{filter, filter::AddressFilter, query, sink::influx};

/// Environment variable holding the whole configuration as YAML.
pub const CONFIG_ENV: &str = "FLOWTAP_CONFIG";
/// Environment variable overriding [`Config::listen_addr`].
pub const LISTEN_ADDR_ENV: &str = "FLOWTAP_LISTEN_ADDR";
/// Environment variable overriding [`Config::filter`], comma separated.
pub const FILTER_ENV: &str = "FLOWTAP_FILTER";
/// Environment variables configuring InfluxDB storage: URL, API token,
/// organization and bucket.
pub const INFLUX_ENV: [&str; 4] = [
    "INFLUXDB_URL",
    "INFLUXDB_API_KEY",
    "INFLUXDB_ORG",
    "INFLUXDB_BUCKET",
];
/// Smallest receive buffer accepted, one Ethernet MTU.
pub const MIN_DATAGRAM_BYTES: usize = 1500;

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error reading config file
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// An environment variable held an unparsable socket address
    #[error("{var} is not a valid socket address: {source}")]
    SocketAddr {
        /// Variable name
        var: &'static str,
        /// Underlying parse error
        #[source]
        source: AddrParseError,
    },
    /// An environment variable held an unparsable filter list
    #[error("{var} is not a valid filter list: {source}")]
    Filter {
        /// Variable name
        var: &'static str,
        /// Underlying parse error
        #[source]
        source: filter::Error,
    },
    /// Only some of the InfluxDB variables were set
    #[error("InfluxDB environment is incomplete, missing {}", missing.join(", "))]
    IncompleteInfluxEnv {
        /// Variables that were not set
        missing: Vec<&'static str>,
    },
    /// A value failed validation
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// What to do with a datagram that declared more records than it carried.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TruncatedPolicy {
    /// Keep the records that were decoded
    #[default]
    Keep,
    /// Discard the whole datagram
    Drop,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 2055))
}

fn default_max_datagram_bytes() -> usize {
    MIN_DATAGRAM_BYTES
}

fn default_true() -> bool {
    true
}

fn default_queue_depth() -> usize {
    16
}

fn default_concurrent_writes_max() -> usize {
    64
}

fn default_memory_capacity() -> usize {
    100_000
}

/// Main configuration struct for this program
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// address -- IP plus port -- the collector listens on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// size of the receive buffer, datagrams longer than this are truncated
    #[serde(default = "default_max_datagram_bytes")]
    pub max_datagram_bytes: usize,
    /// the watched addresses, hosts or CIDR networks
    #[serde(default)]
    pub filter: AddressFilter,
    /// handling of datagrams that declare more records than they carry
    #[serde(default)]
    pub truncated: TruncatedPolicy,
    /// terminal output
    #[serde(default)]
    pub display: Display,
    /// where decoded records are stored
    #[serde(default)]
    pub storage: Storage,
    /// the flow query HTTP server, disabled when absent
    #[serde(default)]
    pub query: Option<query::http::Config>,
    /// the method by which to express telemetry
    #[serde(default)]
    pub telemetry: Telemetry,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_datagram_bytes: default_max_datagram_bytes(),
            filter: AddressFilter::default(),
            truncated: TruncatedPolicy::default(),
            display: Display::default(),
            storage: Storage::default(),
            query: None,
            telemetry: Telemetry::default(),
        }
    }
}

/// Terminal table configuration
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Display {
    /// print a table per datagram to stdout
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// batches buffered before the display sheds
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

impl Default for Display {
    fn default() -> Self {
        Self {
            enabled: true,
            queue_depth: default_queue_depth(),
        }
    }
}

/// Storage configuration
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Storage {
    /// storage writes allowed in flight before writes are shed
    #[serde(default = "default_concurrent_writes_max")]
    pub concurrent_writes_max: usize,
    /// InfluxDB v2 storage, disabled when absent
    #[serde(default)]
    pub influxdb: Option<influx::Config>,
    /// in-process store, required by the query server
    #[serde(default)]
    pub memory: Option<Memory>,
}

impl Default for Storage {
    fn default() -> Self {
        Self {
            concurrent_writes_max: default_concurrent_writes_max(),
            influxdb: None,
            memory: None,
        }
    }
}

/// In-process store configuration
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Memory {
    /// flows retained before the oldest are evicted
    #[serde(default = "default_memory_capacity")]
    pub capacity: usize,
}

/// Telemetry configuration
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Telemetry {
    /// address to expose Prometheus metrics on, disabled when absent
    #[serde(default)]
    pub prometheus_addr: Option<SocketAddr>,
    /// labels added to every metric
    #[serde(default)]
    pub global_labels: FxHashMap<String, String>,
}

impl Config {
    /// Parse a YAML document. Fields left out take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML does not describe a [`Config`].
    pub fn from_yaml(contents: &str) -> Result<Self, Error> {
        // An empty document is the empty mapping.
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Load configuration from its sources, apply environment overrides
    /// and validate the result.
    ///
    /// Sources, first found wins: the [`CONFIG_ENV`] variable, the file at
    /// `path`, built-in defaults. Defaults are only used when `path` is the
    /// implicit default path and no file exists there. `env` looks up
    /// environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be read or parsed, an override is
    /// malformed or validation fails.
    pub fn load<E>(path: &Path, path_is_default: bool, env: E) -> Result<Self, Error>
    where
        E: Fn(&str) -> Option<String>,
    {
        let mut config = if let Some(contents) = env(CONFIG_ENV) {
            debug!("Using config from env var '{CONFIG_ENV}'");
            Self::from_yaml(&contents)?
        } else {
            debug!("Attempting to open configuration file at: {}", path.display());
            match fs::read_to_string(path) {
                Ok(contents) => Self::from_yaml(&contents)?,
                Err(e) if e.kind() == ErrorKind::NotFound && path_is_default => {
                    debug!("No configuration file found, using defaults");
                    Self::default()
                }
                Err(e) => {
                    return Err(Error::ReadFile {
                        path: path.to_path_buf(),
                        source: Box::new(e),
                    });
                }
            }
        };
        config.apply_env(env)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if an override cannot be parsed or the InfluxDB
    /// variables are only partially set.
    pub fn apply_env<E>(&mut self, env: E) -> Result<(), Error>
    where
        E: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = env(LISTEN_ADDR_ENV) {
            self.listen_addr = addr.trim().parse().map_err(|source| Error::SocketAddr {
                var: LISTEN_ADDR_ENV,
                source,
            })?;
        }
        if let Some(list) = env(FILTER_ENV) {
            self.filter = AddressFilter::parse_list(&list).map_err(|source| Error::Filter {
                var: FILTER_ENV,
                source,
            })?;
        }

        let values = INFLUX_ENV.map(|var| env(var).filter(|v| !v.is_empty()));
        let missing: Vec<&'static str> = INFLUX_ENV
            .iter()
            .zip(&values)
            .filter(|(_, v)| v.is_none())
            .map(|(var, _)| *var)
            .collect();
        match (missing.len(), values) {
            (0, [Some(url), Some(token), Some(org), Some(bucket)]) => {
                let timeout_millis = self
                    .storage
                    .influxdb
                    .as_ref()
                    .map_or(influx::Config::DEFAULT_TIMEOUT_MILLIS, |c| c.timeout_millis);
                self.storage.influxdb = Some(influx::Config {
                    url,
                    token,
                    org,
                    bucket,
                    timeout_millis,
                });
            }
            (n, _) if n == INFLUX_ENV.len() => {}
            _ => return Err(Error::IncompleteInfluxEnv { missing }),
        }
        Ok(())
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns [`Error::Invalid`] naming the first problem found.
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_datagram_bytes < MIN_DATAGRAM_BYTES {
            return Err(Error::Invalid(format!(
                "max_datagram_bytes must be at least {MIN_DATAGRAM_BYTES}, got {}",
                self.max_datagram_bytes
            )));
        }
        if self.max_datagram_bytes > usize::from(u16::MAX) {
            return Err(Error::Invalid(format!(
                "max_datagram_bytes must be at most {}, got {}",
                u16::MAX,
                self.max_datagram_bytes
            )));
        }
        if self.display.enabled && self.display.queue_depth == 0 {
            return Err(Error::Invalid(
                "display.queue_depth must be greater than zero".to_string(),
            ));
        }
        if self.storage.concurrent_writes_max == 0 {
            return Err(Error::Invalid(
                "storage.concurrent_writes_max must be greater than zero".to_string(),
            ));
        }
        if self.storage.memory.is_some_and(|m| m.capacity == 0) {
            return Err(Error::Invalid(
                "storage.memory.capacity must be greater than zero".to_string(),
            ));
        }
        if let Some(influx) = self
            .storage
            .influxdb
            .as_ref()
            .filter(|c| !(c.url.starts_with("http://") || c.url.starts_with("https://")))
        {
            return Err(Error::Invalid(format!(
                "storage.influxdb.url must be an http or https URL, got '{}'",
                influx.url
            )));
        }
        if let Some(query) = self.query {
            if query.concurrent_requests_max == 0 {
                return Err(Error::Invalid(
                    "query.concurrent_requests_max must be greater than zero".to_string(),
                ));
            }
            if self.storage.memory.is_none() {
                return Err(Error::Invalid(
                    "query requires storage.memory to be configured".to_string(),
                ));
            }
        }
        if self.filter.is_empty() {
            debug!("filter is empty, no flows will be correlated");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, net::Ipv4Addr};

    use super::*;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn config_deserializes() {
        let contents = r#"
listen_addr: "127.0.0.1:9995"
max_datagram_bytes: 9000
filter:
  - "192.168.108.115"
  - "10.10.5.0/24"
truncated: drop
display:
  enabled: false
storage:
  concurrent_writes_max: 8
  influxdb:
    url: "http://localhost:8086"
    token: "secret"
    org: "net"
    bucket: "flows"
  memory:
    capacity: 500
query:
  binding_addr: "127.0.0.1:8080"
telemetry:
  prometheus_addr: "0.0.0.0:9000"
  global_labels:
    site: "edge-1"
"#;
        let config = Config::from_yaml(contents).expect("valid config");
        assert_eq!(config.listen_addr, SocketAddr::from(([127, 0, 0, 1], 9995)));
        assert_eq!(config.max_datagram_bytes, 9000);
        assert!(config.filter.contains(Ipv4Addr::new(10, 10, 5, 200)));
        assert_eq!(config.truncated, TruncatedPolicy::Drop);
        assert!(!config.display.enabled);
        assert_eq!(config.display.queue_depth, 16);
        assert_eq!(config.storage.concurrent_writes_max, 8);
        let influx = config.storage.influxdb.as_ref().expect("influx configured");
        assert_eq!(influx.bucket, "flows");
        assert_eq!(influx.timeout_millis, influx::Config::DEFAULT_TIMEOUT_MILLIS);
        assert_eq!(config.storage.memory, Some(Memory { capacity: 500 }));
        let query = config.query.expect("query configured");
        assert_eq!(query.concurrent_requests_max, 100);
        assert_eq!(
            config.telemetry.prometheus_addr,
            Some(SocketAddr::from(([0, 0, 0, 0], 9000)))
        );
        assert_eq!(
            config.telemetry.global_labels.get("site").map(String::as_str),
            Some("edge-1")
        );
        config.validate().expect("valid");
    }

    #[test]
    fn empty_document_is_default() {
        let config = Config::from_yaml("").expect("valid");
        assert_eq!(config, Config::default());
        assert_eq!(config.listen_addr.port(), 2055);
        assert_eq!(config.max_datagram_bytes, 1500);
        assert_eq!(config.truncated, TruncatedPolicy::Keep);
        assert!(config.display.enabled);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(matches!(
            Config::from_yaml("listen_address: \"0.0.0.0:2055\""),
            Err(Error::SerdeYaml(_))
        ));
    }

    #[test]
    fn small_buffers_are_invalid() {
        let config = Config {
            max_datagram_bytes: 512,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Invalid(_))));
    }

    #[test]
    fn query_needs_memory_store() {
        let config = Config::from_yaml("query:\n  binding_addr: \"127.0.0.1:8080\"\n")
            .expect("parses");
        assert!(matches!(config.validate(), Err(Error::Invalid(_))));
    }

    #[test]
    fn env_overrides_file() {
        let mut config = Config::default();
        config
            .apply_env(env_of(&[
                (LISTEN_ADDR_ENV, "127.0.0.1:6343"),
                (FILTER_ENV, "172.24.140.1,10.12.129.0/30"),
                ("INFLUXDB_URL", "http://influx:8086"),
                ("INFLUXDB_API_KEY", "k"),
                ("INFLUXDB_ORG", "o"),
                ("INFLUXDB_BUCKET", "b"),
            ]))
            .expect("valid env");
        assert_eq!(config.listen_addr.port(), 6343);
        assert!(config.filter.contains(Ipv4Addr::new(10, 12, 129, 2)));
        let influx = config.storage.influxdb.expect("influx from env");
        assert_eq!(influx.url, "http://influx:8086");
        assert_eq!(influx.token, "k");
    }

    #[test]
    fn partial_influx_env_is_an_error() {
        let mut config = Config::default();
        let res = config.apply_env(env_of(&[
            ("INFLUXDB_URL", "http://influx:8086"),
            ("INFLUXDB_ORG", "o"),
        ]));
        match res {
            Err(Error::IncompleteInfluxEnv { missing }) => {
                assert_eq!(missing, vec!["INFLUXDB_API_KEY", "INFLUXDB_BUCKET"]);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn bad_env_values_are_errors() {
        let mut config = Config::default();
        assert!(matches!(
            config.apply_env(env_of(&[(LISTEN_ADDR_ENV, "nowhere")])),
            Err(Error::SocketAddr { .. })
        ));
        assert!(matches!(
            config.apply_env(env_of(&[(FILTER_ENV, "10.10.5.")])),
            Err(Error::Filter { .. })
        ));
    }

    #[test]
    fn env_document_takes_precedence_over_path() {
        let config = Config::load(
            Path::new("/nonexistent/flowtap.yaml"),
            false,
            env_of(&[(CONFIG_ENV, "max_datagram_bytes: 2048\n")]),
        )
        .expect("loads from env");
        assert_eq!(config.max_datagram_bytes, 2048);
    }

    #[test]
    fn missing_default_path_falls_back_to_defaults() {
        let path = Path::new("/nonexistent/flowtap.yaml");
        let config = Config::load(path, true, env_of(&[])).expect("defaults");
        assert_eq!(config, Config::default());

        assert!(matches!(
            Config::load(path, false, env_of(&[])),
            Err(Error::ReadFile { .. })
        ));
    }
}
