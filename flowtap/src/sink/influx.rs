//! InfluxDB v2 storage.
//!
//! Each record becomes one point of the `netflow` measurement, written with
//! the v2 `/api/v2/write` endpoint in line protocol at nanosecond precision.
//! The point is stamped with the flow's start time.

use std::{fmt::Write as _, time::Duration};

use async_trait::async_trait;
use flowtap_wire::{Header, Record};
use serde::{Deserialize, Serialize};

use super::{SinkError, StorageSink};
use crate::timebase::FlowSpan;

const MEASUREMENT: &str = "netflow";

fn default_timeout_millis() -> u64 {
    Config::DEFAULT_TIMEOUT_MILLIS
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
/// Configuration for [`InfluxSink`]
pub struct Config {
    /// Base URL of the server, for example `http://localhost:8086`
    pub url: String,
    /// API token sent as `Authorization: Token <token>`
    pub token: String,
    /// Organization owning the bucket
    pub org: String,
    /// Destination bucket
    pub bucket: String,
    /// Per-request timeout in milliseconds
    #[serde(default = "default_timeout_millis")]
    pub timeout_millis: u64,
}

impl Config {
    /// Request timeout used when none is configured.
    pub const DEFAULT_TIMEOUT_MILLIS: u64 = 5_000;
}

/// Format `record` as one line of InfluxDB line protocol.
#[must_use]
pub fn line_protocol(header: &Header, record: &Record) -> String {
    let span = FlowSpan::of(header, record);
    let mut line = format!(
        "{MEASUREMENT},dst_ip={},src_ip={}",
        record.dst_addr, record.src_addr
    );
    if let Some(anomaly) = span.anomaly() {
        let _ = write!(line, ",time_anomaly={anomaly}");
    }
    let _ = write!(
        line,
        " src_port={}u,dst_port={}u,protocol={}u,bytes={}u,packets={}u,start_time={}i,end_time={}i {}",
        record.src_port,
        record.dst_port,
        record.protocol,
        record.octets,
        record.packets,
        span.start.unix_nanos(),
        span.end.unix_nanos(),
        span.start.unix_nanos(),
    );
    line
}

/// Writes records to InfluxDB.
#[derive(Debug)]
pub struct InfluxSink {
    client: reqwest::Client,
    write_url: String,
    org: String,
    bucket: String,
    authorization: String,
    timeout: Duration,
}

impl InfluxSink {
    /// Create a new [`InfluxSink`]
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            client: reqwest::Client::new(),
            write_url: format!("{}/api/v2/write", config.url.trim_end_matches('/')),
            org: config.org.clone(),
            bucket: config.bucket.clone(),
            authorization: format!("Token {}", config.token),
            timeout: Duration::from_millis(config.timeout_millis),
        }
    }

    /// The endpoint points are written to.
    #[must_use]
    pub fn write_url(&self) -> &str {
        &self.write_url
    }
}

#[async_trait]
impl StorageSink for InfluxSink {
    fn name(&self) -> &'static str {
        "influxdb"
    }

    async fn write(&self, header: &Header, record: &Record) -> Result<(), SinkError> {
        let request_err = |source| SinkError::Request {
            url: self.write_url.clone(),
            source: Box::new(source),
        };
        let resp = self
            .client
            .post(&self.write_url)
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "ns"),
            ])
            .header(reqwest::header::AUTHORIZATION, &self.authorization)
            .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .timeout(self.timeout)
            .body(line_protocol(header, record))
            .send()
            .await
            .map_err(request_err)?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(SinkError::Rejected {
            url: self.write_url.clone(),
            status: status.as_u16(),
            body,
        })
    }
}
