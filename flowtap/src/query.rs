//! Reading stored flows back.
//!
//! A [`QuerySink`] answers time-bounded, filtered queries over stored flow
//! records. The [`http`] module exposes one over `GET /flows`.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use flowtap_wire::{Header, Record};
use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use crate::timebase::{Anomaly, FlowSpan};

pub mod http;

/// Errors produced by a [`QuerySink`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The query itself is malformed.
    #[error("invalid query: {0}")]
    Invalid(String),
    /// The backing store failed.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// A half-open window `[start, end)` in unix milliseconds. Either end may be
/// open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRange {
    /// Inclusive lower bound
    pub start: Option<i64>,
    /// Exclusive upper bound
    pub end: Option<i64>,
}

impl TimeRange {
    /// Every instant.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Whether `unix_millis` falls inside the window.
    #[must_use]
    pub fn contains(&self, unix_millis: i64) -> bool {
        self.start.is_none_or(|s| unix_millis >= s) && self.end.is_none_or(|e| unix_millis < e)
    }

    /// Check the window is not inverted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Invalid`] when `start` is after `end`.
    pub fn validate(&self) -> Result<(), Error> {
        match (self.start, self.end) {
            (Some(s), Some(e)) if s > e => Err(Error::Invalid(format!(
                "start {s} is after end {e}"
            ))),
            _ => Ok(()),
        }
    }
}

/// Attribute filters applied on top of a [`TimeRange`]. Unset fields match
/// everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryFilter {
    /// Exact source address
    pub src_ip: Option<Ipv4Addr>,
    /// Exact destination address
    pub dst_ip: Option<Ipv4Addr>,
    /// Either port
    pub port: Option<u16>,
    /// IP protocol number
    pub protocol: Option<u8>,
    /// Maximum number of results
    pub limit: Option<usize>,
}

impl QueryFilter {
    /// Whether `flow` passes every set field.
    #[must_use]
    pub fn matches(&self, flow: &StoredFlow) -> bool {
        self.src_ip.is_none_or(|ip| flow.src_ip == ip)
            && self.dst_ip.is_none_or(|ip| flow.dst_ip == ip)
            && self
                .port
                .is_none_or(|p| flow.src_port == p || flow.dst_port == p)
            && self.protocol.is_none_or(|p| flow.protocol == p)
    }
}

/// A flow record as it is stored and returned by queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFlow {
    /// Source address
    pub src_ip: Ipv4Addr,
    /// Destination address
    pub dst_ip: Ipv4Addr,
    /// Source port
    pub src_port: u16,
    /// Destination port
    pub dst_port: u16,
    /// IP protocol number
    pub protocol: u8,
    /// Octets in the flow
    pub bytes: u32,
    /// Packets in the flow
    pub packets: u32,
    /// Absolute start
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    /// Absolute end
    #[serde(with = "time::serde::rfc3339")]
    pub end_time: OffsetDateTime,
    /// Set when the reconstructed times are suspect
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_anomaly: Option<Anomaly>,
}

impl StoredFlow {
    /// Build the stored form of `record`. Returns `None` when its times fall
    /// outside what [`OffsetDateTime`] can represent.
    #[must_use]
    pub fn new(header: &Header, record: &Record) -> Option<Self> {
        let span = FlowSpan::of(header, record);
        Some(Self {
            src_ip: record.src_addr,
            dst_ip: record.dst_addr,
            src_port: record.src_port,
            dst_port: record.dst_port,
            protocol: record.protocol,
            bytes: record.octets,
            packets: record.packets,
            start_time: span.start.to_offset_date_time()?,
            end_time: span.end.to_offset_date_time()?,
            time_anomaly: span.anomaly(),
        })
    }

    /// Start time in unix milliseconds.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn start_millis(&self) -> i64 {
        // OffsetDateTime spans +/- 9999 years, well inside i64 milliseconds
        (self.start_time.unix_timestamp_nanos() / 1_000_000) as i64
    }
}

/// Parse an RFC 3339 timestamp into unix milliseconds.
///
/// # Errors
///
/// Returns [`Error::Invalid`] if `s` is not RFC 3339.
#[allow(clippy::cast_possible_truncation)]
pub fn parse_rfc3339_millis(s: &str) -> Result<i64, Error> {
    let t = OffsetDateTime::parse(s, &Rfc3339)
        .map_err(|e| Error::Invalid(format!("'{s}' is not an RFC 3339 timestamp: {e}")))?;
    Ok((t.unix_timestamp_nanos() / 1_000_000) as i64)
}

/// A store that can be queried for flows.
#[async_trait]
pub trait QuerySink: Send + Sync {
    /// Flows whose start time falls in `range` and that pass `filter`, in
    /// ascending start-time order.
    ///
    /// # Errors
    ///
    /// Returns an error if the query is invalid or the store is unavailable.
    async fn query(&self, range: TimeRange, filter: &QueryFilter)
    -> Result<Vec<StoredFlow>, Error>;
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::sink::tests::{header, record};

    #[test]
    fn stored_flow_serializes_rfc3339() {
        let rec = record(
            (Ipv4Addr::new(10, 0, 0, 1), 40_000),
            (Ipv4Addr::new(192, 168, 108, 5), 443),
        );
        // header: exported at 1_700_000_000s with 60s uptime; first = 10s
        let flow = StoredFlow::new(&header(), &rec).expect("in range");
        assert_eq!(flow.start_millis(), 1_699_999_950_000);

        let json = serde_json::to_value(&flow).expect("serializes");
        assert_eq!(json["start_time"], "2023-11-14T22:12:30Z");
        assert_eq!(json["end_time"], "2023-11-14T22:12:40Z");
        assert_eq!(json["src_ip"], "10.0.0.1");
        assert!(json.get("time_anomaly").is_none());

        let back: StoredFlow = serde_json::from_value(json).expect("deserializes");
        assert_eq!(back, flow);
    }

    #[test]
    fn anomaly_survives_json() {
        let mut rec = record(
            (Ipv4Addr::new(10, 0, 0, 1), 40_000),
            (Ipv4Addr::new(192, 168, 108, 5), 443),
        );
        // stamped after the 60s uptime at export
        rec.first = 70_000;
        rec.last = 75_000;
        let flow = StoredFlow::new(&header(), &rec).expect("in range");
        assert_eq!(flow.time_anomaly, Some(Anomaly::AfterExport));

        let json = serde_json::to_string(&flow).expect("serializes");
        assert!(json.contains("\"time_anomaly\":\"after_export\""));
        let back: StoredFlow = serde_json::from_str(&json).expect("deserializes");
        assert_eq!(back, flow);
    }

    #[test]
    fn ranges_are_half_open() {
        let range = TimeRange {
            start: Some(10),
            end: Some(20),
        };
        assert!(range.contains(10));
        assert!(range.contains(19));
        assert!(!range.contains(20));
        assert!(!range.contains(9));
        assert!(TimeRange::unbounded().contains(i64::MIN));
        assert!(
            TimeRange {
                start: Some(5),
                end: Some(1)
            }
            .validate()
            .is_err()
        );
    }

    #[test]
    fn rfc3339_parses_to_millis() {
        assert_eq!(
            parse_rfc3339_millis("2023-11-14T22:12:30.5Z").expect("valid"),
            1_699_999_950_500
        );
        assert!(matches!(
            parse_rfc3339_millis("yesterday"),
            Err(Error::Invalid(_))
        ));
    }

    #[test]
    fn port_filter_matches_either_end() {
        let rec = record(
            (Ipv4Addr::new(10, 0, 0, 1), 40_000),
            (Ipv4Addr::new(192, 168, 108, 5), 443),
        );
        let flow = StoredFlow::new(&header(), &rec).expect("in range");
        let by_port = |port| QueryFilter {
            port: Some(port),
            ..QueryFilter::default()
        };
        assert!(by_port(443).matches(&flow));
        assert!(by_port(40_000).matches(&flow));
        assert!(!by_port(80).matches(&flow));
        assert!(
            !QueryFilter {
                protocol: Some(17),
                ..QueryFilter::default()
            }
            .matches(&flow)
        );
    }
}
