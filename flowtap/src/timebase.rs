//! Reconstruction of absolute flow times.
//!
//! A v5 record stamps its start and end in milliseconds since the exporter
//! booted. The header carries the exporter's uptime and wall clock at export,
//! which together anchor the device clock to real time:
//!
//! ```text
//! flow = unix_secs - sys_uptime + device_relative
//! ```
//!
//! All arithmetic happens in signed 64 bit milliseconds. The uptime counter is
//! 32 bits and wraps after roughly 49.7 days; a wrap shows up as a record
//! stamped later than the export itself, which is flagged as
//! [`Anomaly::AfterExport`] rather than corrected.

use std::fmt;

use flowtap_wire::{Header, Record};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Something implausible about a reconstructed flow time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Anomaly {
    /// The reconstructed instant precedes the unix epoch.
    BeforeEpoch,
    /// The device-relative stamp is later than the uptime at export, which
    /// happens when the uptime counter wrapped.
    AfterExport,
}

impl Anomaly {
    /// A stable, lowercase name suitable for tags and labels.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Anomaly::BeforeEpoch => "before_epoch",
            Anomaly::AfterExport => "after_export",
        }
    }
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An absolute flow time in unix milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FlowTime {
    /// Milliseconds since the unix epoch, negative if before it
    pub unix_millis: i64,
    /// Set when the value is not trustworthy
    pub anomaly: Option<Anomaly>,
}

impl FlowTime {
    /// Nanoseconds since the unix epoch.
    #[must_use]
    pub fn unix_nanos(&self) -> i128 {
        i128::from(self.unix_millis) * 1_000_000
    }

    /// Convert to an [`OffsetDateTime`], `None` when out of range.
    #[must_use]
    pub fn to_offset_date_time(&self) -> Option<OffsetDateTime> {
        OffsetDateTime::from_unix_timestamp_nanos(self.unix_nanos()).ok()
    }
}

/// Milliseconds since the unix epoch at which the exporter booted.
#[must_use]
pub fn boot_millis(header: &Header) -> i64 {
    i64::from(header.unix_secs) * 1_000 - i64::from(header.sys_uptime)
}

/// Reconstruct the absolute time of a device-relative millisecond stamp.
///
/// The result is linear in `device_relative_ms` and therefore monotone for a
/// fixed header.
#[must_use]
pub fn absolute_time(header: &Header, device_relative_ms: u32) -> FlowTime {
    let unix_millis = boot_millis(header) + i64::from(device_relative_ms);
    let anomaly = if unix_millis < 0 {
        Some(Anomaly::BeforeEpoch)
    } else if device_relative_ms > header.sys_uptime {
        Some(Anomaly::AfterExport)
    } else {
        None
    };
    FlowTime {
        unix_millis,
        anomaly,
    }
}

/// Absolute start and end times of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FlowSpan {
    /// When the first packet of the flow was seen
    pub start: FlowTime,
    /// When the last packet of the flow was seen
    pub end: FlowTime,
}

impl FlowSpan {
    /// Compute the span of `record` against its packet's `header`.
    #[must_use]
    pub fn of(header: &Header, record: &Record) -> Self {
        Self {
            start: absolute_time(header, record.first),
            end: absolute_time(header, record.last),
        }
    }

    /// The first anomaly of either end, if any.
    #[must_use]
    pub fn anomaly(&self) -> Option<Anomaly> {
        self.start.anomaly.or(self.end.anomaly)
    }
}

#[cfg(test)]
mod tests {
    use flowtap_wire::VERSION;
    use proptest::prelude::*;

    use super::*;

    fn header(sys_uptime: u32, unix_secs: u32) -> Header {
        Header {
            version: VERSION,
            count: 0,
            sys_uptime,
            unix_secs,
            unix_nsecs: 999_999_999,
            flow_sequence: 0,
            engine_type: 0,
            engine_id: 0,
            sampling_interval: 0,
        }
    }

    proptest! {
        #[test]
        fn monotone_in_relative_time(uptime: u32, secs: u32, a: u32, b: u32) {
            let h = header(uptime, secs);
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(absolute_time(&h, lo).unix_millis <= absolute_time(&h, hi).unix_millis);
        }

        #[test]
        fn export_instant_is_the_anchor(uptime: u32, secs: u32) {
            let h = header(uptime, secs);
            let t = absolute_time(&h, uptime);
            prop_assert_eq!(t.unix_millis, i64::from(secs) * 1_000);
        }
    }

    #[test]
    fn subsecond_nanos_are_ignored() {
        // Booted 10s before export at unix second 1_000, flow seen at 4s uptime.
        let h = header(10_000, 1_000);
        let t = absolute_time(&h, 4_000);
        assert_eq!(t.unix_millis, 994_000);
        assert_eq!(t.anomaly, None);
        assert_eq!(
            t.to_offset_date_time()
                .expect("in range")
                .unix_timestamp_nanos(),
            994_000_000_000
        );
    }

    #[test]
    fn early_boot_is_flagged_before_epoch() {
        // Device claims to have been up longer than the unix epoch is old.
        let h = header(u32::MAX, 1);
        let t = absolute_time(&h, 0);
        assert!(t.unix_millis < 0);
        assert_eq!(t.anomaly, Some(Anomaly::BeforeEpoch));
    }

    #[test]
    fn wrapped_uptime_is_flagged_after_export() {
        // The counter wrapped to 5s just before export, the flow was stamped
        // before the wrap.
        let h = header(5_000, 1_700_000_000);
        let t = absolute_time(&h, u32::MAX - 1_000);
        assert_eq!(t.anomaly, Some(Anomaly::AfterExport));
        assert!(t.unix_millis > i64::from(h.unix_secs) * 1_000);
    }

    #[test]
    fn span_reports_first_anomaly() {
        let h = header(5_000, 1_700_000_000);
        let record = Record {
            src_addr: std::net::Ipv4Addr::LOCALHOST,
            dst_addr: std::net::Ipv4Addr::LOCALHOST,
            next_hop: std::net::Ipv4Addr::UNSPECIFIED,
            input: 0,
            output: 0,
            packets: 1,
            octets: 64,
            first: 1_000,
            last: 6_000,
            src_port: 1,
            dst_port: 2,
            pad1: 0,
            tcp_flags: 0,
            protocol: 17,
            tos: 0,
            src_as: 0,
            dst_as: 0,
            src_mask: 0,
            dst_mask: 0,
            pad2: 0,
        };
        let span = FlowSpan::of(&h, &record);
        assert_eq!(span.start.anomaly, None);
        assert_eq!(span.anomaly(), Some(Anomaly::AfterExport));
        assert_eq!(span.end.unix_millis - span.start.unix_millis, 5_000);
    }
}
