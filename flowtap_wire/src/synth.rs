//! Synthetic NetFlow v5 packets.
//!
//! Produces well-formed packets of request/response record pairs between a
//! client address range and a server address range. Requests flow client to
//! server, responses are the exact mirror, so a collector watching the server
//! range pairs every answered request. Some requests are left unanswered on
//! purpose.

use std::{
    net::Ipv4Addr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use rand::{Rng, distr::weighted::WeightedIndex, prelude::Distribution};
use serde::{Deserialize, Serialize};

use crate::{
    HEADER_LEN, Header, MAX_RECORDS_PER_PACKET, Packet, RECORD_LEN, Record, VERSION,
    range::ValueRange,
};

/// Errors produced by [`Generator`].
#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    /// The configuration failed validation.
    #[error("invalid synth configuration: {0}")]
    Config(String),
    /// The protocol weights could not build a distribution.
    #[error(transparent)]
    Weights(#[from] rand::distr::weighted::Error),
}

/// Configuration for [`Generator`]
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Conversations per packet; each answered one takes two records
    pub conversations_per_packet: ValueRange<u16>,
    /// Client addresses (as u32)
    pub client_range: ValueRange<u32>,
    /// Server addresses (as u32), the range a collector would watch
    pub server_range: ValueRange<u32>,
    /// Client ephemeral ports
    pub client_port_range: ValueRange<u16>,
    /// Server service ports
    pub server_port_range: ValueRange<u16>,
    /// Packets per flow direction
    pub packet_count_range: ValueRange<u32>,
    /// Bytes per flow direction
    pub byte_count_range: ValueRange<u32>,
    /// Flow duration in milliseconds
    pub flow_duration_range: ValueRange<u32>,
    /// Percentage, 0 to 100, of requests emitted without a response
    pub unanswered_percent: u8,
    /// Protocol weights
    pub protocol_weights: ProtocolWeights,
    /// Engine type stamped into every header
    pub engine_type: u8,
    /// Engine id stamped into every header
    pub engine_id: u8,
}

/// Protocol distribution weights
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProtocolWeights {
    /// Weight for TCP
    pub tcp: u8,
    /// Weight for UDP
    pub udp: u8,
}

impl Default for ProtocolWeights {
    fn default() -> Self {
        Self { tcp: 80, udp: 20 }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            conversations_per_packet: ValueRange::Inclusive { min: 1, max: 15 },
            client_range: ValueRange::Inclusive {
                min: u32::from_be_bytes([10, 0, 0, 1]),
                max: u32::from_be_bytes([10, 0, 255, 254]),
            },
            server_range: ValueRange::Inclusive {
                min: u32::from_be_bytes([192, 168, 108, 1]),
                max: u32::from_be_bytes([192, 168, 108, 254]),
            },
            client_port_range: ValueRange::Inclusive {
                min: 1024,
                max: 65535,
            },
            server_port_range: ValueRange::Inclusive { min: 1, max: 1023 },
            packet_count_range: ValueRange::Inclusive { min: 1, max: 10_000 },
            byte_count_range: ValueRange::Inclusive {
                min: 64,
                max: 1_500_000,
            },
            flow_duration_range: ValueRange::Inclusive {
                min: 1_000,
                max: 600_000,
            },
            unanswered_percent: 10,
            protocol_weights: ProtocolWeights::default(),
            engine_type: 0,
            engine_id: 0,
        }
    }
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first invalid field.
    pub fn validate(&self) -> Result<(), Error> {
        let ranges = [
            (
                "conversations_per_packet",
                self.conversations_per_packet.validate(),
            ),
            ("client_range", self.client_range.validate()),
            ("server_range", self.server_range.validate()),
            ("client_port_range", self.client_port_range.validate()),
            ("server_port_range", self.server_port_range.validate()),
            ("packet_count_range", self.packet_count_range.validate()),
            ("byte_count_range", self.byte_count_range.validate()),
            ("flow_duration_range", self.flow_duration_range.validate()),
        ];
        for (name, res) in ranges {
            res.map_err(|reason| Error::Config(format!("{name} is invalid: {reason}")))?;
        }

        // two records per answered conversation, so half the MTU budget
        if usize::from(self.conversations_per_packet.end()) * 2 > MAX_RECORDS_PER_PACKET {
            return Err(Error::Config(format!(
                "conversations_per_packet maximum must not exceed {}",
                MAX_RECORDS_PER_PACKET / 2
            )));
        }
        if self.unanswered_percent > 100 {
            return Err(Error::Config(
                "unanswered_percent must be between 0 and 100".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
/// NetFlow v5 request/response packet generator
pub struct Generator {
    config: Config,
    protocol_distribution: WeightedIndex<u16>,
    flow_sequence: u32,
    sys_uptime_base: u32,
}

impl Generator {
    /// Create a new [`Generator`]
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the protocol
    /// weights are all zero.
    pub fn new<R>(config: Config, rng: &mut R) -> Result<Self, Error>
    where
        R: Rng + ?Sized,
    {
        config.validate()?;
        let weights = [
            u16::from(config.protocol_weights.tcp),
            u16::from(config.protocol_weights.udp),
        ];

        Ok(Self {
            config,
            protocol_distribution: WeightedIndex::new(weights)?,
            flow_sequence: rng.random(),
            sys_uptime_base: rng.random_range(0..86_400_000),
        })
    }

    /// Generate the next packet stamped with the current wall clock.
    pub fn next_packet<R>(&mut self, rng: &mut R) -> Packet
    where
        R: Rng + ?Sized,
    {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        self.packet_at(now, rng)
    }

    /// Generate the next packet as if exported `since_epoch` after the unix
    /// epoch.
    #[allow(clippy::cast_possible_truncation)]
    pub fn packet_at<R>(&mut self, since_epoch: Duration, rng: &mut R) -> Packet
    where
        R: Rng + ?Sized,
    {
        let sys_uptime = self
            .sys_uptime_base
            .saturating_add(rng.random_range(0..3_600_000));
        let conversations = self.config.conversations_per_packet.sample(rng);

        let mut records = Vec::with_capacity(usize::from(conversations) * 2);
        for _ in 0..conversations {
            let request = self.request(sys_uptime, rng);
            records.push(request);
            if rng.random_range(0..100u8) >= self.config.unanswered_percent {
                records.push(self.response(&request, rng));
            }
        }

        let header = Header {
            version: VERSION,
            count: 0,
            sys_uptime,
            // NetFlow v5 seconds are 32 bits wide
            unix_secs: since_epoch.as_secs() as u32,
            unix_nsecs: since_epoch.subsec_nanos(),
            flow_sequence: self.flow_sequence,
            engine_type: self.config.engine_type,
            engine_id: self.config.engine_id,
            sampling_interval: 0,
        };
        let packet = Packet::new(header, records);
        self.flow_sequence = self
            .flow_sequence
            .wrapping_add(u32::from(packet.header.count));
        debug_assert!(packet.encoded_len() <= HEADER_LEN + MAX_RECORDS_PER_PACKET * RECORD_LEN);
        packet
    }

    fn request<R>(&self, sys_uptime: u32, rng: &mut R) -> Record
    where
        R: Rng + ?Sized,
    {
        let protocol = match self.protocol_distribution.sample(rng) {
            0 => 6,
            _ => 17,
        };
        let last = sys_uptime.saturating_sub(rng.random_range(0..1_000));
        let first = last.saturating_sub(self.config.flow_duration_range.sample(rng));
        let tcp_flags = if protocol == 6 {
            // SYN, ACK, PSH, FIN in some combination, SYN always present
            0x02 | (rng.random::<u8>() & 0x19)
        } else {
            0
        };

        Record {
            src_addr: Ipv4Addr::from(self.config.client_range.sample(rng)),
            dst_addr: Ipv4Addr::from(self.config.server_range.sample(rng)),
            next_hop: Ipv4Addr::UNSPECIFIED,
            input: rng.random_range(1..=16),
            output: rng.random_range(1..=16),
            packets: self.config.packet_count_range.sample(rng),
            octets: self.config.byte_count_range.sample(rng),
            first,
            last,
            src_port: self.config.client_port_range.sample(rng),
            dst_port: self.config.server_port_range.sample(rng),
            pad1: 0,
            tcp_flags,
            protocol,
            tos: 0,
            src_as: 0,
            dst_as: 0,
            src_mask: 16,
            dst_mask: 24,
            pad2: 0,
        }
    }

    fn response<R>(&self, request: &Record, rng: &mut R) -> Record
    where
        R: Rng + ?Sized,
    {
        Record {
            src_addr: request.dst_addr,
            dst_addr: request.src_addr,
            input: request.output,
            output: request.input,
            packets: self.config.packet_count_range.sample(rng),
            octets: self.config.byte_count_range.sample(rng),
            first: request
                .first
                .saturating_add(rng.random_range(0..50))
                .min(request.last),
            src_port: request.dst_port,
            dst_port: request.src_port,
            src_mask: request.dst_mask,
            dst_mask: request.src_mask,
            ..*request
        }
    }
}
