use std::net::Ipv4Addr;

use bytes::{Buf, BufMut};
use serde::Serialize;

use crate::{Error, RECORD_LEN};

/// NetFlow v5 flow record (48 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Record {
    /// Source IP address
    pub src_addr: Ipv4Addr,
    /// Destination IP address
    pub dst_addr: Ipv4Addr,
    /// Next hop router address
    pub next_hop: Ipv4Addr,
    /// SNMP index of the input interface
    pub input: u16,
    /// SNMP index of the output interface
    pub output: u16,
    /// Packets in the flow
    pub packets: u32,
    /// Total layer 3 bytes in the flow
    pub octets: u32,
    /// Device uptime, in milliseconds, at the start of the flow
    pub first: u32,
    /// Device uptime, in milliseconds, at the last packet of the flow
    pub last: u32,
    /// TCP/UDP source port, or 0
    pub src_port: u16,
    /// TCP/UDP destination port, or ICMP type and code
    pub dst_port: u16,
    /// Unused, kept so a record re-encodes identically
    pub pad1: u8,
    /// Cumulative OR of TCP flags seen in the flow
    pub tcp_flags: u8,
    /// IP protocol number (TCP=6, UDP=17, ICMP=1)
    pub protocol: u8,
    /// IP type of service
    pub tos: u8,
    /// Source autonomous system number
    pub src_as: u16,
    /// Destination autonomous system number
    pub dst_as: u16,
    /// Source address prefix mask bits
    pub src_mask: u8,
    /// Destination address prefix mask bits
    pub dst_mask: u8,
    /// Unused, kept so a record re-encodes identically
    pub pad2: u16,
}

impl Record {
    /// Decode a record from the front of `bytes`, returning the bytes that
    /// follow it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TruncatedRecord`] if fewer than [`RECORD_LEN`] bytes
    /// remain.
    pub fn decode(bytes: &[u8]) -> Result<(Self, &[u8]), Error> {
        if bytes.len() < RECORD_LEN {
            return Err(Error::TruncatedRecord {
                available: bytes.len(),
            });
        }
        let (mut rec, rest) = bytes.split_at(RECORD_LEN);
        let record = Self {
            src_addr: Ipv4Addr::from(rec.get_u32()),
            dst_addr: Ipv4Addr::from(rec.get_u32()),
            next_hop: Ipv4Addr::from(rec.get_u32()),
            input: rec.get_u16(),
            output: rec.get_u16(),
            packets: rec.get_u32(),
            octets: rec.get_u32(),
            first: rec.get_u32(),
            last: rec.get_u32(),
            src_port: rec.get_u16(),
            dst_port: rec.get_u16(),
            pad1: rec.get_u8(),
            tcp_flags: rec.get_u8(),
            protocol: rec.get_u8(),
            tos: rec.get_u8(),
            src_as: rec.get_u16(),
            dst_as: rec.get_u16(),
            src_mask: rec.get_u8(),
            dst_mask: rec.get_u8(),
            pad2: rec.get_u16(),
        };
        Ok((record, rest))
    }

    /// Write this record into `buf` in network byte order.
    pub fn encode<B>(&self, buf: &mut B)
    where
        B: BufMut,
    {
        buf.put_u32(u32::from(self.src_addr));
        buf.put_u32(u32::from(self.dst_addr));
        buf.put_u32(u32::from(self.next_hop));
        buf.put_u16(self.input);
        buf.put_u16(self.output);
        buf.put_u32(self.packets);
        buf.put_u32(self.octets);
        buf.put_u32(self.first);
        buf.put_u32(self.last);
        buf.put_u16(self.src_port);
        buf.put_u16(self.dst_port);
        buf.put_u8(self.pad1);
        buf.put_u8(self.tcp_flags);
        buf.put_u8(self.protocol);
        buf.put_u8(self.tos);
        buf.put_u16(self.src_as);
        buf.put_u16(self.dst_as);
        buf.put_u8(self.src_mask);
        buf.put_u8(self.dst_mask);
        buf.put_u16(self.pad2);
    }

    /// Flow duration in milliseconds, `None` if `last` precedes `first`.
    ///
    /// Both stamps count from the same boot so a negative duration means the
    /// exporter's uptime counter wrapped mid-flow.
    #[must_use]
    pub fn duration_ms(&self) -> Option<u32> {
        self.last.checked_sub(self.first)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        #[test]
        fn decode_then_encode_reproduces_bytes(raw in proptest::collection::vec(any::<u8>(), RECORD_LEN)) {
            let (record, rest) = Record::decode(&raw).expect("48 bytes always decode");
            prop_assert!(rest.is_empty());

            let mut out = Vec::with_capacity(RECORD_LEN);
            record.encode(&mut out);
            prop_assert_eq!(out, raw);
        }

        #[test]
        fn short_input_is_truncated_record(raw in proptest::collection::vec(any::<u8>(), 0..RECORD_LEN)) {
            let err = Record::decode(&raw).expect_err("short input must not decode");
            prop_assert_eq!(err, Error::TruncatedRecord { available: raw.len() });
        }
    }

    #[test]
    fn addresses_and_ports_decode() {
        let mut raw = vec![0u8; RECORD_LEN];
        raw[0..4].copy_from_slice(&[10, 0, 0, 1]);
        raw[4..8].copy_from_slice(&[192, 168, 1, 20]);
        raw[16..20].copy_from_slice(&7u32.to_be_bytes());
        raw[20..24].copy_from_slice(&1_500u32.to_be_bytes());
        raw[32..34].copy_from_slice(&51_000u16.to_be_bytes());
        raw[34..36].copy_from_slice(&443u16.to_be_bytes());
        raw[37] = 0x12;
        raw[38] = 6;

        let (record, _) = Record::decode(&raw).expect("valid record");
        assert_eq!(record.src_addr, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(record.dst_addr, Ipv4Addr::new(192, 168, 1, 20));
        assert_eq!(record.packets, 7);
        assert_eq!(record.octets, 1_500);
        assert_eq!(record.src_port, 51_000);
        assert_eq!(record.dst_port, 443);
        assert_eq!(record.tcp_flags, 0x12);
        assert_eq!(record.protocol, 6);
    }

    #[test]
    fn duration_detects_wrapped_counter() {
        let mut raw = vec![0u8; RECORD_LEN];
        raw[24..28].copy_from_slice(&1_000u32.to_be_bytes());
        raw[28..32].copy_from_slice(&4_000u32.to_be_bytes());
        let (record, _) = Record::decode(&raw).expect("valid record");
        assert_eq!(record.duration_ms(), Some(3_000));

        let wrapped = Record {
            first: u32::MAX - 10,
            last: 5,
            ..record
        };
        assert_eq!(wrapped.duration_ms(), None);
    }
}
