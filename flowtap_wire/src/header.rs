use bytes::{Buf, BufMut};
use serde::Serialize;

use crate::{Error, HEADER_LEN};

/// NetFlow v5 packet header (24 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Header {
    /// Export format version, 5 for every packet this crate accepts
    pub version: u16,
    /// Number of flow records following the header
    pub count: u16,
    /// Milliseconds since the exporting device booted
    pub sys_uptime: u32,
    /// Seconds since the unix epoch at export
    pub unix_secs: u32,
    /// Residual nanoseconds since the unix epoch at export
    pub unix_nsecs: u32,
    /// Sequence counter of total flows seen by the exporter
    pub flow_sequence: u32,
    /// Type of flow switching engine
    pub engine_type: u8,
    /// Slot number of the flow switching engine
    pub engine_id: u8,
    /// Sampling mode (two high bits) and interval (low fourteen bits)
    pub sampling_interval: u16,
}

impl Header {
    /// Decode a header from the front of `bytes`, returning the bytes that
    /// follow it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TruncatedHeader`] if fewer than [`HEADER_LEN`] bytes
    /// are available. Nothing is consumed in that case.
    pub fn decode(bytes: &[u8]) -> Result<(Self, &[u8]), Error> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::TruncatedHeader {
                available: bytes.len(),
            });
        }
        let (mut head, rest) = bytes.split_at(HEADER_LEN);
        let header = Self {
            version: head.get_u16(),
            count: head.get_u16(),
            sys_uptime: head.get_u32(),
            unix_secs: head.get_u32(),
            unix_nsecs: head.get_u32(),
            flow_sequence: head.get_u32(),
            engine_type: head.get_u8(),
            engine_id: head.get_u8(),
            sampling_interval: head.get_u16(),
        };
        Ok((header, rest))
    }

    /// Write this header into `buf` in network byte order.
    pub fn encode<B>(&self, buf: &mut B)
    where
        B: BufMut,
    {
        buf.put_u16(self.version);
        buf.put_u16(self.count);
        buf.put_u32(self.sys_uptime);
        buf.put_u32(self.unix_secs);
        buf.put_u32(self.unix_nsecs);
        buf.put_u32(self.flow_sequence);
        buf.put_u8(self.engine_type);
        buf.put_u8(self.engine_id);
        buf.put_u16(self.sampling_interval);
    }

    /// The sampling interval with the two mode bits masked off.
    #[must_use]
    pub fn sample_rate(&self) -> u16 {
        self.sampling_interval & 0x3fff
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        #[test]
        fn decode_then_encode_reproduces_bytes(raw in proptest::collection::vec(any::<u8>(), HEADER_LEN)) {
            let (header, rest) = Header::decode(&raw).expect("24 bytes always decode");
            prop_assert!(rest.is_empty());

            let mut out = Vec::with_capacity(HEADER_LEN);
            header.encode(&mut out);
            prop_assert_eq!(out, raw);
        }

        #[test]
        fn short_input_is_truncated_header(raw in proptest::collection::vec(any::<u8>(), 0..HEADER_LEN)) {
            let err = Header::decode(&raw).expect_err("short input must not decode");
            prop_assert_eq!(err, Error::TruncatedHeader { available: raw.len() });
        }
    }

    #[test]
    fn fields_are_big_endian() {
        let raw: [u8; HEADER_LEN] = [
            0x00, 0x05, // version
            0x00, 0x02, // count
            0x00, 0x01, 0x00, 0x00, // sys_uptime
            0x65, 0x00, 0x00, 0x01, // unix_secs
            0x00, 0x00, 0x00, 0x07, // unix_nsecs
            0x00, 0x00, 0x01, 0x00, // flow_sequence
            0x01, 0x02, // engine type, id
            0x40, 0x0a, // sampling
        ];
        let (header, _) = Header::decode(&raw).expect("valid header");
        assert_eq!(header.version, 5);
        assert_eq!(header.count, 2);
        assert_eq!(header.sys_uptime, 65_536);
        assert_eq!(header.unix_secs, 0x6500_0001);
        assert_eq!(header.unix_nsecs, 7);
        assert_eq!(header.flow_sequence, 256);
        assert_eq!(header.engine_type, 1);
        assert_eq!(header.engine_id, 2);
        assert_eq!(header.sample_rate(), 10);
    }

    #[test]
    fn rest_follows_header() {
        let mut raw = vec![0; HEADER_LEN];
        raw.extend_from_slice(&[0xaa, 0xbb]);
        let (_, rest) = Header::decode(&raw).expect("valid header");
        assert_eq!(rest, &[0xaa, 0xbb]);
    }
}
