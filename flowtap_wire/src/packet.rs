use bytes::BufMut;

use crate::{Error, HEADER_LEN, Header, RECORD_LEN, Record, VERSION};

/// A decoded NetFlow v5 datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// The packet header
    pub header: Header,
    /// Records decoded from the payload, in wire order
    pub records: Vec<Record>,
    /// Set when the header declared more records than the payload held.
    /// `records` then holds every record decoded before the shortfall.
    pub truncation: Option<Error>,
    /// Bytes left over after the declared records
    pub trailing_bytes: usize,
}

impl Packet {
    /// Build a packet whose header count matches `records`. The count
    /// saturates at `u16::MAX`.
    #[must_use]
    pub fn new(mut header: Header, records: Vec<Record>) -> Self {
        header.count = u16::try_from(records.len()).unwrap_or(u16::MAX);
        Self {
            header,
            records,
            truncation: None,
            trailing_bytes: 0,
        }
    }

    /// Encoded size of this packet in bytes.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.records.len() * RECORD_LEN
    }

    /// Write the header and every record into `buf`.
    pub fn encode<B>(&self, buf: &mut B)
    where
        B: BufMut,
    {
        self.header.encode(buf);
        for record in &self.records {
            record.encode(buf);
        }
    }
}

/// Decode one NetFlow v5 datagram.
///
/// Decoding stops at the first record that cannot be read in full. The
/// records read before that point are kept and the shortfall is reported in
/// [`Packet::truncation`], leaving the keep-or-drop decision to the caller.
///
/// # Errors
///
/// Returns [`Error::TruncatedHeader`] if the datagram is shorter than a
/// header and [`Error::UnsupportedVersion`] if the header version is not 5.
pub fn decode_packet(bytes: &[u8]) -> Result<Packet, Error> {
    let (header, mut rest) = Header::decode(bytes)?;
    if header.version != VERSION {
        return Err(Error::UnsupportedVersion(header.version));
    }

    let declared = usize::from(header.count);
    let mut records = Vec::with_capacity(declared.min(rest.len() / RECORD_LEN));
    let mut truncation = None;
    for _ in 0..declared {
        match Record::decode(rest) {
            Ok((record, tail)) => {
                records.push(record);
                rest = tail;
            }
            Err(err) => {
                truncation = Some(err);
                break;
            }
        }
    }

    let trailing_bytes = if truncation.is_some() { 0 } else { rest.len() };
    Ok(Packet {
        header,
        records,
        truncation,
        trailing_bytes,
    })
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use proptest::prelude::*;

    use super::*;

    fn header(count: u16) -> Header {
        Header {
            version: VERSION,
            count,
            sys_uptime: 3_600_000,
            unix_secs: 1_700_000_000,
            unix_nsecs: 0,
            flow_sequence: 42,
            engine_type: 0,
            engine_id: 0,
            sampling_interval: 0,
        }
    }

    fn record(n: u8) -> Record {
        Record {
            src_addr: Ipv4Addr::new(10, 0, 0, n),
            dst_addr: Ipv4Addr::new(192, 168, 0, n),
            next_hop: Ipv4Addr::UNSPECIFIED,
            input: 1,
            output: 2,
            packets: u32::from(n) * 10,
            octets: u32::from(n) * 1_000,
            first: 1_000,
            last: 2_000,
            src_port: 40_000 + u16::from(n),
            dst_port: 443,
            pad1: 0,
            tcp_flags: 0x1b,
            protocol: 6,
            tos: 0,
            src_as: 0,
            dst_as: 0,
            src_mask: 24,
            dst_mask: 24,
            pad2: 0,
        }
    }

    fn encode(header: Header, records: &[Record]) -> Vec<u8> {
        let mut buf = Vec::new();
        header.encode(&mut buf);
        for r in records {
            r.encode(&mut buf);
        }
        buf
    }

    proptest! {
        #[test]
        fn short_payload_keeps_decoded_prefix(declared in 1u16..=30, present_seed: u16) {
            let present = present_seed % declared;
            let records: Vec<Record> = (0..present).map(|n| record(n as u8)).collect();
            let mut bytes = encode(header(declared), &records);
            // a partial record at the tail must not be decoded
            bytes.extend_from_slice(&[0xff; RECORD_LEN - 1]);

            let packet = decode_packet(&bytes).expect("header is valid");
            prop_assert_eq!(packet.records.len(), usize::from(present));
            prop_assert_eq!(&packet.records, &records);
            prop_assert_eq!(
                packet.truncation,
                Some(Error::TruncatedRecord { available: RECORD_LEN - 1 })
            );
        }
    }

    #[test]
    fn full_packet_decodes() {
        let records = [record(1), record(2)];
        let bytes = encode(header(2), &records);
        assert_eq!(bytes.len(), HEADER_LEN + 2 * RECORD_LEN);

        let packet = decode_packet(&bytes).expect("valid packet");
        assert_eq!(packet.header, header(2));
        assert_eq!(packet.records, records);
        assert_eq!(packet.truncation, None);
        assert_eq!(packet.trailing_bytes, 0);
    }

    #[test]
    fn version_nine_is_rejected() {
        let mut h = header(0);
        h.version = 9;
        let bytes = encode(h, &[]);
        assert_eq!(decode_packet(&bytes), Err(Error::UnsupportedVersion(9)));
    }

    #[test]
    fn short_datagram_is_truncated_header() {
        assert_eq!(
            decode_packet(&[0, 5, 0]),
            Err(Error::TruncatedHeader { available: 3 })
        );
    }

    #[test]
    fn trailing_bytes_are_counted() {
        let mut bytes = encode(header(1), &[record(1), record(2)]);
        bytes.push(0);
        let packet = decode_packet(&bytes).expect("valid packet");
        assert_eq!(packet.records.len(), 1);
        assert_eq!(packet.trailing_bytes, RECORD_LEN + 1);
    }

    #[test]
    fn new_fixes_up_count_and_encodes() {
        let packet = Packet::new(header(0), vec![record(3), record(4), record(5)]);
        assert_eq!(packet.header.count, 3);

        let mut buf = Vec::with_capacity(packet.encoded_len());
        packet.encode(&mut buf);
        assert_eq!(buf.len(), packet.encoded_len());
        assert_eq!(decode_packet(&buf).expect("valid packet"), packet);
    }
}
