//! The NetFlow v5 receive loop.
//!
//! One task owns the UDP socket and handles datagrams one at a time: decode,
//! correlate, hand the [`Batch`] to the [`Dispatcher`]. Nothing on this path
//! is fatal; malformed datagrams and socket read errors are logged and the
//! loop carries on. Only binding the socket can fail the loop.
//!
//! ## Metrics
//!
//! `packets_received`: Datagrams received
//! `bytes_received`: Bytes received
//! `decode_errors`: Datagrams rejected by the decoder, labelled by `reason`
//! `records_decoded`: Flow records decoded
//! `flows_correlated`: Conversations produced by correlation
//! `time_anomalies`: Records whose reconstructed time is suspect
//!

use std::{io, net::SocketAddr, sync::Arc};

use flowtap_wire::decode_packet;
use metrics::counter;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    config::{Config, TruncatedPolicy},
    correlate::correlate,
    filter::AddressFilter,
    sink::{Batch, Dispatcher},
    timebase::FlowSpan,
};

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Ingest`].
pub enum Error {
    /// Error binding UDP socket
    #[error("Failed to bind UDP socket to {addr}: {source}")]
    Bind {
        /// Binding address
        addr: SocketAddr,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// Error receiving packet
    #[error("Failed to receive packet on {addr}: {source}")]
    Recv {
        /// Listening address
        addr: SocketAddr,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
}

/// Turn one datagram into a [`Batch`].
///
/// Returns `Ok(None)` when the datagram was truncated and `policy` says to
/// drop it.
///
/// # Errors
///
/// Returns the decoder's error when the datagram is too short for a header or
/// is not version 5.
pub fn process_datagram(
    bytes: &[u8],
    exporter: SocketAddr,
    filter: &AddressFilter,
    policy: TruncatedPolicy,
) -> Result<Option<Batch>, flowtap_wire::Error> {
    let packet = decode_packet(bytes)?;
    if packet.truncation.is_some() && policy == TruncatedPolicy::Drop {
        return Ok(None);
    }
    let flows = correlate(&packet.records, filter);
    Ok(Some(Batch {
        header: packet.header,
        exporter,
        flows,
        records: packet.records,
        truncation: packet.truncation,
    }))
}

fn decode_error_reason(err: flowtap_wire::Error) -> &'static str {
    match err {
        flowtap_wire::Error::TruncatedHeader { .. } => "truncated_header",
        flowtap_wire::Error::TruncatedRecord { .. } => "truncated_record",
        flowtap_wire::Error::UnsupportedVersion(_) => "unsupported_version",
    }
}

/// The collector's receive loop.
#[derive(Debug)]
pub struct Ingest {
    socket: UdpSocket,
    addr: SocketAddr,
    buffer_len: usize,
    filter: AddressFilter,
    truncated: TruncatedPolicy,
    dispatcher: Dispatcher,
    metric_labels: Vec<(String, String)>,
}

impl Ingest {
    /// Bind the collector socket.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Bind`] if the socket cannot be bound.
    pub async fn bind(config: &Config, dispatcher: Dispatcher) -> Result<Self, Error> {
        let socket = UdpSocket::bind(config.listen_addr)
            .await
            .map_err(|source| Error::Bind {
                addr: config.listen_addr,
                source: Box::new(source),
            })?;
        let addr = socket.local_addr().map_err(|source| Error::Bind {
            addr: config.listen_addr,
            source: Box::new(source),
        })?;
        info!("listening for NetFlow v5 on {addr}");

        Ok(Self {
            socket,
            addr,
            buffer_len: config.max_datagram_bytes,
            filter: config.filter.clone(),
            truncated: config.truncated,
            dispatcher,
            metric_labels: vec![
                ("component".to_string(), "ingest".to_string()),
                ("component_name".to_string(), "netflow_v5".to_string()),
            ],
        })
    }

    /// The address the socket is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Run [`Ingest`] to completion
    ///
    /// Receives until `shutdown` is cancelled, then drains the dispatcher so
    /// queued displays and in-flight storage writes finish.
    ///
    /// # Errors
    ///
    /// None are known, receive errors are logged and skipped.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), Error> {
        let mut buf = vec![0; self.buffer_len];

        let shutdown_wait = shutdown.cancelled();
        tokio::pin!(shutdown_wait);
        loop {
            tokio::select! {
                packet = self.socket.recv_from(&mut buf) => {
                    match packet {
                        Ok((bytes, from)) => self.handle(&buf[..bytes], from),
                        Err(source) => {
                            let err = Error::Recv { addr: self.addr, source: Box::new(source) };
                            warn!("{err}");
                        }
                    }
                }
                () = &mut shutdown_wait => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        self.dispatcher.drain().await;
        Ok(())
    }

    fn labels_with(&self, key: &str, value: &str) -> Vec<(String, String)> {
        let mut labels = self.metric_labels.clone();
        labels.push((key.to_string(), value.to_string()));
        labels
    }

    fn handle(&mut self, bytes: &[u8], from: SocketAddr) {
        counter!("packets_received", &self.metric_labels).increment(1);
        counter!("bytes_received", &self.metric_labels).increment(bytes.len() as u64);

        let batch = match process_datagram(bytes, from, &self.filter, self.truncated) {
            Ok(Some(batch)) => batch,
            Ok(None) => {
                warn!("dropping truncated datagram from {from}");
                counter!("decode_errors", &self.labels_with("reason", "truncated_record"))
                    .increment(1);
                return;
            }
            Err(e) => {
                warn!("discarding datagram from {from}: {e}");
                counter!("decode_errors", &self.labels_with("reason", decode_error_reason(e)))
                    .increment(1);
                return;
            }
        };

        if let Some(e) = batch.truncation {
            warn!(
                "keeping {} records of truncated datagram from {from}: {e}",
                batch.records.len()
            );
            counter!("decode_errors", &self.labels_with("reason", decode_error_reason(e)))
                .increment(1);
        }

        for record in &batch.records {
            if let Some(anomaly) = FlowSpan::of(&batch.header, record).anomaly() {
                warn!(
                    "implausible flow time ({anomaly}) for {}:{} -> {}:{} from {from}",
                    record.src_addr, record.src_port, record.dst_addr, record.dst_port
                );
                counter!("time_anomalies", &self.labels_with("kind", anomaly.as_str()))
                    .increment(1);
            }
        }

        counter!("records_decoded", &self.metric_labels).increment(batch.records.len() as u64);
        counter!("flows_correlated", &self.metric_labels).increment(batch.flows.len() as u64);
        debug!(
            "{} bytes from {from}: {} records, {} flows",
            bytes.len(),
            batch.records.len(),
            batch.flows.len()
        );

        let outcome = self.dispatcher.dispatch(&Arc::new(batch));
        trace!("dispatched: {outcome:?}");
    }
}

#[cfg(test)]
mod tests {
    use std::{net::Ipv4Addr, time::Duration};

    use bytes::BufMut;
    use flowtap_wire::{
        HEADER_LEN, Packet, RECORD_LEN,
        synth::{self, Generator},
    };
    use rand::{SeedableRng, rngs::SmallRng};

    use super::*;
    use crate::{
        correlate::CorrelatedFlow,
        filter::Entry,
        sink::{
            memory::MemoryStore,
            tests::{header, record},
        },
    };

    const CLIENT: (Ipv4Addr, u16) = (Ipv4Addr::new(10, 0, 0, 1), 40_000);
    const SERVER: (Ipv4Addr, u16) = (Ipv4Addr::new(192, 168, 108, 115), 80);

    fn exporter() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 9995))
    }

    fn watching_server() -> AddressFilter {
        AddressFilter::new([Entry::Host(SERVER.0)])
    }

    fn pair_datagram() -> Vec<u8> {
        let mut request = record(CLIENT, SERVER);
        request.packets = 3;
        request.octets = 180;
        let mut response = record(SERVER, CLIENT);
        response.packets = 5;
        response.octets = 7_300;
        let packet = Packet::new(header(), vec![request, response]);
        let mut bytes = Vec::new();
        packet.encode(&mut bytes);
        bytes
    }

    #[test]
    fn request_response_datagram_is_one_paired_flow() {
        let bytes = pair_datagram();
        assert_eq!(bytes.len(), HEADER_LEN + 2 * RECORD_LEN);

        let batch = process_datagram(&bytes, exporter(), &watching_server(), TruncatedPolicy::Keep)
            .expect("decodes")
            .expect("kept");
        assert_eq!(batch.header.count, 2);
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.flows.len(), 1);
        match batch.flows[0] {
            CorrelatedFlow::Paired { request, response } => {
                assert_eq!((request.packets, request.octets), (3, 180));
                assert_eq!((response.packets, response.octets), (5, 7_300));
            }
            other => panic!("expected a pair, got {other:?}"),
        }
        assert_eq!(batch.exporter, exporter());
        assert!(batch.truncation.is_none());
    }

    #[test]
    fn truncated_datagram_follows_policy() {
        let mut bytes = pair_datagram();
        bytes.truncate(HEADER_LEN + RECORD_LEN + 10);

        let kept = process_datagram(&bytes, exporter(), &watching_server(), TruncatedPolicy::Keep)
            .expect("decodes")
            .expect("kept");
        assert_eq!(kept.records.len(), 1);
        assert_eq!(
            kept.flows,
            vec![CorrelatedFlow::Unanswered {
                request: kept.records[0]
            }]
        );
        assert_eq!(
            kept.truncation,
            Some(flowtap_wire::Error::TruncatedRecord { available: 10 })
        );

        let dropped =
            process_datagram(&bytes, exporter(), &watching_server(), TruncatedPolicy::Drop)
                .expect("decodes");
        assert!(dropped.is_none());
    }

    #[test]
    fn other_versions_are_rejected() {
        let mut bytes = pair_datagram();
        bytes[..2].copy_from_slice(&9u16.to_be_bytes());
        assert_eq!(
            process_datagram(&bytes, exporter(), &watching_server(), TruncatedPolicy::Keep),
            Err(flowtap_wire::Error::UnsupportedVersion(9))
        );
        let mut short = Vec::new();
        short.put_u16(5);
        assert_eq!(
            process_datagram(&short, exporter(), &watching_server(), TruncatedPolicy::Keep),
            Err(flowtap_wire::Error::TruncatedHeader { available: 2 })
        );
    }

    #[tokio::test]
    async fn datagrams_on_the_socket_reach_storage() {
        let mut rng = SmallRng::seed_from_u64(42);
        let mut generator = Generator::new(synth::Config::default(), &mut rng).expect("valid");
        let packets: Vec<Packet> = (0..5).map(|_| generator.next_packet(&mut rng)).collect();
        let expected: usize = packets.iter().map(|p| p.records.len()).sum();

        let store = Arc::new(MemoryStore::new(1_000));
        let mut dispatcher = Dispatcher::new(1_000, Vec::new());
        dispatcher.add_storage(store.clone());

        let config = Config {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            filter: AddressFilter::parse_list("192.168.108.0/24").expect("valid"),
            ..Config::default()
        };
        let ingest = Ingest::bind(&config, dispatcher).await.expect("bind");
        let addr = ingest.local_addr();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(ingest.run(shutdown.clone()));

        let sender = UdpSocket::bind("127.0.0.1:0").await.expect("bind sender");
        // Garbage first, the loop must survive it.
        sender.send_to(&[0u8; 7], addr).await.expect("send");
        for packet in &packets {
            let mut bytes = Vec::with_capacity(packet.encoded_len());
            packet.encode(&mut bytes);
            sender.send_to(&bytes, addr).await.expect("send");
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while store.len() < expected && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown.cancel();
        handle.await.expect("join").expect("clean exit");
        assert_eq!(store.len(), expected);
    }
}
