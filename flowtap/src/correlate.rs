//! Pairing of request and response flows.
//!
//! A v5 record describes one direction of a conversation. Given the records of
//! one packet and the watched addresses, [`correlate`] classifies each record
//! and joins a request with the record travelling the opposite way over the
//! same 4-tuple.
//!
//! Classification:
//!
//! * a record whose destination is watched is a request, whether or not its
//!   source is watched too;
//! * otherwise a record whose source is watched is a response;
//! * anything else is ignored.
//!
//! Each unordered conversation is emitted at most once and the first record
//! seen wins. Requests come out in input order, followed by the responses that
//! no request claimed.

use std::{fmt, net::Ipv4Addr};

use flowtap_wire::Record;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;

use crate::filter::AddressFilter;

/// The correlation key of a flow: `(source, source port, destination,
/// destination port)`. Protocol is not part of the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FlowKey {
    /// Source address
    pub src_addr: Ipv4Addr,
    /// Source port
    pub src_port: u16,
    /// Destination address
    pub dst_addr: Ipv4Addr,
    /// Destination port
    pub dst_port: u16,
}

impl FlowKey {
    /// The key of `record`.
    #[must_use]
    pub fn of(record: &Record) -> Self {
        Self {
            src_addr: record.src_addr,
            src_port: record.src_port,
            dst_addr: record.dst_addr,
            dst_port: record.dst_port,
        }
    }

    /// The key of traffic flowing the opposite way.
    #[must_use]
    pub fn reverse(&self) -> Self {
        Self {
            src_addr: self.dst_addr,
            src_port: self.dst_port,
            dst_addr: self.src_addr,
            dst_port: self.src_port,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}->{}:{}",
            self.src_addr, self.src_port, self.dst_addr, self.dst_port
        )
    }
}

/// One conversation found in a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CorrelatedFlow {
    /// A request and its mirrored response.
    Paired {
        /// Record headed into the watched addresses
        request: Record,
        /// Record travelling back
        response: Record,
    },
    /// A request with no response in the same packet.
    Unanswered {
        /// Record headed into the watched addresses
        request: Record,
    },
    /// A response whose request was not in the same packet.
    Unsolicited {
        /// Record leaving the watched addresses
        response: Record,
    },
}

impl CorrelatedFlow {
    /// The request half, if present.
    #[must_use]
    pub fn request(&self) -> Option<&Record> {
        match self {
            CorrelatedFlow::Paired { request, .. } | CorrelatedFlow::Unanswered { request } => {
                Some(request)
            }
            CorrelatedFlow::Unsolicited { .. } => None,
        }
    }

    /// The response half, if present.
    #[must_use]
    pub fn response(&self) -> Option<&Record> {
        match self {
            CorrelatedFlow::Paired { response, .. } | CorrelatedFlow::Unsolicited { response } => {
                Some(response)
            }
            CorrelatedFlow::Unanswered { .. } => None,
        }
    }

    /// Whether both halves are present.
    #[must_use]
    pub fn is_paired(&self) -> bool {
        matches!(self, CorrelatedFlow::Paired { .. })
    }

    /// The key of the half that was classified first, the request when
    /// present.
    #[must_use]
    pub fn key(&self) -> FlowKey {
        match self {
            CorrelatedFlow::Paired { request, .. } | CorrelatedFlow::Unanswered { request } => {
                FlowKey::of(request)
            }
            CorrelatedFlow::Unsolicited { response } => FlowKey::of(response),
        }
    }

    /// Combined byte count of both halves.
    #[must_use]
    pub fn total_octets(&self) -> u64 {
        self.request().map_or(0, |r| u64::from(r.octets))
            + self.response().map_or(0, |r| u64::from(r.octets))
    }
}

/// Pair the records of one packet.
///
/// See the module documentation for the classification rules. The response
/// for a request is the first record in input order, other than the request
/// itself, whose key is the request's reverse key. Positions are indexed by
/// key up front so the whole pass is linear in the number of records.
#[must_use]
pub fn correlate(records: &[Record], filter: &AddressFilter) -> Vec<CorrelatedFlow> {
    let mut positions: FxHashMap<FlowKey, Vec<usize>> = FxHashMap::default();
    for (idx, record) in records.iter().enumerate() {
        positions.entry(FlowKey::of(record)).or_default().push(idx);
    }

    let mut paired: FxHashSet<FlowKey> = FxHashSet::default();
    let mut requests = Vec::new();
    let mut responses = Vec::new();

    for (idx, record) in records.iter().enumerate() {
        if filter.contains(record.dst_addr) {
            requests.push(idx);
        } else if filter.contains(record.src_addr) {
            responses.push(idx);
        }
    }

    let mut flows = Vec::with_capacity(requests.len() + responses.len());
    for idx in requests {
        let request = records[idx];
        let key = FlowKey::of(&request);
        let reverse = key.reverse();
        if paired.contains(&key) || paired.contains(&reverse) {
            continue;
        }
        paired.insert(key);
        paired.insert(reverse);

        let response = positions
            .get(&reverse)
            .and_then(|candidates| candidates.iter().copied().find(|&pos| pos != idx))
            .map(|pos| records[pos]);
        flows.push(match response {
            Some(response) => CorrelatedFlow::Paired { request, response },
            None => CorrelatedFlow::Unanswered { request },
        });
    }

    for idx in responses {
        let response = records[idx];
        let key = FlowKey::of(&response);
        let reverse = key.reverse();
        if paired.contains(&key) || paired.contains(&reverse) {
            continue;
        }
        paired.insert(key);
        paired.insert(reverse);
        flows.push(CorrelatedFlow::Unsolicited { response });
    }

    flows
}
