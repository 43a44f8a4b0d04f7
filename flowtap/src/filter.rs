//! The set of addresses the collector watches.
//!
//! Entries are single IPv4 addresses (`192.168.108.115`) or CIDR networks
//! (`10.10.5.0/24`). The filter is built once from configuration and is
//! read-only afterward.

use std::{fmt, net::Ipv4Addr, str::FromStr};

use ipnet::Ipv4Net;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

/// Errors produced when parsing a filter entry.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The address part is not an IPv4 address.
    #[error("invalid IPv4 address in filter entry '{0}'")]
    Address(String),
    /// The prefix length is not a number between 0 and 32.
    #[error("invalid prefix length in filter entry '{0}'")]
    Prefix(String),
}

/// One configured filter entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Entry {
    /// A single address
    Host(Ipv4Addr),
    /// A CIDR network, host bits zeroed
    Network(Ipv4Net),
}

impl FromStr for Entry {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let Some((addr, _)) = s.split_once('/') else {
            return s
                .parse()
                .map(Entry::Host)
                .map_err(|_| Error::Address(s.to_string()));
        };
        if addr.parse::<Ipv4Addr>().is_err() {
            return Err(Error::Address(s.to_string()));
        }
        let net = Ipv4Net::from_str(s)
            .map_err(|_| Error::Prefix(s.to_string()))?
            .trunc();
        if net.prefix_len() == net.max_prefix_len() {
            Ok(Entry::Host(net.addr()))
        } else {
            Ok(Entry::Network(net))
        }
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entry::Host(addr) => write!(f, "{addr}"),
            Entry::Network(net) => write!(f, "{net}"),
        }
    }
}

/// The "interesting" addresses: traffic to them is a request, traffic from
/// them a response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct AddressFilter {
    hosts: FxHashSet<Ipv4Addr>,
    networks: Vec<Ipv4Net>,
}

impl AddressFilter {
    /// Build a filter from parsed entries.
    #[must_use]
    pub fn new<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = Entry>,
    {
        let mut filter = Self::default();
        for entry in entries {
            match entry {
                Entry::Host(addr) => {
                    filter.hosts.insert(addr);
                }
                Entry::Network(net) => {
                    if !filter.networks.contains(&net) {
                        filter.networks.push(net);
                    }
                }
            }
        }
        filter
    }

    /// Parse a comma separated list such as `10.0.0.1, 10.10.5.0/24`.
    ///
    /// # Errors
    ///
    /// Returns the first entry that fails to parse.
    pub fn parse_list(list: &str) -> Result<Self, Error> {
        let entries = list
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(str::parse)
            .collect::<Result<Vec<Entry>, _>>()?;
        Ok(Self::new(entries))
    }

    /// Whether `addr` is watched.
    #[must_use]
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.hosts.contains(&addr) || self.networks.iter().any(|net| net.contains(&addr))
    }

    /// Whether the filter watches nothing at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty() && self.networks.is_empty()
    }

    /// Number of configured entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hosts.len() + self.networks.len()
    }
}

impl TryFrom<Vec<String>> for AddressFilter {
    type Error = Error;

    fn try_from(value: Vec<String>) -> Result<Self, Self::Error> {
        let entries = value
            .iter()
            .map(|s| s.parse())
            .collect::<Result<Vec<Entry>, _>>()?;
        Ok(Self::new(entries))
    }
}

impl From<AddressFilter> for Vec<String> {
    fn from(filter: AddressFilter) -> Self {
        let mut hosts: Vec<Ipv4Addr> = filter.hosts.into_iter().collect();
        hosts.sort_unstable();
        hosts
            .into_iter()
            .map(|h| h.to_string())
            .chain(filter.networks.iter().map(ToString::to_string))
            .collect()
    }
}
