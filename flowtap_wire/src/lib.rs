//! The flowtap wire codec
//!
//! This library decodes and encodes the NetFlow v5 export format: a fixed
//! 24 byte header followed by `count` fixed 48 byte flow records, every
//! multi-byte integer in network byte order. Decoding is a pure function of
//! the input bytes. The [`synth`] module builds well-formed packets for load
//! and tests.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::multiple_crate_versions)]

mod header;
mod packet;
mod record;

pub mod range;
pub mod synth;

pub use header::Header;
pub use packet::{Packet, decode_packet};
pub use record::Record;

/// Size in bytes of an encoded [`Header`].
pub const HEADER_LEN: usize = 24;
/// Size in bytes of an encoded [`Record`].
pub const RECORD_LEN: usize = 48;
/// The only export version this crate accepts.
pub const VERSION: u16 = 5;
/// Largest record count an exporter puts in one datagram.
pub const MAX_RECORDS_PER_PACKET: usize = 30;

/// Errors produced while decoding NetFlow v5 bytes.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Fewer than [`HEADER_LEN`] bytes were available.
    #[error("truncated header: {available} of {HEADER_LEN} bytes available")]
    TruncatedHeader {
        /// Bytes that were available
        available: usize,
    },
    /// Fewer than [`RECORD_LEN`] bytes remained for the next record.
    #[error("truncated record: {available} of {RECORD_LEN} bytes available")]
    TruncatedRecord {
        /// Bytes that were available
        available: usize,
    },
    /// The header carried a version other than [`VERSION`].
    #[error("unsupported NetFlow version {0}, expected {VERSION}")]
    UnsupportedVersion(u16),
}
