//! The flowtap NetFlow v5 collector.
//!
//! This library supports the flowtap binary found elsewhere in this project.
//! Datagrams are decoded by `flowtap_wire`, their records are paired into
//! request/response conversations against a set of watched addresses, and the
//! result is handed to display and storage sinks. Stored flows can be queried
//! back over HTTP.

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
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

pub mod config;
pub mod correlate;
pub mod filter;
pub mod ingest;
pub mod query;
pub mod sink;
pub mod telemetry;
pub mod timebase;
