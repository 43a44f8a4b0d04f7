//! Terminal table of correlated flows.

use std::{fmt, io::Write};

use flowtap_wire::Record;
use tabled::{Table, Tabled, settings::Style};
use tracing::warn;

use super::{Batch, DisplaySink};
use crate::correlate::CorrelatedFlow;

/// Table row for one half of a conversation
#[derive(Tabled)]
struct FlowRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Type")]
    kind: &'static str,
    #[tabled(rename = "SrcIP")]
    src_ip: String,
    #[tabled(rename = "DstIP")]
    dst_ip: String,
    #[tabled(rename = "SrcPort")]
    src_port: u16,
    #[tabled(rename = "DstPort")]
    dst_port: u16,
    #[tabled(rename = "Protocol")]
    protocol: u8,
    #[tabled(rename = "Bytes")]
    bytes: u32,
    #[tabled(rename = "Packets")]
    packets: u32,
}

impl FlowRow {
    fn new(index: usize, kind: &'static str, record: &Record) -> Self {
        Self {
            index,
            kind,
            src_ip: record.src_addr.to_string(),
            dst_ip: record.dst_addr.to_string(),
            src_port: record.src_port,
            dst_port: record.dst_port,
            protocol: record.protocol,
            bytes: record.octets,
            packets: record.packets,
        }
    }
}

/// Render the flows of `batch` as a table, one row per half, numbered by
/// flow. Returns `None` when the batch has no flows.
#[must_use]
pub fn render_table(batch: &Batch) -> Option<String> {
    if batch.flows.is_empty() {
        return None;
    }
    let mut rows = Vec::with_capacity(batch.flows.len() * 2);
    for (idx, flow) in batch.flows.iter().enumerate() {
        let index = idx + 1;
        if let Some(request) = flow.request() {
            rows.push(FlowRow::new(index, "Request", request));
        }
        if let Some(response) = flow.response() {
            let kind = match flow {
                CorrelatedFlow::Unsolicited { .. } => "Unsolicited",
                _ => "Response",
            };
            rows.push(FlowRow::new(index, kind, response));
        }
    }
    let mut table = Table::new(rows);
    table.with(Style::modern());
    Some(table.to_string())
}

/// A [`DisplaySink`] writing tables to any writer, stdout in production.
pub struct TableDisplay<W> {
    out: W,
}

impl<W> fmt::Debug for TableDisplay<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableDisplay").finish_non_exhaustive()
    }
}

impl<W> TableDisplay<W>
where
    W: Write + Send,
{
    /// Create a display writing to `out`.
    pub fn new(out: W) -> Self {
        Self { out }
    }

    /// Consume the display, returning the writer.
    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W> DisplaySink for TableDisplay<W>
where
    W: Write + Send,
{
    fn render(&mut self, batch: &Batch) {
        let Some(table) = render_table(batch) else {
            return;
        };
        let paired = batch.flows.iter().filter(|f| f.is_paired()).count();
        let octets: u64 = batch.flows.iter().map(CorrelatedFlow::total_octets).sum();
        let res = writeln!(
            self.out,
            "{} flows from {} (sequence {})\n{table}\n{paired} paired, {octets} bytes",
            batch.flows.len(),
            batch.exporter,
            batch.header.flow_sequence
        )
        .and_then(|()| self.out.flush());
        if let Err(e) = res {
            warn!("failed to write flow table: {e}");
        }
    }
}
