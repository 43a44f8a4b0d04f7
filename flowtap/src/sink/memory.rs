//! A bounded in-process flow store.
//!
//! Keeps the most recent `capacity` records, evicting the oldest on overflow.
//! Serves both as a [`StorageSink`] and as the [`QuerySink`] behind the HTTP
//! query endpoint when no external database is configured.

use std::{collections::VecDeque, sync::Mutex};

use async_trait::async_trait;
use flowtap_wire::{Header, Record};
use tracing::debug;

use super::{SinkError, StorageSink};
use crate::query::{self, QueryFilter, QuerySink, StoredFlow, TimeRange};

/// Bounded ring of [`StoredFlow`]s.
#[derive(Debug)]
pub struct MemoryStore {
    capacity: usize,
    flows: Mutex<VecDeque<StoredFlow>>,
}

impl MemoryStore {
    /// Create a store retaining at most `capacity` flows.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            flows: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
        }
    }

    /// Insert a flow, evicting the oldest when full.
    pub fn insert(&self, flow: StoredFlow) {
        if self.capacity == 0 {
            return;
        }
        let mut flows = self.flows.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        while flows.len() >= self.capacity {
            flows.pop_front();
        }
        flows.push_back(flow);
    }

    /// Number of flows held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.flows
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StorageSink for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn write(&self, header: &Header, record: &Record) -> Result<(), SinkError> {
        match StoredFlow::new(header, record) {
            Some(flow) => self.insert(flow),
            None => debug!("flow time out of range, not stored"),
        }
        Ok(())
    }
}

#[async_trait]
impl QuerySink for MemoryStore {
    async fn query(
        &self,
        range: TimeRange,
        filter: &QueryFilter,
    ) -> Result<Vec<StoredFlow>, query::Error> {
        range.validate()?;
        let mut hits: Vec<StoredFlow> = {
            let flows = self
                .flows
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            flows
                .iter()
                .filter(|f| range.contains(f.start_millis()) && filter.matches(f))
                .copied()
                .collect()
        };
        hits.sort_by_key(|f| f.start_time);
        if let Some(limit) = filter.limit {
            hits.truncate(limit);
        }
        Ok(hits)
    }
}
