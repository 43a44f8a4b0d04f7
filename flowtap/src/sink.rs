//! Consumers of correlated flows.
//!
//! The ingest loop produces one [`Batch`] per datagram and hands it to a
//! [`Dispatcher`]. Dispatch never blocks the loop:
//!
//! * every [`DisplaySink`] is served by its own task through a bounded queue,
//!   a full queue sheds the batch;
//! * every decoded record is written to every [`StorageSink`] in its own task,
//!   bounded by a shared semaphore, a missing permit sheds the write.
//!
//! ## Metrics
//!
//! `storage_writes`: Records written successfully
//! `storage_failures`: Records a storage sink failed to write
//! `sink_shed`: Batches or writes dropped because a sink was saturated
//!

use std::{fmt, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use flowtap_wire::{Header, Record};
use metrics::counter;
use tokio::{
    sync::{Semaphore, TryAcquireError, mpsc},
    task::{JoinHandle, JoinSet},
};
use tracing::{debug, error, info, warn};

use crate::correlate::CorrelatedFlow;

pub mod display;
pub mod influx;
pub mod memory;

/// Everything the collector learned from one datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Header of the datagram
    pub header: Header,
    /// Address the datagram came from
    pub exporter: SocketAddr,
    /// Correlated conversations, requests first
    pub flows: Vec<CorrelatedFlow>,
    /// Every decoded record in wire order, watched or not
    pub records: Vec<Record>,
    /// Set when the datagram declared more records than it carried
    pub truncation: Option<flowtap_wire::Error>,
}

/// Errors produced by storage sinks.
#[derive(thiserror::Error, Debug)]
pub enum SinkError {
    /// The HTTP request could not be completed.
    #[error("request to {url} failed: {source}")]
    Request {
        /// Endpoint that was called
        url: String,
        /// Underlying client error
        #[source]
        source: Box<reqwest::Error>,
    },
    /// The remote end answered with a non-success status.
    #[error("{url} rejected write with status {status}: {body}")]
    Rejected {
        /// Endpoint that was called
        url: String,
        /// HTTP status code
        status: u16,
        /// Response body, possibly empty
        body: String,
    },
}

/// Persistent storage for individual flow records.
#[async_trait]
pub trait StorageSink: fmt::Debug + Send + Sync {
    /// Short name used in logs and metric labels.
    fn name(&self) -> &'static str;

    /// Persist one record together with the header it arrived under.
    ///
    /// # Errors
    ///
    /// Returns an error if the record could not be stored. The dispatcher
    /// logs and counts failures; nothing is retried.
    async fn write(&self, header: &Header, record: &Record) -> Result<(), SinkError>;
}

/// A synchronous, side-effect only consumer of whole batches.
pub trait DisplaySink: Send {
    /// Render `batch`.
    fn render(&mut self, batch: &Batch);
}

/// What happened to one batch handed to [`Dispatcher::dispatch`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dispatched {
    /// Display queues that accepted the batch
    pub displayed: usize,
    /// Storage writes started
    pub stored: usize,
    /// Display batches and storage writes dropped
    pub shed: usize,
}

#[derive(Debug)]
struct DisplayQueue {
    name: String,
    tx: mpsc::Sender<Arc<Batch>>,
    task: JoinHandle<()>,
}

/// Fans batches out to the registered sinks.
pub struct Dispatcher {
    displays: Vec<DisplayQueue>,
    storage: Vec<Arc<dyn StorageSink>>,
    permits: Arc<Semaphore>,
    in_flight: JoinSet<()>,
    metric_labels: Arc<Vec<(String, String)>>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("displays", &self.displays)
            .field("storage", &self.storage)
            .field("available_permits", &self.permits.available_permits())
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Create a dispatcher that allows at most `storage_concurrency`
    /// storage writes in flight.
    #[must_use]
    pub fn new(storage_concurrency: usize, metric_labels: Vec<(String, String)>) -> Self {
        Self {
            displays: Vec::new(),
            storage: Vec::new(),
            permits: Arc::new(Semaphore::new(storage_concurrency)),
            in_flight: JoinSet::new(),
            metric_labels: Arc::new(metric_labels),
        }
    }

    /// Register a display sink served by its own task through a queue of
    /// `queue_depth` batches.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime, or if `queue_depth` is
    /// zero.
    pub fn add_display<S>(&mut self, name: impl Into<String>, mut sink: S, queue_depth: usize)
    where
        S: DisplaySink + 'static,
    {
        let name = name.into();
        let (tx, mut rx) = mpsc::channel::<Arc<Batch>>(queue_depth);
        let task_name = name.clone();
        let task = tokio::spawn(async move {
            while let Some(batch) = rx.recv().await {
                sink.render(&batch);
            }
            debug!("display sink {task_name} drained");
        });
        self.displays.push(DisplayQueue { name, tx, task });
    }

    /// Register a storage sink.
    pub fn add_storage(&mut self, sink: Arc<dyn StorageSink>) {
        self.storage.push(sink);
    }

    /// Hand `batch` to every sink without waiting on any of them.
    pub fn dispatch(&mut self, batch: &Arc<Batch>) -> Dispatched {
        self.reap();
        let mut outcome = Dispatched::default();

        for queue in &self.displays {
            match queue.tx.try_send(Arc::clone(batch)) {
                Ok(()) => outcome.displayed += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("display sink {} is behind, shedding batch", queue.name);
                    counter!("sink_shed", &*self.metric_labels).increment(1);
                    outcome.shed += 1;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    error!("display sink {} has stopped", queue.name);
                    outcome.shed += 1;
                }
            }
        }

        let header = batch.header;
        for record in &batch.records {
            for sink in &self.storage {
                let permit = match Arc::clone(&self.permits).try_acquire_owned() {
                    Ok(p) => p,
                    Err(TryAcquireError::NoPermits) => {
                        warn!("storage over capacity, shedding write to {}", sink.name());
                        counter!("sink_shed", &*self.metric_labels).increment(1);
                        outcome.shed += 1;
                        continue;
                    }
                    Err(TryAcquireError::Closed) => {
                        error!("storage semaphore closed");
                        return outcome;
                    }
                };

                let sink = Arc::clone(sink);
                let record = *record;
                let labels = Arc::clone(&self.metric_labels);
                self.in_flight.spawn(async move {
                    match sink.write(&header, &record).await {
                        Ok(()) => counter!("storage_writes", &*labels).increment(1),
                        Err(e) => {
                            warn!("storage sink {} failed: {e}", sink.name());
                            counter!("storage_failures", &*labels).increment(1);
                        }
                    }
                    drop(permit);
                });
                outcome.stored += 1;
            }
        }

        outcome
    }

    /// Storage writes currently running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn reap(&mut self) {
        while let Some(res) = self.in_flight.try_join_next() {
            if let Err(e) = res {
                error!("storage task failed: {e}");
            }
        }
    }

    /// Stop accepting work and wait for queued displays and in-flight writes
    /// to finish.
    pub async fn drain(mut self) {
        info!(
            "draining {} storage writes and {} display queues",
            self.in_flight.len(),
            self.displays.len()
        );
        while let Some(res) = self.in_flight.join_next().await {
            if let Err(e) = res {
                error!("storage task failed: {e}");
            }
        }
        for DisplayQueue { name, tx, task } in self.displays {
            drop(tx);
            if let Err(e) = task.await {
                error!("display sink {name} failed: {e}");
            }
        }
    }
}
