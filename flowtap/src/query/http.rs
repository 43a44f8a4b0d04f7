//! HTTP access to stored flows.
//!
//! Serves `GET /flows` as a JSON array of [`StoredFlow`]s. Optional query
//! parameters:
//!
//! * `start`, `end`: RFC 3339 timestamps bounding the flow start time,
//!   `start` inclusive and `end` exclusive
//! * `src_ip`, `dst_ip`: exact IPv4 addresses
//! * `port`: matches either port
//! * `protocol`: IP protocol number
//! * `limit`: maximum number of flows returned
//!
//! ## Metrics
//!
//! `requests_received`: Total HTTP requests received
//! `connection.current`: Connections being served
//! `connection.limit`: Configured connection limit
//!

use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};

use bytes::Bytes;
use http::{Method, StatusCode, header};
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::{Request, Response, service::Service};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tokio::{
    net::TcpListener,
    sync::{Semaphore, TryAcquireError},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{QueryFilter, QuerySink, StoredFlow, TimeRange, parse_rfc3339_millis};

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Server`]
pub enum Error {
    /// Error binding the listener
    #[error("Failed to bind query server to {addr}: {source}")]
    Bind {
        /// Binding address
        addr: SocketAddr,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// Wrapper for [`std::io::Error`].
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

fn default_concurrent_requests_max() -> usize {
    100
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
/// Configuration for [`Server`]
pub struct Config {
    /// address -- IP plus port -- to bind to
    pub binding_addr: SocketAddr,
    /// number of concurrent HTTP connections to allow
    #[serde(default = "default_concurrent_requests_max")]
    pub concurrent_requests_max: usize,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
struct FlowParams {
    start: Option<String>,
    end: Option<String>,
    src_ip: Option<Ipv4Addr>,
    dst_ip: Option<Ipv4Addr>,
    port: Option<u16>,
    protocol: Option<u8>,
    limit: Option<usize>,
}

/// Parse the query string of a `/flows` request.
///
/// # Errors
///
/// Returns [`super::Error::Invalid`] for unknown parameters, malformed values
/// or an inverted time window.
pub fn parse_params(query: Option<&str>) -> Result<(TimeRange, QueryFilter), super::Error> {
    let params: FlowParams = match query {
        None | Some("") => FlowParams::default(),
        Some(q) => serde_qs::from_str(q).map_err(|e| super::Error::Invalid(e.to_string()))?,
    };
    let range = TimeRange {
        start: params.start.as_deref().map(parse_rfc3339_millis).transpose()?,
        end: params.end.as_deref().map(parse_rfc3339_millis).transpose()?,
    };
    range.validate()?;
    let filter = QueryFilter {
        src_ip: params.src_ip,
        dst_ip: params.dst_ip,
        port: params.port,
        protocol: params.protocol,
        limit: params.limit,
    };
    Ok((range, filter))
}

fn full<T>(chunk: T) -> BoxBody<Bytes, hyper::Error>
where
    T: Into<Bytes>,
{
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

fn build_response(
    status: StatusCode,
    content_type: &str,
    body: impl Into<Bytes>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut resp = Response::new(full(body));
    *resp.status_mut() = status;
    if let Ok(value) = header::HeaderValue::from_str(content_type) {
        resp.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    resp
}

async fn srv(
    req: Request<hyper::body::Incoming>,
    store: Arc<dyn QuerySink>,
    metric_labels: Arc<Vec<(String, String)>>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    counter!("requests_received", &*metric_labels).increment(1);

    if req.uri().path() != "/flows" {
        return Ok(build_response(
            StatusCode::NOT_FOUND,
            "text/plain",
            "not found",
        ));
    }
    if req.method() != Method::GET {
        let mut resp = build_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "text/plain",
            "method not allowed",
        );
        resp.headers_mut()
            .insert(header::ALLOW, header::HeaderValue::from_static("GET"));
        return Ok(resp);
    }

    let (range, filter) = match parse_params(req.uri().query()) {
        Ok(p) => p,
        Err(e) => {
            debug!("rejecting query: {e}");
            return Ok(build_response(
                StatusCode::BAD_REQUEST,
                "text/plain",
                e.to_string(),
            ));
        }
    };

    let flows: Vec<StoredFlow> = match store.query(range, &filter).await {
        Ok(flows) => flows,
        Err(e @ super::Error::Invalid(_)) => {
            return Ok(build_response(
                StatusCode::BAD_REQUEST,
                "text/plain",
                e.to_string(),
            ));
        }
        Err(e @ super::Error::Unavailable(_)) => {
            warn!("flow query failed: {e}");
            return Ok(build_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain",
                e.to_string(),
            ));
        }
    };

    match serde_json::to_vec(&flows) {
        Ok(body) => Ok(build_response(StatusCode::OK, "application/json", body)),
        Err(e) => {
            error!("failed to encode flows: {e}");
            Ok(build_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain",
                "failed to encode flows",
            ))
        }
    }
}

/// The flow query HTTP server.
pub struct Server {
    listener: TcpListener,
    concurrency_limit: usize,
    store: Arc<dyn QuerySink>,
    metric_labels: Arc<Vec<(String, String)>>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("listener", &self.listener)
            .field("concurrency_limit", &self.concurrency_limit)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Bind a new [`Server`] answering from `store`.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn bind(config: &Config, store: Arc<dyn QuerySink>) -> Result<Self, Error> {
        let listener = TcpListener::bind(config.binding_addr)
            .await
            .map_err(|source| Error::Bind {
                addr: config.binding_addr,
                source: Box::new(source),
            })?;
        let metric_labels = vec![
            ("component".to_string(), "query".to_string()),
            ("component_name".to_string(), "http".to_string()),
        ];
        Ok(Self {
            listener,
            concurrency_limit: config.concurrent_requests_max,
            store,
            metric_labels: Arc::new(metric_labels),
        })
    }

    /// The address the server is listening on.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.listener.local_addr()?)
    }

    /// Run [`Server`] until `shutdown` is cancelled, then finish serving open
    /// connections.
    ///
    /// # Errors
    ///
    /// None are known.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), Error> {
        let store = self.store;
        let labels = Arc::clone(&self.metric_labels);
        run_httpd(
            self.listener,
            self.concurrency_limit,
            shutdown,
            (*self.metric_labels).clone(),
            move || {
                let store = Arc::clone(&store);
                let labels = Arc::clone(&labels);
                hyper::service::service_fn(move |req| {
                    srv(req, Arc::clone(&store), Arc::clone(&labels))
                })
            },
        )
        .await;
        Ok(())
    }
}

#[allow(clippy::cast_precision_loss)]
async fn run_httpd<SF, S>(
    listener: TcpListener,
    concurrency_limit: usize,
    shutdown: CancellationToken,
    labels: Vec<(String, String)>,
    make_service: SF,
) where
    SF: Send + Sync + 'static + Clone + Fn() -> S,
    S: Service<
            Request<hyper::body::Incoming>,
            Response = Response<BoxBody<Bytes, hyper::Error>>,
            Error = hyper::Error,
        > + Send
        + 'static,
    S::Future: Send + 'static,
{
    let sem = Arc::new(Semaphore::new(concurrency_limit));
    let mut join_set = JoinSet::new();

    gauge!("connection.limit", &labels).set(concurrency_limit as f64);

    let shutdown_wait = shutdown.cancelled();
    tokio::pin!(shutdown_wait);
    loop {
        let claimed_permits = concurrency_limit - sem.available_permits();
        gauge!("connection.current", &labels).set(claimed_permits as f64);

        tokio::select! {
            () = &mut shutdown_wait => {
                info!("shutdown signal received, stopping query server");
                break;
            }

            incoming = listener.accept() => {
                let (stream, addr) = match incoming {
                    Ok(sa) => sa,
                    Err(e) => {
                        error!("Error accepting connection: {e}");
                        continue;
                    }
                };
                debug!("Accepted connection from {addr}");

                let permit = match Arc::clone(&sem).try_acquire_owned() {
                    Ok(p) => p,
                    Err(TryAcquireError::Closed) => {
                        error!("Semaphore closed");
                        break;
                    }
                    Err(TryAcquireError::NoPermits) => {
                        warn!("query server over connection capacity, load shedding");
                        drop(stream);
                        continue;
                    }
                };
                let service = make_service();
                let shutdown = shutdown.clone();

                join_set.spawn(async move {
                    let builder = auto::Builder::new(TokioExecutor::new());
                    let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
                    tokio::pin!(conn);

                    let mut closing = false;
                    loop {
                        tokio::select! {
                            res = conn.as_mut() => {
                                if let Err(e) = res {
                                    error!("Error serving {addr}: {e}");
                                }
                                break;
                            }
                            () = shutdown.cancelled(), if !closing => {
                                conn.as_mut().graceful_shutdown();
                                closing = true;
                            }
                        }
                    }
                    drop(permit);
                });
            }
        }
    }

    drop(listener);
    while join_set.join_next().await.is_some() {}
}
