//! Metric export.
//!
//! Counters are recorded with the `metrics` facade throughout the crate. When
//! a Prometheus address is configured they are exposed there over HTTP,
//! otherwise they are discarded.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use tracing::info;

use crate::config::Telemetry;

/// Errors produced by [`install`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The Prometheus recorder could not be installed.
    #[error("Failed to install prometheus recorder: {0}")]
    Install(#[from] BuildError),
}

/// Install the Prometheus recorder if `config` asks for one. Returns whether
/// a recorder was installed.
///
/// Must be called from within a tokio runtime, the exporter spawns its HTTP
/// listener onto it.
///
/// # Errors
///
/// Returns an error if the listener cannot be set up or a recorder is already
/// installed.
pub fn install(config: &Telemetry) -> Result<bool, Error> {
    let Some(addr) = config.prometheus_addr else {
        return Ok(false);
    };
    let mut builder = PrometheusBuilder::new().with_http_listener(addr);
    for (k, v) in &config.global_labels {
        builder = builder.add_global_label(k, v);
    }
    builder.install()?;
    info!("Prometheus metrics exposed on {addr}");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nothing_installed_without_address() {
        let installed = install(&Telemetry::default()).expect("no-op");
        assert!(!installed);
    }
}
