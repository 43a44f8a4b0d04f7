use std::{env, io, path::PathBuf, process, sync::Arc, time::Duration};

use clap::{Args, Parser, Subcommand};
use flowtap::{
    config::{self, Config},
    ingest::{self, Ingest},
    query,
    sink::{Dispatcher, display::TableDisplay, influx::InfluxSink, memory::MemoryStore},
    telemetry,
};
use tokio::{runtime::Builder, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("Invalid configuration: {0}")]
    Config(#[from] config::Error),
    #[error("Ingest failed: {0}")]
    Ingest(#[from] ingest::Error),
    #[error("Query server failed: {0}")]
    Query(#[from] query::http::Error),
    #[error(transparent)]
    Telemetry(#[from] telemetry::Error),
    #[error("Query server task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

fn default_config_path() -> PathBuf {
    PathBuf::from("/etc/flowtap/flowtap.yaml")
}

#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the collector with specified configuration
    Run(RunCommand),
    /// Validate configuration and exit
    ConfigCheck(ConfigCheckCommand),
}

#[derive(Args)]
struct RunCommand {
    /// path on disk to the configuration file, defaults to
    /// /etc/flowtap/flowtap.yaml
    #[clap(long)]
    config_path: Option<PathBuf>,
    /// the maximum time to wait, in seconds, for controlled shutdown
    #[clap(long, default_value_t = 30)]
    max_shutdown_delay: u16,
}

#[derive(Args)]
struct ConfigCheckCommand {
    /// path on disk to the configuration file, defaults to
    /// /etc/flowtap/flowtap.yaml
    #[clap(long)]
    config_path: Option<PathBuf>,
}

fn load_config(config_path: Option<PathBuf>) -> Result<Config, Error> {
    let path_is_default = config_path.is_none();
    let path = config_path.unwrap_or_else(default_config_path);
    Config::load(&path, path_is_default, |key| env::var(key).ok()).map_err(|err| {
        error!("Configuration validation failed: {err}");
        Error::Config(err)
    })
}

async fn inner_main(config: Config) -> Result<(), Error> {
    telemetry::install(&config.telemetry)?;

    if config.filter.is_empty() {
        warn!("No addresses to watch, every record will be stored but none correlated");
    } else {
        info!("Watching {} address entries", config.filter.len());
    }

    let mut dispatcher = Dispatcher::new(
        config.storage.concurrent_writes_max,
        vec![("component".to_string(), "dispatch".to_string())],
    );
    if config.display.enabled {
        dispatcher.add_display(
            "table",
            TableDisplay::new(io::stdout()),
            config.display.queue_depth,
        );
    }
    if let Some(influx) = &config.storage.influxdb {
        let sink = InfluxSink::new(influx);
        info!("Writing flows to {}", sink.write_url());
        dispatcher.add_storage(Arc::new(sink));
    }
    let memory = config.storage.memory.map(|m| {
        let store = Arc::new(MemoryStore::new(m.capacity));
        dispatcher.add_storage(store.clone());
        store
    });

    let shutdown = CancellationToken::new();

    let query_server = match (config.query, memory) {
        (Some(query_config), Some(store)) => {
            let server = query::http::Server::bind(&query_config, store).await?;
            info!("Serving flow queries on {}", server.local_addr()?);
            Some(tokio::spawn(server.run(shutdown.clone())))
        }
        _ => None,
    };

    let ingest = Ingest::bind(&config, dispatcher).await?;

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Received ctrl-c, shutting down");
                signal_token.cancel();
            }
            Err(e) => error!("Failed to listen for ctrl-c: {e}"),
        }
    });

    ingest.run(shutdown.clone()).await?;
    shutdown.cancel();
    if let Some(handle) = query_server {
        handle.await??;
    }
    Ok(())
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting flowtap {version}.");

    let cli = Cli::parse();
    let args = match cli.command {
        Commands::Run(run_cmd) => run_cmd,
        Commands::ConfigCheck(check_cmd) => match load_config(check_cmd.config_path) {
            Ok(_) => {
                info!("Configuration is valid");
                process::exit(0)
            }
            Err(_) => process::exit(1),
        },
    };

    let config = load_config(args.config_path)?;
    let max_shutdown_delay = Duration::from_secs(args.max_shutdown_delay.into());

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(inner_main(config));
    info!(
        "Shutting down runtime with a {} second delay. May leave orphaned tasks.",
        max_shutdown_delay.as_secs(),
    );
    runtime.shutdown_timeout(max_shutdown_delay);
    info!("Bye. :)");
    res
}
