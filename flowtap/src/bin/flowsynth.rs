//! Send synthetic NetFlow v5 traffic to a collector.

use std::{
    fs, io,
    net::SocketAddr,
    num::NonZeroU32,
    path::PathBuf,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use clap::Parser;
use flowtap_wire::synth::{self, Generator};
use rand::{SeedableRng, rngs::SmallRng};
use tokio::{net::UdpSocket, runtime::Builder, signal, time};
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("Failed to read generator config {path:?}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: Box<io::Error>,
    },
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Synth(#[from] synth::Error),
}

#[derive(Parser)]
#[clap(version, about = "Send synthetic NetFlow v5 request/response packets", long_about = None)]
struct Cli {
    /// collector address to send packets to
    #[clap(long, default_value = "127.0.0.1:2055")]
    target: SocketAddr,
    /// packets sent per second
    #[clap(long, default_value_t = NonZeroU32::MIN)]
    packets_per_second: NonZeroU32,
    /// stop after this many packets, run until ctrl-c when absent
    #[clap(long)]
    count: Option<u64>,
    /// seed for the random generator, derived from the clock when absent
    #[clap(long)]
    seed: Option<u64>,
    /// path on disk to a YAML generator configuration
    #[clap(long)]
    config_path: Option<PathBuf>,
}

fn load_generator_config(path: Option<&PathBuf>) -> Result<synth::Config, Error> {
    let Some(path) = path else {
        return Ok(synth::Config::default());
    };
    let contents = fs::read_to_string(path).map_err(|source| Error::ReadFile {
        path: path.clone(),
        source: Box::new(source),
    })?;
    Ok(serde_yaml::from_str(&contents)?)
}

#[allow(clippy::cast_possible_truncation)]
fn clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64)
}

async fn inner_main(cli: Cli, config: synth::Config) -> Result<(), Error> {
    let seed = cli.seed.unwrap_or_else(clock_seed);
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut generator = Generator::new(config, &mut rng)?;

    let bind_addr: SocketAddr = if cli.target.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    info!(
        "Sending {} packets per second to {} with seed {seed}",
        cli.packets_per_second, cli.target
    );

    let period = Duration::from_secs(1) / cli.packets_per_second.get();
    let mut ticker = time::interval(period);
    let mut sent: u64 = 0;
    let mut buf = Vec::with_capacity(
        flowtap_wire::HEADER_LEN + flowtap_wire::MAX_RECORDS_PER_PACKET * flowtap_wire::RECORD_LEN,
    );

    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        if cli.count.is_some_and(|count| sent >= count) {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {
                let packet = generator.next_packet(&mut rng);
                buf.clear();
                packet.encode(&mut buf);
                match socket.send_to(&buf, cli.target).await {
                    Ok(n) => debug!("sent {n} bytes, {} records", packet.records.len()),
                    Err(e) => error!("Failed to send to {}: {e}", cli.target),
                }
                sent += 1;
            }
            res = &mut shutdown => {
                if let Err(e) = res {
                    error!("Failed to listen for ctrl-c: {e}");
                }
                break;
            }
        }
    }

    info!("Sent {sent} packets");
    Ok(())
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .finish()
        .init();

    let cli = Cli::parse();
    let config = load_generator_config(cli.config_path.as_ref())?;

    let runtime = Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()?;
    runtime.block_on(inner_main(cli, config))
}
