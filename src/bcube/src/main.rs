use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal;

use anyhow::{bail, Context, Result};
use structopt::StructOpt;

use bcube::config::{self, Backend, Config};
use bcube::tensor::DataType;
use bcube::transport::fabric::{FabricTransporter, SocketFabric};
use bcube::transport::tcp::TcpTransporter;
use bcube::transport::Transporter;
use bcube::Communicator;

use chrono::Timelike;
use env_logger::fmt::Color;
use std::io::Write;

#[derive(Debug, Clone, StructOpt)]
#[structopt(name = "BCube all-reduce node")]
struct Opts {
    /// Config path
    #[structopt(short, long, default_value = "bcube.toml")]
    config: PathBuf,
    /// Local rank, overrides BCUBE_RANK
    #[structopt(short, long)]
    rank: Option<usize>,
    /// Number of all-reduce rounds to run
    #[structopt(long, default_value = "1")]
    rounds: usize,
    /// Number of f32 elements in the test tensor
    #[structopt(long, default_value = "1048576")]
    elements: usize,
}

static TERMINATE: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigint(sig: i32) {
    assert_eq!(sig, signal::SIGINT as i32);
    TERMINATE.store(true, Ordering::Relaxed);
}

fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            let time = chrono::Local::now();
            let style = buf
                .style()
                .set_color(Color::Black)
                .set_intense(true)
                .clone();
            let time = format!(
                "{:02}:{:02}:{:02}.{:03}",
                time.hour() % 24,
                time.minute(),
                time.second(),
                time.timestamp_subsec_millis()
            );
            writeln!(
                buf,
                "{}{} {} {}{} {}",
                style.value("["),
                time,
                buf.default_styled_level(record.level()),
                record.module_path().unwrap_or(""),
                style.value("]"),
                record.args()
            )
        })
        .init();
}

// rank r contributes r + 1 to every element
fn fill(rank: usize, elements: usize) -> Vec<u8> {
    let value = (rank + 1) as f32;
    (0..elements).flat_map(|_| value.to_le_bytes()).collect()
}

fn verify(buf: &[u8], node_count: usize) -> Result<()> {
    let expected = (node_count * (node_count + 1) / 2) as f32;
    for (i, chunk) in buf.chunks_exact(4).enumerate() {
        let value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        if value != expected {
            bail!("element {} is {}, expected {}", i, value, expected);
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    better_panic::install();
    let opts = Opts::from_args();
    init_logger();
    let config = if opts.config.exists() {
        Config::from_path(&opts.config)
            .with_context(|| format!("loading {}", opts.config.display()))?
    } else {
        log::warn!("{} not found, using defaults", opts.config.display());
        Config::default()
    };
    let rank = match opts.rank {
        Some(rank) => rank,
        None => config::rank_from_env()?,
    };

    // process Ctrl-C event
    let sig_action = signal::SigAction::new(
        signal::SigHandler::Handler(handle_sigint),
        signal::SaFlags::empty(),
        signal::SigSet::empty(),
    );
    unsafe { signal::sigaction(signal::SIGINT, &sig_action) }
        .context("failed to register sighandler")?;

    match config.backend {
        Backend::Tcp => run(&opts, &config, rank, TcpTransporter::new(config.tcp.clone())),
        Backend::Fabric => run(
            &opts,
            &config,
            rank,
            FabricTransporter::new(SocketFabric::new(), config.fabric.clone()),
        ),
    }
}

fn run<X: Transporter>(opts: &Opts, config: &Config, rank: usize, transporter: X) -> Result<()> {
    let comm = Communicator::init(config, rank, transporter)?;
    log::info!("Started BCube node {} over {:?}", rank, config.backend);

    let node_count = comm.topology().node_count;
    for round in 0..opts.rounds {
        if TERMINATE.load(Ordering::Relaxed) {
            log::info!("Interrupted after {} rounds", round);
            break;
        }
        let mut buf = fill(rank, opts.elements);
        let start = std::time::Instant::now();
        comm.all_reduce(&format!("bench{}", round), DataType::F32, &mut buf)?;
        verify(&buf, node_count)?;
        log::info!(
            "Round {} reduced {} bytes in {:?}",
            round,
            buf.len(),
            start.elapsed()
        );
    }
    Ok(())
}
