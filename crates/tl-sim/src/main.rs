//! Tideline transport simulator
//!
//! Runs the transport against a fake audio backend: a fixed number of
//! process cycles with no routes, printing every notification.
//!
//! Usage:
//!   tl-sim --roll --cycles 400
//!   tl-sim --loop 48000 96000 --cycles 2000
//!   tl-sim --locate 480000 --roll --speed 1.5
//!   tl-sim --config transport.json --print-config

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tl_core::SamplePosition;
use tl_engine::{
    LocateTransportDisposition, NoRoutes, RequestSource, TransportConfig, TransportEngine,
    TransportNotification, TransportSession,
};

const ORIGIN: RequestSource = RequestSource::Ui;

#[derive(Parser)]
#[command(name = "tl-sim", about = "Drive the transport with simulated audio cycles")]
struct Cli {
    /// Transport config (JSON); defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of process cycles to run
    #[arg(short = 'n', long, default_value_t = 200)]
    cycles: u32,

    /// Frames per cycle (defaults to the config's block size)
    #[arg(short, long)]
    block: Option<u32>,

    /// Start rolling
    #[arg(short, long)]
    roll: bool,

    /// Locate here before anything else (samples)
    #[arg(short, long)]
    locate: Option<u64>,

    /// Loop between two sample positions
    #[arg(long = "loop", num_args = 2, value_names = ["START", "END"])]
    loop_range: Option<Vec<u64>>,

    /// Varispeed
    #[arg(short, long)]
    speed: Option<f64>,

    /// Stop after this many cycles
    #[arg(long)]
    stop_after: Option<u32>,

    /// Print the effective config as JSON and exit
    #[arg(long)]
    print_config: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => TransportConfig::load_from(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => TransportConfig::default(),
    };

    if cli.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let block = cli.block.unwrap_or(config.block_size);
    if block == 0 {
        bail!("Block size must be non-zero");
    }

    let mut session = TransportEngine::builder(config)
        .build()
        .context("Failed to build transport")?;
    queue_requests(&cli, &session)?;

    for cycle in 0..cli.cycles {
        if cli.stop_after == Some(cycle) {
            session
                .transport
                .request_stop(false, false, ORIGIN)
                .context("Stop refused")?;
        }

        let report = session.process.process(block, &mut NoRoutes);
        if !session.butler.wait_idle(Duration::from_millis(500)) {
            log::warn!(
                "Cycle {}: butler still busy with {:?}",
                cycle,
                session.transport.post_transport_work()
            );
        }
        log::debug!("Cycle {}: {:?}", cycle, report);

        session.notifications.drain(|note| print_notification(cycle, &note));
    }

    let transport = &session.transport;
    println!(
        "Final: {:?} at {} ({}), speed {:.3}, {} xruns",
        transport.transport_state(),
        transport.transport_sample(),
        transport.position_bbt(),
        transport.transport_speed(),
        transport.xrun_count()
    );
    Ok(())
}

fn queue_requests(cli: &Cli, session: &TransportSession) -> Result<()> {
    let transport = &session.transport;

    if let Some(target) = cli.locate {
        transport
            .request_locate(
                SamplePosition(target),
                false,
                LocateTransportDisposition::MustStop,
                ORIGIN,
            )
            .context("Locate refused")?;
    }

    if let Some(range) = &cli.loop_range {
        let [start, end] = range.as_slice() else {
            bail!("--loop takes exactly two positions");
        };
        transport
            .set_loop_range(SamplePosition(*start), SamplePosition(*end))
            .context("Invalid loop range")?;
        transport
            .request_play_loop(true, false, ORIGIN)
            .context("Loop refused")?;
    }

    if let Some(speed) = cli.speed {
        transport
            .request_transport_speed(speed, ORIGIN)
            .context("Speed refused")?;
    }

    if cli.roll {
        transport.request_roll(ORIGIN).context("Roll refused")?;
    }
    Ok(())
}

fn print_notification(cycle: u32, note: &TransportNotification) {
    match note {
        TransportNotification::PositionChanged(_) | TransportNotification::SpeedChanged(_) => {
            log::debug!("[{:>5}] {:?}", cycle, note)
        }
        _ => println!("[{:>5}] {:?}", cycle, note),
    }
}
