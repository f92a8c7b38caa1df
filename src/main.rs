//! CLI entry point for acq-chain
//!
//! Runs a simulated step scan (`motor → timer → counters`) through the
//! acquisition engine and prints the data as it is published.
//!
//! # Usage
//!
//! ```bash
//! acq-chain run --points 20
//! acq-chain --config my_settings.toml tree
//! ACQ_CHAIN_CHAIN__PARALLEL_PREPARE=true acq-chain config
//! RUST_LOG=acq_chain=debug acq-chain run
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::oneshot;

use acq_chain::channel::{Payload, Values};
use acq_chain::config::{Settings, DEFAULT_CONFIG_PATH};
use acq_chain::{logging, sim, AcqEvent, Scan};

#[derive(Parser)]
#[command(name = "acq-chain")]
#[command(about = "Acquisition chain engine driving a simulated step scan", long_about = None)]
struct Cli {
    /// Settings file (TOML)
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the simulated scan and print every published value
    Run {
        /// Number of points (overrides simulation.npoints)
        #[arg(long)]
        points: Option<usize>,
    },

    /// Print the simulated acquisition chain
    Tree,

    /// Print the effective settings (file merged with environment)
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Commands::Run {
        points: Some(points),
    } = cli.command
    {
        settings.simulation.npoints = points;
    }
    settings.validate()?;
    logging::init_from_settings(&settings)?;

    match cli.command {
        Commands::Run { .. } => run_scan(&settings).await,
        Commands::Tree => {
            let scan = sim::step_scan(&settings.simulation, &settings.chain)?;
            print!("{}", scan.chain);
            Ok(())
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&settings)?);
            Ok(())
        }
    }
}

async fn run_scan(settings: &Settings) -> Result<()> {
    let step = sim::step_scan(&settings.simulation, &settings.chain)?;
    let mut events = step.chain.subscribe();
    let stats = step.chain.stats();

    let (done_tx, mut done_rx) = oneshot::channel::<()>();

    // drivers keep their channels, so the bus never closes on its own
    let printer = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                event = events.recv() => match event {
                    Ok(AcqEvent::NewData {
                        object,
                        channel,
                        data,
                    }) => println!("{:>12} {:>16}  {}", object, channel, format_payload(&data)),
                    Ok(other) => tracing::debug!(event = other.kind(), object = other.object(), "event"),
                    Err(RecvError::Lagged(missed)) => tracing::warn!(missed, "event printer lagging"),
                    Err(RecvError::Closed) => break,
                },
                _ = &mut done_rx => break,
            }
        }
    });

    println!("{}", step.chain);
    let mut scan = Scan::new(step.chain);
    let result = scan.run().await;
    let _ = done_tx.send(());
    printer.await?;

    println!();
    println!("{:<24} {:>6} {:>12} {:>12}", "call", "count", "total ms", "max ms");
    for entry in stats.summary() {
        println!(
            "{:<24} {:>6} {:>12.3} {:>12.3}",
            entry.key,
            entry.count,
            entry.total.as_secs_f64() * 1e3,
            entry.max.as_secs_f64() * 1e3
        );
    }

    result?;
    println!();
    println!("scan done: {} points", step.motor.positions().len());
    Ok(())
}

fn format_payload(payload: &Payload) -> String {
    match payload {
        Payload::Array(array) => match array.values() {
            Values::Float(values) => values
                .iter()
                .map(|v| format!("{:.4}", v))
                .collect::<Vec<_>>()
                .join(" "),
            Values::Int(values) => values
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(" "),
        },
        Payload::Reference(value) => value.to_string(),
    }
}
