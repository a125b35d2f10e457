// src/sim/harness.rs - millcore-sim: run a G-code program through the core in simulated time
use clap::{Parser, Subcommand};
use millcore::{DDA_FREQUENCY_HZ, MachineConfig, Simulator, load_config};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "millcore-sim", about = "Run G-code through the motion core against simulated hardware.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a program and print every response as JSON
    Run {
        /// G-code program
        file: PathBuf,

        /// Machine description (TOML); built-in defaults when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Write a CSV step trace (tick, motor, position, block sequence)
        #[arg(long)]
        trace: Option<PathBuf>,

        #[arg(long, default_value = "info")]
        log_level: tracing::Level,

        /// Give up after this much simulated time, seconds
        #[arg(long, default_value_t = 3600.0)]
        max_seconds: f64,
    },
}

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run { file, config, trace, log_level, max_seconds } => {
            tracing_subscriber::fmt()
                .with_max_level(log_level)
                .with_writer(std::io::stderr)
                .init();
            run(file, config, trace, max_seconds).await
        }
    }
}

async fn run(file: PathBuf, config: Option<PathBuf>, trace: Option<PathBuf>, max_seconds: f64) -> Result<(), BoxError> {
    let config = match config {
        Some(path) => {
            tracing::info!("Loading machine from {}", path.display());
            load_config(&path.to_string_lossy())?
        }
        None => MachineConfig::default(),
    };
    let program = tokio::fs::read_to_string(&file).await.map_err(|e| {
        tracing::error!("Cannot read {}: {}", file.display(), e);
        e
    })?;
    tracing::info!("Running {} ({} lines)", file.display(), program.lines().count());

    let record = trace.is_some();
    let max_ticks = (max_seconds * f64::from(DDA_FREQUENCY_HZ)) as u64;
    let (sim, finished) = tokio::task::spawn_blocking(move || {
        let mut sim = Simulator::new(config);
        sim.pins_mut().set_recording(record);
        sim.send(&program);
        let finished = sim.run_until_idle(max_ticks);
        (sim, finished)
    })
    .await?;

    for response in sim.responses() {
        println!("{}", serde_json::to_string(response)?);
    }
    if let Some(path) = trace {
        let mut writer = csv::Writer::from_path(&path)?;
        for record in sim.pins().log() {
            writer.serialize(record)?;
        }
        writer.flush()?;
        tracing::info!("Wrote {} steps to {}", sim.pins().log().len(), path.display());
    }

    let report = sim.controller().status_report();
    tracing::info!(
        "Finished after {:.3} s simulated: position {:?}, mode {:?}",
        sim.seconds(),
        report.machine,
        report.mode
    );
    if !finished {
        return Err(format!("program still running after {max_seconds} s of simulated time").into());
    }
    Ok(())
}
