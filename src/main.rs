//! Blame engine CLI.
//!
//! Usage:
//!   blame-engine autopsy --year 2024 --gp Bahrain --driver LEC
//!   blame-engine autopsy --year 2024 --gp Bahrain --driver LEC --driver SAI
//!   blame-engine simulate --year 2024 --gp Bahrain --driver LEC --alt-pit-lap 18
//!   blame-engine train --session 2023/Bahrain --session 2023/Monaco --output model.json

use anyhow::{bail, Context, Result};
use blame_engine::data::CsvLapProvider;
use blame_engine::{train, BlameEngine, EngineConfig, LapDataProvider, SessionKind};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "blame-engine", about = "Attribute race time loss to its causes")]
struct Args {
    /// Engine config (JSON). Defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Root of the CSV session tree
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Trained model artifacts
    #[arg(long, global = true)]
    model: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Blame breakdown for one or more drivers of a race
    Autopsy {
        #[arg(long)]
        year: i32,
        #[arg(long)]
        gp: String,
        /// Repeat to compare up to five drivers
        #[arg(long, required = true)]
        driver: Vec<String>,
    },
    /// Replay a race with the first stop moved
    Simulate {
        #[arg(long)]
        year: i32,
        #[arg(long)]
        gp: String,
        #[arg(long)]
        driver: String,
        #[arg(long)]
        alt_pit_lap: u32,
    },
    /// Fit the lap-time model on historical races
    Train {
        /// `<year>/<gp>`, repeatable
        #[arg(long, required = true)]
        session: Vec<String>,
        #[arg(short, long, default_value = "model_artifacts.json")]
        output: PathBuf,
    },
}

fn parse_session(raw: &str) -> Result<(i32, String)> {
    let (year, gp) = raw
        .split_once('/')
        .with_context(|| format!("session '{}' is not <year>/<gp>", raw))?;
    let year = year.trim().parse().with_context(|| format!("bad year in '{}'", raw))?;
    Ok((year, gp.trim().to_string()))
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging; RUST_LOG wins over --verbose
    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    if let Some(model) = args.model {
        config.model_path = Some(model);
    }

    match args.command {
        Command::Autopsy { year, gp, driver } => {
            let mut engine = BlameEngine::from_config(config);
            if driver.len() == 1 {
                let report = engine.autopsy(year, &gp, &driver[0])?;
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                let names: Vec<&str> = driver.iter().map(String::as_str).collect();
                let reports = engine.compare(year, &gp, &names)?;
                println!("{}", serde_json::to_string_pretty(&reports)?);
            }
        }
        Command::Simulate {
            year,
            gp,
            driver,
            alt_pit_lap,
        } => {
            let engine = BlameEngine::from_config(config);
            let result = engine.simulate(year, &gp, &driver, alt_pit_lap)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Train { session, output } => {
            let provider = CsvLapProvider::new(config.data_dir.clone());
            let mut sessions = Vec::new();
            for raw in &session {
                let (year, gp) = parse_session(raw)?;
                sessions.push(provider.get_session(year, &gp, SessionKind::Race)?);
            }
            if sessions.is_empty() {
                bail!("no sessions to train on");
            }
            let artifacts = train::train(&sessions, config.default_track_temp, config.default_driver_rank)?;
            artifacts.save(&output)?;
            let curves_path = output.with_file_name("deg_curves.json");
            artifacts.save_deg_curves(&curves_path)?;
            info!("Wrote model artifacts to {:?}, degradation curves to {:?}", output, curves_path);
        }
    }

    Ok(())
}
