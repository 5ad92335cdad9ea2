use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;

use glucowatch::activity::ActivityLog;
use glucowatch::commands::{parse_amount, CommandHandler};
use glucowatch::config::MonitorConfig;
use glucowatch::logging::{init_logging, LogLevel};
use glucowatch::models::{CarbKind, EntrySource, InsulinKind, Reading};
use glucowatch::pipeline::{AnalysisPipeline, CycleOutput};
use glucowatch::sensor::{MockSensor, ReadingSource};
use glucowatch::storage::{GlucoseStore, MemoryStore};

/// glucowatch - Glucose Decision-Support CLI
///
/// Interprets a stream of glucose readings and produces trend
/// classification, short-horizon predictions and safety-checked treatment
/// suggestions. Suggestions are for a human to act on; nothing is ever
/// actuated.
#[derive(Parser)]
#[command(name = "glucowatch")]
#[command(version = "0.1.0")]
#[command(about = "Glucose trend analysis and decision support", long_about = None)]
struct Cli {
    /// Sets a custom config file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Increase verbosity of output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the analysis pipeline against the deterministic mock sensor
    Simulate {
        /// Scenario: steady, rising, falling, hypo, hyper, wave
        #[arg(short, long, default_value = "wave")]
        scenario: String,

        /// Number of analysis cycles to run
        #[arg(short = 'n', long, default_value = "12")]
        cycles: usize,

        /// Log an insulin dose (units) before the first cycle
        #[arg(long)]
        insulin: Option<String>,

        /// Log a carb intake (grams) before the first cycle
        #[arg(long)]
        carbs: Option<String>,
    },

    /// Run one-shot analysis over a JSON series of readings
    Analyze {
        /// Input file: JSON array of {"value": 120, "timestamp": "..."}
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Manage the monitor configuration
    Config {
        /// Write a default configuration file
        #[arg(long)]
        init: bool,

        /// Print the active configuration
        #[arg(long)]
        show: bool,

        /// Configuration file path
        #[arg(short, long, default_value = "glucowatch.toml")]
        path: PathBuf,
    },
}

#[derive(serde::Deserialize)]
struct ReadingRecord {
    value: u16,
    timestamp: DateTime<Utc>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => MonitorConfig::load(path)?,
        None => MonitorConfig::default(),
    };

    // Verbosity flag wins over the configured level
    config.logging.level = match cli.verbose {
        0 => config.logging.level,
        1 => LogLevel::Info,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };
    init_logging(&config.logging)?;

    match cli.command {
        Commands::Simulate {
            scenario,
            cycles,
            insulin,
            carbs,
        } => simulate(&config, &scenario, cycles, insulin, carbs),
        Commands::Analyze { file } => analyze(&config, &file),
        Commands::Config { init, show, path } => manage_config(&config, init, show, &path),
    }
}

fn simulate(
    config: &MonitorConfig,
    scenario: &str,
    cycles: usize,
    insulin: Option<String>,
    carbs: Option<String>,
) -> Result<()> {
    let start = Utc::now();
    let mut sensor = MockSensor::scenario(scenario, start)
        .ok_or_else(|| anyhow!("unknown scenario: {}", scenario))?;

    let log = ActivityLog::new();
    let handler = CommandHandler::new(config, log.clone());
    let mut pipeline = AnalysisPipeline::new(config, log);
    let mut store = MemoryStore::new();

    if let Some(units) = insulin {
        let amount = parse_amount(&units)?;
        let entry =
            handler.log_insulin(amount, InsulinKind::Rapid, start, EntrySource::Manual, None)?;
        store.append_insulin(&entry)?;
        println!("{}", format!("Logged {} u rapid insulin", amount).dimmed());
    }
    if let Some(grams) = carbs {
        let amount = parse_amount(&grams)?;
        let entry =
            handler.log_carbs(amount, CarbKind::Mixed, start, EntrySource::Manual, None)?;
        store.append_carbs(&entry)?;
        println!("{}", format!("Logged {} g mixed carbs", amount).dimmed());
    }

    println!(
        "{}",
        format!("Simulating '{}' scenario, {} cycles", scenario, cycles)
            .green()
            .bold()
    );

    for _ in 0..cycles {
        let Some(reading) = sensor.current_reading()? else {
            break;
        };
        store.append_reading(&reading)?;
        if let Some(output) = pipeline.process_reading(reading)? {
            print_cycle(&output);
        }
    }

    println!(
        "{}",
        format!(
            "✓ Simulation completed: {} cycles, {} readings stored",
            pipeline.cycles_completed(),
            store.reading_count()
        )
        .green()
    );
    Ok(())
}

fn analyze(config: &MonitorConfig, file: &PathBuf) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read input file: {}", file.display()))?;
    let records: Vec<ReadingRecord> =
        serde_json::from_str(&content).context("Input must be a JSON array of readings")?;

    println!(
        "{}",
        format!("Analyzing {} readings...", records.len()).blue().bold()
    );

    let mut pipeline = AnalysisPipeline::new(config, ActivityLog::new());
    let mut rejected = 0usize;
    let mut last_output: Option<CycleOutput> = None;

    for record in records {
        match Reading::new(record.value, record.timestamp, None) {
            Ok(reading) => {
                if let Some(output) = pipeline.process_reading(reading)? {
                    last_output = Some(output);
                }
            }
            Err(error) => {
                rejected += 1;
                eprintln!("{}", error.user_message().yellow());
            }
        }
    }

    match last_output {
        Some(output) => print_cycle(&output),
        None => println!("No readings were accepted for analysis"),
    }
    if rejected > 0 {
        println!("{}", format!("{} readings rejected", rejected).yellow());
    }
    println!("{}", "✓ Analysis completed".blue());
    Ok(())
}

fn manage_config(config: &MonitorConfig, init: bool, show: bool, path: &PathBuf) -> Result<()> {
    if init {
        MonitorConfig::default().save(path)?;
        println!(
            "{}",
            format!("✓ Default configuration written to {}", path.display()).green()
        );
    }
    if show || !init {
        let rendered = toml::to_string_pretty(config)?;
        println!("{}", rendered);
    }
    Ok(())
}

fn print_cycle(output: &CycleOutput) {
    let value = output.reading.value;
    let colored_value = if f64::from(value) <= 70.0 {
        format!("{} mg/dL", value).red().bold()
    } else if f64::from(value) >= 180.0 {
        format!("{} mg/dL", value).yellow().bold()
    } else {
        format!("{} mg/dL", value).green()
    };

    println!(
        "\n{} {} {}  rate {:+.1}/min  {}",
        output.reading.timestamp.format("%H:%M").to_string().dimmed(),
        colored_value,
        output.trend.direction.arrow(),
        output.trend.rate_per_minute,
        if output.trend.stable { "stable" } else { "moving" },
    );

    if output.activity.iob > 0.05 || output.activity.cob > 0.5 {
        println!(
            "  IOB {:.1} u{}  COB {:.0} g  net {:+.0} mg/dL",
            output.activity.iob,
            if output.activity.override_active {
                " (override)"
            } else {
                ""
            },
            output.activity.cob,
            output.activity.projected_glucose_delta_mg_dl,
        );
    }

    println!(
        "  predicted {:.0} mg/dL in {} min ({}, {} confidence)",
        output.prediction.predicted_value,
        output.prediction.horizon_minutes,
        output.prediction.method,
        output.prediction.confidence,
    );
    for risk in &output.prediction.risk_factors {
        println!("  {} {}", "!".yellow(), risk);
    }

    for rec in &output.recommendations {
        let header = format!("[{}]", rec.kind).to_uppercase();
        let line = format!("  {} {}", header, rec.message);
        match rec.urgency {
            glucowatch::models::Urgency::Critical => println!("{}", line.red().bold()),
            glucowatch::models::Urgency::High => println!("{}", line.red()),
            glucowatch::models::Urgency::Medium => println!("{}", line.yellow()),
            glucowatch::models::Urgency::Low => println!("{}", line.normal()),
        }
        for note in &rec.safety_notes {
            println!("      - {}", note.dimmed());
        }
    }
}
