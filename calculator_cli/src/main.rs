use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use chrono::SecondsFormat;
use clap::{Args, Parser, Subcommand};
use geo_calculator_data_management::{database::db::SqliteKeyedStore, HistoryStore, WriteError};
use geo_calculator_lib::{compute_distance_bearing, BearingUnit, CalculationRecord, Coordinate, DisplaySettings, DisplayUnit, DistanceBearingResult, DistanceUnit};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const APPEND_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(250);

// CLI front end for the calculator and its shared history
#[derive(Parser)]
#[command(name = "geocalc")]
#[command(about = "Great-circle distance and bearing, with a shared lookup history", long_about = None)]
struct Cli {
    /// History database. Defaults to data/history.db under the project root
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Copy)]
struct Units {
    /// kilometers | miles
    #[arg(long, default_value = "kilometers")]
    distance_units: DistanceUnit,
    /// degrees | mils
    #[arg(long, default_value = "degrees")]
    bearing_units: BearingUnit,
}

impl From<Units> for DisplaySettings {
    fn from(units: Units) -> Self {
        DisplaySettings::new(units.distance_units, units.bearing_units)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Compute distance and bearing between two points and record the lookup
    Calc {
        #[arg(allow_negative_numbers = true)]
        orig_lat: f64,
        #[arg(allow_negative_numbers = true)]
        orig_lng: f64,
        #[arg(allow_negative_numbers = true)]
        dest_lat: f64,
        #[arg(allow_negative_numbers = true)]
        dest_lng: f64,
        #[command(flatten)]
        units: Units,
    },
    /// Print every recorded lookup
    History {
        #[command(flatten)]
        units: Units,
    },
    /// Print the history every time it changes, until Ctrl-C
    Watch {
        #[command(flatten)]
        units: Units,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=info,geo_calculator_data_management=info", env!("CARGO_CRATE_NAME")).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let keyed_store = match &cli.database {
        Some(path) => SqliteKeyedStore::open(path).await,
        None => SqliteKeyedStore::connect().await,
    }
    .context("Failed to open history database")?;
    let history = HistoryStore::new(keyed_store);

    match cli.command {
        Commands::Calc { orig_lat, orig_lng, dest_lat, dest_lng, units } => {
            let origin = Coordinate::new(orig_lat, orig_lng)?;
            let destination = Coordinate::new(dest_lat, dest_lng)?;
            let result = compute_distance_bearing(origin, destination);

            for line in result_lines(&result, units.into()) {
                println!("{}", line);
            }

            let record = history.stamp(origin, destination).await;
            append_with_retry(&history, record).await.context("Failed to save lookup to history")?;
        },
        Commands::History { units } => {
            let snapshot = history.load().await?;
            if snapshot.is_empty() {
                println!("No lookups recorded yet");
            }
            for record in snapshot.iter() {
                println!("{}", history_line(record, units.into()));
            }
        },
        Commands::Watch { units } => {
            let settings: DisplaySettings = units.into();
            let (tx, mut rx) = mpsc::unbounded_channel();
            let id = history.subscribe(move |snapshot| {
                let _ = tx.send(snapshot);
            }).await?;

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    snapshot = rx.recv() => {
                        let Some(snapshot) = snapshot else { break };
                        println!("--- {} lookups ---", snapshot.len());
                        for record in snapshot.iter() {
                            println!("{}", history_line(record, settings));
                        }
                    },
                }
            }

            history.unsubscribe(id).await;
            history.shutdown().await;
        },
    }

    Ok(())
}

/// Transient failures are retried a few times, permanent ones are not.
async fn append_with_retry(history: &HistoryStore<SqliteKeyedStore>, record: CalculationRecord) -> Result<(), WriteError> {
    let mut attempt = 1;
    loop {
        match history.append(record).await {
            Err(err) if err.is_transient() && attempt < APPEND_ATTEMPTS => {
                tracing::warn!("Append attempt {} failed, retrying: {}", attempt, err);
                tokio::time::sleep(RETRY_DELAY * attempt).await;
                attempt += 1;
            },
            result => return result,
        }
    }
}

fn result_lines(result: &DistanceBearingResult, settings: DisplaySettings) -> [String; 2] {
    let (distance, bearing) = settings.render(result);
    [
        format!("Distance: {} {}", distance, settings.distance_units.label()),
        format!("Bearing: {} {}.", bearing, settings.bearing_units.label()),
    ]
}

fn history_line(record: &CalculationRecord, settings: DisplaySettings) -> String {
    let (distance, bearing) = settings.render(&record.compute());
    format!(
        "{}\t{} -> {}\t{} {}\t{} {}",
        record.timestamp().to_rfc3339_opts(SecondsFormat::Secs, true),
        record.origin(),
        record.destination(),
        distance,
        settings.distance_units.label(),
        bearing,
        settings.bearing_units.label(),
    )
}

#[test]
fn renders_result_lines() {
    let result = DistanceBearingResult {
        distance_meters: 1_000_000.0,
        bearing_degrees: 90.0,
    };

    let lines = result_lines(&result, DisplaySettings::default());
    assert_eq!(lines, ["Distance: 1000.00 kilometers".to_string(), "Bearing: 90.00 degrees.".to_string()]);

    let lines = result_lines(&result, DisplaySettings::new(DistanceUnit::Miles, BearingUnit::Mils));
    assert_eq!(lines, ["Distance: 621.37 miles".to_string(), "Bearing: 1600.00 mils.".to_string()]);
}

#[test]
fn parses_negative_coordinates() {
    let cli = Cli::try_parse_from(["geocalc", "calc", "42.96", "-85.67", "-33.86", "151.2", "--distance-units", "mi"]).unwrap();
    let Commands::Calc { orig_lng, dest_lat, units, .. } = cli.command else {
        panic!("expected calc");
    };
    assert_eq!(orig_lng, -85.67);
    assert_eq!(dest_lat, -33.86);
    assert_eq!(units.distance_units, DistanceUnit::Miles);
    assert_eq!(units.bearing_units, BearingUnit::Degrees);
}
