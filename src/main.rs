use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use buildwatch::config::BuildwatchConfig;
use buildwatch::detect::engine::DetectionEngine;
use buildwatch::detect::{AlertStatus, FindingSource};
use buildwatch::storage::{AlertFilter, SqliteStore};
use clap::{Parser, Subcommand};
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "buildwatch",
    about = "Statistical anomaly detection and alerting for building IoT sensors",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file (defaults to $BUILDWATCH_CONFIG, then /etc/buildwatch/buildwatch.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the SQLite database path
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server
    Serve {
        /// Bind address
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run anomaly detection for one building and emit alerts
    Detect {
        /// Building identifier
        #[arg(long)]
        building: String,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Inspect and handle alerts
    Alerts {
        #[command(subcommand)]
        action: AlertAction,
    },
}

#[derive(Subcommand)]
enum AlertAction {
    /// List recent alerts, newest first
    List {
        /// Only alerts for this sensor
        #[arg(long)]
        sensor: Option<String>,

        /// Only alerts in this status (NEW, ACKNOWLEDGED, RESOLVED)
        #[arg(long)]
        status: Option<AlertStatus>,

        /// Maximum rows
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Acknowledge a NEW alert
    Ack {
        /// Alert id
        id: Uuid,
    },

    /// Resolve an ACKNOWLEDGED alert
    Resolve {
        /// Alert id
        id: Uuid,
    },
}

fn init_tracing(config: &BuildwatchConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, fallbacks) = match &cli.config {
        Some(path) => (BuildwatchConfig::load(path)?, Vec::new()),
        None => BuildwatchConfig::load_or_default(),
    };
    if let Some(db) = cli.db {
        config.storage.db_path = db;
    }

    init_tracing(&config);
    for fallback in &fallbacks {
        tracing::warn!(
            path = %fallback.path.display(),
            error = %fallback.error,
            "Config file could not be loaded, falling back"
        );
    }

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "Starting buildwatch daemon");
            buildwatch::serve(&config).await?;
        }
        Commands::Detect { building, json } => {
            let store = Arc::new(SqliteStore::open(&config.storage.db_path)?);
            let engine = DetectionEngine::new(store, config.detector.clone());
            let report = engine.run_detection(&building).await?;

            if json {
                let json_output = serde_json::to_string_pretty(&serde_json::json!({
                    "success": true,
                    "anomalies_detected": report.anomalies_detected,
                    "alerts_created": report.alerts_created,
                    "anomalies": report.findings,
                }))?;
                println!("{}", json_output);
            } else {
                println!("\nbuildwatch detection report");
                println!("Building:   {}", report.building_id);
                println!(
                    "Anomalies:  {} (alerts created: {})",
                    report.anomalies_detected, report.alerts_created
                );
                if !report.findings.is_empty() {
                    println!();
                    println!(
                        "{:<25} | {:<10} | {:>10} | {:>10} | {:>8}",
                        "Sensor", "Severity", "Current", "Mean", "Z-Score"
                    );
                    println!("{:-<25}-|-{:-<10}-|-{:-<10}-|-{:-<10}-|-{:-<8}", "", "", "", "", "");
                    for f in &report.findings {
                        let z = match f.source {
                            FindingSource::StatusError => "status".to_string(),
                            FindingSource::Statistical => format!("{:.2}", f.z_score),
                        };
                        println!(
                            "{:<25} | {:<10} | {:>10.2} | {:>10.2} | {:>8}",
                            f.sensor_name, f.severity, f.current_value, f.mean, z
                        );
                    }
                }
                println!();
            }
        }
        Commands::Alerts { action } => {
            let store = SqliteStore::open(&config.storage.db_path)?;

            match action {
                AlertAction::List { sensor, status, limit } => {
                    let alerts = store
                        .list_alerts(AlertFilter {
                            sensor_id: sensor,
                            status,
                            limit,
                        })
                        .await?;
                    if alerts.is_empty() {
                        println!("No alerts found.");
                    } else {
                        println!(
                            "{:<36} | {:<24} | {:<14} | {:<8} | {:<12} | Title",
                            "Id", "Triggered", "Type", "Severity", "Status"
                        );
                        println!(
                            "{:-<36}-|-{:-<24}-|-{:-<14}-|-{:-<8}-|-{:-<12}-|-{:-<20}",
                            "", "", "", "", "", ""
                        );
                        for a in alerts {
                            println!(
                                "{:<36} | {:<24} | {:<14} | {:<8} | {:<12} | {}",
                                a.id,
                                a.triggered_at.to_rfc3339(),
                                a.category,
                                a.severity,
                                a.status,
                                a.title
                            );
                        }
                    }
                }
                AlertAction::Ack { id } => {
                    let alert = store.acknowledge(id, chrono::Utc::now()).await?;
                    println!("Alert '{}' acknowledged.", alert.id);
                }
                AlertAction::Resolve { id } => {
                    let alert = store.resolve(id, chrono::Utc::now()).await?;
                    println!("Alert '{}' resolved.", alert.id);
                }
            }
        }
    }

    Ok(())
}
