//! CounterFlow - derived-value computation for polled SNMP-style metrics.
//!
//! Compiles declarative datasource templates plus check commands into
//! resolved service specifications, caches them in SQLite, and turns
//! batches of raw readings into computed values (rates, scaled gauges,
//! formula results) using the previously cached samples.

mod collect;
mod compute;
mod config;
mod db;
mod service;

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use collect::Reading;
use compute::RawValue;
use config::Settings;
use db::Store;
use service::CheckArgs;

#[derive(Parser)]
#[command(name = "counterflow", version, about = "Derived-value computation engine for polled metrics")]
struct Cli {
    /// Path to the cache database (overrides COUNTERFLOW_DB_PATH)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile a check command against a datasource document and seed the cache
    Compile {
        /// Datasource document file (YAML, or JSON by extension)
        #[arg(long)]
        datasource: PathBuf,
        /// Full check command line, quoted
        command: String,
        /// Check interval in seconds (default: COUNTERFLOW_CHECK_INTERVAL)
        #[arg(long)]
        interval: Option<f64>,
        /// Replace the cached document instead of merging into it
        #[arg(long)]
        replace: bool,
    },
    /// Process a JSON file of readings through the computation cycle
    Process {
        /// JSON array of readings
        readings: PathBuf,
    },
    /// Print the cached document for one service
    Show { host: String, service: String },
    /// Print all cached documents for a host at one check interval
    List {
        host: String,
        /// Check interval filter (default: COUNTERFLOW_CHECK_INTERVAL)
        #[arg(long)]
        interval: Option<f64>,
    },
    /// Record the instance id resolved for a named instance
    Map {
        host: String,
        instance_name: String,
        instance: String,
    },
}

/// One reading as given in a process file; the timestamp may be left
/// out to use the current time.
#[derive(serde::Deserialize)]
struct ReadingInput {
    host: String,
    service: String,
    ds_name: String,
    value: RawValue,
    #[serde(default)]
    check_time: Option<f64>,
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("counterflow=info".parse()?))
        .init();

    let cli = Cli::parse();
    let settings = Settings::load();

    let db_path = cli
        .db
        .unwrap_or_else(|| PathBuf::from(&settings.db_path));
    let store = Store::new(&db_path)?;

    match cli.command {
        Command::Compile {
            datasource,
            command,
            interval,
            replace,
        } => {
            let document = load_document(&datasource)?;
            let args = CheckArgs::from_command_line(&command)?;
            let interval = interval.unwrap_or(settings.check_interval);

            let spec = service::compile(&args, &document, interval)?;
            let doc = spec.to_document()?;

            if replace {
                store.update_service(&spec.host, &spec.service, &doc)?;
            } else {
                store.upsert_service(&spec.host, &spec.service, &doc)?;
            }

            tracing::info!(
                "Compiled [{}, {}]: {} datasources, {} triggers",
                spec.host,
                spec.service,
                spec.datasources.len(),
                spec.triggers.len()
            );
        }

        Command::Process { readings } => {
            let raw = std::fs::read_to_string(&readings)?;
            let inputs: Vec<ReadingInput> = serde_json::from_str(&raw)?;

            let now = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
            let batch: Vec<Reading> = inputs
                .into_iter()
                .map(|input| Reading {
                    host: input.host,
                    service: input.service,
                    ds_name: input.ds_name,
                    value: input.value,
                    check_time: input.check_time.unwrap_or(now),
                })
                .collect();

            let summary = collect::process_readings(&store, &batch);
            tracing::info!(
                "Processed {} readings: {} computed, {} waiting, {} failed",
                batch.len(),
                summary.computed,
                summary.waiting,
                summary.failed
            );
        }

        Command::Show { host, service } => match store.get_service(&host, &service)? {
            Some(doc) => println!("{}", serde_json::to_string_pretty(&doc)?),
            None => {
                tracing::warn!("No cached service [{}, {}]", host, service);
            }
        },

        Command::List { host, interval } => {
            let interval = interval.unwrap_or(settings.check_interval);
            let docs = store.get_services(&host, interval)?;
            println!("{}", serde_json::to_string_pretty(&docs)?);
        }

        Command::Map {
            host,
            instance_name,
            instance,
        } => {
            let updated = store.update_service_instance(
                &host,
                &instance_name,
                &serde_json::Value::String(instance),
            )?;
            tracing::info!("Updated {} services for [{}, {}]", updated, host, instance_name);
        }
    }

    Ok(())
}

/// Load a datasource document, YAML unless the file says JSON.
fn load_document(path: &Path) -> Result<serde_json::Value, Box<dyn std::error::Error + Send + Sync>> {
    let raw = std::fs::read_to_string(path)?;
    let document = if path.extension().is_some_and(|ext| ext == "json") {
        serde_json::from_str(&raw)?
    } else {
        serde_yaml::from_str(&raw)?
    };
    Ok(document)
}
