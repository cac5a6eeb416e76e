//! Cohort registry administration CLI.
//!
//! ```bash
//! cohort-registry --config registry.yaml list --search pokhara --filter cohort=C2
//! cohort-registry import --file batch.json --cohort C3
//! cohort-registry repair
//! cohort-registry fix-sequence --check
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;

use cohort_registry::commands::{self, RegistryHandle};
use cohort_registry::import;
use cohort_registry::models::{Envelope, ListQuery};
use cohort_registry::{init_tracing, RegistryConfig};

#[derive(Parser)]
#[command(name = "cohort-registry")]
#[command(about = "Cohort-partitioned student record registry")]
#[command(version)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "REGISTRY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List records with search, filters and pagination
    List {
        #[arg(long)]
        page: Option<usize>,

        #[arg(long)]
        limit: Option<usize>,

        /// Case-insensitive match on name, institution, program or district
        #[arg(short, long)]
        search: Option<String>,

        /// Exact field filter, repeatable (e.g. `--filter district=Kaski`)
        #[arg(short, long = "filter", value_name = "FIELD=VALUE")]
        filters: Vec<String>,
    },

    /// Show one record
    Get { id: i64 },

    /// Counts by district, institution, program, year and cohort plus fee totals
    Stats,

    /// List known cohorts
    Cohorts,

    /// Register an empty cohort (format C<number>)
    AddCohort { cohort: String },

    /// Import a JSON array of spreadsheet rows into a cohort
    Import {
        #[arg(short, long)]
        file: PathBuf,

        #[arg(long)]
        cohort: String,
    },

    /// Normalize cohorts, drop invalid partitions, backfill and verify
    Repair,

    /// Compare partitions with the canonical set without changing anything
    Verify,

    /// Move the id sequence past the highest stored id
    FixSequence {
        /// Only report the sequence state
        #[arg(long)]
        check: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = RegistryConfig::load(cli.config.as_deref()).context("loading configuration")?;
    init_tracing(&config.resolved_log_dir()).map_err(|error| anyhow!("initializing logging: {}", error))?;

    let handle = RegistryHandle::open(config).context("opening registry")?;

    match cli.command {
        Commands::List {
            page,
            limit,
            search,
            filters,
        } => {
            let query = ListQuery {
                page,
                limit,
                search,
                filters: parse_filters(&filters)?,
            };
            emit(commands::list_records(&handle, query).await)
        }
        Commands::Get { id } => emit(commands::get_record(&handle, id).await),
        Commands::Stats => emit(commands::get_stats(&handle).await),
        Commands::Cohorts => emit(commands::get_cohorts(&handle).await),
        Commands::AddCohort { cohort } => emit(commands::add_cohort(&handle, cohort).await),
        Commands::Import { file, cohort } => {
            let rows = import::read_rows(&file).with_context(|| format!("reading {}", file.display()))?;
            emit(commands::import_records(&handle, rows, cohort).await)
        }
        Commands::Repair => emit(commands::run_repair(&handle).await),
        Commands::Verify => emit(commands::verify(&handle).await),
        Commands::FixSequence { check: true } => emit(commands::sequence_status(&handle).await),
        Commands::FixSequence { check: false } => emit(commands::repair_sequence(&handle).await),
    }
}

fn parse_filters(raw: &[String]) -> anyhow::Result<BTreeMap<String, String>> {
    raw.iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(field, value)| (field.trim().to_string(), value.trim().to_string()))
                .ok_or_else(|| anyhow!("filter '{}' must look like FIELD=VALUE", pair))
        })
        .collect()
}

fn emit<T: Serialize>(envelope: Envelope<T>) -> anyhow::Result<ExitCode> {
    println!("{}", serde_json::to_string_pretty(&envelope)?);
    Ok(if envelope.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
