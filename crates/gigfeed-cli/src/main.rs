use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use gigfeed_jobs::{seed_sample_data, Engine, EngineConfig, JobKind, SampleDataGenerator, TriggerOutcome, TriggerSource};
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

const DEFAULT_FILTER: &str =
    "gigfeed=info,gigfeed_core=info,gigfeed_storage=info,gigfeed_jobs=info,gigfeed_ranker=info,gigfeed_web=info,warn";
const VERBOSE_FILTER: &str =
    "gigfeed=debug,gigfeed_core=debug,gigfeed_storage=debug,gigfeed_jobs=debug,gigfeed_ranker=debug,gigfeed_web=debug,info";

#[derive(Debug, Parser)]
#[command(name = "gigfeed")]
#[command(about = "Gig marketplace feed and recommendation engine")]
struct Cli {
    /// Debug-level logging for the engine crates. Ignored when RUST_LOG is set.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the HTTP API (and the scheduler when GIGFEED_SCHEDULER_ENABLED is set).
    Serve,
    /// Run one batch job to completion and print its summary.
    Run {
        /// daily, hourly or frequent
        task_type: JobKind,
    },
    /// Generate sample data into the in-process catalog, then run every job once.
    Seed {
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long)]
        users: Option<usize>,
        #[arg(long)]
        listings: Option<usize>,
        #[arg(long)]
        interactions_per_user: Option<usize>,
    },
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { VERBOSE_FILTER } else { DEFAULT_FILTER }));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();
}

fn print_outcome(outcome: &TriggerOutcome) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(outcome)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => gigfeed_web::serve_from_env().await?,
        Commands::Run { task_type } => {
            let engine = Engine::from_config(EngineConfig::from_env()).await?;
            let outcome = engine.orchestrator.trigger(task_type, TriggerSource::Manual).await;
            print_outcome(&outcome)?;
            if !matches!(outcome, TriggerOutcome::Success(_)) {
                bail!("{task_type} job did not succeed");
            }
        }
        Commands::Seed {
            seed,
            users,
            listings,
            interactions_per_user,
        } => {
            let engine = Engine::from_config(EngineConfig::from_env()).await?;
            let catalog = engine
                .memory_catalog
                .clone()
                .context("seeding needs the in-process catalog; unset GIGFEED_CATALOG_URL")?;
            let mut generator = SampleDataGenerator::new(seed);
            generator.num_users = users.unwrap_or(generator.num_users);
            generator.num_listings = listings.unwrap_or(generator.num_listings);
            generator.interactions_per_user = interactions_per_user.unwrap_or(generator.interactions_per_user);

            let summary = seed_sample_data(&mut generator, &catalog, engine.log.as_ref(), Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);

            for kind in JobKind::ALL {
                let outcome = engine.orchestrator.trigger(kind, TriggerSource::Manual).await;
                info!(job = %kind, succeeded = matches!(outcome, TriggerOutcome::Success(_)), "seed run finished");
                print_outcome(&outcome)?;
            }
            println!("{}", serde_json::to_string_pretty(&engine.snapshots.versions())?);
        }
    }

    Ok(())
}
