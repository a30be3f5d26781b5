use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod archive;
mod config;
mod dedup;
mod drivers;
mod error;
mod harvester;
mod models;
mod records;
mod status;
mod store;
mod traits;
mod watcher;

use config::HarvestConfig;
use drivers::HttpDriver;
use harvester::Harvester;

#[derive(Parser)]
#[command(author, version, about = "Downloads and unpacks tender documents for scraped listings")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Download, validate and extract archives for every new record
    Run(RunArgs),

    /// Only refresh records from archives already in the storage folder
    ExtractExisting(CommonArgs),
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Listing JSON produced by the scraper (defaults to the domain's last export)
    #[arg(short, long)]
    listing: Option<PathBuf>,

    /// Storage root served by the web application
    #[arg(long)]
    storage_root: Option<PathBuf>,

    /// Sub-folder of the storage root for this portal
    #[arg(long)]
    domain: Option<String>,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Repeat the run on this cron schedule instead of exiting
    #[arg(long)]
    cron: Option<String>,
}

impl CommonArgs {
    fn config(&self) -> HarvestConfig {
        let mut config = HarvestConfig::from_env();
        if let Some(root) = &self.storage_root {
            config.storage_root = root.clone();
        }
        if let Some(domain) = &self.domain {
            config.domain = domain.clone();
        }
        config
    }

    fn listing_path(&self, config: &HarvestConfig) -> PathBuf {
        self.listing
            .clone()
            .unwrap_or_else(|| config.json_export_path())
    }
}

async fn harvest_once(harvester: &Harvester, listing: &Path) -> Result<()> {
    harvester.run_exclusive(listing).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::ExtractExisting(args) => {
            let config = args.config();
            let listing = args.listing_path(&config);
            let harvester = Harvester::new(config, Arc::new(HttpDriver::new()?));
            info!(
                "Refreshing existing archives in {}",
                harvester.config().domain_dir().display()
            );

            let mut records = store::load_listing(&listing)?;
            harvester.refresh_and_export(&mut records)?;
        }
        Commands::Run(args) => {
            let config = args.common.config();
            let listing = args.common.listing_path(&config);
            let harvester = Arc::new(Harvester::new(config, Arc::new(HttpDriver::new()?)));
            info!(
                "Starting DCE harvest for {} into {}",
                listing.display(),
                harvester.config().domain_dir().display()
            );

            let Some(schedule) = args.cron else {
                return harvest_once(&harvester, &listing).await;
            };

            // Run once immediately, then on schedule. Ticks that fire while a
            // harvest is still going are skipped.
            if let Err(e) = harvest_once(&harvester, &listing).await {
                error!("Error during initial harvest: {:#}", e);
            }

            let sched = JobScheduler::new().await?;

            let job_harvester = harvester.clone();
            let job_listing = listing.clone();
            sched
                .add(Job::new_async(schedule.as_str(), move |_uuid, _l| {
                    let harvester = job_harvester.clone();
                    let listing = job_listing.clone();
                    Box::pin(async move {
                        if let Err(e) = harvest_once(&harvester, &listing).await {
                            error!("Error during scheduled harvest: {:#}", e);
                        }
                    })
                })?)
                .await?;

            info!("Scheduler started with schedule {}", schedule);
            sched.start().await?;

            // Keep the program running
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(30)).await;
            }
        }
    }

    Ok(())
}
