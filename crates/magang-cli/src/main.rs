use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use magang_core::{apply_filters, paginate, FilterCriteria, RegionKey, LISTINGS_PER_PAGE, REGIONS};
use magang_storage::SavedJobsError;
use magang_sync::{
    build_orchestrator, export_parquet, FetchMode, FetchOrchestrator, FetchOutcome, RetryOutcome,
    SyncConfig,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "magang-cli")]
#[command(about = "Internship listing finder command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Args)]
struct RegionArg {
    /// Province code; defaults to the saved session region, then MAGANG_DEFAULT_REGION.
    #[arg(long)]
    region: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every page for a region and store its snapshot.
    Sync {
        #[command(flatten)]
        region: RegionArg,
        /// Ignore any stored snapshot.
        #[arg(long)]
        force: bool,
        /// Retry rounds for pages that failed.
        #[arg(long, default_value_t = 1)]
        retry_rounds: u32,
    },
    /// Filter the region dataset and print one page.
    List {
        #[command(flatten)]
        region: RegionArg,
        #[arg(long)]
        program_study: Option<String>,
        #[arg(long)]
        position: Option<String>,
        #[arg(long)]
        city: Option<String>,
        #[arg(long)]
        company: Option<String>,
        #[arg(long)]
        education_level: Option<String>,
        #[arg(long)]
        page: Option<usize>,
    },
    /// Print city, company and education-level options for a region.
    Facets {
        #[command(flatten)]
        region: RegionArg,
    },
    /// Write the region dataset as an Apache Parquet file plus a JSON manifest.
    ///
    /// The output is columnar Parquet, not a spreadsheet; open it with a
    /// Parquet-aware tool or load it into a dataframe.
    Export {
        #[command(flatten)]
        region: RegionArg,
        /// Output directory; defaults to <data dir>/exports/<region>.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Drop every stored region snapshot.
    ClearCache,
    /// Print platform statistics.
    Stats,
    /// Print the province code table.
    Regions,
    /// Manage saved listings.
    Saved {
        #[command(subcommand)]
        action: SavedAction,
    },
    Serve,
}

#[derive(Debug, Subcommand)]
enum SavedAction {
    List,
    Add {
        id: String,
        #[command(flatten)]
        region: RegionArg,
    },
    Remove {
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Sync {
            region,
            force,
            retry_rounds,
        } => {
            let region = resolve_region(&config, region).await;
            let orchestrator = build_orchestrator(&config)?;
            let outcome = orchestrator
                .load_region(region.clone(), FetchMode::Foreground, force)
                .await
                .with_context(|| format!("syncing region {region}"))?;
            let FetchOutcome::Completed(report) = outcome else {
                bail!("sync for region {region} was cancelled");
            };
            info!(
                run_id = %report.run_id,
                region = %report.region,
                source = ?report.source,
                listings = report.listings,
                pages = report.total_pages,
                failed = ?report.failed_pages,
                "sync complete"
            );
            retry_rounds_until_clean(&orchestrator, retry_rounds).await?;
        }
        Commands::List {
            region,
            program_study,
            position,
            city,
            company,
            education_level,
            page,
        } => {
            let session_store = config.session_store();
            let mut session = session_store.load().await;
            let region = resolve_region(&config, region).await;
            let next = FilterCriteria {
                program_study: program_study.unwrap_or_else(|| session.criteria.program_study.clone()),
                position: position.unwrap_or_else(|| session.criteria.position.clone()),
                region: region.clone(),
                city: city.unwrap_or_else(|| session.criteria.city.clone()),
                company: company.unwrap_or_else(|| session.criteria.company.clone()),
                education_level: education_level
                    .unwrap_or_else(|| session.criteria.education_level.clone()),
            };
            session.update_criteria(next);
            if let Some(page) = page {
                session.set_page(page);
            }

            let orchestrator = load_dataset(&config, &region).await?;
            let view = orchestrator.view().await;
            session.reconcile(&view.listings);
            let filtered = apply_filters(&view.listings, &session.criteria);
            let slice = paginate(&filtered, session.page, LISTINGS_PER_PAGE);
            session.set_page(slice.page);
            session_store
                .save(&session)
                .await
                .context("saving view session")?;

            for listing in &slice.items {
                println!(
                    "{}\t{}\t{}\t{}\tquota={} registered={}",
                    listing.id,
                    listing.title,
                    listing.employer.name,
                    listing.employer.city,
                    listing.quota,
                    listing.registered
                );
            }
            println!(
                "page {}/{} ({} matching of {})",
                slice.page,
                slice.total_pages,
                slice.total_items,
                view.listings.len()
            );
            if let Some(warning) = &view.error {
                warn!(%warning, "dataset incomplete");
            }
        }
        Commands::Facets { region } => {
            let region = resolve_region(&config, region).await;
            let orchestrator = load_dataset(&config, &region).await?;
            let mut session = config.session_store().load().await;
            session.criteria.region = region;
            let facets = orchestrator
                .with_view(|view| session.reconcile(&view.listings))
                .await;
            println!("{}", serde_json::to_string_pretty(&facets)?);
        }
        Commands::Export { region, out } => {
            let region = resolve_region(&config, region).await;
            let orchestrator = load_dataset(&config, &region).await?;
            let out_dir = out.unwrap_or_else(|| config.export_dir().join(region.as_str()));
            let listings = orchestrator.view().await.listings;
            let manifest = tokio::task::spawn_blocking(move || {
                export_parquet(&listings, Some(&region), &out_dir)
            })
            .await
            .context("export task panicked")??;
            info!(manifest = %manifest.display(), "parquet export complete");
        }
        Commands::ClearCache => {
            let orchestrator = build_orchestrator(&config)?;
            orchestrator
                .clear_cache()
                .await
                .context("clearing snapshots")?;
            println!("snapshots cleared under {}", config.data_dir.display());
        }
        Commands::Stats => {
            let stats = config.stats_client()?.fetch_or_default().await;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Regions => {
            for (code, name) in REGIONS {
                println!("{code}\t{name}");
            }
        }
        Commands::Saved { action } => {
            let saved = config.saved_jobs_store();
            match action {
                SavedAction::List => {
                    for listing in saved.list().await? {
                        println!("{}\t{}\t{}", listing.id, listing.title, listing.employer.name);
                    }
                }
                SavedAction::Add { id, region } => {
                    let region = resolve_region(&config, region).await;
                    let orchestrator = load_dataset(&config, &region).await?;
                    let listing = orchestrator
                        .with_view(|view| view.listings.iter().find(|l| l.id == id).cloned())
                        .await
                        .with_context(|| format!("listing {id} not found in region {region}"))?;
                    match saved.save(&listing).await {
                        Ok(true) => println!("saved {id}"),
                        Ok(false) => println!("{id} already saved"),
                        Err(err @ SavedJobsError::Full) => bail!(err),
                        Err(err) => return Err(err).context("saving listing"),
                    }
                }
                SavedAction::Remove { id } => {
                    if saved.remove(&id).await? {
                        println!("removed {id}");
                    } else {
                        println!("{id} was not saved");
                    }
                }
            }
        }
        Commands::Serve => {
            magang_web::serve(config).await?;
        }
    }

    Ok(())
}

async fn resolve_region(config: &SyncConfig, arg: RegionArg) -> RegionKey {
    if let Some(code) = arg.region {
        return RegionKey::new(code);
    }
    let session = config.session_store().load().await;
    if session.criteria.region.is_empty() {
        config.default_region.clone()
    } else {
        session.criteria.region
    }
}

/// Orchestrator holding `region`'s dataset, from its snapshot when one exists.
async fn load_dataset(
    config: &SyncConfig,
    region: &RegionKey,
) -> Result<std::sync::Arc<FetchOrchestrator>> {
    let orchestrator = build_orchestrator(config)?;
    orchestrator
        .load_region(region.clone(), FetchMode::Foreground, false)
        .await
        .with_context(|| format!("loading region {region}"))?;
    Ok(orchestrator)
}

async fn retry_rounds_until_clean(orchestrator: &FetchOrchestrator, rounds: u32) -> Result<()> {
    for round in 1..=rounds {
        if orchestrator.view().await.failed_pages.is_empty() {
            return Ok(());
        }
        match orchestrator.retry_failed().await? {
            RetryOutcome::Completed(report) => info!(
                round,
                recovered = ?report.recovered,
                still_failed = ?report.still_failed,
                persisted = report.persisted,
                "retry round finished"
            ),
            RetryOutcome::Cancelled => bail!("retry round {round} was cancelled"),
        }
    }
    if let Some(warning) = orchestrator.view().await.error {
        warn!(%warning, "failed pages remain after retries");
    }
    Ok(())
}
