use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

use venue_catalog::providers::configured;
use venue_catalog::{Pipeline, PipelineConfig, Provider, VerifyOptions};

#[derive(Parser)]
#[command(name = "venue-catalog")]
#[command(version)]
#[command(about = "Merge NYC venue sources into one catalog and verify them against listing providers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Pipeline configuration (JSON); defaults apply when omitted
    #[arg(long, short, global = true, env = "VENUE_CATALOG_CONFIG")]
    config: Option<PathBuf>,

    /// Debug-level logging
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Load sources, merge, enrich and write the catalog
    Build {
        /// Comma-separated source names (default: all configured)
        #[arg(long, value_delimiter = ',')]
        sources: Option<Vec<String>>,

        /// Reuse fresh cached source data instead of refetching
        #[arg(long)]
        cache: bool,
    },

    /// Sync cached venues into the ledger and run provider batches
    Verify {
        #[arg(long)]
        yelp_limit: Option<usize>,

        #[arg(long)]
        google_limit: Option<usize>,

        /// Only check Google for venues in this borough
        #[arg(long)]
        google_region: Option<String>,

        #[arg(long)]
        opentable_limit: Option<usize>,

        #[arg(long)]
        tripadvisor_limit: Option<usize>,
    },

    /// Fill missing ratings, review counts and coordinates on found venues
    Backfill {
        #[arg(long, default_value_t = 500)]
        limit: usize,
    },

    /// Ledger status histograms and review-count distribution
    Stats,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = PipelineConfig::load_or_default(cli.config.as_deref())?;
    let pipeline = Pipeline::new(config);

    match cli.command {
        Commands::Build { sources, cache } => run_build(&pipeline, sources, cache),
        Commands::Verify {
            yelp_limit,
            google_limit,
            google_region,
            opentable_limit,
            tripadvisor_limit,
        } => {
            let limits = [
                (Provider::Yelp, yelp_limit),
                (Provider::Google, google_limit),
                (Provider::OpenTable, opentable_limit),
                (Provider::TripAdvisor, tripadvisor_limit),
            ]
            .into_iter()
            .filter_map(|(p, limit)| limit.map(|n| (p, n)))
            .collect();
            run_verify(&pipeline, VerifyOptions { limits, google_region })
        }
        Commands::Backfill { limit } => run_backfill(&pipeline, limit),
        Commands::Stats => run_stats(&pipeline),
    }
}

fn run_build(pipeline: &Pipeline, sources: Option<Vec<String>>, cache: bool) -> Result<()> {
    let catalog = pipeline.build_and_write(sources.as_deref(), cache)?;

    println!("🗽 Catalog built");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("✓ Venues:       {}", catalog.venue_count);
    println!(
        "✓ Merged:       {} (exact {}, range {}, geo {})",
        catalog.merge_stats.total_merges,
        catalog.merge_stats.pass1,
        catalog.merge_stats.pass2,
        catalog.merge_stats.pass3
    );
    for stat in &catalog.pipeline_stats {
        println!("✓ {}: -{} ({})", stat.label, stat.removed, stat.detail);
    }
    println!("✓ Data hash:    {}", catalog.data_hash);
    Ok(())
}

fn run_verify(pipeline: &Pipeline, options: VerifyOptions) -> Result<()> {
    let providers = configured(&pipeline.config().providers)?;
    if providers.is_empty() {
        eprintln!("❌ No verification provider is configured (missing API keys?)");
        return Ok(());
    }

    let started = Instant::now();
    let report = pipeline.verify(&providers, &options)?;

    println!("🔎 Verification run ({:.1}s)", started.elapsed().as_secs_f64());
    println!("✓ Newly synced: {}", report.synced);
    for (provider, n) in &report.checked {
        println!("✓ {:<12} {} checked", provider.label(), n);
    }
    Ok(())
}

fn run_backfill(pipeline: &Pipeline, limit: usize) -> Result<()> {
    let providers = configured(&pipeline.config().providers)?;
    let started = Instant::now();
    let filled = pipeline.backfill(&providers, limit)?;

    println!("🩹 Backfill ({:.1}s)", started.elapsed().as_secs_f64());
    for (provider, n) in &filled {
        println!("✓ {:<12} {} updated", provider.label(), n);
    }
    Ok(())
}

fn run_stats(pipeline: &Pipeline) -> Result<()> {
    if !pipeline.config().ledger_path.exists() {
        eprintln!("❌ Ledger not found at {:?}", pipeline.config().ledger_path);
        eprintln!("   Run `venue-catalog verify` first.");
        std::process::exit(1);
    }
    let ledger = pipeline.open_ledger()?;

    for (provider, counts) in ledger.stats()? {
        let total: usize = counts.values().sum();
        println!("\n{} ({} total):", provider.to_uppercase(), total);
        for (status, n) in &counts {
            let pct = if total > 0 { *n as f64 / total as f64 * 100.0 } else { 0.0 };
            println!("  {:<12} {:>7}  ({:.1}%)", status, n, pct);
        }
    }

    for (provider, d) in ledger.review_distribution()? {
        if d.count == 0 {
            println!("\n{} reviews: no data yet", provider.to_uppercase());
            continue;
        }
        println!("\n{} review counts ({} venues with data):", provider.to_uppercase(), d.count);
        println!(
            "  min={}, p10={}, p25={}, median={}, p75={}, p90={}, max={}",
            d.min, d.p10, d.p25, d.median, d.p75, d.p90, d.max
        );
        if let Some(avg) = d.avg_rating {
            println!("  avg rating: {:.2}", avg);
        }
        println!(
            "  <10 reviews: {}, <25: {}, <50: {}, <100: {}",
            d.under_10, d.under_25, d.under_50, d.under_100
        );
        if let (Some(gems), Some(pct)) = (d.hidden_gems_candidates, d.hidden_gems_pct) {
            println!("  Hidden gem candidates (<50 reviews, ≥4.0★): {} ({}% of low-review)", gems, pct);
        }
    }

    for (provider, found, with_coords) in ledger.coordinate_coverage()? {
        println!("\n{} coordinates: {} / {} found venues have coords", provider.label(), with_coords, found);
    }
    Ok(())
}
