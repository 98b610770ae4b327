//! Settlement Preview CLI
//!
//! Runs a preview against the billing API, prints the per-agreement figures,
//! optionally excludes services and confirms the settlement.

use anyhow::{anyhow, bail, Context, Result};
use billing_adapters::{AppConfig, HttpSettlementBackend};
use chrono::NaiveDate;
use clap::Parser;
use reconciler::{
    CacheHandle, InsurerId, PlanRuleSet, ServiceId, SettlementDraft, SettlementFilters,
    SettlementReconciler,
};
use std::{path::PathBuf, sync::Arc};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "settlement-preview", about = "Preview, reconcile and create an insurer settlement.")]
struct Args {
    /// TOML config with [reconciler] and [backend] sections; environment otherwise
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Insurer to settle
    #[arg(long)]
    insurer: i64,

    /// First day of the period (YYYY-MM-DD)
    #[arg(long)]
    from: NaiveDate,

    /// Last day of the period (YYYY-MM-DD)
    #[arg(long)]
    to: NaiveDate,

    /// JSON file with special rule sets; switches to a SPECIAL settlement
    #[arg(long)]
    special_rules: Option<PathBuf>,

    /// Service to exclude, as BASE_KEY:ID (repeatable)
    #[arg(long = "exclude", value_parser = parse_exclusion)]
    exclusions: Vec<(CacheHandle, ServiceId)>,

    /// Page through every agreement before printing
    #[arg(long)]
    load_all: bool,

    /// Print the draft as JSON instead of a table
    #[arg(long)]
    json: bool,

    /// Create the settlement after reconciling
    #[arg(long)]
    confirm: bool,
}

fn parse_exclusion(raw: &str) -> std::result::Result<(CacheHandle, ServiceId), String> {
    let (handle, id) = raw
        .rsplit_once(':')
        .ok_or_else(|| format!("expected BASE_KEY:ID, got '{}'", raw))?;
    let id: i64 = id
        .parse()
        .map_err(|e| format!("invalid service id '{}': {}", id, e))?;

    if handle.is_empty() {
        return Err(format!("missing base key in '{}'", raw));
    }
    Ok((CacheHandle::new(handle), ServiceId(id)))
}

fn load_config(path: Option<&PathBuf>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => {
            info!("Loading config from: {}", path.display());
            AppConfig::from_file(path)?
        }
        None => match std::env::var("SETTLEMENT_PREVIEW_CONFIG") {
            Ok(path) => {
                info!("Loading config from: {}", path);
                AppConfig::from_file(&path)?
            }
            Err(_) => {
                info!("Loading config from environment variables");
                AppConfig::from_env()?
            }
        },
    };
    Ok(config)
}

fn build_filters(args: &Args) -> Result<SettlementFilters> {
    let insurer = InsurerId(args.insurer);

    match &args.special_rules {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let rules: Vec<PlanRuleSet> = serde_json::from_str(&raw)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(SettlementFilters::special(insurer, args.from, args.to, rules))
        }
        None => Ok(SettlementFilters::simple(insurer, args.from, args.to)),
    }
}

/// Page through a handle until the service shows up, then exclude it
async fn exclude_by_search(
    reconciler: &mut SettlementReconciler<HttpSettlementBackend>,
    handle: &CacheHandle,
    id: ServiceId,
) -> Result<()> {
    let page_count = reconciler
        .draft()
        .and_then(|d| {
            d.aggregates
                .iter()
                .find(|a| &a.cache_handle == handle)
                .map(|a| a.page_count)
        })
        .ok_or_else(|| anyhow!("base key {} is not part of this preview", handle))?;

    for page_index in 0..page_count {
        let mut page = reconciler.get_page(handle, page_index).await?;
        if page.is_failed() {
            warn!("Page {}#{} failed, retrying once", handle, page_index);
            page = reconciler.retry_page(handle, page_index).await?;
        }

        if page.rows.iter().any(|row| row.id == id) {
            reconciler.exclude_rows(handle, [id])?;
            return Ok(());
        }
    }

    bail!("service {} not found under {}", id, handle)
}

fn print_draft(draft: &SettlementDraft) {
    println!(
        "Settlement {} | insurer {} | {} to {} | {}",
        draft.settlement_key,
        draft.insurer_id,
        draft.period_start,
        draft.period_end,
        draft.settlement_type
    );
    println!(
        "{:<24} {:<14} {:>7} {:>9} {:>9} {:>14} {:>10}",
        "plan", "period", "pages", "included", "excluded", "subtotal", "fee"
    );
    for aggregate in &draft.aggregates {
        println!(
            "{:<24} {:<14} {:>3}/{:<3} {:>9} {:>9} {:>14} {:>10}",
            aggregate.plan_name,
            aggregate.coverage_period_label,
            aggregate.fetched_pages,
            aggregate.page_count,
            aggregate.included_count,
            aggregate.excluded_count,
            aggregate.subtotal,
            aggregate.fee
        );
    }

    let totals = draft.totals();
    println!(
        "Total: {} services, {} excluded, amount {}",
        totals.total_included_count, totals.total_excluded_count, totals.total_amount
    );
    if draft.is_empty() {
        println!("Warning: the preview has no billable services");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;

    let backend = Arc::new(HttpSettlementBackend::new(config.backend)?);
    let mut reconciler = SettlementReconciler::new(backend, config.reconciler);

    let filters = build_filters(&args)?;
    reconciler.preview(&filters).await?;

    if args.load_all {
        let aggregates = reconciler
            .draft()
            .map(|d| d.aggregates)
            .unwrap_or_default();
        for aggregate in aggregates {
            for page_index in 0..aggregate.page_count {
                let page = reconciler
                    .get_page(&aggregate.cache_handle, page_index)
                    .await?;
                if page.is_failed() {
                    warn!("Page {}#{} could not be loaded", aggregate.cache_handle, page_index);
                }
            }
        }
    }

    for (handle, id) in &args.exclusions {
        exclude_by_search(&mut reconciler, handle, *id).await?;
    }

    let draft = reconciler
        .draft()
        .ok_or_else(|| anyhow!("preview produced no draft"))?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&draft)?);
    } else {
        print_draft(&draft);
    }

    if args.confirm {
        let settlement_id = reconciler.confirm_and_create().await?;
        println!("Created settlement {}", settlement_id);
    }

    Ok(())
}
