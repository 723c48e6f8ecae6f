//! ifrisk CLI: ingest, normalize, score and inspect IF.data periods.
//!
//! Commands:
//! - `ingest`: download reports for a period into the fact store (resumable)
//! - `normalize`: map raw facts onto canonical metrics
//! - `score`: score canonical metrics into risk assessments
//! - `run`: ingest, normalize and score in one go
//! - `audit`: list the most frequent labels and the rules they hit
//! - `export`: write a period's assessments as CSV
//! - `checkpoints`: show stored download checkpoints

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use ifrisk_core::config::PipelineConfig;
use ifrisk_core::data::{
    detect_latest_period, Cursor, Endpoints, FileCheckpointStore, HttpTransport, LogProgress,
    PaginationMode, ResilientFetcher, RunSummary,
};
use ifrisk_core::domain::{Period, RiskInput};
use ifrisk_core::pipeline::{ingest_period, normalize_period, score_period};
use ifrisk_core::semantic::audit;
use ifrisk_core::store::{FactStore, JsonStore};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "ifrisk",
    about = "ifrisk: IF.data ingestion, normalization and risk scoring"
)]
struct Cli {
    /// Path to a TOML config file. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download reports for a period into the fact store.
    Ingest(IngestArgs),
    /// Map a period's raw facts onto canonical metrics.
    Normalize(PeriodArgs),
    /// Score a period's canonical metrics.
    Score(PeriodArgs),
    /// Ingest, normalize and score one period.
    Run(IngestArgs),
    /// List the most frequent labels of a period and the rules they hit.
    Audit {
        #[command(flatten)]
        target: PeriodArgs,

        /// Number of labels to show.
        #[arg(long, default_value_t = 400)]
        limit: usize,
    },
    /// Write a period's risk assessments as CSV.
    Export {
        #[command(flatten)]
        target: PeriodArgs,

        /// Output file. Writes to stdout when omitted.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Show stored download checkpoints.
    Checkpoints {
        /// Checkpoint directory. Overrides the config file.
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,
    },
}

#[derive(Args)]
struct StorageArgs {
    /// Fact store directory. Overrides the config file.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Checkpoint directory. Overrides the config file.
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,
}

#[derive(Args)]
struct PeriodArgs {
    /// Period as YYYYMM, YYYY-MM or YYYY-MM-DD; "latest" picks the newest stored period.
    #[arg(long, default_value = "latest")]
    period: String,

    /// Fact store directory. Overrides the config file.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum PaginationArg {
    Offset,
    Link,
}

#[derive(Args)]
struct IngestArgs {
    /// Period as YYYYMM, YYYY-MM or YYYY-MM-DD; "latest" asks upstream for the newest one.
    #[arg(long, default_value = "latest")]
    period: String,

    /// Institution type (TipoInstituicao).
    #[arg(long)]
    entity_type: Option<u32>,

    /// Comma-separated report ids, e.g. "1,4,5".
    #[arg(long)]
    reports: Option<String>,

    /// Initial page size; smaller sizes from the configured ladder remain as fallbacks.
    #[arg(long)]
    page_size: Option<usize>,

    /// Rows per committed batch.
    #[arg(long)]
    batch_size: Option<usize>,

    /// Read timeout in seconds.
    #[arg(long)]
    timeout: Option<f64>,

    /// Ignore stored checkpoints and download every report from the start.
    #[arg(long, default_value_t = false)]
    restart: bool,

    /// Pagination strategy for fresh reports.
    #[arg(long, value_enum)]
    pagination: Option<PaginationArg>,

    /// Log the keys and contents of the first row of each report.
    #[arg(long, default_value_t = false)]
    debug_sample: bool,

    #[command(flatten)]
    storage: StorageArgs,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => PipelineConfig::default(),
    };

    match cli.command {
        Commands::Ingest(args) => {
            let summary = run_ingest(config, &args)?;
            exit_on_failures(&summary);
            Ok(())
        }
        Commands::Run(args) => run_full(config, &args),
        Commands::Normalize(target) => run_normalize(&config, &target),
        Commands::Score(target) => run_score(&config, &target),
        Commands::Audit { target, limit } => run_audit(&config, &target, limit),
        Commands::Export { target, output } => run_export(&config, &target, output.as_deref()),
        Commands::Checkpoints { checkpoint_dir } => {
            let dir = checkpoint_dir.unwrap_or(config.storage.checkpoint_dir);
            run_checkpoints(&dir)
        }
    }
}

/// Fold CLI overrides into the loaded config.
fn apply_ingest_overrides(config: &mut PipelineConfig, args: &IngestArgs) -> Result<()> {
    if let Some(entity_type) = args.entity_type {
        config.ingest.entity_type = entity_type;
    }
    if let Some(reports) = &args.reports {
        let list: Vec<String> = reports
            .split(',')
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect();
        if list.is_empty() {
            bail!("--reports is empty");
        }
        config.ingest.reports = list;
    }
    if let Some(page_size) = args.page_size {
        if page_size == 0 {
            bail!("--page-size must be positive");
        }
        config.ingest.page_sizes = config.ingest.ladder_from(Some(page_size));
    }
    if let Some(batch_size) = args.batch_size {
        if batch_size == 0 {
            bail!("--batch-size must be positive");
        }
        config.ingest.batch_size = batch_size;
    }
    if let Some(timeout) = args.timeout {
        if !(timeout.is_finite() && timeout > 0.0) {
            bail!("--timeout must be a positive number of seconds");
        }
        config.upstream.timeouts = config.upstream.timeouts.clone().with_read_secs(timeout);
    }
    if let Some(mode) = args.pagination {
        config.ingest.pagination = match mode {
            PaginationArg::Offset => PaginationMode::Offset,
            PaginationArg::Link => PaginationMode::Link,
        };
    }
    if args.restart {
        config.ingest.resume = false;
    }
    if args.debug_sample {
        config.ingest.debug_sample = true;
    }
    if let Some(dir) = &args.storage.data_dir {
        config.storage.data_dir = dir.clone();
    }
    if let Some(dir) = &args.storage.checkpoint_dir {
        config.storage.checkpoint_dir = dir.clone();
    }
    Ok(())
}

fn run_ingest(mut config: PipelineConfig, args: &IngestArgs) -> Result<RunSummary> {
    apply_ingest_overrides(&mut config, args)?;

    let transport = HttpTransport::new(&config.upstream.timeouts)?;
    let fetcher = ResilientFetcher::new(
        Arc::new(transport),
        config.upstream.retry.clone(),
        config.upstream.timeouts.clone(),
    );
    let endpoints = Endpoints::new(config.upstream.base_url.clone());

    let period = if args.period.eq_ignore_ascii_case("latest") {
        let today = chrono::Local::now().date_naive();
        let Some((period, detected_type)) = detect_latest_period(
            &fetcher,
            &endpoints,
            &config.detect.sample_report,
            &config.detect.entity_types,
            today,
            config.detect.quarters,
        ) else {
            bail!("could not detect a published period; pass --period explicitly");
        };
        if args.entity_type.is_none() {
            config.ingest.entity_type = detected_type;
        }
        period
    } else {
        args.period.parse::<Period>()?
    };

    info!(
        %period,
        entity_type = config.ingest.entity_type,
        reports = ?config.ingest.reports,
        base_url = endpoints.base(),
        "starting ingestion"
    );

    let store = JsonStore::new(&config.storage.data_dir);
    let checkpoints = FileCheckpointStore::new(&config.storage.checkpoint_dir);
    let summary = ingest_period(
        &fetcher,
        &endpoints,
        &checkpoints,
        &store,
        &config.ingest,
        config.upstream.registry_page_size,
        period,
        &LogProgress,
    );

    print_ingest_summary(&summary);
    if summary.all_succeeded() {
        let kept = store.compact_raw_facts(period)?;
        info!(%period, facts = kept, "fact segments compacted");
    }
    Ok(summary)
}

fn run_full(config: PipelineConfig, args: &IngestArgs) -> Result<()> {
    let rules = config.classifier.load_rules()?;
    let data_dir = args
        .storage
        .data_dir
        .clone()
        .unwrap_or_else(|| config.storage.data_dir.clone());

    let summary = run_ingest(config, args)?;
    let store = JsonStore::new(&data_dir);
    let norm = normalize_period(&store, &rules, summary.period)?;
    println!("Normalized {} entities from {} facts", norm.entities, norm.facts_read);
    let scored = score_period(&store, summary.period)?;
    print_score_summary(&scored);

    exit_on_failures(&summary);
    Ok(())
}

fn open_store(config: &PipelineConfig, target: &PeriodArgs) -> Result<(JsonStore, Period)> {
    let dir = target
        .data_dir
        .clone()
        .unwrap_or_else(|| config.storage.data_dir.clone());
    let store = JsonStore::new(dir);
    let period = resolve_stored_period(&store, &target.period)?;
    Ok((store, period))
}

fn resolve_stored_period(store: &JsonStore, requested: &str) -> Result<Period> {
    if !requested.eq_ignore_ascii_case("latest") {
        return Ok(requested.parse()?);
    }
    match store.periods()?.last() {
        Some(period) => Ok(*period),
        None => bail!("no periods stored under {}", store.root().display()),
    }
}

fn run_normalize(config: &PipelineConfig, target: &PeriodArgs) -> Result<()> {
    let rules = config.classifier.load_rules()?;
    let (store, period) = open_store(config, target)?;
    let report = normalize_period(&store, &rules, period)?;

    println!("Period:   {}", report.period);
    println!("Facts:    {}", report.facts_read);
    println!("Entities: {}", report.entities);
    for (metric, count) in &report.resolved {
        println!("  {:<18} {:>6}", metric.as_str(), count);
    }
    Ok(())
}

fn run_score(config: &PipelineConfig, target: &PeriodArgs) -> Result<()> {
    let (store, period) = open_store(config, target)?;
    let report = score_period(&store, period)?;
    print_score_summary(&report);
    Ok(())
}

fn run_audit(config: &PipelineConfig, target: &PeriodArgs, limit: usize) -> Result<()> {
    let rules = config.classifier.load_rules()?;
    let (store, period) = open_store(config, target)?;
    let facts = store.raw_facts(period)?;
    if facts.is_empty() {
        println!("No raw facts for {period}");
        return Ok(());
    }

    for row in audit(&facts, &rules, Some(limit)) {
        let hits: Vec<&str> = row.hits.iter().map(|m| m.as_str()).collect();
        println!("[{:>6}] {} -> [{}]", row.count, row.raw_label, hits.join(", "));
    }
    Ok(())
}

fn run_export(config: &PipelineConfig, target: &PeriodArgs, output: Option<&Path>) -> Result<()> {
    let (store, period) = open_store(config, target)?;
    let assessments = store.assessments(period)?;
    if assessments.is_empty() {
        bail!("no assessments for {period}; run `score` first");
    }

    let sink: Box<dyn Write> = match output {
        Some(path) => Box::new(
            std::fs::File::create(path)
                .with_context(|| format!("creating {}", path.display()))?,
        ),
        None => Box::new(std::io::stdout().lock()),
    };
    let mut writer = csv::Writer::from_writer(sink);

    let mut header = vec![
        "period".to_string(),
        "entity_id".into(),
        "entity_name".into(),
        "score".into(),
        "rating".into(),
    ];
    for input in RiskInput::ALL {
        header.push(input.as_str().to_string());
        header.push(format!("{}_penalty", input.as_str()));
    }
    writer.write_record(&header)?;

    for a in &assessments {
        let mut record = vec![
            a.period.to_string(),
            a.entity_id.clone(),
            a.entity_name.clone(),
            a.score.to_string(),
            a.rating.to_string(),
        ];
        for input in RiskInput::ALL {
            let driver = a.drivers.get(&input);
            record.push(
                driver
                    .and_then(|d| d.value)
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
            );
            record.push(driver.map(|d| d.contribution.to_string()).unwrap_or_default());
        }
        writer.write_record(&record)?;
    }
    writer.flush()?;

    if let Some(path) = output {
        eprintln!("Exported {} assessments to {}", assessments.len(), path.display());
    }
    Ok(())
}

fn run_checkpoints(dir: &Path) -> Result<()> {
    let store = FileCheckpointStore::new(dir);
    let entries = store.list();
    if entries.is_empty() {
        println!("No checkpoints in {}", dir.display());
        return Ok(());
    }

    println!("Checkpoints: {}", dir.display());
    println!();
    println!(
        "{:<8} {:>4} {:<8} {:>9} {:<28} {:<20}",
        "Period", "Type", "Report", "PageSize", "Position", "Updated"
    );
    println!("{}", "-".repeat(82));
    for (key, cp) in &entries {
        let position = match &cp.cursor {
            Cursor::Done => "done".to_string(),
            Cursor::Offset { skip } => format!("offset {skip}"),
            Cursor::Link {
                token: None,
                skip,
                variant,
            } => format!("first page +{skip} (form {variant})"),
            Cursor::Link {
                token: Some(_),
                skip,
                variant,
            } => format!("next link +{skip} (form {variant})"),
        };
        println!(
            "{:<8} {:>4} {:<8} {:>9} {:<28} {:<20}",
            key.period.to_string(),
            key.entity_type,
            key.report_id,
            cp.page_size,
            position,
            cp.updated_at.format("%Y-%m-%d %H:%M:%S").to_string()
        );
    }
    Ok(())
}

fn print_ingest_summary(summary: &RunSummary) {
    println!();
    println!("=== Ingestion {} (type {}) ===", summary.period, summary.entity_type);
    println!(
        "{:<8} {:>10} {:>9} {:>10} {:>9} {:>8} {:>8}",
        "Report", "Rows", "Skipped", "Upserted", "Entities", "Batches", "PageSz"
    );
    println!("{}", "-".repeat(68));
    for r in &summary.reports {
        println!(
            "{:<8} {:>10} {:>9} {:>10} {:>9} {:>8} {:>8}",
            r.report_id,
            r.rows_downloaded,
            r.rows_skipped(),
            r.facts_upserted,
            r.unique_entities,
            r.batches_committed,
            r.final_page_size
        );
    }
    println!();
    println!(
        "Reports: {} ok ({} already drained), {} failed, {} total",
        summary.succeeded, summary.already_drained, summary.failed, summary.total
    );
    println!("Facts upserted: {}", summary.facts_upserted());
}

fn print_score_summary(report: &ifrisk_core::pipeline::ScoreReport) {
    println!();
    println!("=== Risk scores {} ===", report.period);
    println!("Entities: {}", report.entities);
    println!("HIGH:     {}", report.high);
    println!("MEDIUM:   {}", report.medium);
    println!("LOW:      {}", report.low);
    println!("Digest:   {}", report.digest);
}

fn exit_on_failures(summary: &RunSummary) {
    if !summary.all_succeeded() {
        for (report, err) in &summary.errors {
            eprintln!("Error for report {report}: {err}");
        }
        std::process::exit(1);
    }
}
