// ==============================================================================
// main.rs - Variant Loader Entry Point
// ==============================================================================
// Description: Loads one VCF file for one study into the document store
// Author: Matt Barham
// Created: 2025-10-31
// Modified: 2026-10-18
// Version: 2.0.0
// ==============================================================================

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use variant_loader::audit::{self, AuditEventType};
use variant_loader::parsers::VcfRecordSource;
use variant_loader::resolver::StaticStudyResolver;
use variant_loader::store::{MemoryConnector, MemoryStore, PgConnector, StoreConnector};
use variant_loader::{FailurePolicy, LoadConfig, LoadSummary, SrcInclusionPolicy, VariantLoader};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// VCF file to load (.vcf or .vcf.gz)
    #[arg(short, long)]
    input: PathBuf,

    /// Numeric study identifier
    #[arg(long)]
    study_id: i32,

    /// Numeric file identifier
    #[arg(long)]
    file_id: i32,

    /// Human-readable study name used when decoding
    #[arg(long)]
    study_name: Option<String>,

    /// Records per batch
    #[arg(long, default_value_t = 100)]
    batch_size: usize,

    /// Documents per physical write (defaults to batch size)
    #[arg(long)]
    bulk_size: Option<usize>,

    /// 1 = serial load; P > 1 = pipeline with P - 1 writers
    #[arg(short, long, default_value_t = 1)]
    parallelism: usize,

    /// Transform workers in pipelined mode
    #[arg(long, default_value_t = 1)]
    transform_workers: usize,

    /// Capacity (in batches) of each pipeline queue
    #[arg(long, default_value_t = 8)]
    queue_capacity: usize,

    /// Raw source line policy (none, first_8_columns, full)
    #[arg(long, default_value = "none")]
    src_inclusion: String,

    /// Store the per-sample genotype table
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    include_genotypes: bool,

    /// Compute and store genotype statistics
    #[arg(long)]
    include_stats: bool,

    /// Genotype omitted from the compressed genotype table
    #[arg(long, default_value = "0/0")]
    default_genotype: String,

    /// Group samples by genotype instead of storing every sample verbatim
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    compress_genotypes: bool,

    /// Abort on the first failed batch instead of skipping it
    #[arg(long)]
    strict: bool,

    /// Give up waiting for pipeline workers after this many seconds
    #[arg(long)]
    join_timeout_secs: Option<u64>,

    /// Load into memory only; nothing is written to the database
    #[arg(long)]
    dry_run: bool,

    /// Database URL (or use DATABASE_URL_FILE env var)
    #[arg(long, env)]
    database_url: Option<String>,
}

impl Args {
    fn load_config(&self) -> LoadConfig {
        LoadConfig {
            batch_size: self.batch_size,
            bulk_size: self.bulk_size,
            parallelism: self.parallelism,
            transform_workers: self.transform_workers,
            queue_capacity: self.queue_capacity,
            src_inclusion: SrcInclusionPolicy::parse_lenient(&self.src_inclusion),
            include_genotypes: self.include_genotypes,
            include_stats: self.include_stats,
            default_genotype: self.default_genotype.clone(),
            compress_genotypes: self.compress_genotypes,
            failure_policy: if self.strict {
                FailurePolicy::Strict
            } else {
                FailurePolicy::Lenient
            },
            join_timeout_secs: self.join_timeout_secs,
        }
    }

    fn resolver(&self) -> StaticStudyResolver {
        match &self.study_name {
            Some(name) => StaticStudyResolver::new().with_study(self.study_id, name.clone()),
            None => StaticStudyResolver::new(),
        }
    }

    fn source(&self) -> VcfRecordSource {
        VcfRecordSource::new(
            &self.input,
            self.file_id.to_string(),
            self.study_id.to_string(),
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "variant_loader=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Variant Loader starting...");

    // Parse command line arguments
    let args = Args::parse();
    let config = args.load_config();

    let summary = if args.dry_run {
        info!("Dry run: documents are kept in memory");
        let store = MemoryStore::new();
        let summary = run(&args, config, MemoryConnector::new(store.clone())).await?;
        info!("Dry run produced {} documents", store.len());
        summary
    } else {
        load_into_postgres(&args, config).await?
    };

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn load_into_postgres(args: &Args, config: LoadConfig) -> Result<LoadSummary> {
    // Load database URL from file if DATABASE_URL_FILE is set
    let database_url = if let Some(url) = &args.database_url {
        url.clone()
    } else if let Ok(file_path) = std::env::var("DATABASE_URL_FILE") {
        std::fs::read_to_string(&file_path)
            .map_err(|e| anyhow::anyhow!("Failed to read DATABASE_URL_FILE: {}", e))?
            .trim()
            .to_string()
    } else {
        anyhow::bail!("DATABASE_URL or DATABASE_URL_FILE must be provided");
    };

    let sink_workers = u32::try_from(config.parallelism().max(2) - 1).unwrap_or(u32::MAX - 1);
    let connector = PgConnector::connect_url(&database_url, sink_workers)
        .await
        .context("Failed to connect to PostgreSQL")?;
    let pool = connector.pool().clone();

    audit::ensure_table(&pool)
        .await
        .context("Failed to create audit table")?;

    let load_id = Uuid::new_v4();
    let resource = Some(args.input.display().to_string());

    // Audit: Load started
    audit::log_event(
        &pool,
        AuditEventType::LoadStarted,
        load_id,
        args.study_id,
        resource.clone(),
        serde_json::json!({
            "file_id": args.file_id,
            "config": &config,
        }),
    )
    .await?;

    match run(args, config, connector).await {
        Ok(summary) => {
            // Audit: Skipped batches and completion
            for event in audit::completion_events(load_id, args.study_id, resource, &summary) {
                event.log(&pool).await?;
            }
            Ok(summary)
        }
        Err(e) => {
            // Audit: Load failed
            audit::log_event(
                &pool,
                AuditEventType::LoadFailed,
                load_id,
                args.study_id,
                resource,
                serde_json::json!({
                    "error": format!("{:#}", e),
                    "success": false,
                }),
            )
            .await?;

            Err(e)
        }
    }
}

async fn run<C>(args: &Args, config: LoadConfig, connector: C) -> Result<LoadSummary>
where
    C: StoreConnector,
{
    let loader = VariantLoader::new(config, connector, Arc::new(args.resolver()));

    let cancel = loader.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling load");
            cancel.cancel();
        }
    });

    match loader.load(args.source()).await {
        Ok(summary) => {
            info!(
                "Load completed: {} of {} records written as {} documents in {:.2}s ({} batches skipped)",
                summary.records_written,
                summary.records_read,
                summary.documents_written,
                summary.elapsed_secs,
                summary.skipped.len()
            );
            Ok(summary)
        }
        Err(e) => {
            error!("Load failed: {}", e);
            Err(e).context(format!("Failed to load {}", args.input.display()))
        }
    }
}
