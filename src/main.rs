//! Graphext CLI - batch text-to-knowledge-graph extraction.
//!
//! Run `graphext --help` for usage information.

use anyhow::Result;
use console::style;
use graphext::{
    Args, BatchParseJob, Config, HttpBackend, JobLog, LocalStorage, Parser, RateLimitPolicy,
};
use std::sync::Arc;
use tracing::{Level, error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse_args();

    // Setup logging
    setup_logging(&args);

    // Print banner
    if !args.json_logs {
        print_banner();
    }

    // Load configuration
    let config = match Config::from_args(&args) {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {}", e);
            eprintln!("{} {}", style("Error:").red().bold(), e);
            std::process::exit(1);
        }
    };

    // Validate data source exists
    if !args.data_source.is_dir() {
        error!("Data source not found: {:?}", args.data_source);
        eprintln!(
            "{} Data source is not a directory: {}",
            style("Error:").red().bold(),
            args.data_source.display()
        );
        std::process::exit(1);
    }

    // Load the rate-limit table (reloadable configuration, not code)
    let limits = match Config::load_limits(&args) {
        Ok(l) => l,
        Err(e) => {
            error!("Rate limit table error: {}", e);
            eprintln!("{} {}", style("Error:").red().bold(), e);
            std::process::exit(1);
        }
    };

    if args.verbose && !args.json_logs {
        print_config_summary(&args, &config, &limits);
    }

    // Build the parse pipeline
    let backend = HttpBackend::new(
        config.endpoint.url.clone(),
        config.endpoint.api_key.clone(),
    )?;
    let parser = Parser::new(backend, limits);
    let stats_handle = parser.clone();
    let log = JobLog::create(&config.job.log_file)?;
    let job = BatchParseJob::new(
        parser,
        Arc::new(LocalStorage),
        log,
        config.endpoint.model.clone(),
    )
    .with_dry_run(args.dry_run)
    .with_progress(!args.no_progress && !args.json_logs);

    info!(
        data_source = %args.data_source.display(),
        output = %args.output.display(),
        model = %config.endpoint.model,
        dry_run = args.dry_run,
        "Starting batch parse"
    );

    if args.dry_run && !args.json_logs {
        println!("\n{}", style("DRY RUN MODE").yellow().bold());
        println!("No output will be written.\n");
    }

    let summary = match job.run(&args.data_source, &args.output).await {
        Ok(summary) => summary,
        Err(e) => {
            error!("Batch parse failed: {}", e);
            eprintln!("{} {}", style("Error:").red().bold(), e);
            std::process::exit(1);
        }
    };

    // Print results
    if args.json_logs {
        // JSON output for programmatic consumption
        let json_result = serde_json::json!({
            "status": "complete",
            "files": summary.files,
            "failed_files": summary.failed_files,
            "chunks_succeeded": summary.chunks_succeeded,
            "chunks_skipped": summary.chunks_skipped,
            "chunks_failed": summary.chunks_failed,
        });
        println!("{}", serde_json::to_string(&json_result)?);
    } else {
        summary.print_summary();
        let stats = stats_handle.stats();
        println!(
            "  Avg Latency:      {:.1}ms | Throughput: {:.1} chunks/sec",
            stats.avg_latency_ms,
            stats.overall_rate()
        );
        println!(
            "\n{} Results saved under: {}",
            style("✓").green().bold(),
            args.output.display()
        );
        if summary.failed_files > 0 || summary.chunks_failed > 0 {
            println!(
                "{} Some inputs failed; see the job log: {}",
                style("⚠").yellow().bold(),
                config.job.log_file.display()
            );
        }
    }

    // Exit with error code if nothing succeeded
    if summary.chunks_succeeded == 0 && summary.chunks_skipped == 0 {
        std::process::exit(1);
    }

    Ok(())
}

fn setup_logging(args: &Args) {
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("graphext={level}")));

    if args.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .compact(),
            )
            .init();
    }
}

fn print_banner() {
    let banner = r"
   ______                 __              __
  / ____/________ _____  / /_  ___  _  __/ /_
 / / __/ ___/ __ `/ __ \/ __ \/ _ \| |/_/ __/
/ /_/ / /  / /_/ / /_/ / / / /  __/>  </ /_
\____/_/   \__,_/ .___/_/ /_/\___/_/|_|\__/
               /_/
    ";

    println!("{}", style(banner).cyan().bold());
    println!(
        "    {}",
        style("Text-to-Knowledge-Graph Batch Extraction").white().dim()
    );
    println!(
        "    {}",
        style(format!("v{}", graphext::VERSION)).white().dim()
    );
    println!();
}

fn print_config_summary(args: &Args, config: &Config, limits: &RateLimitPolicy) {
    println!("{}", style("Configuration:").bold());
    println!("  Data Source: {}", args.data_source.display());
    println!("  Output:      {}", args.output.display());
    println!("  Endpoint:    {}", config.endpoint.url);
    println!("  Model:       {}", config.endpoint.model);
    println!(
        "  Concurrency: {} (from rate-limit table)",
        limits.concurrency_budget(&config.endpoint.model)
    );
    println!("  Retries:     {}", config.retry.max_retries);
    println!("  Status File: {}", config.job.status_file.display());
    println!("  Job Log:     {}", config.job.log_file.display());
    println!();
}
