use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use clap::Parser;

use pagefeed::config::{self, LoggingConfig};
use pagefeed::cookies::DummyCookieStore;
use pagefeed::dates::ChronoDateParser;
use pagefeed::domain::Task;
use pagefeed::extract::{DnsCache, PageExtractor, PageExtractorConfig, SolverClient};
use pagefeed::infrastructure::logging;
use pagefeed::limiter::MemoryLeakyBucket;

/// Runs one extraction task from a JSON file, without queue, cache or
/// shared limiter state. Selector debugging lives here.
#[derive(Parser, Debug)]
#[command(name = "pagefeed-extract", version, about)]
struct Args {
    /// Task description file
    #[arg(default_value = "task.json")]
    task_file: PathBuf,

    /// Output file name (defaults to stdout)
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// Skip json output; show just logs
    #[arg(short = 's', long = "skip-output")]
    skip_output: bool,
}

/// Pinned clock so relative dates ("2 hours ago") produce stable output
/// across runs of the same page snapshot.
fn pinned_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 10, 10, 0, 0).unwrap()
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let config = config::load_config()?;
    let _log_guard = logging::init_tracing(&LoggingConfig {
        level: "debug".to_string(),
        logs_dir: config.logging.logs_dir.clone(),
    })?;

    let raw_task = std::fs::read(&args.task_file)
        .with_context(|| format!("open task file {}", args.task_file.display()))?;
    let task: Task = serde_json::from_slice(&raw_task).context("unmarshal task")?;

    let solver = SolverClient::new(&config.solver.url, config.solver.max_timeout_ms)
        .context("create solver client")?;
    let extractor = PageExtractor::new(
        PageExtractorConfig {
            proxy: config.proxy.clone(),
            max_timeout_ms: config.solver.max_timeout_ms,
            wait_seconds: config.solver.wait_seconds,
        },
        Arc::new(solver),
        Arc::new(ChronoDateParser::with_clock(pinned_now)),
        Arc::new(DummyCookieStore::new()),
        Arc::new(MemoryLeakyBucket::new(
            Duration::from_secs_f64(config.origin_limit.every_seconds),
            config.origin_limit.capacity,
        )),
        DnsCache::new(),
    )
    .await
    .context("create page extractor")?;

    let started = Instant::now();
    let result = extractor.extract(&task).await;
    tracing::info!(elapsed_ms = started.elapsed().as_millis() as u64, "extract finished");

    let result = match result {
        Ok(result) => result,
        Err(err) => {
            tracing::error!(error = %err, "extract failed, taking a screenshot for diagnosis");
            match extractor.screenshot(&task).await {
                Ok(shot) => {
                    std::fs::write("screenshot.png", &shot.image)
                        .context("save screenshot")?;
                    tracing::info!(bytes = shot.image.len(), "screenshot saved");
                }
                Err(shot_err) => {
                    tracing::error!(error = %shot_err, "screenshot failed too");
                }
            }
            return Err(err.into());
        }
    };

    if !args.skip_output {
        let rendered = serde_json::to_vec_pretty(&result).context("marshal result")?;
        match &args.output {
            Some(path) => {
                std::fs::write(path, &rendered)
                    .with_context(|| format!("write output {}", path.display()))?;
                tracing::info!(bytes = rendered.len(), path = %path.display(), "result written");
            }
            None => {
                println!("{}", String::from_utf8_lossy(&rendered));
            }
        }
    }
    Ok(())
}
