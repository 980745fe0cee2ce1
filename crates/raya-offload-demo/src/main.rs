//! async-io: offload a blocking write from a light-task
//!
//! A light-task hands a write to stdout to one of the IO pool's OS threads
//! and awaits its result. The scheduler worker stays free while the write
//! runs; the light-task resumes once the IO thread reports back.

use anyhow::{Context, Result};
use clap::Parser;
use raya_offload::{OffloadExecutor, Runtime, RuntimeConfig, ShutdownPolicy};
use std::io::{self, Write};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "async-io")]
#[command(about = "Run a blocking write on an IO thread and await it from a light-task", long_about = None)]
#[command(version)]
struct Cli {
    /// Runtime config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Scheduler worker threads (0 = number of CPU cores)
    #[arg(short, long)]
    workers: Option<usize>,

    /// IO pool threads
    #[arg(short, long)]
    io_threads: Option<usize>,

    /// Line to write from the IO thread
    #[arg(short, long, default_value = "Write this string to stdout")]
    message: String,
}

/// Runs on an IO pool thread; may block in the kernel
fn do_async_io(message: &str) -> io::Result<u32> {
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "OS-thread: {message}")?;
    stdout.flush()?;
    Ok(1)
}

/// Runs as a light-task; suspends until the IO thread is done
async fn async_io(executor: OffloadExecutor, message: String) -> Result<u32> {
    let result = executor
        .submit_fallible(move || do_async_io(&message))
        .context("Failed to submit IO work")?
        .await
        .context("IO work failed")?;

    anyhow::ensure!(result == 1, "unexpected IO result {result}");
    Ok(result)
}

fn load_config(cli: &Cli) -> Result<RuntimeConfig> {
    let mut config = match &cli.config {
        Some(path) => RuntimeConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => RuntimeConfig::default(),
    };

    if let Some(workers) = cli.workers {
        config.scheduler.workers = workers;
    }
    if let Some(threads) = cli.io_threads {
        config.io_pool.threads = threads;
    }
    config.validate()?;
    tracing::debug!(?config, "runtime config");
    Ok(config)
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let runtime = Runtime::new(config).context("Failed to start runtime")?;
    let executor = runtime.executor();
    let message = cli.message;

    let result = runtime
        .block_on(async move { async_io(executor, message).await })
        .context("Light-task did not finish")??;

    println!("light-task: the asynchronous IO operation returned: {result}");

    runtime.shutdown(ShutdownPolicy::Drain);
    Ok(())
}
