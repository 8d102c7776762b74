//! Luathread
//!
//! Runs Lua code on a worker thread managed from the main thread.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use luathread_runtime::{Input, Manager, ManagerBuilder, ManagerConfig, Outcome};

/// Lua worker host
#[derive(Parser, Debug)]
#[command(name = "luathread")]
#[command(about = "Run Lua code on a managed worker thread", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a script file and print its output and result
    Run {
        /// Lua file to run
        file: PathBuf,

        /// Manager configuration (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Print output as soon as the worker flushes it
        #[arg(long)]
        print_immediate: bool,

        /// JSON value passed to the script as `...`; repeatable
        #[arg(long = "arg", value_name = "JSON")]
        args: Vec<String>,
    },

    /// Read code from stdin line by line
    Repl {
        /// Manager configuration (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("luathread=info,luathread_runtime=info")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    // The manager belongs to this thread, so a current-thread runtime.
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(async_main(args))
}

async fn async_main(args: Args) -> Result<()> {
    match args.command {
        Command::Run {
            file,
            config,
            print_immediate,
            args,
        } => run_file(&file, config.as_deref(), print_immediate, &args).await,
        Command::Repl { config } => repl(config.as_deref()).await,
    }
}

fn load_config(path: Option<&Path>) -> Result<ManagerConfig> {
    match path {
        Some(path) => ManagerConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(ManagerConfig::default()),
    }
}

fn parse_script_args(raw_args: &[String]) -> Result<Vec<serde_json::Value>> {
    raw_args
        .iter()
        .map(|raw| {
            serde_json::from_str(raw).with_context(|| format!("--arg {} is not JSON", raw))
        })
        .collect()
}

async fn run_file(
    file: &Path,
    config: Option<&Path>,
    print_immediate: bool,
    raw_args: &[String],
) -> Result<()> {
    let mut config = load_config(config)?;
    config.print_immediate |= print_immediate;
    if config.name.is_none() {
        config.name = file.file_stem().map(|s| s.to_string_lossy().into_owned());
    }

    let code = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let script_args = parse_script_args(raw_args)?;

    let mut manager = ManagerBuilder::from_config(&config).spawn()?;
    info!("Running {} on worker {}", file.display(), manager.name());

    manager.send(Input::with_args(code, script_args))?;
    let outcome = manager.run_until_result().await;
    manager.flush_output();

    let failed = match outcome {
        Some(Outcome::Values(_)) => None,
        Some(Outcome::Error(message)) => Some(format!("script failed: {}", message)),
        Some(Outcome::Unavailable(reason)) => Some(format!("worker unavailable: {}", reason)),
        Some(Outcome::Cancelled) | None => Some("worker exited without a result".to_string()),
    };

    shutdown(manager).await?;

    if let Some(message) = failed {
        bail!(message);
    }
    Ok(())
}

async fn repl(config: Option<&Path>) -> Result<()> {
    let config = load_config(config)?;
    let reset_on_restart = config.reset_on_restart;
    let mut manager = ManagerBuilder::from_config(&config).spawn()?;
    info!("Worker {} ready", manager.name());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match line {
            ":quit" => break,
            ":restart" | ":reset" => {
                restart_worker(&mut manager, line == ":reset" || reset_on_restart).await?;
                debug!("Worker {} restarted", manager.name());
            }
            code => {
                manager.send(code)?;
                let outcome = manager.run_until_result().await;
                manager.flush_output();
                match outcome {
                    Some(Outcome::Unavailable(_)) | None => bail!("worker is gone"),
                    _ => {}
                }
            }
        }
    }

    shutdown(manager).await
}

/// Restart the worker and wait until it takes input again.
async fn restart_worker(manager: &mut Manager, reset: bool) -> Result<()> {
    manager.set_reset_on_restart(reset);
    manager.restart()?;
    // An empty input queues behind the restart and reports once it is done.
    manager.send("")?;
    let outcome = manager.run_until_result().await;
    manager.take_output();
    if !matches!(outcome, Some(Outcome::Values(_))) {
        manager.flush_output();
        bail!("worker did not come back after restart");
    }
    Ok(())
}

/// Clean cancel, then wait for the worker thread.
async fn shutdown(mut manager: Manager) -> Result<()> {
    if manager.cancel(true) {
        while manager.run_until_result().await.is_some() {}
    }
    manager.join()?;
    Ok(())
}
