use std::{error::Error, process, sync::Arc, time::Duration};

use clap::{command, Parser, ValueHint};
use log::{error, info, LevelFilter};

use biliget::{
    config::{Config, Secrets},
    gateway::Gateway,
    registry::Registry,
    task::{DownloadRequest, Orchestrator},
    util::format_size,
};

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// How often the progress line is refreshed.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Item id to download
    bvid: String,

    /// First page to download (1-based)
    #[arg(short = 's', long, default_value_t = 1)]
    start_page: u32,

    /// Last page to download
    ///
    /// [default: the item's last page]
    #[arg(short = 'e', long)]
    end_page: Option<u32>,

    /// Directory to write artifacts into
    #[arg(short, long, value_name = "DIR", value_hint = ValueHint::DirPath, default_value_t = String::from("downloads"))]
    output_dir: String,

    /// Secrets file
    ///
    /// Optional TOML file holding the session cookie. Without it the
    /// download runs anonymously at reduced link quality.
    #[arg(long, value_name = "FILE", value_hint = ValueHint::FilePath, default_value_t = String::from("secrets.toml"))]
    secrets_file: String,

    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,
}

/// Initializes the logger facade.
///
/// The logging level is determined as follows, in order of precedence from
/// highest to lowest:
/// 1. Command line arguments
/// 2. `RUST_LOG` environment variable
/// 3. Hard coded default
fn init_logger(args: &Args) {
    let mut logger = env_logger::Builder::from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if args.quiet || args.verbose > 0 {
        let level = match args.verbose {
            // Quiet and verbose are mutually exclusive, and `verbose` is 0
            // by default. So this arm means: quiet mode.
            0 => LevelFilter::Warn,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Filter log messages of external crates.
        logger.filter_module("biliget", level);
        logger.filter_module(module_path!(), level);
    }

    logger.init();
}

/// Runs one download to completion, polling the registry for progress.
///
/// # Errors
///
/// Returns an error when setup fails or the task ends in an error state.
async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let secrets = Secrets::from_file(&args.secrets_file)?;
    let config = Config::new(&args.output_dir, secrets);
    config.ensure_directories()?;

    let gateway = Arc::new(Gateway::new(&config)?);
    let registry = Arc::new(Registry::new());
    let orchestrator = Orchestrator::new(gateway, Arc::clone(&registry), config);

    let mut request = DownloadRequest::new(args.bvid);
    request.start_page = args.start_page;
    request.end_page = args.end_page;
    let task_id = orchestrator.spawn(request).task_id;

    let mut poll = tokio::time::interval(POLL_INTERVAL);
    loop {
        tokio::select! {
            biased;

            _ = tokio::signal::ctrl_c() => {
                info!("cancelling on interrupt");
                registry.request_cancel(&task_id);
                // Give the task a moment to observe the flag and stop
                // cleanly at its next step boundary.
                tokio::time::sleep(Duration::from_secs(1)).await;
                return Ok(());
            }

            _ = poll.tick() => {
                let Some(task) = registry.get(&task_id) else {
                    return Err("task disappeared from the registry".into());
                };

                if task.status.is_terminal() {
                    if let Some(message) = task.error_message {
                        return Err(message.into());
                    }
                    if let Some(path) = task.download_path {
                        info!("saved to {path}");
                    }
                    return Ok(());
                }

                info!(
                    "[{}] {} {:.1}% ({} of {}) {} eta {}",
                    task.status,
                    task.stage_message,
                    task.progress_percent,
                    format_size(task.current_bytes),
                    format_size(task.total_bytes),
                    task.speed_formatted,
                    task.eta_formatted,
                );
            }
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logger(&args);

    if let Err(e) = run(args).await {
        error!("{e}");
        process::exit(1);
    }
}
