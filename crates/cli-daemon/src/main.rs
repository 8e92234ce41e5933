//! CLI entry point for the relay daemon
//!
//! Queues the given sources, then either processes them and exits (default)
//! or keeps serving until interrupted (`--serve`).

use clap::Parser;
use relay_daemon::{
    Config, Daemon, DaemonError, DirectoryUploader, ProfileName, TaskStatus, TracingProgressSink,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Relay daemon - download, transcode to size budgets, deliver
#[derive(Parser, Debug)]
#[command(name = "relay-daemon")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml). Defaults plus
    /// environment overrides are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory finished artifacts are delivered to
    #[arg(short, long, default_value = "outbox")]
    outbox: PathBuf,

    /// Comma-separated quality profiles, e.g. 480p,720p. Defaults to every
    /// configured profile.
    #[arg(short, long, value_delimiter = ',')]
    profiles: Vec<ProfileName>,

    /// Name recorded as the submitter of queued tasks
    #[arg(long, default_value = "cli")]
    submitter: String,

    /// Keep running after the queue drains, until Ctrl-C
    #[arg(long, default_value = "false")]
    serve: bool,

    /// Skip startup checks (ffmpeg, ffprobe, aria2c). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// URLs, magnet links or local file paths to process
    sources: Vec<String>,
}

fn load_config(args: &Args) -> Result<Config, DaemonError> {
    match &args.config {
        Some(path) => Ok(Config::load(path)?),
        None => {
            let mut config = Config::default();
            config.apply_env_overrides();
            config.validate()?;
            Ok(config)
        }
    }
}

fn build_daemon(args: &Args) -> Result<Daemon, DaemonError> {
    let config = load_config(args)?;
    let uploader = Arc::new(DirectoryUploader::new(&args.outbox));
    let sink = Arc::new(TracingProgressSink);
    if args.skip_checks {
        warn!("skipping startup checks (--skip-checks enabled)");
        Ok(Daemon::new_without_checks(config, uploader, sink))
    } else {
        Daemon::with_config(config, uploader, sink)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    if args.sources.is_empty() && !args.serve {
        error!("nothing to do: pass at least one source or --serve");
        return ExitCode::FAILURE;
    }

    let daemon = match build_daemon(&args) {
        Ok(daemon) => Arc::new(daemon),
        Err(e) => {
            error!(error = %e, "failed to initialize daemon");
            return ExitCode::FAILURE;
        }
    };
    info!(
        config = ?args.config,
        outbox = %args.outbox.display(),
        status_listen = %daemon.config.status.listen,
        "relay daemon starting"
    );

    let profiles = if args.profiles.is_empty() {
        daemon.config.profiles.iter().map(|p| p.name).collect()
    } else {
        args.profiles.clone()
    };
    for source in &args.sources {
        match daemon.submit(&args.submitter, source, profiles.clone()).await {
            Ok(id) => info!(task_id = %id, source = %source, "queued"),
            Err(e) => {
                error!(error = %e, source = %source, "could not queue source");
                return ExitCode::FAILURE;
            }
        }
    }

    {
        let daemon = Arc::clone(&daemon);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                daemon.shutdown();
            }
        });
    }

    if args.serve {
        return match daemon.run().await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!(error = %e, "daemon error");
                ExitCode::FAILURE
            }
        };
    }

    match daemon.run_until_idle().await {
        Ok(reports) => {
            let completed = reports
                .iter()
                .filter(|r| r.status == TaskStatus::Completed)
                .count();
            info!(completed, total = args.sources.len(), "all tasks processed");
            if completed == args.sources.len() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            error!(error = %e, "daemon error");
            ExitCode::FAILURE
        }
    }
}
