//! chengyu-clips command-line interface
//!
//! Runs the pipeline and answers operator queries. Query results are
//! printed to stdout as JSON; logs go to stderr.

use chengyu_clips::commands;
use chengyu_clips::config::AppConfig;
use chengyu_clips::error::AppError;
use chengyu_clips::executors::ToolExecutors;
use chengyu_clips::App;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::Instrument;

/// Build an idiom clip library from a folder of episodes
#[derive(Parser, Debug)]
#[command(name = "chengyu-clips")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to config.yaml (default: <data dir>/config.yaml)
    #[arg(short, long, global = true, env = "CHENGYU_CLIPS_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scan the source directory and register new, changed and moved files
    Scan,
    /// Process registered files through audio, transcript, idioms and clips
    Run {
        /// Make one pass over pending work and exit
        #[arg(long)]
        once: bool,
    },
    /// Stage status by fingerprint (prefix allowed) or episode
    Status {
        fingerprint: Option<String>,
        #[arg(short, long)]
        episode: Option<i64>,
        /// Include superseded files when listing
        #[arg(long)]
        all: bool,
    },
    /// Files grouped by state
    Queue {
        /// Full file lists instead of counts
        #[arg(long)]
        full: bool,
    },
    /// Most frequent idioms
    Top {
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },
    /// Every occurrence of one idiom, with clip references
    Occurrences { idiom: String },
    /// Canonical and raw text of one occurrence
    Provenance { occurrence_id: i64 },
    /// Give a blocked or failed file a fresh attempt budget
    Retry { fingerprint: String },
    /// Stop starting new stages (persisted)
    Pause,
    /// Undo `pause`
    Resume,
    /// Check the frequency index against the occurrence set
    Verify,
    /// Rebuild the frequency index from occurrences and lift a halt
    Reconcile,
    /// Blocked files and halted aggregation
    Alerts,
    /// Recent pipeline errors
    Errors {
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },
    /// Rejected detections, optionally for one fingerprint
    Rejections {
        #[arg(short, long)]
        fingerprint: Option<String>,
        #[arg(short, long, default_value = "50")]
        limit: i64,
    },
    /// Pipeline and library counts
    Stats,
    /// Check tools, model and Ollama
    Diagnostics,
    /// Show all settings, one setting, or set one
    Settings {
        key: Option<String>,
        value: Option<String>,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<(), AppError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        log::error!("{}", e);
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let config = AppConfig::load(cli.config.as_deref())?;
    let app = App::open(config)?;
    let result = dispatch(&app, cli.command).await;
    if let Err(e) = app.shutdown() {
        log::warn!("Failed to close database cleanly: {}", e);
    }
    result
}

async fn dispatch(app: &App, command: Commands) -> Result<(), AppError> {
    let registry = app.registry();
    let aggregator = app.aggregator();

    match command {
        Commands::Scan => {
            let report = registry.sync(&app.config.raw_video_dir())?;
            print_json(&report)
        }
        Commands::Run { once } => run_pipeline(app, once).await,
        Commands::Status {
            fingerprint,
            episode,
            all,
        } => match (fingerprint, episode) {
            (Some(fp), _) => print_json(&commands::get_file_status(&registry, &fp)?),
            (None, Some(ep)) => print_json(&commands::get_episode_status(&registry, ep)?),
            (None, None) => print_json(&commands::list_files(&registry, all)?),
        },
        Commands::Queue { full } => {
            if full {
                print_json(&commands::get_queue(&registry)?)
            } else {
                print_json(&commands::get_queue_status(&registry)?)
            }
        }
        Commands::Top { limit } => print_json(&commands::get_top_idioms(&app.db, Some(limit))?),
        Commands::Occurrences { idiom } => {
            print_json(&commands::get_idiom_occurrences(&aggregator, idiom.trim())?)
        }
        Commands::Provenance { occurrence_id } => {
            print_json(&commands::get_provenance(&aggregator, occurrence_id)?)
        }
        Commands::Retry { fingerprint } => {
            let fingerprint = commands::resolve_fingerprint(&registry, &fingerprint)?;
            let reset = commands::retry_file(&registry, &fingerprint)?;
            print_json(&serde_json::json!({ "fingerprint": fingerprint, "stages_reset": reset }))
        }
        Commands::Pause => {
            commands::pause_pipeline(&app.db)?;
            print_json(&serde_json::json!({ "paused": true }))
        }
        Commands::Resume => {
            commands::resume_pipeline(&app.db)?;
            print_json(&serde_json::json!({ "paused": false }))
        }
        Commands::Verify => print_json(&commands::verify_index(&aggregator)?),
        Commands::Reconcile => print_json(&commands::reconcile_index(&aggregator)?),
        Commands::Alerts => print_json(&commands::get_alerts(&registry, &aggregator)?),
        Commands::Errors { limit } => print_json(&commands::get_recent_errors(&app.db, Some(limit))?),
        Commands::Rejections { fingerprint, limit } => {
            let fingerprint = match fingerprint {
                Some(fp) => Some(commands::resolve_fingerprint(&registry, &fp)?),
                None => None,
            };
            print_json(&commands::get_rejections(
                &app.db,
                fingerprint.as_deref(),
                Some(limit),
            )?)
        }
        Commands::Stats => print_json(&commands::get_pipeline_stats(&app.db)?),
        Commands::Diagnostics => {
            let tools = ToolExecutors::from_config(&app.config);
            print_json(&commands::get_diagnostics(&app.config, &app.db, &tools).await?)
        }
        Commands::Settings { key, value } => match (key, value) {
            (Some(key), Some(value)) => {
                commands::set_setting(&app.db, &key, &value)?;
                print_json(&serde_json::json!({ "key": key, "value": value }))
            }
            (Some(key), None) => print_json(&commands::get_setting(&app.db, &key)?),
            (None, _) => print_json(&commands::get_all_settings(&app.db)?),
        },
    }
}

async fn run_pipeline(app: &App, once: bool) -> Result<(), AppError> {
    let tools = Arc::new(ToolExecutors::from_config(&app.config));
    let controller = app.controller(tools);
    let handle = controller.handle();

    if commands::is_paused(&app.db)? {
        log::warn!("Pipeline is paused; run `chengyu-clips resume` to start processing");
    }

    // First Ctrl-C finishes the current stage, the second kills it.
    let signal_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        log::info!("Interrupt received, stopping after the current stage (again to stop now)");
        signal_handle.shutdown();
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_handle.stop();
        }
    });

    let span = tracing::info_span!("pipeline", worker = %controller.worker_id());
    let last_run = async {
        if once {
            controller.recover()?;
            let report = controller.sync_sources().await?;
            log::info!(
                "Scan: {} registered, {} changed, {} moved, {} superseded",
                report.registered,
                report.changed,
                report.renamed,
                report.superseded
            );
            Ok::<_, AppError>(Some(controller.run_once().await?))
        } else {
            controller.run().await;
            Ok(None)
        }
    }
    .instrument(span)
    .await?;

    print_json(&commands::get_worker_status(&handle, last_run).await)
}
