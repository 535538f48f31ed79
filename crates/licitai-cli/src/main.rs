use std::io::IsTerminal;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use licitai_adapters::{cancellation, PageCursor, SyncWindow};
use licitai_core::{Flag, FlagUpdate, TenderState};
use licitai_storage::{update_flags, FileRecordStore, RecordStore};
use licitai_sync::{
    maybe_build_scheduler, report_recent_markdown, run_sync_once, RunError, SyncConfig,
    SyncPipeline,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "licitai")]
#[command(about = "LicitAI tender sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one synchronization over a date window (defaults to LICITAI_SYNC_DAYS ending today).
    Sync {
        #[arg(long)]
        from: Option<NaiveDate>,
        #[arg(long)]
        to: Option<NaiveDate>,
    },
    /// Serve the JSON API.
    Serve {
        #[arg(long, env = "LICITAI_WEB_PORT")]
        port: Option<u16>,
    },
    /// Run the cron scheduler until interrupted.
    Schedule,
    List {
        #[arg(long)]
        state: Option<TenderState>,
        #[arg(long)]
        flag: Option<Flag>,
    },
    /// Set or clear the user flags of one tender.
    Flag {
        id: String,
        #[arg(long, conflicts_with = "unfavorite")]
        favorite: bool,
        #[arg(long)]
        unfavorite: bool,
        #[arg(long, conflicts_with = "unarchive")]
        archive: bool,
        #[arg(long)]
        unarchive: bool,
    },
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    init_logging(&config.log_level);

    match cli.command.unwrap_or(Commands::Sync { from: None, to: None }) {
        Commands::Sync { from, to } => {
            let window = sync_window(&config, from, to)?;
            let (handle, token) = cancellation();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; cancelling sync run");
                    handle.cancel();
                }
            });
            match run_sync_once(&config, Some(window), &token).await {
                Ok(report) => {
                    println!(
                        "sync {}: run_id={} created={} updated={} unchanged={} scored={} failed={} reports={}",
                        report.status.as_str(),
                        report.run_id,
                        report.created,
                        report.updated,
                        report.unchanged,
                        report.scored,
                        report.failed(),
                        report.reports_dir.as_deref().unwrap_or("n/a")
                    );
                }
                Err(err) => {
                    if let Some(cursor) = resume_cursor(&err) {
                        eprintln!(
                            "next run over the same window resumes at {} page {}",
                            cursor.day, cursor.page
                        );
                    }
                    return Err(err);
                }
            }
        }
        Commands::Serve { port } => {
            licitai_web::serve_from_config(&config, port.unwrap_or(config.web_port)).await?;
        }
        Commands::Schedule => {
            let config = SyncConfig {
                scheduler_enabled: true,
                ..config
            };
            let pipeline = Arc::new(SyncPipeline::from_config(&config).await?);
            let Some(mut sched) = maybe_build_scheduler(pipeline, &config).await? else {
                anyhow::bail!("scheduler could not be built");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron_1 = %config.sync_cron_1, cron_2 = %config.sync_cron_2, "scheduler running");
            tokio::signal::ctrl_c().await.context("waiting for interrupt")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::List { state, flag } => {
            let store = FileRecordStore::open(config.store_dir()).await?;
            let mut tenders = match state {
                Some(state) => store.query_by_state(state).await?,
                None => match flag {
                    Some(flag) => store.query_by_flag(flag).await?,
                    None => store.all().await?,
                },
            };
            if let Some(flag) = flag {
                tenders.retain(|t| t.flags.is_set(flag));
            }
            for tender in tenders {
                let score = tender
                    .trusted_score()
                    .map(|(value, _)| format!("{value:.1}"))
                    .unwrap_or_else(|| "-".to_string());
                let mut marks = String::new();
                if tender.flags.favorited {
                    marks.push('*');
                }
                if tender.flags.archived {
                    marks.push('a');
                }
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    tender.id, tender.state, score, marks, tender.title
                );
            }
        }
        Commands::Flag {
            id,
            favorite,
            unfavorite,
            archive,
            unarchive,
        } => {
            let update = flag_update(favorite, unfavorite, archive, unarchive);
            if update.is_empty() {
                anyhow::bail!(
                    "nothing to change; pass --favorite/--unfavorite or --archive/--unarchive"
                );
            }
            let store = FileRecordStore::open(config.store_dir()).await?;
            let tender = update_flags(&store, &id, update).await?;
            println!(
                "{}: favorited={} archived={} state={}",
                tender.id, tender.flags.favorited, tender.flags.archived, tender.state
            );
        }
        Commands::Report { runs } => {
            println!("{}", report_recent_markdown(runs, &config.data_dir)?);
        }
    }

    Ok(())
}

fn sync_window(
    config: &SyncConfig,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> Result<SyncWindow> {
    let default = config.default_window();
    let from = from.unwrap_or(default.from);
    let to = to.unwrap_or(default.to);
    if from > to {
        anyhow::bail!("--from {from} is after --to {to}");
    }
    Ok(SyncWindow::new(from, to))
}

/// Where a run aborted by a source outage will pick up, when it got that far.
fn resume_cursor(err: &anyhow::Error) -> Option<PageCursor> {
    match err.downcast_ref::<RunError>()? {
        RunError::SourceUnavailable { resume_from, .. } => *resume_from,
        RunError::Auth { .. } => None,
    }
}

fn flag_update(favorite: bool, unfavorite: bool, archive: bool, unarchive: bool) -> FlagUpdate {
    let pick = |set: bool, clear: bool| match (set, clear) {
        (true, _) => Some(true),
        (false, true) => Some(false),
        (false, false) => None,
    };
    FlagUpdate {
        favorited: pick(favorite, unfavorite),
        archived: pick(archive, unarchive),
    }
}

/// Logs go to stderr only: ANSI text on a terminal, JSON when redirected.
/// `RUST_LOG` overrides the configured level.
fn init_logging(level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if std::io::stderr().is_terminal() {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(true),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .json(),
            )
            .init();
    }
}
