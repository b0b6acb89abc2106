use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use classnotes_sync::sync::TcpProbe;
use classnotes_sync::{
    HttpRemote, InMemoryRemote, Lesson, LessonRepository, RemoteDataService, Resolution,
    SyncClient, SyncConfig, SyncEvent, SyncOutcome,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "classnotes-sync")]
#[command(about = "Offline-first lesson store with background sync", long_about = None)]
struct Args {
    /// Directory holding classnotes-sync.toml and .env
    #[arg(long, default_value = ".")]
    config_dir: PathBuf,

    /// Data directory path (overrides the config file)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create, edit, remove or list lessons
    Lessons {
        #[command(subcommand)]
        action: LessonAction,
    },
    /// Show pending operations
    Queue,
    /// Show active conflicts
    Conflicts,
    /// Resolve a conflict
    Resolve {
        id: String,
        #[arg(long, value_enum)]
        keep: Keep,
    },
    /// Evict expired synced records from the cache
    Purge,
    /// Run one sync pass against the configured remote
    Sync,
    /// Keep syncing in the background until interrupted
    Watch,
}

#[derive(Subcommand, Debug)]
enum LessonAction {
    Add {
        title: String,
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        subject: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    Edit {
        id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        subject: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    Rm {
        id: String,
    },
    Ls,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Keep {
    Local,
    Remote,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "classnotes_sync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = SyncConfig::load(&args.config_dir)?;
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }

    let online = matches!(args.command, Command::Sync | Command::Watch);
    let remote = build_remote(&config, online)?;
    let client = Arc::new(SyncClient::open(&config, remote, online)?);
    tracing::debug!("Local store opened at {}", config.data_dir.display());

    match args.command {
        Command::Lessons { action } => run_lessons(client, action)?,
        Command::Queue => {
            let ops = client.pending_operations();
            if ops.is_empty() {
                println!("Queue is empty");
            }
            for op in ops {
                println!(
                    "#{:<6} {:<7} {:<38} retries={} queued={}",
                    op.sequence,
                    op.mutation.name(),
                    op.entity_id,
                    op.retry_count,
                    op.enqueued_at.to_rfc3339()
                );
            }
        }
        Command::Conflicts => {
            let conflicts = client.conflicts()?;
            if conflicts.is_empty() {
                println!("No conflicts");
            }
            for c in conflicts {
                let remote = c
                    .remote
                    .as_ref()
                    .map(|r| format!("v{} {}", r.version, r.payload))
                    .unwrap_or_else(|| "deleted".to_string());
                println!("{} [{}]", c.entity_id, c.conflict_type);
                println!("  local:  v{} {}", c.local.version, c.local.payload);
                println!("  remote: {}", remote);
            }
        }
        Command::Resolve { id, keep } => {
            let resolution = match keep {
                Keep::Local => Resolution::KeepLocal,
                Keep::Remote => Resolution::KeepRemote,
            };
            match client.resolve(&id, resolution)? {
                Some(record) => println!(
                    "{} is now v{} ({})",
                    id, record.version, record.sync_state
                ),
                None => println!("{} removed", id),
            }
        }
        Command::Purge => {
            let purged = client.purge_expired()?;
            println!("Purged {} expired records", purged);
        }
        Command::Sync => {
            match client.sync_now().await {
                SyncOutcome::Finished(status) => println!("{:?}", status),
                SyncOutcome::Skipped => println!("A sync is already running"),
            }
        }
        Command::Watch => watch(client, &config).await?,
    }

    Ok(())
}

fn build_remote(config: &SyncConfig, required: bool) -> anyhow::Result<Arc<dyn RemoteDataService>> {
    match &config.remote_url {
        Some(url) => {
            let mut remote = HttpRemote::new(url.as_str(), config.request_timeout())?;
            if let Some(token) = &config.auth_token {
                remote = remote.with_auth_token(token.as_str());
            }
            Ok(Arc::new(remote))
        }
        None if required => {
            anyhow::bail!(
                "remote_url is not configured \
                 (set it in classnotes-sync.toml or CLASSNOTES_REMOTE_URL)"
            )
        }
        // Local-only commands never reach the remote
        None => Ok(Arc::new(InMemoryRemote::new())),
    }
}

fn run_lessons(client: Arc<SyncClient>, action: LessonAction) -> anyhow::Result<()> {
    let repo = LessonRepository::new(client);
    match action {
        LessonAction::Add {
            title,
            id,
            subject,
            notes,
        } => {
            let mut lesson = Lesson::new(title);
            lesson.subject = subject;
            lesson.notes = notes.unwrap_or_default();
            let stored = repo.create(id, &lesson)?;
            println!("Created {}", stored.id);
        }
        LessonAction::Edit {
            id,
            title,
            subject,
            notes,
        } => {
            let Some(current) = repo.get(&id)? else {
                anyhow::bail!("Lesson '{}' not found", id);
            };
            let mut lesson = current.lesson;
            if let Some(title) = title {
                lesson.title = title;
            }
            if subject.is_some() {
                lesson.subject = subject;
            }
            if let Some(notes) = notes {
                lesson.notes = notes;
            }
            let stored = repo.update(&id, &lesson)?;
            println!("Updated {} (v{})", stored.id, stored.version);
        }
        LessonAction::Rm { id } => {
            repo.delete(&id)?;
            println!("Deleted {}", id);
        }
        LessonAction::Ls => {
            for stored in repo.list()? {
                println!(
                    "{:<38} v{:<4} [{}] {}",
                    stored.id, stored.version, stored.sync_state, stored.lesson.title
                );
            }
        }
    }
    Ok(())
}

async fn watch(client: Arc<SyncClient>, config: &SyncConfig) -> anyhow::Result<()> {
    let mut events = client.subscribe();
    client.start()?;

    if let Some(addr) = &config.probe_addr {
        tracing::info!("Probing connectivity via {}", addr);
        let probe = TcpProbe::new(addr.as_str(), config.request_timeout());
        client.start_probe(Arc::new(probe), config.probe_interval());
    }

    // Initial pass for anything queued while offline
    client.coordinator().trigger();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SyncEvent::StateChanged(status)) if status.is_terminal() => {
                    tracing::info!("Sync pass: {:?}", status);
                }
                Ok(SyncEvent::ConflictDetected(c)) => {
                    tracing::warn!("Conflict on {}: {}", c.entity_id, c.conflict_type);
                }
                Ok(SyncEvent::OperationDropped { operation, reason }) => {
                    tracing::warn!(
                        "Dropped {} of {}: {}",
                        operation.mutation.name(),
                        operation.entity_id,
                        reason
                    );
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("Missed {} sync events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            result = tokio::signal::ctrl_c() => {
                result?;
                tracing::info!("Shutdown signal received, stopping sync");
                break;
            }
        }
    }

    client.stop().await;
    Ok(())
}
