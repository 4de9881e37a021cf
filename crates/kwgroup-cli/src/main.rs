//! kwgroup: command-line front end for keyword ingestion and grouping.
//!
//! Every command prints its result as JSON on stdout; logs go to stderr
//! or to `LOG_FILE`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use kwgroup_core::defaults::BACKFILL_BATCH_SIZE;
use kwgroup_db::{Database, FilesystemBlobStore, PoolConfig};
use kwgroup_jobs::{Orchestrator, OrchestratorConfig, Repositories};

#[derive(Parser)]
#[command(name = "kwgroup")]
#[command(author, version, about = "Keyword CSV ingestion and signature grouping")]
#[command(propagate_version = true)]
struct Cli {
    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL", default_value = "postgres://localhost/kwgroup")]
    database_url: String,

    /// Directory holding uploaded CSV files
    #[arg(long, env = "BLOB_STORAGE_PATH", default_value = "/var/lib/kwgroup/files")]
    storage_path: PathBuf,

    /// User recorded in the activity log
    #[arg(long, env = "KWGROUP_USER")]
    user: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending database migrations
    Migrate,

    /// Manage projects
    Project {
        #[command(subcommand)]
        command: ProjectCommands,
    },

    /// Upload a keyword CSV and queue it for ingestion
    Enqueue {
        project: Uuid,
        /// CSV file to upload
        file: PathBuf,
        /// Drain the queue before exiting
        #[arg(long)]
        process: bool,
    },

    /// Drain the project's queue in the foreground
    Process { project: Uuid },

    /// Show queue, lease and keyword counts
    Status { project: Uuid },

    /// Fail every pending job and clear the processing lease
    Reset { project: Uuid },

    /// Merge child tokens into a parent token
    Merge {
        project: Uuid,
        parent: String,
        #[arg(required = true, num_args = 1..)]
        children: Vec<String>,
    },

    /// Undo every merge into a parent token
    Unmerge { project: Uuid, parent: String },

    /// Put keywords into one named manual group
    Regroup {
        project: Uuid,
        /// Name of the group; becomes the parent keyword
        #[arg(short, long)]
        name: String,
        #[arg(required = true, num_args = 1..)]
        keywords: Vec<Uuid>,
    },

    /// Take keywords out of their groups
    Ungroup {
        project: Uuid,
        #[arg(required = true, num_args = 1..)]
        keywords: Vec<Uuid>,
    },

    /// Block every keyword containing a token
    Block { project: Uuid, token: String },

    /// Restore keywords blocked on a token
    Unblock { project: Uuid, token: String },

    /// Confirm groups by parent keyword id
    Confirm {
        project: Uuid,
        #[arg(required = true, num_args = 1..)]
        parents: Vec<Uuid>,
    },

    /// Move confirmed groups back to grouped
    Unconfirm {
        project: Uuid,
        #[arg(required = true, num_args = 1..)]
        parents: Vec<Uuid>,
    },

    /// Re-tokenize stored keywords with the current tokenizer and merges
    Backfill {
        project: Uuid,
        #[arg(long, default_value_t = BACKFILL_BATCH_SIZE)]
        batch_size: i64,
        /// Report what would change without writing
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
enum ProjectCommands {
    /// Create a project
    Create { name: String },
    /// Delete a project and all of its data
    Delete { project: Uuid },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let _log_guard = init_tracing();

    let db = Database::connect_with_config(&cli.database_url, PoolConfig::from_env())
        .await
        .context("failed to connect to database")?;
    let user = cli.user.as_deref();

    match cli.command {
        Commands::Migrate => {
            db.migrate().await.context("migration failed")?;
            info!(subsystem = "cli", "Migrations applied");
        }
        Commands::Project { command } => match command {
            ProjectCommands::Create { name } => {
                let id = db.projects.create(&name).await?;
                print_json(&serde_json::json!({ "project_id": id, "name": name }))?;
            }
            ProjectCommands::Delete { project } => {
                let deleted = db.projects.delete(project).await?;
                print_json(&serde_json::json!({ "deleted": deleted }))?;
            }
        },
        Commands::Enqueue {
            project,
            file,
            process,
        } => {
            let orchestrator = orchestrator(&db, &cli.storage_path).await?;
            let content = tokio::fs::read(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let (job, created) = orchestrator
                .submit_upload(project, &file_name(&file), &content, user)
                .await?;
            print_json(&serde_json::json!({ "job": job, "created": created }))?;
            if process {
                drain(&orchestrator, project).await?;
            }
        }
        Commands::Process { project } => {
            let orchestrator = orchestrator(&db, &cli.storage_path).await?;
            drain(&orchestrator, project).await?;
        }
        Commands::Status { project } => {
            let orchestrator = orchestrator(&db, &cli.storage_path).await?;
            print_json(&orchestrator.status(project).await?)?;
        }
        Commands::Reset { project } => {
            let orchestrator = orchestrator(&db, &cli.storage_path).await?;
            let failed = orchestrator.reset(project, user).await?;
            print_json(&serde_json::json!({ "failed_jobs": failed }))?;
        }
        Commands::Merge {
            project,
            parent,
            children,
        } => {
            print_json(&db.merges.merge(project, &parent, &children, user).await?)?;
        }
        Commands::Unmerge { project, parent } => {
            print_json(&db.merges.unmerge(project, &parent, user).await?)?;
        }
        Commands::Regroup {
            project,
            name,
            keywords,
        } => {
            print_json(&db.grouping.regroup(project, &keywords, &name, user).await?)?;
        }
        Commands::Ungroup { project, keywords } => {
            let ungrouped = db.grouping.ungroup(project, &keywords, user).await?;
            print_json(&serde_json::json!({ "ungrouped": ungrouped }))?;
        }
        Commands::Block { project, token } => {
            let blocked = db.grouping.block_token(project, &token, user).await?;
            print_json(&serde_json::json!({ "blocked": blocked }))?;
        }
        Commands::Unblock { project, token } => {
            let unblocked = db.grouping.unblock_token(project, &token, user).await?;
            print_json(&serde_json::json!({ "unblocked": unblocked }))?;
        }
        Commands::Confirm { project, parents } => {
            let updated = db.grouping.confirm_groups(project, &parents).await?;
            print_json(&serde_json::json!({ "updated": updated }))?;
        }
        Commands::Unconfirm { project, parents } => {
            let updated = db.grouping.unconfirm_groups(project, &parents).await?;
            print_json(&serde_json::json!({ "updated": updated }))?;
        }
        Commands::Backfill {
            project,
            batch_size,
            dry_run,
        } => {
            if batch_size < 1 {
                bail!("--batch-size must be at least 1");
            }
            print_json(&db.backfill.run(project, batch_size, dry_run).await?)?;
        }
    }
    Ok(())
}

/// Orchestrator over the database pool and filesystem storage.
///
/// Runs are always driven in the foreground here, so background kicks are
/// disabled.
async fn orchestrator(db: &Database, storage_path: &Path) -> anyhow::Result<Orchestrator> {
    let blobs = FilesystemBlobStore::new(storage_path);
    blobs
        .validate()
        .await
        .with_context(|| format!("blob storage at {} is not usable", storage_path.display()))?;
    Ok(Orchestrator::new(
        Repositories::postgres(db.pool().clone()),
        Arc::new(blobs),
        OrchestratorConfig::from_env().with_enabled(false),
    ))
}

async fn drain(orchestrator: &Orchestrator, project_id: Uuid) -> anyhow::Result<()> {
    match orchestrator.process(project_id).await? {
        Some(summary) => print_json(&summary),
        None => bail!("project {project_id} is being processed by another worker"),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .and_then(|f| f.to_str())
        .unwrap_or("upload.csv")
        .to_string()
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Initialize tracing.
///
/// Environment variables:
///   LOG_FORMAT  - "json" or "text" (default: "text")
///   LOG_FILE    - path to log file (optional, daily rotation)
///   RUST_LOG    - standard env filter (default: "kwgroup=info")
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "kwgroup=info".into());
    let registry = tracing_subscriber::registry().with(env_filter);

    if let Some(ref path) = log_file {
        let path = Path::new(path);
        let file_dir = path.parent().unwrap_or(Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("kwgroup.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json().with_writer(non_blocking))
                .init();
        } else {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false),
                )
                .init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .init();
        } else {
            registry
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
        None
    }
}
