//! DeepCtx CLI - Main entry point

mod commands;
mod serve;

use clap::{Parser, Subcommand};
use deepctx_core::ContextEngine;
use deepctx_foundation::{ContextType, DeepCtxConfig, StorageBackend, WorkspaceId};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// DeepCtx - context budget & compression engine
#[derive(Parser, Debug)]
#[command(name = "deepctx")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// User namespace (overrides config)
    #[arg(long, global = true)]
    user: Option<String>,

    /// Data directory for the SQLite store (overrides config)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Keep everything in memory (nothing is persisted)
    #[arg(long, global = true)]
    memory: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Add an item to a workspace ("-" reads content from stdin)
    Add {
        workspace: WorkspaceId,
        content: String,
        #[arg(short = 't', long = "type", default_value = "message")]
        item_type: ContextType,
        #[arg(short, long, default_value = "3")]
        priority: u8,
        /// Source agent id
        #[arg(long)]
        agent: Option<String>,
        /// Thread id
        #[arg(long)]
        thread: Option<String>,
        /// Explicit item id (updates the item if it exists)
        #[arg(long)]
        id: Option<String>,
    },
    /// List items in a workspace
    List {
        workspace: WorkspaceId,
        #[arg(short = 't', long = "type")]
        types: Vec<ContextType>,
    },
    /// Show a single item
    Show { workspace: WorkspaceId, id: String },
    /// Remove an item
    Remove { workspace: WorkspaceId, id: String },
    /// Change priorities atomically (ID=PRIORITY ...)
    Reorder {
        workspace: WorkspaceId,
        #[arg(required = true, value_parser = commands::parse_priority_update)]
        updates: Vec<deepctx_foundation::PriorityUpdate>,
    },
    /// Select items within a token budget
    Select {
        workspace: WorkspaceId,
        #[arg(short, long)]
        budget: usize,
        #[arg(short, long, default_value = "")]
        query: String,
        #[arg(short = 't', long = "type")]
        types: Vec<ContextType>,
        #[arg(long)]
        recency_bias: Option<f32>,
        #[arg(long)]
        threshold: Option<f32>,
    },
    /// Preview (or commit) a compression down to a target token count
    Compress {
        workspace: WorkspaceId,
        #[arg(long)]
        target: usize,
        /// minimal, balanced or aggressive (default from config)
        #[arg(short, long)]
        strategy: Option<String>,
        #[arg(long, default_value = commands::DEFAULT_SESSION)]
        session: String,
        /// Apply the result (a checkpoint is created first)
        #[arg(long)]
        commit: bool,
    },
    /// Create a checkpoint
    Checkpoint {
        workspace: WorkspaceId,
        label: String,
        #[arg(long, default_value = commands::DEFAULT_SESSION)]
        session: String,
    },
    /// List checkpoints of a session
    Checkpoints {
        workspace: WorkspaceId,
        #[arg(long, default_value = commands::DEFAULT_SESSION)]
        session: String,
    },
    /// Restore a checkpoint into a new branch (the workspace is untouched)
    Restore {
        workspace: WorkspaceId,
        checkpoint: String,
        #[arg(long, default_value = commands::DEFAULT_SESSION)]
        session: String,
    },
    /// List branches of a session
    Branches {
        workspace: WorkspaceId,
        #[arg(long, default_value = commands::DEFAULT_SESSION)]
        session: String,
    },
    /// Replace the workspace with a branch (a checkpoint is created first)
    Checkout {
        workspace: WorkspaceId,
        branch: String,
        #[arg(long, default_value = commands::DEFAULT_SESSION)]
        session: String,
    },
    /// Delete all but the newest checkpoints
    Cleanup {
        workspace: WorkspaceId,
        #[arg(long, default_value = "10")]
        keep: usize,
        #[arg(long, default_value = commands::DEFAULT_SESSION)]
        session: String,
    },
    /// Workspace statistics
    Stats { workspace: WorkspaceId },
    /// Delete a workspace permanently
    DeleteWorkspace { workspace: WorkspaceId },
    /// List workspaces
    Workspaces,
    /// Copy items from source workspaces into a target workspace
    Synthesize {
        #[arg(long = "from", required = true)]
        sources: Vec<WorkspaceId>,
        #[arg(long = "into")]
        target: WorkspaceId,
        #[arg(short = 't', long = "type")]
        types: Vec<ContextType>,
    },
    /// Serve JSON-lines requests on stdin/stdout
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // stdout은 결과/프로토콜 전용이므로 로그는 stderr로
    let log_level = if args.debug { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let config = load_config(&args)?;
    let engine = ContextEngine::from_config(config)?;

    let out = commands::Output { json: args.json };
    match args.command {
        Command::Add {
            workspace,
            content,
            item_type,
            priority,
            agent,
            thread,
            id,
        } => {
            let input = commands::AddInput {
                content,
                item_type,
                priority,
                agent,
                thread,
                id,
            };
            commands::add(&engine, &out, &workspace, input).await
        }
        Command::List { workspace, types } => {
            commands::list(&engine, &out, &workspace, types).await
        }
        Command::Show { workspace, id } => commands::show(&engine, &out, &workspace, &id).await,
        Command::Remove { workspace, id } => {
            commands::remove(&engine, &out, &workspace, &id).await
        }
        Command::Reorder { workspace, updates } => {
            commands::reorder(&engine, &out, &workspace, &updates).await
        }
        Command::Select {
            workspace,
            budget,
            query,
            types,
            recency_bias,
            threshold,
        } => {
            let mut options = deepctx_core::SelectOptions::new();
            if !types.is_empty() {
                options = options.with_types(types);
            }
            if let Some(bias) = recency_bias {
                options = options.with_recency_bias(bias);
            }
            if let Some(threshold) = threshold {
                options = options.with_threshold(threshold);
            }
            commands::select(&engine, &out, &workspace, &query, budget, &options).await
        }
        Command::Compress {
            workspace,
            target,
            strategy,
            session,
            commit,
        } => {
            let input = commands::CompressInput {
                target,
                strategy,
                session,
                commit,
            };
            commands::compress(&engine, &out, &workspace, input).await
        }
        Command::Checkpoint {
            workspace,
            label,
            session,
        } => commands::checkpoint(&engine, &out, &workspace, &session, &label).await,
        Command::Checkpoints { workspace, session } => {
            commands::checkpoints(&engine, &out, &workspace, &session).await
        }
        Command::Restore {
            workspace,
            checkpoint,
            session,
        } => commands::restore(&engine, &out, &workspace, &session, &checkpoint).await,
        Command::Branches { workspace, session } => {
            commands::branches(&engine, &out, &workspace, &session).await
        }
        Command::Checkout {
            workspace,
            branch,
            session,
        } => commands::checkout(&engine, &out, &workspace, &session, &branch).await,
        Command::Cleanup {
            workspace,
            keep,
            session,
        } => commands::cleanup(&engine, &out, &workspace, &session, keep).await,
        Command::Stats { workspace } => commands::stats(&engine, &out, &workspace).await,
        Command::DeleteWorkspace { workspace } => {
            commands::delete_workspace(&engine, &out, &workspace).await
        }
        Command::Workspaces => commands::workspaces(&engine, &out).await,
        Command::Synthesize {
            sources,
            target,
            types,
        } => commands::synthesize(&engine, &out, &sources, &target, types).await,
        Command::Serve => serve::run(engine).await,
    }
}

/// 설정 파일 로드 후 명령줄 옵션 적용
fn load_config(args: &Args) -> anyhow::Result<DeepCtxConfig> {
    let mut config = DeepCtxConfig::load().unwrap_or_else(|e| {
        eprintln!("Warning: Failed to load config: {}", e);
        DeepCtxConfig::new()
    });

    if let Some(user) = &args.user {
        config = config.with_user(user.clone());
    }
    if let Some(dir) = &args.data_dir {
        config = config.with_data_dir(dir.clone());
    }
    if args.memory {
        config = config.with_backend(StorageBackend::Memory);
    }
    tracing::debug!(
        user = config.user_id(),
        data_dir = %config.data_dir().display(),
        "Configuration loaded"
    );
    Ok(config)
}
