use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use colloquy_core::ids::{MessageId, SessionId};
use colloquy_core::message::{ChatInput, PartKind, ToolState};
use colloquy_engine::{
    ContextConfig, EngineConfig, GenerationConfig, GitSnapshots, LocalShare, NoShare, SessionRegistry,
    ShareService, ToolFilter, ToolRules,
};
use colloquy_llm::{EchoBackend, RetryPolicy};
use colloquy_settings::{load_settings, ColloquySettings, StorageBackend};
use colloquy_store::Store;
use colloquy_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "colloquy", about = "Conversational session engine")]
struct Cli {
    /// Working tree checkpointed around tool calls. Defaults to the current directory.
    #[arg(long, global = true)]
    worktree: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List sessions, newest first.
    Sessions,
    /// Create a session.
    New {
        #[arg(long)]
        parent: Option<String>,
    },
    /// Send a message and print the reply. Creates a session when none is given.
    Chat {
        #[arg(long)]
        session: Option<String>,
        text: String,
    },
    /// Print a session's transcript.
    Show { id: String },
    /// Remove a session and its descendants.
    Rm { id: String },
    /// Revert a session to a message boundary.
    Revert {
        id: String,
        message: String,
        #[arg(long, default_value_t = 0)]
        part: usize,
    },
    /// Undo a pending revert.
    Unrevert { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings().context("loading settings")?;
    let _telemetry = init_telemetry(TelemetryConfig::from_level_name(
        &settings.logging.level,
        settings.logging.json,
    ));

    let worktree = match cli.worktree {
        Some(path) => path,
        None => std::env::current_dir().context("resolving working directory")?,
    };
    let registry = build_registry(&settings, worktree)?;

    match cli.command {
        Command::Sessions => {
            for session in registry.list()? {
                let parent = session.parent_id.map(|p| format!(" (child of {p})")).unwrap_or_default();
                println!("{}  {}  {}{}", session.id, session.updated_at.to_rfc3339(), session.title, parent);
            }
        }
        Command::New { parent } => {
            let session = registry.create(parent.map(SessionId::from_raw)).await?;
            println!("{}", session.id);
        }
        Command::Chat { session, text } => {
            let session_id = match session {
                Some(id) => SessionId::from_raw(id),
                None => registry.create(None).await?.id,
            };
            let handle = registry.submit(&session_id, ChatInput::text(text)).await?;
            let reply = tokio::select! {
                reply = handle => reply,
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!(session_id = %session_id, "interrupted, aborting generation");
                    registry.shutdown();
                    bail!("generation aborted");
                }
            };
            match reply {
                Ok(message) => {
                    println!("{}", message.text());
                    eprintln!("session {session_id}");
                }
                Err(e) => bail!("chat failed: {e}"),
            }
        }
        Command::Show { id } => {
            let session_id = SessionId::from_raw(id);
            let session = registry.get(&session_id)?;
            println!("# {}", session.title);
            for message in registry.messages(&session_id)? {
                let role = if message.info.is_assistant() { "assistant" } else { "user" };
                println!("\n[{role} {}]", message.info.id);
                for part in &message.parts {
                    match &part.kind {
                        PartKind::Text { text, .. } => println!("{text}"),
                        PartKind::Tool { tool, state, .. } => println!("<{tool}: {}>", tool_status(state)),
                        PartKind::File { url, .. } => println!("<file {url}>"),
                        _ => {}
                    }
                }
            }
        }
        Command::Rm { id } => {
            registry.remove(&SessionId::from_raw(id)).await?;
        }
        Command::Revert { id, message, part } => {
            let info = registry
                .revert(&SessionId::from_raw(id), &MessageId::from_raw(message), part)
                .await?;
            if let Some(diff) = info.revert.and_then(|r| r.diff) {
                println!("{diff}");
            }
        }
        Command::Unrevert { id } => {
            let _ = registry.unrevert(&SessionId::from_raw(id)).await?;
        }
    }
    Ok(())
}

fn build_registry(settings: &ColloquySettings, worktree: PathBuf) -> Result<Arc<SessionRegistry>> {
    let data_dir = &settings.storage.data_dir;
    std::fs::create_dir_all(data_dir).with_context(|| format!("creating {}", data_dir.display()))?;
    let store = match settings.storage.backend {
        StorageBackend::File => Store::file(&data_dir.join("storage"))?,
        StorageBackend::Sqlite => Store::sqlite(&data_dir.join("colloquy.db"))?,
    };
    tracing::info!(data_dir = %data_dir.display(), backend = ?settings.storage.backend, "store opened");

    let generation = &settings.generation;
    let config = EngineConfig {
        generation: GenerationConfig {
            retry: RetryPolicy {
                max_retries: generation.max_retries,
                base_delay: Duration::from_millis(generation.retry_base_delay_ms),
                max_delay: Duration::from_millis(generation.retry_max_delay_ms),
                ..RetryPolicy::default()
            },
            max_steps: generation.max_steps,
            generate_titles: generation.generate_titles,
            tool_filter: ToolFilter::Except(settings.tools.disabled.iter().cloned().collect()),
            working_directory: worktree.clone(),
        },
        context: ContextConfig {
            summarize_at_percent: generation.summarize_at_percent,
            output_token_max: generation.output_token_max,
        },
        tool_timeout: Duration::from_millis(generation.tool_timeout_ms),
        auto_share: settings.share.auto,
        ..EngineConfig::default()
    };
    let share: Arc<dyn ShareService> = match &settings.share.base_url {
        Some(base) => Arc::new(LocalShare::new(base.clone())),
        None => Arc::new(NoShare),
    };

    Ok(SessionRegistry::builder(store, Arc::new(EchoBackend::new()))
        .snapshots(Arc::new(GitSnapshots::new(data_dir, &worktree)))
        .permission(Arc::new(ToolRules::deny(settings.tools.deny.iter().cloned())))
        .share(share)
        .config(config)
        .build())
}

fn tool_status(state: &ToolState) -> &'static str {
    match state {
        ToolState::Pending { .. } => "pending",
        ToolState::Running { .. } => "running",
        ToolState::Completed { .. } => "completed",
        ToolState::Error { .. } => "error",
    }
}
