//! Main Entrypoint for the Lumen voice assistant
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment and the command line.
//! 2. Opening the conversation store (Postgres when configured, memory otherwise).
//! 3. Wiring the tool dispatcher, the Gemini Live client and the audio devices
//!    into a session controller.
//! 4. Running a small line-based console until `/quit` or Ctrl+C.

use anyhow::Context;
use clap::Parser;
use gemini_realtime::GeminiLiveClient;
use lumen::audio::cpal_backend::CpalBackend;
use lumen::config::{Config, load_system_prompt};
use lumen::db::PgStore;
use lumen::session::{SessionController, SessionDeps, SessionEvent, SessionHandle};
use lumen_core::confirmation::{PendingConfirmation, SubjectKind};
use lumen_core::context::{ContextBuilder, DEFAULT_INSTRUCTIONS};
use lumen_core::store::{ConversationStore, MemoryStore};
use lumen_core::tools::{Collaborators, standard_dispatcher};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "lumen", about = "Lumen - live voice assistant", version)]
struct Cli {
    /// Directory holding `system_prompt.md`. Overrides PROMPTS_PATH.
    #[arg(long)]
    prompts_path: Option<PathBuf>,
    /// Connect as soon as the console starts.
    #[arg(long)]
    auto_connect: bool,
}

const HELP: &str = "Commands: /connect, /disconnect, /mic on|off, \
/remind task|event <id> <text>, /status, /quit. Anything else is sent as a text turn.";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // --- 1. Load Configuration ---
    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(path) = cli.prompts_path {
        config.prompts_path = path;
    }

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!(model = %config.model, voice = %config.voice, "Configuration loaded");

    // --- 3. Conversation store ---
    let store: Arc<dyn ConversationStore> = match &config.database_url {
        Some(url) => {
            let db = PgStore::connect(url)
                .await
                .context("Failed to connect to database")?;
            db.run_migrations().await?;
            info!("Database connection established and migrations are up-to-date.");
            Arc::new(db)
        }
        None => {
            warn!("DATABASE_URL not set, conversations will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    // --- 4. Session wiring ---
    let instructions = match load_system_prompt(&config.prompts_path) {
        Ok(Some(prompt)) => prompt,
        Ok(None) => DEFAULT_INSTRUCTIONS.to_string(),
        Err(e) => {
            warn!(error = ?e, "Failed to read system prompt, using the built-in one");
            DEFAULT_INSTRUCTIONS.to_string()
        }
    };
    let collaborators = Collaborators::in_memory();
    let dispatcher = standard_dispatcher(&collaborators);
    let context = ContextBuilder::new(
        instructions,
        Some(config.voice.clone()),
        dispatcher.declarations(),
    );

    let session = SessionController::spawn(SessionDeps {
        provider: Arc::new(GeminiLiveClient::new(
            config.gemini_api_key.clone(),
            config.model.clone(),
        )),
        audio: Arc::new(CpalBackend::new()),
        store,
        dispatcher: Arc::new(dispatcher),
        planner: collaborators.planner.clone(),
        context,
    });

    tokio::spawn(print_events(session.clone()));

    if cli.auto_connect {
        if let Err(e) = session.connect().await {
            warn!(error = %e, "Automatic connect failed");
        }
    }

    // --- 5. Console ---
    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) => {
                        if !handle_line(&session, line.trim()).await {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal. Shutting down gracefully...");
                break;
            }
        }
    }

    let _ = session.disconnect(true).await;
    info!("Lumen has shut down.");
    Ok(())
}

/// Returns `false` when the console should exit.
async fn handle_line(session: &SessionHandle, line: &str) -> bool {
    let result = match line.split_whitespace().next() {
        None => Ok(()),
        Some("/quit") => return false,
        Some("/connect") => session.connect().await,
        Some("/disconnect") => session.disconnect(true).await,
        Some("/status") => {
            println!("{:?}", session.status());
            Ok(())
        }
        Some("/mic") => match line.split_whitespace().nth(1) {
            Some("on") => session.set_listening(true).await,
            Some("off") => session.set_listening(false).await,
            _ => {
                println!("Usage: /mic on|off");
                Ok(())
            }
        },
        Some("/remind") => match parse_reminder(line) {
            Some((subject, text)) => session.speak_reminder(subject, text).await,
            None => {
                println!("Usage: /remind task|event <id> <text>");
                Ok(())
            }
        },
        Some(cmd) if cmd.starts_with('/') => {
            println!("{HELP}");
            Ok(())
        }
        Some(_) => session.send_text_turn(line).await,
    };
    if let Err(e) = result {
        println!("! {e}");
    }
    true
}

fn parse_reminder(line: &str) -> Option<(PendingConfirmation, String)> {
    let mut parts = line.splitn(4, ' ');
    parts.next()?;
    let kind = match parts.next()? {
        "task" => SubjectKind::Task,
        "event" => SubjectKind::Event,
        _ => return None,
    };
    let subject_id = parts.next()?.to_string();
    let text = parts.next()?.trim().to_string();
    if text.is_empty() {
        return None;
    }
    Some((PendingConfirmation { kind, subject_id }, text))
}

async fn print_events(session: SessionHandle) {
    let mut events = session.subscribe();
    loop {
        match events.recv().await {
            Ok(SessionEvent::TurnClosed(turn)) => println!("[{}] {}", turn.author, turn.text),
            Ok(SessionEvent::StatusMessage(msg)) => println!("* {msg}"),
            Ok(SessionEvent::Error(msg)) => println!("! {msg}"),
            Ok(SessionEvent::ToolInvoked { name, .. }) => println!("~ {name}"),
            Ok(SessionEvent::TurnUpdated(_)) => {}
            Err(RecvError::Lagged(n)) => warn!(skipped = n, "Console fell behind session events"),
            Err(RecvError::Closed) => break,
        }
    }
}
