//! Palaver CLI
//!
//! Command-line interface for the Palaver chat bot

mod console;
mod logging;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::ConsoleChannel;
use palaver_config::Config;
use palaver_core::{ProviderGateway, ResponseComposer, SessionDispatcher, TurnOutcome};
use palaver_events::{
    EventBus, InboundEvent, InstantPacer, OutboundChannel, Paced, Pacer, TokioPacer,
};
use palaver_messenger::webhook::{self, WebhookPayload};
use palaver_messenger::MessengerChannel;
use palaver_policy::PolicyEngine;
use palaver_storage::{ConversationStore, MemoryStore, Storage};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

const DB_FILE: &str = "palaver.db";

#[derive(Parser)]
#[command(name = "palaver")]
#[command(about = "Per-sender conversational chat bot", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (overrides core.log_level; RUST_LOG overrides both)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration and test provider connections
    Check,

    /// Interactive console conversation
    Chat {
        /// Sender id to converse as
        #[arg(short, long, default_value = "console")]
        sender: String,
        /// Keep state in memory instead of the database
        #[arg(long)]
        memory: bool,
        /// Skip typing and follow-up delays
        #[arg(long)]
        fast: bool,
    },

    /// Process recorded inbound events or Messenger webhook payloads (one JSON object per line)
    Replay {
        /// JSONL file of inbound events or webhook payloads
        file: PathBuf,
        /// Print replies instead of sending them through Messenger
        #[arg(long)]
        console: bool,
        /// Keep state in memory instead of the database
        #[arg(long)]
        memory: bool,
        /// Dispatch every event at once, as live webhooks arrive; events for a
        /// sender whose turn is still running are dropped
        #[arg(long)]
        live: bool,
    },

    /// Show the stored state of a sender
    State {
        /// Sender id
        sender: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.clone())?;
    let data_dir = config.data_dir()?;
    std::fs::create_dir_all(&data_dir)?;

    let log_level = cli
        .log_level
        .clone()
        .or_else(|| config.core.log_level.clone())
        .unwrap_or_else(|| "info".to_string());
    let _logging_guard = logging::init_logging(&data_dir.join("logs"), &log_level)?;

    match cli.command {
        Commands::Check => run_check(&config).await?,
        Commands::Chat {
            sender,
            memory,
            fast,
        } => run_chat(&config, &data_dir, &sender, memory, fast).await?,
        Commands::Replay {
            file,
            console,
            memory,
            live,
        } => run_replay(&config, &data_dir, &file, console, memory, live).await?,
        Commands::State { sender } => {
            let storage = Storage::new(data_dir.join(DB_FILE))?;
            match storage.get(&sender).await? {
                Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
                None => println!("No state stored for sender '{}'", sender),
            }
        }
    }

    Ok(())
}

fn load_config(config_path: Option<String>) -> Result<Config> {
    if let Some(path) = config_path {
        Config::load(&path).with_context(|| format!("Failed to load config from {}", path))
    } else if let Some(default_path) = Config::default_path() {
        Config::load(&default_path)
            .with_context(|| format!("Failed to load config from {}", default_path.display()))
    } else {
        anyhow::bail!("No config file found")
    }
}

fn key_preview(api_key: &str) -> String {
    let chars: Vec<char> = api_key.chars().collect();
    if chars.len() > 8 {
        format!(
            "{}...{}",
            chars[..4].iter().collect::<String>(),
            chars[chars.len() - 4..].iter().collect::<String>()
        )
    } else {
        "***".to_string()
    }
}

fn open_store(data_dir: &Path, memory: bool) -> Result<Arc<dyn ConversationStore>> {
    if memory {
        return Ok(Arc::new(MemoryStore::new()));
    }
    Ok(Arc::new(Storage::new(data_dir.join(DB_FILE))?))
}

fn build_dispatcher(
    config: &Config,
    store: Arc<dyn ConversationStore>,
    channel: Arc<dyn OutboundChannel>,
) -> SessionDispatcher {
    SessionDispatcher::new(
        store,
        Arc::new(ProviderGateway::from_config(config)),
        channel,
        ResponseComposer::from_config(config),
    )
    .with_policy(PolicyEngine::new(config.policy.as_ref()))
}

async fn run_check(config: &Config) -> Result<()> {
    println!("Configuration is valid.\n");

    match &config.messenger {
        Some(_) => {
            let channel = MessengerChannel::from_config(config)?;
            println!("Messenger endpoint: {}", channel.endpoint());
        }
        None => println!("Messenger: not configured (console only)"),
    }
    println!(
        "Pacing: typing {} ms (+{} ms alternate locale), follow-up after {} ms",
        config.pacing.typing_delay_ms,
        config.pacing.alternate_offset_ms,
        config.pacing.follow_up_quiet_ms
    );
    println!();

    let gateway = ProviderGateway::from_config(config);
    let router = gateway.router();
    if router.provider_names().is_empty() {
        println!("No providers configured.");
        return Ok(());
    }

    let mut success_count = 0;
    let mut fail_count = 0;
    for provider_config in &config.providers.providers {
        println!("Provider: {}", provider_config.name);
        println!(
            "  Type: {}",
            provider_config.provider_type.as_deref().unwrap_or("openai")
        );
        if let Some(model) = &provider_config.model {
            println!("  Model: {}", model);
        }
        println!("  API Key: {}", key_preview(&provider_config.api_key));

        let Some(provider) = router.get_provider(Some(&provider_config.name)) else {
            continue;
        };
        match provider.health_check().await {
            Ok(true) => {
                println!("  ✓ SUCCESS: Connection OK");
                success_count += 1;
            }
            Ok(false) => {
                println!("  ✗ FAILED: Health check returned false");
                fail_count += 1;
            }
            Err(e) => {
                println!("  ✗ FAILED: {}", e);
                fail_count += 1;
            }
        }
        println!();
    }

    println!("Summary: {} passed, {} failed", success_count, fail_count);
    Ok(())
}

/// `/qr <payload>` and `/img <url>` select the event kind; anything else is text.
fn parse_console_line(sender: &str, line: &str) -> InboundEvent {
    if let Some(payload) = line.strip_prefix("/qr ") {
        InboundEvent::quick_reply(sender, payload.trim())
    } else if let Some(url) = line.strip_prefix("/img ") {
        InboundEvent::image(sender, url.trim())
    } else {
        InboundEvent::text(sender, line)
    }
}

async fn run_chat(
    config: &Config,
    data_dir: &Path,
    sender: &str,
    memory: bool,
    fast: bool,
) -> Result<()> {
    let pacer: Arc<dyn Pacer> = if fast {
        Arc::new(InstantPacer)
    } else {
        Arc::new(TokioPacer)
    };
    let channel = Arc::new(Paced::new(ConsoleChannel, pacer));
    let dispatcher = build_dispatcher(config, open_store(data_dir, memory)?, channel);

    println!("Chatting as '{}'. /qr <payload>, /img <url>, /quit to leave.", sender);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" || line == "/exit" {
            break;
        }

        if let TurnOutcome::Dropped(reason) = dispatcher.handle(parse_console_line(sender, line)).await {
            println!("(event dropped: {:?})", reason);
        }
    }

    Ok(())
}

/// A line holding an `object` field is a Messenger webhook payload; anything
/// else is a serialized `InboundEvent`.
fn parse_replay_line(line: &str) -> Result<Vec<InboundEvent>> {
    let value: serde_json::Value = serde_json::from_str(line)?;
    if value.get("object").is_some() {
        let payload: WebhookPayload = serde_json::from_value(value)?;
        return Ok(webhook::normalize(&payload));
    }
    Ok(vec![InboundEvent::from_json(line)?])
}

fn read_events(file: &Path) -> Result<Vec<InboundEvent>> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let mut events = Vec::new();
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let parsed = parse_replay_line(line)
            .with_context(|| format!("{}:{}: invalid event", file.display(), index + 1))?;
        events.extend(parsed);
    }
    Ok(events)
}

async fn run_replay(
    config: &Config,
    data_dir: &Path,
    file: &Path,
    console: bool,
    memory: bool,
    live: bool,
) -> Result<()> {
    let events = read_events(file)?;

    let channel: Arc<dyn OutboundChannel> = if console {
        Arc::new(Paced::new(ConsoleChannel, Arc::new(InstantPacer)))
    } else {
        Arc::new(Paced::new(
            MessengerChannel::from_config(config)?,
            Arc::new(TokioPacer),
        ))
    };
    let dispatcher = Arc::new(build_dispatcher(
        config,
        open_store(data_dir, memory)?,
        channel,
    ));

    let (bus, inbound) = EventBus::channel();
    let runtime = if live {
        tokio::spawn(palaver_core::run(dispatcher, inbound))
    } else {
        tokio::spawn(palaver_core::run_ordered(dispatcher, inbound))
    };

    info!(events = events.len(), file = %file.display(), live, "Replaying events");
    for event in events {
        bus.publish(event).await?;
    }
    drop(bus);

    runtime.await?;
    Ok(())
}
