//! BranchSync CLI
//!
//! Thin wrapper around branchsync-core for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Create an idea
//! branchsync idea create "Trip planning"
//!
//! # List all ideas
//! branchsync idea list
//!
//! # Create a branch in an idea
//! branchsync branch create <idea_id> "main"
//!
//! # Record a conversation turn
//! branchsync bind add <branch_id> "Where to in March?" "Somewhere warm."
//!
//! # Show a branch's message history
//! branchsync branch messages <branch_id>
//!
//! # Checkpoint a branch
//! branchsync snapshot create <branch_id> -d "before rewrite"
//!
//! # Send everything through an anonymous relay (prints the path)
//! branchsync sync send --transport relay
//!
//! # Receive on the other device
//! branchsync sync receive --transport relay --code <path>
//!
//! # Host a P2P room and wait for a peer (prints the room id)
//! branchsync sync receive --transport p2p
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use branchsync_core::{
    BindId, BranchId, ConversationRepository, CoordinatorEvent, IdeaId, Message, P2pConfig,
    P2pTransport, ReceiveOptions, RelayConfig, RelayTransport, SendOptions, Storage,
    SyncCoordinator, SyncTransport,
};

/// BranchSync - branching conversations synced across devices
#[derive(Parser)]
#[command(name = "branchsync")]
#[command(version = "0.1.0")]
#[command(about = "BranchSync - branching conversations synced across devices")]
#[command(
    long_about = "A local-first store for branching conversations (ideas, branches, binds) \
                  that replicates between devices over QR frames, an HTTP relay, P2P, or BLE."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Data directory (default: ~/.branchsync/data)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show store information
    Info,

    /// Idea management
    Idea {
        #[command(subcommand)]
        action: IdeaAction,
    },

    /// Branch management
    Branch {
        #[command(subcommand)]
        action: BranchAction,
    },

    /// Bind (conversation turn) management
    Bind {
        #[command(subcommand)]
        action: BindAction,
    },

    /// Snapshot management
    Snapshot {
        #[command(subcommand)]
        action: SnapshotAction,
    },

    /// Settings management
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },

    /// Device-to-device sync
    Sync {
        #[command(subcommand)]
        action: SyncAction,
    },
}

#[derive(Subcommand)]
enum IdeaAction {
    /// Create a new idea
    Create {
        /// Idea name
        name: String,
        /// Optional description
        #[arg(short = 'D', long, default_value = "")]
        description: String,
    },
    /// List all ideas
    List,
    /// Pin or unpin an idea
    Pin {
        /// Idea id
        id: String,
        /// Unpin instead of pin
        #[arg(long)]
        off: bool,
    },
    /// Delete an idea and everything under it
    Delete {
        /// Idea id
        id: String,
    },
}

#[derive(Subcommand)]
enum BranchAction {
    /// Create a branch in an idea
    Create {
        /// Owning idea id
        idea_id: String,
        /// Branch name
        name: String,
        /// Fork from this branch
        #[arg(long)]
        parent: Option<String>,
    },
    /// List branches of an idea
    List {
        /// Idea id
        idea_id: String,
    },
    /// Rename a branch
    Rename {
        /// Branch id
        id: String,
        /// New name
        name: String,
    },
    /// Show a branch's message history
    Messages {
        /// Branch id
        id: String,
    },
    /// Merge two branches into a new one
    Merge {
        /// Source branch id
        source: String,
        /// Target branch id
        target: String,
    },
    /// Delete a branch and its subtree
    Delete {
        /// Branch id
        id: String,
    },
}

#[derive(Subcommand)]
enum BindAction {
    /// Record a prompt/response turn on a branch
    Add {
        /// Branch id
        branch_id: String,
        /// The user prompt
        prompt: String,
        /// The assistant response
        response: String,
    },
    /// List a branch's turns
    List {
        /// Branch id
        branch_id: String,
    },
    /// Toggle a bind's pin
    Pin {
        /// Bind id
        id: String,
    },
    /// Consolidate selected binds into a branch
    Merge {
        /// Target branch id
        target: String,
        /// Bind ids to consolidate
        bind_ids: Vec<String>,
        /// Create a new branch with this name instead of appending to
        /// the target
        #[arg(long)]
        new_branch: Option<String>,
    },
}

#[derive(Subcommand)]
enum SnapshotAction {
    /// Checkpoint a branch's current messages
    Create {
        /// Branch id
        branch_id: String,
        /// Optional description
        #[arg(short = 'D', long)]
        description: Option<String>,
    },
    /// List a branch's snapshots
    List {
        /// Branch id
        branch_id: String,
    },
}

#[derive(Subcommand)]
enum SettingsAction {
    /// Show current settings
    Show,
    /// Update settings fields
    Set {
        /// Sampling temperature
        #[arg(long)]
        temperature: Option<f32>,
        /// Completion token budget
        #[arg(long)]
        max_tokens: Option<u32>,
        /// Dark theme flag
        #[arg(long)]
        dark: Option<bool>,
        /// Selected model identifier
        #[arg(long)]
        model: Option<String>,
    },
}

#[derive(Subcommand)]
enum SyncAction {
    /// Send the local store to another device
    Send {
        /// Which transport to use
        #[arg(long, value_enum)]
        transport: TransportChoice,
        /// Connection code (relay path or room id); generated if absent
        #[arg(long)]
        code: Option<String>,
        /// Relay base URL
        #[arg(long, default_value = "https://ppng.io")]
        relay_url: String,
        /// Signaling server URL
        #[arg(long, default_value = "ws://127.0.0.1:9090")]
        signaling_url: String,
    },
    /// Receive a store from another device
    Receive {
        /// Which transport to use
        #[arg(long, value_enum)]
        transport: TransportChoice,
        /// Connection code (relay path or room id); hosts a room if
        /// absent on p2p
        #[arg(long)]
        code: Option<String>,
        /// Relay base URL
        #[arg(long, default_value = "https://ppng.io")]
        relay_url: String,
        /// Signaling server URL
        #[arg(long, default_value = "ws://127.0.0.1:9090")]
        signaling_url: String,
    },
}

/// Transports drivable from a terminal (QR and BLE need hardware seams
/// a UI shell provides)
#[derive(Clone, Copy, ValueEnum)]
enum TransportChoice {
    /// Anonymous HTTP relay
    Relay,
    /// P2P with a signaling server
    P2p,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
    let storage = Storage::new(data_dir.join("store.redb"))
        .with_context(|| format!("opening store under {}", data_dir.display()))?;
    let repo = ConversationRepository::new(storage);

    match cli.command {
        Commands::Info => cmd_info(&repo, &data_dir),
        Commands::Idea { action } => cmd_idea(&repo, action),
        Commands::Branch { action } => cmd_branch(&repo, action),
        Commands::Bind { action } => cmd_bind(&repo, action),
        Commands::Snapshot { action } => cmd_snapshot(&repo, action),
        Commands::Settings { action } => cmd_settings(&repo, action),
        Commands::Sync { action } => cmd_sync(repo, action).await,
    }
}

fn cmd_info(repo: &ConversationRepository, data_dir: &PathBuf) -> Result<()> {
    println!("Data directory: {}", data_dir.display());
    println!("Ideas:      {}", repo.ideas()?.len());
    println!("Branches:   {}", repo.branches()?.len());
    println!("Snapshots:  {}", repo.snapshots()?.len());
    Ok(())
}

fn cmd_idea(repo: &ConversationRepository, action: IdeaAction) -> Result<()> {
    match action {
        IdeaAction::Create { name, description } => {
            let idea = repo.create_idea(name, description)?;
            println!("Created idea {} ({})", idea.name, idea.id.to_string_repr());
        }
        IdeaAction::List => {
            let ideas = repo.ideas()?;
            if ideas.is_empty() {
                println!("No ideas yet");
            }
            for idea in ideas {
                let pin = if idea.pinned { "📌 " } else { "" };
                println!("{}{} ({})", pin, idea.name, idea.id.to_string_repr());
            }
        }
        IdeaAction::Pin { id, off } => {
            let id = parse_idea_id(&id)?;
            repo.pin_idea(&id, !off)?;
            println!("{}", if off { "Unpinned" } else { "Pinned" });
        }
        IdeaAction::Delete { id } => {
            let id = parse_idea_id(&id)?;
            repo.delete_idea(&id)?;
            println!("Deleted idea and all descendants");
        }
    }
    Ok(())
}

fn cmd_branch(repo: &ConversationRepository, action: BranchAction) -> Result<()> {
    match action {
        BranchAction::Create {
            idea_id,
            name,
            parent,
        } => {
            let idea_id = parse_idea_id(&idea_id)?;
            let parent = parent.as_deref().map(parse_branch_id).transpose()?;
            let branch = repo.create_branch(name, &idea_id, parent.as_ref())?;
            println!(
                "Created branch {} ({})",
                branch.name,
                branch.id.to_string_repr()
            );
        }
        BranchAction::List { idea_id } => {
            let idea_id = parse_idea_id(&idea_id)?;
            for branch in repo.branches_for_idea(&idea_id)? {
                let fork = match branch.parent_id {
                    Some(parent) => format!(" forked from {}", parent.to_string_repr()),
                    None => String::new(),
                };
                println!("{} ({}){}", branch.name, branch.id.to_string_repr(), fork);
            }
        }
        BranchAction::Rename { id, name } => {
            let id = parse_branch_id(&id)?;
            repo.rename_branch(&id, name)?;
            println!("Renamed");
        }
        BranchAction::Messages { id } => {
            let id = parse_branch_id(&id)?;
            for message in repo.branch_messages(&id)? {
                let role = match message.role {
                    branchsync_core::Role::User => "you",
                    branchsync_core::Role::Assistant => "ai ",
                };
                println!("[{}] {}", role, message.text());
            }
        }
        BranchAction::Merge { source, target } => {
            let source = parse_branch_id(&source)?;
            let target = parse_branch_id(&target)?;
            let merged = repo.merge_branches(&source, &target)?;
            println!(
                "Merged into {} ({})",
                merged.name,
                merged.id.to_string_repr()
            );
        }
        BranchAction::Delete { id } => {
            let id = parse_branch_id(&id)?;
            repo.delete_branch(&id)?;
            println!("Deleted branch subtree");
        }
    }
    Ok(())
}

fn cmd_bind(repo: &ConversationRepository, action: BindAction) -> Result<()> {
    match action {
        BindAction::Add {
            branch_id,
            prompt,
            response,
        } => {
            let branch_id = parse_branch_id(&branch_id)?;
            let bind = repo.create_bind(
                &branch_id,
                Message::user(prompt),
                Message::assistant(response),
            )?;
            println!("Recorded turn ({})", bind.id.to_string_repr());
        }
        BindAction::List { branch_id } => {
            let branch_id = parse_branch_id(&branch_id)?;
            for bind in repo.binds_for_branch(&branch_id)? {
                let pin = if bind.pinned { "📌 " } else { "" };
                println!("{}{} ({})", pin, bind.summary, bind.id.to_string_repr());
            }
        }
        BindAction::Pin { id } => {
            let id = parse_bind_id(&id)?;
            let pinned = repo.toggle_bind_pin(&id)?;
            println!("{}", if pinned { "Pinned" } else { "Unpinned" });
        }
        BindAction::Merge {
            target,
            bind_ids,
            new_branch,
        } => {
            let target = parse_branch_id(&target)?;
            let bind_ids = bind_ids
                .iter()
                .map(|id| parse_bind_id(id))
                .collect::<Result<Vec<BindId>>>()?;
            let destination = repo.merge_selected_binds(&bind_ids, &target, new_branch)?;
            println!(
                "Consolidated {} turns into {} ({})",
                bind_ids.len(),
                destination.name,
                destination.id.to_string_repr()
            );
        }
    }
    Ok(())
}

fn cmd_snapshot(repo: &ConversationRepository, action: SnapshotAction) -> Result<()> {
    match action {
        SnapshotAction::Create {
            branch_id,
            description,
        } => {
            let branch_id = parse_branch_id(&branch_id)?;
            let messages = repo.branch_messages(&branch_id)?;
            let snapshot = repo.create_snapshot(&branch_id, messages, description)?;
            println!(
                "Snapshot {} with {} messages",
                snapshot.id.to_string_repr(),
                snapshot.messages.len()
            );
        }
        SnapshotAction::List { branch_id } => {
            let branch_id = parse_branch_id(&branch_id)?;
            for snapshot in repo.snapshots_for_branch(&branch_id)? {
                let when = chrono::DateTime::from_timestamp_millis(snapshot.timestamp)
                    .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| snapshot.timestamp.to_string());
                let description = snapshot.description.as_deref().unwrap_or("-");
                println!(
                    "{} at {}: {} messages ({})",
                    snapshot.id.to_string_repr(),
                    when,
                    snapshot.messages.len(),
                    description
                );
            }
        }
    }
    Ok(())
}

fn cmd_settings(repo: &ConversationRepository, action: SettingsAction) -> Result<()> {
    match action {
        SettingsAction::Show => {
            let record = repo.settings()?;
            println!("temperature:    {}", record.settings.temperature);
            println!("max tokens:     {}", record.settings.max_tokens);
            println!("dark theme:     {}", record.settings.is_dark);
            println!("selected model: {}", record.settings.selected_model);
        }
        SettingsAction::Set {
            temperature,
            max_tokens,
            dark,
            model,
        } => {
            let mut settings = repo.settings()?.settings;
            if let Some(temperature) = temperature {
                settings.temperature = temperature;
            }
            if let Some(max_tokens) = max_tokens {
                settings.max_tokens = max_tokens;
            }
            if let Some(dark) = dark {
                settings.is_dark = dark;
            }
            if let Some(model) = model {
                settings.selected_model = model;
            }
            repo.update_settings(settings)?;
            println!("Settings updated");
        }
    }
    Ok(())
}

async fn cmd_sync(repo: ConversationRepository, action: SyncAction) -> Result<()> {
    let coordinator = SyncCoordinator::new(repo);
    let mut events = coordinator.subscribe();

    let sending = matches!(action, SyncAction::Send { .. });
    match action {
        SyncAction::Send {
            transport,
            code,
            relay_url,
            signaling_url,
        } => {
            let transport = build_transport(transport, relay_url, signaling_url);
            coordinator
                .start_sending(transport, SendOptions { code, cycles: None })
                .await?;
        }
        SyncAction::Receive {
            transport,
            code,
            relay_url,
            signaling_url,
        } => {
            let transport = build_transport(transport, relay_url, signaling_url);
            coordinator
                .start_receiving(
                    transport,
                    ReceiveOptions {
                        code,
                        reply_payload: None,
                    },
                )
                .await?;
        }
    }

    // Follow the unified event surface until the operation closes
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(_) => return Err(anyhow!("event channel closed")),
        };
        match &event {
            CoordinatorEvent::ConnectionCode { code } => {
                println!("Connection code: {}", code);
            }
            CoordinatorEvent::SendStarted { kind } => println!("Sending via {}...", kind),
            CoordinatorEvent::ReceiveStarted { kind } => println!("Receiving via {}...", kind),
            CoordinatorEvent::SendProgress { sent, total, .. } => {
                println!("  sent {}/{}", sent, total);
            }
            CoordinatorEvent::ReceiveProgress {
                received, total, ..
            } => match total {
                Some(total) => println!("  received {}/{}", received, total),
                None => println!("  received {} bytes", received),
            },
            _ => {}
        }
        if let Some(outcome) = terminal_outcome(&event, sending) {
            return outcome;
        }
    }
}

/// Map a terminal coordinator event for the active direction to the
/// process outcome.
fn terminal_outcome(event: &CoordinatorEvent, sending: bool) -> Option<Result<()>> {
    match event {
        CoordinatorEvent::SendCompleted { .. } if sending => {
            println!("Send completed");
            Some(Ok(()))
        }
        CoordinatorEvent::SendFailed { message, .. } if sending => {
            Some(Err(anyhow!("send failed: {message}")))
        }
        CoordinatorEvent::SendCancelled { .. } if sending => {
            println!("Send cancelled");
            Some(Ok(()))
        }
        CoordinatorEvent::Imported { stats, .. } if !sending => {
            println!(
                "Imported {} branches, {} snapshots, {} new messages",
                stats.branches_added + stats.branches_merged,
                stats.snapshots_added,
                stats.messages_added
            );
            Some(Ok(()))
        }
        CoordinatorEvent::ReceiveFailed { message, .. } if !sending => {
            Some(Err(anyhow!("receive failed: {message}")))
        }
        CoordinatorEvent::ReceiveCancelled { .. } if !sending => {
            println!("Receive cancelled");
            Some(Ok(()))
        }
        _ => None,
    }
}

fn build_transport(
    choice: TransportChoice,
    relay_url: String,
    signaling_url: String,
) -> Arc<dyn SyncTransport> {
    match choice {
        TransportChoice::Relay => Arc::new(RelayTransport::new(RelayConfig {
            base_url: relay_url,
        })),
        TransportChoice::P2p => Arc::new(P2pTransport::new(P2pConfig {
            signaling_url,
            listen_addr: "0.0.0.0:0".to_string(),
        })),
    }
}

fn parse_idea_id(s: &str) -> Result<IdeaId> {
    IdeaId::from_string(s).map_err(|_| anyhow!("invalid idea id: {s}"))
}

fn parse_branch_id(s: &str) -> Result<BranchId> {
    BranchId::from_string(s).map_err(|_| anyhow!("invalid branch id: {s}"))
}

fn parse_bind_id(s: &str) -> Result<BindId> {
    BindId::from_string(s).map_err(|_| anyhow!("invalid bind id: {s}"))
}

fn init_tracing(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

/// Get the default data directory (~/.branchsync/data)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".branchsync")
        .join("data")
}
