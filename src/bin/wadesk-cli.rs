//! Helpdesk CLI client (test build)
//!
//! Non-interactive CLI for exercising the cache core against a live relay.
//! `login` stores a session in the local cache database; the other commands
//! reuse it. `watch` connects the live channel and prints everything the
//! backend pushes.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};
use wadesk_sdk_core::desk::client::{ClientConfig, DeskClient};
use wadesk_sdk_core::desk::listener::DeskListener;
use wadesk_sdk_core::desk::session::SessionCache;
use wadesk_sdk_core::desk::storage::KvStore;
use wadesk_sdk_core::desk::types::{Chat, ConnectionStatus, Message, MessageState};
use wadesk_sdk_core::login;

/// Helpdesk CLI client
#[derive(Parser, Debug)]
#[command(name = "wadesk-cli")]
#[command(about = "Helpdesk CLI client - exercises the cache core against a live relay", long_about = None)]
struct Args {
    /// Backend relay base URL
    #[arg(long, default_value = "http://192.168.1.16:5000")]
    api_url: String,

    /// Local cache database
    #[arg(long, default_value = "sqlite://wadesk.db?mode=rwc")]
    db: String,

    /// Log filter (default: info,wadesk_sdk_core=debug)
    #[arg(long, default_value = "info,wadesk_sdk_core=debug")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in and store the session locally
    Login {
        #[arg(short, long)]
        username: String,
        #[arg(short, long)]
        password: String,
    },
    /// Print the chat list (server if reachable, cache otherwise)
    Chats,
    /// Print the cached messages of one chat
    Messages { jid: String },
    /// Send a text message to a chat
    Send { jid: String, text: String },
    /// Connect the live channel and print pushed events
    Watch {
        /// Run duration in seconds, 0 keeps running
        #[arg(short, long, default_value = "0")]
        duration: u64,
    },
}

/// Logs to stdout and to a file at the same time.
fn init_logger(log_level: &str) {
    use std::fs::OpenOptions;
    use std::io;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    // RUST_LOG wins over the command-line filter when set
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open("debug.log")
        .expect("cannot create log file debug.log");

    // stdout keeps ANSI colors for the terminal
    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(true);

    // the file copy drops ANSI codes
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    info!("[CLI] 📝 logging to console and to file: debug.log");
}

/// Prints every event the client fans out.
struct CliDeskListener;

#[async_trait::async_trait]
impl DeskListener for CliDeskListener {
    async fn on_connection_status_changed(&self, status: ConnectionStatus) {
        info!("[CLI/Status] 🔗 connection status: {}", status.as_wire());
    }

    async fn on_qr_code(&self, payload: String) {
        info!("[CLI/Status] 📱 QR payload ({} bytes), scan to link", payload.len());
    }

    async fn on_chats_updated(&self, chats: Vec<Chat>) {
        info!("[CLI/Chats] 🔄 chat list updated ({} chats)", chats.len());
    }

    async fn on_new_message(&self, message: Message) {
        info!(
            "[CLI/Message] 📨 new message in {}: {}",
            message.chat_id,
            preview(&message.text)
        );
    }

    async fn on_forced_logout(&self) {
        error!("[CLI/Auth] ⚠️ session rejected by the backend, logged out");
    }
}

fn preview(text: &str) -> String {
    let short: String = text.chars().take(30).collect();
    if short.len() < text.len() {
        format!("{}…", short)
    } else {
        short
    }
}

/// Reads the stored session token and builds a client around it.
async fn open_client(args: &Args) -> Result<DeskClient> {
    let kv = Arc::new(KvStore::new(&args.db).await?);
    let session = SessionCache::new(kv);
    let Some(token) = session.token().await else {
        anyhow::bail!("no stored session, run `wadesk-cli login` first");
    };
    let mut config = ClientConfig::new(args.api_url.clone(), token);
    config.cache_db_url = args.db.clone();
    DeskClient::with_listener(config, Arc::new(CliDeskListener)).await
}

fn print_chats(chats: &[Chat]) {
    info!("[CLI] 📋 chat list ({} chats):", chats.len());
    for chat in chats {
        let last = chat
            .last_message
            .as_ref()
            .map(|m| preview(&m.text))
            .unwrap_or_default();
        info!(
            "[CLI]   - {} | unread: {} | last: {}",
            chat.display_name(),
            chat.unread_count,
            last
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logger(&args.log_level);
    info!("[CLI] 🚀 helpdesk CLI client (test mode)");
    info!("[CLI] 🌐 relay: {}", args.api_url);

    match &args.command {
        Command::Login { username, password } => {
            info!("[CLI] 🔐 logging in...");
            let data = login(&args.api_url, username, password)
                .await
                .map_err(|e| anyhow::anyhow!("login failed: {}", e))?;

            let kv = Arc::new(KvStore::new(&args.db).await?);
            SessionCache::new(kv).save(&data.access_token, &data.user).await?;
            info!(
                "[CLI] ✅ logged in as {} ({:?}), session stored",
                data.user.name, data.user.role
            );
        }

        Command::Chats => {
            let client = open_client(&args).await?;
            let chats = match client.chats().sync_chats().await {
                Ok(chats) => chats,
                Err(e) => {
                    warn!("[CLI] server unreachable ({}), showing cached list", e);
                    client.chats().list_chats().await
                }
            };
            print_chats(&chats);
        }

        Command::Messages { jid } => {
            let client = open_client(&args).await?;
            let messages = client.chats().get_messages(jid).await;
            info!("[CLI] 💬 {} cached messages in {}:", messages.len(), jid);
            for msg in &messages {
                let direction = if msg.from_me { "→" } else { "←" };
                info!("[CLI]   {} [{}] {}", direction, msg.timestamp, preview(&msg.text));
            }
        }

        Command::Send { jid, text } => {
            let client = open_client(&args).await?;
            let sent = client.chats().append_outgoing(jid, text).await?;
            match sent.state {
                MessageState::Confirmed => info!("[CLI] ✅ sent ({})", sent.id),
                MessageState::Failed => error!("[CLI] ❌ send failed, kept as retryable ({})", sent.id),
                MessageState::Pending => info!("[CLI] ⏳ still pending ({})", sent.id),
            }
        }

        Command::Watch { duration } => {
            let mut client = open_client(&args).await?;
            info!("[CLI] 🔗 connecting live channel...");
            client
                .connect()
                .await
                .map_err(|e| anyhow::anyhow!("connect failed: {}", e))?;
            info!("[CLI] ✅ connected!");

            match client.chats().sync_chats().await {
                Ok(chats) => print_chats(&chats[..chats.len().min(5)]),
                Err(e) => warn!("[CLI] initial chat sync failed: {}", e),
            }

            info!("[CLI] 📥 listening for events...");
            if *duration > 0 {
                info!("[CLI] ⏰ exiting in {} seconds", duration);
                sleep(Duration::from_secs(*duration)).await;
                client.disconnect().await;
                info!("[CLI] 👋 done");
            } else {
                info!("[CLI] ⏰ running until Ctrl+C");
                loop {
                    sleep(Duration::from_secs(3600)).await;
                }
            }
        }
    }

    Ok(())
}
