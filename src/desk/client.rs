//! Client core: wires the caches to the backend relay.
//!
//! Owns the authenticated API client, the live channel, and the cache
//! services, and fans events out to the registered listener. Cache services
//! are handed around as `Arc` handles; nothing touches ambient global state.

use crate::desk::api::{AuthFailureHook, DeskApi};
use crate::desk::avatar::AvatarCache;
use crate::desk::chat::ChatCache;
use crate::desk::listener::{DeskListener, EmptyDeskListener};
use crate::desk::session::SessionCache;
use crate::desk::storage::{self, keys, KvStore};
use crate::desk::types::{ConnectionStatus, LiveEvent, Message};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

pub type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
pub type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// HTTP base, e.g. `http://192.168.1.16:5000`.
    pub api_base_url: String,
    /// Live channel endpoint; defaults to the API host over ws.
    pub ws_url: String,
    /// Bearer token from `POST /api/login`.
    pub token: String,
    /// Local cache database, e.g. `sqlite://wadesk.db?mode=rwc`.
    pub cache_db_url: String,
    /// Directory for the avatar disk cache.
    pub avatar_dir: PathBuf,
}

impl ClientConfig {
    pub fn new(api_base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let api_base_url = api_base_url.into();
        let ws_url = format!("{}/ws", api_base_url.replacen("http", "ws", 1));
        Self {
            api_base_url,
            ws_url,
            token: token.into(),
            cache_db_url: "sqlite://wadesk.db?mode=rwc".to_string(),
            avatar_dir: std::env::temp_dir().join("wadesk-avatars"),
        }
    }
}

/// Forced-logout policy: any 401/403 tears the session down and tells the
/// listener. Installed into [`DeskApi`] so the side effect covers every
/// authenticated call, not one call site.
pub struct ForcedLogout {
    session: Arc<SessionCache>,
    listener: Arc<dyn DeskListener>,
}

impl ForcedLogout {
    pub fn new(session: Arc<SessionCache>, listener: Arc<dyn DeskListener>) -> Self {
        Self { session, listener }
    }
}

#[async_trait]
impl AuthFailureHook for ForcedLogout {
    async fn on_auth_failure(&self, status: u16) {
        warn!("[Client] ⚠️ HTTP {} on an authenticated call, clearing session", status);
        if let Err(e) = self.session.clear().await {
            error!("[Client] failed to clear session after HTTP {}: {}", status, e);
        }
        self.listener.on_forced_logout().await;
    }
}

#[derive(Clone)]
pub struct DeskClient {
    config: ClientConfig,
    kv: Arc<KvStore>,
    session: Arc<SessionCache>,
    api: Arc<DeskApi>,
    chats: Arc<ChatCache>,
    avatars: Arc<AvatarCache>,
    listener: Arc<dyn DeskListener>,
    writer: Option<Arc<Mutex<WsWriter>>>,
    /// Cleared on disconnect; late background results are discarded.
    active: Arc<AtomicBool>,
}

impl DeskClient {
    pub async fn new(config: ClientConfig) -> Result<Self> {
        Self::with_listener(config, Arc::new(EmptyDeskListener)).await
    }

    /// Opens the local store, loads (and validity-gates) the persisted
    /// snapshot, and builds the cache services. Does not touch the network;
    /// call [`connect`](Self::connect) for that.
    pub async fn with_listener(
        config: ClientConfig,
        listener: Arc<dyn DeskListener>,
    ) -> Result<Self> {
        let kv = Arc::new(KvStore::new(&config.cache_db_url).await?);
        let snapshot = storage::load_initial_data(&kv).await;
        let session = Arc::new(SessionCache::new(kv.clone()));

        let api = Arc::new(DeskApi::new(config.api_base_url.clone(), &config.token)?);
        api.set_auth_failure_hook(Arc::new(ForcedLogout::new(
            session.clone(),
            listener.clone(),
        )));

        let chats = Arc::new(ChatCache::from_snapshot(kv.clone(), api.clone(), &snapshot));
        let avatars = Arc::new(AvatarCache::new(config.avatar_dir.clone(), api.clone()));

        Ok(Self {
            config,
            kv,
            session,
            api,
            chats,
            avatars,
            listener,
            writer: None,
            active: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn session(&self) -> Arc<SessionCache> {
        self.session.clone()
    }

    pub fn chats(&self) -> Arc<ChatCache> {
        self.chats.clone()
    }

    pub fn avatars(&self) -> Arc<AvatarCache> {
        self.avatars.clone()
    }

    pub fn api(&self) -> Arc<DeskApi> {
        self.api.clone()
    }

    /// Connects the live channel, announces `client_ready`, and starts the
    /// heartbeat and event loop.
    pub async fn connect(&mut self) -> Result<()> {
        info!("[Client] 🔗 connecting live channel at {}", self.config.ws_url);
        let (ws_stream, response) = connect_async(&self.config.ws_url)
            .await
            .context("live channel connect failed")?;
        info!("[Client] ✅ live channel connected, status: {}", response.status());

        let (write, read) = ws_stream.split();
        let writer = Arc::new(Mutex::new(write));
        self.writer = Some(writer.clone());
        self.active.store(true, Ordering::SeqCst);

        // Announced once, before any other traffic is expected.
        let ready = serde_json::to_string(&LiveEvent::new("client_ready"))?;
        writer
            .lock()
            .await
            .send(WsMessage::Text(ready))
            .await
            .context("failed to announce client_ready")?;
        debug!("[Client] 📤 client_ready sent");

        // Heartbeat.
        let writer_for_heartbeat = writer.clone();
        let active = self.active.clone();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(25));
            loop {
                ticker.tick().await;
                if !active.load(Ordering::SeqCst) {
                    break;
                }
                let mut w = writer_for_heartbeat.lock().await;
                if w.send(WsMessage::Ping(vec![])).await.is_err() {
                    break;
                }
            }
        });

        let client = self.clone();
        tokio::spawn(async move {
            if let Err(e) = client.handle_events(read).await {
                error!("[Client] event loop error: {}", e);
            }
        });

        Ok(())
    }

    /// Stops consuming the live channel. The underlying requests are not
    /// aborted; their late results are discarded via the active flag.
    pub async fn disconnect(&self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(writer) = &self.writer {
            let _ = writer.lock().await.send(WsMessage::Close(None)).await;
        }
        info!("[Client] 👋 live channel closed");
    }

    /// Explicit logout: clears the session and the avatar disk cache.
    pub async fn logout(&self) -> Result<()> {
        self.session.clear().await?;
        self.avatars.clear().await?;
        info!("[Client] logged out");
        Ok(())
    }

    /// Event loop. Events apply one at a time in arrival order, which keeps
    /// the caches single-writer with respect to the live channel.
    async fn handle_events(&self, mut read: WsReader) -> Result<()> {
        info!("[Client] 📥 listening for live events");
        while let Some(msg_result) = read.next().await {
            if !self.active.load(Ordering::SeqCst) {
                break;
            }
            match msg_result {
                Ok(WsMessage::Text(text)) => match serde_json::from_str::<LiveEvent>(&text) {
                    Ok(event) => self.dispatch(event).await,
                    Err(e) => warn!("[Client] unparseable live event: {} ({})", text, e),
                },
                Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => {}
                Ok(WsMessage::Close(frame)) => {
                    warn!("[Client] 👋 live channel closed by server: {:?}", frame);
                    break;
                }
                Err(e) => {
                    error!("[Client] live channel error: {}", e);
                    break;
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn dispatch(&self, event: LiveEvent) {
        match event.event.as_str() {
            "status" => {
                let wire = event.data.as_str().unwrap_or_default();
                let status = ConnectionStatus::from_wire(wire);
                debug!("[Client] status: {}", status.as_wire());
                if let Err(e) = self.kv.set(keys::STATUS, status.as_wire()).await {
                    warn!("[Client] failed to persist connection status: {}", e);
                }
                self.listener.on_connection_status_changed(status).await;
                if status == ConnectionStatus::Connected {
                    self.spawn_chat_sync();
                }
            }
            "qr" => {
                let payload = event.data.as_str().unwrap_or_default().to_string();
                debug!("[Client] 📱 qr payload received ({} bytes)", payload.len());
                self.listener.on_qr_code(payload).await;
            }
            "chats_updated" => {
                self.spawn_chat_sync();
            }
            "new_message" => {
                let Some(raw) = event.data.get("message") else {
                    warn!("[Client] new_message event without a message envelope");
                    return;
                };
                match serde_json::from_value::<Message>(raw.clone()) {
                    Ok(message) => {
                        let chat_id = message.chat_id.clone();
                        match self.chats.append_incoming(&chat_id, message.clone()).await {
                            Ok(true) => self.listener.on_new_message(message).await,
                            Ok(false) => {}
                            Err(e) => {
                                warn!("[Client] failed to store pushed message: {}", e)
                            }
                        }
                    }
                    Err(e) => warn!("[Client] unparseable message envelope: {}", e),
                }
            }
            other => {
                debug!("[Client] ignoring unknown live event: {}", other);
            }
        }
    }

    /// Refreshes the chat list off the event loop; the result is dropped if
    /// the client was torn down while the fetch was in flight.
    fn spawn_chat_sync(&self) {
        let chats = self.chats.clone();
        let listener = self.listener.clone();
        let active = self.active.clone();
        tokio::spawn(async move {
            match chats.sync_chats().await {
                Ok(list) => {
                    if active.load(Ordering::SeqCst) {
                        listener.on_chats_updated(list).await;
                    }
                }
                Err(e) => {
                    // Unauthorized already went through the forced-logout hook.
                    warn!("[Client] chat sync failed: {}", e);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desk::types::{Role, User};

    #[tokio::test]
    async fn auth_failure_forces_logout() {
        let kv = Arc::new(KvStore::new("sqlite::memory:").await.unwrap());
        let session = Arc::new(SessionCache::new(kv));
        let alice = User {
            name: "alice".to_string(),
            role: Role::Worker,
        };
        session.save("tok-1", &alice).await.unwrap();
        assert_eq!(session.load().await, (true, Some(alice)));

        let hook = ForcedLogout::new(session.clone(), Arc::new(EmptyDeskListener));
        hook.on_auth_failure(403).await;

        assert_eq!(session.load().await, (false, None));

        // Repeated failures are harmless.
        hook.on_auth_failure(401).await;
        assert_eq!(session.load().await, (false, None));
    }

    #[test]
    fn ws_url_derived_from_api_base() {
        let config = ClientConfig::new("http://192.168.1.16:5000", "tok");
        assert_eq!(config.ws_url, "ws://192.168.1.16:5000/ws");

        let tls = ClientConfig::new("https://desk.example.com", "tok");
        assert_eq!(tls.ws_url, "wss://desk.example.com/ws");
    }
}
