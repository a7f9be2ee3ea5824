//! Listener callbacks fanned out by the client.

use crate::desk::types::{Chat, ConnectionStatus, Message};
use async_trait::async_trait;

/// Callbacks for everything the live channel and the caches produce.
/// Registered by the embedding application.
#[async_trait]
pub trait DeskListener: Send + Sync {
    /// `status` event: the backend's WhatsApp session state changed.
    async fn on_connection_status_changed(&self, status: ConnectionStatus);

    /// `qr` event: a QR payload the admin scans to link the session.
    async fn on_qr_code(&self, payload: String);

    /// The cached chat list was replaced with a fresh server list.
    async fn on_chats_updated(&self, chats: Vec<Chat>);

    /// `new_message` event: one inbound message was appended to its chat.
    async fn on_new_message(&self, message: Message);

    /// A 401/403 tore the session down.
    async fn on_forced_logout(&self);
}

/// No-op default listener.
pub struct EmptyDeskListener;

#[async_trait]
impl DeskListener for EmptyDeskListener {
    async fn on_connection_status_changed(&self, _status: ConnectionStatus) {}
    async fn on_qr_code(&self, _payload: String) {}
    async fn on_chats_updated(&self, _chats: Vec<Chat>) {}
    async fn on_new_message(&self, _message: Message) {}
    async fn on_forced_logout(&self) {}
}
