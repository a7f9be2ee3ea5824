//! Data model shared across the caches, the API client and the live channel.
//!
//! Wire names follow the backend's camelCase JSON (`conversationTimestamp`,
//! `assignedTo`, `remoteJid`, ...).

use serde::{Deserialize, Deserializer, Serialize};

/// Account role as returned by `POST /api/login`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Worker,
}

/// Logged-in agent identity. Owned by the session cache: created at login,
/// destroyed at logout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    pub role: Role,
}

/// Preview of the newest message in a chat, as the chat list endpoint ships it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LastMessage {
    #[serde(default)]
    pub text: String,
}

/// One WhatsApp conversation as cached on the device.
///
/// Chats are created server-side; the client only caches them and mutates
/// category / assignment / archived through explicit API calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    /// WhatsApp-style address string (jid), e.g. `"5216641234567@s.whatsapp.net"`.
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub last_message: Option<LastMessage>,
    #[serde(default)]
    pub unread_count: u32,
    /// Conversation timestamp in seconds since epoch, used as the sort key.
    /// The backend sometimes sends it as a numeric string, so deserialization
    /// is lossy: number or numeric string parses, anything else becomes `None`.
    #[serde(default, deserialize_with = "de_lossy_timestamp")]
    pub conversation_timestamp: Option<i64>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub archived: bool,
}

impl Chat {
    /// Sort key for the chat list: missing or non-numeric timestamps count as zero.
    pub fn sort_key(&self) -> i64 {
        self.conversation_timestamp.unwrap_or(0)
    }

    /// Display name, falling back to the local part of the jid.
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!("+{}", self.id.split('@').next().unwrap_or(&self.id)),
        }
    }

    /// Category label, defaulting to `"General"` when the backend sent none.
    pub fn category_label(&self) -> &str {
        match self.category.as_deref() {
            Some(c) if !c.is_empty() => c,
            _ => "General",
        }
    }
}

/// Delivery state of a locally cached message.
///
/// Server-fetched messages carry no state field and deserialize as
/// `Confirmed`. Optimistic sends start as `Pending` and move to `Confirmed`
/// or `Failed` once the send request settles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageState {
    #[default]
    Confirmed,
    Pending,
    Failed,
}

/// One message inside a chat's cached list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    /// Jid of the chat this message belongs to.
    #[serde(rename = "remoteJid")]
    pub chat_id: String,
    #[serde(default)]
    pub from_me: bool,
    #[serde(default)]
    pub text: String,
    /// Seconds since epoch.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub state: MessageState,
}

impl Message {
    /// Builds an optimistic outgoing message with a client-generated id
    /// (current time in milliseconds, as a string).
    pub fn outgoing(chat_id: &str, text: &str) -> Self {
        Self {
            id: now_millis().to_string(),
            chat_id: chat_id.to_string(),
            from_me: true,
            text: text.to_string(),
            timestamp: now_seconds(),
            state: MessageState::Pending,
        }
    }
}

/// Connection state of the backend's WhatsApp session, as pushed over the
/// live channel. Wire strings are the backend's Spanish labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    WaitingQr,
    Connected,
}

impl ConnectionStatus {
    /// Parses a `status` event payload. Unknown strings map to `Disconnected`.
    pub fn from_wire(s: &str) -> Self {
        match s {
            "Conectado" => Self::Connected,
            "Esperando QR" => Self::WaitingQr,
            _ => Self::Disconnected,
        }
    }

    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::Disconnected => "Desconectado",
            Self::WaitingQr => "Esperando QR",
            Self::Connected => "Conectado",
        }
    }
}

/// A helpdesk worker, from `GET /api/workers`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    #[serde(default)]
    pub id: i64,
    pub name: String,
}

/// A chat category, from `GET /api/categories`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub name: String,
}

/// Envelope for live-channel traffic, both directions:
/// `{"event": "...", "data": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveEvent {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl LiveEvent {
    pub fn new(event: &str) -> Self {
        Self {
            event: event.to_string(),
            data: serde_json::Value::Null,
        }
    }
}

/// Current time in seconds since epoch.
pub fn now_seconds() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Current time in milliseconds since epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn de_lossy_timestamp<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        serde_json::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        serde_json::Value::String(s) => s
            .parse::<i64>()
            .ok()
            .or_else(|| s.parse::<f64>().ok().map(|f| f as i64)),
        _ => None,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_timestamp_accepts_number_and_numeric_string() {
        let a: Chat = serde_json::from_str(r#"{"id":"1@s","conversationTimestamp":100}"#).unwrap();
        assert_eq!(a.conversation_timestamp, Some(100));

        let b: Chat =
            serde_json::from_str(r#"{"id":"1@s","conversationTimestamp":"200"}"#).unwrap();
        assert_eq!(b.conversation_timestamp, Some(200));
    }

    #[test]
    fn chat_timestamp_garbage_counts_as_zero() {
        let c: Chat =
            serde_json::from_str(r#"{"id":"1@s","conversationTimestamp":"abc"}"#).unwrap();
        assert_eq!(c.conversation_timestamp, None);
        assert_eq!(c.sort_key(), 0);

        let d: Chat = serde_json::from_str(r#"{"id":"1@s"}"#).unwrap();
        assert_eq!(d.sort_key(), 0);
    }

    #[test]
    fn display_name_falls_back_to_local_part() {
        let chat: Chat = serde_json::from_str(r#"{"id":"5216641234567@s.whatsapp.net"}"#).unwrap();
        assert_eq!(chat.display_name(), "+5216641234567");

        let named: Chat =
            serde_json::from_str(r#"{"id":"1@s","name":"Cliente Uno"}"#).unwrap();
        assert_eq!(named.display_name(), "Cliente Uno");
    }

    #[test]
    fn category_label_defaults_to_general() {
        let chat: Chat = serde_json::from_str(r#"{"id":"1@s"}"#).unwrap();
        assert_eq!(chat.category_label(), "General");
    }

    #[test]
    fn server_message_deserializes_as_confirmed() {
        let msg: Message = serde_json::from_str(
            r#"{"id":"abc","remoteJid":"1@s","fromMe":false,"text":"hola","timestamp":10}"#,
        )
        .unwrap();
        assert_eq!(msg.state, MessageState::Confirmed);
    }

    #[test]
    fn outgoing_message_is_pending_with_millis_id() {
        let msg = Message::outgoing("1@s", "hola");
        assert!(msg.from_me);
        assert_eq!(msg.state, MessageState::Pending);
        assert!(msg.id.parse::<i64>().is_ok());
    }

    #[test]
    fn status_wire_round_trip() {
        for status in [
            ConnectionStatus::Disconnected,
            ConnectionStatus::WaitingQr,
            ConnectionStatus::Connected,
        ] {
            assert_eq!(ConnectionStatus::from_wire(status.as_wire()), status);
        }
        assert_eq!(
            ConnectionStatus::from_wire("whatever"),
            ConnectionStatus::Disconnected
        );
    }
}
