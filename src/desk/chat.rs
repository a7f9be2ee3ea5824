//! Chat and message cache.
//!
//! Holds the chat list and per-chat message arrays in memory, flushes them
//! into the key-value store after each mutation, and reconciles with the
//! backend: the server list replaces the cache wholesale for chats, and
//! last-write-wins per chat for messages, with optimistic local entries
//! carried across a replace.
//!
//! All mutations go through one async mutex, so appends within a chat apply
//! in call order. Each chat also has a version counter bumped on append: a
//! background refresh records the version when it starts and, if an append
//! raced it, merges by message id instead of discarding the append.

use crate::desk::api::{ApiError, DeskApi};
use crate::desk::storage::{keys, AppSnapshot, KvStore};
use crate::desk::types::{now_seconds, Chat, Message, MessageState, Role, User};
use anyhow::Result;
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Tab name for the archived view; every other tab is a category label.
pub const ARCHIVED_TAB: &str = "Archivados";

struct ChatState {
    chats: Vec<Chat>,
    messages: HashMap<String, Vec<Message>>,
    /// Bumped on every append; lets a finishing refresh detect a race.
    versions: HashMap<String, u64>,
}

pub struct ChatCache {
    kv: Arc<KvStore>,
    api: Arc<DeskApi>,
    state: Mutex<ChatState>,
}

impl ChatCache {
    /// Builds the cache from the persisted snapshot loaded at startup.
    pub fn from_snapshot(kv: Arc<KvStore>, api: Arc<DeskApi>, snapshot: &AppSnapshot) -> Self {
        let mut chats = snapshot.chats.clone();
        sort_chats(&mut chats);
        Self {
            kv,
            api,
            state: Mutex::new(ChatState {
                chats,
                messages: snapshot.messages.clone(),
                versions: HashMap::new(),
            }),
        }
    }

    /// The full cached chat collection, sorted descending by conversation
    /// timestamp (missing/non-numeric timestamps sort as zero).
    pub async fn list_chats(&self) -> Vec<Chat> {
        self.state.lock().await.chats.clone()
    }

    /// Replaces the cached chat collection wholesale with the server's list
    /// (no field-level merge), re-sorts and persists.
    pub async fn refresh_chats(&self, mut server_list: Vec<Chat>) -> Result<Vec<Chat>> {
        sort_chats(&mut server_list);
        let mut state = self.state.lock().await;
        state.chats = server_list;
        self.persist_chats(&state).await?;
        Ok(state.chats.clone())
    }

    /// Fetches the authoritative list and applies [`refresh_chats`].
    /// Called on every `chats_updated` signal and once after each
    /// successful (re)connection.
    pub async fn sync_chats(&self) -> Result<Vec<Chat>, ApiError> {
        let server_list = self.api.get_chats().await?;
        info!("[ChatCache] 🔄 refreshed {} chats from server", server_list.len());
        match self.refresh_chats(server_list).await {
            Ok(chats) => Ok(chats),
            Err(e) => {
                // In-memory state already replaced; only the flush failed.
                warn!("[ChatCache] failed to persist refreshed chats: {}", e);
                Ok(self.list_chats().await)
            }
        }
    }

    /// Cache-first read: returns the cached messages for a chat immediately
    /// and triggers an asynchronous refresh from the backend. When the
    /// refresh lands, the server list replaces the cached one (per-chat
    /// last-write-wins, deduplicated by id, optimistic entries carried over).
    pub async fn get_messages(self: &Arc<Self>, chat_id: &str) -> Vec<Message> {
        let (cached, seen_version) = {
            let state = self.state.lock().await;
            (
                state.messages.get(chat_id).cloned().unwrap_or_default(),
                state.versions.get(chat_id).copied().unwrap_or(0),
            )
        };

        let cache = self.clone();
        let chat_id = chat_id.to_string();
        tokio::spawn(async move {
            match cache.api.get_messages(&chat_id).await {
                Ok(server_list) => {
                    if let Err(e) = cache
                        .replace_messages(&chat_id, server_list, seen_version)
                        .await
                    {
                        warn!("[ChatCache] failed to persist messages for {}: {}", chat_id, e);
                    }
                }
                Err(e) => {
                    // Stale cache stays in place; no retry.
                    warn!("[ChatCache] message refresh failed for {}: {}", chat_id, e);
                }
            }
        });

        cached
    }

    /// Applies a completed server fetch for one chat.
    async fn replace_messages(
        &self,
        chat_id: &str,
        server_list: Vec<Message>,
        seen_version: u64,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let current_version = state.versions.get(chat_id).copied().unwrap_or(0);
        let raced = current_version != seen_version;

        let mut merged: Vec<Message> = Vec::with_capacity(server_list.len());
        let mut seen: HashSet<String> = HashSet::with_capacity(server_list.len());
        for msg in server_list {
            if seen.insert(msg.id.clone()) {
                merged.push(msg);
            }
        }

        if let Some(local) = state.messages.get(chat_id) {
            for msg in local {
                if seen.contains(&msg.id) {
                    continue;
                }
                // Unconfirmed optimistic sends always survive a replace.
                // Confirmed entries survive only when they raced the fetch
                // (pushed over the live channel after the fetch started).
                if msg.state != MessageState::Confirmed || raced {
                    seen.insert(msg.id.clone());
                    merged.push(msg.clone());
                }
            }
        }

        debug!(
            "[ChatCache] replaced messages for {} ({} entries, raced={})",
            chat_id,
            merged.len(),
            raced
        );
        state.messages.insert(chat_id.to_string(), merged);
        self.persist_messages(&state).await
    }

    /// Appends one inbound message pushed over the live channel.
    ///
    /// Skipped when the message targets another chat, was sent by the local
    /// user, or its id is already cached (a push and a full refresh may both
    /// deliver the same message). Returns whether it was appended.
    pub async fn append_incoming(&self, chat_id: &str, message: Message) -> Result<bool> {
        if message.chat_id != chat_id {
            debug!(
                "[ChatCache] dropping message for {} delivered to {}",
                message.chat_id, chat_id
            );
            return Ok(false);
        }
        if message.from_me {
            return Ok(false);
        }

        let mut state = self.state.lock().await;
        let list = state.messages.entry(chat_id.to_string()).or_default();
        if list.iter().any(|m| m.id == message.id) {
            debug!("[ChatCache] duplicate message {} ignored", message.id);
            return Ok(false);
        }
        list.push(message);
        *state.versions.entry(chat_id.to_string()).or_insert(0) += 1;
        self.persist_messages(&state).await?;
        Ok(true)
    }

    /// Optimistic send: appends a `Pending` message with a client-generated
    /// id for instant feedback, persists, then issues the send request.
    /// On failure the entry is marked `Failed` (retryable), never rolled
    /// back or left looking sent.
    pub async fn append_outgoing(&self, chat_id: &str, text: &str) -> Result<Message> {
        let mut message = Message::outgoing(chat_id, text);
        {
            let mut state = self.state.lock().await;
            state
                .messages
                .entry(chat_id.to_string())
                .or_default()
                .push(message.clone());
            *state.versions.entry(chat_id.to_string()).or_insert(0) += 1;
            self.persist_messages(&state).await?;
        }

        match self.api.send_message(chat_id, text).await {
            Ok(()) => {
                debug!("[ChatCache] ✅ message {} sent", message.id);
                message.state = MessageState::Confirmed;
            }
            Err(e) => {
                warn!("[ChatCache] send failed for {}: {}", message.id, e);
                message.state = MessageState::Failed;
            }
        }
        self.set_message_state(chat_id, &message.id, message.state)
            .await?;
        Ok(message)
    }

    async fn set_message_state(
        &self,
        chat_id: &str,
        message_id: &str,
        new_state: MessageState,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(list) = state.messages.get_mut(chat_id) {
            if let Some(msg) = list.iter_mut().find(|m| m.id == message_id) {
                msg.state = new_state;
            }
        }
        self.persist_messages(&state).await
    }

    /// Fire-and-forget: the request goes to the backend, local state is not
    /// touched; the next `chats_updated` refresh brings the change in.
    pub async fn set_category(&self, chat_id: &str, category: &str) -> Result<(), ApiError> {
        self.api.set_category(chat_id, category).await
    }

    pub async fn set_assigned_worker(
        &self,
        chat_id: &str,
        worker_name: Option<&str>,
    ) -> Result<(), ApiError> {
        self.api.set_assigned_worker(chat_id, worker_name).await
    }

    pub async fn set_archived(&self, chat_id: &str, archive: bool) -> Result<(), ApiError> {
        self.api.set_archived(chat_id, archive).await
    }

    async fn persist_chats(&self, state: &ChatState) -> Result<()> {
        self.kv
            .set(keys::CHATS, &serde_json::to_string(&state.chats)?)
            .await?;
        self.kv
            .set(keys::LAST_SYNC, &now_seconds().to_string())
            .await?;
        Ok(())
    }

    async fn persist_messages(&self, state: &ChatState) -> Result<()> {
        self.kv
            .set(keys::MESSAGES, &serde_json::to_string(&state.messages)?)
            .await
    }
}

fn sort_chats(chats: &mut [Chat]) {
    chats.sort_by_key(|c| Reverse(c.sort_key()));
}

/// Chats a user may see: admins see everything, workers see their own
/// assignments plus unassigned chats.
pub fn visible_chats(chats: &[Chat], user: &User) -> Vec<Chat> {
    match user.role {
        Role::Admin => chats.to_vec(),
        Role::Worker => chats
            .iter()
            .filter(|c| match &c.assigned_to {
                Some(assigned) => assigned == &user.name,
                None => true,
            })
            .cloned()
            .collect(),
    }
}

/// Tab filter: the archived tab shows archived chats; any other tab shows
/// unarchived chats whose category label matches (default `"General"`).
pub fn chats_for_tab(chats: &[Chat], tab: &str) -> Vec<Chat> {
    if tab == ARCHIVED_TAB {
        chats.iter().filter(|c| c.archived).cloned().collect()
    } else {
        chats
            .iter()
            .filter(|c| !c.archived && c.category_label() == tab)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(id: &str, ts: Option<i64>) -> Chat {
        Chat {
            id: id.to_string(),
            name: None,
            last_message: None,
            unread_count: 0,
            conversation_timestamp: ts,
            category: None,
            assigned_to: None,
            archived: false,
        }
    }

    fn incoming(id: &str, chat_id: &str, text: &str) -> Message {
        Message {
            id: id.to_string(),
            chat_id: chat_id.to_string(),
            from_me: false,
            text: text.to_string(),
            timestamp: 100,
            state: MessageState::Confirmed,
        }
    }

    /// The API client points at a closed local port, so every network call
    /// fails fast and the cache degrades to its offline behavior.
    async fn offline_cache() -> Arc<ChatCache> {
        let kv = Arc::new(KvStore::new("sqlite::memory:").await.unwrap());
        let api = Arc::new(DeskApi::new("http://127.0.0.1:9", "test-token").unwrap());
        Arc::new(ChatCache::from_snapshot(kv, api, &AppSnapshot::default()))
    }

    #[tokio::test]
    async fn chat_list_sorts_descending_by_timestamp() {
        let cache = offline_cache().await;
        cache
            .refresh_chats(vec![chat("123@s", Some(100)), chat("456@s", Some(200))])
            .await
            .unwrap();

        let ids: Vec<String> = cache.list_chats().await.into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["456@s", "123@s"]);
    }

    #[tokio::test]
    async fn missing_timestamp_sorts_as_zero() {
        let cache = offline_cache().await;
        cache
            .refresh_chats(vec![chat("no-ts@s", None), chat("new@s", Some(50))])
            .await
            .unwrap();

        let ids: Vec<String> = cache.list_chats().await.into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["new@s", "no-ts@s"]);
    }

    #[tokio::test]
    async fn refresh_with_empty_list_clears_cache_and_store() {
        let cache = offline_cache().await;
        cache
            .refresh_chats((0..5).map(|i| chat(&format!("{i}@s"), Some(i))).collect())
            .await
            .unwrap();
        assert_eq!(cache.list_chats().await.len(), 5);

        cache.refresh_chats(vec![]).await.unwrap();
        assert!(cache.list_chats().await.is_empty());

        let persisted = cache.kv.get(keys::CHATS).await.unwrap().unwrap();
        assert_eq!(persisted, "[]");
    }

    #[tokio::test]
    async fn optimistic_message_is_visible_immediately() {
        let cache = offline_cache().await;
        let sent = cache.append_outgoing("123@s", "hola").await.unwrap();

        let messages = cache.get_messages("123@s").await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, sent.id);
        assert_eq!(messages[0].text, "hola");
        assert!(messages[0].from_me);
    }

    #[tokio::test]
    async fn failed_send_is_marked_failed_not_rolled_back() {
        let cache = offline_cache().await;
        // The API endpoint is unreachable, so the send settles as Failed.
        let sent = cache.append_outgoing("123@s", "hola").await.unwrap();
        assert_eq!(sent.state, MessageState::Failed);

        let messages = cache.get_messages("123@s").await;
        assert_eq!(messages[0].state, MessageState::Failed);
    }

    #[tokio::test]
    async fn incoming_append_order_and_filters() {
        let cache = offline_cache().await;

        assert!(cache
            .append_incoming("123@s", incoming("a", "123@s", "uno"))
            .await
            .unwrap());
        assert!(cache
            .append_incoming("123@s", incoming("b", "123@s", "dos"))
            .await
            .unwrap());

        // Wrong target chat.
        assert!(!cache
            .append_incoming("123@s", incoming("c", "456@s", "ajeno"))
            .await
            .unwrap());

        // Echo of our own send.
        let mut echo = incoming("d", "123@s", "yo");
        echo.from_me = true;
        assert!(!cache.append_incoming("123@s", echo).await.unwrap());

        let texts: Vec<String> = cache
            .get_messages("123@s")
            .await
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(texts, vec!["uno", "dos"]);
    }

    #[tokio::test]
    async fn incoming_duplicates_by_id_are_ignored() {
        let cache = offline_cache().await;
        assert!(cache
            .append_incoming("123@s", incoming("a", "123@s", "uno"))
            .await
            .unwrap());
        assert!(!cache
            .append_incoming("123@s", incoming("a", "123@s", "uno"))
            .await
            .unwrap());
        assert_eq!(cache.get_messages("123@s").await.len(), 1);
    }

    #[tokio::test]
    async fn replace_keeps_pending_entries_and_dedupes_by_id() {
        let cache = offline_cache().await;
        let pending = cache.append_outgoing("123@s", "saliente").await.unwrap();

        // Server refresh lands: it has one message, and no copy of ours yet.
        let seen_version = 1; // version after the optimistic append
        cache
            .replace_messages("123@s", vec![incoming("srv-1", "123@s", "entrante")], seen_version)
            .await
            .unwrap();

        let messages = cache.get_messages("123@s").await;
        let ids: Vec<&str> = messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["srv-1", pending.id.as_str()]);

        // A later refresh that includes the server's copy of our message
        // wins over the local entry.
        cache
            .replace_messages(
                "123@s",
                vec![
                    incoming("srv-1", "123@s", "entrante"),
                    incoming(&pending.id, "123@s", "saliente"),
                ],
                seen_version,
            )
            .await
            .unwrap();
        let messages = cache.get_messages("123@s").await;
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| m.state == MessageState::Confirmed));
    }

    #[tokio::test]
    async fn replace_that_raced_an_append_keeps_the_append() {
        let cache = offline_cache().await;

        // Refresh started before this push arrived.
        let stale_version = 0;
        assert!(cache
            .append_incoming("123@s", incoming("push-1", "123@s", "nuevo"))
            .await
            .unwrap());

        cache
            .replace_messages("123@s", vec![incoming("srv-1", "123@s", "viejo")], stale_version)
            .await
            .unwrap();

        let ids: Vec<String> = cache
            .get_messages("123@s")
            .await
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert!(ids.contains(&"push-1".to_string()));
        assert!(ids.contains(&"srv-1".to_string()));
    }

    #[tokio::test]
    async fn messages_survive_via_persisted_snapshot() {
        let kv = Arc::new(KvStore::new("sqlite::memory:").await.unwrap());
        let api = Arc::new(DeskApi::new("http://127.0.0.1:9", "test-token").unwrap());
        let cache = Arc::new(ChatCache::from_snapshot(
            kv.clone(),
            api.clone(),
            &AppSnapshot::default(),
        ));
        cache
            .append_incoming("123@s", incoming("a", "123@s", "uno"))
            .await
            .unwrap();

        // New cache instance over the same store sees the flushed state.
        let snapshot = crate::desk::storage::load_initial_data(&kv).await;
        let reopened = Arc::new(ChatCache::from_snapshot(kv, api, &snapshot));
        let messages = reopened.get_messages("123@s").await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "uno");
    }

    #[test]
    fn worker_sees_own_and_unassigned_chats() {
        let mut a = chat("1@s", Some(3));
        a.assigned_to = Some("alice".to_string());
        let mut b = chat("2@s", Some(2));
        b.assigned_to = Some("bob".to_string());
        let c = chat("3@s", Some(1));
        let all = vec![a, b, c];

        let alice = User {
            name: "alice".to_string(),
            role: Role::Worker,
        };
        let ids: Vec<String> = visible_chats(&all, &alice).into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["1@s", "3@s"]);

        let admin = User {
            name: "root".to_string(),
            role: Role::Admin,
        };
        assert_eq!(visible_chats(&all, &admin).len(), 3);
    }

    #[test]
    fn tab_filter_defaults_category_to_general() {
        let uncategorized = chat("1@s", Some(3));
        let mut sales = chat("2@s", Some(2));
        sales.category = Some("Ventas".to_string());
        let mut archived = chat("3@s", Some(1));
        archived.archived = true;
        let all = vec![uncategorized, sales, archived];

        let ids = |tab: &str| -> Vec<String> {
            chats_for_tab(&all, tab).into_iter().map(|c| c.id).collect()
        };
        assert_eq!(ids("General"), vec!["1@s"]);
        assert_eq!(ids("Ventas"), vec!["2@s"]);
        assert_eq!(ids(ARCHIVED_TAB), vec!["3@s"]);
    }
}
