//! Session cache: persisted identity and auth token.
//!
//! Lifecycle spans app install to explicit logout or a corruption-triggered
//! wipe. A 401/403 on any authenticated call anywhere in the client forces
//! `clear()` through the auth-failure hook in `client.rs`.

use crate::desk::storage::{keys, KvStore};
use crate::desk::types::User;
use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct SessionCache {
    kv: Arc<KvStore>,
}

impl SessionCache {
    pub fn new(kv: Arc<KvStore>) -> Self {
        Self { kv }
    }

    /// Reads the persisted token and user record.
    ///
    /// Fails open: any read or parse failure yields `(false, None)`,
    /// never an error.
    pub async fn load(&self) -> (bool, Option<User>) {
        let token = match self.kv.get(keys::TOKEN).await {
            Ok(t) => t,
            Err(e) => {
                warn!("[Session] failed to read token: {}", e);
                return (false, None);
            }
        };
        let raw_user = match self.kv.get(keys::USER).await {
            Ok(u) => u,
            Err(e) => {
                warn!("[Session] failed to read user: {}", e);
                return (false, None);
            }
        };

        match (token, raw_user) {
            (Some(token), Some(raw)) if !token.is_empty() => {
                match serde_json::from_str::<Option<User>>(&raw) {
                    Ok(Some(user)) => (true, Some(user)),
                    Ok(None) => (false, None),
                    Err(e) => {
                        warn!("[Session] persisted user record is unreadable: {}", e);
                        (false, None)
                    }
                }
            }
            _ => (false, None),
        }
    }

    /// Persists token and user. Both writes must succeed; on error the
    /// caller treats the save as failed and retries the full `save`.
    pub async fn save(&self, token: &str, user: &User) -> Result<()> {
        self.kv.set(keys::TOKEN, token).await?;
        self.kv
            .set(keys::USER, &serde_json::to_string(user)?)
            .await?;
        debug!("[Session] saved session for {}", user.name);
        Ok(())
    }

    /// Removes the persisted token and user. Idempotent: clearing an empty
    /// session is not an error.
    pub async fn clear(&self) -> Result<()> {
        self.kv.remove(keys::TOKEN).await?;
        self.kv.remove(keys::USER).await?;
        debug!("[Session] session cleared");
        Ok(())
    }

    pub async fn token(&self) -> Option<String> {
        self.kv.get(keys::TOKEN).await.ok().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desk::types::Role;

    async fn session() -> SessionCache {
        let kv = Arc::new(KvStore::new("sqlite::memory:").await.unwrap());
        SessionCache::new(kv)
    }

    fn alice() -> User {
        User {
            name: "alice".to_string(),
            role: Role::Worker,
        }
    }

    #[tokio::test]
    async fn save_then_load() {
        let session = session().await;
        assert_eq!(session.load().await, (false, None));

        session.save("tok-1", &alice()).await.unwrap();
        let (authenticated, user) = session.load().await;
        assert!(authenticated);
        assert_eq!(user, Some(alice()));
        assert_eq!(session.token().await, Some("tok-1".to_string()));
    }

    #[tokio::test]
    async fn clear_is_idempotent() {
        let session = session().await;
        session.save("tok-1", &alice()).await.unwrap();

        session.clear().await.unwrap();
        assert_eq!(session.load().await, (false, None));

        // Clearing again with nothing stored is not an error.
        session.clear().await.unwrap();
        assert_eq!(session.load().await, (false, None));
    }

    #[tokio::test]
    async fn garbage_user_record_fails_open() {
        let session = session().await;
        session.kv.set(keys::TOKEN, "tok-1").await.unwrap();
        session.kv.set(keys::USER, "{{not json").await.unwrap();
        assert_eq!(session.load().await, (false, None));
    }

    #[tokio::test]
    async fn token_without_user_is_not_authenticated() {
        let session = session().await;
        session.kv.set(keys::TOKEN, "tok-1").await.unwrap();
        assert_eq!(session.load().await, (false, None));
    }
}
