//! Authenticated HTTP API client.
//!
//! Every request carries `Authorization: Bearer <token>` and
//! `Content-Type: application/json` via the client's default headers.
//! A 401/403 on any endpoint fires the installed [`AuthFailureHook`]
//! (forced logout) before the error is returned, so the policy is
//! cross-cutting rather than per call site.

use crate::desk::avatar::AvatarSource;
use crate::desk::types::{Category, Chat, Message, Worker};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, error, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ApiError {
    /// 401/403: the backend rejected our token. Triggers forced logout.
    #[error("authorization rejected (HTTP {status})")]
    Unauthorized { status: u16 },
    #[error("HTTP error {status}: {body}")]
    Http { status: u16, body: String },
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

/// Installed by the client to react to authorization failures anywhere.
#[async_trait]
pub trait AuthFailureHook: Send + Sync {
    async fn on_auth_failure(&self, status: u16);
}

pub fn is_auth_failure(status: StatusCode) -> bool {
    matches!(status.as_u16(), 401 | 403)
}

pub struct DeskApi {
    client: reqwest::Client,
    base_url: String,
    auth_hook: RwLock<Option<Arc<dyn AuthFailureHook>>>,
}

impl DeskApi {
    /// Builds the API client with the auth interceptor baked into the
    /// default headers.
    pub fn new(base_url: impl Into<String>, token: &str) -> Result<Self> {
        let client = reqwest::ClientBuilder::new()
            .default_headers({
                let mut headers = reqwest::header::HeaderMap::new();
                headers.insert(
                    reqwest::header::AUTHORIZATION,
                    reqwest::header::HeaderValue::from_str(&format!("Bearer {}", token))
                        .context("token is not a valid header value")?,
                );
                headers.insert(
                    reqwest::header::CONTENT_TYPE,
                    reqwest::header::HeaderValue::from_static("application/json"),
                );
                headers
            })
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            auth_hook: RwLock::new(None),
        })
    }

    pub fn set_auth_failure_hook(&self, hook: Arc<dyn AuthFailureHook>) {
        if let Ok(mut slot) = self.auth_hook.write() {
            *slot = Some(hook);
        }
    }

    /// Shared status check for every endpoint. Fires the auth-failure hook
    /// on 401/403, then surfaces the typed error.
    async fn check(&self, response: reqwest::Response, op: &str) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if is_auth_failure(status) {
            warn!("[API] {} rejected with HTTP {}, forcing logout", op, status);
            let hook = self
                .auth_hook
                .read()
                .ok()
                .and_then(|slot| slot.clone());
            if let Some(hook) = hook {
                hook.on_auth_failure(status.as_u16()).await;
            }
            return Err(ApiError::Unauthorized {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("[API] {} failed, HTTP {}: {}", op, status, body);
            return Err(ApiError::Http {
                status: status.as_u16(),
                body,
            });
        }
        debug!("[API] {} ok, HTTP {}", op, status);
        Ok(response)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        op: &str,
    ) -> Result<T, ApiError> {
        let operation_id = Uuid::new_v4().to_string();
        debug!("[API] 📡 {} (op={})", op, operation_id);
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await?;
        let response = self.check(response, op).await?;
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
        op: &str,
    ) -> Result<(), ApiError> {
        let operation_id = Uuid::new_v4().to_string();
        debug!("[API] 📡 {} (op={})", op, operation_id);
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await?;
        self.check(response, op).await?;
        Ok(())
    }

    /// `GET /api/chats` — the authoritative chat list.
    pub async fn get_chats(&self) -> Result<Vec<Chat>, ApiError> {
        self.get_json("/api/chats", "get_chats").await
    }

    /// `GET /api/messages/:chatId` — the full server message list for a chat.
    pub async fn get_messages(&self, chat_id: &str) -> Result<Vec<Message>, ApiError> {
        self.get_json(&format!("/api/messages/{}", chat_id), "get_messages")
            .await
    }

    /// `POST /api/send-message`.
    pub async fn send_message(&self, jid: &str, text: &str) -> Result<(), ApiError> {
        self.post_json(
            "/api/send-message",
            &serde_json::json!({ "jid": jid, "message": text }),
            "send_message",
        )
        .await
    }

    /// `POST /api/chats/:id/category`.
    pub async fn set_category(&self, chat_id: &str, category: &str) -> Result<(), ApiError> {
        self.post_json(
            &format!("/api/chats/{}/category", chat_id),
            &serde_json::json!({ "category": category }),
            "set_category",
        )
        .await
    }

    /// `POST /api/chats/:id/assign`. `None` removes the assignment.
    pub async fn set_assigned_worker(
        &self,
        chat_id: &str,
        worker_name: Option<&str>,
    ) -> Result<(), ApiError> {
        self.post_json(
            &format!("/api/chats/{}/assign", chat_id),
            &serde_json::json!({ "workerName": worker_name }),
            "set_assigned_worker",
        )
        .await
    }

    /// `POST /api/chats/:id/archive`.
    pub async fn set_archived(&self, chat_id: &str, archive: bool) -> Result<(), ApiError> {
        self.post_json(
            &format!("/api/chats/{}/archive", chat_id),
            &serde_json::json!({ "archive": archive }),
            "set_archived",
        )
        .await
    }

    /// `GET /api/categories`.
    pub async fn get_categories(&self) -> Result<Vec<Category>, ApiError> {
        self.get_json("/api/categories", "get_categories").await
    }

    /// `GET /api/workers`.
    pub async fn get_workers(&self) -> Result<Vec<Worker>, ApiError> {
        self.get_json("/api/workers", "get_workers").await
    }

    /// `GET /api/profile-pic/:jid` — resolves a jid to a remote image URL,
    /// or `None` when the backend has no picture for it.
    pub async fn get_profile_pic_url(&self, jid: &str) -> Result<Option<String>, ApiError> {
        #[derive(serde::Deserialize)]
        struct ProfilePicResp {
            #[serde(default)]
            url: Option<String>,
        }
        let resp: ProfilePicResp = self
            .get_json(&format!("/api/profile-pic/{}", jid), "get_profile_pic")
            .await?;
        Ok(resp.url)
    }
}

#[async_trait]
impl AvatarSource for DeskApi {
    async fn profile_pic_url(&self, jid: &str) -> Result<Option<String>> {
        Ok(self.get_profile_pic_url(jid).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_failure_statuses() {
        assert!(is_auth_failure(StatusCode::UNAUTHORIZED));
        assert!(is_auth_failure(StatusCode::FORBIDDEN));
        assert!(!is_auth_failure(StatusCode::NOT_FOUND));
        assert!(!is_auth_failure(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(!is_auth_failure(StatusCode::OK));
    }
}
