//! Login against the backend relay.
//!
//! Unauthenticated: this is the one call that runs before a token exists.

use crate::desk::types::User;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Serialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Successful login payload: the bearer token plus the agent identity.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginData {
    pub access_token: String,
    pub user: User,
}

/// Error body the backend sends on a rejected login.
#[derive(Debug, Deserialize)]
struct LoginError {
    #[serde(default)]
    message: Option<String>,
}

/// `POST /api/login`.
pub async fn login(api_base_url: &str, username: &str, password: &str) -> Result<LoginData> {
    let url = format!("{}/api/login", api_base_url);
    info!("[Auth] 🔐 logging in as {}", username);
    debug!("[Auth]   url: {}", url);

    let response = reqwest::Client::new()
        .post(&url)
        .header("Content-Type", "application/json")
        .json(&LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        })
        .send()
        .await
        .context("login request failed")?;

    let status = response.status();
    let text = response.text().await.context("failed to read login response")?;

    if !status.is_success() {
        let message = serde_json::from_str::<LoginError>(&text)
            .ok()
            .and_then(|e| e.message)
            .unwrap_or_else(|| text.clone());
        return Err(anyhow::anyhow!("login rejected (HTTP {}): {}", status, message));
    }

    let data: LoginData = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse login response: {}", text))?;
    info!("[Auth] ✅ logged in as {} ({:?})", data.user.name, data.user.role);
    Ok(data)
}
