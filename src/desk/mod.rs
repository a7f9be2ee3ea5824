pub mod api;
pub mod auth;
pub mod avatar;
pub mod chat;
pub mod client;
pub mod listener;
pub mod session;
pub mod storage;
pub mod types;

// Re-export the login entry point
pub use auth::{login, LoginData};

// Re-export the cache services and listener trait
pub use avatar::AvatarCache;
pub use chat::ChatCache;
pub use client::{ClientConfig, DeskClient};
pub use listener::{DeskListener, EmptyDeskListener};
pub use session::SessionCache;
