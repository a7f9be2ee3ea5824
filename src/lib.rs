pub mod desk;

// Re-export the common types and entry points for embedding applications
pub use desk::{
    client::{ClientConfig, DeskClient},
    listener::{DeskListener, EmptyDeskListener},
    login,
    types::{Chat, ConnectionStatus, Message, MessageState, Role, User},
};
