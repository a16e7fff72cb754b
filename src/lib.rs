pub mod config;
pub mod credential;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod logger;
pub mod reconcile;
pub mod registry;
pub mod retry;
pub mod schema;
pub mod secret;
pub mod store;
pub mod subscription_config;
pub mod verify;
