pub mod config;
pub mod db;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod handlers;
pub mod orchestrator;
pub mod provision;
pub mod router;
pub mod scheduler;
pub mod service;
pub mod stanza;
pub mod vault;

pub use error::{KeeperError, KeeperResult};
pub use vault::Vault;
