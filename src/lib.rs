// Brightspace client - library root

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod http_client;
pub mod paginator;
pub mod resolver;
pub mod resources;

pub use client::BrightspaceClient;
pub use error::{BrightspaceError, Result};
