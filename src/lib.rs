// Core modules
pub mod api;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod feed;
pub mod gateway;
pub mod models;

// Re-export commonly used types
pub use error::{EngineError, GatewayError, Result};
pub use models::*;
