// Core modules
pub mod config;
pub mod error;
pub mod exchange;
pub mod execution;
pub mod models;
pub mod risk;
pub mod service;
pub mod store;

// Re-export commonly used types
pub use config::AppConfig;
pub use error::TradeError;
pub use exchange::{ExchangeAdapter, ExchangeRegistry};
pub use models::*;
pub use risk::{TradeDecision, TradeProposal};
pub use service::TradingCore;

// Error handling
pub type Result<T> = std::result::Result<T, TradeError>;
