// Order placement, fill application, exits and reconciliation
pub mod closer;
pub mod locks;
pub mod monitor;
pub mod order_engine;
pub mod position_book;
pub mod reconciler;
pub mod stats;

pub use closer::{settle_close, PositionCloser};
pub use locks::KeyedLocks;
pub use monitor::{evaluate_rules, MonitorOutcome, PositionMonitor, RuleDecision};
pub use order_engine::OrderEngine;
pub use position_book::{FillOutcome, PositionBook};
pub use reconciler::{PositionReconciler, ReconcileReport};
pub use stats::close_stats;
