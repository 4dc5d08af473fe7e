// Risk management module
pub mod circuit_breakers;
pub mod correlation;
pub mod gate;
pub mod sizing;

pub use circuit_breakers::{CircuitBreakerTrip, PortfolioSnapshot, PortfolioTracker};
pub use correlation::pearson;
pub use gate::{RiskGate, TradeDecision, TradeProposal};
pub use sizing::{kelly_fraction, TradeHistory, VolatilityTier};
