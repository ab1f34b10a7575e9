//! Configuration models for agents, prediction, and rebalancing.

pub mod agent;

pub use agent::{AgentConfig, AgentKind, PredictionConfig, RebalanceConfig};
