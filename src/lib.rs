//! # DREAM Scheduler
//!
//! A resource-aware multi-agent task scheduling engine for heterogeneous AI
//! reasoning workloads.
//!
//! Four kinds of agents (interface, knowledge, reasoning, embodied) share
//! finite resources: GPU memory, host memory, compute, bandwidth, and
//! storage I/O. Each agent runs one scheduler instance that:
//!
//! - orders work by priority with FIFO fairness within a tier,
//! - admits tasks against per-kind utilization ceilings,
//! - tracks explicit task-dependency graphs, breaking cycles and failing
//!   dependents whose upstreams time out,
//! - predicts short-horizon load with windowed averages and hourly
//!   seasonality, redistributing work away from predicted bottlenecks,
//! - places execution on a process-wide device manager that balances
//!   stream pools and free memory across compute devices.
//!
//! ## Quick example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use dream_scheduler::config::{AgentConfig, AgentKind};
//! use dream_scheduler::core::{AgentScheduler, AgentWorker, SubmitRequest, TaskContext};
//!
//! struct Responder;
//!
//! #[async_trait]
//! impl AgentWorker for Responder {
//!     fn kind(&self) -> AgentKind {
//!         AgentKind::InterfaceLlm
//!     }
//!     async fn execute(&self, payload: Vec<u8>, _ctx: TaskContext) -> Result<Vec<u8>, String> {
//!         Ok(payload)
//!     }
//! }
//!
//! let config = AgentConfig::new(AgentKind::InterfaceLlm, "llm-7b");
//! let scheduler = AgentScheduler::builder(config).build(Arc::new(Responder))?;
//! let id = scheduler.submit(SubmitRequest::new("greet").with_payload(b"hi".to_vec()))?;
//! scheduler.wait(id)?;
//! # Ok::<(), dream_scheduler::core::SchedulerError>(())
//! ```
//!
//! Task execution is an opaque worker callback; actual model inference,
//! CUDA bindings, and tool surfaces live outside this crate.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Configuration models for agents, prediction, and rebalancing.
pub mod config;
/// Core scheduling abstractions and the agent scheduler.
pub mod core;
/// Device placement layer: driver trait and the process-wide manager.
pub mod device;
/// Metrics snapshots and sinks.
pub mod metrics;
/// Shared utilities.
pub mod util;
