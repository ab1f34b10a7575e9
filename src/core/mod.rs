//! Core scheduling: the task model, ready queue, resource accounting,
//! dependency engine, load prediction, and the agent scheduler itself.

pub mod accountant;
pub mod deps;
pub mod error;
pub mod predictor;
pub mod queue;
pub mod scheduler;
pub mod task;
pub mod worker;

pub use accountant::{MeterSnapshot, ResourceAccountant};
pub use deps::{BrokenEdge, DependencyEngine, RegisterOutcome, Resolution};
pub use error::{AppResult, FailureReason, SchedulerError};
pub use predictor::{CompletionStats, LoadPrediction, LoadPredictor, ResourcePrediction};
pub use queue::{ReadyEntry, ReadyQueue};
pub use scheduler::{AgentScheduler, AgentSchedulerBuilder, CompletionCallback, SubmitRequest};
pub use task::{
    DependencyPattern, Priority, ResourceKind, ResourceRequirement, Task, TaskDependency, TaskId,
    TaskState,
};
pub use worker::{AgentWorker, CancelToken, TaskContext};
