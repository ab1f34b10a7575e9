//! Agent configuration structures.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::task::{Priority, ResourceRequirement};

/// Which worker variant an agent runs. Scheduling logic is identical across
/// kinds; the tag exists so construction can reject a worker that does not
/// match its configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// User interaction and high-level response generation.
    InterfaceLlm,
    /// Knowledge-base lookups and factual reasoning.
    KnowledgeLlm,
    /// Coordination between interface and knowledge agents.
    Reasoning,
    /// Physical or simulated actuation.
    Embodied,
}

impl AgentKind {
    /// Stable snake_case label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InterfaceLlm => "interface_llm",
            Self::KnowledgeLlm => "knowledge_llm",
            Self::Reasoning => "reasoning",
            Self::Embodied => "embodied",
        }
    }
}

/// Load predictor tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionConfig {
    /// History ring size per resource kind.
    pub max_history: usize,
    /// Minimum gap between predictor refreshes.
    pub refresh_interval_ms: u64,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            max_history: 1024,
            refresh_interval_ms: 30_000,
        }
    }
}

/// Background rebalancer tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceConfig {
    /// Tick period of the maintenance thread.
    pub interval_ms: u64,
    /// Utilization above which a resource kind counts as overloaded.
    pub overload_threshold: f64,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            overload_threshold: 0.8,
        }
    }
}

/// Full configuration of one agent scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Worker variant the agent is built for.
    pub kind: AgentKind,
    /// Opaque model label; the device selector uses it for affinity hints.
    pub model_name: String,
    /// Priority applied when the submitter omits one.
    pub priority_default: Priority,
    /// Upper bound on bytes the agent may hold; seeds the memory-kind
    /// capacities unless overridden at construction.
    pub memory_budget: u64,
    /// Dispatcher parallelism. Must be at least 1.
    pub worker_concurrency: usize,
    /// Queue-depth ceiling; submissions beyond it fail fast.
    pub max_queue: usize,
    /// Wall-time cap per task, in milliseconds.
    pub task_timeout_ms: u64,
    /// Baseline requirements applied to every submitted task unless the
    /// submission overrides them.
    pub declared_resource_requirements: Vec<ResourceRequirement>,
    /// Predictor tuning.
    #[serde(default)]
    pub prediction: PredictionConfig,
    /// Rebalancer tuning.
    #[serde(default)]
    pub rebalance: RebalanceConfig,
}

impl AgentConfig {
    /// Configuration with defaults for everything except kind and model.
    #[must_use]
    pub fn new(kind: AgentKind, model_name: impl Into<String>) -> Self {
        Self {
            kind,
            model_name: model_name.into(),
            priority_default: Priority::Medium,
            memory_budget: 1 << 30,
            worker_concurrency: num_cpus::get().max(1),
            max_queue: 1_000,
            task_timeout_ms: 300_000,
            declared_resource_requirements: Vec::new(),
            prediction: PredictionConfig::default(),
            rebalance: RebalanceConfig::default(),
        }
    }

    /// Set dispatcher parallelism.
    #[must_use]
    pub const fn with_worker_concurrency(mut self, n: usize) -> Self {
        self.worker_concurrency = n;
        self
    }

    /// Set the queue-depth ceiling.
    #[must_use]
    pub const fn with_max_queue(mut self, depth: usize) -> Self {
        self.max_queue = depth;
        self
    }

    /// Set the per-task timeout.
    #[must_use]
    pub const fn with_task_timeout_ms(mut self, ms: u64) -> Self {
        self.task_timeout_ms = ms;
        self
    }

    /// Set the default priority.
    #[must_use]
    pub const fn with_priority_default(mut self, priority: Priority) -> Self {
        self.priority_default = priority;
        self
    }

    /// Set the baseline resource requirements.
    #[must_use]
    pub fn with_requirements(mut self, requirements: Vec<ResourceRequirement>) -> Self {
        self.declared_resource_requirements = requirements;
        self
    }

    /// Set the rebalancer tick period.
    #[must_use]
    pub const fn with_rebalance_interval_ms(mut self, ms: u64) -> Self {
        self.rebalance.interval_ms = ms;
        self
    }

    /// Set the predictor refresh gap.
    #[must_use]
    pub const fn with_refresh_interval_ms(mut self, ms: u64) -> Self {
        self.prediction.refresh_interval_ms = ms;
        self
    }

    /// Per-task timeout as a `Duration`.
    #[must_use]
    pub const fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// A human-readable reason the configuration is unusable.
    pub fn validate(&self) -> Result<(), String> {
        if self.model_name.is_empty() {
            return Err("model_name must not be empty".into());
        }
        if self.worker_concurrency == 0 {
            return Err("worker_concurrency must be at least 1".into());
        }
        if self.max_queue == 0 {
            return Err("max_queue must be greater than 0".into());
        }
        if self.task_timeout_ms == 0 {
            return Err("task_timeout_ms must be greater than 0".into());
        }
        if self.prediction.max_history == 0 {
            return Err("prediction.max_history must be greater than 0".into());
        }
        if self.rebalance.interval_ms == 0 {
            return Err("rebalance.interval_ms must be greater than 0".into());
        }
        if !(0.0..=1.0).contains(&self.rebalance.overload_threshold)
            || self.rebalance.overload_threshold == 0.0
        {
            return Err("rebalance.overload_threshold must be in (0, 1]".into());
        }
        for req in &self.declared_resource_requirements {
            if req.utilization_ceiling <= 0.0 || req.utilization_ceiling > 1.0 {
                return Err(format!(
                    "utilization_ceiling for {} must be in (0, 1]",
                    req.kind.as_str()
                ));
            }
        }
        Ok(())
    }

    /// Parse a configuration from a JSON string and validate it.
    ///
    /// # Errors
    /// Parse or validation failure with a human-readable reason.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }
}
