//! Configuration types for pipelines and stages.
//!
//! Capacities and concurrency degrees are fixed when a pipeline is built.
//! They can be given programmatically through [`StageOptions`] or loaded from
//! JSON through [`PipelineConfig`].

use crate::errors::ConfigurationError;
use crate::pipeline::ErrorPolicy;
use serde::{Deserialize, Serialize};

/// Default queue capacity for stage outputs and the source queue.
pub const DEFAULT_CAPACITY: usize = 100;

/// Default number of workers per stage.
pub const DEFAULT_CONCURRENCY: usize = 1;

fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

fn default_pipeline_name() -> String {
    "pipeline".to_string()
}

/// Concurrency and output capacity of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageOptions {
    /// Number of concurrent workers (must be at least 1).
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Capacity of the stage's output queue (`0` = unbounded).
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

impl Default for StageOptions {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            capacity: default_capacity(),
        }
    }
}

impl StageOptions {
    /// Creates stage options.
    #[must_use]
    pub fn new(concurrency: usize, capacity: usize) -> Self {
        Self {
            concurrency,
            capacity,
        }
    }

    /// A single worker with the default capacity.
    #[must_use]
    pub fn serial() -> Self {
        Self::default()
    }

    /// `n` workers with the default capacity.
    #[must_use]
    pub fn concurrent(n: usize) -> Self {
        Self {
            concurrency: n,
            ..Self::default()
        }
    }

    /// Sets the output capacity.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Checks the options for the named stage.
    ///
    /// # Errors
    ///
    /// Returns an error if the concurrency degree is zero.
    pub fn validate(&self, stage: &str) -> Result<(), ConfigurationError> {
        if self.concurrency == 0 {
            return Err(ConfigurationError::new(format!(
                "Stage '{stage}' must have a concurrency degree of at least 1"
            ))
            .with_stage(stage)
            .with_context_entry("concurrency", "0"));
        }
        Ok(())
    }
}

/// Configuration of a named stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    /// The stage name, used in logs, events and failure records.
    pub name: String,
    /// Concurrency and capacity.
    #[serde(flatten)]
    pub options: StageOptions,
}

impl StageConfig {
    /// Creates a stage configuration.
    #[must_use]
    pub fn new(name: impl Into<String>, options: StageOptions) -> Self {
        Self {
            name: name.into(),
            options,
        }
    }
}

/// Configuration of a whole pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// The pipeline name.
    #[serde(default = "default_pipeline_name")]
    pub name: String,
    /// Capacity of the queue fed by the source (`0` = unbounded).
    #[serde(default = "default_capacity")]
    pub source_capacity: usize,
    /// How per-item failures are handled.
    #[serde(default)]
    pub error_policy: ErrorPolicy,
    /// The stages, in pipeline order.
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: default_pipeline_name(),
            source_capacity: default_capacity(),
            error_policy: ErrorPolicy::default(),
            stages: Vec::new(),
        }
    }
}

impl PipelineConfig {
    /// Creates an empty configuration with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Appends a stage.
    #[must_use]
    pub fn with_stage(mut self, name: impl Into<String>, options: StageOptions) -> Self {
        self.stages.push(StageConfig::new(name, options));
        self
    }

    /// Sets the error policy.
    #[must_use]
    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    /// Sets the source queue capacity.
    #[must_use]
    pub fn with_source_capacity(mut self, capacity: usize) -> Self {
        self.source_capacity = capacity;
        self
    }

    /// Parses and validates a JSON configuration.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] for malformed JSON, negative
    /// capacities or concurrency degrees, and zero concurrency.
    pub fn from_json(json: &str) -> Result<Self, ConfigurationError> {
        let config: Self = serde_json::from_str(json).map_err(|e| {
            ConfigurationError::new(format!("Invalid pipeline configuration: {e}"))
                .with_context_entry("line", e.line().to_string())
                .with_context_entry("column", e.column().to_string())
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every stage.
    ///
    /// # Errors
    ///
    /// Returns the first invalid stage's error.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.stages
            .iter()
            .try_for_each(|stage| stage.options.validate(&stage.name))
    }

    /// Returns the per-stage capacities in order.
    #[must_use]
    pub fn capacities(&self) -> Vec<usize> {
        self.stages.iter().map(|s| s.options.capacity).collect()
    }

    /// Returns the per-stage concurrency degrees in order.
    #[must_use]
    pub fn concurrencies(&self) -> Vec<usize> {
        self.stages.iter().map(|s| s.options.concurrency).collect()
    }
}
