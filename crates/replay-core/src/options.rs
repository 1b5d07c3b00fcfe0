//! Evaluation options
//!
//! Every knob has a default, so an empty JSON object is a valid
//! configuration. Field names are camelCase on the wire.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Result;

/// Default ceiling on nested-call depth.
pub const DEFAULT_MAX_CALL_DEPTH: usize = 7;

/// Default per-interaction wall-clock budget, in seconds.
pub const DEFAULT_INTERACTION_TIMEOUT_SECS: f64 = 60.0;

/// Options controlling a single evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EvaluationOptions {
    /// When false, the first fault aborts the evaluation.
    pub ignore_exceptions: bool,
    /// Wall-clock budget per interaction. `None` disables the timeout.
    pub max_interaction_evaluation_time_seconds: Option<f64>,
    /// Allow contracts to dry-run writes against other contracts.
    pub internal_writes: bool,
    /// Gas budget per interaction for metered backends. `None` is unmetered.
    pub gas_limit: Option<u64>,
    /// Maximum nesting of cross-contract calls.
    pub max_call_depth: usize,
    /// Checkpoint after every folded interaction.
    pub update_cache_for_each_interaction: bool,
    /// Checkpoint every n-th interaction when per-interaction caching is off.
    pub cache_every_n_interactions: Option<usize>,
    /// Call-stack recording
    pub stack_trace: StackTraceOptions,
}

/// Opt-in call-stack tracing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StackTraceOptions {
    pub enabled: bool,
    /// Keep each invocation's resulting state in the trace
    pub save_state: bool,
}

impl Default for EvaluationOptions {
    fn default() -> Self {
        Self {
            ignore_exceptions: true,
            max_interaction_evaluation_time_seconds: Some(DEFAULT_INTERACTION_TIMEOUT_SECS),
            internal_writes: false,
            gas_limit: None,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            update_cache_for_each_interaction: true,
            cache_every_n_interactions: None,
            stack_trace: StackTraceOptions::default(),
        }
    }
}

impl EvaluationOptions {
    /// Parse options from JSON, filling omitted fields with defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Timeout as a `Duration`, or `None` if disabled, non-positive or too
    /// large to represent.
    pub fn interaction_timeout(&self) -> Option<Duration> {
        self.max_interaction_evaluation_time_seconds
            .filter(|secs| *secs > 0.0)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    /// Whether the `index`-th folded interaction (zero based) is checkpointed.
    pub fn checkpoints_at(&self, index: usize) -> bool {
        if self.update_cache_for_each_interaction {
            return true;
        }
        match self.cache_every_n_interactions {
            Some(n) if n > 0 => index % n == 0,
            _ => false,
        }
    }

    pub fn with_ignore_exceptions(mut self, ignore: bool) -> Self {
        self.ignore_exceptions = ignore;
        self
    }

    pub fn with_timeout(mut self, seconds: Option<f64>) -> Self {
        self.max_interaction_evaluation_time_seconds = seconds;
        self
    }

    pub fn with_internal_writes(mut self, enabled: bool) -> Self {
        self.internal_writes = enabled;
        self
    }

    pub fn with_gas_limit(mut self, limit: Option<u64>) -> Self {
        self.gas_limit = limit;
        self
    }

    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }

    pub fn with_cache_policy(mut self, each: bool, every_n: Option<usize>) -> Self {
        self.update_cache_for_each_interaction = each;
        self.cache_every_n_interactions = every_n;
        self
    }

    pub fn with_stack_trace(mut self, enabled: bool, save_state: bool) -> Self {
        self.stack_trace = StackTraceOptions {
            enabled,
            save_state,
        };
        self
    }
}
