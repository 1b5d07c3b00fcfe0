//! Replay Core - deterministic state evaluation for ledger-recorded contracts
//!
//! A contract's current state is never stored on the ledger. It is derived
//! by replaying every recorded interaction, in a canonical order, through
//! the contract's handler, starting from the initial state published at
//! deployment.
//!
//! # Architecture
//!
//! ```text
//! Loaders → Sorter → Evaluator ─── fold ───→ EvaluationResult
//!                      ↑   ↓                     ↓
//!               Evolve │   Executor (native | script)
//!                      │   ↓                     ↓
//!                      └── Nested calls      State cache
//! ```
//!
//! # Guarantees
//!
//! - **Deterministic**: Same ledger history always yields identical state
//! - **Resumable**: Evaluation continues from the latest valid checkpoint
//! - **Isolated**: Handlers run on private state copies with bounded time and gas
//! - **Total**: Failing interactions are recorded as invalid, never dropped silently

pub mod cache;
pub mod error;
pub mod evaluator;
pub mod evolve;
pub mod executor;
pub mod loader;
pub mod nested;
pub mod options;
pub mod sort_key;
pub mod trace;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub use error::{Error, Result};
pub use evaluator::{StateEvaluator, StateEvaluatorBuilder};
pub use options::{EvaluationOptions, StackTraceOptions};
pub use sort_key::{IdentitySorter, InteractionsSorter, LexicographicalSorter, Position, SortKey};
pub use trace::{ContractCallStack, InteractionCall, TracedState};

/// Longest error message kept in an evaluation result.
pub const MAX_ERROR_MESSAGE_LEN: usize = 10_000;

// ── Contract Definition ───────────────────────────────────

/// Execution backend a contract source targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Handler registered in-process under the source's name
    Native,
    /// Metered handler script interpreted in the sandbox
    Script,
}

/// Executable contract source
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContractSource {
    pub kind: SourceKind,
    /// Registered handler name for native sources, program text for scripts
    pub code: String,
}

impl ContractSource {
    pub fn native(name: impl Into<String>) -> Self {
        Self {
            kind: SourceKind::Native,
            code: name.into(),
        }
    }

    pub fn script(code: impl Into<String>) -> Self {
        Self {
            kind: SourceKind::Script,
            code: code.into(),
        }
    }
}

/// Everything needed to start replaying a contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractDefinition {
    pub contract_id: String,
    /// Id of the source currently attached (changes on evolve)
    pub source_id: String,
    pub source: ContractSource,
    pub initial_state: serde_json::Value,
    pub owner: String,
}

// ── Interactions ──────────────────────────────────────────

/// Block that carried an interaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub height: u64,
    /// base64url block identifier
    pub hash: String,
    pub timestamp: u64,
}

impl BlockInfo {
    pub fn new(height: u64, hash: impl Into<String>, timestamp: u64) -> Self {
        Self {
            height,
            hash: hash.into(),
            timestamp,
        }
    }
}

/// Gateway confirmation status of an interaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationStatus {
    Confirmed,
    NotProcessed,
    Forked,
}

/// One ledger transaction addressed to a contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interaction {
    /// base64url transaction id
    pub id: String,
    pub caller: String,
    pub block: BlockInfo,
    /// Raw JSON payload as recorded on the ledger
    pub input: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_key: Option<SortKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation_status: Option<ConfirmationStatus>,
}

impl Interaction {
    pub fn new(
        id: impl Into<String>,
        caller: impl Into<String>,
        block: BlockInfo,
        input: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            caller: caller.into(),
            block,
            input: input.into(),
            sort_key: None,
            confirmation_status: None,
        }
    }

    pub fn with_status(mut self, status: ConfirmationStatus) -> Self {
        self.confirmation_status = Some(status);
        self
    }

    /// Sort key assigned by the sorter.
    pub fn key(&self) -> Result<&SortKey> {
        self.sort_key
            .as_ref()
            .ok_or_else(|| Error::DataIntegrity(format!("interaction {} has no sort key", self.id)))
    }

    /// Anything not positively confirmed may still be reorganized away.
    pub fn is_provisional(&self) -> bool {
        !matches!(
            self.confirmation_status,
            None | Some(ConfirmationStatus::Confirmed)
        )
    }
}

/// Frame of the nested-call chain: a contract evaluating an interaction
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallChainEntry {
    pub contract_id: String,
    pub interaction_id: String,
}

impl CallChainEntry {
    pub fn new(contract_id: impl Into<String>, interaction_id: impl Into<String>) -> Self {
        Self {
            contract_id: contract_id.into(),
            interaction_id: interaction_id.into(),
        }
    }
}

// ── Results ───────────────────────────────────────────────

/// Why an interaction was marked invalid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Contract rejected the input
    Business,
    /// Handler crashed or raised an unexpected error
    Runtime,
    Timeout,
    OutOfGas,
    /// Handler touched a forbidden capability
    SandboxViolation,
    /// Handler returned neither a state nor a result
    UnexpectedResult,
    CallCycle,
    CallDepth,
    /// Internal write attempted with internal writes disabled
    InternalWrite,
    /// New source could not be loaded after an evolve
    Evolve,
}

impl FailureKind {
    /// Business rejections are expected; everything else is a fault.
    pub fn is_fault(&self) -> bool {
        !matches!(self, FailureKind::Business)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Business => "business",
            FailureKind::Runtime => "runtime",
            FailureKind::Timeout => "timeout",
            FailureKind::OutOfGas => "out_of_gas",
            FailureKind::SandboxViolation => "sandbox_violation",
            FailureKind::UnexpectedResult => "unexpected_result",
            FailureKind::CallCycle => "call_cycle",
            FailureKind::CallDepth => "call_depth",
            FailureKind::InternalWrite => "internal_write",
            FailureKind::Evolve => "evolve",
        };
        f.write_str(name)
    }
}

/// Recorded failure of a single interaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionError {
    pub kind: FailureKind,
    pub message: String,
}

impl InteractionError {
    /// Messages are capped so one noisy contract cannot bloat the cache.
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.len() > MAX_ERROR_MESSAGE_LEN {
            let mut end = MAX_ERROR_MESSAGE_LEN;
            while !message.is_char_boundary(end) {
                end -= 1;
            }
            message.truncate(end);
        }
        Self { kind, message }
    }
}

/// Outcome of replaying a contract up to some position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub state: serde_json::Value,
    /// Interaction id → whether it was accepted
    pub validity: BTreeMap<String, bool>,
    /// Interaction id → failure details for rejected interactions
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub errors: BTreeMap<String, InteractionError>,
}

impl EvaluationResult {
    /// Result before any interaction has been applied.
    pub fn genesis(state: serde_json::Value) -> Self {
        Self {
            state,
            validity: BTreeMap::new(),
            errors: BTreeMap::new(),
        }
    }

    /// Record a verdict. Verdicts are write-once.
    pub fn record(&mut self, interaction_id: &str, error: Option<InteractionError>) {
        if self.validity.contains_key(interaction_id) {
            return;
        }
        self.validity
            .insert(interaction_id.to_string(), error.is_none());
        if let Some(error) = error {
            self.errors.insert(interaction_id.to_string(), error);
        }
    }
}
