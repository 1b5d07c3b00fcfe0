//! The surface a running handler is allowed to touch
//!
//! Everything a handler can observe is either part of the interaction
//! (contract identity, transaction, block) or goes through a
//! [`ContractHost`] that re-enters the evaluator deterministically.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;

use super::{Fault, Outcome};
use crate::nested::EvaluationPass;
use crate::trace::CallSink;
use crate::{
    BlockInfo, CallChainEntry, ContractDefinition, EvaluationOptions, EvaluationResult,
    FailureKind, Interaction,
};

/// Gas charged per nested-call builtin.
pub const HOST_CALL_GAS: u64 = 1_000;

// ── Execution Context ─────────────────────────────────────

/// Read-only identity of one handler invocation
#[derive(Debug)]
pub struct ExecutionContext {
    /// Definition active for this interaction (after any evolve)
    pub definition: Arc<ContractDefinition>,
    pub interaction: Interaction,
    /// Frames above this invocation; empty for a top-level evaluation
    pub call_chain: Vec<CallChainEntry>,
    pub depth: usize,
    pub options: Arc<EvaluationOptions>,
    pub pass: Arc<EvaluationPass>,
    pub revocation: Revocation,
    /// Collects nested call stacks when call tracing is on
    pub trace: Option<CallSink>,
}

impl ExecutionContext {
    /// Frame this invocation adds to the chain of any call it makes.
    pub fn frame(&self) -> CallChainEntry {
        CallChainEntry::new(&self.definition.contract_id, &self.interaction.id)
    }
}

/// Shared cancellation flag for one handler invocation.
///
/// Flags form a chain: an invocation running inside a nested evaluation
/// holds a [`child`](Revocation::child) of its caller's flag and counts as
/// revoked as soon as any ancestor is.
#[derive(Debug, Clone, Default)]
pub struct Revocation {
    flag: Arc<AtomicBool>,
    parent: Option<Box<Revocation>>,
}

impl Revocation {
    /// Fresh flag revoked along with `self`.
    pub fn child(&self) -> Self {
        Self {
            flag: Arc::default(),
            parent: Some(Box::new(self.clone())),
        }
    }

    pub fn revoke(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_revoked(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self.parent.as_deref().is_some_and(Revocation::is_revoked)
    }
}

// ── Gas ───────────────────────────────────────────────────

/// Per-invocation gas counter
#[derive(Debug)]
pub struct GasMeter {
    limit: Option<u64>,
    used: Cell<u64>,
}

impl GasMeter {
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            limit,
            used: Cell::new(0),
        }
    }

    pub fn used(&self) -> u64 {
        self.used.get()
    }

    pub fn charge(&self, amount: u64) -> Result<(), Fault> {
        let used = self.used.get().saturating_add(amount);
        self.used.set(used);
        match self.limit {
            Some(limit) if used > limit => Err(Fault::new(
                FailureKind::OutOfGas,
                format!("gas limit {limit} exceeded"),
            )),
            _ => Ok(()),
        }
    }
}

// ── Host ──────────────────────────────────────────────────

/// Cross-contract capabilities offered to handlers
pub trait ContractHost: Send + Sync {
    /// State of `target` at the calling interaction's position.
    fn read_contract_state(&self, target: &str) -> Result<EvaluationResult, Fault>;

    /// Non-committing view call on `target`.
    fn view_contract_state(&self, target: &str, input: Value) -> Result<Outcome, Fault>;

    /// Dry-run write on `target`, visible to later reads in the same pass.
    fn write(&self, target: &str, input: Value) -> Result<Outcome, Fault>;

    /// The calling contract's own state just before the calling
    /// interaction, including dry writes made to it earlier in the pass.
    fn refresh_state(&self) -> Result<EvaluationResult, Fault>;
}

/// Host for invocations with no evaluator behind them
#[derive(Debug, Clone, Copy, Default)]
pub struct DetachedHost;

impl DetachedHost {
    fn refuse(target: &str) -> Fault {
        Fault::new(
            FailureKind::SandboxViolation,
            format!("nested calls are unavailable (target {target})"),
        )
    }
}

impl ContractHost for DetachedHost {
    fn read_contract_state(&self, target: &str) -> Result<EvaluationResult, Fault> {
        Err(Self::refuse(target))
    }

    fn view_contract_state(&self, target: &str, _input: Value) -> Result<Outcome, Fault> {
        Err(Self::refuse(target))
    }

    fn write(&self, target: &str, _input: Value) -> Result<Outcome, Fault> {
        Err(Self::refuse(target))
    }

    fn refresh_state(&self) -> Result<EvaluationResult, Fault> {
        Err(Self::refuse("self"))
    }
}

// ── Sandbox ───────────────────────────────────────────────

/// Isolated environment handed to a running handler
pub struct Sandbox {
    context: Arc<ExecutionContext>,
    host: Arc<dyn ContractHost>,
    gas: GasMeter,
}

impl Sandbox {
    pub fn new(context: Arc<ExecutionContext>, host: Arc<dyn ContractHost>) -> Self {
        let gas = GasMeter::new(context.options.gas_limit);
        Self { context, host, gas }
    }

    pub fn contract_id(&self) -> &str {
        &self.context.definition.contract_id
    }

    pub fn owner(&self) -> &str {
        &self.context.definition.owner
    }

    pub fn interaction(&self) -> &Interaction {
        &self.context.interaction
    }

    pub fn block(&self) -> &BlockInfo {
        &self.context.interaction.block
    }

    pub fn gas_used(&self) -> u64 {
        self.gas.used()
    }

    /// Fail fast once the invocation has been revoked.
    pub fn check_live(&self) -> Result<(), Fault> {
        if self.context.revocation.is_revoked() {
            return Err(Fault::new(
                FailureKind::Timeout,
                "execution revoked after timeout",
            ));
        }
        Ok(())
    }

    /// Charge gas. Also the cooperative cancellation point.
    pub fn charge(&self, amount: u64) -> Result<(), Fault> {
        self.check_live()?;
        self.gas.charge(amount)
    }

    /// Fault for a capability no handler may use.
    pub fn forbidden(&self, capability: &str) -> Fault {
        tracing::warn!(
            contract = %self.contract_id(),
            interaction = %self.context.interaction.id,
            capability,
            "sandbox violation"
        );
        Fault::new(
            FailureKind::SandboxViolation,
            format!("'{capability}' is not available to contracts"),
        )
    }

    pub fn read_contract_state(&self, target: &str) -> Result<EvaluationResult, Fault> {
        self.charge(HOST_CALL_GAS)?;
        self.host.read_contract_state(target)
    }

    pub fn view_contract_state(&self, target: &str, input: Value) -> Result<Outcome, Fault> {
        self.charge(HOST_CALL_GAS)?;
        self.host.view_contract_state(target, input)
    }

    pub fn write(&self, target: &str, input: Value) -> Result<Outcome, Fault> {
        self.charge(HOST_CALL_GAS)?;
        self.host.write(target, input)
    }

    pub fn refresh_state(&self) -> Result<EvaluationResult, Fault> {
        self.charge(HOST_CALL_GAS)?;
        self.host.refresh_state()
    }
}
