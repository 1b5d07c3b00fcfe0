//! Cross-contract calls made from inside a running handler
//!
//! Reads, views and writes re-enter the evaluator at the calling
//! interaction's sort key, so a nested result depends only on ledger data
//! up to that point. The call chain travels with every nested evaluation;
//! re-entering a `(contract, interaction)` pair already on the chain is a
//! cycle fault, and nesting deeper than `max_call_depth` is a depth fault.
//!
//! Writes are dry runs: the target's new state lives in the
//! [`EvaluationPass`] overlay for the rest of the top-level pass and is
//! never committed to the long-lived cache.
//!
//! A nested evaluation runs under its caller's [`Revocation`], so once the
//! calling invocation times out nothing it started can write or checkpoint.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::Value;

use crate::cache::CacheEntry;
use crate::evaluator::{EvalRequest, Evaluated};
use crate::executor::{ContractHost, ExecutionContext, Fault, Outcome, Revocation};
use crate::trace::{CallSink, ContractCallStack, InteractionCall};
use crate::{
    CallChainEntry, EvaluationResult, FailureKind, Interaction, SortKey, StateEvaluator,
};

// ── Evaluation Pass ───────────────────────────────────────

/// Saved overlay contents, restored when the calling interaction fails
#[derive(Debug, Clone, Default)]
pub struct OverlaySnapshot(BTreeMap<String, CacheEntry>);

/// State shared by every evaluation under one top-level request
#[derive(Debug, Default)]
pub struct EvaluationPass {
    uncommitted: Mutex<BTreeMap<String, CacheEntry>>,
}

impl EvaluationPass {
    /// Dry-written result for `contract_id` at or before `bound`.
    pub fn uncommitted(&self, contract_id: &str, bound: &SortKey) -> Option<CacheEntry> {
        self.uncommitted
            .lock()
            .get(contract_id)
            .filter(|entry| &entry.sort_key <= bound)
            .cloned()
    }

    /// Dry-written result for `contract_id` strictly before `key`.
    pub fn uncommitted_before(&self, contract_id: &str, key: &SortKey) -> Option<CacheEntry> {
        self.uncommitted
            .lock()
            .get(contract_id)
            .filter(|entry| &entry.sort_key < key)
            .cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.uncommitted.lock().is_empty()
    }

    pub fn snapshot(&self) -> OverlaySnapshot {
        OverlaySnapshot(self.uncommitted.lock().clone())
    }

    pub fn restore(&self, snapshot: OverlaySnapshot) {
        *self.uncommitted.lock() = snapshot.0;
    }

    /// Record a dry write unless the writer has been revoked. Checked under
    /// the overlay lock so a revoked writer can never land a late update.
    pub fn commit_write(
        &self,
        revocation: &Revocation,
        contract_id: &str,
        entry: CacheEntry,
    ) -> bool {
        let mut overlay = self.uncommitted.lock();
        if revocation.is_revoked() {
            return false;
        }
        overlay.insert(contract_id.to_string(), entry);
        true
    }

    /// Revoke an invocation, serialized against in-flight writes.
    pub fn revoke(&self, revocation: &Revocation) {
        let _overlay = self.uncommitted.lock();
        revocation.revoke();
    }
}

// ── Coordinator ───────────────────────────────────────────

/// [`ContractHost`] backed by the evaluator, bound to one invocation
pub(crate) struct NestedCallCoordinator {
    evaluator: StateEvaluator,
    context: Arc<ExecutionContext>,
}

impl NestedCallCoordinator {
    pub(crate) fn new(evaluator: StateEvaluator, context: Arc<ExecutionContext>) -> Self {
        Self { evaluator, context }
    }

    fn check_depth(&self, target: &str) -> Result<(), Fault> {
        let max = self.context.options.max_call_depth;
        if self.context.depth + 1 > max {
            return Err(Fault::new(
                FailureKind::CallDepth,
                format!("call to {target} exceeds max call depth {max}"),
            ));
        }
        Ok(())
    }

    fn calling_key(&self) -> Result<SortKey, Fault> {
        self.context
            .interaction
            .key()
            .cloned()
            .map_err(|e| Fault::new(FailureKind::Runtime, e.to_string()))
    }

    /// Validate the call and build the chain the callee runs under.
    fn enter(&self, target: &str) -> Result<(Vec<CallChainEntry>, SortKey), Fault> {
        self.check_depth(target)?;
        let context = &self.context;
        let mut chain = context.call_chain.clone();
        chain.push(context.frame());
        let frame = CallChainEntry::new(target, &context.interaction.id);
        if chain.contains(&frame) {
            let path: Vec<&str> = chain.iter().map(|e| e.contract_id.as_str()).collect();
            return Err(Fault::new(
                FailureKind::CallCycle,
                format!(
                    "call cycle: {} -> {} at interaction {}",
                    path.join(" -> "),
                    target,
                    context.interaction.id
                ),
            ));
        }

        Ok((chain, self.calling_key()?))
    }

    fn evaluate_target(
        &self,
        target: &str,
        chain: Vec<CallChainEntry>,
        key: SortKey,
    ) -> Result<Evaluated, Fault> {
        tracing::debug!(
            caller = %self.context.definition.contract_id,
            callee = target,
            depth = self.context.depth + 1,
            "nested evaluation"
        );
        let request = EvalRequest {
            contract_id: target.to_string(),
            upper: Some(key),
            call_chain: chain,
            depth: self.context.depth + 1,
            options: Arc::clone(&self.context.options),
            pass: Arc::clone(&self.context.pass),
            revocation: self.context.revocation.clone(),
        };
        self.evaluator.evaluate(request).map_err(|e| {
            Fault::new(
                e.failure_kind(),
                format!("nested evaluation of {target} failed: {e}"),
            )
        })
    }

    /// Hand a callee's stack to the calling invocation's trace, with the
    /// dry run made against it, if any.
    fn record(&self, stack: Option<ContractCallStack>, dry_run: Option<InteractionCall>) {
        let (Some(sink), Some(mut stack)) = (&self.context.trace, stack) else {
            return;
        };
        stack.interactions.extend(dry_run);
        sink.push(stack);
    }

    /// Run `input` against an evaluated target as the calling contract.
    fn dry_run(
        &self,
        evaluated: &Evaluated,
        chain: Vec<CallChainEntry>,
        input: Value,
    ) -> (Outcome, Option<InteractionCall>) {
        let calling = &self.context.interaction;
        let mut interaction = Interaction::new(
            calling.id.clone(),
            self.context.definition.contract_id.clone(),
            calling.block.clone(),
            input.to_string(),
        );
        interaction.sort_key = calling.sort_key.clone();
        interaction.confirmation_status = calling.confirmation_status;

        let call = self
            .context
            .trace
            .as_ref()
            .map(|_| InteractionCall::new(&interaction, &input, true));
        let sink = call.as_ref().map(|_| CallSink::default());
        let context = ExecutionContext {
            definition: Arc::clone(&evaluated.context.definition),
            interaction,
            call_chain: chain,
            depth: self.context.depth + 1,
            options: Arc::clone(&self.context.options),
            pass: Arc::clone(&self.context.pass),
            revocation: self.context.revocation.clone(),
            trace: sink.clone(),
        };
        let started = Instant::now();
        let outcome = self
            .evaluator
            .run_detached(evaluated, input, Arc::new(context));

        let call = match (call, sink) {
            (Some(mut call), Some(sink)) => {
                let (gas_used, state) = match &outcome {
                    Outcome::Ok {
                        gas_used, state, ..
                    } => (*gas_used, state.clone()),
                    _ => (0, None),
                };
                let state = state.filter(|_| self.context.options.stack_trace.save_state);
                call.finish(
                    &sink,
                    outcome.failure().as_ref(),
                    gas_used,
                    started.elapsed(),
                    state,
                );
                Some(call)
            }
            _ => None,
        };
        (outcome, call)
    }
}

impl ContractHost for NestedCallCoordinator {
    fn read_contract_state(&self, target: &str) -> Result<EvaluationResult, Fault> {
        let (chain, key) = self.enter(target)?;
        let evaluated = self.evaluate_target(target, chain, key)?;
        self.record(evaluated.call_stack, None);
        Ok(evaluated.result)
    }

    fn view_contract_state(&self, target: &str, input: Value) -> Result<Outcome, Fault> {
        let (chain, key) = self.enter(target)?;
        let mut evaluated = self.evaluate_target(target, chain.clone(), key)?;
        let (outcome, call) = self.dry_run(&evaluated, chain, input);
        self.record(evaluated.call_stack.take(), call);
        match outcome {
            Outcome::Fault(fault) => Err(fault),
            outcome => Ok(outcome),
        }
    }

    fn write(&self, target: &str, input: Value) -> Result<Outcome, Fault> {
        if !self.context.options.internal_writes {
            return Err(Fault::new(
                FailureKind::InternalWrite,
                format!("internal writes are disabled (write to {target})"),
            ));
        }
        let (chain, key) = self.enter(target)?;
        let mut evaluated = self.evaluate_target(target, chain.clone(), key.clone())?;
        let (outcome, call) = self.dry_run(&evaluated, chain, input);
        self.record(evaluated.call_stack.take(), call);

        match &outcome {
            Outcome::Fault(fault) => return Err(fault.clone()),
            Outcome::Ok {
                state: Some(state), ..
            } => {
                let mut result = evaluated.result.clone();
                result.state = state.clone();
                result.record(&self.context.interaction.id, None);
                let entry = CacheEntry {
                    sort_key: key,
                    value: result,
                };
                if !self
                    .context
                    .pass
                    .commit_write(&self.context.revocation, target, entry)
                {
                    return Err(Fault::new(
                        FailureKind::Timeout,
                        "execution revoked after timeout",
                    ));
                }
                tracing::debug!(
                    caller = %self.context.definition.contract_id,
                    callee = target,
                    "recorded internal write"
                );
            }
            _ => {}
        }
        Ok(outcome)
    }

    /// Re-evaluates the calling contract under a chain that already holds
    /// the calling frame, so the fold stops just before this interaction
    /// and picks up any dry write made to the contract earlier in the pass.
    fn refresh_state(&self) -> Result<EvaluationResult, Fault> {
        let contract_id = self.context.definition.contract_id.clone();
        self.check_depth(&contract_id)?;
        let mut chain = self.context.call_chain.clone();
        chain.push(self.context.frame());
        let evaluated = self.evaluate_target(&contract_id, chain, self.calling_key()?)?;
        self.record(evaluated.call_stack, None);
        Ok(evaluated.result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(height: u64, n: i64) -> CacheEntry {
        CacheEntry {
            sort_key: SortKey::block_upper_bound(height),
            value: EvaluationResult::genesis(json!({ "n": n })),
        }
    }

    #[test]
    fn test_overlay_respects_bound() {
        let pass = EvaluationPass::default();
        assert!(pass.commit_write(&Revocation::default(), "b", entry(5, 1)));
        assert!(pass.uncommitted("b", &SortKey::block_upper_bound(4)).is_none());
        assert_eq!(
            pass.uncommitted("b", &SortKey::block_upper_bound(5)).unwrap().value.state,
            json!({"n": 1})
        );
        assert!(pass.uncommitted("a", &SortKey::block_upper_bound(9)).is_none());
    }

    #[test]
    fn test_overlay_before_is_strict() {
        let pass = EvaluationPass::default();
        pass.commit_write(&Revocation::default(), "b", entry(5, 1));
        assert!(pass.uncommitted_before("b", &SortKey::block_upper_bound(5)).is_none());
        assert!(pass.uncommitted_before("b", &SortKey::block_upper_bound(6)).is_some());
    }

    #[test]
    fn test_snapshot_restore() {
        let pass = EvaluationPass::default();
        let snapshot = pass.snapshot();
        pass.commit_write(&Revocation::default(), "b", entry(1, 1));
        assert!(!pass.is_empty());
        pass.restore(snapshot);
        assert!(pass.is_empty());
    }

    #[test]
    fn test_revoked_writer_cannot_commit() {
        let pass = EvaluationPass::default();
        let revocation = Revocation::default();
        pass.revoke(&revocation);
        assert!(!pass.commit_write(&revocation, "b", entry(1, 1)));
        assert!(pass.is_empty());
    }

    #[test]
    fn test_writer_revoked_through_ancestor() {
        let pass = EvaluationPass::default();
        let caller = Revocation::default();
        let nested = caller.child().child();
        pass.revoke(&caller);
        assert!(!pass.commit_write(&nested, "b", entry(1, 1)));
        assert!(pass.is_empty());
    }
}
