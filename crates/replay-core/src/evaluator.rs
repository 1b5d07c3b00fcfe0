//! State evaluator - folds a contract's interactions into its state
//!
//! # Algorithm
//!
//! 1. Load the definition and prepare its handler
//! 2. Load and sort interactions up to the requested position, dropping any
//!    that would re-enter the current call chain
//! 3. Seed from an uncommitted write made earlier in this pass if there is
//!    one, else from the newest consistent checkpoint, else from the
//!    initial state
//! 4. Replay the remaining interactions: run the handler, record validity,
//!    apply modifiers (evolve), checkpoint
//!
//! # Guarantees
//!
//! - **Deterministic**: identical ledger data yields identical results
//! - **Monotonic**: a verdict recorded for an interaction is never revised
//! - **Prefix-resumable**: evaluating to P and then to Q equals evaluating
//!   to Q directly
//! - **Confirmed-only caching**: nothing at or after a provisional
//!   interaction is checkpointed

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::cache::{CacheEntry, CacheKey, MemoryStateCache, StateCache};
use crate::evolve::{ContractContext, Evolve, ExecutionContextModifier};
use crate::executor::{
    Action, ExecutionContext, ExecutorFactory, NativeRegistry, Outcome, Revocation,
};
use crate::loader::{DefinitionLoader, InteractionLoader};
use crate::nested::{EvaluationPass, NestedCallCoordinator};
use crate::trace::{CallSink, ContractCallStack, InteractionCall, TracedState};
use crate::{
    BlockInfo, CallChainEntry, ConfirmationStatus, Error, EvaluationOptions, EvaluationResult,
    FailureKind, Interaction, InteractionError, InteractionsSorter, LexicographicalSorter,
    Position, Result, SortKey,
};

// ── Requests ──────────────────────────────────────────────

/// One (possibly nested) evaluation
pub(crate) struct EvalRequest {
    pub contract_id: String,
    /// Inclusive upper bound; `None` means everything loaded
    pub upper: Option<SortKey>,
    pub call_chain: Vec<CallChainEntry>,
    pub depth: usize,
    pub options: Arc<EvaluationOptions>,
    pub pass: Arc<EvaluationPass>,
    /// Flag of the invocation that asked for this evaluation
    pub revocation: Revocation,
}

/// A finished evaluation plus what is needed to run calls against it
pub(crate) struct Evaluated {
    pub result: EvaluationResult,
    /// Key of the last interaction covered, if any
    pub sort_key: Option<SortKey>,
    /// Block of the last interaction within the bound
    pub last_block: Option<BlockInfo>,
    pub context: ContractContext,
    pub call_stack: Option<ContractCallStack>,
}

enum Seed {
    Genesis,
    Cached(CacheEntry),
    Uncommitted(CacheEntry),
}

// ── Evaluator ─────────────────────────────────────────────

struct Inner {
    definitions: Arc<dyn DefinitionLoader>,
    interactions: Arc<dyn InteractionLoader>,
    sorter: Arc<dyn InteractionsSorter>,
    cache: Arc<dyn StateCache>,
    executors: ExecutorFactory,
    modifiers: Vec<Arc<dyn ExecutionContextModifier>>,
    options: EvaluationOptions,
}

/// Entry point for reading contract state. Cheap to clone; clones share
/// loaders, cache and prepared executors.
#[derive(Clone)]
pub struct StateEvaluator {
    inner: Arc<Inner>,
}

/// Builder for [`StateEvaluator`]
pub struct StateEvaluatorBuilder {
    definitions: Arc<dyn DefinitionLoader>,
    interactions: Arc<dyn InteractionLoader>,
    sorter: Arc<dyn InteractionsSorter>,
    cache: Option<Arc<dyn StateCache>>,
    natives: NativeRegistry,
    modifiers: Vec<Arc<dyn ExecutionContextModifier>>,
    evolve: bool,
    options: EvaluationOptions,
}

impl StateEvaluatorBuilder {
    /// Replace the default lexicographical sorter.
    pub fn sorter(mut self, sorter: Arc<dyn InteractionsSorter>) -> Self {
        self.sorter = sorter;
        self
    }

    /// Use `cache` instead of a fresh in-memory cache.
    pub fn cache(mut self, cache: Arc<dyn StateCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn natives(mut self, natives: NativeRegistry) -> Self {
        self.natives = natives;
        self
    }

    /// Add a modifier; modifiers run in registration order, after evolve.
    pub fn modifier(mut self, modifier: Arc<dyn ExecutionContextModifier>) -> Self {
        self.modifiers.push(modifier);
        self
    }

    /// Disable source evolution.
    pub fn without_evolve(mut self) -> Self {
        self.evolve = false;
        self
    }

    pub fn options(mut self, options: EvaluationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> StateEvaluator {
        let executors = ExecutorFactory::new(self.natives);
        let mut modifiers: Vec<Arc<dyn ExecutionContextModifier>> = Vec::new();
        if self.evolve {
            modifiers.push(Arc::new(Evolve::new(
                Arc::clone(&self.definitions),
                executors.clone(),
            )));
        }
        modifiers.extend(self.modifiers);

        StateEvaluator {
            inner: Arc::new(Inner {
                definitions: self.definitions,
                interactions: self.interactions,
                sorter: self.sorter,
                cache: self
                    .cache
                    .unwrap_or_else(|| Arc::new(MemoryStateCache::new())),
                executors,
                modifiers,
                options: self.options,
            }),
        }
    }
}

impl StateEvaluator {
    pub fn builder(
        definitions: Arc<dyn DefinitionLoader>,
        interactions: Arc<dyn InteractionLoader>,
    ) -> StateEvaluatorBuilder {
        StateEvaluatorBuilder {
            definitions,
            interactions,
            sorter: Arc::new(LexicographicalSorter),
            cache: None,
            natives: NativeRegistry::new(),
            modifiers: Vec::new(),
            evolve: true,
            options: EvaluationOptions::default(),
        }
    }

    pub fn options(&self) -> &EvaluationOptions {
        &self.inner.options
    }

    pub fn cache(&self) -> &Arc<dyn StateCache> {
        &self.inner.cache
    }

    pub fn natives(&self) -> &NativeRegistry {
        self.inner.executors.natives()
    }

    /// State of `contract_id` after every interaction up to `position`
    /// (inclusive), or after all known interactions.
    pub fn read_state(
        &self,
        contract_id: &str,
        position: Option<Position>,
    ) -> Result<EvaluationResult> {
        self.read_state_with(contract_id, position, &[], None)
    }

    /// Like [`read_state`](Self::read_state), under an explicit call chain
    /// and with per-call options.
    pub fn read_state_with(
        &self,
        contract_id: &str,
        position: Option<Position>,
        call_chain: &[CallChainEntry],
        options: Option<EvaluationOptions>,
    ) -> Result<EvaluationResult> {
        Ok(self
            .read_state_traced(contract_id, position, call_chain, options)?
            .result)
    }

    /// Like [`read_state_with`](Self::read_state_with), also returning the
    /// call-stack trace when `stackTrace.enabled` is set.
    pub fn read_state_traced(
        &self,
        contract_id: &str,
        position: Option<Position>,
        call_chain: &[CallChainEntry],
        options: Option<EvaluationOptions>,
    ) -> Result<TracedState> {
        let request = self.top_level_request(contract_id, position, call_chain, options);
        let evaluated = self.evaluate(request)?;
        Ok(TracedState {
            result: evaluated.result,
            call_stack: evaluated.call_stack,
        })
    }

    /// Run a read-only call against the state at `position`. Nothing is
    /// cached and the ledger is not touched.
    pub fn view_state(
        &self,
        contract_id: &str,
        input: Value,
        caller: &str,
        position: Option<Position>,
    ) -> Result<Outcome> {
        let upper = position.as_ref().map(Position::upper_bound);
        let request = self.top_level_request(contract_id, position, &[], None);
        let options = Arc::clone(&request.options);
        let pass = Arc::clone(&request.pass);
        let evaluated = self.evaluate(request)?;

        let block = evaluated
            .last_block
            .clone()
            .unwrap_or_else(|| BlockInfo::new(0, "", 0));
        let sort_key = evaluated
            .sort_key
            .clone()
            .or(upper)
            .unwrap_or_else(|| SortKey::block_upper_bound(block.height));
        let mut interaction = Interaction::new(
            view_interaction_id(contract_id, caller, &input, &sort_key),
            caller,
            block,
            input.to_string(),
        )
        .with_status(ConfirmationStatus::NotProcessed);
        interaction.sort_key = Some(sort_key);

        tracing::debug!(contract = contract_id, caller, "view call");
        let context = ExecutionContext {
            definition: Arc::clone(&evaluated.context.definition),
            interaction,
            call_chain: Vec::new(),
            depth: 0,
            options,
            pass,
            revocation: Revocation::default(),
            trace: None,
        };
        Ok(self.run_detached(&evaluated, input, Arc::new(context)))
    }

    fn top_level_request(
        &self,
        contract_id: &str,
        position: Option<Position>,
        call_chain: &[CallChainEntry],
        options: Option<EvaluationOptions>,
    ) -> EvalRequest {
        EvalRequest {
            contract_id: contract_id.to_string(),
            upper: position.map(|p| p.upper_bound()),
            call_chain: call_chain.to_vec(),
            depth: call_chain.len(),
            options: Arc::new(options.unwrap_or_else(|| self.inner.options.clone())),
            pass: Arc::new(EvaluationPass::default()),
            revocation: Revocation::default(),
        }
    }

    /// Run `input` against an evaluated contract without recording anything.
    pub(crate) fn run_detached(
        &self,
        evaluated: &Evaluated,
        input: Value,
        context: Arc<ExecutionContext>,
    ) -> Outcome {
        let action = Action {
            input,
            caller: context.interaction.caller.clone(),
        };
        let host = Arc::new(NestedCallCoordinator::new(self.clone(), Arc::clone(&context)));
        evaluated
            .context
            .handler
            .run(evaluated.result.state.clone(), action, context, host)
    }

    // ── Evaluation ─────────────────────────────────────────

    pub(crate) fn evaluate(&self, request: EvalRequest) -> Result<Evaluated> {
        let span = tracing::debug_span!(
            "evaluate",
            contract = %request.contract_id,
            depth = request.depth
        );
        let _entered = span.enter();
        let inner = &self.inner;

        let definition = inner.definitions.load(&request.contract_id, None)?;
        let handler = inner.executors.prepare(&definition)?;
        let mut context = ContractContext::new(definition, handler);

        let loaded = inner
            .interactions
            .load(&request.contract_id, None, request.upper.as_ref())?;
        let mut sorted = inner.sorter.sort(loaded)?;
        if let Some(upper) = &request.upper {
            sorted.retain(|tx| tx.sort_key.as_ref().is_some_and(|key| key <= upper));
        }
        let cut = truncate_cycles(&request, &mut sorted)?;
        let last_block = sorted.last().map(|tx| tx.block.clone());

        let (mut result, seed_key, committable, pure_hit) =
            match self.seed(&request, &sorted, cut.as_ref())? {
                Seed::Genesis => (
                    EvaluationResult::genesis(context.definition.initial_state.clone()),
                    None,
                    true,
                    false,
                ),
                Seed::Cached(entry) => (entry.value, Some(entry.sort_key), true, true),
                Seed::Uncommitted(entry) => (entry.value, Some(entry.sort_key), false, false),
            };

        let start = match &seed_key {
            Some(key) => sorted.partition_point(|tx| tx.sort_key.as_ref() <= Some(key)),
            None => 0,
        };
        if seed_key.is_some() {
            context = self.apply_modifiers(&result.state, context)?;
        }
        let mut trace = request
            .options
            .stack_trace
            .enabled
            .then(|| ContractCallStack::new(&request.contract_id, request.depth));
        if pure_hit && start == sorted.len() {
            tracing::debug!(sort_key = ?seed_key, "cache hit, nothing to replay");
            if let Some(trace) = &mut trace {
                trace.cache_hit = true;
            }
            return Ok(Evaluated {
                result,
                sort_key: seed_key,
                last_block,
                context,
                call_stack: trace,
            });
        }

        tracing::debug!(
            total = sorted.len(),
            missing = sorted.len() - start,
            resumed_from = ?seed_key,
            committable,
            "replaying interactions"
        );

        let mut provisional = false;
        let mut last_key = seed_key;
        let mut pending_checkpoint = false;
        for (index, tx) in sorted[start..].iter().enumerate() {
            ensure_live(&request, &tx.id)?;
            let key = tx.key()?.clone();
            provisional |= tx.is_provisional();

            let input: Value = match serde_json::from_str(&tx.input) {
                Ok(input) => input,
                Err(e) => {
                    tracing::warn!(interaction = %tx.id, error = %e, "skipping unparsable interaction");
                    continue;
                }
            };

            let failure =
                self.apply_interaction(&request, &mut context, &mut result, tx, input, trace.as_mut());
            if let Some(failure) = failure {
                if failure.kind.is_fault() && !request.options.ignore_exceptions {
                    return Err(Error::ExecutionFault {
                        contract_id: request.contract_id.clone(),
                        interaction_id: tx.id.clone(),
                        kind: failure.kind,
                        message: failure.message,
                    });
                }
            }
            last_key = Some(key.clone());

            if !committable || provisional {
                pending_checkpoint = false;
                continue;
            }
            if request.options.checkpoints_at(index) {
                self.checkpoint(&request, &tx.id, key, &result)?;
                pending_checkpoint = false;
            } else {
                pending_checkpoint = true;
            }
        }

        if pending_checkpoint {
            if let (Some(key), Some(tx)) = (&last_key, sorted.last()) {
                self.checkpoint(&request, &tx.id, key.clone(), &result)?;
            }
        }

        Ok(Evaluated {
            result,
            sort_key: last_key,
            last_block,
            context,
            call_stack: trace,
        })
    }

    /// Fold one interaction into `result`. Returns the recorded failure.
    fn apply_interaction(
        &self,
        request: &EvalRequest,
        context: &mut ContractContext,
        result: &mut EvaluationResult,
        tx: &Interaction,
        input: Value,
        trace: Option<&mut ContractCallStack>,
    ) -> Option<InteractionError> {
        let call = trace
            .as_ref()
            .map(|_| InteractionCall::new(tx, &input, false));
        let sink = call.as_ref().map(|_| CallSink::default());
        let execution = Arc::new(ExecutionContext {
            definition: Arc::clone(&context.definition),
            interaction: tx.clone(),
            call_chain: request.call_chain.clone(),
            depth: request.depth,
            options: Arc::clone(&request.options),
            pass: Arc::clone(&request.pass),
            revocation: request.revocation.child(),
            trace: sink.clone(),
        });
        let host = Arc::new(NestedCallCoordinator::new(self.clone(), Arc::clone(&execution)));
        let action = Action {
            input,
            caller: tx.caller.clone(),
        };
        let overlay = request.pass.snapshot();

        let started = Instant::now();
        let outcome = context
            .handler
            .run(result.state.clone(), action, execution, host);
        let elapsed = started.elapsed();
        let gas_used = match &outcome {
            Outcome::Ok { gas_used, .. } => *gas_used,
            _ => 0,
        };

        let failure = match outcome {
            Outcome::Ok { state, gas_used, .. } => {
                let previous = state.map(|s| std::mem::replace(&mut result.state, s));
                match self.apply_modifiers(&result.state, context.clone()) {
                    Ok(next) => {
                        *context = next;
                        tracing::trace!(interaction = %tx.id, gas_used, "interaction accepted");
                        None
                    }
                    Err(e) => {
                        if let Some(previous) = previous {
                            result.state = previous;
                        }
                        Some(InteractionError::new(FailureKind::Evolve, e.to_string()))
                    }
                }
            }
            other => other.failure(),
        };

        if let Some(failure) = &failure {
            request.pass.restore(overlay);
            if failure.kind.is_fault() {
                tracing::error!(
                    contract = %request.contract_id,
                    interaction = %tx.id,
                    kind = %failure.kind,
                    message = %failure.message,
                    "interaction faulted"
                );
            } else {
                tracing::warn!(interaction = %tx.id, message = %failure.message, "interaction rejected");
            }
        }
        result.record(&tx.id, failure.clone());

        if let (Some(stack), Some(mut call), Some(sink)) = (trace, call, sink) {
            let state = request
                .options
                .stack_trace
                .save_state
                .then(|| result.state.clone());
            call.finish(&sink, failure.as_ref(), gas_used, elapsed, state);
            stack.interactions.push(call);
        }
        failure
    }

    fn checkpoint(
        &self,
        request: &EvalRequest,
        interaction_id: &str,
        key: SortKey,
        result: &EvaluationResult,
    ) -> Result<()> {
        ensure_live(request, interaction_id)?;
        tracing::trace!(contract = %request.contract_id, sort_key = %key, "checkpoint");
        self.inner
            .cache
            .put(CacheKey::new(&request.contract_id, key), result.clone())
    }

    fn apply_modifiers(&self, state: &Value, mut context: ContractContext) -> Result<ContractContext> {
        for modifier in &self.inner.modifiers {
            context = modifier.modify(state, context)?;
        }
        Ok(context)
    }

    /// Newest usable starting point. A dry write made earlier in this pass
    /// always wins over checkpoints, and everything after it is replayed on
    /// top; results seeded this way are never committed.
    fn seed(
        &self,
        request: &EvalRequest,
        sorted: &[Interaction],
        cut: Option<&SortKey>,
    ) -> Result<Seed> {
        let contract_id = &request.contract_id;
        let overlay = match (cut, &request.upper, sorted.last()) {
            (Some(cut), _, _) => request.pass.uncommitted_before(contract_id, cut),
            (None, Some(upper), _) => request.pass.uncommitted(contract_id, upper),
            (None, None, Some(last)) => request.pass.uncommitted(contract_id, last.key()?),
            (None, None, None) => None,
        };
        if let Some(entry) = overlay {
            return Ok(Seed::Uncommitted(entry));
        }

        let bound = match (cut, &request.upper, sorted.last()) {
            (None, Some(upper), _) => upper,
            (_, _, Some(last)) => last.key()?,
            (_, _, None) => return Ok(Seed::Genesis),
        };
        match self.inner.cache.get_less_or_equal(contract_id, bound)? {
            Some(entry) if covers_known_interaction(&entry, sorted) => Ok(Seed::Cached(entry)),
            Some(entry) => {
                let e = Error::CacheInconsistency(format!(
                    "checkpoint {} of {} does not match loaded interactions",
                    entry.sort_key, contract_id
                ));
                tracing::warn!(error = %e, "recomputing from initial state");
                Ok(Seed::Genesis)
            }
            None => Ok(Seed::Genesis),
        }
    }
}

/// A revoked evaluation stops before running or caching anything more.
fn ensure_live(request: &EvalRequest, interaction_id: &str) -> Result<()> {
    if request.revocation.is_revoked() {
        return Err(Error::ExecutionFault {
            contract_id: request.contract_id.clone(),
            interaction_id: interaction_id.to_string(),
            kind: FailureKind::Timeout,
            message: "evaluation revoked after its caller timed out".into(),
        });
    }
    Ok(())
}

/// A checkpoint is trusted only if its key belongs to a loaded interaction
/// that the checkpoint has a verdict for.
fn covers_known_interaction(entry: &CacheEntry, sorted: &[Interaction]) -> bool {
    let index = sorted.partition_point(|tx| tx.sort_key.as_ref() < Some(&entry.sort_key));
    sorted
        .get(index)
        .filter(|tx| tx.sort_key.as_ref() == Some(&entry.sort_key))
        .is_some_and(|tx| entry.value.validity.contains_key(&tx.id))
}

/// Drop the first interaction that is already on the call chain for this
/// contract, and everything after it. Returns the key of the first dropped
/// interaction.
fn truncate_cycles(request: &EvalRequest, sorted: &mut Vec<Interaction>) -> Result<Option<SortKey>> {
    let cut = request
        .call_chain
        .iter()
        .filter(|entry| entry.contract_id == request.contract_id)
        .filter_map(|entry| sorted.iter().position(|tx| tx.id == entry.interaction_id))
        .min();
    let Some(index) = cut else {
        return Ok(None);
    };
    let key = sorted[index].key()?.clone();
    tracing::debug!(
        dropped = sorted.len() - index,
        "truncating interactions already on the call chain"
    );
    sorted.truncate(index);
    Ok(Some(key))
}

/// Deterministic id for a synthetic view interaction.
fn view_interaction_id(contract_id: &str, caller: &str, input: &Value, sort_key: &SortKey) -> String {
    let rendered = input.to_string();
    let mut hasher = Sha256::new();
    for part in [contract_id, caller, rendered.as_str(), sort_key.as_str()] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::HandlerOutput;
    use crate::loader::InMemoryLedger;
    use crate::{ContractDefinition, ContractSource};
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use serde_json::json;

    fn ledger_id(seed: &str) -> String {
        URL_SAFE_NO_PAD.encode(Sha256::digest(seed.as_bytes()))
    }

    fn setup() -> (InMemoryLedger, StateEvaluator) {
        let ledger = InMemoryLedger::new();
        ledger.deploy(ContractDefinition {
            contract_id: "counter".into(),
            source_id: "src".into(),
            source: ContractSource::native("counter"),
            initial_state: json!({"n": 0}),
            owner: "owner".into(),
        });
        let natives = NativeRegistry::new();
        natives.register("counter", |mut state, action, _| {
            match action.input["function"].as_str() {
                Some("add") => {
                    state["n"] = json!(state["n"].as_i64().unwrap_or(0) + 1);
                    Ok(HandlerOutput::state(state))
                }
                Some("get") => Ok(HandlerOutput::result(state["n"].clone())),
                _ => Err(crate::executor::ContractError::rejected("unknown")),
            }
        });
        let shared = Arc::new(ledger.clone());
        let evaluator = StateEvaluator::builder(shared.clone(), shared)
            .natives(natives)
            .options(EvaluationOptions::default().with_timeout(None))
            .build();
        (ledger, evaluator)
    }

    fn push(ledger: &InMemoryLedger, n: u64, input: &str) -> Interaction {
        let tx = Interaction::new(
            ledger_id(&format!("tx{n}")),
            "alice",
            BlockInfo::new(n, ledger_id(&format!("block{n}")), 1_000 + n),
            input,
        );
        ledger.push_interaction("counter", tx.clone());
        tx
    }

    #[test]
    fn test_genesis_without_interactions() {
        let (_, evaluator) = setup();
        let result = evaluator.read_state("counter", None).unwrap();
        assert_eq!(result.state, json!({"n": 0}));
        assert!(result.validity.is_empty());
        assert!(evaluator.cache().last_sort_key().unwrap().is_none());
    }

    #[test]
    fn test_truncate_cycles() {
        let (ledger, evaluator) = setup();
        let txs: Vec<Interaction> = (1..=3).map(|n| push(&ledger, n, r#"{"function":"add"}"#)).collect();
        let chain = [CallChainEntry::new("counter", txs[1].id.clone())];
        let result = evaluator.read_state_with("counter", None, &chain, None).unwrap();
        assert_eq!(result.state, json!({"n": 1}));
        assert_eq!(result.validity.len(), 1);
    }

    #[test]
    fn test_view_state_leaves_cache_untouched() {
        let (ledger, evaluator) = setup();
        push(&ledger, 1, r#"{"function":"add"}"#);
        evaluator.read_state("counter", None).unwrap();
        let before = evaluator.cache().last_sort_key().unwrap();

        let outcome = evaluator
            .view_state("counter", json!({"function": "get"}), "bob", None)
            .unwrap();
        assert!(matches!(outcome, Outcome::Ok { result: Some(ref r), .. } if r == &json!(1)));
        assert_eq!(evaluator.cache().last_sort_key().unwrap(), before);
    }

    #[test]
    fn test_view_id_is_deterministic() {
        let key = SortKey::block_upper_bound(1);
        let a = view_interaction_id("c", "x", &json!({"a": 1}), &key);
        let b = view_interaction_id("c", "x", &json!({"a": 1}), &key);
        let c = view_interaction_id("c", "y", &json!({"a": 1}), &key);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
