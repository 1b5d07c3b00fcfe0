//! Execution engine - runs contract handlers in an isolated sandbox
//!
//! A handler receives a private copy of the state and an action, and
//! produces an [`Outcome`]. Two backends exist behind [`ExecutorHandle`]:
//! native handlers registered in-process, and metered scripts interpreted
//! by the engine.
//!
//! # Isolation
//!
//! - Handlers never see the evaluator's state value, only a deep copy
//! - Wall-clock time is bounded per interaction; an overdue handler is
//!   revoked and its late result discarded
//! - Script execution is gas-metered and has no clock, randomness or I/O
//! - A panicking handler yields a runtime fault, never a crashed evaluator

pub mod native;
pub mod sandbox;
pub mod script;

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc};
use std::thread;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub use native::{NativeHandler, NativeRegistry};
pub use sandbox::{ContractHost, DetachedHost, ExecutionContext, GasMeter, Revocation, Sandbox};

use crate::{ContractDefinition, Error, FailureKind, InteractionError, Result, SourceKind};

// ── Core Types ────────────────────────────────────────────

/// Input handed to a handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub input: Value,
    pub caller: String,
}

/// A non-business failure raised while running a handler
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Fault {
    pub kind: FailureKind,
    pub message: String,
}

impl Fault {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// What a handler produced on success. At least one field must be set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandlerOutput {
    /// Replacement state; `None` leaves the state unchanged
    pub state: Option<Value>,
    /// Value returned to the caller (views)
    pub result: Option<Value>,
}

impl HandlerOutput {
    pub fn state(state: Value) -> Self {
        Self {
            state: Some(state),
            result: None,
        }
    }

    pub fn result(result: Value) -> Self {
        Self {
            state: None,
            result: Some(result),
        }
    }
}

/// Handler-side failure
#[derive(Debug, Clone, PartialEq)]
pub enum ContractError {
    /// Business rejection: the input was refused, the state is untouched
    Rejected(String),
    Fault(Fault),
}

impl ContractError {
    pub fn rejected(message: impl Into<String>) -> Self {
        ContractError::Rejected(message.into())
    }
}

impl From<Fault> for ContractError {
    fn from(fault: Fault) -> Self {
        ContractError::Fault(fault)
    }
}

pub type HandlerResult = std::result::Result<HandlerOutput, ContractError>;

/// Result of running one interaction
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Ok {
        state: Option<Value>,
        result: Option<Value>,
        gas_used: u64,
    },
    BusinessError {
        message: String,
    },
    Fault(Fault),
}

impl Outcome {
    pub fn fault(kind: FailureKind, message: impl Into<String>) -> Self {
        Outcome::Fault(Fault::new(kind, message))
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok { .. })
    }

    /// Failure to record against the interaction, if any.
    pub fn failure(&self) -> Option<InteractionError> {
        match self {
            Outcome::Ok { .. } => None,
            Outcome::BusinessError { message } => {
                Some(InteractionError::new(FailureKind::Business, message.clone()))
            }
            Outcome::Fault(fault) => Some(InteractionError::new(fault.kind, fault.message.clone())),
        }
    }

    /// JSON view handed back to calling contracts.
    pub fn to_json(&self) -> Value {
        match self {
            Outcome::Ok { state, result, .. } => json!({
                "type": "ok",
                "state": state.clone().unwrap_or(Value::Null),
                "result": result.clone().unwrap_or(Value::Null),
            }),
            Outcome::BusinessError { message } => json!({
                "type": "error",
                "errorMessage": message,
            }),
            Outcome::Fault(fault) => json!({
                "type": "exception",
                "errorMessage": fault.to_string(),
            }),
        }
    }

    fn settle(result: HandlerResult, gas_used: u64) -> Self {
        match result {
            Ok(HandlerOutput {
                state: None,
                result: None,
            }) => Outcome::fault(
                FailureKind::UnexpectedResult,
                "handler returned neither a state nor a result",
            ),
            Ok(HandlerOutput { state, result }) => Outcome::Ok {
                state,
                result,
                gas_used,
            },
            Err(ContractError::Rejected(message)) => Outcome::BusinessError { message },
            Err(ContractError::Fault(fault)) => Outcome::Fault(fault),
        }
    }
}

// ── Executor Handle ───────────────────────────────────────

/// A prepared, ready-to-run contract handler
#[derive(Clone)]
pub enum ExecutorHandle {
    Native {
        name: String,
        handler: Arc<NativeHandler>,
    },
    Script(Arc<script::Program>),
}

impl std::fmt::Debug for ExecutorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutorHandle::Native { name, .. } => write!(f, "Native({name})"),
            ExecutorHandle::Script(program) => write!(f, "Script({} fns)", program.len()),
        }
    }
}

impl ExecutorHandle {
    /// Run one interaction against `state`, enforcing the configured
    /// wall-clock budget. The handler sees only the copy passed in.
    pub fn run(
        &self,
        state: Value,
        action: Action,
        context: Arc<ExecutionContext>,
        host: Arc<dyn ContractHost>,
    ) -> Outcome {
        let sandbox = Sandbox::new(Arc::clone(&context), host);
        let Some(limit) = context.options.interaction_timeout() else {
            return self.invoke(state, &action, &sandbox);
        };

        let (tx, rx) = mpsc::channel();
        let handle = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("interaction-{}", context.interaction.id))
            .spawn(move || {
                let outcome = handle.invoke(state, &action, &sandbox);
                // Receiver is gone once the interaction timed out.
                let _ = tx.send(outcome);
            });
        if let Err(e) = spawned {
            return Outcome::fault(FailureKind::Runtime, format!("failed to spawn executor: {e}"));
        }

        match rx.recv_timeout(limit) {
            Ok(outcome) => outcome,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                context.pass.revoke(&context.revocation);
                tracing::warn!(
                    contract = %context.definition.contract_id,
                    interaction = %context.interaction.id,
                    limit_ms = limit.as_millis() as u64,
                    "interaction timed out"
                );
                Outcome::fault(
                    FailureKind::Timeout,
                    format!("interaction exceeded {:.3}s", limit.as_secs_f64()),
                )
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Outcome::fault(FailureKind::Runtime, "executor thread terminated")
            }
        }
    }

    fn invoke(&self, state: Value, action: &Action, sandbox: &Sandbox) -> Outcome {
        let result = panic::catch_unwind(AssertUnwindSafe(|| match self {
            ExecutorHandle::Native { handler, .. } => handler(state, action, sandbox),
            ExecutorHandle::Script(program) => script::invoke(program, state, action, sandbox),
        }));
        match result {
            Ok(result) => Outcome::settle(result, sandbox.gas_used()),
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_string());
                Outcome::fault(FailureKind::Runtime, message)
            }
        }
    }
}

// ── Executor Factory ──────────────────────────────────────

/// Turns contract definitions into executor handles, once per source
#[derive(Clone, Default)]
pub struct ExecutorFactory {
    natives: NativeRegistry,
    prepared: Arc<RwLock<HashMap<(String, String), ExecutorHandle>>>,
}

impl ExecutorFactory {
    pub fn new(natives: NativeRegistry) -> Self {
        Self {
            natives,
            prepared: Arc::default(),
        }
    }

    pub fn natives(&self) -> &NativeRegistry {
        &self.natives
    }

    pub fn prepare(&self, definition: &ContractDefinition) -> Result<ExecutorHandle> {
        let key = (
            definition.contract_id.clone(),
            definition.source_id.clone(),
        );
        if let Some(handle) = self.prepared.read().get(&key) {
            return Ok(handle.clone());
        }

        let handle = match definition.source.kind {
            SourceKind::Native => {
                let name = definition.source.code.clone();
                let handler = self.natives.get(&name).ok_or_else(|| {
                    Error::Source(format!("no native handler registered as '{name}'"))
                })?;
                ExecutorHandle::Native { name, handler }
            }
            SourceKind::Script => ExecutorHandle::Script(Arc::new(script::compile(
                &definition.source.code,
            )?)),
        };
        tracing::debug!(
            contract = %definition.contract_id,
            source = %definition.source_id,
            backend = ?definition.source.kind,
            "prepared executor"
        );
        self.prepared.write().insert(key, handle.clone());
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nested::EvaluationPass;
    use crate::{BlockInfo, ContractSource, EvaluationOptions, Interaction};
    use std::time::Duration;

    fn definition(source: ContractSource) -> ContractDefinition {
        ContractDefinition {
            contract_id: "contract".into(),
            source_id: "source".into(),
            source,
            initial_state: json!({}),
            owner: "owner".into(),
        }
    }

    fn context(options: EvaluationOptions, source: ContractSource) -> Arc<ExecutionContext> {
        Arc::new(ExecutionContext {
            definition: Arc::new(definition(source)),
            interaction: Interaction::new("tx", "alice", BlockInfo::new(1, "AA", 7), "{}"),
            call_chain: Vec::new(),
            depth: 0,
            options: Arc::new(options),
            pass: Arc::new(EvaluationPass::default()),
            revocation: Revocation::default(),
            trace: None,
        })
    }

    fn action() -> Action {
        Action {
            input: json!({}),
            caller: "alice".into(),
        }
    }

    fn factory() -> ExecutorFactory {
        let natives = NativeRegistry::new();
        natives.register("inc", |mut state, _action, _sandbox| {
            let n = state["n"].as_i64().unwrap_or(0);
            state["n"] = json!(n + 1);
            Ok(HandlerOutput::state(state))
        });
        natives.register("nothing", |_state, _action, _sandbox| Ok(HandlerOutput::default()));
        natives.register("panics", |_state, _action, _sandbox| panic!("boom"));
        natives.register("sleeps", |state, _action, _sandbox| {
            thread::sleep(Duration::from_millis(400));
            Ok(HandlerOutput::state(state))
        });
        ExecutorFactory::new(natives)
    }

    fn run(name: &str, options: EvaluationOptions) -> Outcome {
        let source = ContractSource::native(name);
        let handle = factory().prepare(&definition(source.clone())).unwrap();
        handle.run(
            json!({"n": 1}),
            action(),
            context(options, source),
            Arc::new(DetachedHost),
        )
    }

    #[test]
    fn test_native_ok_inline_and_threaded() {
        for timeout in [None, Some(5.0)] {
            let outcome = run("inc", EvaluationOptions::default().with_timeout(timeout));
            match outcome {
                Outcome::Ok { state, .. } => assert_eq!(state, Some(json!({"n": 2}))),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn test_empty_output_is_unexpected_result() {
        let outcome = run("nothing", EvaluationOptions::default().with_timeout(None));
        assert_eq!(outcome.failure().unwrap().kind, FailureKind::UnexpectedResult);
    }

    #[test]
    fn test_panic_becomes_runtime_fault() {
        let outcome = run("panics", EvaluationOptions::default().with_timeout(None));
        let failure = outcome.failure().unwrap();
        assert_eq!(failure.kind, FailureKind::Runtime);
        assert!(failure.message.contains("boom"));
    }

    #[test]
    fn test_timeout_fault() {
        let outcome = run("sleeps", EvaluationOptions::default().with_timeout(Some(0.05)));
        assert_eq!(outcome.failure().unwrap().kind, FailureKind::Timeout);
    }

    #[test]
    fn test_unknown_native_source() {
        let err = factory()
            .prepare(&definition(ContractSource::native("missing")))
            .unwrap_err();
        assert!(matches!(err, Error::Source(_)));
    }

    #[test]
    fn test_outcome_json_shape() {
        let ok = Outcome::Ok {
            state: None,
            result: Some(json!(5)),
            gas_used: 0,
        };
        assert_eq!(ok.to_json()["type"], "ok");
        assert_eq!(ok.to_json()["result"], 5);
        let err = Outcome::BusinessError {
            message: "no".into(),
        };
        assert_eq!(err.to_json()["errorMessage"], "no");
    }
}
