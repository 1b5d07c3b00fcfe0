//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use replay_core::cache::StateCache;
use replay_core::executor::{ContractError, HandlerOutput, NativeRegistry};
use replay_core::loader::InMemoryLedger;
use replay_core::{
    BlockInfo, ContractDefinition, ContractSource, EvaluationOptions, Interaction, StateEvaluator,
};

pub const OWNER: &str = "owner-wallet";

/// Ledger-shaped id (43 base64url chars) derived from `seed`.
pub fn ledger_id(seed: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(seed.as_bytes()))
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Options without a wall-clock budget, so tests never spawn threads
/// unless they ask for it.
pub fn untimed() -> EvaluationOptions {
    EvaluationOptions::default().with_timeout(None)
}

pub fn deploy(ledger: &InMemoryLedger, contract_id: &str, source: ContractSource, initial: Value) {
    ledger.deploy(ContractDefinition {
        contract_id: contract_id.to_string(),
        source_id: ledger_id(&format!("source-{contract_id}")),
        source,
        initial_state: initial,
        owner: OWNER.to_string(),
    });
}

/// Interaction at block `height`, with an id unique to `(contract_id, height)`.
pub fn interaction(contract_id: &str, height: u64, input: Value) -> Interaction {
    raw_interaction(contract_id, height, &input.to_string())
}

pub fn raw_interaction(contract_id: &str, height: u64, input: &str) -> Interaction {
    Interaction::new(
        ledger_id(&format!("{contract_id}/tx/{height}")),
        "alice",
        BlockInfo::new(height, ledger_id(&format!("block/{height}")), 1_600_000_000 + height),
        input,
    )
}

pub fn push(ledger: &InMemoryLedger, contract_id: &str, height: u64, input: Value) -> Interaction {
    let tx = interaction(contract_id, height, input);
    ledger.push_interaction(contract_id, tx.clone());
    tx
}

/// Native counter: `add` increments `n`, `get` returns it, `fail` rejects,
/// `boom` panics.
pub fn counter_natives() -> NativeRegistry {
    let natives = NativeRegistry::new();
    natives.register("counter", |mut state, action, _| {
        match action.input["function"].as_str() {
            Some("add") => {
                let n = state["n"].as_i64().unwrap_or(0);
                state["n"] = json!(n + 1);
                Ok(HandlerOutput::state(state))
            }
            Some("get") => Ok(HandlerOutput::result(state["n"].clone())),
            Some("fail") => Err(ContractError::rejected("rejected by contract")),
            Some("boom") => panic!("handler blew up"),
            other => Err(ContractError::rejected(format!("unknown function {other:?}"))),
        }
    });
    natives
}

pub fn evaluator(
    ledger: &InMemoryLedger,
    natives: NativeRegistry,
    options: EvaluationOptions,
) -> StateEvaluator {
    let shared = Arc::new(ledger.clone());
    StateEvaluator::builder(shared.clone(), shared)
        .natives(natives)
        .options(options)
        .build()
}

pub fn evaluator_with_cache(
    ledger: &InMemoryLedger,
    natives: NativeRegistry,
    options: EvaluationOptions,
    cache: Arc<dyn StateCache>,
) -> StateEvaluator {
    let shared = Arc::new(ledger.clone());
    StateEvaluator::builder(shared.clone(), shared)
        .natives(natives)
        .options(options)
        .cache(cache)
        .build()
}
