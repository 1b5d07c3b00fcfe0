//! Source upgrades driven by contract state
//!
//! A contract evolves by writing the id of a new source into its own state,
//! either as `state.evolve` or as the `evolve` entry of `state.settings`
//! (an object, or a list of `[key, value]` pairs). After every accepted
//! interaction the evaluator passes the fresh state through its modifiers;
//! [`Evolve`] swaps in the new source when the id changes.

use std::sync::Arc;

use serde_json::Value;

use crate::executor::{ExecutorFactory, ExecutorHandle};
use crate::loader::DefinitionLoader;
use crate::{ContractDefinition, Error, Result};

/// Minimum run of base64url characters a source id must contain.
const SOURCE_ID_LEN: usize = 43;

/// The definition and prepared handler in force for a contract
#[derive(Debug, Clone)]
pub struct ContractContext {
    pub definition: Arc<ContractDefinition>,
    pub handler: ExecutorHandle,
}

impl ContractContext {
    pub fn new(definition: ContractDefinition, handler: ExecutorHandle) -> Self {
        Self {
            definition: Arc::new(definition),
            handler,
        }
    }
}

/// Hook run on the state after each accepted interaction
pub trait ExecutionContextModifier: Send + Sync {
    /// Return the context to use for the next interaction.
    fn modify(&self, state: &Value, context: ContractContext) -> Result<ContractContext>;
}

/// Replaces a contract's source when its state names a new one
pub struct Evolve {
    definitions: Arc<dyn DefinitionLoader>,
    executors: ExecutorFactory,
}

impl Evolve {
    pub fn new(definitions: Arc<dyn DefinitionLoader>, executors: ExecutorFactory) -> Self {
        Self {
            definitions,
            executors,
        }
    }

    /// Source id the state asks to evolve to, if evolving is allowed.
    pub fn evolved_source_id(state: &Value) -> Option<&str> {
        let evolve = state
            .get("evolve")
            .filter(|v| truthy(v))
            .or_else(|| settings_entry(state, "evolve"))?
            .as_str()?;
        // An explicit top-level flag wins, even when it is false: a false
        // `canEvolve` is never overridden by `settings.canEvolve`. Only an
        // absent or null top-level flag falls through to settings. A plain
        // `canEvolve || settings.canEvolve` would let settings re-enable it.
        let flag = state
            .get("canEvolve")
            .filter(|v| !v.is_null())
            .or_else(|| settings_entry(state, "canEvolve"));
        let can_evolve = match flag {
            None | Some(Value::Null) => true,
            Some(flag) => truthy(flag),
        };
        (can_evolve && looks_like_source_id(evolve)).then_some(evolve)
    }
}

impl ExecutionContextModifier for Evolve {
    fn modify(&self, state: &Value, context: ContractContext) -> Result<ContractContext> {
        let Some(source_id) = Self::evolved_source_id(state) else {
            return Ok(context);
        };
        if source_id == context.definition.source_id {
            return Ok(context);
        }

        let contract_id = &context.definition.contract_id;
        tracing::info!(
            contract = %contract_id,
            from = %context.definition.source_id,
            to = source_id,
            "evolving contract source"
        );
        let definition = self
            .definitions
            .load(contract_id, Some(source_id))
            .map_err(|e| {
                Error::ContractNotFound(format!(
                    "contract {contract_id} cannot evolve to source {source_id}: {e}"
                ))
            })?;
        let handler = self.executors.prepare(&definition)?;
        Ok(ContractContext::new(definition, handler))
    }
}

/// Entry of `state.settings`, in object or pair-list form.
fn settings_entry<'a>(state: &'a Value, key: &str) -> Option<&'a Value> {
    match state.get("settings")? {
        Value::Object(map) => map.get(key),
        Value::Array(pairs) => pairs.iter().rev().find_map(|pair| match pair.as_array()?.as_slice() {
            [Value::String(k), value] if k == key => Some(value),
            _ => None,
        }),
        _ => None,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn looks_like_source_id(candidate: &str) -> bool {
    let mut run = 0;
    for b in candidate.bytes() {
        if b.is_ascii_alphanumeric() || b == b'_' || b == b'-' {
            run += 1;
            if run >= SOURCE_ID_LEN {
                return true;
            }
        } else {
            run = 0;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{HandlerOutput, NativeRegistry};
    use crate::loader::InMemoryLedger;
    use crate::ContractSource;
    use serde_json::json;

    const V2: &str = "v2-source-aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    #[test]
    fn test_evolve_from_state_field() {
        assert_eq!(Evolve::evolved_source_id(&json!({"evolve": V2})), Some(V2));
        assert_eq!(Evolve::evolved_source_id(&json!({"evolve": "short"})), None);
        assert_eq!(Evolve::evolved_source_id(&json!({})), None);
        assert_eq!(Evolve::evolved_source_id(&json!({"evolve": null})), None);
    }

    #[test]
    fn test_evolve_from_settings() {
        let as_object = json!({"settings": {"evolve": V2}});
        let as_pairs = json!({"settings": [["owner", "x"], ["evolve", V2]]});
        assert_eq!(Evolve::evolved_source_id(&as_object), Some(V2));
        assert_eq!(Evolve::evolved_source_id(&as_pairs), Some(V2));
    }

    #[test]
    fn test_can_evolve_flag() {
        assert_eq!(
            Evolve::evolved_source_id(&json!({"evolve": V2, "canEvolve": false})),
            None
        );
        assert_eq!(
            Evolve::evolved_source_id(&json!({"evolve": V2, "settings": {"canEvolve": false}})),
            None
        );
        assert_eq!(
            Evolve::evolved_source_id(&json!({"evolve": V2, "canEvolve": true})),
            Some(V2)
        );
    }

    #[test]
    fn test_top_level_false_beats_settings() {
        let state = json!({"evolve": V2, "canEvolve": false, "settings": {"canEvolve": true}});
        assert_eq!(Evolve::evolved_source_id(&state), None);
        let state = json!({"evolve": V2, "canEvolve": null, "settings": {"canEvolve": true}});
        assert_eq!(Evolve::evolved_source_id(&state), Some(V2));
    }

    fn fixture() -> (Evolve, ContractContext) {
        let natives = NativeRegistry::new();
        natives.register("v1", |s, _, _| Ok(HandlerOutput::state(s)));
        natives.register("v2", |s, _, _| Ok(HandlerOutput::state(s)));
        let executors = ExecutorFactory::new(natives);

        let ledger = InMemoryLedger::new();
        let definition = ContractDefinition {
            contract_id: "c".into(),
            source_id: "v1-source".into(),
            source: ContractSource::native("v1"),
            initial_state: json!({}),
            owner: "o".into(),
        };
        ledger.deploy(definition.clone());
        ledger.publish_source(V2, ContractSource::native("v2"));

        let handler = executors.prepare(&definition).unwrap();
        let context = ContractContext::new(definition, handler);
        (Evolve::new(Arc::new(ledger), executors), context)
    }

    #[test]
    fn test_modify_swaps_source() {
        let (evolve, context) = fixture();
        let unchanged = evolve.modify(&json!({"n": 1}), context.clone()).unwrap();
        assert_eq!(unchanged.definition.source_id, "v1-source");

        let evolved = evolve.modify(&json!({"evolve": V2}), context).unwrap();
        assert_eq!(evolved.definition.source_id, V2);
        assert_eq!(evolved.definition.source.code, "v2");
    }

    #[test]
    fn test_modify_missing_source() {
        let (evolve, context) = fixture();
        let missing = "missing-source-bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
        let err = evolve.modify(&json!({"evolve": missing}), context).unwrap_err();
        assert!(matches!(err, Error::ContractNotFound(_)));
    }
}
