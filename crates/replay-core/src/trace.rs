//! Call-stack traces
//!
//! With `stackTrace.enabled` set, an evaluation records one
//! [`ContractCallStack`] per evaluated contract. Each folded interaction
//! becomes an [`InteractionCall`] carrying its input, verdict, gas and
//! timing, and the stacks of any contracts it called. Dry runs issued by a
//! calling contract (views and internal writes) appear in the callee's
//! stack with `dry_write` set.
//!
//! Traces are diagnostics. They hold wall-clock timings, so they are never
//! part of an [`EvaluationResult`] and never cached.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{EvaluationResult, Interaction, InteractionError};

/// Interactions folded (or dry-run) for one contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractCallStack {
    pub contract_id: String,
    pub depth: usize,
    /// Everything came from a checkpoint; nothing was replayed
    pub cache_hit: bool,
    pub interactions: Vec<InteractionCall>,
}

impl ContractCallStack {
    pub fn new(contract_id: impl Into<String>, depth: usize) -> Self {
        Self {
            contract_id: contract_id.into(),
            depth,
            cache_hit: false,
            interactions: Vec::new(),
        }
    }

    /// Every call in the tree, parents before children.
    pub fn calls(&self) -> Vec<&InteractionCall> {
        let mut out = Vec::new();
        self.collect(&mut out);
        out
    }

    fn collect<'a>(&'a self, out: &mut Vec<&'a InteractionCall>) {
        for call in &self.interactions {
            out.push(call);
            for stack in &call.foreign_calls {
                stack.collect(out);
            }
        }
    }
}

/// One handler invocation inside a [`ContractCallStack`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionCall {
    pub interaction_id: String,
    pub block_height: u64,
    pub block_timestamp: u64,
    pub caller: String,
    pub function: Option<String>,
    pub input: Value,
    pub dry_write: bool,
    /// Stacks of contracts this invocation called, in call order
    pub foreign_calls: Vec<ContractCallStack>,
    pub output: Option<InteractionOutput>,
}

impl InteractionCall {
    pub fn new(interaction: &Interaction, input: &Value, dry_write: bool) -> Self {
        Self {
            interaction_id: interaction.id.clone(),
            block_height: interaction.block.height,
            block_timestamp: interaction.block.timestamp,
            caller: interaction.caller.clone(),
            function: input
                .get("function")
                .and_then(Value::as_str)
                .map(str::to_string),
            input: input.clone(),
            dry_write,
            foreign_calls: Vec::new(),
            output: None,
        }
    }

    pub(crate) fn finish(
        &mut self,
        sink: &CallSink,
        failure: Option<&InteractionError>,
        gas_used: u64,
        elapsed: Duration,
        output_state: Option<Value>,
    ) {
        self.foreign_calls = sink.take();
        self.output = Some(InteractionOutput {
            valid: failure.is_none(),
            error_message: failure.map(|f| f.message.clone()),
            gas_used,
            execution_time_ms: elapsed.as_secs_f64() * 1_000.0,
            output_state,
        });
    }
}

/// How an invocation ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionOutput {
    pub valid: bool,
    pub error_message: Option<String>,
    pub gas_used: u64,
    pub execution_time_ms: f64,
    /// State after the invocation; only kept with `stackTrace.saveState`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_state: Option<Value>,
}

/// Collector for the stacks of contracts called by one running invocation
#[derive(Debug, Clone, Default)]
pub struct CallSink(Arc<Mutex<Vec<ContractCallStack>>>);

impl CallSink {
    pub fn push(&self, stack: ContractCallStack) {
        self.0.lock().push(stack);
    }

    pub fn take(&self) -> Vec<ContractCallStack> {
        std::mem::take(&mut *self.0.lock())
    }
}

/// A result together with the trace recorded while computing it
#[derive(Debug, Clone, PartialEq)]
pub struct TracedState {
    pub result: EvaluationResult,
    /// `None` unless `stackTrace.enabled` was set
    pub call_stack: Option<ContractCallStack>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BlockInfo, FailureKind};
    use serde_json::json;

    fn call(id: &str) -> InteractionCall {
        let tx = Interaction::new(id, "alice", BlockInfo::new(3, "blk", 99), "{}");
        InteractionCall::new(&tx, &json!({"function": "mint", "amount": 2}), false)
    }

    #[test]
    fn test_call_records_input() {
        let call = call("tx");
        assert_eq!(call.function.as_deref(), Some("mint"));
        assert_eq!(call.block_height, 3);
        assert_eq!(call.block_timestamp, 99);
        assert!(call.output.is_none());
    }

    #[test]
    fn test_finish_drains_sink() {
        let sink = CallSink::default();
        sink.push(ContractCallStack::new("callee", 1));
        let mut call = call("tx");
        let failure = InteractionError::new(FailureKind::Business, "no");
        call.finish(&sink, Some(&failure), 7, Duration::from_millis(2), None);

        assert_eq!(call.foreign_calls.len(), 1);
        assert!(sink.take().is_empty());
        let output = call.output.unwrap();
        assert!(!output.valid);
        assert_eq!(output.error_message.as_deref(), Some("no"));
        assert_eq!(output.gas_used, 7);
        assert!((output.execution_time_ms - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_calls_walks_depth_first() {
        let mut inner = ContractCallStack::new("b", 1);
        inner.interactions.push(call("b-1"));
        let mut outer_call = call("a-1");
        outer_call.foreign_calls.push(inner);
        let mut root = ContractCallStack::new("a", 0);
        root.interactions.push(outer_call);
        root.interactions.push(call("a-2"));

        let ids: Vec<&str> = root.calls().iter().map(|c| c.interaction_id.as_str()).collect();
        assert_eq!(ids, vec!["a-1", "b-1", "a-2"]);
    }

    #[test]
    fn test_wire_names() {
        let json = serde_json::to_value(ContractCallStack::new("a", 0)).unwrap();
        assert_eq!(json["contractId"], "a");
        assert_eq!(json["cacheHit"], false);
    }
}
