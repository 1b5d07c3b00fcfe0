//! Metered handler scripts
//!
//! A script defines `fn handle(state, action)` plus any helper functions.
//! `handle` must return an object carrying `state`, `result`, or both.
//! `throw` (or a failed `assert`) rejects the interaction as a business
//! error; anything else that goes wrong is a fault.
//!
//! ```text
//! fn handle(state, action) {
//!     if action.input.function == "add" {
//!         state.counter = state.counter + 1;
//!         return { state: state };
//!     }
//!     throw "unknown function";
//! }
//! ```

pub mod interpreter;
pub mod parser;
pub mod tokenizer;
pub mod value;

use std::collections::BTreeMap;

pub use interpreter::{Interpreter, Raise};
pub use parser::Program;
pub use value::Value;

use super::{Action, ContractError, Fault, HandlerOutput, HandlerResult, Sandbox};
use crate::{Error, FailureKind, Result};

/// Function every script must define.
pub const ENTRY_POINT: &str = "handle";

/// Parse a script and check it exposes a usable entry point.
pub fn compile(source: &str) -> Result<Program> {
    let program = parser::parse(source)?;
    match program.function(ENTRY_POINT) {
        Some(entry) if entry.params.len() == 2 => Ok(program),
        Some(entry) => Err(Error::Source(format!(
            "'{}' must take (state, action), found {} parameter(s)",
            ENTRY_POINT,
            entry.params.len()
        ))),
        None => Err(Error::Source(format!("script defines no '{ENTRY_POINT}' function"))),
    }
}

/// Run the script's entry point for one interaction.
pub fn invoke(
    program: &Program,
    state: serde_json::Value,
    action: &Action,
    sandbox: &Sandbox,
) -> HandlerResult {
    let mut action_fields = BTreeMap::new();
    action_fields.insert("input".to_string(), Value::from_json(&action.input));
    action_fields.insert("caller".to_string(), Value::String(action.caller.clone()));

    let mut interpreter = Interpreter::new(program, sandbox);
    let returned = interpreter
        .call(
            ENTRY_POINT,
            vec![Value::from_json(&state), Value::Object(action_fields)],
        )
        .map_err(|raise| match raise {
            Raise::Throw(message) => ContractError::Rejected(message),
            Raise::Fault(fault) => ContractError::Fault(fault),
        })?;

    match returned {
        Value::Object(mut fields) => Ok(HandlerOutput {
            state: fields.remove("state").map(|v| v.to_json()),
            result: fields.remove("result").map(|v| v.to_json()),
        }),
        other => Err(Fault::new(
            FailureKind::UnexpectedResult,
            format!("'{}' returned {}", ENTRY_POINT, other.type_name()),
        )
        .into()),
    }
}
