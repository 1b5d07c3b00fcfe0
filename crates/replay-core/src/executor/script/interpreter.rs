//! Tree-walking, gas-metered interpreter
//!
//! Every statement and expression charges gas through the sandbox, which is
//! also where a revoked (timed out) invocation is stopped. Integer
//! arithmetic is checked; overflow is a fault, never a wrap.
//!
//! Recursion is bounded twice: evaluation may not nest deeper than
//! [`MAX_EVAL_DEPTH`] across script calls, and no value may nest deeper than
//! [`MAX_VALUE_DEPTH`], which keeps every state serializable.

use std::collections::BTreeMap;

use super::parser::{BinaryOp, Expr, Function, PathSegment, Place, Program, Stmt, UnaryOp};
use super::tokenizer::Span;
use super::value::Value;
use crate::executor::{Fault, Sandbox};
use crate::FailureKind;

pub const STATEMENT_GAS: u64 = 1;
pub const EXPRESSION_GAS: u64 = 1;
pub const CALL_GAS: u64 = 10;

/// Deepest script-level call nesting.
pub const MAX_SCRIPT_CALL_DEPTH: usize = 64;

/// Deepest nesting of statements and expressions being evaluated.
pub const MAX_EVAL_DEPTH: usize = 512;

/// Deepest nesting of arrays and objects a script may build.
pub const MAX_VALUE_DEPTH: usize = 64;

/// Capabilities that would break determinism.
const FORBIDDEN: &[&str] = &["now", "date", "time", "random", "fetch", "env"];

/// Non-local exit from script code
#[derive(Debug, Clone, PartialEq)]
pub enum Raise {
    /// `throw` or a failed `assert`: a business rejection
    Throw(String),
    Fault(Fault),
}

impl From<Fault> for Raise {
    fn from(fault: Fault) -> Self {
        Raise::Fault(fault)
    }
}

pub type Eval<T> = std::result::Result<T, Raise>;

fn runtime(message: impl Into<String>) -> Raise {
    Raise::Fault(Fault::new(FailureKind::Runtime, message))
}

enum Flow {
    Normal,
    Return(Value),
}

/// Lexical scopes of one function activation
struct Frame {
    scopes: Vec<BTreeMap<String, Value>>,
}

impl Frame {
    fn new(bindings: BTreeMap<String, Value>) -> Self {
        Frame {
            scopes: vec![bindings],
        }
    }

    fn lookup(&self, name: &str) -> Option<&Value> {
        self.scopes.iter().rev().find_map(|scope| scope.get(name))
    }

    fn lookup_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.scopes
            .iter_mut()
            .rev()
            .find_map(|scope| scope.get_mut(name))
    }

    fn declare(&mut self, name: &str, value: Value) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), value);
        }
    }
}

pub struct Interpreter<'a> {
    program: &'a Program,
    sandbox: &'a Sandbox,
    globals: BTreeMap<String, Value>,
    depth: usize,
    nesting: usize,
}

impl<'a> Interpreter<'a> {
    pub fn new(program: &'a Program, sandbox: &'a Sandbox) -> Self {
        let tx = sandbox.interaction();
        let block = sandbox.block();
        let mut globals = BTreeMap::new();
        globals.insert(
            "contract".to_string(),
            object([
                ("id", Value::String(sandbox.contract_id().to_string())),
                ("owner", Value::String(sandbox.owner().to_string())),
            ]),
        );
        globals.insert(
            "transaction".to_string(),
            object([
                ("id", Value::String(tx.id.clone())),
                ("owner", Value::String(tx.caller.clone())),
            ]),
        );
        globals.insert(
            "block".to_string(),
            object([
                ("height", int_from_u64(block.height)),
                ("hash", Value::String(block.hash.clone())),
                ("timestamp", int_from_u64(block.timestamp)),
            ]),
        );
        Interpreter {
            program,
            sandbox,
            globals,
            depth: 0,
            nesting: 0,
        }
    }

    /// Call a script function by name.
    pub fn call(&mut self, name: &str, args: Vec<Value>) -> Eval<Value> {
        let function = self
            .program
            .function(name)
            .ok_or_else(|| runtime(format!("unknown function '{name}'")))?;
        self.call_function(function, args)
    }

    fn call_function(&mut self, function: &Function, args: Vec<Value>) -> Eval<Value> {
        if args.len() != function.params.len() {
            return Err(runtime(format!(
                "'{}' expects {} arguments, got {}",
                function.name,
                function.params.len(),
                args.len()
            )));
        }
        if self.depth >= MAX_SCRIPT_CALL_DEPTH {
            return Err(runtime("script call stack exhausted"));
        }
        self.sandbox.charge(CALL_GAS)?;

        let bindings = function.params.iter().cloned().zip(args).collect();
        let mut frame = Frame::new(bindings);
        self.depth += 1;
        let flow = self.exec_block(&mut frame, &function.body);
        self.depth -= 1;
        match flow? {
            Flow::Return(value) => Ok(value),
            Flow::Normal => Ok(Value::Null),
        }
    }

    // ── Statements ─────────────────────────────────────────

    fn descend(&mut self) -> Eval<()> {
        if self.nesting >= MAX_EVAL_DEPTH {
            return Err(runtime(format!("evaluation nested deeper than {MAX_EVAL_DEPTH}")));
        }
        self.nesting += 1;
        Ok(())
    }

    fn exec_block(&mut self, frame: &mut Frame, stmts: &[Stmt]) -> Eval<Flow> {
        self.descend()?;
        let flow = self.exec_scope(frame, stmts);
        self.nesting -= 1;
        flow
    }

    fn exec_scope(&mut self, frame: &mut Frame, stmts: &[Stmt]) -> Eval<Flow> {
        frame.scopes.push(BTreeMap::new());
        let mut flow = Ok(Flow::Normal);
        for stmt in stmts {
            match self.exec(frame, stmt) {
                Ok(Flow::Normal) => continue,
                other => {
                    flow = other;
                    break;
                }
            }
        }
        frame.scopes.pop();
        flow
    }

    fn exec(&mut self, frame: &mut Frame, stmt: &Stmt) -> Eval<Flow> {
        self.sandbox.charge(STATEMENT_GAS)?;
        match stmt {
            Stmt::Let(name, expr) => {
                let value = self.eval(frame, expr)?;
                frame.declare(name, value);
            }
            Stmt::Assign(place, expr) => {
                let value = self.eval(frame, expr)?;
                self.assign(frame, place, value)?;
            }
            Stmt::If(condition, then_branch, else_branch) => {
                let branch = if self.eval(frame, condition)?.is_truthy() {
                    then_branch
                } else {
                    else_branch
                };
                return self.exec_block(frame, branch);
            }
            Stmt::While(condition, body) => {
                while self.eval(frame, condition)?.is_truthy() {
                    if let Flow::Return(value) = self.exec_block(frame, body)? {
                        return Ok(Flow::Return(value));
                    }
                }
            }
            Stmt::Return(expr) => {
                let value = match expr {
                    Some(expr) => self.eval(frame, expr)?,
                    None => Value::Null,
                };
                return Ok(Flow::Return(value));
            }
            Stmt::Throw(expr) => {
                let value = self.eval(frame, expr)?;
                return Err(Raise::Throw(value.to_string()));
            }
            Stmt::Expr(expr) => {
                self.eval(frame, expr)?;
            }
        }
        Ok(Flow::Normal)
    }

    fn assign(&mut self, frame: &mut Frame, place: &Place, value: Value) -> Eval<()> {
        let mut keys = Vec::with_capacity(place.path.len());
        for segment in &place.path {
            keys.push(match segment {
                PathSegment::Field(name) => Value::String(name.clone()),
                PathSegment::Index(expr) => self.eval(frame, expr)?,
            });
        }
        let slot = frame
            .lookup_mut(&place.root)
            .ok_or_else(|| runtime(format!("assignment to undeclared variable '{}'", place.root)))?;
        if keys.len() + value.depth() > MAX_VALUE_DEPTH {
            return Err(too_deep());
        }
        assign_path(slot, &keys, value)
    }

    // ── Expressions ────────────────────────────────────────

    fn eval(&mut self, frame: &mut Frame, expr: &Expr) -> Eval<Value> {
        self.descend()?;
        let value = self.eval_expr(frame, expr);
        self.nesting -= 1;
        value
    }

    fn eval_expr(&mut self, frame: &mut Frame, expr: &Expr) -> Eval<Value> {
        self.sandbox.charge(EXPRESSION_GAS)?;
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Var(name) => frame
                .lookup(name)
                .or_else(|| self.globals.get(name))
                .cloned()
                .ok_or_else(|| runtime(format!("undefined variable '{name}'"))),
            Expr::Object(fields) => {
                let mut map = BTreeMap::new();
                for (key, expr) in fields {
                    map.insert(key.clone(), self.eval(frame, expr)?);
                }
                bounded(Value::Object(map))
            }
            Expr::Array(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(frame, item)?);
                }
                bounded(Value::Array(values))
            }
            Expr::Field(target, name) => {
                let target = self.eval(frame, target)?;
                read_key(&target, &Value::String(name.clone()))
            }
            Expr::Index(target, index) => {
                let target = self.eval(frame, target)?;
                let index = self.eval(frame, index)?;
                read_key(&target, &index)
            }
            Expr::Call(name, args, span) => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(frame, arg)?);
                }
                self.call_named(name, values, *span)
            }
            Expr::Unary(op, operand) => {
                let value = self.eval(frame, operand)?;
                unary(*op, value)
            }
            Expr::Binary(BinaryOp::And, lhs, rhs) => {
                let left = self.eval(frame, lhs)?;
                if left.is_truthy() {
                    self.eval(frame, rhs)
                } else {
                    Ok(left)
                }
            }
            Expr::Binary(BinaryOp::Or, lhs, rhs) => {
                let left = self.eval(frame, lhs)?;
                if left.is_truthy() {
                    Ok(left)
                } else {
                    self.eval(frame, rhs)
                }
            }
            Expr::Binary(op, lhs, rhs) => {
                let left = self.eval(frame, lhs)?;
                let right = self.eval(frame, rhs)?;
                binary(*op, left, right)
            }
        }
    }

    // ── Calls & builtins ───────────────────────────────────

    fn call_named(&mut self, name: &str, args: Vec<Value>, span: Span) -> Eval<Value> {
        if let Some(function) = self.program.function(name) {
            return self.call_function(function, args);
        }
        if FORBIDDEN.contains(&name) {
            return Err(self.sandbox.forbidden(name).into());
        }
        self.sandbox.charge(CALL_GAS)?;
        match (name, args.as_slice()) {
            ("assert", [condition]) => assert(condition, "assertion failed".to_string()),
            ("assert", [condition, message]) => assert(condition, message.to_string()),
            ("len", [value]) => length(value),
            ("keys", [Value::Object(map)]) => Ok(Value::Array(
                map.keys().cloned().map(Value::String).collect(),
            )),
            ("push", [Value::Array(items), value]) => {
                let mut items = items.clone();
                items.push(value.clone());
                bounded(Value::Array(items))
            }
            ("contains", [haystack, needle]) => contains(haystack, needle),
            ("str", [value]) => Ok(Value::String(value.to_string())),
            ("int", [value]) => to_int(value),
            ("read_contract_state", [Value::String(target)]) => {
                let result = self.sandbox.read_contract_state(target)?;
                Ok(Value::from_json(&result.state))
            }
            ("read_contract_state", [Value::String(target), with_validity]) => {
                let result = self.sandbox.read_contract_state(target)?;
                if !with_validity.is_truthy() {
                    return Ok(Value::from_json(&result.state));
                }
                let validity = result
                    .validity
                    .iter()
                    .map(|(id, ok)| (id.clone(), Value::Boolean(*ok)))
                    .collect();
                Ok(object([
                    ("state", Value::from_json(&result.state)),
                    ("validity", Value::Object(validity)),
                ]))
            }
            ("view_contract_state", [Value::String(target), input]) => {
                let outcome = self.sandbox.view_contract_state(target, input.to_json())?;
                Ok(Value::from_json(&outcome.to_json()))
            }
            ("refresh_state", []) => {
                let result = self.sandbox.refresh_state()?;
                Ok(Value::from_json(&result.state))
            }
            ("write", [Value::String(target), input]) => {
                let outcome = self.sandbox.write(target, input.to_json())?;
                Ok(Value::from_json(&outcome.to_json()))
            }
            _ => Err(runtime(format!(
                "no function '{}' accepting {} argument(s) at {}",
                name,
                args.len(),
                span
            ))),
        }
    }
}

// ── Helpers ───────────────────────────────────────────────

fn object<const N: usize>(fields: [(&str, Value); N]) -> Value {
    Value::Object(
        fields
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
    )
}

fn too_deep() -> Raise {
    runtime(format!("value nested deeper than {MAX_VALUE_DEPTH}"))
}

fn bounded(value: Value) -> Eval<Value> {
    if value.depth() > MAX_VALUE_DEPTH {
        return Err(too_deep());
    }
    Ok(value)
}

fn int_from_u64(n: u64) -> Value {
    i64::try_from(n)
        .map(Value::Integer)
        .unwrap_or(Value::Float(n as f64))
}

fn assert(condition: &Value, message: String) -> Eval<Value> {
    if condition.is_truthy() {
        Ok(Value::Null)
    } else {
        Err(Raise::Throw(message))
    }
}

fn length(value: &Value) -> Eval<Value> {
    let len = match value {
        Value::String(s) => s.chars().count(),
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
        other => return Err(runtime(format!("len() of {}", other.type_name()))),
    };
    Ok(Value::Integer(len as i64))
}

fn contains(haystack: &Value, needle: &Value) -> Eval<Value> {
    let found = match (haystack, needle) {
        (Value::Array(items), needle) => items.iter().any(|item| item.loose_eq(needle)),
        (Value::Object(map), Value::String(key)) => map.contains_key(key),
        (Value::String(s), Value::String(sub)) => s.contains(sub.as_str()),
        (h, n) => {
            return Err(runtime(format!(
                "contains() of {} in {}",
                n.type_name(),
                h.type_name()
            )))
        }
    };
    Ok(Value::Boolean(found))
}

fn to_int(value: &Value) -> Eval<Value> {
    match value {
        Value::Integer(i) => Ok(Value::Integer(*i)),
        Value::Float(f) if f.is_finite() && f.abs() < 9.2e18 => Ok(Value::Integer(f.trunc() as i64)),
        Value::String(s) => s
            .trim()
            .parse()
            .map(Value::Integer)
            .map_err(|_| runtime(format!("int() of non-numeric string '{s}'"))),
        other => Err(runtime(format!("int() of {}", other.type_name()))),
    }
}

fn read_key(target: &Value, key: &Value) -> Eval<Value> {
    match (target, key) {
        (Value::Object(map), Value::String(k)) => Ok(map.get(k).cloned().unwrap_or(Value::Null)),
        (Value::Array(items), Value::Integer(i)) => Ok(usize::try_from(*i)
            .ok()
            .and_then(|i| items.get(i))
            .cloned()
            .unwrap_or(Value::Null)),
        (Value::Array(items), Value::String(k)) if k == "length" => {
            Ok(Value::Integer(items.len() as i64))
        }
        (Value::Null, key) => Err(runtime(format!("cannot read '{key}' of null"))),
        (target, key) => Err(runtime(format!(
            "cannot index {} with {}",
            target.type_name(),
            key.type_name()
        ))),
    }
}

fn assign_path(target: &mut Value, keys: &[Value], value: Value) -> Eval<()> {
    let Some((key, rest)) = keys.split_first() else {
        *target = value;
        return Ok(());
    };
    if matches!(target, Value::Null) && matches!(key, Value::String(_)) {
        *target = Value::Object(BTreeMap::new());
    }
    match (target, key) {
        (Value::Object(map), Value::String(k)) => {
            assign_path(map.entry(k.clone()).or_insert(Value::Null), rest, value)
        }
        (Value::Array(items), Value::Integer(i)) => {
            let len = items.len();
            let slot = usize::try_from(*i)
                .ok()
                .and_then(|i| items.get_mut(i))
                .ok_or_else(|| runtime(format!("index {i} out of bounds for array of {len}")))?;
            assign_path(slot, rest, value)
        }
        (target, key) => Err(runtime(format!(
            "cannot assign into {} with {}",
            target.type_name(),
            key.type_name()
        ))),
    }
}

fn overflow(op: &str) -> Raise {
    runtime(format!("integer overflow in {op}"))
}

fn unary(op: UnaryOp, value: Value) -> Eval<Value> {
    match (op, value) {
        (UnaryOp::Not, value) => Ok(Value::Boolean(!value.is_truthy())),
        (UnaryOp::Neg, Value::Integer(i)) => i.checked_neg().map(Value::Integer).ok_or_else(|| overflow("negation")),
        (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOp::Neg, other) => Err(runtime(format!("cannot negate {}", other.type_name()))),
    }
}

fn binary(op: BinaryOp, left: Value, right: Value) -> Eval<Value> {
    use Value::{Float, Integer};

    match op {
        BinaryOp::Eq => return Ok(Value::Boolean(left.loose_eq(&right))),
        BinaryOp::NotEq => return Ok(Value::Boolean(!left.loose_eq(&right))),
        BinaryOp::Less | BinaryOp::LessEq | BinaryOp::Greater | BinaryOp::GreaterEq => {
            return compare(op, &left, &right)
        }
        _ => {}
    }

    match (op, &left, &right) {
        (BinaryOp::Add, Value::String(_), _) | (BinaryOp::Add, _, Value::String(_)) => {
            Ok(Value::String(format!("{left}{right}")))
        }
        (BinaryOp::Add, Value::Array(a), Value::Array(b)) => {
            Ok(Value::Array(a.iter().chain(b).cloned().collect()))
        }
        (_, Integer(a), Integer(b)) => {
            let (a, b) = (*a, *b);
            let result = match op {
                BinaryOp::Add => a.checked_add(b).ok_or_else(|| overflow("addition"))?,
                BinaryOp::Sub => a.checked_sub(b).ok_or_else(|| overflow("subtraction"))?,
                BinaryOp::Mul => a.checked_mul(b).ok_or_else(|| overflow("multiplication"))?,
                BinaryOp::Div | BinaryOp::Rem if b == 0 => return Err(runtime("division by zero")),
                BinaryOp::Div => a.checked_div(b).ok_or_else(|| overflow("division"))?,
                BinaryOp::Rem => a.checked_rem(b).ok_or_else(|| overflow("remainder"))?,
                _ => return Err(runtime(format!("unsupported operator {op:?}"))),
            };
            Ok(Integer(result))
        }
        (_, Integer(_) | Float(_), Integer(_) | Float(_)) => {
            let (a, b) = (left.as_f64().unwrap_or(0.0), right.as_f64().unwrap_or(0.0));
            let result = match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => a / b,
                BinaryOp::Rem => a % b,
                _ => return Err(runtime(format!("unsupported operator {op:?}"))),
            };
            Ok(Float(result))
        }
        _ => Err(runtime(format!(
            "unsupported operands for {:?}: {} and {}",
            op,
            left.type_name(),
            right.type_name()
        ))),
    }
}

fn compare(op: BinaryOp, left: &Value, right: &Value) -> Eval<Value> {
    use std::cmp::Ordering;

    let ordering = match (left, right) {
        (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (l, r) => match (l.as_f64(), r.as_f64()) {
            (Some(a), Some(b)) => match a.partial_cmp(&b) {
                Some(ordering) => ordering,
                None => return Ok(Value::Boolean(false)),
            },
            _ => {
                return Err(runtime(format!(
                    "cannot compare {} with {}",
                    l.type_name(),
                    r.type_name()
                )))
            }
        },
    };
    let result = match op {
        BinaryOp::Less => ordering == Ordering::Less,
        BinaryOp::LessEq => ordering != Ordering::Greater,
        BinaryOp::Greater => ordering == Ordering::Greater,
        _ => ordering != Ordering::Less,
    };
    Ok(Value::Boolean(result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checked_integer_arithmetic() {
        assert_eq!(
            binary(BinaryOp::Add, Value::Integer(2), Value::Integer(3)),
            Ok(Value::Integer(5))
        );
        assert!(binary(BinaryOp::Add, Value::Integer(i64::MAX), Value::Integer(1)).is_err());
        assert!(binary(BinaryOp::Div, Value::Integer(1), Value::Integer(0)).is_err());
        assert!(unary(UnaryOp::Neg, Value::Integer(i64::MIN)).is_err());
        assert_eq!(
            binary(BinaryOp::Div, Value::Integer(7), Value::Integer(2)),
            Ok(Value::Integer(3))
        );
    }

    #[test]
    fn test_mixed_and_string_arithmetic() {
        assert_eq!(
            binary(BinaryOp::Mul, Value::Integer(2), Value::Float(1.5)),
            Ok(Value::Float(3.0))
        );
        assert_eq!(
            binary(BinaryOp::Add, Value::String("n=".into()), Value::Integer(4)),
            Ok(Value::String("n=4".into()))
        );
        assert!(binary(BinaryOp::Sub, Value::Null, Value::Integer(1)).is_err());
    }

    #[test]
    fn test_comparisons() {
        assert_eq!(
            compare(BinaryOp::Less, &Value::Integer(1), &Value::Float(1.5)),
            Ok(Value::Boolean(true))
        );
        assert_eq!(
            compare(BinaryOp::GreaterEq, &Value::String("b".into()), &Value::String("a".into())),
            Ok(Value::Boolean(true))
        );
        assert!(compare(BinaryOp::Less, &Value::Null, &Value::Integer(1)).is_err());
    }

    #[test]
    fn test_assign_path_autovivifies_objects() {
        let mut root = Value::Object(BTreeMap::new());
        let keys = [Value::String("a".into()), Value::String("b".into())];
        assign_path(&mut root, &keys, Value::Integer(1)).unwrap();
        assert_eq!(root.to_json(), serde_json::json!({"a": {"b": 1}}));

        let mut list = Value::Array(vec![Value::Null]);
        assert!(assign_path(&mut list, &[Value::Integer(3)], Value::Null).is_err());
        assign_path(&mut list, &[Value::Integer(0)], Value::Boolean(true)).unwrap();
        assert_eq!(list, Value::Array(vec![Value::Boolean(true)]));
    }

    #[test]
    fn test_bounded_value_depth() {
        let mut value = Value::Null;
        for _ in 0..MAX_VALUE_DEPTH {
            value = bounded(Value::Array(vec![value])).unwrap();
        }
        assert_eq!(value.depth(), MAX_VALUE_DEPTH);
        assert!(bounded(Value::Array(vec![value])).is_err());
    }

    #[test]
    fn test_read_key() {
        let arr = Value::Array(vec![Value::Integer(9)]);
        assert_eq!(read_key(&arr, &Value::Integer(0)), Ok(Value::Integer(9)));
        assert_eq!(read_key(&arr, &Value::Integer(-1)), Ok(Value::Null));
        assert_eq!(read_key(&arr, &Value::String("length".into())), Ok(Value::Integer(1)));
        assert!(read_key(&Value::Null, &Value::String("x".into())).is_err());
    }
}
