//! Shared fixtures for the integration tests.
//!
//! [`TestEvaluator`] understands a tiny expression language, enough to drive flows:
//!
//! - literals: `42`, `2.5`, `'text'`, `true`, `false`, `null`
//! - bindings and dotted paths: `data`, `currentValue`, `data.name`
//! - left-to-right binary operators separated by spaces: `+ - * > < ==`
//! - functions: `upper(x)`, `record(x)`, `sleep(ms)`
//! - side-effecting keywords: `count`, `flaky`, `fail`

#![allow(dead_code)]

use async_trait::async_trait;
use flowgraph_rs::prelude::*;
use flowgraph_rs::{FlowEngineBuilder, JsonObjectAccess};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct TestEvaluator {
    counter: AtomicUsize,
    flaky_calls: AtomicUsize,
    evaluations: AtomicUsize,
    recorded: Mutex<Vec<Value>>,
}

impl TestEvaluator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of times `count` was evaluated
    pub fn count(&self) -> usize {
        self.counter.load(Ordering::SeqCst)
    }

    /// Number of scripts evaluated so far
    pub fn evaluations(&self) -> usize {
        self.evaluations.load(Ordering::SeqCst)
    }

    /// Values passed to `record(..)`, in call order
    pub fn recorded(&self) -> Vec<Value> {
        self.recorded.lock().unwrap().clone()
    }

    async fn term(&self, token: &str, bindings: &Bindings) -> Result<Value, ScriptError> {
        let Some((name, argument)) = token
            .strip_suffix(')')
            .and_then(|call| call.split_once('('))
        else {
            return self.atom(token, bindings);
        };

        let argument = self.atom(argument, bindings)?;
        match name {
            "upper" => Ok(json!(argument.as_str().unwrap_or_default().to_uppercase())),
            "record" => {
                self.recorded.lock().unwrap().push(argument.clone());
                Ok(argument)
            }
            "sleep" => {
                let millis = argument.as_u64().unwrap_or_default();
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok(argument)
            }
            other => Err(ScriptError::Syntax(format!("unknown function {other}"))),
        }
    }

    fn atom(&self, token: &str, bindings: &Bindings) -> Result<Value, ScriptError> {
        match token {
            "fail" => return Err(ScriptError::Runtime("fail".to_string())),
            "count" => {
                let count = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
                return Ok(json!(count));
            }
            "flaky" => {
                // Succeeds once, then fails on every later evaluation
                return match self.flaky_calls.fetch_add(1, Ordering::SeqCst) {
                    0 => Ok(json!("first")),
                    _ => Err(ScriptError::Runtime("flaky".to_string())),
                };
            }
            "true" => return Ok(json!(true)),
            "false" => return Ok(json!(false)),
            "null" => return Ok(Value::Null),
            _ => {}
        }

        if let Some(text) = token
            .strip_prefix('\'')
            .and_then(|t| t.strip_suffix('\''))
        {
            return Ok(json!(text));
        }
        if let Ok(n) = token.parse::<i64>() {
            return Ok(json!(n));
        }
        if let Ok(n) = token.parse::<f64>() {
            return Ok(json!(n));
        }

        let mut segments = token.split('.');
        let root = segments.next().unwrap_or_default();
        let mut value = match root {
            "this" => bindings.this_object().clone(),
            "principal" => json!(bindings.principal().name),
            "label" => json!(bindings.label()),
            name => bindings.get(name).cloned().unwrap_or(Value::Null),
        };
        for segment in segments {
            value = value.get(segment).cloned().unwrap_or(Value::Null);
        }
        Ok(value)
    }
}

fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        json!(value as i64)
    } else {
        json!(value)
    }
}

fn apply(op: &str, left: Value, right: Value) -> Result<Value, ScriptError> {
    let numbers = left.as_f64().zip(right.as_f64());
    match (op, numbers) {
        ("+", Some((a, b))) => Ok(number(a + b)),
        ("-", Some((a, b))) => Ok(number(a - b)),
        ("*", Some((a, b))) => Ok(number(a * b)),
        (">", Some((a, b))) => Ok(json!(a > b)),
        ("<", Some((a, b))) => Ok(json!(a < b)),
        ("+", None) => match (&left, &right) {
            (Value::String(a), Value::String(b)) => Ok(json!(format!("{a}{b}"))),
            (Value::Null, other) | (other, Value::Null) => Ok(other.clone()),
            _ => Err(ScriptError::Runtime(format!("cannot add {left} and {right}"))),
        },
        ("==", _) => Ok(json!(left == right)),
        _ => Err(ScriptError::Runtime(format!(
            "cannot apply {op} to {left} and {right}"
        ))),
    }
}

#[async_trait]
impl ScriptEvaluator for TestEvaluator {
    async fn evaluate(&self, script: &str, bindings: &Bindings) -> Result<Value, ScriptError> {
        self.evaluations.fetch_add(1, Ordering::SeqCst);

        let tokens: Vec<&str> = script.split_whitespace().collect();
        let Some((first, rest)) = tokens.split_first() else {
            return Err(ScriptError::Syntax("empty script".to_string()));
        };

        let mut value = self.term(first, bindings).await?;
        for pair in rest.chunks(2) {
            let [op, operand] = pair else {
                return Err(ScriptError::Syntax(format!("dangling operator in '{script}'")));
            };
            let right = self.term(operand, bindings).await?;
            value = apply(op, value, right)?;
        }
        Ok(value)
    }
}

/// Engine wired with `evaluator` and an empty repository
pub fn engine(evaluator: &Arc<TestEvaluator>) -> FlowEngine {
    builder(evaluator).build()
}

pub fn builder(evaluator: &Arc<TestEvaluator>) -> FlowEngineBuilder {
    FlowEngine::builder()
        .evaluator(evaluator.clone())
        .objects(Arc::new(JsonObjectAccess::new()))
}

pub fn node(id: &str, kind: NodeKind) -> FlowNode {
    FlowNode::new(id, kind)
}

pub fn constant(id: &str, value: Value) -> FlowNode {
    FlowNode::new(id, NodeKind::constant(value))
}
