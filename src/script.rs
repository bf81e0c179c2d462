//! # Expression Evaluation
//!
//! Script-bearing nodes (`Action`, `Return`, `Log`, `Aggregate`, `ScriptCondition`)
//! delegate to an external [`ScriptEvaluator`]. The engine only needs
//! `evaluate(script, bindings) -> value`; the expression language itself is up to the
//! host.
//!
//! Every evaluation receives [`Bindings`]: the calling principal, the flow's this object,
//! a context label naming the node, all context parameters, and the node's upstream value
//! under `data`.
//!
//! ```rust
//! use flowgraph_rs::script::{Bindings, FnEvaluator, ScriptError};
//! use serde_json::json;
//!
//! let evaluator = FnEvaluator::new(|script: &str, bindings: &Bindings| match script {
//!     "data" => Ok(bindings.data().clone()),
//!     other => Err(ScriptError::Syntax(other.to_string())),
//! });
//! # let _ = evaluator;
//! ```

use crate::context::Principal;
use async_trait::async_trait;
use serde_json::{Map, Value};

/// Errors reported by a [`ScriptEvaluator`]
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScriptError {
    #[error("Syntax error: {0}")]
    Syntax(String),
    #[error("Runtime error: {0}")]
    Runtime(String),
    #[error("No script evaluator is configured")]
    Unavailable,
}

/// Named values visible to a script
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    principal: Principal,
    this_object: Value,
    label: String,
    values: Map<String, Value>,
}

static NULL: Value = Value::Null;

impl Bindings {
    pub fn new(principal: Principal, this_object: Value, label: impl Into<String>) -> Self {
        Self {
            principal,
            this_object,
            label: label.into(),
            values: Map::new(),
        }
    }

    /// Add a named value, replacing any previous binding
    pub fn bind(mut self, name: impl Into<String>, value: Value) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    /// Add every entry of `values`
    pub fn bind_all<I>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        self.values.extend(values);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// The node's upstream value, `null` when the node has none
    pub fn data(&self) -> &Value {
        self.values.get("data").unwrap_or(&NULL)
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn this_object(&self) -> &Value {
        &self.this_object
    }

    /// Label of the evaluating node, for diagnostics
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }
}

/// The external expression evaluator
#[async_trait]
pub trait ScriptEvaluator: Send + Sync {
    /// Evaluate `script` against `bindings`
    async fn evaluate(&self, script: &str, bindings: &Bindings) -> Result<Value, ScriptError>;
}

/// Adapts a closure into a [`ScriptEvaluator`]
pub struct FnEvaluator<F> {
    f: F,
}

impl<F> FnEvaluator<F>
where
    F: Fn(&str, &Bindings) -> Result<Value, ScriptError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> ScriptEvaluator for FnEvaluator<F>
where
    F: Fn(&str, &Bindings) -> Result<Value, ScriptError> + Send + Sync,
{
    async fn evaluate(&self, script: &str, bindings: &Bindings) -> Result<Value, ScriptError> {
        (self.f)(script, bindings)
    }
}

/// Evaluator used when the host configures none; every script fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoScriptEvaluator;

#[async_trait]
impl ScriptEvaluator for NoScriptEvaluator {
    async fn evaluate(&self, _script: &str, _bindings: &Bindings) -> Result<Value, ScriptError> {
        Err(ScriptError::Unavailable)
    }
}
