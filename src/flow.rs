//! # Flow Containers
//!
//! A [`FlowContainer`] is the root of one flow: its identity, a unique name, an optional
//! start node, an optional container-wide exception handler and the arena of member
//! nodes. Containers are immutable once built and shared as `Arc<FlowContainer>` between
//! the engine, forked tasks and sub-flow calls.
//!
//! ## Building flows
//!
//! ```rust
//! use flowgraph_rs::prelude::*;
//! use flowgraph_rs::ComparisonOperator;
//! use serde_json::json;
//!
//! let flow = FlowBuilder::new("check")
//!     .start("decide")
//!     .node(FlowNode::new("five", NodeKind::constant(json!(5))))
//!     .node(FlowNode::new("three", NodeKind::constant(json!(3))))
//!     .node(FlowNode::new(
//!         "greater",
//!         NodeKind::comparison(ComparisonOperator::Greater, "five", "three"),
//!     ))
//!     .node(FlowNode::new("decide", NodeKind::decision("greater", Some("yes"), Some("no"))))
//!     .node(FlowNode::new("yes", NodeKind::returning(None, Some("five"))))
//!     .node(FlowNode::new("no", NodeKind::returning(None, Some("three"))))
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(flow.len(), 6);
//! ```
//!
//! ## Validation
//!
//! [`FlowBuilder::build`] rejects graphs whose edges point at unknown nodes, whose
//! exception handler edges do not point at `ExceptionHandler` nodes, whose switch cases
//! are not `SwitchCase` nodes, and whose call inputs are not `ParameterInput` nodes.
//!
//! ## Configuration and results
//!
//! [`EngineConfig`] bounds a run (steps, call depth, join timeout). [`FlowResult`] is the
//! outcome of a run: a value, or an error attributed to the node that raised it.

use crate::context::{FlowContext, Principal};
use crate::engine::FlowEngine;
use crate::node::{FlowId, FlowNode, NodeId, NodeKind};
use crate::{FlowError, FlowGraphResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for flow execution
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Maximum number of control nodes a single path may visit
    pub max_steps: usize,
    /// Maximum nesting of sub-flow calls
    pub max_call_depth: usize,
    /// How long a `ForkJoin` waits for each forked task; `None` waits forever
    pub fork_join_timeout: Option<Duration>,
    /// Value returned by [`FlowEngine::invoke_named`] when a run fails
    pub failure_value: Value,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: 10_000,
            max_call_depth: 64,
            fork_join_timeout: None,
            failure_value: Value::Null,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum execution steps
    pub fn max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Set maximum sub-flow call depth
    pub fn max_call_depth(mut self, max_call_depth: usize) -> Self {
        self.max_call_depth = max_call_depth;
        self
    }

    pub fn fork_join_timeout(mut self, timeout: Duration) -> Self {
        self.fork_join_timeout = Some(timeout);
        self
    }

    pub fn failure_value(mut self, value: Value) -> Self {
        self.failure_value = value;
        self
    }
}

// ============================================================================
// RESULTS
// ============================================================================

/// Execution result from a flow run
#[derive(Debug, Clone)]
pub struct FlowResult {
    /// The produced value, `null` on failure
    pub value: Value,
    /// The unrecovered error that ended the run, if any
    pub error: Option<FlowError>,
    /// Number of control nodes visited, loop bodies included
    pub steps_executed: usize,
    /// Execution path (control node ids in visit order)
    pub execution_path: Vec<NodeId>,
}

impl FlowResult {
    pub fn success(value: Value) -> Self {
        Self {
            value,
            error: None,
            steps_executed: 0,
            execution_path: Vec::new(),
        }
    }

    pub fn failure(error: FlowError) -> Self {
        Self {
            value: Value::Null,
            error: Some(error),
            steps_executed: 0,
            execution_path: Vec::new(),
        }
    }

    pub(crate) fn with_trace(mut self, steps_executed: usize, execution_path: Vec<NodeId>) -> Self {
        self.steps_executed = steps_executed;
        self.execution_path = execution_path;
        self
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Convert into a plain `Result`
    pub fn into_result(self) -> FlowGraphResult<Value> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.value),
        }
    }

    /// The produced value as a sequence: arrays are spread, `null` is empty.
    pub fn into_values(self) -> Vec<Value> {
        match self.value {
            Value::Array(values) => values,
            Value::Null => Vec::new(),
            other => vec![other],
        }
    }
}

// ============================================================================
// CONTAINER
// ============================================================================

/// Serialized shape of a flow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FlowDefinition {
    #[serde(default)]
    id: FlowId,
    name: String,
    start: Option<NodeId>,
    exception_handler: Option<NodeId>,
    #[serde(default)]
    nodes: Vec<FlowNode>,
}

/// The root of one flow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "FlowDefinition", into = "FlowDefinition")]
pub struct FlowContainer {
    id: FlowId,
    name: String,
    start: Option<NodeId>,
    exception_handler: Option<NodeId>,
    nodes: HashMap<NodeId, FlowNode>,
}

impl TryFrom<FlowDefinition> for FlowContainer {
    type Error = FlowError;

    fn try_from(definition: FlowDefinition) -> Result<Self, Self::Error> {
        let mut builder = FlowBuilder::new(definition.name);
        if !definition.id.as_str().is_empty() {
            builder = builder.id(definition.id);
        }
        if let Some(start) = definition.start {
            builder = builder.start(start);
        }
        if let Some(handler) = definition.exception_handler {
            builder = builder.exception_handler(handler);
        }
        definition
            .nodes
            .into_iter()
            .fold(builder, FlowBuilder::node)
            .build()
    }
}

impl From<FlowContainer> for FlowDefinition {
    fn from(container: FlowContainer) -> Self {
        let mut nodes: Vec<FlowNode> = container.nodes.into_values().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Self {
            id: container.id,
            name: container.name,
            start: container.start,
            exception_handler: container.exception_handler,
            nodes,
        }
    }
}

impl FlowContainer {
    pub fn id(&self) -> &FlowId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The designated start node
    pub fn start(&self) -> Option<&NodeId> {
        self.start.as_ref()
    }

    /// The container-wide default exception handler
    pub fn exception_handler(&self) -> Option<&NodeId> {
        self.exception_handler.as_ref()
    }

    pub fn get(&self, id: &NodeId) -> Option<&FlowNode> {
        self.nodes.get(id)
    }

    /// Look up a member node
    pub fn node(&self, id: &NodeId) -> FlowGraphResult<&FlowNode> {
        self.nodes
            .get(id)
            .ok_or_else(|| FlowError::NodeNotFound(id.clone()))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &FlowNode> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The exception handler responsible for failures of `node`.
    ///
    /// The node's own handler wins over the container default. A handler never handles
    /// its own failures.
    pub fn handler_for<'a>(&'a self, node: &'a FlowNode) -> Option<&'a NodeId> {
        node.exception_handler
            .as_ref()
            .or(self.exception_handler.as_ref())
            .filter(|handler| **handler != node.id)
    }

    /// The handler declared on `node` itself, ignoring the container default.
    ///
    /// Loop bodies use this: a body failure without a local handler belongs to the
    /// enclosing `ForEach`.
    pub fn own_handler<'a>(&'a self, node: &'a FlowNode) -> Option<&'a NodeId> {
        node.exception_handler
            .as_ref()
            .filter(|handler| **handler != node.id)
    }

    /// Every node reachable from `from` over control edges, `from` included.
    pub fn control_reachable(&self, from: &NodeId) -> HashSet<NodeId> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([from.clone()]);

        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(node) = self.nodes.get(&id) {
                queue.extend(node.kind.control_edges().into_iter().cloned());
                queue.extend(node.next.iter().cloned());
            }
        }

        seen
    }

    /// Check that every edge points at a node of the right kind
    pub fn validate(&self) -> FlowGraphResult<()> {
        if let Some(start) = &self.start {
            let node = self.node(start).map_err(|_| {
                FlowError::configuration(format!("Start node '{}' not found", start))
            })?;
            if !node.kind.is_control() {
                return Err(FlowError::configuration(format!(
                    "Start node '{}' is a {} data source",
                    start, node.kind
                )));
            }
        }

        if let Some(handler) = &self.exception_handler {
            self.expect_kind(handler, "default exception handler", |kind| {
                matches!(kind, NodeKind::ExceptionHandler)
            })?;
        }

        for node in self.nodes.values() {
            for target in node.next.iter().chain(node.kind.control_edges()) {
                self.expect_edge(node, target)?;
            }
            for source in node.kind.data_edges() {
                self.expect_edge(node, source)?;
            }
            if let Some(handler) = &node.exception_handler {
                self.expect_kind(handler, "exception handler", |kind| {
                    matches!(kind, NodeKind::ExceptionHandler)
                })?;
            }

            match &node.kind {
                NodeKind::Switch { cases, .. } => {
                    for case in cases {
                        self.expect_kind(case, "switch case", |kind| {
                            matches!(kind, NodeKind::SwitchCase { .. })
                        })?;
                    }
                }
                NodeKind::Call { inputs, .. } => {
                    for input in inputs {
                        self.expect_kind(input, "call input", |kind| {
                            matches!(kind, NodeKind::ParameterInput { .. })
                        })?;
                    }
                }
                NodeKind::ObjectDataSource { entries } => {
                    for entry in entries {
                        self.expect_kind(entry, "object entry", |kind| {
                            matches!(kind, NodeKind::KeyValue { .. })
                        })?;
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }

    fn expect_edge(&self, from: &FlowNode, target: &NodeId) -> FlowGraphResult<()> {
        if self.nodes.contains_key(target) {
            Ok(())
        } else {
            Err(FlowError::configuration(format!(
                "Node '{}' references unknown node '{}'",
                from.id, target
            )))
        }
    }

    fn expect_kind(
        &self,
        id: &NodeId,
        role: &str,
        accept: impl Fn(&NodeKind) -> bool,
    ) -> FlowGraphResult<()> {
        let node = self
            .node(id)
            .map_err(|_| FlowError::configuration(format!("{} '{}' not found", role, id)))?;
        if accept(&node.kind) {
            Ok(())
        } else {
            Err(FlowError::configuration(format!(
                "{} '{}' has unexpected kind {}",
                role, id, node.kind
            )))
        }
    }

    /// Load a flow from its JSON definition
    pub fn from_json(json: &str) -> FlowGraphResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| FlowError::configuration(format!("Invalid flow definition: {}", e)))
    }

    pub fn to_json(&self) -> FlowGraphResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| FlowError::configuration(format!("Cannot serialize flow: {}", e)))
    }

    /// Run this flow from its start node for `principal` and return its values.
    ///
    /// Failures are logged and yield no values.
    pub async fn evaluate(
        self: &Arc<Self>,
        engine: &FlowEngine,
        principal: Principal,
        parameters: HashMap<String, Value>,
    ) -> Vec<Value> {
        let context = FlowContext::new()
            .with_principal(principal)
            .with_parameters(parameters);

        let result = engine.run(&context, self).await;
        match result.error {
            Some(error) => {
                tracing::warn!(flow = %self.name, error = %error, "flow evaluation failed");
                Vec::new()
            }
            None => result.into_values(),
        }
    }
}

// ============================================================================
// BUILDER
// ============================================================================

/// Builder for creating flows easily
#[derive(Debug, Clone)]
pub struct FlowBuilder {
    id: FlowId,
    name: String,
    start: Option<NodeId>,
    exception_handler: Option<NodeId>,
    nodes: Vec<FlowNode>,
}

impl FlowBuilder {
    /// Create a new flow builder; the flow id defaults to the name
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: FlowId::new(name.clone()),
            name,
            start: None,
            exception_handler: None,
            nodes: Vec::new(),
        }
    }

    pub fn id(mut self, id: impl Into<FlowId>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the starting node ID
    pub fn start(mut self, node_id: impl Into<NodeId>) -> Self {
        self.start = Some(node_id.into());
        self
    }

    /// Set the container-wide exception handler
    pub fn exception_handler(mut self, node_id: impl Into<NodeId>) -> Self {
        self.exception_handler = Some(node_id.into());
        self
    }

    /// Add a node to the flow
    pub fn node(mut self, node: FlowNode) -> Self {
        self.nodes.push(node);
        self
    }

    /// Assemble and validate the container
    pub fn build(self) -> FlowGraphResult<FlowContainer> {
        let mut nodes = HashMap::with_capacity(self.nodes.len());
        for mut node in self.nodes {
            node.flow = self.id.clone();
            let id = node.id.clone();
            if nodes.insert(id.clone(), node).is_some() {
                return Err(FlowError::configuration(format!(
                    "Duplicate node id '{}' in flow '{}'",
                    id, self.name
                )));
            }
        }

        let container = FlowContainer {
            id: self.id,
            name: self.name,
            start: self.start,
            exception_handler: self.exception_handler,
            nodes,
        };
        container.validate()?;
        Ok(container)
    }
}
