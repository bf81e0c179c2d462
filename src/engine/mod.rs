//! # Flow Engine
//!
//! The interpreter that drives a flow from an entry node.
//!
//! ## Execution model
//!
//! The engine keeps a cursor on the current control node. Each visit dispatches on the
//! node kind, pulls whatever data the node needs through the data-source protocol
//! (see `data`), and picks the next control edge:
//!
//! - `Decision` takes exactly one of its branches
//! - `ForEach` runs its loop body once per element, each in its own iteration scope
//! - `Switch` takes the first matching case, else its default
//! - `Return` ends the path with a value
//! - `Call` runs another flow in an isolated context (see `call`)
//! - `Fork`/`ForkJoin` start and collect concurrent tasks (see `fork`)
//!
//! ## Exception routing
//!
//! When a visit fails, the engine looks up the node's exception handler (or the flow's
//! default handler). A handler takes over the cursor: it exposes the failing node's
//! pre-failure value, the failing node's value becomes `null`, and the error is recorded
//! as recovered on the context. Without a handler the error ends the run. Configuration
//! errors are never recovered.
//!
//! Inside a `ForEach` body only a node's own handler applies. Any other failure ends the
//! loop and is routed from the `ForEach` node, to its handler or the flow's default.
//!
//! ## Example
//!
//! ```rust
//! use flowgraph_rs::prelude::*;
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let flow = FlowBuilder::new("switch")
//!     .start("switch")
//!     .node(FlowNode::new("value", NodeKind::constant(json!("b"))))
//!     .node(FlowNode::new("switch", NodeKind::switch("value", &["a", "b"], None)))
//!     .node(FlowNode::new("a", NodeKind::switch_case(json!("a"))).next("ret-a"))
//!     .node(FlowNode::new("b", NodeKind::switch_case(json!("b"))).next("ret-b"))
//!     .node(FlowNode::new("ret-a", NodeKind::returning(None, Some("a"))))
//!     .node(FlowNode::new("ret-b", NodeKind::returning(None, Some("b"))))
//!     .build()
//!     .unwrap();
//!
//! let engine = FlowEngine::new();
//! let result = engine.execute_default(&std::sync::Arc::new(flow), &NodeId::new("switch")).await;
//! assert_eq!(result.value, json!("b"));
//! # });
//! ```

mod call;
mod data;
mod fork;

use crate::condition::{is_true, loose_eq};
use crate::context::{FlowContext, Principal};
use crate::flow::{EngineConfig, FlowContainer, FlowResult};
use crate::node::{FlowNode, NodeId, NodeKind, StoreOperation};
use crate::object::{JsonObjectAccess, ObjectAccess};
use crate::repository::{FlowRepository, InMemoryFlowRepository};
use crate::script::{NoScriptEvaluator, ScriptEvaluator};
use crate::{FlowError, FlowGraphResult};
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

struct EngineInner {
    repository: Arc<dyn FlowRepository>,
    evaluator: Arc<dyn ScriptEvaluator>,
    objects: Arc<dyn ObjectAccess>,
    config: EngineConfig,
}

/// The flow interpreter.
///
/// Cheap to clone: clones share the same collaborators and configuration.
#[derive(Clone)]
pub struct FlowEngine {
    inner: Arc<EngineInner>,
}

impl fmt::Debug for FlowEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowEngine")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Default for FlowEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder wiring the engine's collaborators
#[derive(Default)]
pub struct FlowEngineBuilder {
    repository: Option<Arc<dyn FlowRepository>>,
    evaluator: Option<Arc<dyn ScriptEvaluator>>,
    objects: Option<Arc<dyn ObjectAccess>>,
    config: EngineConfig,
}

impl FlowEngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Repository used to resolve `Call` targets and named flows
    pub fn repository(mut self, repository: Arc<dyn FlowRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Evaluator for script-bearing nodes
    pub fn evaluator(mut self, evaluator: Arc<dyn ScriptEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    /// Object model used by `GetProperty`, parameter paths and `TypeQuery`
    pub fn objects(mut self, objects: Arc<dyn ObjectAccess>) -> Self {
        self.objects = Some(objects);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> FlowEngine {
        FlowEngine {
            inner: Arc::new(EngineInner {
                repository: self
                    .repository
                    .unwrap_or_else(|| Arc::new(InMemoryFlowRepository::new())),
                evaluator: self.evaluator.unwrap_or_else(|| Arc::new(NoScriptEvaluator)),
                objects: self
                    .objects
                    .unwrap_or_else(|| Arc::new(JsonObjectAccess::new())),
                config: self.config,
            }),
        }
    }
}

impl FlowEngine {
    /// An engine with default collaborators and configuration
    pub fn new() -> Self {
        FlowEngineBuilder::new().build()
    }

    pub fn builder() -> FlowEngineBuilder {
        FlowEngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn repository(&self) -> &Arc<dyn FlowRepository> {
        &self.inner.repository
    }

    pub fn evaluator(&self) -> &Arc<dyn ScriptEvaluator> {
        &self.inner.evaluator
    }

    pub fn objects(&self) -> &Arc<dyn ObjectAccess> {
        &self.inner.objects
    }

    /// Execute `flow` from `entry` in `context`.
    ///
    /// Never fails: an unrecovered error is reported in [`FlowResult::error`].
    pub async fn execute(
        &self,
        context: &FlowContext,
        flow: &Arc<FlowContainer>,
        entry: &NodeId,
    ) -> FlowResult {
        info!(
            flow = %flow.name(),
            node = %entry,
            context = %context.id(),
            "flow execution started"
        );

        let scope = Scope::new(self.clone(), flow.clone(), context.clone(), 0);
        let mut trace = PathTrace::default();
        let result = match run_path(&scope, entry.clone(), &mut trace).await {
            Ok(outcome) => FlowResult::success(outcome.into_value()),
            Err(error) => FlowResult::failure(error),
        };

        let pending = context.pending_forks();
        if pending > 0 {
            warn!(
                flow = %flow.name(),
                context = %context.id(),
                pending,
                "forked tasks were never joined and keep running detached"
            );
        }

        match &result.error {
            None => info!(
                flow = %flow.name(),
                context = %context.id(),
                steps = trace.steps,
                "flow execution completed"
            ),
            Some(error) => warn!(
                flow = %flow.name(),
                context = %context.id(),
                steps = trace.steps,
                error = %error,
                "flow execution failed"
            ),
        }

        result.with_trace(trace.steps, trace.path)
    }

    /// Execute `flow` from `entry` in a fresh default context
    pub async fn execute_default(&self, flow: &Arc<FlowContainer>, entry: &NodeId) -> FlowResult {
        self.execute(&FlowContext::new(), flow, entry).await
    }

    /// Execute `flow` from its start node
    pub async fn run(&self, context: &FlowContext, flow: &Arc<FlowContainer>) -> FlowResult {
        match flow.start() {
            Some(start) => self.execute(context, flow, start).await,
            None => FlowResult::failure(FlowError::MissingStartNode(flow.name().to_string())),
        }
    }

    /// Run the stored flow called `name`.
    ///
    /// Failures are soft: they are logged and the configured failure value is returned.
    pub async fn invoke_named(
        &self,
        name: &str,
        principal: Principal,
        parameters: HashMap<String, Value>,
    ) -> Value {
        let Some(flow) = self.repository().flow_by_name(name) else {
            error!(flow = %name, "no flow with this name");
            return self.config().failure_value.clone();
        };

        let context = FlowContext::new()
            .with_principal(principal)
            .with_parameters(parameters);

        let result = self.run(&context, &flow).await;
        match result.error {
            None => result.value,
            Some(error) => {
                error!(
                    flow = %name,
                    node = ?error.origin(),
                    error = %error,
                    "named flow failed"
                );
                self.config().failure_value.clone()
            }
        }
    }
}

// ============================================================================
// INTERPRETER
// ============================================================================

/// Everything a visit or pull needs: the engine, the flow being run and its context.
#[derive(Clone)]
pub(crate) struct Scope {
    pub(crate) engine: FlowEngine,
    pub(crate) flow: Arc<FlowContainer>,
    pub(crate) ctx: FlowContext,
    /// Sub-flow nesting level, 0 for a top-level run
    pub(crate) depth: usize,
    /// Data sources currently being computed by this task
    pub(crate) chain: Vec<NodeId>,
    /// Running inside a `ForEach` body: only node-local handlers apply
    pub(crate) in_loop_body: bool,
}

impl Scope {
    pub(crate) fn new(
        engine: FlowEngine,
        flow: Arc<FlowContainer>,
        ctx: FlowContext,
        depth: usize,
    ) -> Self {
        Self {
            engine,
            flow,
            ctx,
            depth,
            chain: Vec::new(),
            in_loop_body: false,
        }
    }

    /// Same scope with a layered data cache
    pub(crate) fn iteration(&self) -> Self {
        Self {
            ctx: self.ctx.iteration_scope(),
            ..self.clone()
        }
    }

    /// Iteration scope of one `ForEach` element
    pub(crate) fn loop_body(&self) -> Self {
        Self {
            in_loop_body: true,
            ..self.iteration()
        }
    }

    /// Same context, for a task that starts with no data source in progress
    pub(crate) fn detached(&self) -> Self {
        Self {
            chain: Vec::new(),
            in_loop_body: false,
            ..self.clone()
        }
    }

    pub(crate) fn pulling(&self, id: &NodeId) -> Self {
        let mut scope = self.clone();
        scope.chain.push(id.clone());
        scope
    }
}

#[derive(Debug, Default)]
pub(crate) struct PathTrace {
    pub(crate) steps: usize,
    pub(crate) path: Vec<NodeId>,
}

impl PathTrace {
    fn record(&mut self, id: &NodeId) {
        self.steps += 1;
        self.path.push(id.clone());
    }
}

/// How a control path ended
#[derive(Debug)]
pub(crate) enum PathOutcome {
    /// The path ran out of edges; carries the last produced value
    Completed(Value),
    /// A `Return` ended the path
    Returned(Value),
}

impl PathOutcome {
    pub(crate) fn into_value(self) -> Value {
        match self {
            PathOutcome::Completed(value) | PathOutcome::Returned(value) => value,
        }
    }
}

enum Step {
    Continue {
        next: Option<NodeId>,
        value: Option<Value>,
    },
    Return(Value),
}

impl Step {
    fn next(node: &FlowNode) -> Self {
        Step::Continue {
            next: node.next.clone(),
            value: None,
        }
    }

    fn produced(node: &FlowNode, value: Value) -> Self {
        Step::Continue {
            next: node.next.clone(),
            value: Some(value),
        }
    }

    fn branch(next: Option<NodeId>) -> Self {
        Step::Continue { next, value: None }
    }
}

/// Run the control path starting at `entry` until it runs out of edges or returns
pub(crate) fn run_path<'a>(
    scope: &'a Scope,
    entry: NodeId,
    trace: &'a mut PathTrace,
) -> BoxFuture<'a, FlowGraphResult<PathOutcome>> {
    Box::pin(async move {
        let max_steps = scope.engine.config().max_steps;
        let mut cursor = Some(entry);
        let mut last = Value::Null;
        let mut steps = 0;

        while let Some(id) = cursor.take() {
            let node = scope.flow.node(&id)?;
            if steps >= max_steps {
                return Err(FlowError::MaxStepsExceeded(max_steps).attributed_to(&id));
            }
            steps += 1;
            trace.record(&id);

            debug!(
                flow = %scope.flow.name(),
                node = %id,
                kind = %node.kind,
                context = %scope.ctx.id(),
                "visiting node"
            );

            let before = scope.ctx.data(&id);
            match visit(scope, node, trace).await {
                Ok(Step::Continue { next, value }) => {
                    if let Some(value) = value {
                        last = value;
                    }
                    cursor = next;
                }
                Ok(Step::Return(value)) => return Ok(PathOutcome::Returned(value)),
                Err(error) => cursor = recover(scope, node, before, error)?,
            }
        }

        Ok(PathOutcome::Completed(last))
    })
}

/// Route a failure of `node` to its exception handler, returning the handler's continuation
fn recover(
    scope: &Scope,
    node: &FlowNode,
    before: Option<Value>,
    error: FlowError,
) -> FlowGraphResult<Option<NodeId>> {
    let error = error.attributed_to(&node.id);
    if error.is_configuration() {
        return Err(error);
    }
    let handler = if scope.in_loop_body {
        scope.flow.own_handler(node)
    } else {
        scope.flow.handler_for(node)
    };
    let Some(handler_id) = handler else {
        return Err(error);
    };
    let handler = scope.flow.node(handler_id)?;

    warn!(
        flow = %scope.flow.name(),
        node = %node.id,
        handler = %handler_id,
        error = %error,
        "node failure recovered by exception handler"
    );

    scope.ctx.set_data(handler_id, before.unwrap_or(Value::Null));
    scope.ctx.set_data(&node.id, Value::Null);
    scope.ctx.record_recovered(error);
    Ok(handler.next.clone())
}

async fn visit(scope: &Scope, node: &FlowNode, trace: &mut PathTrace) -> FlowGraphResult<Step> {
    match &node.kind {
        NodeKind::Action { .. } | NodeKind::Call { .. } => {
            let value = data::evaluate(scope, node).await?;
            scope.ctx.set_data(&node.id, value.clone());
            Ok(Step::produced(node, value))
        }
        NodeKind::Return { .. } => {
            let value = data::evaluate(scope, node).await?;
            scope.ctx.set_data(&node.id, value.clone());
            Ok(Step::Return(value))
        }
        NodeKind::Log { .. } => {
            let message = data::evaluate(scope, node).await?;
            match &message {
                Value::String(text) => info!(flow = %scope.flow.name(), node = %node.display_name(), "{}", text),
                other => info!(flow = %scope.flow.name(), node = %node.display_name(), "{}", other),
            }
            scope.ctx.set_data(&node.id, message.clone());
            Ok(Step::produced(node, message))
        }
        NodeKind::Store {
            operation,
            key,
            data_source,
        } => {
            let value = match operation {
                StoreOperation::Store => {
                    let value = data::pull_optional(scope, data_source.as_ref()).await?;
                    scope.ctx.store_set(key.clone(), value.clone());
                    value
                }
                StoreOperation::Retrieve => scope.ctx.store_get(key).unwrap_or(Value::Null),
            };
            scope.ctx.set_data(&node.id, value.clone());
            Ok(Step::produced(node, value))
        }
        NodeKind::Aggregate { .. } => {
            let value = data::advance_aggregate(scope, node).await?;
            Ok(Step::produced(node, value))
        }
        NodeKind::Decision {
            true_element,
            false_element,
            ..
        } => {
            let condition = data::pull(scope, &node.id).await?;
            let taken = if is_true(&condition) {
                true_element
            } else {
                false_element
            };
            debug!(node = %node.id, condition = is_true(&condition), "decision");
            Ok(Step::branch(taken.clone()))
        }
        NodeKind::Switch {
            cases,
            switch_default,
            ..
        } => {
            let value = data::pull(scope, &node.id).await?;
            if !value.is_null() {
                for case_id in cases {
                    let case = scope.flow.node(case_id)?;
                    if let NodeKind::SwitchCase { case: literal } = &case.kind {
                        if loose_eq(literal, &value) {
                            debug!(node = %node.id, case = %case_id, "switch matched");
                            return Ok(Step::branch(case.next.clone()));
                        }
                    }
                }
            }
            Ok(Step::branch(switch_default.clone()))
        }
        NodeKind::SwitchCase { .. } | NodeKind::ExceptionHandler => Ok(Step::next(node)),
        NodeKind::ForEach {
            data_source,
            loop_body,
        } => {
            let items = data::pull_optional(scope, data_source.as_ref()).await?;
            let items = match items {
                Value::Array(items) => items,
                Value::Null => Vec::new(),
                single => vec![single],
            };

            if let Some(body) = loop_body {
                for id in scope.flow.control_reachable(body) {
                    if matches!(scope.flow.get(&id).map(|n| &n.kind), Some(NodeKind::Aggregate { .. })) {
                        scope.ctx.reset_aggregation(&id);
                    }
                }

                for element in items {
                    let iteration = scope.loop_body();
                    iteration.ctx.set_data(&node.id, element);
                    run_path(&iteration, body.clone(), trace).await?;
                }
            }
            Ok(Step::next(node))
        }
        NodeKind::Fork { .. } => {
            fork::spawn(scope, node).await?;
            Ok(Step::next(node))
        }
        NodeKind::ForkJoin => {
            let results = fork::join(scope, node).await?;
            scope.ctx.set_data(&node.id, results.clone());
            Ok(Step::produced(node, results))
        }
        data_only => Err(FlowError::configuration(format!(
            "Node '{}' is a {} data source and cannot be visited",
            node.id, data_only
        ))),
    }
}
