//! # flowgraph-rs
//!
//! An interpreter for persisted node-and-edge program graphs ("flows").
//!
//! A flow mixes two kinds of edges:
//! - **Control edges** (`next`, branch targets, loop bodies) that the engine's cursor follows
//! - **Data edges** that a consuming node uses to pull values from data-source nodes
//!
//! Data sources are evaluated lazily and memoized per execution context, so a value
//! feeding several consumers is computed exactly once. Every control node may declare
//! an exception handler that takes over the cursor when the node fails.
//!
//! ## Modules
//!
//! - `node`: node identities and the closed set of node kinds
//! - `flow`: flow containers, the flow builder, run configuration and results
//! - `context`: per-run execution state (data cache, parameters, store, aggregation)
//! - `engine`: the interpreter, data-source protocol, sub-flow calls and fork/join
//! - `script`, `object`, `repository`: the narrow interfaces to external collaborators
//!
//! ## Example
//!
//! ```rust
//! use flowgraph_rs::prelude::*;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let flow = FlowBuilder::new("greeting")
//!     .start("answer")
//!     .node(FlowNode::new("hello", NodeKind::constant(json!("hello"))))
//!     .node(FlowNode::new("answer", NodeKind::returning(None, Some("hello"))))
//!     .build()
//!     .unwrap();
//!
//! let repository = Arc::new(InMemoryFlowRepository::new());
//! let flow = repository.insert(flow);
//! let engine = FlowEngine::builder().repository(repository).build();
//!
//! let result = engine.run(&FlowContext::new(), &flow).await;
//! assert_eq!(result.value, json!("hello"));
//! # });
//! ```

// ============================================================================
// CORE MODULES
// ============================================================================

pub mod condition;
pub mod context;
pub mod engine;
pub mod flow;
pub mod node;
pub mod object;
pub mod repository;
pub mod script;

// ============================================================================
// CORE RE-EXPORTS
// ============================================================================

pub use condition::{ComparisonOperator, LogicOperator};
pub use context::{FlowContext, Principal};
pub use engine::{FlowEngine, FlowEngineBuilder};
pub use flow::{EngineConfig, FlowBuilder, FlowContainer, FlowResult};
pub use node::{ConstantType, FlowId, FlowNode, NodeId, NodeKind, StoreOperation};
pub use object::{JsonObjectAccess, ObjectAccess, ObjectQuery, PropertyAccessor};
pub use repository::{FlowRepository, InMemoryFlowRepository};
pub use script::{Bindings, FnEvaluator, NoScriptEvaluator, ScriptError, ScriptEvaluator};

/// Commonly used external types
pub use serde_json::Value as JsonValue;

/// Convenient re-exports for common types and traits
pub mod prelude {
    pub use crate::{
        Bindings, ComparisonOperator, ConstantType, EngineConfig, FlowBuilder, FlowContainer,
        FlowContext, FlowEngine, FlowError, FlowGraphResult, FlowId, FlowNode, FlowRepository,
        FlowResult, FnEvaluator, InMemoryFlowRepository, JsonObjectAccess, LogicOperator,
        NoScriptEvaluator, NodeId, NodeKind, ObjectAccess, Principal, ScriptError,
        ScriptEvaluator, StoreOperation,
    };

    pub use serde_json::Value as JsonValue;
}

// ============================================================================
// ERROR HANDLING
// ============================================================================

use std::time::Duration;

/// Result type alias for flow operations
pub type FlowGraphResult<T> = Result<T, FlowError>;

/// Every failure the engine can produce.
///
/// Errors fall into three groups: evaluation errors raised while a node computes its
/// value, configuration errors for malformed graphs, and concurrency errors surfaced at
/// a `ForkJoin`. The `AtNode` and `SubFlow` variants attribute an error to the node it
/// happened at; see [`FlowError::origin`] to find the original failing node.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FlowError {
    /// A node failed to produce its value
    #[error("Evaluation error: {0}")]
    Evaluation(String),

    /// The external expression evaluator rejected a script
    #[error("Script error: {0}")]
    Script(#[from] ScriptError),

    /// A value had an unexpected shape
    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: String,
        found: serde_json::Value,
    },

    /// The graph is malformed for the attempted operation
    #[error("Invalid flow configuration: {0}")]
    Configuration(String),

    /// An edge points at a node that is not part of the flow
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    /// A sub-flow call references an unknown container
    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    /// A flow was started without a start node
    #[error("Flow '{0}' has no start node")]
    MissingStartNode(String),

    /// The cursor exceeded the configured step budget
    #[error("Maximum execution steps exceeded: {0}")]
    MaxStepsExceeded(usize),

    /// Sub-flow calls nested deeper than configured
    #[error("Maximum sub-flow call depth exceeded: {0}")]
    MaxCallDepthExceeded(usize),

    /// A data source transitively pulls itself
    #[error("Data cycle detected at node '{0}'")]
    DataCycle(NodeId),

    /// A forked task failed
    #[error("Task forked at '{fork}' failed: {source}")]
    Fork {
        fork: NodeId,
        source: Box<FlowError>,
    },

    /// A forked task panicked or was cancelled
    #[error("Task forked at '{fork}' aborted: {message}")]
    ForkAborted { fork: NodeId, message: String },

    /// A forked task did not finish within the join timeout
    #[error("Task forked at '{fork}' did not finish within {timeout:?}")]
    ForkTimeout { fork: NodeId, timeout: Duration },

    /// An error attributed to the node where it surfaced
    #[error("Node '{node}' failed: {source}")]
    AtNode {
        node: NodeId,
        source: Box<FlowError>,
    },

    /// A sub-flow invoked by a `Call` node failed
    #[error("Sub-flow '{flow}' called from '{node}' failed: {source}")]
    SubFlow {
        node: NodeId,
        flow: FlowId,
        source: Box<FlowError>,
    },
}

impl FlowError {
    /// Create an evaluation error
    pub fn evaluation(message: impl Into<String>) -> Self {
        Self::Evaluation(message.into())
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Create a type mismatch error
    pub fn type_mismatch(expected: impl Into<String>, found: &serde_json::Value) -> Self {
        Self::TypeMismatch {
            expected: expected.into(),
            found: found.clone(),
        }
    }

    /// Attribute this error to `node` unless it is already attributed.
    pub fn attributed_to(self, node: &NodeId) -> Self {
        match self {
            attributed @ (Self::AtNode { .. } | Self::SubFlow { .. }) => attributed,
            other => Self::AtNode {
                node: node.clone(),
                source: Box::new(other),
            },
        }
    }

    /// The node this error is attributed to at the outermost level.
    pub fn node(&self) -> Option<&NodeId> {
        match self {
            Self::AtNode { node, .. } | Self::SubFlow { node, .. } => Some(node),
            _ => None,
        }
    }

    /// The node that originally failed, following sub-flow and fork chains inward.
    pub fn origin(&self) -> Option<&NodeId> {
        match self {
            Self::AtNode { node, source } | Self::SubFlow { node, source, .. } => {
                source.origin().or(Some(node))
            }
            Self::Fork { source, .. } => source.origin(),
            _ => None,
        }
    }

    /// The innermost error with all attribution layers removed.
    pub fn root_cause(&self) -> &FlowError {
        match self {
            Self::AtNode { source, .. } | Self::SubFlow { source, .. } | Self::Fork { source, .. } => {
                source.root_cause()
            }
            other => other,
        }
    }

    /// Whether the root cause is a malformed graph rather than a runtime failure
    pub fn is_configuration(&self) -> bool {
        matches!(
            self.root_cause(),
            Self::Configuration(_)
                | Self::NodeNotFound(_)
                | Self::FlowNotFound(_)
                | Self::MissingStartNode(_)
                | Self::MaxStepsExceeded(_)
                | Self::MaxCallDepthExceeded(_)
                | Self::DataCycle(_)
        )
    }

    /// Whether the root cause came from fork/join concurrency
    pub fn is_concurrency(&self) -> bool {
        matches!(
            self,
            Self::ForkAborted { .. } | Self::ForkTimeout { .. } | Self::Fork { .. }
        ) || matches!(self, Self::AtNode { source, .. } if source.is_concurrency())
    }
}

// ============================================================================
// INTEGRATION TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_attribution_wraps_once() {
        let error = FlowError::evaluation("boom")
            .attributed_to(&NodeId::new("inner"))
            .attributed_to(&NodeId::new("outer"));

        assert_eq!(error.node(), Some(&NodeId::new("inner")));
        assert_eq!(error.origin(), Some(&NodeId::new("inner")));
        assert!(matches!(error.root_cause(), FlowError::Evaluation(_)));
    }

    #[test]
    fn test_origin_follows_sub_flow_chain() {
        let inner = FlowError::evaluation("boom").attributed_to(&NodeId::new("callee-node"));
        let error = FlowError::SubFlow {
            node: NodeId::new("call"),
            flow: FlowId::new("callee"),
            source: Box::new(inner),
        }
        .attributed_to(&NodeId::new("ignored"));

        assert_eq!(error.node(), Some(&NodeId::new("call")));
        assert_eq!(error.origin(), Some(&NodeId::new("callee-node")));
    }

    #[test]
    fn test_error_classification() {
        let config = FlowError::MissingStartNode("main".to_string()).attributed_to(&NodeId::new("c"));
        assert!(config.is_configuration());

        let mismatch = FlowError::type_mismatch("boolean", &json!(3));
        assert!(!mismatch.is_configuration());
        assert_eq!(
            mismatch.to_string(),
            "Type mismatch: expected boolean, found 3"
        );

        let timeout = FlowError::ForkTimeout {
            fork: NodeId::new("fork"),
            timeout: Duration::from_millis(5),
        }
        .attributed_to(&NodeId::new("join"));
        assert!(timeout.is_concurrency());
    }

    #[test]
    fn test_script_error_conversion() {
        let error: FlowError = ScriptError::Runtime("division by zero".to_string()).into();
        assert!(matches!(error, FlowError::Script(_)));
    }
}
