//! # Flow Graph Model
//!
//! Every element of a flow is a [`FlowNode`]: a stable identity, the container it belongs
//! to, a [`NodeKind`] and up to two outgoing control edges (`next` and an exception
//! handler). Kind-specific edges (branch targets, loop bodies, data sources) live inside
//! the kind itself.
//!
//! ## Control and data nodes
//!
//! Control nodes are visited by the engine's cursor:
//! `Action`, `Decision`, `ForEach`, `Switch`, `SwitchCase`, `Return`, `ExceptionHandler`,
//! `Call`, `Fork`, `ForkJoin`, `Store`, `Log` and `Aggregate`.
//!
//! Every node, control or not, is also a data source: consumers pull its value through a
//! data edge. Pure data nodes (`Constant`, `Comparison`, `Filter`, ...) are never visited.
//!
//! ## Serialization
//!
//! Nodes serialize with a `flowType` tag and camelCase fields:
//!
//! ```rust
//! use flowgraph_rs::node::{FlowNode, NodeKind};
//!
//! let node: FlowNode = serde_json::from_value(serde_json::json!({
//!     "id": "greeting",
//!     "flowType": "constant",
//!     "value": "hello"
//! })).unwrap();
//!
//! assert!(matches!(node.kind, NodeKind::Constant { .. }));
//! ```

use crate::condition::{ComparisonOperator, LogicOperator};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a fresh UUID-based identifier
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().simple().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id!(
    /// Stable identity of a node within a flow
    NodeId
);

string_id!(
    /// Stable identity of a flow container
    FlowId
);

/// Literal type tag of a `Constant` node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConstantType {
    String,
    Boolean,
    Integer,
    Double,
    Date,
}

/// Operation performed by a `Store` node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StoreOperation {
    /// Write the upstream value under the key
    #[default]
    Store,
    /// Read the value stored under the key
    Retrieve,
}

/// The closed set of node variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "flowType", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum NodeKind {
    // ------------------------------------------------------------------
    // Control nodes
    // ------------------------------------------------------------------
    Action {
        script: Option<String>,
        data_source: Option<NodeId>,
    },
    Decision {
        condition: Option<NodeId>,
        true_element: Option<NodeId>,
        false_element: Option<NodeId>,
    },
    ForEach {
        data_source: Option<NodeId>,
        loop_body: Option<NodeId>,
    },
    Switch {
        data_source: Option<NodeId>,
        #[serde(default)]
        cases: Vec<NodeId>,
        switch_default: Option<NodeId>,
    },
    SwitchCase {
        case: Value,
    },
    Return {
        script: Option<String>,
        data_source: Option<NodeId>,
    },
    ExceptionHandler,
    Call {
        callee: FlowId,
        #[serde(default)]
        inputs: Vec<NodeId>,
    },
    Fork {
        data_source: Option<NodeId>,
        fork_body: Option<NodeId>,
    },
    ForkJoin,
    Store {
        #[serde(default)]
        operation: StoreOperation,
        key: String,
        data_source: Option<NodeId>,
    },
    Log {
        script: Option<String>,
        data_source: Option<NodeId>,
    },
    Aggregate {
        script: Option<String>,
        data_source: Option<NodeId>,
        start_value: Option<NodeId>,
    },

    // ------------------------------------------------------------------
    // Data nodes
    // ------------------------------------------------------------------
    Constant {
        value: Value,
        constant_type: Option<ConstantType>,
    },
    ObjectDataSource {
        #[serde(default)]
        entries: Vec<NodeId>,
    },
    CollectionDataSource {
        #[serde(default)]
        elements: Vec<NodeId>,
    },
    KeyValue {
        key: String,
        data_source: Option<NodeId>,
    },
    ParameterDataSource {
        key: String,
    },
    ParameterInput {
        key: String,
        data_source: Option<NodeId>,
    },
    GetProperty {
        data_source: Option<NodeId>,
        property_name: Option<String>,
        property_name_source: Option<NodeId>,
    },
    Filter {
        data_source: Option<NodeId>,
        condition: Option<NodeId>,
    },
    First {
        data_source: Option<NodeId>,
    },
    Comparison {
        operator: ComparisonOperator,
        data_source: Option<NodeId>,
        value_source: Option<NodeId>,
    },
    IsTrue {
        #[serde(default)]
        inputs: Vec<NodeId>,
    },
    NotNull {
        #[serde(default)]
        inputs: Vec<NodeId>,
    },
    NotEmpty {
        #[serde(default)]
        inputs: Vec<NodeId>,
    },
    Logic {
        operator: LogicOperator,
        #[serde(default)]
        inputs: Vec<NodeId>,
    },
    ScriptCondition {
        script: Option<String>,
        script_source: Option<NodeId>,
        data_source: Option<NodeId>,
    },
    TypeQuery {
        data_type: String,
        #[serde(default)]
        query: Value,
    },
}

fn id(value: Option<&str>) -> Option<NodeId> {
    value.map(NodeId::from)
}

fn ids(values: &[&str]) -> Vec<NodeId> {
    values.iter().map(|v| NodeId::from(*v)).collect()
}

impl NodeKind {
    /// A literal value
    pub fn constant(value: Value) -> Self {
        NodeKind::Constant {
            value,
            constant_type: None,
        }
    }

    /// A string literal coerced to `constant_type` on evaluation
    pub fn typed_constant(value: impl Into<String>, constant_type: ConstantType) -> Self {
        NodeKind::Constant {
            value: Value::String(value.into()),
            constant_type: Some(constant_type),
        }
    }

    pub fn action(script: impl Into<String>, data_source: Option<&str>) -> Self {
        NodeKind::Action {
            script: Some(script.into()),
            data_source: id(data_source),
        }
    }

    pub fn decision(condition: &str, true_element: Option<&str>, false_element: Option<&str>) -> Self {
        NodeKind::Decision {
            condition: Some(condition.into()),
            true_element: id(true_element),
            false_element: id(false_element),
        }
    }

    pub fn for_each(data_source: &str, loop_body: Option<&str>) -> Self {
        NodeKind::ForEach {
            data_source: Some(data_source.into()),
            loop_body: id(loop_body),
        }
    }

    pub fn switch(data_source: &str, cases: &[&str], switch_default: Option<&str>) -> Self {
        NodeKind::Switch {
            data_source: Some(data_source.into()),
            cases: ids(cases),
            switch_default: id(switch_default),
        }
    }

    pub fn switch_case(case: Value) -> Self {
        NodeKind::SwitchCase { case }
    }

    /// A `Return`; without a script it returns its data source verbatim
    pub fn returning(script: Option<&str>, data_source: Option<&str>) -> Self {
        NodeKind::Return {
            script: script.map(str::to_string),
            data_source: id(data_source),
        }
    }

    pub fn call(callee: impl Into<FlowId>, inputs: &[&str]) -> Self {
        NodeKind::Call {
            callee: callee.into(),
            inputs: ids(inputs),
        }
    }

    pub fn fork(data_source: Option<&str>, fork_body: Option<&str>) -> Self {
        NodeKind::Fork {
            data_source: id(data_source),
            fork_body: id(fork_body),
        }
    }

    pub fn store(key: impl Into<String>, data_source: &str) -> Self {
        NodeKind::Store {
            operation: StoreOperation::Store,
            key: key.into(),
            data_source: Some(data_source.into()),
        }
    }

    pub fn retrieve(key: impl Into<String>) -> Self {
        NodeKind::Store {
            operation: StoreOperation::Retrieve,
            key: key.into(),
            data_source: None,
        }
    }

    pub fn aggregate(script: impl Into<String>, data_source: &str, start_value: Option<&str>) -> Self {
        NodeKind::Aggregate {
            script: Some(script.into()),
            data_source: Some(data_source.into()),
            start_value: id(start_value),
        }
    }

    pub fn parameter(key: impl Into<String>) -> Self {
        NodeKind::ParameterDataSource { key: key.into() }
    }

    pub fn parameter_input(key: impl Into<String>, data_source: Option<&str>) -> Self {
        NodeKind::ParameterInput {
            key: key.into(),
            data_source: id(data_source),
        }
    }

    pub fn key_value(key: impl Into<String>, data_source: Option<&str>) -> Self {
        NodeKind::KeyValue {
            key: key.into(),
            data_source: id(data_source),
        }
    }

    pub fn get_property(data_source: &str, property_name: impl Into<String>) -> Self {
        NodeKind::GetProperty {
            data_source: Some(data_source.into()),
            property_name: Some(property_name.into()),
            property_name_source: None,
        }
    }

    pub fn comparison(operator: ComparisonOperator, left: &str, right: &str) -> Self {
        NodeKind::Comparison {
            operator,
            data_source: Some(left.into()),
            value_source: Some(right.into()),
        }
    }

    pub fn logic(operator: LogicOperator, inputs: &[&str]) -> Self {
        NodeKind::Logic {
            operator,
            inputs: ids(inputs),
        }
    }

    pub fn script_condition(script: impl Into<String>, data_source: Option<&str>) -> Self {
        NodeKind::ScriptCondition {
            script: Some(script.into()),
            script_source: None,
            data_source: id(data_source),
        }
    }

    /// The `flowType` tag of this kind
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Action { .. } => "action",
            NodeKind::Decision { .. } => "decision",
            NodeKind::ForEach { .. } => "forEach",
            NodeKind::Switch { .. } => "switch",
            NodeKind::SwitchCase { .. } => "switchCase",
            NodeKind::Return { .. } => "return",
            NodeKind::ExceptionHandler => "exceptionHandler",
            NodeKind::Call { .. } => "call",
            NodeKind::Fork { .. } => "fork",
            NodeKind::ForkJoin => "forkJoin",
            NodeKind::Store { .. } => "store",
            NodeKind::Log { .. } => "log",
            NodeKind::Aggregate { .. } => "aggregate",
            NodeKind::Constant { .. } => "constant",
            NodeKind::ObjectDataSource { .. } => "objectDataSource",
            NodeKind::CollectionDataSource { .. } => "collectionDataSource",
            NodeKind::KeyValue { .. } => "keyValue",
            NodeKind::ParameterDataSource { .. } => "parameterDataSource",
            NodeKind::ParameterInput { .. } => "parameterInput",
            NodeKind::GetProperty { .. } => "getProperty",
            NodeKind::Filter { .. } => "filter",
            NodeKind::First { .. } => "first",
            NodeKind::Comparison { .. } => "comparison",
            NodeKind::IsTrue { .. } => "isTrue",
            NodeKind::NotNull { .. } => "notNull",
            NodeKind::NotEmpty { .. } => "notEmpty",
            NodeKind::Logic { .. } => "logic",
            NodeKind::ScriptCondition { .. } => "scriptCondition",
            NodeKind::TypeQuery { .. } => "typeQuery",
        }
    }

    /// Whether the engine's cursor may visit this kind
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            NodeKind::Action { .. }
                | NodeKind::Decision { .. }
                | NodeKind::ForEach { .. }
                | NodeKind::Switch { .. }
                | NodeKind::SwitchCase { .. }
                | NodeKind::Return { .. }
                | NodeKind::ExceptionHandler
                | NodeKind::Call { .. }
                | NodeKind::Fork { .. }
                | NodeKind::ForkJoin
                | NodeKind::Store { .. }
                | NodeKind::Log { .. }
                | NodeKind::Aggregate { .. }
        )
    }

    /// Kind-specific control edges, excluding `next` and the exception handler.
    pub fn control_edges(&self) -> Vec<&NodeId> {
        match self {
            NodeKind::Decision {
                true_element,
                false_element,
                ..
            } => true_element.iter().chain(false_element.iter()).collect(),
            NodeKind::ForEach { loop_body, .. } => loop_body.iter().collect(),
            NodeKind::Switch {
                cases,
                switch_default,
                ..
            } => cases.iter().chain(switch_default.iter()).collect(),
            NodeKind::Fork { fork_body, .. } => fork_body.iter().collect(),
            _ => Vec::new(),
        }
    }

    /// Data edges: the nodes this kind pulls values from.
    pub fn data_edges(&self) -> Vec<&NodeId> {
        match self {
            NodeKind::Action { data_source, .. }
            | NodeKind::Return { data_source, .. }
            | NodeKind::Log { data_source, .. }
            | NodeKind::Store { data_source, .. }
            | NodeKind::Fork { data_source, .. }
            | NodeKind::KeyValue { data_source, .. }
            | NodeKind::ParameterInput { data_source, .. }
            | NodeKind::First { data_source }
            | NodeKind::ForEach { data_source, .. }
            | NodeKind::Switch { data_source, .. } => data_source.iter().collect(),
            NodeKind::Decision { condition, .. } => condition.iter().collect(),
            NodeKind::Aggregate {
                data_source,
                start_value,
                ..
            } => data_source.iter().chain(start_value.iter()).collect(),
            NodeKind::Call { inputs, .. }
            | NodeKind::IsTrue { inputs }
            | NodeKind::NotNull { inputs }
            | NodeKind::NotEmpty { inputs }
            | NodeKind::Logic { inputs, .. } => inputs.iter().collect(),
            NodeKind::ObjectDataSource { entries } => entries.iter().collect(),
            NodeKind::CollectionDataSource { elements } => elements.iter().collect(),
            NodeKind::GetProperty {
                data_source,
                property_name_source,
                ..
            } => data_source.iter().chain(property_name_source.iter()).collect(),
            NodeKind::Filter {
                data_source,
                condition,
            } => data_source.iter().chain(condition.iter()).collect(),
            NodeKind::Comparison {
                data_source,
                value_source,
                ..
            } => data_source.iter().chain(value_source.iter()).collect(),
            NodeKind::ScriptCondition {
                script_source,
                data_source,
                ..
            } => script_source.iter().chain(data_source.iter()).collect(),
            NodeKind::SwitchCase { .. }
            | NodeKind::ExceptionHandler
            | NodeKind::ForkJoin
            | NodeKind::Constant { .. }
            | NodeKind::ParameterDataSource { .. }
            | NodeKind::TypeQuery { .. } => Vec::new(),
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A single element of a flow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowNode {
    pub id: NodeId,
    /// Owning container, assigned when the node is added to a flow
    #[serde(default)]
    pub flow: FlowId,
    pub label: Option<String>,
    #[serde(flatten)]
    pub kind: NodeKind,
    pub next: Option<NodeId>,
    pub exception_handler: Option<NodeId>,
}

impl FlowNode {
    /// Create a node with the given identity and kind
    pub fn new(id: impl Into<NodeId>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            flow: FlowId::default(),
            label: None,
            kind,
            next: None,
            exception_handler: None,
        }
    }

    /// Create a node with a generated identity
    pub fn anonymous(kind: NodeKind) -> Self {
        Self::new(NodeId::generate(), kind)
    }

    /// Set the `next` control edge
    pub fn next(mut self, next: impl Into<NodeId>) -> Self {
        self.next = Some(next.into());
        self
    }

    /// Route failures of this node to an `ExceptionHandler` node
    pub fn handled_by(mut self, handler: impl Into<NodeId>) -> Self {
        self.exception_handler = Some(handler.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Human readable name used in logs and script context labels
    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or(self.id.as_str())
    }
}
