//! # Object Access
//!
//! `GetProperty`, `ParameterDataSource` path resolution and `TypeQuery` reach domain
//! objects only through the [`ObjectAccess`] capability: a lookup from (type, property
//! name) to a [`PropertyAccessor`], and a query entry point keyed by type name.
//!
//! [`JsonObjectAccess`] is the bundled in-memory implementation. It treats JSON objects
//! as domain objects, typed by their `"type"` field.
//!
//! ## Query trees
//!
//! `TypeQuery` nodes carry a JSON operation tree that [`ObjectQuery::from_tree`] turns
//! into a typed query:
//!
//! ```json
//! [
//!   {"type": "group", "op": "or", "operations": [
//!     {"type": "operation", "key": "name", "op": "startsWith", "value": "A"},
//!     {"type": "operation", "key": "age", "op": "gte", "value": 30}
//!   ]},
//!   {"type": "sort", "key": "age", "order": "desc"}
//! ]
//! ```

use crate::condition::{compare_values, loose_eq};
use crate::{FlowError, FlowGraphResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// Reads one named property of an object
#[derive(Clone)]
pub struct PropertyAccessor {
    name: String,
    reader: Arc<dyn Fn(&Value) -> Value + Send + Sync>,
}

impl PropertyAccessor {
    pub fn new<F>(name: impl Into<String>, reader: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            reader: Arc::new(reader),
        }
    }

    /// Accessor reading a JSON object field of the same name
    pub fn field(name: impl Into<String>) -> Self {
        let name = name.into();
        let key = name.clone();
        Self::new(name, move |object| {
            object.get(&key).cloned().unwrap_or(Value::Null)
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn read(&self, object: &Value) -> Value {
        (self.reader)(object)
    }
}

impl fmt::Debug for PropertyAccessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyAccessor")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Capability interface to the host's object model
#[async_trait]
pub trait ObjectAccess: Send + Sync {
    /// The type name of `object`, if it is a typed domain object
    fn type_of(&self, object: &Value) -> Option<String>;

    /// Resolve a property of `type_name` by name
    fn resolve_property(&self, type_name: &str, name: &str) -> Option<PropertyAccessor>;

    fn has_type(&self, type_name: &str) -> bool;

    /// Run a query and return its result set
    async fn query(&self, query: &ObjectQuery) -> FlowGraphResult<Vec<Value>>;

    /// Read `name` from `object`.
    ///
    /// Typed objects resolve through [`ObjectAccess::resolve_property`]; untyped maps
    /// fall back to their keys. `None` means the name could not be resolved.
    fn property(&self, object: &Value, name: &str) -> Option<Value> {
        if let Some(type_name) = self.type_of(object) {
            return self
                .resolve_property(&type_name, name)
                .map(|accessor| accessor.read(object));
        }
        match object {
            Value::Object(map) => map.get(name).cloned(),
            _ => None,
        }
    }
}

// ============================================================================
// QUERIES
// ============================================================================

/// Comparison operators of a query `operation`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryOperator {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    Contains,
    StartsWith,
}

impl QueryOperator {
    pub fn matches(&self, actual: &Value, expected: &Value) -> bool {
        match self {
            QueryOperator::Eq => loose_eq(actual, expected),
            QueryOperator::Neq => !loose_eq(actual, expected),
            QueryOperator::Lt => compare_values(actual, expected) == Some(Ordering::Less),
            QueryOperator::Lte => matches!(
                compare_values(actual, expected),
                Some(Ordering::Less | Ordering::Equal)
            ),
            QueryOperator::Gt => compare_values(actual, expected) == Some(Ordering::Greater),
            QueryOperator::Gte => matches!(
                compare_values(actual, expected),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            QueryOperator::Contains => match (actual, expected) {
                (Value::String(s), Value::String(part)) => s.contains(part.as_str()),
                (Value::Array(items), item) => items.iter().any(|v| loose_eq(v, item)),
                _ => false,
            },
            QueryOperator::StartsWith => match (actual, expected) {
                (Value::String(s), Value::String(prefix)) => s.starts_with(prefix.as_str()),
                _ => false,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    pub key: String,
    pub order: SortOrder,
}

/// Predicate tree of a query
#[derive(Debug, Clone, PartialEq)]
pub enum QueryPredicate {
    And(Vec<QueryPredicate>),
    Or(Vec<QueryPredicate>),
    /// Negated conjunction of its members
    Not(Vec<QueryPredicate>),
    Compare {
        key: String,
        operator: QueryOperator,
        value: Value,
    },
}

impl QueryPredicate {
    /// Evaluate against an object whose properties are read through `read`
    pub fn matches<F>(&self, read: &F) -> bool
    where
        F: Fn(&str) -> Value,
    {
        match self {
            QueryPredicate::And(members) => members.iter().all(|p| p.matches(read)),
            QueryPredicate::Or(members) => members.iter().any(|p| p.matches(read)),
            QueryPredicate::Not(members) => !members.iter().all(|p| p.matches(read)),
            QueryPredicate::Compare {
                key,
                operator,
                value,
            } => operator.matches(&read(key), value),
        }
    }
}

/// A typed query against the object store
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectQuery {
    pub type_name: String,
    pub predicate: Option<QueryPredicate>,
    pub sort: Vec<SortKey>,
}

impl ObjectQuery {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            predicate: None,
            sort: Vec::new(),
        }
    }

    /// Build a query from a JSON operation tree.
    ///
    /// The target type and every property key are resolved through `objects`. An unknown
    /// type is a configuration error; an unknown key or malformed tree node is an
    /// evaluation error.
    pub fn from_tree(type_name: &str, tree: &Value, objects: &dyn ObjectAccess) -> FlowGraphResult<Self> {
        if !objects.has_type(type_name) {
            return Err(FlowError::configuration(format!(
                "Unknown type '{}' in type query",
                type_name
            )));
        }

        let mut parser = TreeParser {
            type_name,
            objects,
            sort: Vec::new(),
        };
        let predicate = match tree {
            Value::Null => None,
            Value::Array(members) => {
                let mut predicates = parser.parse_all(members)?;
                match predicates.len() {
                    0 => None,
                    1 => predicates.pop(),
                    _ => Some(QueryPredicate::And(predicates)),
                }
            }
            single => parser.parse(single)?,
        };

        Ok(Self {
            type_name: type_name.to_string(),
            predicate,
            sort: parser.sort,
        })
    }

    /// Filter and sort `objects`, reading properties through `read`
    pub fn apply<F>(&self, objects: Vec<Value>, read: F) -> Vec<Value>
    where
        F: Fn(&Value, &str) -> Value,
    {
        let mut selected: Vec<Value> = objects
            .into_iter()
            .filter(|object| {
                self.predicate
                    .as_ref()
                    .is_none_or(|predicate| predicate.matches(&|key: &str| read(object, key)))
            })
            .collect();

        if !self.sort.is_empty() {
            selected.sort_by(|a, b| {
                for SortKey { key, order } in &self.sort {
                    let ordering = compare_values(&read(a, key), &read(b, key)).unwrap_or(Ordering::Equal);
                    let ordering = match order {
                        SortOrder::Asc => ordering,
                        SortOrder::Desc => ordering.reverse(),
                    };
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                Ordering::Equal
            });
        }

        selected
    }
}

struct TreeParser<'a> {
    type_name: &'a str,
    objects: &'a dyn ObjectAccess,
    sort: Vec<SortKey>,
}

impl TreeParser<'_> {
    fn parse_all(&mut self, members: &[Value]) -> FlowGraphResult<Vec<QueryPredicate>> {
        let mut predicates = Vec::with_capacity(members.len());
        for member in members {
            if let Some(predicate) = self.parse(member)? {
                predicates.push(predicate);
            }
        }
        Ok(predicates)
    }

    fn parse(&mut self, node: &Value) -> FlowGraphResult<Option<QueryPredicate>> {
        let kind = node.get("type").and_then(Value::as_str).unwrap_or("operation");
        match kind {
            "group" => {
                let members = match node.get("operations") {
                    Some(Value::Array(members)) => self.parse_all(members)?,
                    None | Some(Value::Null) => Vec::new(),
                    Some(other) => {
                        return Err(FlowError::type_mismatch("array of query operations", other));
                    }
                };
                let group = match node.get("op").and_then(Value::as_str).unwrap_or("and") {
                    "and" => QueryPredicate::And(members),
                    "or" => QueryPredicate::Or(members),
                    "not" => QueryPredicate::Not(members),
                    other => {
                        return Err(FlowError::evaluation(format!(
                            "Unknown query group operator '{}'",
                            other
                        )));
                    }
                };
                Ok(Some(group))
            }
            "operation" => {
                let key = self.key(node)?;
                let op = node.get("op").cloned().unwrap_or(Value::String("eq".into()));
                let operator: QueryOperator = serde_json::from_value(op.clone()).map_err(|_| {
                    FlowError::evaluation(format!("Unknown query operator {}", op))
                })?;
                Ok(Some(QueryPredicate::Compare {
                    key,
                    operator,
                    value: node.get("value").cloned().unwrap_or(Value::Null),
                }))
            }
            "sort" => {
                let key = self.key(node)?;
                let order = match node.get("order") {
                    None | Some(Value::Null) => SortOrder::Asc,
                    Some(order) => serde_json::from_value(order.clone()).map_err(|_| {
                        FlowError::evaluation(format!("Unknown sort order {}", order))
                    })?,
                };
                self.sort.push(SortKey { key, order });
                Ok(None)
            }
            other => Err(FlowError::evaluation(format!(
                "Unknown query element '{}'",
                other
            ))),
        }
    }

    fn key(&self, node: &Value) -> FlowGraphResult<String> {
        let key = node
            .get("key")
            .and_then(Value::as_str)
            .ok_or_else(|| FlowError::evaluation("Query element without a key"))?;
        self.objects
            .resolve_property(self.type_name, key)
            .map(|accessor| accessor.name().to_string())
            .ok_or_else(|| {
                FlowError::evaluation(format!(
                    "Type '{}' has no property '{}'",
                    self.type_name, key
                ))
            })
    }
}

// ============================================================================
// IN-MEMORY IMPLEMENTATION
// ============================================================================

#[derive(Debug, Default)]
struct TypeEntry {
    properties: BTreeSet<String>,
    objects: Vec<Value>,
}

/// In-memory object store over JSON objects typed by their `"type"` field
#[derive(Debug, Default)]
pub struct JsonObjectAccess {
    types: RwLock<HashMap<String, TypeEntry>>,
}

impl JsonObjectAccess {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a type and its properties
    pub fn define_type(&self, type_name: impl Into<String>, properties: &[&str]) {
        let mut types = self.types.write().unwrap_or_else(PoisonError::into_inner);
        let entry = types.entry(type_name.into()).or_default();
        entry
            .properties
            .extend(properties.iter().map(|p| p.to_string()));
    }

    /// Add an object of `type_name`; its fields extend the type's properties.
    pub fn insert(&self, type_name: impl Into<String>, object: Value) {
        let type_name = type_name.into();
        let object = match object {
            Value::Object(mut map) => {
                map.entry("type")
                    .or_insert_with(|| Value::String(type_name.clone()));
                Value::Object(map)
            }
            other => other,
        };

        let mut types = self.types.write().unwrap_or_else(PoisonError::into_inner);
        let entry = types.entry(type_name).or_default();
        if let Value::Object(map) = &object {
            entry.properties.extend(map.keys().cloned());
        }
        entry.objects.push(object);
    }

    /// All objects of `type_name`, in insertion order
    pub fn objects(&self, type_name: &str) -> Vec<Value> {
        self.types
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(type_name)
            .map(|entry| entry.objects.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ObjectAccess for JsonObjectAccess {
    fn type_of(&self, object: &Value) -> Option<String> {
        object
            .get("type")
            .and_then(Value::as_str)
            .filter(|name| self.has_type(name))
            .map(str::to_string)
    }

    fn resolve_property(&self, type_name: &str, name: &str) -> Option<PropertyAccessor> {
        let types = self.types.read().unwrap_or_else(PoisonError::into_inner);
        types
            .get(type_name)
            .filter(|entry| entry.properties.contains(name))
            .map(|_| PropertyAccessor::field(name))
    }

    fn has_type(&self, type_name: &str) -> bool {
        self.types
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(type_name)
    }

    async fn query(&self, query: &ObjectQuery) -> FlowGraphResult<Vec<Value>> {
        if !self.has_type(&query.type_name) {
            return Err(FlowError::configuration(format!(
                "Unknown type '{}'",
                query.type_name
            )));
        }
        let objects = self.objects(&query.type_name);
        Ok(query.apply(objects, |object, key| {
            object.get(key).cloned().unwrap_or(Value::Null)
        }))
    }
}
