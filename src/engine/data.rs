//! The data-source protocol.
//!
//! Every node is a data source. [`pull`] returns a node's value in a scope: memoized
//! kinds are computed at most once per context and then served from the data cache;
//! stateful kinds (`Aggregate`, `Store`, `ForEach`, `ExceptionHandler`, `ForkJoin`) read
//! their current state instead.

use super::{call, Scope};
use crate::condition::{is_empty, is_true};
use crate::node::{ConstantType, FlowNode, NodeId, NodeKind};
use crate::object::ObjectQuery;
use crate::script::Bindings;
use crate::{FlowError, FlowGraphResult};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use futures::future::BoxFuture;
use serde_json::{Map, Number, Value};
use tracing::{debug, warn};

/// Pull the value of node `id`, attributing failures to it
pub(crate) fn pull<'a>(scope: &'a Scope, id: &'a NodeId) -> BoxFuture<'a, FlowGraphResult<Value>> {
    Box::pin(async move {
        let node = scope.flow.node(id)?;
        let result = if is_memoized(&node.kind) {
            memoized(scope, node).await
        } else if scope.chain.contains(id) {
            Err(FlowError::DataCycle(id.clone()))
        } else {
            evaluate(&scope.pulling(id), node).await
        };
        result.map_err(|error| error.attributed_to(id))
    })
}

/// Pull an optional data edge; an absent edge yields `null`
pub(crate) async fn pull_optional(scope: &Scope, id: Option<&NodeId>) -> FlowGraphResult<Value> {
    match id {
        Some(id) => pull(scope, id).await,
        None => Ok(Value::Null),
    }
}

fn is_memoized(kind: &NodeKind) -> bool {
    !matches!(
        kind,
        NodeKind::Aggregate { .. }
            | NodeKind::Store { .. }
            | NodeKind::ForEach { .. }
            | NodeKind::ExceptionHandler
            | NodeKind::ForkJoin
    )
}

async fn memoized(scope: &Scope, node: &FlowNode) -> FlowGraphResult<Value> {
    if let Some(value) = scope.ctx.data(&node.id) {
        debug!(node = %node.id, context = %scope.ctx.id(), "cache hit");
        return Ok(value);
    }
    if scope.chain.contains(&node.id) {
        return Err(FlowError::DataCycle(node.id.clone()));
    }

    let inner = scope.pulling(&node.id);
    scope
        .ctx
        .cache()
        .get_or_try_insert_with(&node.id, || evaluate(&inner, node))
        .await
}

/// Compute the value of `node` without consulting the cache
pub(crate) fn evaluate<'a>(scope: &'a Scope, node: &'a FlowNode) -> BoxFuture<'a, FlowGraphResult<Value>> {
    Box::pin(async move {
        match &node.kind {
            NodeKind::Action {
                script,
                data_source,
            }
            | NodeKind::Return {
                script,
                data_source,
            }
            | NodeKind::Log {
                script,
                data_source,
            } => {
                let data = pull_optional(scope, data_source.as_ref()).await?;
                match script.as_deref().filter(|s| !s.trim().is_empty()) {
                    Some(script) => run_script(scope, node, script, data, Vec::new()).await,
                    None => Ok(data),
                }
            }
            NodeKind::Decision { condition, .. } => {
                let condition = pull_optional(scope, condition.as_ref()).await?;
                Ok(Value::Bool(is_true(&condition)))
            }
            NodeKind::Switch { data_source, .. }
            | NodeKind::Fork { data_source, .. }
            | NodeKind::First { data_source } => {
                let value = pull_optional(scope, data_source.as_ref()).await?;
                match (&node.kind, value) {
                    (NodeKind::First { .. }, Value::Array(items)) => {
                        Ok(items.into_iter().next().unwrap_or(Value::Null))
                    }
                    (_, value) => Ok(value),
                }
            }
            NodeKind::SwitchCase { case } => Ok(case.clone()),
            NodeKind::Call { .. } => call::invoke(scope, node).await,
            NodeKind::Store { key, .. } => Ok(scope.ctx.store_get(key).unwrap_or(Value::Null)),
            NodeKind::ForEach { .. } | NodeKind::ExceptionHandler | NodeKind::ForkJoin => {
                Ok(scope.ctx.data(&node.id).unwrap_or(Value::Null))
            }
            NodeKind::Aggregate { start_value, .. } => match scope.ctx.aggregation(&node.id) {
                Some(current) => Ok(current),
                None => pull_optional(scope, start_value.as_ref()).await,
            },
            NodeKind::Constant {
                value,
                constant_type,
            } => match constant_type {
                Some(constant_type) => coerce_constant(value, *constant_type),
                None => Ok(value.clone()),
            },
            NodeKind::ObjectDataSource { entries } => {
                let mut object = Map::new();
                for entry in entries {
                    let key = match &scope.flow.node(entry)?.kind {
                        NodeKind::KeyValue { key, .. } => key.clone(),
                        other => {
                            return Err(FlowError::configuration(format!(
                                "Object entry '{}' is a {}, expected keyValue",
                                entry, other
                            )));
                        }
                    };
                    object.insert(key, pull(scope, entry).await?);
                }
                Ok(Value::Object(object))
            }
            NodeKind::CollectionDataSource { elements } => {
                let mut values = Vec::with_capacity(elements.len());
                for element in elements {
                    values.push(pull(scope, element).await?);
                }
                Ok(Value::Array(values))
            }
            NodeKind::KeyValue { key, data_source }
            | NodeKind::ParameterInput { key, data_source } => match data_source {
                Some(source) => pull(scope, source).await,
                None => Ok(scope.ctx.parameter(key).unwrap_or(Value::Null)),
            },
            NodeKind::ParameterDataSource { key } => Ok(resolve_parameter_path(scope, key)),
            NodeKind::GetProperty {
                data_source,
                property_name,
                property_name_source,
            } => {
                let object = pull_optional(scope, data_source.as_ref()).await?;
                let name = match property_name_source {
                    Some(source) => match pull(scope, source).await? {
                        Value::String(name) => name,
                        other => return Err(FlowError::type_mismatch("property name", &other)),
                    },
                    None => property_name.clone().ok_or_else(|| {
                        FlowError::configuration(format!(
                            "Node '{}' has neither a property name nor a name source",
                            node.id
                        ))
                    })?,
                };
                Ok(read_property(scope, node, &object, &name))
            }
            NodeKind::Filter {
                data_source,
                condition,
            } => filter(scope, node, data_source.as_ref(), condition.as_ref()).await,
            NodeKind::Comparison {
                operator,
                data_source,
                value_source,
            } => {
                let left = pull_optional(scope, data_source.as_ref()).await?;
                let right = pull_optional(scope, value_source.as_ref()).await?;
                Ok(Value::Bool(operator.apply(&left, &right)))
            }
            NodeKind::IsTrue { inputs } => all_inputs(scope, inputs, is_true).await,
            NodeKind::NotNull { inputs } => all_inputs(scope, inputs, |v| !v.is_null()).await,
            NodeKind::NotEmpty { inputs } => all_inputs(scope, inputs, |v| !is_empty(v)).await,
            NodeKind::Logic { operator, inputs } => {
                let mut values = Vec::with_capacity(inputs.len());
                for input in inputs {
                    values.push(is_true(&pull(scope, input).await?));
                }
                Ok(Value::Bool(operator.combine(&values)))
            }
            NodeKind::ScriptCondition {
                script,
                script_source,
                data_source,
            } => {
                let script = match script_source {
                    Some(source) => match pull(scope, source).await? {
                        Value::String(script) => script,
                        other => return Err(FlowError::type_mismatch("script text", &other)),
                    },
                    None => script.clone().ok_or_else(|| {
                        FlowError::configuration(format!("Script condition '{}' has no script", node.id))
                    })?,
                };
                let data = pull_optional(scope, data_source.as_ref()).await?;
                let result = run_script(scope, node, &script, data, Vec::new()).await?;
                Ok(Value::Bool(is_true(&result)))
            }
            NodeKind::TypeQuery { data_type, query } => {
                let objects = scope.engine.objects();
                let query = ObjectQuery::from_tree(data_type, query, objects.as_ref())?;
                Ok(Value::Array(objects.query(&query).await?))
            }
        }
    })
}

/// Evaluate `script` with the node's bindings: parameters, `extra` values and `data`
async fn run_script(
    scope: &Scope,
    node: &FlowNode,
    script: &str,
    data: Value,
    extra: Vec<(String, Value)>,
) -> FlowGraphResult<Value> {
    let label = format!("{}/{}", scope.flow.name(), node.display_name());
    let bindings = Bindings::new(
        scope.ctx.principal().clone(),
        scope.ctx.this_object().clone(),
        label,
    )
    .bind_all(scope.ctx.parameters())
    .bind_all(extra)
    .bind("data", data);

    Ok(scope.engine.evaluator().evaluate(script, &bindings).await?)
}

/// Fold the upstream value into the running value of an `Aggregate` node
pub(crate) async fn advance_aggregate(scope: &Scope, node: &FlowNode) -> FlowGraphResult<Value> {
    let NodeKind::Aggregate {
        script,
        data_source,
        start_value,
    } = &node.kind
    else {
        return Err(FlowError::configuration(format!(
            "Node '{}' is not an aggregate",
            node.id
        )));
    };

    let _advancing = scope.ctx.lock_aggregation(&node.id).await;
    let current = match scope.ctx.aggregation(&node.id) {
        Some(current) => current,
        None => pull_optional(&scope.pulling(&node.id), start_value.as_ref()).await?,
    };
    let data = pull_optional(scope, data_source.as_ref()).await?;

    let next = match script.as_deref().filter(|s| !s.trim().is_empty()) {
        Some(script) => {
            let extra = vec![("currentValue".to_string(), current)];
            run_script(scope, node, script, data, extra).await?
        }
        None => match current {
            Value::Array(mut values) => {
                values.push(data);
                Value::Array(values)
            }
            Value::Null => Value::Array(vec![data]),
            other => Value::Array(vec![other, data]),
        },
    };

    scope.ctx.set_aggregation(&node.id, next.clone());
    scope.ctx.set_data(&node.id, next.clone());
    Ok(next)
}

async fn all_inputs(
    scope: &Scope,
    inputs: &[NodeId],
    predicate: fn(&Value) -> bool,
) -> FlowGraphResult<Value> {
    let mut all = !inputs.is_empty();
    for input in inputs {
        let value = pull(scope, input).await?;
        all &= predicate(&value);
    }
    Ok(Value::Bool(all))
}

async fn filter(
    scope: &Scope,
    node: &FlowNode,
    data_source: Option<&NodeId>,
    condition: Option<&NodeId>,
) -> FlowGraphResult<Value> {
    let elements = match pull_optional(scope, data_source).await? {
        Value::Array(elements) => elements,
        Value::Null => Vec::new(),
        single => vec![single],
    };
    let Some(condition) = condition else {
        return Ok(Value::Array(elements));
    };

    let mut kept = Vec::new();
    for element in elements {
        let element_scope = scope.iteration();
        element_scope.ctx.set_data(&node.id, element.clone());
        if is_true(&pull(&element_scope, condition).await?) {
            kept.push(element);
        }
    }
    Ok(Value::Array(kept))
}

/// Resolve a dotted parameter path: the first segment names a parameter, every further
/// segment a property, map key or array index of the previous value.
fn resolve_parameter_path(scope: &Scope, path: &str) -> Value {
    let mut segments = path.split('.');
    let first = segments.next().unwrap_or_default();
    let mut current = scope.ctx.parameter(first).unwrap_or(Value::Null);

    for segment in segments {
        if current.is_null() {
            break;
        }
        current = match &current {
            Value::Array(items) => segment
                .parse::<usize>()
                .ok()
                .and_then(|index| items.get(index).cloned()),
            object => scope.engine.objects().property(object, segment),
        }
        .unwrap_or(Value::Null);
    }

    current
}

fn read_property(scope: &Scope, node: &FlowNode, object: &Value, name: &str) -> Value {
    if object.is_null() {
        return Value::Null;
    }
    match scope.engine.objects().property(object, name) {
        Some(value) => value,
        None => {
            warn!(
                flow = %scope.flow.name(),
                node = %node.id,
                property = %name,
                "property cannot be resolved against object"
            );
            Value::Null
        }
    }
}

/// Coerce a literal to its declared constant type
pub(crate) fn coerce_constant(value: &Value, constant_type: ConstantType) -> FlowGraphResult<Value> {
    let text = value.as_str().map(str::trim);
    match constant_type {
        ConstantType::String => Ok(match value {
            Value::String(_) | Value::Null => value.clone(),
            other => Value::String(other.to_string()),
        }),
        ConstantType::Boolean => match (value, text) {
            (Value::Bool(_), _) => Ok(value.clone()),
            (_, Some(text)) if text.eq_ignore_ascii_case("true") => Ok(Value::Bool(true)),
            (_, Some(text)) if text.eq_ignore_ascii_case("false") => Ok(Value::Bool(false)),
            _ => Err(FlowError::type_mismatch("boolean", value)),
        },
        ConstantType::Integer => match (value.as_i64(), text) {
            (Some(n), _) => Ok(Value::from(n)),
            (None, Some(text)) => text
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| FlowError::type_mismatch("integer", value)),
            _ => Err(FlowError::type_mismatch("integer", value)),
        },
        ConstantType::Double => {
            let parsed = match text {
                Some(text) => text.parse::<f64>().ok(),
                None => value.as_f64(),
            };
            parsed
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| FlowError::type_mismatch("double", value))
        }
        ConstantType::Date => {
            let parsed = match (value, text) {
                (_, Some(text)) => parse_date(text),
                (Value::Number(n), None) => n.as_i64().and_then(DateTime::from_timestamp_millis),
                _ => None,
            };
            parsed
                .map(|date| Value::String(date.to_rfc3339_opts(SecondsFormat::AutoSi, true)))
                .ok_or_else(|| FlowError::type_mismatch("date", value))
        }
    }
}

fn parse_date(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(date) = DateTime::parse_from_rfc3339(text) {
        return Some(date.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}
