//! # Execution Context
//!
//! Per-run mutable state of a flow execution:
//!
//! - **Data cache**: memoized node values keyed by node id ([`DataCache`])
//! - **Parameters**: named input bindings, set before the run
//! - **Store**: explicit named scratch space written and read by `Store` nodes
//! - **Aggregation**: running values of `Aggregate` nodes
//! - **This object** and **principal**: who and what the flow runs as
//! - **Fork queue**: outstanding forked tasks, drained by `ForkJoin`
//!
//! A context is a cheap handle: clones share the same state. [`FlowContext::iteration_scope`]
//! derives a child with a layered data cache for loop and filter elements, and
//! [`FlowContext::for_sub_flow`] derives the isolated context of a sub-flow call.

mod cache;

pub use cache::DataCache;

use crate::{FlowError, FlowGraphResult, NodeId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The security principal a flow is evaluated for
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub name: String,
}

impl Principal {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    pub fn anonymous() -> Self {
        Self::new("anonymous", "anonymous")
    }
}

/// Handle of a task started by a `Fork` node
#[derive(Debug)]
pub struct ForkTask {
    pub(crate) fork: NodeId,
    pub(crate) handle: JoinHandle<FlowGraphResult<Value>>,
}

impl ForkTask {
    pub(crate) fn new(fork: NodeId, handle: JoinHandle<FlowGraphResult<Value>>) -> Self {
        Self { fork, handle }
    }

    /// The `Fork` node that started the task
    pub fn fork(&self) -> &NodeId {
        &self.fork
    }
}

/// Execution context of one flow run
#[derive(Debug, Clone)]
pub struct FlowContext {
    id: String,
    principal: Principal,
    this_object: Value,
    cache: Arc<DataCache>,
    parameters: Arc<RwLock<HashMap<String, Value>>>,
    store: Arc<Mutex<HashMap<String, Value>>>,
    aggregation: Arc<Mutex<HashMap<NodeId, Value>>>,
    aggregation_slots: Arc<Mutex<HashMap<NodeId, Arc<tokio::sync::Mutex<()>>>>>,
    forks: Arc<Mutex<VecDeque<ForkTask>>>,
    recovered: Arc<Mutex<Vec<FlowError>>>,
}

impl Default for FlowContext {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowContext {
    /// Create an empty context for the anonymous principal
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            principal: Principal::anonymous(),
            this_object: Value::Null,
            cache: Arc::new(DataCache::new()),
            parameters: Arc::default(),
            store: Arc::default(),
            aggregation: Arc::default(),
            aggregation_slots: Arc::default(),
            forks: Arc::default(),
            recovered: Arc::default(),
        }
    }

    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principal = principal;
        self
    }

    /// Set the object the flow runs as
    pub fn with_this_object(mut self, this_object: Value) -> Self {
        self.this_object = this_object;
        self
    }

    pub fn with_parameter(self, name: impl Into<String>, value: Value) -> Self {
        self.set_parameter(name, value);
        self
    }

    pub fn with_parameters<I>(self, parameters: I) -> Self
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        self.parameters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(parameters);
        self
    }

    /// Context derived for a sub-flow call: fresh state, same principal and this object
    pub fn for_sub_flow(&self) -> Self {
        Self::new()
            .with_principal(self.principal.clone())
            .with_this_object(self.this_object.clone())
    }

    /// Context derived for one loop or filter element.
    ///
    /// Shares everything with `self` except the data cache, which becomes a layer on top
    /// of this context's cache.
    pub fn iteration_scope(&self) -> Self {
        Self {
            cache: Arc::new(DataCache::layered(self.cache.clone())),
            ..self.clone()
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn this_object(&self) -> &Value {
        &self.this_object
    }

    // ------------------------------------------------------------------
    // Data cache
    // ------------------------------------------------------------------

    pub fn cache(&self) -> &DataCache {
        &self.cache
    }

    /// The value currently held for a node
    pub fn data(&self, id: &NodeId) -> Option<Value> {
        self.cache.get(id)
    }

    pub fn has_data(&self, id: &NodeId) -> bool {
        self.cache.contains(id)
    }

    pub fn set_data(&self, id: &NodeId, value: Value) {
        self.cache.set(id, value);
    }

    // ------------------------------------------------------------------
    // Parameters
    // ------------------------------------------------------------------

    pub fn parameter(&self, name: &str) -> Option<Value> {
        self.parameters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn set_parameter(&self, name: impl Into<String>, value: Value) {
        self.parameters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), value);
    }

    /// Snapshot of all parameters
    pub fn parameters(&self) -> HashMap<String, Value> {
        self.parameters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // ------------------------------------------------------------------
    // Store
    // ------------------------------------------------------------------

    pub fn store_get(&self, key: &str) -> Option<Value> {
        locked(&self.store).get(key).cloned()
    }

    pub fn store_set(&self, key: impl Into<String>, value: Value) {
        locked(&self.store).insert(key.into(), value);
    }

    pub fn store_remove(&self, key: &str) -> Option<Value> {
        locked(&self.store).remove(key)
    }

    // ------------------------------------------------------------------
    // Aggregation
    // ------------------------------------------------------------------

    pub fn aggregation(&self, id: &NodeId) -> Option<Value> {
        locked(&self.aggregation).get(id).cloned()
    }

    pub fn set_aggregation(&self, id: &NodeId, value: Value) {
        locked(&self.aggregation).insert(id.clone(), value);
    }

    /// Forget the running value of an `Aggregate` node
    pub fn reset_aggregation(&self, id: &NodeId) -> Option<Value> {
        locked(&self.aggregation).remove(id)
    }

    /// Exclusive right to advance the running value of `id`.
    ///
    /// Held across read, fold and write so concurrent forks never lose an update.
    pub(crate) async fn lock_aggregation(&self, id: &NodeId) -> OwnedMutexGuard<()> {
        let slot = locked(&self.aggregation_slots)
            .entry(id.clone())
            .or_default()
            .clone();
        slot.lock_owned().await
    }

    // ------------------------------------------------------------------
    // Fork queue
    // ------------------------------------------------------------------

    pub(crate) fn push_fork(&self, task: ForkTask) {
        locked(&self.forks).push_back(task);
    }

    pub(crate) fn pop_fork(&self) -> Option<ForkTask> {
        locked(&self.forks).pop_front()
    }

    /// Number of forked tasks not yet joined
    pub fn pending_forks(&self) -> usize {
        locked(&self.forks).len()
    }

    // ------------------------------------------------------------------
    // Recovered errors
    // ------------------------------------------------------------------

    pub(crate) fn record_recovered(&self, error: FlowError) {
        locked(&self.recovered).push(error);
    }

    /// Errors swallowed by exception handlers during this run, oldest first
    pub fn recovered_errors(&self) -> Vec<FlowError> {
        locked(&self.recovered).clone()
    }
}
