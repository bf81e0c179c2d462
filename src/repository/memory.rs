use super::FlowRepository;
use crate::flow::FlowContainer;
use crate::node::FlowId;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Simple in-memory flow repository using HashMap
#[derive(Debug, Default)]
pub struct InMemoryFlowRepository {
    flows: RwLock<HashMap<FlowId, Arc<FlowContainer>>>,
}

impl InMemoryFlowRepository {
    /// Create a new in-memory repository
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a flow, replacing any flow with the same id
    pub fn insert(&self, flow: FlowContainer) -> Arc<FlowContainer> {
        let flow = Arc::new(flow);
        self.flows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(flow.id().clone(), flow.clone());
        flow
    }

    /// Remove a flow by id, returning it if it existed
    pub fn remove(&self, id: &FlowId) -> Option<Arc<FlowContainer>> {
        self.flows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    pub fn len(&self) -> usize {
        self.flows.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FlowRepository for InMemoryFlowRepository {
    fn flow(&self, id: &FlowId) -> Option<Arc<FlowContainer>> {
        self.flows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn flow_by_name(&self, name: &str) -> Option<Arc<FlowContainer>> {
        self.flows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|flow| flow.name() == name)
            .cloned()
    }

    fn flows(&self) -> Vec<Arc<FlowContainer>> {
        self.flows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowBuilder;
    use crate::node::{FlowNode, NodeKind};

    fn flow(name: &str) -> FlowContainer {
        FlowBuilder::new(name)
            .start("end")
            .node(FlowNode::new("end", NodeKind::returning(None, None)))
            .build()
            .unwrap()
    }

    #[test]
    fn test_in_memory_repository_basic_operations() {
        let repository = InMemoryFlowRepository::new();
        assert!(repository.is_empty());

        let main = repository.insert(flow("main"));
        repository.insert(flow("helper"));
        assert_eq!(repository.len(), 2);

        // Lookup by id and by name
        assert!(Arc::ptr_eq(&repository.flow(main.id()).unwrap(), &main));
        assert_eq!(repository.flow_by_name("helper").unwrap().name(), "helper");
        assert!(repository.flow_by_name("missing").is_none());

        // Remove
        assert!(repository.remove(&FlowId::new("helper")).is_some());
        assert!(repository.remove(&FlowId::new("helper")).is_none());
        assert_eq!(repository.flows().len(), 1);
    }

    #[test]
    fn test_insert_replaces_same_id() {
        let repository = InMemoryFlowRepository::new();
        repository.insert(flow("main"));
        let replacement = repository.insert(flow("main"));

        assert_eq!(repository.len(), 1);
        assert!(Arc::ptr_eq(&repository.flow(&FlowId::new("main")).unwrap(), &replacement));
    }
}
