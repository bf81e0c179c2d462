//! Read access to stored flows.
//!
//! The engine resolves `Call` targets and named flows through a [`FlowRepository`].
//! Persistence of flow graphs belongs to the host; [`InMemoryFlowRepository`] is always
//! available and is what the engine uses when none is configured.

use crate::flow::FlowContainer;
use crate::node::FlowId;
use std::sync::Arc;

// ============================================================================
// REPOSITORY TRAIT
// ============================================================================

/// Trait defining the lookup interface the engine needs from flow storage
pub trait FlowRepository: Send + Sync {
    /// Retrieve a flow by id
    fn flow(&self, id: &FlowId) -> Option<Arc<FlowContainer>>;

    /// Retrieve a flow by its unique name
    fn flow_by_name(&self, name: &str) -> Option<Arc<FlowContainer>>;

    /// All stored flows
    fn flows(&self) -> Vec<Arc<FlowContainer>>;
}

// ============================================================================
// REPOSITORY IMPLEMENTATIONS
// ============================================================================

mod memory;
pub use memory::InMemoryFlowRepository;
