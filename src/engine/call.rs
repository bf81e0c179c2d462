//! Sub-flow invocation.
//!
//! A `Call` runs another flow from its start node in a fresh context that shares only the
//! principal and the this object with the caller. `ParameterInput` nodes are pulled in the
//! caller's context and become the callee's parameters.

use super::{data, run_path, PathTrace, Scope};
use crate::node::{FlowNode, NodeKind};
use crate::{FlowError, FlowGraphResult};
use serde_json::Value;
use tracing::{debug, warn};

pub(crate) async fn invoke(scope: &Scope, node: &FlowNode) -> FlowGraphResult<Value> {
    let NodeKind::Call { callee, inputs } = &node.kind else {
        return Err(FlowError::configuration(format!(
            "Node '{}' is not a call",
            node.id
        )));
    };

    let max_depth = scope.engine.config().max_call_depth;
    if scope.depth >= max_depth {
        return Err(FlowError::MaxCallDepthExceeded(max_depth));
    }

    let flow = scope
        .engine
        .repository()
        .flow(callee)
        .ok_or_else(|| FlowError::FlowNotFound(callee.to_string()))?;
    let start = flow
        .start()
        .cloned()
        .ok_or_else(|| FlowError::MissingStartNode(flow.name().to_string()))?;

    let context = scope.ctx.for_sub_flow();
    for input in inputs {
        let key = match &scope.flow.node(input)?.kind {
            NodeKind::ParameterInput { key, .. } => key.clone(),
            other => {
                return Err(FlowError::configuration(format!(
                    "Call input '{}' is a {}, expected parameterInput",
                    input, other
                )));
            }
        };
        let value = data::pull(scope, input).await?;
        context.set_parameter(key, value);
    }

    debug!(
        flow = %scope.flow.name(),
        node = %node.id,
        callee = %flow.name(),
        depth = scope.depth + 1,
        context = %context.id(),
        "calling sub-flow"
    );

    let child = Scope::new(scope.engine.clone(), flow.clone(), context, scope.depth + 1);
    let mut trace = PathTrace::default();
    let outcome = run_path(&child, start, &mut trace)
        .await
        .map_err(|source| FlowError::SubFlow {
            node: node.id.clone(),
            flow: flow.id().clone(),
            source: Box::new(source),
        })?;

    let pending = child.ctx.pending_forks();
    if pending > 0 {
        warn!(
            callee = %flow.name(),
            node = %node.id,
            pending,
            "sub-flow returned with forked tasks never joined"
        );
    }

    Ok(outcome.into_value())
}
