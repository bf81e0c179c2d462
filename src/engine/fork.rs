//! Fork and join.
//!
//! A `Fork` spawns its body on the tokio runtime against the same context and queues the
//! task handle. A `ForkJoin` drains the queue in FIFO order, waiting for each task up to
//! the configured timeout.

use super::{data, run_path, PathOutcome, PathTrace, Scope};
use crate::context::ForkTask;
use crate::node::{FlowNode, NodeKind};
use crate::{FlowError, FlowGraphResult};
use serde_json::Value;
use tracing::debug;

/// Capture the fork's value and start its body; returns the captured value
pub(crate) async fn spawn(scope: &Scope, node: &FlowNode) -> FlowGraphResult<Value> {
    let NodeKind::Fork { fork_body, .. } = &node.kind else {
        return Err(FlowError::configuration(format!(
            "Node '{}' is not a fork",
            node.id
        )));
    };

    let captured = data::pull(scope, &node.id).await?;

    if let Some(body) = fork_body.clone() {
        let task_scope = scope.detached();
        let handle = tokio::spawn(async move {
            let mut trace = PathTrace::default();
            run_path(&task_scope, body, &mut trace)
                .await
                .map(PathOutcome::into_value)
        });
        scope.ctx.push_fork(ForkTask::new(node.id.clone(), handle));
        debug!(
            flow = %scope.flow.name(),
            node = %node.id,
            pending = scope.ctx.pending_forks(),
            "forked task started"
        );
    }

    Ok(captured)
}

/// Wait for every queued task; returns their values in join order
pub(crate) async fn join(scope: &Scope, node: &FlowNode) -> FlowGraphResult<Value> {
    let timeout = scope.engine.config().fork_join_timeout;
    let mut results = Vec::new();

    while let Some(ForkTask { fork, mut handle }) = scope.ctx.pop_fork() {
        let joined = match timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    handle.abort();
                    return Err(FlowError::ForkTimeout {
                        fork,
                        timeout: limit,
                    });
                }
            },
            None => handle.await,
        };

        match joined {
            Ok(Ok(value)) => results.push(value),
            Ok(Err(error)) => {
                return Err(FlowError::Fork {
                    fork,
                    source: Box::new(error),
                });
            }
            Err(join_error) => {
                return Err(FlowError::ForkAborted {
                    fork,
                    message: join_error.to_string(),
                });
            }
        }
    }

    debug!(node = %node.id, joined = results.len(), "forked tasks joined");
    Ok(Value::Array(results))
}
