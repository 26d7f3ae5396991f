use thiserror::Error;

use crate::types::NodeId;

use super::NodeState;

/// Errors that can occur during node lifecycle operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    /// Application-level sends are only valid against a `Running` node. The
    /// caller decides whether to queue or drop; nothing was sent.
    #[error("Node {node} is not running (state: {state}), cannot send")]
    NodeNotRunning { node: NodeId, state: NodeState },

    /// Attempted an invalid lifecycle transition.
    #[error("Node {node} cannot transition {from} -> {to}")]
    InvalidTransition {
        node: NodeId,
        from: NodeState,
        to: NodeState,
    },

    /// The node already owns a connection on this transport.
    #[error("Node {node} already has a {transport} connection")]
    ConnectionExists {
        node: NodeId,
        transport: &'static str,
    },

    /// The node has no launch command template registered.
    #[error("Node {node} has no launch command configured")]
    NoLaunchCommand { node: NodeId },
}
