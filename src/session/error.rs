use thiserror::Error;

use crate::{
    connection::ConnectionError,
    dispatch::DispatchError,
    node::NodeError,
    object::ObjectError,
    types::NodeId,
};

/// Errors surfaced by session-level operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Node lifecycle error
    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Object registry error
    #[error("Object error: {0}")]
    Object(#[from] ObjectError),

    /// Dispatch error
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// The session has no node with this id.
    #[error("Session has no node {node}")]
    UnknownNode { node: NodeId },

    /// `add_node` was called with an id that is already in the node table.
    #[error("Session already has node {node}")]
    DuplicateNode { node: NodeId },

    /// `launch_node` was called but no launcher capability was provided.
    #[error("No launcher capability configured for this session")]
    NoLauncher,

    /// The launcher failed to start the remote process.
    #[error("Launching node {node} failed: {detail}")]
    LaunchFailed { node: NodeId, detail: String },

    /// Compressing an outbound payload failed.
    #[error("Compression failed: {detail}")]
    Compression { detail: String },
}
