pub mod error;

use std::{collections::HashMap, fmt};

use crate::{
    connection::{ConnectionRef, TransportKind},
    types::NodeId,
};

pub use error::NodeError;

/// Lifecycle state of one peer process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    /// No connection, no launch pending. Also the terminal state after a
    /// graceful stop or a fatal connection error.
    Stopped,
    /// Launch parameters are registered, nothing has been started.
    Initialized,
    /// The remote process was launched but no connection has been observed.
    Launched,
    /// Connected and handshaken; the only state valid for application sends.
    Running,
}

impl fmt::Display for NodeState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Stopped => "stopped",
            NodeState::Initialized => "initialized",
            NodeState::Launched => "launched",
            NodeState::Running => "running",
        };
        formatter.write_str(name)
    }
}

/// Describes how to reach and start one peer.
#[derive(Clone, Debug, Default)]
pub struct NodeDescriptor {
    /// Hostname or address of the peer, substituted for `%h` in the launch
    /// command template.
    pub host: String,
    /// Launch command template. `%h` expands to the host, `%n` to the node
    /// id, `%c` to the program command passed at launch time.
    pub launch_command: Option<String>,
}

/// One peer process of the session.
///
/// A node owns at most one connection per transport kind. Cross-references
/// to nodes are always by [`NodeId`]; no raw ownership pointers exist, so
/// teardown cannot dangle.
pub struct Node {
    id: NodeId,
    state: NodeState,
    descriptor: NodeDescriptor,
    connections: HashMap<TransportKind, ConnectionRef>,
    /// Peer advertised compression support during the handshake.
    pub(crate) peer_compression: bool,
}

impl Node {
    pub fn new(id: NodeId, descriptor: NodeDescriptor) -> Self {
        Self {
            id,
            state: NodeState::Stopped,
            descriptor,
            connections: HashMap::new(),
            peer_compression: false,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn descriptor(&self) -> &NodeDescriptor {
        &self.descriptor
    }

    pub fn connection(&self, transport: TransportKind) -> Option<&ConnectionRef> {
        self.connections.get(&transport)
    }

    /// The node's connection, if it has exactly one on any transport.
    pub fn any_connection(&self) -> Option<&ConnectionRef> {
        self.connections.values().next()
    }

    /// `Stopped -> Initialized`: register launch parameters.
    pub fn initialize(&mut self, descriptor: NodeDescriptor) -> Result<(), NodeError> {
        self.transition(NodeState::Initialized)?;
        self.descriptor = descriptor;
        Ok(())
    }

    /// `Initialized -> Launched`: the launcher was invoked.
    pub fn mark_launched(&mut self) -> Result<(), NodeError> {
        self.transition(NodeState::Launched)
    }

    /// `Launched -> Running` or `Initialized -> Running` (the latter when the
    /// remote process was already running and only a connection was attached).
    pub fn mark_running(&mut self) -> Result<(), NodeError> {
        self.transition(NodeState::Running)
    }

    /// Any state `-> Stopped`: closes and discards every owned connection.
    /// Always permitted; a fatal connection error forces it from any state.
    pub fn stop(&mut self) {
        for connection in self.connections.values() {
            connection.close();
        }
        self.connections.clear();
        self.peer_compression = false;
        self.state = NodeState::Stopped;
    }

    /// Attach a connection. At most one connection per transport kind.
    pub fn attach_connection(&mut self, connection: ConnectionRef) -> Result<(), NodeError> {
        let transport = connection.kind();
        if self.connections.contains_key(&transport) {
            return Err(NodeError::ConnectionExists {
                node: self.id,
                transport: match transport {
                    TransportKind::StreamSocket => "stream socket",
                    TransportKind::LocalPipe => "local pipe",
                    TransportKind::FabricLink => "fabric link",
                },
            });
        }
        self.connections.insert(transport, connection);
        Ok(())
    }

    /// The connection to use for a send, available only while `Running`.
    pub fn running_connection(&self) -> Result<&ConnectionRef, NodeError> {
        if self.state != NodeState::Running {
            return Err(NodeError::NodeNotRunning {
                node: self.id,
                state: self.state,
            });
        }
        self.any_connection().ok_or(NodeError::NodeNotRunning {
            node: self.id,
            state: self.state,
        })
    }

    /// Expand the launch command template for this node.
    pub fn launch_command(&self, program: &str) -> Result<String, NodeError> {
        let template = self
            .descriptor
            .launch_command
            .as_deref()
            .ok_or(NodeError::NoLaunchCommand { node: self.id })?;
        Ok(expand_launch_template(
            template,
            &self.descriptor.host,
            self.id,
            program,
        ))
    }

    fn transition(&mut self, to: NodeState) -> Result<(), NodeError> {
        let valid = matches!(
            (self.state, to),
            (NodeState::Stopped, NodeState::Initialized)
                | (NodeState::Initialized, NodeState::Launched)
                | (NodeState::Launched, NodeState::Running)
                | (NodeState::Initialized, NodeState::Running)
        );
        if !valid {
            return Err(NodeError::InvalidTransition {
                node: self.id,
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }
}

/// `%h` -> host, `%n` -> node id, `%c` -> program command, `%%` -> `%`.
pub fn expand_launch_template(template: &str, host: &str, node: NodeId, program: &str) -> String {
    let mut expanded = String::with_capacity(template.len() + program.len());
    let mut characters = template.chars();
    while let Some(character) = characters.next() {
        if character != '%' {
            expanded.push(character);
            continue;
        }
        match characters.next() {
            Some('h') => expanded.push_str(host),
            Some('n') => expanded.push_str(&node.to_string()),
            Some('c') => expanded.push_str(program),
            Some('%') => expanded.push('%'),
            Some(other) => {
                expanded.push('%');
                expanded.push(other);
            }
            None => expanded.push('%'),
        }
    }
    expanded
}
