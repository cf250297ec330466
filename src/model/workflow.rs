//! Workflow definition types. The core treats workflows as read-only:
//! CRUD, versioning, and storage belong to an out-of-scope collaborator
//! reached through [`crate::repository::WorkflowRepository`].

use std::time::Duration;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Type tag dispatched on by the orchestrator's `execute_node`.
///
/// Unknown/external types fall through to `sendToExecutorService` rather
/// than failing to parse, so new node kinds can ship without a crate
/// release.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeType {
    Trigger,
    HttpRequest,
    Code,
    Condition,
    Loop,
    #[serde(untagged)]
    External(String),
}

impl NodeType {
    pub fn is_trigger(&self) -> bool {
        matches!(self, NodeType::Trigger)
    }

    /// Whether this type is handled inline by the orchestrator, as opposed
    /// to being dispatched to an external worker agent via the bus.
    pub fn is_inline(&self) -> bool {
        matches!(
            self,
            NodeType::Trigger | NodeType::HttpRequest | NodeType::Code | NodeType::Condition | NodeType::Loop
        )
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeType::Trigger => write!(f, "trigger"),
            NodeType::HttpRequest => write!(f, "httpRequest"),
            NodeType::Code => write!(f, "code"),
            NodeType::Condition => write!(f, "condition"),
            NodeType::Loop => write!(f, "loop"),
            NodeType::External(kind) => write!(f, "{kind}"),
        }
    }
}

/// Per-node retry/failure-handling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub continue_on_fail: bool,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_wait_between_tries")]
    pub wait_between_tries: Duration,
    pub timeout: Option<Duration>,
}

fn default_wait_between_tries() -> Duration {
    Duration::from_secs(2)
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            continue_on_fail: false,
            max_retries: 0,
            wait_between_tries: default_wait_between_tries(),
            timeout: None,
        }
    }
}

/// A vertex of the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub parameters: FxHashMap<String, Value>,
    #[serde(default)]
    pub config: NodeConfig,
}

impl Node {
    pub fn new(id: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            id: id.into(),
            node_type,
            parameters: FxHashMap::default(),
            config: NodeConfig::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }
}

/// A directed edge `source -> target`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub label: Option<String>,
}

impl Connection {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            label: None,
        }
    }
}

/// Workflow-wide error handling policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorHandlingPolicy {
    #[serde(default)]
    pub continue_on_fail: bool,
}

/// Workflow-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub timeout: Duration,
    #[serde(default)]
    pub error_handling: ErrorHandlingPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            error_handling: ErrorHandlingPolicy { continue_on_fail: false },
        }
    }
}

/// An immutable, read-only-to-the-core workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub version: u32,
    pub nodes: Vec<Node>,
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub settings: Settings,
    pub is_active: bool,
}

impl Workflow {
    pub fn new(id: impl Into<String>, version: u32) -> Self {
        Self {
            id: id.into(),
            version,
            nodes: Vec::new(),
            connections: Vec::new(),
            settings: Settings::default(),
            is_active: true,
        }
    }

    #[must_use]
    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    #[must_use]
    pub fn with_connection(mut self, connection: Connection) -> Self {
        self.connections.push(connection);
        self
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Nodes of type `trigger`; the BFS walk's starting frontier.
    pub fn trigger_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.node_type.is_trigger())
    }

    /// Outgoing targets of `node_id`, in `Connections` insertion order —
    /// the orchestrator relies on this order to break BFS emission ties.
    pub fn outgoing(&self, node_id: &str) -> impl Iterator<Item = &str> {
        self.connections
            .iter()
            .filter(move |c| c.source == node_id)
            .map(|c| c.target.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_nodes_filters_by_type() {
        let wf = Workflow::new("wf1", 1)
            .with_node(Node::new("n1", NodeType::Trigger))
            .with_node(Node::new("n2", NodeType::HttpRequest));
        let triggers: Vec<_> = wf.trigger_nodes().map(|n| n.id.clone()).collect();
        assert_eq!(triggers, vec!["n1".to_string()]);
    }

    #[test]
    fn outgoing_preserves_connection_order() {
        let wf = Workflow::new("wf1", 1)
            .with_connection(Connection::new("n1", "n3"))
            .with_connection(Connection::new("n1", "n2"));
        let targets: Vec<_> = wf.outgoing("n1").collect();
        assert_eq!(targets, vec!["n3", "n2"]);
    }
}
