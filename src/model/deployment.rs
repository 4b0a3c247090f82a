//! Desired-state documents: the cluster configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Reference to a container image
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DockerImage {
    /// Image repository, e.g. `postgresql`
    pub repository: String,

    /// Image tag, defaults to `latest`
    pub tag: String,
}

impl DockerImage {
    /// Parse an image reference of the form `repository[:tag]`.
    pub fn from_string(name: &str) -> Self {
        match name.rsplit_once(':') {
            Some((repository, tag)) if !tag.is_empty() && !tag.contains('/') => Self {
                repository: repository.to_string(),
                tag: tag.to_string(),
            },
            _ => Self {
                repository: name.to_string(),
                tag: "latest".to_string(),
            },
        }
    }
}

/// A containerized application deployed on a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    /// Application name, unique within its node
    pub name: String,

    /// Container image to run
    pub image: DockerImage,

    /// Whether the application should be running
    #[serde(default = "default_running")]
    pub running: bool,

    /// Environment variables supplied to the container
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

fn default_running() -> bool {
    true
}

impl Application {
    pub fn new(name: impl Into<String>, image: DockerImage) -> Self {
        Self {
            name: name.into(),
            image,
            running: true,
            environment: BTreeMap::new(),
        }
    }
}

/// Desired configuration for a single node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Node identity
    pub uuid: Uuid,

    /// Node hostname
    pub hostname: String,

    /// Applications that should run on this node, keyed by name
    #[serde(default)]
    pub applications: BTreeMap<String, Application>,
}

impl Node {
    pub fn new(uuid: Uuid, hostname: impl Into<String>) -> Self {
        Self {
            uuid,
            hostname: hostname.into(),
            applications: BTreeMap::new(),
        }
    }

    pub fn with_applications(
        mut self,
        applications: impl IntoIterator<Item = Application>,
    ) -> Self {
        self.applications = applications
            .into_iter()
            .map(|a| (a.name.clone(), a))
            .collect();
        self
    }
}

/// The cluster configuration: desired state, authored externally
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    /// Per-node desired configuration, keyed by node uuid
    #[serde(default)]
    pub nodes: BTreeMap<Uuid, Node>,
}

impl Deployment {
    pub fn new(nodes: impl IntoIterator<Item = Node>) -> Self {
        Self {
            nodes: nodes.into_iter().map(|n| (n.uuid, n)).collect(),
        }
    }

    /// Return a new configuration with `node` inserted or replaced.
    pub fn update_node(&self, node: Node) -> Self {
        let mut next = self.clone();
        next.nodes.insert(node.uuid, node);
        next
    }
}
