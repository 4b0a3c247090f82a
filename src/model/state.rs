//! Observed-state documents: what agents report and the control service
//! aggregates.

use super::deployment::Application;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

/// A dataset known to the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    /// Dataset identity
    pub dataset_id: Uuid,

    /// Maximum size in bytes, if constrained
    #[serde(default)]
    pub maximum_size: Option<u64>,

    /// Whether deletion of this dataset has been requested
    #[serde(default)]
    pub deleted: bool,

    /// Free-form dataset metadata
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Dataset {
    pub fn new(dataset_id: Uuid) -> Self {
        Self {
            dataset_id,
            maximum_size: None,
            deleted: false,
            metadata: BTreeMap::new(),
        }
    }
}

/// A locally mounted instance of a dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifestation {
    /// The dataset this manifestation realizes
    pub dataset: Dataset,

    /// Whether this node holds the primary copy
    pub primary: bool,
}

/// One node's report of its observed state.
///
/// Category fields are `Option`: `None` means the report does not speak for
/// that category and the control service keeps whatever was previously known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    /// Reporting node identity
    pub uuid: Uuid,

    /// Reporting node hostname
    pub hostname: String,

    /// Applications observed running (or stopped) on the node
    #[serde(default)]
    pub applications: Option<BTreeMap<String, Application>>,

    /// Block devices backing datasets, keyed by dataset id
    #[serde(default)]
    pub devices: Option<BTreeMap<Uuid, PathBuf>>,

    /// Filesystem paths exposed to applications, keyed by mount name
    #[serde(default)]
    pub paths: Option<BTreeMap<String, PathBuf>>,

    /// Locally mounted datasets, keyed by dataset id
    #[serde(default)]
    pub manifestations: Option<BTreeMap<Uuid, Manifestation>>,
}

impl NodeState {
    pub fn new(uuid: Uuid, hostname: impl Into<String>) -> Self {
        Self {
            uuid,
            hostname: hostname.into(),
            applications: None,
            devices: None,
            paths: None,
            manifestations: None,
        }
    }

    pub fn with_applications(
        mut self,
        applications: impl IntoIterator<Item = Application>,
    ) -> Self {
        self.applications = Some(
            applications
                .into_iter()
                .map(|a| (a.name.clone(), a))
                .collect(),
        );
        self
    }

    pub fn with_manifestations(
        mut self,
        manifestations: impl IntoIterator<Item = Manifestation>,
    ) -> Self {
        self.manifestations = Some(
            manifestations
                .into_iter()
                .map(|m| (m.dataset.dataset_id, m))
                .collect(),
        );
        self
    }
}

/// Datasets known to exist in the cluster but not mounted on the reporting
/// node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonManifestDatasets {
    /// Known datasets, keyed by dataset id
    #[serde(default)]
    pub datasets: BTreeMap<Uuid, Dataset>,
}

impl NonManifestDatasets {
    pub fn new(datasets: impl IntoIterator<Item = Dataset>) -> Self {
        Self {
            datasets: datasets.into_iter().map(|d| (d.dataset_id, d)).collect(),
        }
    }
}

/// One element of a node's state report
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateChange {
    /// A node-scoped report
    NodeState(NodeState),

    /// A cluster-scoped report of unmounted datasets
    NonManifestDatasets(NonManifestDatasets),
}

/// The aggregated observed state of the whole cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentState {
    /// Per-node observed state, keyed by node uuid
    #[serde(default)]
    pub nodes: BTreeMap<Uuid, NodeState>,

    /// Cluster-wide datasets not mounted anywhere, keyed by dataset id
    #[serde(default)]
    pub nonmanifest_datasets: BTreeMap<Uuid, Dataset>,

    /// Agent incarnation per node
    #[serde(default)]
    pub node_eras: BTreeMap<Uuid, Uuid>,
}

impl DeploymentState {
    /// Return a new state with `node` inserted or replaced as a whole.
    pub fn update_node(&self, node: NodeState) -> Self {
        let mut next = self.clone();
        next.nodes.insert(node.uuid, node);
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_report_leaves_categories_unset() {
        let state = NodeState::new(Uuid::new_v4(), "192.0.2.17");
        assert!(state.applications.is_none());
        assert!(state.manifestations.is_none());
    }

    #[test]
    fn update_node_replaces_whole_contribution() {
        let uuid = Uuid::new_v4();
        let first = NodeState::new(uuid, "node1.example.com").with_applications([]);
        let state = DeploymentState::default().update_node(first);
        let second = NodeState::new(uuid, "node1.example.com");
        let updated = state.update_node(second.clone());
        assert_eq!(updated.nodes[&uuid], second);
    }
}
