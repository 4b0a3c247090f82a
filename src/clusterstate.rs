//! Cluster-State Store
//!
//! Aggregates per-node reports into the authoritative observed state of the
//! cluster. Each node's contribution is split by category so a partial
//! report replaces only what it speaks for, and every contribution carries a
//! last-activity stamp: any traffic from the owning connection, pings
//! included, keeps it alive, while a long-silent agent's data ages out even
//! if its TCP connection lingers.

use crate::model::{
    Application, Dataset, DeploymentState, Manifestation, NodeState, StateChange,
};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

/// Identifies the connection a contribution arrived through.
pub type SourceId = u64;

/// One category slot: the reported value, who reported it, and when that
/// reporter was last heard from.
#[derive(Debug, Clone)]
struct Slot<T> {
    value: T,
    source: SourceId,
    last_activity: Instant,
}

impl<T> Slot<T> {
    fn new(value: T, source: SourceId, now: Instant) -> Self {
        Self {
            value,
            source,
            last_activity: now,
        }
    }

    fn expired(&self, now: Instant, expiration: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) >= expiration
    }
}

/// Per-node category slots.
#[derive(Debug, Clone, Default)]
struct NodeRecord {
    hostname: String,
    applications: Option<Slot<BTreeMap<String, Application>>>,
    devices: Option<Slot<BTreeMap<Uuid, PathBuf>>>,
    paths: Option<Slot<BTreeMap<String, PathBuf>>>,
    manifestations: Option<Slot<BTreeMap<Uuid, Manifestation>>>,
}

impl NodeRecord {
    fn slots_mut(
        &mut self,
    ) -> [&mut dyn SlotAccess; 4] {
        [
            &mut self.applications,
            &mut self.devices,
            &mut self.paths,
            &mut self.manifestations,
        ]
    }

    fn is_empty(&self) -> bool {
        self.applications.is_none()
            && self.devices.is_none()
            && self.paths.is_none()
            && self.manifestations.is_none()
    }
}

/// Type-erased access to a category slot for sweep operations.
trait SlotAccess {
    fn touch_if_source(&mut self, source: SourceId, now: Instant);
    fn clear_if_expired(&mut self, now: Instant, expiration: Duration);
}

impl<T> SlotAccess for Option<Slot<T>> {
    fn touch_if_source(&mut self, source: SourceId, now: Instant) {
        if let Some(slot) = self {
            if slot.source == source {
                slot.last_activity = now;
            }
        }
    }

    fn clear_if_expired(&mut self, now: Instant, expiration: Duration) {
        if let Some(slot) = self {
            if slot.expired(now, expiration) {
                *self = None;
            }
        }
    }
}

/// The authoritative observed-state store owned by the control service.
#[derive(Debug)]
pub struct ClusterStateStore {
    expiration: Duration,
    nodes: HashMap<Uuid, NodeRecord>,
    nonmanifest: Option<Slot<BTreeMap<Uuid, Dataset>>>,
    eras: BTreeMap<Uuid, Uuid>,
}

impl ClusterStateStore {
    pub fn new(expiration: Duration) -> Self {
        Self {
            expiration,
            nodes: HashMap::new(),
            nonmanifest: None,
            eras: BTreeMap::new(),
        }
    }

    /// Apply a batch of reports from one connection, replacing exactly the
    /// category slots each report carries and stamping them with `now`.
    pub fn apply_changes(&mut self, changes: &[StateChange], source: SourceId, now: Instant) {
        for change in changes {
            match change {
                StateChange::NodeState(state) => self.apply_node_state(state, source, now),
                StateChange::NonManifestDatasets(datasets) => {
                    self.nonmanifest = Some(Slot::new(datasets.datasets.clone(), source, now));
                }
            }
        }
    }

    fn apply_node_state(&mut self, state: &NodeState, source: SourceId, now: Instant) {
        let record = self.nodes.entry(state.uuid).or_default();
        record.hostname = state.hostname.clone();
        if let Some(applications) = &state.applications {
            record.applications = Some(Slot::new(applications.clone(), source, now));
        }
        if let Some(devices) = &state.devices {
            record.devices = Some(Slot::new(devices.clone(), source, now));
        }
        if let Some(paths) = &state.paths {
            record.paths = Some(Slot::new(paths.clone(), source, now));
        }
        if let Some(manifestations) = &state.manifestations {
            record.manifestations = Some(Slot::new(manifestations.clone(), source, now));
        }
    }

    /// Record an agent incarnation. Eras are overwritten, never expired: a
    /// stale era is corrected by the next announcement from the node.
    pub fn set_node_era(&mut self, node_uuid: Uuid, era: Uuid) {
        self.eras.insert(node_uuid, era);
    }

    /// Refresh every slot last fed by `source`. Called on any inbound
    /// command from that connection, whatever the command is.
    pub fn touch(&mut self, source: SourceId, now: Instant) {
        for record in self.nodes.values_mut() {
            for slot in record.slots_mut() {
                slot.touch_if_source(source, now);
            }
        }
        self.nonmanifest.touch_if_source(source, now);
    }

    /// Purge slots whose reporter has been silent past the expiration
    /// threshold. Lazy: callers invoke it on observation, no timer needed.
    pub fn wipe(&mut self, now: Instant) {
        let expiration = self.expiration;
        for record in self.nodes.values_mut() {
            for slot in record.slots_mut() {
                slot.clear_if_expired(now, expiration);
            }
        }
        self.nodes.retain(|_, record| !record.is_empty());
        self.nonmanifest.clear_if_expired(now, expiration);
    }

    /// Materialize the cluster state as a document, omitting contributions
    /// stale at `now`.
    pub fn as_deployment(&self, now: Instant) -> DeploymentState {
        fn live_value<T: Clone>(
            slot: &Option<Slot<T>>,
            now: Instant,
            expiration: Duration,
        ) -> Option<T> {
            slot.as_ref()
                .filter(|s| !s.expired(now, expiration))
                .map(|s| s.value.clone())
        }

        let mut deployment = DeploymentState::default();
        for (uuid, record) in &self.nodes {
            let mut node = NodeState::new(*uuid, record.hostname.clone());
            node.applications = live_value(&record.applications, now, self.expiration);
            node.devices = live_value(&record.devices, now, self.expiration);
            node.paths = live_value(&record.paths, now, self.expiration);
            node.manifestations = live_value(&record.manifestations, now, self.expiration);
            let any = node.applications.is_some()
                || node.devices.is_some()
                || node.paths.is_some()
                || node.manifestations.is_some();
            if any {
                deployment.nodes.insert(*uuid, node);
            }
        }
        if let Some(slot) = &self.nonmanifest {
            if !slot.expired(now, self.expiration) {
                deployment.nonmanifest_datasets = slot.value.clone();
            }
        }
        deployment.node_eras = self.eras.clone();
        deployment
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Application, DockerImage, NonManifestDatasets};

    const EXPIRATION: Duration = Duration::from_secs(600);

    fn simple_node_state(uuid: Uuid) -> NodeState {
        NodeState::new(uuid, "192.0.2.17").with_applications([Application::new(
            "myapp",
            DockerImage::from_string("postgresql"),
        )])
    }

    #[tokio::test(start_paused = true)]
    async fn report_appears_in_deployment() {
        let mut store = ClusterStateStore::new(EXPIRATION);
        let uuid = Uuid::from_u128(1);
        let now = Instant::now();
        store.apply_changes(
            &[StateChange::NodeState(simple_node_state(uuid))],
            7,
            now,
        );
        let deployment = store.as_deployment(now);
        assert!(deployment.nodes.contains_key(&uuid));
    }

    #[tokio::test(start_paused = true)]
    async fn partial_report_keeps_other_categories() {
        let mut store = ClusterStateStore::new(EXPIRATION);
        let uuid = Uuid::from_u128(1);
        let now = Instant::now();
        store.apply_changes(&[StateChange::NodeState(simple_node_state(uuid))], 7, now);

        // A manifestations-only report must not clobber applications.
        let mut partial = NodeState::new(uuid, "192.0.2.17");
        partial.manifestations = Some(BTreeMap::new());
        store.apply_changes(&[StateChange::NodeState(partial)], 7, now);

        let deployment = store.as_deployment(now);
        let node = &deployment.nodes[&uuid];
        assert!(node.applications.is_some());
        assert!(node.manifestations.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn contribution_expires_without_activity() {
        let mut store = ClusterStateStore::new(EXPIRATION);
        let uuid = Uuid::from_u128(1);
        let start = Instant::now();
        store.apply_changes(&[StateChange::NodeState(simple_node_state(uuid))], 7, start);

        let before_expiry = start + EXPIRATION - Duration::from_secs(1);
        assert!(store.as_deployment(before_expiry).nodes.contains_key(&uuid));

        let at_expiry = start + EXPIRATION;
        assert!(store.as_deployment(at_expiry).nodes.is_empty());

        store.wipe(at_expiry);
        assert!(store.nodes.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn touch_refreshes_only_matching_source() {
        let mut store = ClusterStateStore::new(EXPIRATION);
        let mine = Uuid::from_u128(1);
        let theirs = Uuid::from_u128(2);
        let start = Instant::now();
        store.apply_changes(&[StateChange::NodeState(simple_node_state(mine))], 7, start);
        store.apply_changes(&[StateChange::NodeState(simple_node_state(theirs))], 8, start);

        let later = start + EXPIRATION / 2;
        store.touch(7, later);

        let after_first_expiry = start + EXPIRATION;
        let deployment = store.as_deployment(after_first_expiry);
        assert!(deployment.nodes.contains_key(&mine));
        assert!(!deployment.nodes.contains_key(&theirs));
    }

    #[tokio::test(start_paused = true)]
    async fn nonmanifest_datasets_are_cluster_wide() {
        let mut store = ClusterStateStore::new(EXPIRATION);
        let dataset = Dataset::new(Uuid::from_u128(9));
        let now = Instant::now();
        store.apply_changes(
            &[StateChange::NonManifestDatasets(NonManifestDatasets::new([
                dataset.clone(),
            ]))],
            7,
            now,
        );
        let deployment = store.as_deployment(now);
        assert_eq!(
            deployment.nonmanifest_datasets.get(&dataset.dataset_id),
            Some(&dataset)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn eras_overwrite_and_do_not_expire() {
        let mut store = ClusterStateStore::new(EXPIRATION);
        let node = Uuid::from_u128(1);
        store.set_node_era(node, Uuid::from_u128(10));
        store.set_node_era(node, Uuid::from_u128(11));

        let far_future = Instant::now() + EXPIRATION * 3;
        let deployment = store.as_deployment(far_future);
        assert_eq!(deployment.node_eras.get(&node), Some(&Uuid::from_u128(11)));
    }
}
