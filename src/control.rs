//! Control Service
//!
//! Owns the authoritative cluster documents and fans them out to every
//! connected agent. Rapid configuration and state changes coalesce into one
//! delayed broadcast; each connection has a single in-flight send with
//! newest-wins supersession behind it; peers that acknowledged the previous
//! documents get a generational diff instead of a full snapshot.

use crate::clusterstate::{ClusterStateStore, SourceId};
use crate::config::ControlServiceConfig;
use crate::configuration::ConfigurationService;
use crate::diff::create_diff;
use crate::error::VolmeshResult;
use crate::generation::{generation_hash, GenerationHash};
use crate::model::{Deployment, DeploymentState};
use crate::protocol::{CommandError, CommandLocator, Connection};
use crate::wire::{
    ClusterStatusDiffRequest, ClusterStatusRequest, EncodingCache, Reply, Request,
    PROTOCOL_MAJOR_VERSION,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{sleep, Instant};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

static NEXT_SOURCE: AtomicU64 = AtomicU64::new(1);

/// The control service: accepts agent connections, merges their reports,
/// and broadcasts configuration + state back to all of them.
#[derive(Clone)]
pub struct ControlService {
    inner: Arc<ControlInner>,
}

struct ControlInner {
    config: ControlServiceConfig,
    configuration: Arc<ConfigurationService>,
    cluster_state: Mutex<ClusterStateStore>,
    connections: Mutex<HashMap<SourceId, AgentEntry>>,
    broadcast: Mutex<BroadcastTimer>,
    stopped: AtomicBool,
}

#[derive(Default)]
struct BroadcastTimer {
    scheduled: bool,
    epoch: u64,
}

#[derive(Clone)]
struct AgentEntry {
    connection: Connection,
    sender: Arc<Mutex<AgentSender>>,
}

/// The documents one broadcast pass wants a connection to hold.
#[derive(Clone)]
struct Target {
    configuration: Arc<Deployment>,
    configuration_generation: GenerationHash,
    state: Arc<DeploymentState>,
    state_generation: GenerationHash,
}

impl Target {
    fn generations(&self) -> (GenerationHash, GenerationHash) {
        (self.configuration_generation, self.state_generation)
    }
}

/// Per-connection send queue: at most one outstanding send, newer targets
/// replacing each other behind it.
#[derive(Default)]
struct AgentSender {
    in_flight: bool,
    pending: Option<Target>,
    /// Generations the peer reported in its most recent response.
    acked: Option<(GenerationHash, GenerationHash)>,
    /// The documents behind the last successful send, the base a diff can be
    /// computed from.
    last_sent: Option<Target>,
}

/// What a send task should put on the wire for one connection.
enum Plan {
    /// Peer already holds the target documents.
    Skip,
    Full,
    Diff { base: Target },
}

impl ControlService {
    /// Build the service and subscribe it to configuration changes. Must be
    /// called within a tokio runtime.
    pub fn new(config: ControlServiceConfig, configuration: Arc<ConfigurationService>) -> Self {
        let service = Self {
            inner: Arc::new(ControlInner {
                cluster_state: Mutex::new(ClusterStateStore::new(config.expiration_time)),
                config,
                configuration: Arc::clone(&configuration),
                connections: Mutex::new(HashMap::new()),
                broadcast: Mutex::new(BroadcastTimer::default()),
                stopped: AtomicBool::new(false),
            }),
        };
        let inner = Arc::downgrade(&service.inner);
        configuration.on_change(move |_| {
            if let Some(inner) = inner.upgrade() {
                inner.schedule_broadcast();
            }
        });
        service
    }

    /// Adopt an established transport as an agent connection: spawn the
    /// protocol over it, add it to the connection set, and queue its initial
    /// snapshot through the normal batching path.
    pub fn register_transport<T>(&self, transport: T) -> Connection
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let source = NEXT_SOURCE.fetch_add(1, Ordering::Relaxed);
        let locator = Arc::new(ControlServiceLocator {
            inner: Arc::clone(&self.inner),
            source,
        });
        let connection =
            Connection::spawn(transport, locator, self.inner.config.protocol.clone());

        if self.inner.is_stopped() {
            connection.close();
            return connection;
        }
        info!(agent = source, "agent_connected");
        self.inner.lock_connections().insert(
            source,
            AgentEntry {
                connection: connection.clone(),
                sender: Arc::new(Mutex::new(AgentSender::default())),
            },
        );
        let inner = Arc::downgrade(&self.inner);
        connection.on_disconnect(move |_| {
            if let Some(inner) = inner.upgrade() {
                inner.lock_connections().remove(&source);
            }
        });
        self.inner.schedule_broadcast();
        connection
    }

    /// The configuration seam this service observes.
    pub fn configuration(&self) -> &Arc<ConfigurationService> {
        &self.inner.configuration
    }

    /// Materialize the current cluster state, expired contributions omitted.
    pub fn current_state(&self) -> DeploymentState {
        let now = Instant::now();
        let mut store = self.inner.lock_cluster_state();
        store.wipe(now);
        store.as_deployment(now)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock_connections().len()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.is_stopped()
    }

    /// Stop the service: cancel any pending broadcast, refuse new ones, and
    /// close every connection.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        {
            let mut timer = self.inner.lock_broadcast();
            timer.epoch += 1;
            timer.scheduled = false;
        }
        let entries: Vec<AgentEntry> = {
            let mut connections = self.inner.lock_connections();
            connections.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            entry.connection.close();
        }
    }
}

impl ControlInner {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn lock_connections(&self) -> std::sync::MutexGuard<'_, HashMap<SourceId, AgentEntry>> {
        self.connections.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_cluster_state(&self) -> std::sync::MutexGuard<'_, ClusterStateStore> {
        self.cluster_state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_broadcast(&self) -> std::sync::MutexGuard<'_, BroadcastTimer> {
        self.broadcast.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a broadcast after the batching delay. Changes that land while
    /// one is queued coalesce into it; the pass snapshots the documents when
    /// it actually runs.
    fn schedule_broadcast(self: &Arc<Self>) {
        if self.is_stopped() {
            return;
        }
        let epoch = {
            let mut timer = self.lock_broadcast();
            if timer.scheduled {
                return;
            }
            timer.scheduled = true;
            timer.epoch
        };
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            sleep(inner.config.batching_delay).await;
            {
                let mut timer = inner.lock_broadcast();
                if timer.epoch != epoch || inner.is_stopped() {
                    return;
                }
                timer.scheduled = false;
            }
            inner.broadcast_pass();
        });
    }

    /// One broadcast pass: snapshot the documents once, then offer them to
    /// every connection. Connections with a send already in flight keep only
    /// this newest target pending.
    fn broadcast_pass(self: Arc<Self>) {
        let now = Instant::now();
        let configuration = self.configuration.get();
        let state = {
            let mut store = self.lock_cluster_state();
            store.wipe(now);
            Arc::new(store.as_deployment(now))
        };
        let target = match make_target(configuration, state) {
            Ok(target) => target,
            Err(error) => {
                warn!(%error, "failed to hash cluster documents, skipping broadcast");
                return;
            }
        };

        let span = info_span!(
            "send_cluster_state",
            configuration_nodes = target.configuration.nodes.len(),
            state_nodes = target.state.nodes.len(),
        );
        let _entered = span.enter();

        // One cache per pass: every connection taking the full snapshot
        // shares its wire bytes.
        let cache = Arc::new(EncodingCache::new());
        let entries: Vec<(SourceId, AgentEntry)> = self
            .lock_connections()
            .iter()
            .map(|(source, entry)| (*source, entry.clone()))
            .collect();

        for (source, entry) in entries {
            let launch = {
                let mut sender = entry.sender.lock().unwrap_or_else(|e| e.into_inner());
                if sender.in_flight {
                    // Newest wins: any earlier pending target is dropped.
                    sender.pending = Some(target.clone());
                    false
                } else {
                    sender.in_flight = true;
                    true
                }
            };
            if launch {
                let task_span = info_span!(parent: &span, "send_to_agent", agent = source);
                tokio::spawn(
                    Arc::clone(&self)
                        .send_to_agent(entry, target.clone(), Arc::clone(&cache))
                        .instrument(task_span),
                );
            }
        }
    }

    /// Drive one in-flight send for one connection, then unblock its queue.
    async fn send_to_agent(self: Arc<Self>, entry: AgentEntry, target: Target, cache: Arc<EncodingCache>) {
        let plan = {
            let sender = entry.sender.lock().unwrap_or_else(|e| e.into_inner());
            if sender.acked == Some(target.generations()) {
                Plan::Skip
            } else {
                match (&sender.acked, &sender.last_sent) {
                    (Some(acked), Some(last)) if *acked == last.generations() => {
                        Plan::Diff { base: last.clone() }
                    }
                    _ => Plan::Full,
                }
            }
        };

        let request = match build_request(&plan, &target) {
            Ok(Some(request)) => request,
            Ok(None) => {
                // Peer already current; just settle the queue.
                self.resolve_send(&entry, Some(target), true);
                return;
            }
            Err(error) => {
                warn!(%error, "failed to build cluster update, unblocking queue");
                self.resolve_send(&entry, None, false);
                return;
            }
        };

        let result = entry.connection.call_remote_cached(request, &cache).await;
        match result {
            Ok(Reply::Generations(generations)) => {
                let mut sender = entry.sender.lock().unwrap_or_else(|e| e.into_inner());
                sender.acked = Some((
                    generations.current_configuration_generation,
                    generations.current_state_generation,
                ));
                drop(sender);
                self.resolve_send(&entry, Some(target), true);
            }
            Ok(other) => {
                warn!(?other, "unexpected reply to cluster update");
                self.resolve_send(&entry, None, false);
            }
            Err(error) => {
                // A failed send must not stall the queue; the peer's next
                // response (or its absence) drives correctness from here.
                warn!(%error, "cluster update failed");
                self.resolve_send(&entry, None, false);
            }
        }
    }

    /// Settle a finished in-flight send: record what the peer now holds (or
    /// forget it after a failure) and, if a newer target queued up behind
    /// the send, re-arm through the batching delay.
    fn resolve_send(self: &Arc<Self>, entry: &AgentEntry, sent: Option<Target>, success: bool) {
        let reschedule = {
            let mut sender = entry.sender.lock().unwrap_or_else(|e| e.into_inner());
            if success {
                sender.last_sent = sent;
            } else {
                sender.acked = None;
                sender.last_sent = None;
            }
            sender.in_flight = false;
            match sender.pending.take() {
                Some(pending) => match &sender.last_sent {
                    Some(last) => pending.generations() != last.generations(),
                    None => true,
                },
                None => false,
            }
        };
        if reschedule {
            self.schedule_broadcast();
        }
    }
}

fn make_target(
    configuration: Arc<Deployment>,
    state: Arc<DeploymentState>,
) -> VolmeshResult<Target> {
    Ok(Target {
        configuration_generation: generation_hash(configuration.as_ref())?,
        state_generation: generation_hash(state.as_ref())?,
        configuration,
        state,
    })
}

fn build_request(plan: &Plan, target: &Target) -> VolmeshResult<Option<Request>> {
    let trace_token = Uuid::new_v4().to_string();
    match plan {
        Plan::Skip => Ok(None),
        Plan::Full => Ok(Some(Request::ClusterStatus(ClusterStatusRequest {
            configuration: Arc::clone(&target.configuration),
            configuration_generation: target.configuration_generation,
            state: Arc::clone(&target.state),
            state_generation: target.state_generation,
            trace_token,
        }))),
        Plan::Diff { base } => {
            let configuration_diff =
                create_diff(base.configuration.as_ref(), target.configuration.as_ref())?;
            let state_diff = create_diff(base.state.as_ref(), target.state.as_ref())?;
            Ok(Some(Request::ClusterStatusDiff(ClusterStatusDiffRequest {
                configuration_diff,
                start_configuration_generation: base.configuration_generation,
                end_configuration_generation: target.configuration_generation,
                state_diff,
                start_state_generation: base.state_generation,
                end_state_generation: target.state_generation,
                trace_token,
            })))
        }
    }
}

/// Dispatch table for commands agents send to the control service.
struct ControlServiceLocator {
    inner: Arc<ControlInner>,
    source: SourceId,
}

#[async_trait]
impl CommandLocator for ControlServiceLocator {
    async fn dispatch(&self, request: Request) -> Result<Reply, CommandError> {
        let now = Instant::now();
        // Any inbound command keeps this connection's contributions alive.
        self.inner.lock_cluster_state().touch(self.source, now);

        match request {
            Request::Version => Ok(Reply::Version {
                major: PROTOCOL_MAJOR_VERSION,
            }),
            Request::NoOp => Ok(Reply::Empty),
            Request::SetNodeEra(request) => {
                self.inner
                    .lock_cluster_state()
                    .set_node_era(request.node_uuid, request.era);
                self.inner.schedule_broadcast();
                Ok(Reply::Empty)
            }
            Request::NodeState(request) => {
                let span = info_span!(
                    "node_state_report",
                    agent = self.source,
                    trace_token = %request.trace_token,
                    changes = request.state_changes.len(),
                );
                let _entered = span.enter();
                self.inner.lock_cluster_state().apply_changes(
                    &request.state_changes,
                    self.source,
                    now,
                );
                self.inner.schedule_broadcast();
                Ok(Reply::Empty)
            }
            other @ (Request::ClusterStatus(_) | Request::ClusterStatusDiff(_)) => {
                Err(CommandError::unhandled(other.command_name()))
            }
        }
    }
}
