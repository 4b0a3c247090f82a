//! Shared helpers for the integration suites: an in-memory loopback
//! transport, a fake convergence agent with an optional response gate, and
//! locator wrappers that record or fail cluster updates.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{duplex, DuplexStream};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use volmesh::agent::{AgentService, ControlPeer, ConvergenceAgent};
use volmesh::config::{ControlServiceConfig, ProtocolConfig, CONTROL_SERVICE_BATCHING_DELAY};
use volmesh::control::ControlService;
use volmesh::model::{Deployment, DeploymentState};
use volmesh::protocol::{CommandError, CommandLocator, Connection};
use volmesh::wire::{Reply, Request};
use volmesh::ConfigurationService;

/// Big enough that an 800-application document never blocks the loopback.
pub const LOOPBACK_BUFFER: usize = 4 * 1024 * 1024;

/// Build a control service over a fresh configuration store.
pub fn control_fixture() -> (ControlService, Arc<ConfigurationService>) {
    let configuration = Arc::new(ConfigurationService::new());
    let service = ControlService::new(
        ControlServiceConfig::default(),
        Arc::clone(&configuration),
    );
    (service, configuration)
}

/// Let the batching window elapse twice over, plus whatever loopback
/// round-trips were queued behind it.
pub async fn advance_batching() {
    tokio::time::sleep(CONTROL_SERVICE_BATCHING_DELAY * 2).await;
}

/// Fake convergence agent recording everything it is told.
pub struct FakeAgent {
    connected_count: AtomicUsize,
    disconnected_count: AtomicUsize,
    updates: Mutex<Vec<(Arc<Deployment>, Arc<DeploymentState>)>>,
    peer: Mutex<Option<ControlPeer>>,
    gate: Option<AsyncMutex<mpsc::UnboundedReceiver<()>>>,
}

impl FakeAgent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connected_count: AtomicUsize::new(0),
            disconnected_count: AtomicUsize::new(0),
            updates: Mutex::new(Vec::new()),
            peer: Mutex::new(None),
            gate: None,
        })
    }

    /// An agent whose `cluster_updated` stalls until released, holding the
    /// control service's in-flight send open.
    pub fn gated() -> (Arc<Self>, mpsc::UnboundedSender<()>) {
        let (release, gate) = mpsc::unbounded_channel();
        let agent = Arc::new(Self {
            connected_count: AtomicUsize::new(0),
            disconnected_count: AtomicUsize::new(0),
            updates: Mutex::new(Vec::new()),
            peer: Mutex::new(None),
            gate: Some(AsyncMutex::new(gate)),
        });
        (agent, release)
    }

    pub fn connected_count(&self) -> usize {
        self.connected_count.load(Ordering::SeqCst)
    }

    pub fn disconnected_count(&self) -> usize {
        self.disconnected_count.load(Ordering::SeqCst)
    }

    pub fn update_count(&self) -> usize {
        self.updates.lock().unwrap().len()
    }

    /// The configuration most recently delivered.
    pub fn desired(&self) -> Option<Arc<Deployment>> {
        self.updates.lock().unwrap().last().map(|(c, _)| Arc::clone(c))
    }

    /// The state most recently delivered.
    pub fn actual(&self) -> Option<Arc<DeploymentState>> {
        self.updates.lock().unwrap().last().map(|(_, s)| Arc::clone(s))
    }

    /// Every configuration delivered, in order.
    pub fn delivered_configurations(&self) -> Vec<Deployment> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .map(|(c, _)| Deployment::clone(c))
            .collect()
    }

    pub fn peer(&self) -> Option<ControlPeer> {
        self.peer.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConvergenceAgent for FakeAgent {
    async fn connected(&self, control: ControlPeer) {
        *self.peer.lock().unwrap() = Some(control);
        self.connected_count.fetch_add(1, Ordering::SeqCst);
    }

    async fn disconnected(&self) {
        self.disconnected_count.fetch_add(1, Ordering::SeqCst);
    }

    async fn cluster_updated(
        &self,
        configuration: Arc<Deployment>,
        state: Arc<DeploymentState>,
    ) {
        if let Some(gate) = &self.gate {
            gate.lock().await.recv().await;
        }
        self.updates.lock().unwrap().push((configuration, state));
    }
}

/// Wire a fake agent to the control service over an in-memory loopback.
pub async fn connect_fake_agent(
    service: &ControlService,
    agent: Arc<FakeAgent>,
) -> (AgentService, Connection) {
    let (control_end, agent_end) = duplex(LOOPBACK_BUFFER);
    service.register_transport(control_end);
    let agent_service = AgentService::new(agent).expect("agent service");
    let connection = agent_service
        .spawn_on(agent_end, ProtocolConfig::default())
        .await;
    (agent_service, connection)
}

/// Records every dispatched request before forwarding it.
pub struct RecordingLocator {
    inner: Arc<dyn CommandLocator>,
    requests: Mutex<Vec<Request>>,
}

impl RecordingLocator {
    pub fn wrap(inner: Arc<dyn CommandLocator>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn command_names(&self) -> Vec<&'static str> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.command_name())
            .collect()
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandLocator for RecordingLocator {
    async fn dispatch(&self, request: Request) -> Result<Reply, CommandError> {
        self.requests.lock().unwrap().push(request.clone());
        self.inner.dispatch(request).await
    }
}

/// Wire an agent to the control service with its dispatch recorded.
pub async fn connect_recorded_agent(
    service: &ControlService,
    agent: Arc<FakeAgent>,
) -> (AgentService, Arc<RecordingLocator>, Connection) {
    let (control_end, agent_end) = duplex(LOOPBACK_BUFFER);
    service.register_transport(control_end);
    let agent_service = AgentService::new(agent).expect("agent service");
    let recorder = RecordingLocator::wrap(agent_service.locator());
    let locator: Arc<dyn CommandLocator> = recorder.clone();
    let connection = Connection::spawn(agent_end, locator, ProtocolConfig::default());
    (agent_service, recorder, connection)
}

/// A peer that rejects every cluster update it is offered.
pub struct FailingUpdateLocator;

#[async_trait]
impl CommandLocator for FailingUpdateLocator {
    async fn dispatch(&self, request: Request) -> Result<Reply, CommandError> {
        match request {
            Request::NoOp => Ok(Reply::Empty),
            Request::ClusterStatus(_) | Request::ClusterStatusDiff(_) => {
                Err(CommandError::failed("forced failure for testing"))
            }
            other => Err(CommandError::unhandled(other.command_name())),
        }
    }
}

/// Attach a peer that will fail every update the control service sends it.
pub fn connect_failing_agent(service: &ControlService) -> Connection {
    let (control_end, agent_end) = duplex(LOOPBACK_BUFFER);
    service.register_transport(control_end);
    Connection::spawn(
        agent_end,
        Arc::new(FailingUpdateLocator),
        ProtocolConfig::default(),
    )
}

/// A bare loopback pair for protocol-level tests.
pub fn loopback() -> (DuplexStream, DuplexStream) {
    duplex(LOOPBACK_BUFFER)
}
