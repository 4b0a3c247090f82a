//! Agent Responder
//!
//! The node-local side of the protocol: accepts full or diff cluster
//! updates under generation verification, surfaces them to the local
//! convergence loop, and reports node state back to the control service.

use crate::diff::apply_diff;
use crate::error::{VolmeshError, VolmeshResult};
use crate::generation::{generation_hash, GenerationHash};
use crate::model::{Deployment, DeploymentState, StateChange};
use crate::protocol::{CommandError, CommandLocator, Connection};
use crate::wire::{GenerationsReply, Reply, Request, SetNodeEraRequest, PROTOCOL_MAJOR_VERSION};
use crate::wire::{ClusterStatusDiffRequest, ClusterStatusRequest, NodeStateRequest};
use crate::config::ProtocolConfig;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info_span, warn};
use uuid::Uuid;

/// The seam between this protocol core and the node's convergence engine.
///
/// Implementations drive the local node toward the configuration whenever
/// `cluster_updated` delivers fresh documents.
#[async_trait]
pub trait ConvergenceAgent: Send + Sync + 'static {
    /// A connection to the control service is up.
    async fn connected(&self, control: ControlPeer);

    /// The connection died. A later `connected` call may follow.
    async fn disconnected(&self);

    /// The cluster documents changed: `configuration` is what the cluster
    /// should look like, `state` what it currently looks like.
    async fn cluster_updated(
        &self,
        configuration: Arc<Deployment>,
        state: Arc<DeploymentState>,
    );
}

/// Handle the convergence loop uses to talk back to the control service.
#[derive(Clone)]
pub struct ControlPeer {
    connection: Connection,
}

impl ControlPeer {
    /// Check protocol compatibility with the control service.
    pub async fn version_handshake(&self) -> VolmeshResult<u64> {
        match self.connection.call_remote(Request::Version).await? {
            Reply::Version {
                major: PROTOCOL_MAJOR_VERSION,
            } => Ok(PROTOCOL_MAJOR_VERSION),
            Reply::Version { major } => {
                Err(VolmeshError::UnsupportedProtocolVersion { major })
            }
            other => Err(VolmeshError::InvalidArgument {
                name: "major".to_string(),
                reason: format!("unexpected version reply {other:?}"),
            }),
        }
    }

    /// Announce this agent's incarnation for its node.
    pub async fn announce_era(&self, node_uuid: Uuid, era: Uuid) -> VolmeshResult<()> {
        self.connection
            .call_remote(Request::SetNodeEra(SetNodeEraRequest { node_uuid, era }))
            .await?;
        Ok(())
    }

    /// Report the state categories this node owns, advertising membership
    /// and liveness.
    pub async fn report_state(&self, state_changes: Vec<StateChange>) -> VolmeshResult<()> {
        self.connection
            .call_remote(Request::NodeState(NodeStateRequest {
                state_changes,
                trace_token: Uuid::new_v4().to_string(),
            }))
            .await?;
        Ok(())
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }
}

/// What the agent currently holds, with the generations that prove it.
struct Held {
    configuration: Arc<Deployment>,
    configuration_generation: GenerationHash,
    state: Arc<DeploymentState>,
    state_generation: GenerationHash,
}

impl Held {
    /// Before the first snapshot lands the agent holds the empty documents.
    fn empty() -> VolmeshResult<Self> {
        let configuration = Arc::new(Deployment::default());
        let state = Arc::new(DeploymentState::default());
        Ok(Self {
            configuration_generation: generation_hash(configuration.as_ref())?,
            state_generation: generation_hash(state.as_ref())?,
            configuration,
            state,
        })
    }

    fn generations(&self) -> GenerationsReply {
        GenerationsReply {
            current_configuration_generation: self.configuration_generation,
            current_state_generation: self.state_generation,
        }
    }
}

/// The agent-side protocol service: dispatches cluster updates and exposes
/// the held generations.
#[derive(Clone)]
pub struct AgentService {
    inner: Arc<AgentInner>,
}

struct AgentInner {
    agent: Arc<dyn ConvergenceAgent>,
    held: Mutex<Held>,
}

impl AgentService {
    pub fn new(agent: Arc<dyn ConvergenceAgent>) -> VolmeshResult<Self> {
        Ok(Self {
            inner: Arc::new(AgentInner {
                agent,
                held: Mutex::new(Held::empty()?),
            }),
        })
    }

    /// The dispatch table this agent answers the control service with.
    /// Exposed so harnesses can interpose on it.
    pub fn locator(&self) -> Arc<dyn CommandLocator> {
        Arc::new(AgentLocator {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Speak the protocol over an established transport to the control
    /// service. Notifies the agent of the connection and of its loss.
    pub async fn spawn_on<T>(&self, transport: T, config: ProtocolConfig) -> Connection
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let connection = Connection::spawn(transport, self.locator(), config);

        let agent = Arc::clone(&self.inner.agent);
        connection.on_disconnect(move |_| {
            tokio::spawn(async move {
                agent.disconnected().await;
            });
        });
        self.inner
            .agent
            .connected(ControlPeer {
                connection: connection.clone(),
            })
            .await;
        connection
    }

    /// The generations of the documents currently held.
    pub fn held_generations(&self) -> (GenerationHash, GenerationHash) {
        let held = self.inner.held.lock().unwrap_or_else(|e| e.into_inner());
        (held.configuration_generation, held.state_generation)
    }

    /// The configuration document currently held.
    pub fn held_configuration(&self) -> Arc<Deployment> {
        let held = self.inner.held.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&held.configuration)
    }

    /// The state document currently held.
    pub fn held_state(&self) -> Arc<DeploymentState> {
        let held = self.inner.held.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&held.state)
    }

    /// Force the held generations, desynchronizing the agent from the
    /// controller. Test instrumentation for the diff-rejection path.
    pub fn corrupt_held_generations(
        &self,
        configuration_generation: GenerationHash,
        state_generation: GenerationHash,
    ) {
        let mut held = self.inner.held.lock().unwrap_or_else(|e| e.into_inner());
        held.configuration_generation = configuration_generation;
        held.state_generation = state_generation;
    }
}

/// Dispatch table for commands the control service sends to an agent.
struct AgentLocator {
    inner: Arc<AgentInner>,
}

impl AgentInner {
    async fn handle_cluster_status(
        &self,
        request: ClusterStatusRequest,
    ) -> Result<Reply, CommandError> {
        let span = info_span!("cluster_status", trace_token = %request.trace_token);
        let _entered = span.enter();

        let generations = {
            let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
            *held = Held {
                configuration: Arc::clone(&request.configuration),
                configuration_generation: request.configuration_generation,
                state: Arc::clone(&request.state),
                state_generation: request.state_generation,
            };
            held.generations()
        };
        drop(_entered);
        self.agent
            .cluster_updated(request.configuration, request.state)
            .await;
        Ok(Reply::Generations(generations))
    }

    async fn handle_cluster_status_diff(
        &self,
        request: ClusterStatusDiffRequest,
    ) -> Result<Reply, CommandError> {
        let span = info_span!("cluster_status_diff", trace_token = %request.trace_token);

        enum Outcome {
            Applied(Arc<Deployment>, Arc<DeploymentState>, GenerationsReply),
            Mismatch(GenerationsReply),
        }

        let outcome = {
            let _entered = span.enter();
            let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
            let start_matches = held.configuration_generation
                == request.start_configuration_generation
                && held.state_generation == request.start_state_generation;
            if !start_matches {
                // The controller diffed from documents we do not hold;
                // answer with what we actually have and touch nothing.
                debug!(
                    held_configuration = %held.configuration_generation,
                    offered_start = %request.start_configuration_generation,
                    "rejecting diff from unknown base"
                );
                Outcome::Mismatch(held.generations())
            } else {
                let configuration =
                    apply_diff(held.configuration.as_ref(), &request.configuration_diff)
                        .map_err(|error| CommandError::failed(error.to_string()))?;
                let state = apply_diff(held.state.as_ref(), &request.state_diff)
                    .map_err(|error| CommandError::failed(error.to_string()))?;
                let configuration = Arc::new(configuration);
                let state = Arc::new(state);
                *held = Held {
                    configuration: Arc::clone(&configuration),
                    configuration_generation: request.end_configuration_generation,
                    state: Arc::clone(&state),
                    state_generation: request.end_state_generation,
                };
                Outcome::Applied(configuration, state, held.generations())
            }
        };

        match outcome {
            Outcome::Applied(configuration, state, generations) => {
                self.agent.cluster_updated(configuration, state).await;
                Ok(Reply::Generations(generations))
            }
            Outcome::Mismatch(generations) => Ok(Reply::Generations(generations)),
        }
    }
}

#[async_trait]
impl CommandLocator for AgentLocator {
    async fn dispatch(&self, request: Request) -> Result<Reply, CommandError> {
        match request {
            Request::NoOp => Ok(Reply::Empty),
            Request::ClusterStatus(request) => self.inner.handle_cluster_status(request).await,
            Request::ClusterStatusDiff(request) => {
                self.inner.handle_cluster_status_diff(request).await
            }
            other @ (Request::Version | Request::SetNodeEra(_) | Request::NodeState(_)) => {
                warn!(command = other.command_name(), "command not dispatched on agents");
                Err(CommandError::unhandled(other.command_name()))
            }
        }
    }
}
