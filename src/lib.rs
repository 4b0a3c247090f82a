//! Volmesh - Container-Volume Orchestration Control Plane
//!
//! Volmesh is the control plane of a container-volume orchestration cluster.
//! A single control service accepts persistent connections from many
//! convergence agents, one per node. Agents push node-scoped state reports;
//! the control service merges them into the cluster state, broadcasts
//! configuration + state to every agent, and the agents drive their local
//! node toward convergence.
//!
//! # Architecture
//!
//! - **Wire codec** ([`wire`]): length-prefixed key/value frames with
//!   request/answer/error kinds, oversized-value chunking, and a
//!   self-describing document argument with per-pass encoding caching.
//! - **Connection protocol** ([`protocol`]): a symmetric per-connection
//!   state machine with command dispatch, outgoing-call tracking, liveness
//!   pinging and idle-abort enforcement.
//! - **Generational hashing** ([`generation`]) and **structural diffs**
//!   ([`diff`]): the negotiation machinery that lets the controller ship
//!   deltas instead of full snapshots.
//! - **Cluster-state store** ([`clusterstate`]): per-node, per-category
//!   contributions with activity-based expiration.
//! - **Broadcast engine** ([`control`]): batched, coalesced fan-out with a
//!   single in-flight send per connection and newest-wins supersession.
//! - **Agent responder** ([`agent`]): applies full or verified diff updates
//!   and surfaces them to the node's convergence loop.
//! - **TLS endpoints** ([`endpoint`]): the transport boundary.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use volmesh::{ConfigurationService, ControlService, ControlServiceConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let configuration = Arc::new(ConfigurationService::new());
//!     let service = ControlService::new(ControlServiceConfig::default(), configuration);
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:4524").await?;
//!     let tls = volmesh::endpoint::control_tls_config(
//!         volmesh::endpoint::load_certs("control.crt".as_ref())?,
//!         volmesh::endpoint::load_private_key("control.key".as_ref())?,
//!         volmesh::endpoint::load_certs("cluster-ca.crt".as_ref())?,
//!     )?;
//!     volmesh::endpoint::serve_control(service, listener, tls).await?;
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod clusterstate;
pub mod config;
pub mod configuration;
pub mod control;
pub mod diff;
pub mod endpoint;
pub mod error;
pub mod generation;
pub mod model;
pub mod protocol;
pub mod wire;

pub use agent::{AgentService, ControlPeer, ConvergenceAgent};
pub use clusterstate::ClusterStateStore;
pub use config::{ControlServiceConfig, ProtocolConfig};
pub use configuration::ConfigurationService;
pub use control::ControlService;
pub use diff::{apply_diff, create_diff, Diff};
pub use error::{VolmeshError, VolmeshResult};
pub use generation::{generation_hash, GenerationHash};
pub use model::{
    Application, Dataset, Deployment, DeploymentState, DockerImage, Manifestation, Node,
    NodeState, NonManifestDatasets, StateChange,
};
pub use protocol::{CommandError, CommandLocator, Connection, ConnectionState};
