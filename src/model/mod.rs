//! Cluster Document Model
//!
//! Value-typed documents exchanged between the control service and
//! convergence agents: the externally authored configuration (desired state)
//! and the aggregated deployment state (observed reality). Updates always
//! produce new documents; holders of a prior document keep an unchanged view.

mod deployment;
mod state;

pub use deployment::{Application, Deployment, DockerImage, Node};
pub use state::{
    Dataset, DeploymentState, Manifestation, NodeState, NonManifestDatasets, StateChange,
};
