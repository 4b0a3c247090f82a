//! Command vocabulary.
//!
//! The six commands exchanged between the control service and convergence
//! agents, as typed request/reply structs with frame encode/decode. The
//! `trace_token` carried by the heavier commands is an opaque tracing token
//! propagated into the remote handler's span; it plays no part in
//! correctness.

use crate::diff::Diff;
use crate::error::{VolmeshError, VolmeshResult};
use crate::generation::GenerationHash;
use crate::model::{Deployment, DeploymentState, StateChange};
use std::sync::Arc;
use uuid::Uuid;

use super::arguments::{
    self, DocumentArgument, DocumentKind, EncodingCache, WireDocument,
};
use super::frame::{Frame, FrameBox};

/// The compatibility gate returned by `Version`.
pub const PROTOCOL_MAJOR_VERSION: u64 = 1;

const VERSION: &str = "Version";
const NO_OP: &str = "NoOp";
const SET_NODE_ERA: &str = "SetNodeEra";
const NODE_STATE: &str = "NodeState";
const CLUSTER_STATUS: &str = "ClusterStatus";
const CLUSTER_STATUS_DIFF: &str = "ClusterStatusDiff";

const STATE_CHANGE_ARGUMENT: DocumentArgument = DocumentArgument::new(&[
    DocumentKind::NodeState,
    DocumentKind::NonManifestDatasets,
]);
const CONFIGURATION_ARGUMENT: DocumentArgument =
    DocumentArgument::new(&[DocumentKind::Deployment]);
const STATE_ARGUMENT: DocumentArgument =
    DocumentArgument::new(&[DocumentKind::DeploymentState]);
const DIFF_ARGUMENT: DocumentArgument = DocumentArgument::new(&[DocumentKind::Diff]);

/// `SetNodeEra`: an agent announces its incarnation for a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetNodeEraRequest {
    pub node_uuid: Uuid,
    pub era: Uuid,
}

/// `NodeState`: an agent reports the categories of state it owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStateRequest {
    pub state_changes: Vec<StateChange>,
    pub trace_token: String,
}

/// `ClusterStatus`: the control service ships a full snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterStatusRequest {
    pub configuration: Arc<Deployment>,
    pub configuration_generation: GenerationHash,
    pub state: Arc<DeploymentState>,
    pub state_generation: GenerationHash,
    pub trace_token: String,
}

/// `ClusterStatusDiff`: the control service ships deltas keyed on the
/// generations the peer last acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterStatusDiffRequest {
    pub configuration_diff: Diff,
    pub start_configuration_generation: GenerationHash,
    pub end_configuration_generation: GenerationHash,
    pub state_diff: Diff,
    pub start_state_generation: GenerationHash,
    pub end_state_generation: GenerationHash,
    pub trace_token: String,
}

/// A command one side asks the other to dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Version,
    NoOp,
    SetNodeEra(SetNodeEraRequest),
    NodeState(NodeStateRequest),
    ClusterStatus(ClusterStatusRequest),
    ClusterStatusDiff(ClusterStatusDiffRequest),
}

impl Request {
    pub fn command_name(&self) -> &'static str {
        match self {
            Request::Version => VERSION,
            Request::NoOp => NO_OP,
            Request::SetNodeEra(_) => SET_NODE_ERA,
            Request::NodeState(_) => NODE_STATE,
            Request::ClusterStatus(_) => CLUSTER_STATUS,
            Request::ClusterStatusDiff(_) => CLUSTER_STATUS_DIFF,
        }
    }

    /// Encode into a request frame. The encoding cache, when supplied,
    /// memoizes the document payloads by identity for the current broadcast
    /// pass.
    pub fn to_frame(&self, tag: u64, cache: Option<&EncodingCache>) -> VolmeshResult<Frame> {
        let mut fields = FrameBox::new();
        match self {
            Request::Version | Request::NoOp => {}
            Request::SetNodeEra(request) => {
                arguments::put_uuid(&mut fields, "node_uuid", request.node_uuid)?;
                arguments::put_uuid(&mut fields, "era", request.era)?;
            }
            Request::NodeState(request) => {
                let documents: Vec<WireDocument> = request
                    .state_changes
                    .iter()
                    .cloned()
                    .map(WireDocument::from)
                    .collect();
                let encoded = STATE_CHANGE_ARGUMENT.encode_list(&documents)?;
                arguments::put_big(&mut fields, "state_changes", &encoded)?;
                arguments::put_string(&mut fields, "trace_token", &request.trace_token)?;
            }
            Request::ClusterStatus(request) => {
                let configuration = match cache {
                    Some(cache) => cache.encode_deployment(&request.configuration)?,
                    None => CONFIGURATION_ARGUMENT
                        .encode(&WireDocument::Deployment(Deployment::clone(
                            &request.configuration,
                        )))?
                        .into(),
                };
                let state = match cache {
                    Some(cache) => cache.encode_deployment_state(&request.state)?,
                    None => STATE_ARGUMENT
                        .encode(&WireDocument::DeploymentState(DeploymentState::clone(
                            &request.state,
                        )))?
                        .into(),
                };
                arguments::put_big(&mut fields, "configuration", &configuration)?;
                arguments::put_generation(
                    &mut fields,
                    "configuration_generation",
                    request.configuration_generation,
                )?;
                arguments::put_big(&mut fields, "state", &state)?;
                arguments::put_generation(
                    &mut fields,
                    "state_generation",
                    request.state_generation,
                )?;
                arguments::put_string(&mut fields, "trace_token", &request.trace_token)?;
            }
            Request::ClusterStatusDiff(request) => {
                let configuration_diff =
                    DIFF_ARGUMENT.encode(&WireDocument::Diff(request.configuration_diff.clone()))?;
                let state_diff =
                    DIFF_ARGUMENT.encode(&WireDocument::Diff(request.state_diff.clone()))?;
                arguments::put_big(&mut fields, "configuration_diff", &configuration_diff)?;
                arguments::put_generation(
                    &mut fields,
                    "start_configuration_generation",
                    request.start_configuration_generation,
                )?;
                arguments::put_generation(
                    &mut fields,
                    "end_configuration_generation",
                    request.end_configuration_generation,
                )?;
                arguments::put_big(&mut fields, "state_diff", &state_diff)?;
                arguments::put_generation(
                    &mut fields,
                    "start_state_generation",
                    request.start_state_generation,
                )?;
                arguments::put_generation(
                    &mut fields,
                    "end_state_generation",
                    request.end_state_generation,
                )?;
                arguments::put_string(&mut fields, "trace_token", &request.trace_token)?;
            }
        }
        Ok(Frame::Request {
            command: self.command_name().to_string(),
            tag,
            fields,
        })
    }

    /// Decode a dispatched request frame.
    pub fn from_frame(command: &str, fields: &FrameBox) -> VolmeshResult<Request> {
        match command {
            VERSION => Ok(Request::Version),
            NO_OP => Ok(Request::NoOp),
            SET_NODE_ERA => Ok(Request::SetNodeEra(SetNodeEraRequest {
                node_uuid: arguments::get_uuid(fields, "node_uuid")?,
                era: arguments::get_uuid(fields, "era")?,
            })),
            NODE_STATE => {
                let encoded = arguments::get_big(fields, "state_changes")?;
                let documents = STATE_CHANGE_ARGUMENT.decode_list(&encoded)?;
                let state_changes = documents
                    .into_iter()
                    .map(|document| match document {
                        WireDocument::NodeState(state) => Ok(StateChange::NodeState(state)),
                        WireDocument::NonManifestDatasets(datasets) => {
                            Ok(StateChange::NonManifestDatasets(datasets))
                        }
                        other => Err(VolmeshError::WrongDocumentType {
                            expected: "node_state, non_manifest_datasets".to_string(),
                            actual: other.kind().as_str().to_string(),
                        }),
                    })
                    .collect::<VolmeshResult<Vec<_>>>()?;
                Ok(Request::NodeState(NodeStateRequest {
                    state_changes,
                    trace_token: arguments::get_string(fields, "trace_token")?,
                }))
            }
            CLUSTER_STATUS => {
                let configuration = arguments::get_big(fields, "configuration")?;
                let configuration = match CONFIGURATION_ARGUMENT.decode(&configuration)? {
                    WireDocument::Deployment(deployment) => deployment,
                    other => {
                        return Err(VolmeshError::WrongDocumentType {
                            expected: "deployment".to_string(),
                            actual: other.kind().as_str().to_string(),
                        })
                    }
                };
                let state = arguments::get_big(fields, "state")?;
                let state = match STATE_ARGUMENT.decode(&state)? {
                    WireDocument::DeploymentState(state) => state,
                    other => {
                        return Err(VolmeshError::WrongDocumentType {
                            expected: "deployment_state".to_string(),
                            actual: other.kind().as_str().to_string(),
                        })
                    }
                };
                Ok(Request::ClusterStatus(ClusterStatusRequest {
                    configuration: Arc::new(configuration),
                    configuration_generation: arguments::get_generation(
                        fields,
                        "configuration_generation",
                    )?,
                    state: Arc::new(state),
                    state_generation: arguments::get_generation(fields, "state_generation")?,
                    trace_token: arguments::get_string(fields, "trace_token")?,
                }))
            }
            CLUSTER_STATUS_DIFF => {
                let configuration_diff = decode_diff(fields, "configuration_diff")?;
                let state_diff = decode_diff(fields, "state_diff")?;
                Ok(Request::ClusterStatusDiff(ClusterStatusDiffRequest {
                    configuration_diff,
                    start_configuration_generation: arguments::get_generation(
                        fields,
                        "start_configuration_generation",
                    )?,
                    end_configuration_generation: arguments::get_generation(
                        fields,
                        "end_configuration_generation",
                    )?,
                    state_diff,
                    start_state_generation: arguments::get_generation(
                        fields,
                        "start_state_generation",
                    )?,
                    end_state_generation: arguments::get_generation(
                        fields,
                        "end_state_generation",
                    )?,
                    trace_token: arguments::get_string(fields, "trace_token")?,
                }))
            }
            other => Err(VolmeshError::InvalidArgument {
                name: "_command".to_string(),
                reason: format!("unknown command {other:?}"),
            }),
        }
    }
}

fn decode_diff(fields: &FrameBox, name: &str) -> VolmeshResult<Diff> {
    let encoded = arguments::get_big(fields, name)?;
    match DIFF_ARGUMENT.decode(&encoded)? {
        WireDocument::Diff(diff) => Ok(diff),
        other => Err(VolmeshError::WrongDocumentType {
            expected: "diff".to_string(),
            actual: other.kind().as_str().to_string(),
        }),
    }
}

/// The generations an agent reports holding after an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationsReply {
    pub current_configuration_generation: GenerationHash,
    pub current_state_generation: GenerationHash,
}

/// The successful result of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `Version` result
    Version { major: u64 },

    /// Empty result map
    Empty,

    /// `ClusterStatus` / `ClusterStatusDiff` result
    Generations(GenerationsReply),
}

impl Reply {
    pub fn to_box(&self) -> VolmeshResult<FrameBox> {
        let mut fields = FrameBox::new();
        match self {
            Reply::Version { major } => arguments::put_u64(&mut fields, "major", *major)?,
            Reply::Empty => {}
            Reply::Generations(reply) => {
                arguments::put_generation(
                    &mut fields,
                    "current_configuration_generation",
                    reply.current_configuration_generation,
                )?;
                arguments::put_generation(
                    &mut fields,
                    "current_state_generation",
                    reply.current_state_generation,
                )?;
            }
        }
        Ok(fields)
    }

    /// Decode an answer, shaped by the command it answers.
    pub fn from_box(command: &str, fields: &FrameBox) -> VolmeshResult<Reply> {
        match command {
            VERSION => Ok(Reply::Version {
                major: arguments::get_u64(fields, "major")?,
            }),
            CLUSTER_STATUS | CLUSTER_STATUS_DIFF => Ok(Reply::Generations(GenerationsReply {
                current_configuration_generation: arguments::get_generation(
                    fields,
                    "current_configuration_generation",
                )?,
                current_state_generation: arguments::get_generation(
                    fields,
                    "current_state_generation",
                )?,
            })),
            _ => Ok(Reply::Empty),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::generation_hash;
    use crate::model::{Application, DockerImage, Node, NodeState};

    fn round_trip(request: Request) -> Request {
        let frame = request.to_frame(1, None).unwrap();
        let mut decoder = super::super::frame::FrameDecoder::new();
        decoder.feed(&frame.encode().unwrap());
        match decoder.next_frame().unwrap().unwrap() {
            Frame::Request {
                command, fields, ..
            } => Request::from_frame(&command, &fields).unwrap(),
            other => panic!("expected request frame, got {other:?}"),
        }
    }

    #[test]
    fn set_node_era_round_trips() {
        let request = Request::SetNodeEra(SetNodeEraRequest {
            node_uuid: Uuid::from_u128(3),
            era: Uuid::from_u128(4),
        });
        assert_eq!(round_trip(request.clone()), request);
    }

    #[test]
    fn node_state_round_trips_mixed_changes() {
        let state = NodeState::new(Uuid::from_u128(8), "192.0.2.17").with_applications([
            Application::new("myapp", DockerImage::from_string("postgresql")),
        ]);
        let request = Request::NodeState(NodeStateRequest {
            state_changes: vec![
                StateChange::NodeState(state),
                StateChange::NonManifestDatasets(Default::default()),
            ],
            trace_token: "trace-1".to_string(),
        });
        assert_eq!(round_trip(request.clone()), request);
    }

    #[test]
    fn cluster_status_round_trips() {
        let configuration = Arc::new(Deployment::new([Node::new(
            Uuid::from_u128(1),
            "node1.example.com",
        )]));
        let state = Arc::new(DeploymentState::default());
        let request = Request::ClusterStatus(ClusterStatusRequest {
            configuration_generation: generation_hash(configuration.as_ref()).unwrap(),
            state_generation: generation_hash(state.as_ref()).unwrap(),
            configuration,
            state,
            trace_token: "trace-2".to_string(),
        });
        assert_eq!(round_trip(request.clone()), request);
    }

    #[test]
    fn version_reply_round_trips() {
        let reply = Reply::Version {
            major: PROTOCOL_MAJOR_VERSION,
        };
        let fields = reply.to_box().unwrap();
        assert_eq!(Reply::from_box(VERSION, &fields).unwrap(), reply);
    }
}
