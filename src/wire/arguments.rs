//! Argument codecs for command fields.
//!
//! Scalar helpers encode strings, integers, uuids and generation hashes as
//! single frame entries. `put_big`/`get_big` chunk an oversized encoding
//! across synthesized keys `name`, `name.2`, `name.3`, … so any logical
//! value fits through the per-entry wire ceiling, composing with any inner
//! encoding and mixing freely with regular fields in one frame. Cluster
//! documents travel as a self-describing tagged encoding checked against a
//! permitted-kind set on both directions.

use crate::config::MAX_VALUE_LENGTH;
use crate::diff::Diff;
use crate::error::{VolmeshError, VolmeshResult};
use crate::generation::GenerationHash;
use crate::model::{Deployment, DeploymentState, NodeState, NonManifestDatasets, StateChange};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use super::frame::FrameBox;

// ---------------------------------------------------------------------------
// Scalar fields

pub fn put_string(fields: &mut FrameBox, name: &str, value: &str) -> VolmeshResult<()> {
    fields.insert(name, value.as_bytes().to_vec())
}

pub fn get_string(fields: &FrameBox, name: &str) -> VolmeshResult<String> {
    let raw = fields.get(name).ok_or_else(|| VolmeshError::MissingArgument {
        name: name.to_string(),
    })?;
    String::from_utf8(raw.to_vec()).map_err(|_| VolmeshError::InvalidArgument {
        name: name.to_string(),
        reason: "not valid UTF-8".to_string(),
    })
}

pub fn put_u64(fields: &mut FrameBox, name: &str, value: u64) -> VolmeshResult<()> {
    fields.insert(name, value.to_string().into_bytes())
}

pub fn get_u64(fields: &FrameBox, name: &str) -> VolmeshResult<u64> {
    let text = get_string(fields, name)?;
    text.parse().map_err(|_| VolmeshError::InvalidArgument {
        name: name.to_string(),
        reason: format!("not a decimal integer: {text:?}"),
    })
}

pub fn put_uuid(fields: &mut FrameBox, name: &str, value: Uuid) -> VolmeshResult<()> {
    put_string(fields, name, &value.to_string())
}

pub fn get_uuid(fields: &FrameBox, name: &str) -> VolmeshResult<Uuid> {
    let text = get_string(fields, name)?;
    text.parse().map_err(|_| VolmeshError::InvalidArgument {
        name: name.to_string(),
        reason: format!("not a uuid: {text:?}"),
    })
}

pub fn put_generation(
    fields: &mut FrameBox,
    name: &str,
    value: GenerationHash,
) -> VolmeshResult<()> {
    put_string(fields, name, &value.to_string())
}

pub fn get_generation(fields: &FrameBox, name: &str) -> VolmeshResult<GenerationHash> {
    get_string(fields, name)?
        .parse()
        .map_err(|_| VolmeshError::InvalidArgument {
            name: name.to_string(),
            reason: "not a generation hash".to_string(),
        })
}

// ---------------------------------------------------------------------------
// Oversized values

/// Insert `encoded` under `name`, chunked across `name`, `name.2`, `name.3`,
/// … so each entry respects the per-value wire ceiling.
pub fn put_big(fields: &mut FrameBox, name: &str, encoded: &[u8]) -> VolmeshResult<()> {
    let mut chunks = encoded.chunks(MAX_VALUE_LENGTH);
    let first = chunks.next().unwrap_or_default();
    fields.insert(name, first.to_vec())?;
    for (index, chunk) in chunks.enumerate() {
        fields.insert(format!("{name}.{}", index + 2), chunk.to_vec())?;
    }
    Ok(())
}

/// Gather the chunks of `name` in numeric order and concatenate them.
pub fn get_big(fields: &FrameBox, name: &str) -> VolmeshResult<Vec<u8>> {
    let mut gathered = fields
        .get(name)
        .ok_or_else(|| VolmeshError::MissingArgument {
            name: name.to_string(),
        })?
        .to_vec();
    let mut index = 2usize;
    while let Some(chunk) = fields.get(&format!("{name}.{index}")) {
        gathered.extend_from_slice(chunk);
        index += 1;
    }
    Ok(gathered)
}

// ---------------------------------------------------------------------------
// Document argument

/// The self-describing wire form of a cluster document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum WireDocument {
    Deployment(Deployment),
    DeploymentState(DeploymentState),
    NodeState(NodeState),
    NonManifestDatasets(NonManifestDatasets),
    Diff(Diff),
}

/// The kind tag of a [`WireDocument`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Deployment,
    DeploymentState,
    NodeState,
    NonManifestDatasets,
    Diff,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Deployment => "deployment",
            DocumentKind::DeploymentState => "deployment_state",
            DocumentKind::NodeState => "node_state",
            DocumentKind::NonManifestDatasets => "non_manifest_datasets",
            DocumentKind::Diff => "diff",
        }
    }
}

impl WireDocument {
    pub fn kind(&self) -> DocumentKind {
        match self {
            WireDocument::Deployment(_) => DocumentKind::Deployment,
            WireDocument::DeploymentState(_) => DocumentKind::DeploymentState,
            WireDocument::NodeState(_) => DocumentKind::NodeState,
            WireDocument::NonManifestDatasets(_) => DocumentKind::NonManifestDatasets,
            WireDocument::Diff(_) => DocumentKind::Diff,
        }
    }
}

impl From<StateChange> for WireDocument {
    fn from(change: StateChange) -> Self {
        match change {
            StateChange::NodeState(state) => WireDocument::NodeState(state),
            StateChange::NonManifestDatasets(datasets) => {
                WireDocument::NonManifestDatasets(datasets)
            }
        }
    }
}

/// Codec for document-valued arguments, restricted to a permitted kind set.
///
/// Both serialize and deserialize verify membership; a value outside the set
/// is a type error, not a silent coercion.
#[derive(Debug, Clone, Copy)]
pub struct DocumentArgument {
    permitted: &'static [DocumentKind],
}

impl DocumentArgument {
    pub const fn new(permitted: &'static [DocumentKind]) -> Self {
        Self { permitted }
    }

    fn check(&self, kind: DocumentKind) -> VolmeshResult<()> {
        if self.permitted.contains(&kind) {
            Ok(())
        } else {
            Err(VolmeshError::WrongDocumentType {
                expected: self
                    .permitted
                    .iter()
                    .map(|k| k.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
                actual: kind.as_str().to_string(),
            })
        }
    }

    pub fn encode(&self, document: &WireDocument) -> VolmeshResult<Vec<u8>> {
        self.check(document.kind())?;
        Ok(serde_json::to_vec(document)?)
    }

    pub fn decode(&self, encoded: &[u8]) -> VolmeshResult<WireDocument> {
        let document: WireDocument = serde_json::from_slice(encoded)?;
        self.check(document.kind())?;
        Ok(document)
    }

    /// Encode a homogeneous-or-mixed list of documents, each checked against
    /// the permitted set.
    pub fn encode_list(&self, documents: &[WireDocument]) -> VolmeshResult<Vec<u8>> {
        for document in documents {
            self.check(document.kind())?;
        }
        Ok(serde_json::to_vec(documents)?)
    }

    pub fn decode_list(&self, encoded: &[u8]) -> VolmeshResult<Vec<WireDocument>> {
        let documents: Vec<WireDocument> = serde_json::from_slice(encoded)?;
        for document in &documents {
            self.check(document.kind())?;
        }
        Ok(documents)
    }
}

// ---------------------------------------------------------------------------
// Encoding cache

/// Memoizes document encodings for the duration of one broadcast pass.
///
/// Keyed by `Arc` identity: two encodes of the same shared document return
/// the same allocation, so every connection receiving a snapshot shares its
/// wire bytes. The cache is created per pass and dropped with it, so it can
/// never pin documents beyond the pass that used them.
#[derive(Debug, Default)]
pub struct EncodingCache {
    entries: Mutex<HashMap<(DocumentTag, usize), Arc<[u8]>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum DocumentTag {
    Configuration,
    State,
}

impl EncodingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn encode_deployment(&self, document: &Arc<Deployment>) -> VolmeshResult<Arc<[u8]>> {
        let key = (DocumentTag::Configuration, Arc::as_ptr(document) as usize);
        self.encode_keyed(key, || {
            Ok(serde_json::to_vec(&WireDocument::Deployment(
                Deployment::clone(document),
            ))?)
        })
    }

    pub fn encode_deployment_state(
        &self,
        document: &Arc<DeploymentState>,
    ) -> VolmeshResult<Arc<[u8]>> {
        let key = (DocumentTag::State, Arc::as_ptr(document) as usize);
        self.encode_keyed(key, || {
            Ok(serde_json::to_vec(&WireDocument::DeploymentState(
                DeploymentState::clone(document),
            ))?)
        })
    }

    fn encode_keyed(
        &self,
        key: (DocumentTag, usize),
        encode: impl FnOnce() -> VolmeshResult<Vec<u8>>,
    ) -> VolmeshResult<Arc<[u8]>> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(cached) = entries.get(&key) {
            return Ok(Arc::clone(cached));
        }
        let encoded: Arc<[u8]> = encode()?.into();
        entries.insert(key, Arc::clone(&encoded));
        Ok(encoded)
    }
}
