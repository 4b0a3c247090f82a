//! Wire Codec
//!
//! The framed command protocol spoken between the control service and
//! convergence agents: length-prefixed key/value frames, oversized-value
//! chunking, and the self-describing document argument with its per-pass
//! encoding cache.

pub mod arguments;
pub mod commands;
pub mod frame;

pub use arguments::{DocumentArgument, DocumentKind, EncodingCache, WireDocument};
pub use commands::{
    ClusterStatusDiffRequest, ClusterStatusRequest, GenerationsReply, NodeStateRequest, Reply,
    Request, SetNodeEraRequest, PROTOCOL_MAJOR_VERSION,
};
pub use frame::{Frame, FrameBox, FrameDecoder, MAX_KEY_LENGTH};
