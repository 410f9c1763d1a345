//! Error types for the mesh engine.

use crate::radio::RadioError;
use thiserror::Error;

/// Errors reported synchronously, before an operation is started.
///
/// Protocol-level outcomes (timeouts, remote rejections) are delivered
/// through the operation's completion as a [`Status`](crate::node::Status)
/// instead; see the error taxonomy in the crate docs.
#[derive(Error, Debug)]
pub enum MeshError {
    /// The node is not joined to a mesh
    #[error("not joined to a mesh")]
    NotOnMesh,

    /// Another operation is already in flight
    #[error("another operation is in flight")]
    Busy,

    /// A join is already in progress
    #[error("a join is already in progress")]
    AlreadyJoining,

    /// Node id outside the 1-255 logical address range
    #[error("invalid node id {0} (valid range 1-255)")]
    InvalidNodeId(u8),

    /// Register name empty or over the frame budget
    #[error("register name is empty or too long")]
    InvalidRegisterName,

    /// Combined register name and value cannot fit a frame
    #[error("register name and value exceed the frame payload budget")]
    RegisterTooLarge,

    /// Two registers on one node may not share a name
    #[error("duplicate register name {0:?}")]
    DuplicateRegisterName(String),

    /// Radio transport failure
    #[error("radio error: {0}")]
    Radio(#[from] RadioError),
}
