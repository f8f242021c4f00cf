use crate::component::BackendFailures;
use crate::tree::NodeId;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("tree already has a head node")]
    HeadAlreadySet,

    #[error("graph has no head -- construct it with a root node first")]
    Unrooted,

    #[error("node {0:?} is not live in this tree")]
    InvalidNode(NodeId),

    #[error("node depth {found} does not follow its parent (expected {expected})")]
    DepthMismatch { expected: u32, found: u32 },

    #[error("{0}")]
    Backend(#[from] BackendFailures),

    #[error("transport failed: {0}")]
    Transport(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
