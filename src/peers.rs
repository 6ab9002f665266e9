//! Provides the routing and transport seams of a cache group.
//!
//! A [Group](crate::group::Group) doesn't know anything about clusters or wire protocols. All it
//! needs is a [NodeSelector](NodeSelector) which answers "who owns this key?" and, in case the
//! owner is a remote peer, a [NodeGetter](NodeGetter) which can fetch the value from over there.
//!
//! The reference implementation of both traits lives in [http](crate::http) - but any transport
//! which can move bytes for a *(group, key)* pair qualifies (gRPC, a unix socket, a channel to
//! an in-process test double, ...).
use async_trait::async_trait;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Enumerates the possible errors when fetching a value from a peer.
#[derive(Debug)]
pub enum FetchError {
    /// Represents an unusable request URL. As group and key are percent-encoded, this can only
    /// stem from a broken node address - a misconfiguration rather than a runtime condition.
    InvalidUrl(hyper::http::uri::InvalidUri),

    /// Represents a transport level failure - the peer could not be reached at all or the
    /// connection broke down mid-request.
    Unreachable(hyper::Error),

    /// Represents a response with a non-OK status. The peer was reachable but refused to
    /// deliver a value (e.g. because the group is not registered over there or its loader
    /// failed).
    BadStatus(hyper::StatusCode),

    /// Represents a failure while reading the response payload.
    Body(hyper::Error),
}

impl Display for FetchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::InvalidUrl(e) => write!(f, "Invalid peer URL: {}", e),
            FetchError::Unreachable(e) => write!(f, "Peer not reachable: {}", e),
            FetchError::BadStatus(status) => write!(f, "Peer returned: {}", status),
            FetchError::Body(e) => write!(f, "Failed to read peer response: {}", e),
        }
    }
}

impl Error for FetchError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            FetchError::InvalidUrl(e) => Some(e),
            FetchError::Unreachable(e) => Some(e),
            FetchError::BadStatus(_) => None,
            FetchError::Body(e) => Some(e),
        }
    }
}

/// Fetches a cached value from a single remote peer.
///
/// Implementations wrap whatever transport connects two nodes. The returned bytes are the raw
/// value - the remote side already unwrapped any protocol framing.
#[async_trait]
pub trait NodeGetter: Send + Sync {
    /// Fetches the value for the given key of the given group from the peer.
    async fn fetch(&self, group: &str, key: &str) -> Result<Vec<u8>, FetchError>;
}

/// Determines which node owns a given key.
///
/// Returning **None** signals "handle the key locally". This deliberately covers both the case
/// of an empty ring (no peers at all) and the case where the local node itself owns the key -
/// otherwise a node would end up performing an RPC loop to itself.
pub trait NodeSelector: Send + Sync {
    /// Selects the peer owning the given key or **None** if the key should be handled locally.
    fn select_node(&self, key: &str) -> Option<Arc<dyn NodeGetter>>;
}
