use async_trait::async_trait;

use crate::error::RingError;
use crate::ring::id::{Address, Id};

/// The remote-invocation seam between ring nodes.
///
/// A node only ever talks to peers through this trait, so the gRPC transport
/// and the in-process transport are interchangeable. Implementations must
/// bound every call with a timeout and report connection failures and
/// timeouts as [`RingError::PeerUnreachable`]; a call never hangs.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Asks `peer` to resolve the node responsible for `id`.
    async fn find_successor(&self, peer: &Address, id: Id) -> Result<Address, RingError>;

    /// Asks `peer` for its current predecessor.
    async fn get_predecessor(&self, peer: &Address) -> Result<Option<Address>, RingError>;

    /// Tells `peer` that `candidate` may be its predecessor. Returns whether
    /// the peer adopted the candidate.
    async fn notify(&self, peer: &Address, candidate: &Address) -> Result<bool, RingError>;

    /// Liveness probe.
    async fn ping(&self, peer: &Address) -> Result<(), RingError>;

    /// `find_successor` with a hop counter carried along the forwarding
    /// chain; returns the responsible node and the total hops taken.
    async fn trace_successor(
        &self,
        peer: &Address,
        id: Id,
        hops: u32,
    ) -> Result<(Address, u32), RingError>;
}
