use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::RingError;
use crate::net::transport::Transport;
use crate::ring::id::{Address, Id};
use crate::ring::node::Node;

/// In-process transport: a registry of nodes reachable by endpoint, calls
/// delivered as direct method invocations.
///
/// This is the substitutable counterpart of the gRPC transport for tests and
/// single-process simulations: rings of any size can be built without
/// sockets, and a crash is simulated by unregistering a node. Targets that
/// are absent or no longer active fail with [`RingError::PeerUnreachable`],
/// exactly like a dead peer on the network.
pub struct LocalNetwork {
    nodes: Mutex<HashMap<String, Arc<Node>>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: Mutex::new(HashMap::new()),
        })
    }

    pub fn register(&self, node: &Arc<Node>) {
        let mut nodes = self.nodes.lock().expect("registry poisoned");
        nodes.insert(node.address().endpoint(), Arc::clone(node));
    }

    /// Drops a node from the registry, making it unreachable — the local
    /// equivalent of a crash.
    pub fn unregister(&self, addr: &Address) {
        let mut nodes = self.nodes.lock().expect("registry poisoned");
        nodes.remove(&addr.endpoint());
    }

    fn resolve(&self, peer: &Address) -> Result<Arc<Node>, RingError> {
        let nodes = self.nodes.lock().expect("registry poisoned");
        nodes
            .get(&peer.endpoint())
            .cloned()
            .ok_or_else(|| RingError::PeerUnreachable(format!("{peer}: connection refused")))
    }

    async fn target(&self, peer: &Address) -> Result<Arc<Node>, RingError> {
        let node = self.resolve(peer)?;
        if !node.is_active().await {
            return Err(RingError::PeerUnreachable(format!(
                "{peer}: not answering"
            )));
        }
        Ok(node)
    }
}

/// A dead or failing peer on the wire shows up as unreachable, whatever the
/// callee-side reason was; only identifier-width defects keep their type.
fn as_remote<T>(peer: &Address, result: Result<T, RingError>) -> Result<T, RingError> {
    result.map_err(|e| match e {
        RingError::InvalidIdentifier(msg) => RingError::InvalidIdentifier(msg),
        other => RingError::PeerUnreachable(format!("{peer}: {other}")),
    })
}

#[async_trait]
impl Transport for LocalNetwork {
    async fn find_successor(&self, peer: &Address, id: Id) -> Result<Address, RingError> {
        let node = self.target(peer).await?;
        as_remote(peer, node.find_successor(id).await)
    }

    async fn get_predecessor(&self, peer: &Address) -> Result<Option<Address>, RingError> {
        let node = self.target(peer).await?;
        Ok(node.predecessor().await)
    }

    async fn notify(&self, peer: &Address, candidate: &Address) -> Result<bool, RingError> {
        let node = self.target(peer).await?;
        as_remote(peer, node.handle_notify(candidate.clone()).await)
    }

    async fn ping(&self, peer: &Address) -> Result<(), RingError> {
        let node = self.target(peer).await?;
        as_remote(peer, node.handle_ping().await)
    }

    async fn trace_successor(
        &self,
        peer: &Address,
        id: Id,
        hops: u32,
    ) -> Result<(Address, u32), RingError> {
        let node = self.target(peer).await?;
        as_remote(peer, node.trace_successor(id, hops).await)
    }
}
