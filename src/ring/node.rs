use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::RingConfig;
use crate::error::RingError;
use crate::net::transport::Transport;
use crate::ring::id::{Address, Id, KeySpace};

/// Lifecycle of a ring node: constructed, participating, gone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Active,
    Left,
}

/// The topology state of one node. Everything in here is guarded by a single
/// exclusive lock so a concurrent reader never observes a torn update; the
/// lock is never held across an await point.
struct RingState {
    lifecycle: Lifecycle,
    predecessor: Option<Address>,
    /// fingers[i] routes to the successor of (n + 2^i); fingers[0] always
    /// mirrors the head of `successors`.
    fingers: Vec<Option<Address>>,
    /// Live successors, immediate first, at most k entries.
    successors: Vec<Address>,
    /// Round-robin cursor for fix_fingers.
    next_finger: u32,
}

/// A Chord ring node: identity, routing state, and the protocol state
/// machine. Peers reach it through a [`Transport`] server; it reaches peers
/// through the [`Transport`] it was constructed with.
pub struct Node {
    addr: Address,
    space: KeySpace,
    config: RingConfig,
    transport: Arc<dyn Transport>,
    state: Mutex<RingState>,
}

impl Node {
    pub fn new(
        config: RingConfig,
        host: impl Into<String>,
        port: u16,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>, RingError> {
        config.validate()?;
        let space = KeySpace::new(config.bits)?;
        let addr = Address::new(&space, host, port);
        let state = RingState {
            lifecycle: Lifecycle::Uninitialized,
            predecessor: None,
            fingers: vec![None; config.bits as usize],
            successors: Vec::new(),
            next_finger: 0,
        };
        Ok(Arc::new(Self {
            addr,
            space,
            config,
            transport,
            state: Mutex::new(state),
        }))
    }

    pub fn address(&self) -> &Address {
        &self.addr
    }

    pub fn space(&self) -> &KeySpace {
        &self.space
    }

    pub fn config(&self) -> &RingConfig {
        &self.config
    }

    pub async fn lifecycle(&self) -> Lifecycle {
        self.state.lock().await.lifecycle
    }

    pub async fn is_active(&self) -> bool {
        self.lifecycle().await == Lifecycle::Active
    }

    /// Current predecessor, if known.
    pub async fn predecessor(&self) -> Option<Address> {
        self.state.lock().await.predecessor.clone()
    }

    /// Immediate successor (present whenever the node is active).
    pub async fn successor(&self) -> Option<Address> {
        self.state.lock().await.successors.first().cloned()
    }

    pub async fn successor_list(&self) -> Vec<Address> {
        self.state.lock().await.successors.clone()
    }

    pub async fn fingers(&self) -> Vec<Option<Address>> {
        self.state.lock().await.fingers.clone()
    }

    // Lifecycle transitions

    /// Starts a brand-new ring with this node as its only member.
    pub async fn create(&self) -> Result<(), RingError> {
        let mut state = self.state.lock().await;
        if state.lifecycle != Lifecycle::Uninitialized {
            return Err(RingError::InvalidState(format!(
                "{} is already part of a ring",
                self.addr
            )));
        }
        state.lifecycle = Lifecycle::Active;
        state.predecessor = None;
        for entry in state.fingers.iter_mut() {
            *entry = Some(self.addr.clone());
        }
        state.successors = vec![self.addr.clone()];
        info!(node = %self.addr, "created new ring");
        Ok(())
    }

    /// Joins the ring that `known` belongs to. The true predecessor is left
    /// unset; the next stabilization rounds resolve it through notify.
    pub async fn join(&self, known: &Address) -> Result<(), RingError> {
        {
            let state = self.state.lock().await;
            if state.lifecycle != Lifecycle::Uninitialized {
                return Err(RingError::JoinFailure(format!(
                    "{} is already part of a ring",
                    self.addr
                )));
            }
        }
        if known.endpoint() == self.addr.endpoint() {
            return Err(RingError::JoinFailure(
                "a node cannot join a ring through itself".into(),
            ));
        }

        let successor = self
            .transport
            .find_successor(known, self.addr.id())
            .await
            .map_err(|e| RingError::JoinFailure(format!("via {}: {e}", known)))?;

        let mut state = self.state.lock().await;
        if state.lifecycle != Lifecycle::Uninitialized {
            return Err(RingError::JoinFailure(format!(
                "{} joined a ring concurrently",
                self.addr
            )));
        }
        state.lifecycle = Lifecycle::Active;
        state.predecessor = None;
        state.fingers[0] = Some(successor.clone());
        state.successors = vec![successor.clone()];
        info!(node = %self.addr, via = %known, successor = %successor, "joined ring");
        Ok(())
    }

    /// Leaves the ring, best effort. The node stops answering immediately;
    /// the successor is offered our predecessor so its pointer can re-link
    /// without waiting for its own failure detection. Not atomic against
    /// concurrent failures; neighbors that miss the hint heal through their
    /// next maintenance round.
    pub async fn leave(&self) -> Result<(), RingError> {
        let (predecessor, successor) = {
            let mut state = self.state.lock().await;
            if state.lifecycle != Lifecycle::Active {
                return Err(RingError::InvalidState(format!(
                    "{} is not part of a ring",
                    self.addr
                )));
            }
            state.lifecycle = Lifecycle::Left;
            (
                state.predecessor.clone(),
                state.successors.first().cloned(),
            )
        };

        if let (Some(pred), Some(succ)) = (predecessor, successor) {
            if succ != self.addr && pred != self.addr {
                if let Err(e) = self.transport.notify(&succ, &pred).await {
                    debug!(node = %self.addr, successor = %succ, error = %e,
                        "departure hint not delivered");
                }
            }
        }
        info!(node = %self.addr, "left ring");
        Ok(())
    }

    // Remote surface (what the Transport exposes to peers)

    /// Resolves the node responsible for `id`.
    ///
    /// If the identifier falls between us and our successor, the successor
    /// is the answer. Otherwise the query is forwarded to the closest
    /// preceding finger, which recurses; unreachable fingers are cleared and
    /// the next candidate tried, falling back to the successor list, so a
    /// routable query never fails on a single dead pointer.
    pub async fn find_successor(&self, id: Id) -> Result<Address, RingError> {
        self.ensure_active().await?;
        let (successor, candidates) = self.route_snapshot(id).await?;

        if self.covered_by_successor(&successor, id) {
            return Ok(successor);
        }

        for finger in candidates {
            match self.transport.find_successor(&finger, id).await {
                Ok(found) => return Ok(found),
                Err(RingError::PeerUnreachable(e)) => {
                    debug!(node = %self.addr, finger = %finger, error = %e,
                        "finger unreachable, clearing");
                    self.clear_finger(&finger).await;
                }
                Err(e) => return Err(e),
            }
        }

        // No usable finger points into (self, id): hand the query to the
        // first live successor, which guarantees termination.
        loop {
            let successor = self.first_successor().await?;
            if successor == self.addr {
                return Ok(successor);
            }
            match self.transport.find_successor(&successor, id).await {
                Ok(found) => return Ok(found),
                Err(RingError::PeerUnreachable(e)) => {
                    warn!(node = %self.addr, successor = %successor, error = %e,
                        "successor unreachable during lookup");
                    self.drop_successor(&successor).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// [`Node::find_successor`] with a hop counter: a locally answered query
    /// reports the hops it arrived with, a forwarded one adds the hop.
    pub async fn trace_successor(&self, id: Id, hops: u32) -> Result<(Address, u32), RingError> {
        self.ensure_active().await?;
        let (successor, candidates) = self.route_snapshot(id).await?;

        if self.covered_by_successor(&successor, id) {
            return Ok((successor, hops));
        }

        for finger in candidates {
            match self.transport.trace_successor(&finger, id, hops).await {
                Ok((found, taken)) => return Ok((found, taken + 1)),
                Err(RingError::PeerUnreachable(_)) => self.clear_finger(&finger).await,
                Err(e) => return Err(e),
            }
        }

        loop {
            let successor = self.first_successor().await?;
            if successor == self.addr {
                return Ok((successor, hops));
            }
            match self.transport.trace_successor(&successor, id, hops).await {
                Ok((found, taken)) => return Ok((found, taken + 1)),
                Err(RingError::PeerUnreachable(_)) => self.drop_successor(&successor).await,
                Err(e) => return Err(e),
            }
        }
    }

    /// Handles an inbound notify: adopts `candidate` as predecessor when we
    /// have none or it sits between the current predecessor and us.
    pub async fn handle_notify(&self, candidate: Address) -> Result<bool, RingError> {
        if candidate == self.addr {
            return Ok(false);
        }
        let mut state = self.state.lock().await;
        if state.lifecycle != Lifecycle::Active {
            return Err(RingError::InvalidState(format!(
                "{} is not part of a ring",
                self.addr
            )));
        }
        let adopt = match &state.predecessor {
            None => true,
            Some(current) => self
                .space
                .between(current.id(), candidate.id(), self.addr.id()),
        };
        if adopt {
            debug!(node = %self.addr, predecessor = %candidate, "adopted predecessor");
            state.predecessor = Some(candidate);
        }
        Ok(adopt)
    }

    /// Liveness probe; fails once the node has left.
    pub async fn handle_ping(&self) -> Result<(), RingError> {
        self.ensure_active().await
    }

    /// Key lookup: hash the key and resolve the responsible node.
    pub async fn lookup(&self, key: &[u8]) -> Result<Address, RingError> {
        self.find_successor(self.space.hash(key)).await
    }

    // Periodic maintenance

    /// One stabilization round: verify the successor (falling back through
    /// the successor list when the head is dead), adopt its predecessor if
    /// that node has slotted in between, notify it about us, and refresh the
    /// successor list by walking the ring.
    pub async fn stabilize(&self) -> Result<(), RingError> {
        self.ensure_active().await?;

        let (mut successor, succ_predecessor) = loop {
            let Some(head) = self.successor().await else {
                // Every known successor is gone. Fall back to a ring of one
                // so we stay routable and can re-merge through future
                // notifies, and report the partition to the caller.
                self.reset_to_self().await;
                return Err(RingError::RingUnavailable(format!(
                    "{}: successor list exhausted",
                    self.addr
                )));
            };
            if head == self.addr {
                break (head, self.predecessor().await);
            }
            match self.transport.get_predecessor(&head).await {
                Ok(pred) => break (head, pred),
                Err(RingError::PeerUnreachable(e)) => {
                    warn!(node = %self.addr, successor = %head, error = %e,
                        "successor unreachable, falling back");
                    self.drop_successor(&head).await;
                }
                Err(e) => return Err(e),
            }
        };

        if let Some(x) = succ_predecessor {
            if x != self.addr && self.space.between(self.addr.id(), x.id(), successor.id()) {
                debug!(node = %self.addr, successor = %x, "adopted closer successor");
                self.adopt_successor(x.clone()).await;
                successor = x;
            }
        }

        if successor != self.addr {
            match self.transport.notify(&successor, &self.addr).await {
                Ok(_) => {}
                Err(e) => {
                    // The next round probes this successor again and falls
                    // back if it stays silent.
                    debug!(node = %self.addr, successor = %successor, error = %e,
                        "notify failed");
                }
            }
        }

        self.refresh_successors(successor).await;
        Ok(())
    }

    /// Refreshes one finger per call, round-robin over all m indices. The
    /// cursor advances even when the lookup fails, as every index must keep
    /// getting its turn.
    pub async fn fix_fingers(&self) -> Result<(), RingError> {
        self.ensure_active().await?;
        let index = {
            let mut state = self.state.lock().await;
            let i = state.next_finger;
            state.next_finger = (i + 1) % self.space.bits();
            i
        };
        let start = self.space.finger_start(self.addr.id(), index);
        let node = self.find_successor(start).await?;

        let mut state = self.state.lock().await;
        if state.lifecycle != Lifecycle::Active {
            return Ok(());
        }
        if index == 0 {
            // Finger 0 mirrors the successor; only confirm, never diverge.
            if state.successors.first() == Some(&node) {
                state.fingers[0] = Some(node);
            }
        } else {
            state.fingers[index as usize] = Some(node);
        }
        Ok(())
    }

    /// Probes the predecessor; clears it on failure so a future notify can
    /// repopulate it.
    pub async fn check_predecessor(&self) {
        let predecessor = {
            let state = self.state.lock().await;
            if state.lifecycle != Lifecycle::Active {
                return;
            }
            state.predecessor.clone()
        };
        let Some(pred) = predecessor else {
            return;
        };
        if self.transport.ping(&pred).await.is_err() {
            warn!(node = %self.addr, predecessor = %pred, "predecessor unreachable, clearing");
            let mut state = self.state.lock().await;
            // Recheck: a notify may have replaced it while we were probing.
            if state.predecessor.as_ref() == Some(&pred) {
                state.predecessor = None;
            }
        }
    }

    // Internals

    async fn ensure_active(&self) -> Result<(), RingError> {
        match self.lifecycle().await {
            Lifecycle::Active => Ok(()),
            Lifecycle::Uninitialized => Err(RingError::InvalidState(format!(
                "{} has not created or joined a ring",
                self.addr
            ))),
            Lifecycle::Left => Err(RingError::InvalidState(format!(
                "{} has left the ring",
                self.addr
            ))),
        }
    }

    fn covered_by_successor(&self, successor: &Address, id: Id) -> bool {
        id == successor.id() || self.space.between(self.addr.id(), id, successor.id())
    }

    /// Snapshot of the routing state: the immediate successor plus the
    /// closest preceding fingers for `id`, highest first, deduplicated.
    async fn route_snapshot(&self, id: Id) -> Result<(Address, Vec<Address>), RingError> {
        let state = self.state.lock().await;
        let successor = state.successors.first().cloned().ok_or_else(|| {
            RingError::RingUnavailable(format!("{} has no live successor", self.addr))
        })?;
        let mut candidates: Vec<Address> = Vec::new();
        for finger in state.fingers.iter().rev().flatten() {
            if *finger == self.addr || candidates.contains(finger) {
                continue;
            }
            if self.space.between(self.addr.id(), finger.id(), id) {
                candidates.push(finger.clone());
            }
        }
        Ok((successor, candidates))
    }

    async fn first_successor(&self) -> Result<Address, RingError> {
        self.state
            .lock()
            .await
            .successors
            .first()
            .cloned()
            .ok_or_else(|| {
                RingError::RingUnavailable(format!("{}: successor list exhausted", self.addr))
            })
    }

    /// Puts `node` in front of the successor list and keeps finger 0 in
    /// agreement.
    async fn adopt_successor(&self, node: Address) {
        let mut state = self.state.lock().await;
        state.successors.retain(|s| s != &node);
        state.successors.insert(0, node.clone());
        state.successors.truncate(self.config.successors);
        state.fingers[0] = Some(node);
    }

    /// Removes a dead node from the successor list and every finger entry.
    async fn drop_successor(&self, node: &Address) {
        let mut state = self.state.lock().await;
        state.successors.retain(|s| s != node);
        for entry in state.fingers.iter_mut() {
            if entry.as_ref() == Some(node) {
                *entry = None;
            }
        }
        state.fingers[0] = state.successors.first().cloned();
    }

    async fn reset_to_self(&self) {
        let mut state = self.state.lock().await;
        if state.lifecycle != Lifecycle::Active {
            return;
        }
        state.successors = vec![self.addr.clone()];
        state.fingers[0] = Some(self.addr.clone());
    }

    async fn clear_finger(&self, node: &Address) {
        let mut state = self.state.lock().await;
        for entry in state.fingers.iter_mut() {
            if entry.as_ref() == Some(node) {
                *entry = None;
            }
        }
        state.fingers[0] = state.successors.first().cloned();
    }

    /// Rebuilds the successor list behind `first` by asking each hop for the
    /// node after it. Stays within the fixed operation set: the walk is just
    /// `find_successor(id + 1)` asked of the previous hop.
    async fn refresh_successors(&self, first: Address) {
        let mut list = vec![first.clone()];
        let mut cursor = first.clone();
        while list.len() < self.config.successors && cursor != self.addr {
            let probe = self.space.next(cursor.id());
            match self.transport.find_successor(&cursor, probe).await {
                Ok(next) => {
                    if next == self.addr || list.contains(&next) {
                        break;
                    }
                    list.push(next.clone());
                    cursor = next;
                }
                Err(e) => {
                    debug!(node = %self.addr, cursor = %cursor, error = %e,
                        "successor walk stopped early");
                    break;
                }
            }
        }

        let mut state = self.state.lock().await;
        // Commit only if the head did not change while we were walking. A
        // walk cut short must not discard backups we already had: keep old
        // entries to fill the list, they are probed before ever being used.
        if state.lifecycle == Lifecycle::Active && state.successors.first() == Some(&first) {
            for old in &state.successors {
                if list.len() >= self.config.successors {
                    break;
                }
                if *old != self.addr && !list.contains(old) {
                    list.push(old.clone());
                }
            }
            state.successors = list;
            state.fingers[0] = Some(first);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::local::LocalNetwork;

    fn small_config() -> RingConfig {
        RingConfig {
            bits: 16,
            successors: 3,
            ..Default::default()
        }
    }

    fn node_at(network: &Arc<LocalNetwork>, port: u16) -> Arc<Node> {
        let node = Node::new(
            small_config(),
            "127.0.0.1",
            port,
            network.clone() as Arc<dyn Transport>,
        )
        .unwrap();
        network.register(&node);
        node
    }

    fn addr_with_id(node: &Node, raw: u64, host: &str, port: u16) -> Address {
        Address::from_parts(node.space(), raw, host, port).unwrap()
    }

    #[tokio::test]
    async fn create_makes_a_single_node_ring() {
        let network = LocalNetwork::new();
        let node = node_at(&network, 6001);
        node.create().await.unwrap();

        assert_eq!(node.successor().await.as_ref(), Some(node.address()));
        assert_eq!(node.predecessor().await, None);
        assert!(node.is_active().await);
        let fingers = node.fingers().await;
        assert_eq!(fingers.len(), 16);
        assert!(fingers.iter().all(|f| f.as_ref() == Some(node.address())));
    }

    #[tokio::test]
    async fn create_twice_is_rejected() {
        let network = LocalNetwork::new();
        let node = node_at(&network, 6002);
        node.create().await.unwrap();
        assert!(matches!(
            node.create().await,
            Err(RingError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn single_node_answers_every_lookup_with_itself() {
        let network = LocalNetwork::new();
        let node = node_at(&network, 6003);
        node.create().await.unwrap();

        for key in [b"alpha".as_slice(), b"beta", b"gamma"] {
            assert_eq!(node.lookup(key).await.unwrap(), *node.address());
        }
        let own = node.find_successor(node.address().id()).await.unwrap();
        assert_eq!(own, *node.address());
    }

    #[tokio::test]
    async fn join_through_itself_is_rejected() {
        let network = LocalNetwork::new();
        let node = node_at(&network, 6004);
        let self_addr = node.address().clone();
        assert!(matches!(
            node.join(&self_addr).await,
            Err(RingError::JoinFailure(_))
        ));
    }

    #[tokio::test]
    async fn join_with_unreachable_bootstrap_fails() {
        let network = LocalNetwork::new();
        let node = node_at(&network, 6005);
        let ghost = Address::new(node.space(), "127.0.0.1", 9999);
        assert!(matches!(
            node.join(&ghost).await,
            Err(RingError::JoinFailure(_))
        ));
        assert!(!node.is_active().await);
    }

    #[tokio::test]
    async fn notify_fills_an_empty_predecessor() {
        let network = LocalNetwork::new();
        let node = node_at(&network, 6006);
        node.create().await.unwrap();

        let candidate = addr_with_id(&node, 500, "10.0.0.1", 7000);
        assert!(node.handle_notify(candidate.clone()).await.unwrap());
        assert_eq!(node.predecessor().await, Some(candidate));
    }

    #[tokio::test]
    async fn notify_replaces_a_farther_predecessor() {
        let network = LocalNetwork::new();
        let node = node_at(&network, 6007);
        node.create().await.unwrap();
        let self_id = node.address().id().raw();

        let far = addr_with_id(&node, self_id.wrapping_sub(600) & 0xffff, "10.0.0.1", 7000);
        let near = addr_with_id(&node, self_id.wrapping_sub(100) & 0xffff, "10.0.0.2", 7001);

        assert!(node.handle_notify(far.clone()).await.unwrap());
        assert!(node.handle_notify(near.clone()).await.unwrap());
        assert_eq!(node.predecessor().await, Some(near.clone()));

        // The farther candidate no longer displaces the nearer one.
        assert!(!node.handle_notify(far).await.unwrap());
        assert_eq!(node.predecessor().await, Some(near));
    }

    #[tokio::test]
    async fn notify_ignores_self() {
        let network = LocalNetwork::new();
        let node = node_at(&network, 6008);
        node.create().await.unwrap();
        let self_addr = node.address().clone();
        assert!(!node.handle_notify(self_addr).await.unwrap());
        assert_eq!(node.predecessor().await, None);
    }

    #[tokio::test]
    async fn route_snapshot_orders_preceding_fingers() {
        let network = LocalNetwork::new();
        let node = node_at(&network, 6009);
        node.create().await.unwrap();
        let self_id = node.address().id().raw();

        let low = addr_with_id(&node, (self_id + 10) & 0xffff, "1.1.1.1", 5001);
        let mid = addr_with_id(&node, (self_id + 30) & 0xffff, "2.2.2.2", 5002);
        let high = addr_with_id(&node, (self_id + 50) & 0xffff, "3.3.3.3", 5003);
        {
            let mut state = node.state.lock().await;
            state.fingers = vec![None; 16];
            state.fingers[1] = Some(low.clone());
            state.fingers[4] = Some(mid.clone());
            state.fingers[7] = Some(high.clone());
        }

        // Target beyond every finger: highest preceding finger comes first.
        let target = node.space().check((self_id + 60) & 0xffff).unwrap();
        let (_, candidates) = node.route_snapshot(target).await.unwrap();
        assert_eq!(candidates, vec![high.clone(), mid.clone(), low.clone()]);

        // Target between low and mid: only low precedes it.
        let target = node.space().check((self_id + 20) & 0xffff).unwrap();
        let (_, candidates) = node.route_snapshot(target).await.unwrap();
        assert_eq!(candidates, vec![low]);

        // Target immediately after the node: nothing precedes it.
        let target = node.space().check((self_id + 5) & 0xffff).unwrap();
        let (_, candidates) = node.route_snapshot(target).await.unwrap();
        assert!(candidates.is_empty());
    }

    #[tokio::test]
    async fn left_node_refuses_calls() {
        let network = LocalNetwork::new();
        let node = node_at(&network, 6010);
        node.create().await.unwrap();
        node.leave().await.unwrap();

        assert_eq!(node.lifecycle().await, Lifecycle::Left);
        assert!(node.handle_ping().await.is_err());
        let id = node.space().hash(b"key");
        assert!(matches!(
            node.find_successor(id).await,
            Err(RingError::InvalidState(_))
        ));
    }
}
