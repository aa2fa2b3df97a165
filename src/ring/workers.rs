use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::error::RingError;
use crate::ring::node::{Lifecycle, Node};

/// Handles to one node's maintenance tasks. Aborts them when dropped, so a
/// node owner cannot leak workers past the node's lifetime.
pub struct Maintenance {
    tasks: Vec<JoinHandle<()>>,
}

impl Maintenance {
    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for Maintenance {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Spawns the three periodic maintenance tasks for a node: stabilize,
/// fix-fingers, and check-predecessor, each on its own timer taken from the
/// node's config. The tasks hold nothing but the node reference, so any
/// number of nodes can run side by side in one process.
pub fn spawn_maintenance(node: &Arc<Node>) -> Maintenance {
    Maintenance {
        tasks: vec![
            tokio::spawn(run_stabilize(Arc::clone(node))),
            tokio::spawn(run_fix_fingers(Arc::clone(node))),
            tokio::spawn(run_check_predecessor(Arc::clone(node))),
        ],
    }
}

pub async fn run_stabilize(node: Arc<Node>) {
    debug!(node = %node.address(), "starting stabilize worker");
    let mut interval = jittered_interval(node.config().stabilize_interval);
    loop {
        interval.tick().await;
        if node.lifecycle().await == Lifecycle::Left {
            break;
        }
        match node.stabilize().await {
            Ok(()) => {}
            Err(e @ RingError::RingUnavailable(_)) => {
                // Partitioned from every known successor; retried next tick.
                warn!(node = %node.address(), error = %e, "stabilize found no live successor");
            }
            Err(RingError::InvalidState(_)) => break,
            Err(e) => debug!(node = %node.address(), error = %e, "stabilize round failed"),
        }
    }
    debug!(node = %node.address(), "stabilize worker stopped");
}

pub async fn run_fix_fingers(node: Arc<Node>) {
    debug!(node = %node.address(), "starting fix-fingers worker");
    let mut interval = jittered_interval(node.config().fix_fingers_interval);
    loop {
        interval.tick().await;
        if node.lifecycle().await == Lifecycle::Left {
            break;
        }
        match node.fix_fingers().await {
            Ok(()) => {}
            Err(RingError::InvalidState(_)) => break,
            Err(e) => debug!(node = %node.address(), error = %e, "finger refresh failed"),
        }
    }
    debug!(node = %node.address(), "fix-fingers worker stopped");
}

pub async fn run_check_predecessor(node: Arc<Node>) {
    debug!(node = %node.address(), "starting check-predecessor worker");
    let mut interval = jittered_interval(node.config().check_predecessor_interval);
    loop {
        interval.tick().await;
        if node.lifecycle().await == Lifecycle::Left {
            break;
        }
        node.check_predecessor().await;
    }
    debug!(node = %node.address(), "check-predecessor worker stopped");
}

/// An interval whose first tick is staggered by a random fraction of the
/// period, so co-located nodes do not run their rounds in lockstep.
fn jittered_interval(period: Duration) -> tokio::time::Interval {
    let jitter = period.mul_f64(rand::rng().random_range(0.0..1.0));
    let mut interval = tokio::time::interval_at(Instant::now() + jitter, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
