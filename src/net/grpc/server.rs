use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::oneshot;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{error, info};

use crate::error::RingError;
use crate::net::wire::convert::{address_from_msg, address_to_msg};
use crate::net::wire::ring::ring_node_server::{RingNode, RingNodeServer};
use crate::net::wire::ring::{
    FindSuccessorRequest, FindSuccessorResponse, GetPredecessorRequest, GetPredecessorResponse,
    NotifyRequest, NotifyResponse, PingRequest, PingResponse, TraceSuccessorRequest,
    TraceSuccessorResponse,
};
use crate::ring::node::Node;

/// The tonic service: one node's remote surface. Holds nothing but the node
/// reference, so any node instance can be served by it.
pub struct RingNodeService {
    node: Arc<Node>,
}

impl RingNodeService {
    pub fn new(node: Arc<Node>) -> Self {
        Self { node }
    }
}

fn to_status(e: RingError) -> Status {
    match e {
        RingError::InvalidIdentifier(m) => Status::invalid_argument(m),
        // A left node or an exhausted ring both read as "not answering"
        // from the caller's side.
        RingError::InvalidState(m)
        | RingError::RingUnavailable(m)
        | RingError::PeerUnreachable(m) => Status::unavailable(m),
        other => Status::internal(other.to_string()),
    }
}

#[tonic::async_trait]
impl RingNode for RingNodeService {
    async fn find_successor(
        &self,
        request: Request<FindSuccessorRequest>,
    ) -> Result<Response<FindSuccessorResponse>, Status> {
        let id = self
            .node
            .space()
            .check(request.into_inner().id)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
        let successor = self.node.find_successor(id).await.map_err(to_status)?;
        Ok(Response::new(FindSuccessorResponse {
            successor: Some(address_to_msg(&successor)),
        }))
    }

    async fn get_predecessor(
        &self,
        _request: Request<GetPredecessorRequest>,
    ) -> Result<Response<GetPredecessorResponse>, Status> {
        self.node.handle_ping().await.map_err(to_status)?;
        let predecessor = self.node.predecessor().await;
        Ok(Response::new(GetPredecessorResponse {
            predecessor: predecessor.as_ref().map(address_to_msg),
        }))
    }

    async fn notify(
        &self,
        request: Request<NotifyRequest>,
    ) -> Result<Response<NotifyResponse>, Status> {
        let msg = request
            .into_inner()
            .candidate
            .ok_or_else(|| Status::invalid_argument("notify without a candidate"))?;
        let candidate = address_from_msg(self.node.space(), &msg)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
        let accepted = self
            .node
            .handle_notify(candidate)
            .await
            .map_err(to_status)?;
        Ok(Response::new(NotifyResponse { accepted }))
    }

    async fn ping(&self, _request: Request<PingRequest>) -> Result<Response<PingResponse>, Status> {
        self.node.handle_ping().await.map_err(to_status)?;
        Ok(Response::new(PingResponse { alive: true }))
    }

    async fn trace_successor(
        &self,
        request: Request<TraceSuccessorRequest>,
    ) -> Result<Response<TraceSuccessorResponse>, Status> {
        let inner = request.into_inner();
        let id = self
            .node
            .space()
            .check(inner.id)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
        let (successor, hops) = self
            .node
            .trace_successor(id, inner.hops)
            .await
            .map_err(to_status)?;
        Ok(Response::new(TraceSuccessorResponse {
            successor: Some(address_to_msg(&successor)),
            hops,
        }))
    }
}

/// Serves a node's remote surface until the shutdown signal fires.
///
/// The readiness channel fires just before the listener starts accepting;
/// callers use it to sequence join attempts behind server startup.
pub struct RpcServer {
    node: Arc<Node>,
    shutdown_rx: oneshot::Receiver<()>,
    ready_tx: Option<oneshot::Sender<()>>,
}

impl RpcServer {
    pub fn new(
        node: Arc<Node>,
        shutdown_rx: oneshot::Receiver<()>,
        ready_tx: Option<oneshot::Sender<()>>,
    ) -> Self {
        Self {
            node,
            shutdown_rx,
            ready_tx,
        }
    }

    pub async fn run(mut self) -> Result<(), RingError> {
        let addr = self
            .node
            .address()
            .endpoint()
            .parse()
            .map_err(|e| RingError::Server(format!("invalid listen address: {e}")))?;

        info!(node = %self.node.address(), "starting rpc server on {addr}");

        let service = RingNodeService::new(Arc::clone(&self.node));
        let server = Server::builder()
            .tcp_nodelay(true)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .add_service(RingNodeServer::new(service));

        if let Some(ready_tx) = self.ready_tx.take() {
            let _ = ready_tx.send(());
        }

        match server
            .serve_with_shutdown(addr, self.shutdown_rx.map(|_| ()))
            .await
        {
            Ok(()) => {
                info!(node = %self.node.address(), "rpc server shut down");
                Ok(())
            }
            Err(e) => {
                error!(node = %self.node.address(), error = %e, "rpc server failed");
                Err(RingError::Server(e.to_string()))
            }
        }
    }
}
