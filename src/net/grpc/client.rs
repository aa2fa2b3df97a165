use std::time::Duration;

use async_trait::async_trait;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Request, Status};

use crate::config::RingConfig;
use crate::error::RingError;
use crate::net::transport::Transport;
use crate::net::wire::convert::{address_to_msg, optional_address, required_address};
use crate::net::wire::ring::ring_node_client::RingNodeClient;
use crate::net::wire::ring::{
    FindSuccessorRequest, GetPredecessorRequest, NotifyRequest, PingRequest,
    TraceSuccessorRequest,
};
use crate::ring::id::{Address, Id, KeySpace};

/// gRPC client side of the transport: dials a fresh channel per call with a
/// connect timeout and a per-request deadline, so no outbound call can hang
/// a maintenance task.
pub struct GrpcTransport {
    space: KeySpace,
    timeout: Duration,
}

impl GrpcTransport {
    pub fn new(space: KeySpace, timeout: Duration) -> Self {
        Self { space, timeout }
    }

    pub fn from_config(config: &RingConfig) -> Result<Self, RingError> {
        Ok(Self::new(KeySpace::new(config.bits)?, config.rpc_timeout))
    }

    async fn connect(&self, peer: &Address) -> Result<RingNodeClient<Channel>, RingError> {
        let endpoint = Endpoint::from_shared(format!("http://{}", peer.endpoint()))
            .map_err(|e| RingError::PeerUnreachable(format!("{peer}: bad endpoint: {e}")))?
            .connect_timeout(self.timeout)
            .timeout(self.timeout);
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| RingError::PeerUnreachable(format!("{peer}: {e}")))?;
        Ok(RingNodeClient::new(channel))
    }
}

fn map_status(peer: &Address, status: Status) -> RingError {
    match status.code() {
        Code::InvalidArgument => {
            RingError::InvalidIdentifier(format!("{peer}: {}", status.message()))
        }
        code => RingError::PeerUnreachable(format!("{peer}: {} ({code:?})", status.message())),
    }
}

#[async_trait]
impl Transport for GrpcTransport {
    async fn find_successor(&self, peer: &Address, id: Id) -> Result<Address, RingError> {
        let mut client = self.connect(peer).await?;
        let response = client
            .find_successor(Request::new(FindSuccessorRequest { id: id.raw() }))
            .await
            .map_err(|s| map_status(peer, s))?;
        required_address(&self.space, response.into_inner().successor)
    }

    async fn get_predecessor(&self, peer: &Address) -> Result<Option<Address>, RingError> {
        let mut client = self.connect(peer).await?;
        let response = client
            .get_predecessor(Request::new(GetPredecessorRequest {}))
            .await
            .map_err(|s| map_status(peer, s))?;
        optional_address(&self.space, response.into_inner().predecessor)
    }

    async fn notify(&self, peer: &Address, candidate: &Address) -> Result<bool, RingError> {
        let mut client = self.connect(peer).await?;
        let response = client
            .notify(Request::new(NotifyRequest {
                candidate: Some(address_to_msg(candidate)),
            }))
            .await
            .map_err(|s| map_status(peer, s))?;
        Ok(response.into_inner().accepted)
    }

    async fn ping(&self, peer: &Address) -> Result<(), RingError> {
        let mut client = self.connect(peer).await?;
        let response = client
            .ping(Request::new(PingRequest {}))
            .await
            .map_err(|s| map_status(peer, s))?;
        if response.into_inner().alive {
            Ok(())
        } else {
            Err(RingError::PeerUnreachable(format!(
                "{peer}: reported not alive"
            )))
        }
    }

    async fn trace_successor(
        &self,
        peer: &Address,
        id: Id,
        hops: u32,
    ) -> Result<(Address, u32), RingError> {
        let mut client = self.connect(peer).await?;
        let response = client
            .trace_successor(Request::new(TraceSuccessorRequest { id: id.raw(), hops }))
            .await
            .map_err(|s| map_status(peer, s))?;
        let inner = response.into_inner();
        let successor = required_address(&self.space, inner.successor)?;
        Ok((successor, inner.hops))
    }
}
