use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::fne::master::FneMaster;
use crate::fne::opcodes::TrafficFamily;
use crate::fne::peer::FnePeer;

/// A protocol instance in either role. The router addresses systems by name, and sends traffic
///  to them without caring which role they play.
#[derive(Debug)]
pub enum FneSystem {
    Master(FneMaster),
    Peer(FnePeer),
}

impl FneSystem {
    pub fn name(&self) -> &str {
        match self {
            FneSystem::Master(m) => m.name(),
            FneSystem::Peer(p) => p.name(),
        }
    }

    pub fn is_master(&self) -> bool {
        matches!(self, FneSystem::Master(_))
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        match self.as_ref() {
            FneSystem::Master(m) => m.run(cancel).await,
            FneSystem::Peer(p) => p.run(cancel).await,
        }
    }

    /// `true` if [FneSystem::send_traffic] with the same `accept_peer` would reach anybody
    pub async fn has_recipient(&self, accept_peer: impl Fn(u32) -> bool) -> bool {
        match self {
            FneSystem::Master(m) => m.running_peer_ids().await.into_iter().any(accept_peer),
            FneSystem::Peer(p) => p.is_running().await,
        }
    }

    /// Sends a traffic frame. A master sends it to each running peer that `accept_peer` lets
    ///  through, a peer sends it to its master if connected.
    pub async fn send_traffic(&self, family: TrafficFamily, stream_id: u32, payload: &[u8], accept_peer: impl Fn(u32) -> bool) {
        match self {
            FneSystem::Master(m) => m.send_traffic(family, stream_id, payload, accept_peer).await,
            FneSystem::Peer(p) => {
                p.send_traffic(family, stream_id, payload).await;
            }
        }
    }
}
