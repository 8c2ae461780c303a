use std::net::SocketAddr;
use std::time::Duration;

use crate::fne::peer_details::PeerDetails;

#[derive(Debug)]
pub struct MasterConfig {
    /// name of the system this master serves, used for logging and routing
    pub name: String,
    pub bind_addr: SocketAddr,
    /// shared secret all peers authenticate with
    pub passphrase: String,

    /// peers are expected to ping at this interval, and the maintenance sweep runs at it
    pub ping_interval: Duration,
    /// a peer is removed after missing this many pings in a row
    pub max_missed_pings: u32,
    /// pause before receiving again after a transport error
    pub recv_error_backoff: Duration,
}

impl MasterConfig {
    pub fn new(name: &str, bind_addr: SocketAddr, passphrase: &str) -> MasterConfig {
        MasterConfig {
            name: name.to_string(),
            bind_addr,
            passphrase: passphrase.to_string(),
            ping_interval: Duration::from_secs(5),
            max_missed_pings: 3,
            recv_error_backoff: Duration::from_secs(1),
        }
    }

    pub fn peer_timeout(&self) -> Duration {
        self.ping_interval * self.max_missed_pings
    }
}

#[derive(Debug)]
pub struct PeerConfig {
    pub name: String,
    pub peer_id: u32,
    pub bind_addr: SocketAddr,
    pub master_addr: SocketAddr,
    pub passphrase: String,
    /// sent to the master during the config phase
    pub details: PeerDetails,

    /// interval for login attempts while disconnected, and for pings while connected
    pub ping_interval: Duration,
    /// the connection is considered lost after this many unanswered pings (or stalled
    ///  handshake ticks)
    pub max_missed_pings: u32,
    pub recv_error_backoff: Duration,
}

impl PeerConfig {
    pub fn new(name: &str, peer_id: u32, bind_addr: SocketAddr, master_addr: SocketAddr, passphrase: &str) -> PeerConfig {
        PeerConfig {
            name: name.to_string(),
            peer_id,
            bind_addr,
            master_addr,
            passphrase: passphrase.to_string(),
            details: PeerDetails::default(),
            ping_interval: Duration::from_secs(5),
            max_missed_pings: 3,
            recv_error_backoff: Duration::from_secs(1),
        }
    }
}
