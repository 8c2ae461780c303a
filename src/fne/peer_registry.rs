use std::collections::hash_map::Entry;
use std::net::SocketAddr;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;

use crate::fne::frame::OutboundSequencer;
use crate::fne::peer_details::PeerDetails;

/// Lifecycle of a connection between a peer and its master. Both roles use the same states: the
///  master tracks them per peer, a peer for its single connection to the master.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionState {
    WaitingLogin,
    WaitingAuthorisation,
    WaitingConfig,
    Running,
}

/// Master-side state for a single peer
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub peer_id: u32,
    pub salt: u32,
    pub addr: SocketAddr,
    pub state: ConnectionState,
    /// set once the config exchange completed, i.e. traffic is accepted from this peer
    pub connected: bool,
    /// current stream, 0 for none
    pub stream_id: u32,
    pub last_sequence: u16,
    pub next_sequence: u16,
    pub details: Option<PeerDetails>,
    pub pings_received: u32,
    pub last_ping: Instant,
    /// RTP sequencing for frames sent to this peer
    pub tx: OutboundSequencer,
}

impl PeerRecord {
    pub fn new(peer_id: u32, addr: SocketAddr, salt: u32, now: Instant) -> PeerRecord {
        PeerRecord {
            peer_id,
            salt,
            addr,
            state: ConnectionState::WaitingAuthorisation,
            connected: false,
            stream_id: 0,
            last_sequence: 0,
            next_sequence: 0,
            details: None,
            pings_received: 0,
            last_ping: now,
            tx: OutboundSequencer::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.connected && self.state == ConnectionState::Running
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SequenceCheck {
    NewStream,
    InSequence,
    OutOfSequence { expected: u16, actual: u16 },
}

/// The master's map of peer id to connection state. It is not synchronized itself - the master
///  guards it with a lock shared by the receive loop and the maintenance loop.
#[derive(Default)]
pub struct PeerRegistry {
    peers: FxHashMap<u32, PeerRecord>,
}

impl PeerRegistry {
    pub fn new() -> PeerRegistry {
        Default::default()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn get(&self, peer_id: u32) -> Option<&PeerRecord> {
        self.peers.get(&peer_id)
    }

    pub fn get_mut(&mut self, peer_id: u32) -> Option<&mut PeerRecord> {
        self.peers.get_mut(&peer_id)
    }

    /// creates a record for a login attempt, returning `false` without touching the registry if
    ///  there is a record for the peer id already
    pub fn insert_new(&mut self, peer_id: u32, addr: SocketAddr, salt: u32, now: Instant) -> bool {
        match self.peers.entry(peer_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(e) => {
                e.insert(PeerRecord::new(peer_id, addr, salt, now));
                true
            }
        }
    }

    pub fn remove(&mut self, peer_id: u32) -> Option<PeerRecord> {
        self.peers.remove(&peer_id)
    }

    /// Traffic is accepted only from running peers, and only from the address they logged in from
    pub fn is_authorised_sender(&self, peer_id: u32, addr: SocketAddr) -> bool {
        self.peers.get(&peer_id)
            .map(|p| p.connected && p.addr == addr)
            .unwrap_or(false)
    }

    /// Updates stream and sequence tracking for a received frame. Frames without a stream id and
    ///  frames from unknown peers are not tracked, returning `None`.
    pub fn track_sequence(&mut self, peer_id: u32, stream_id: u32, sequence: u16) -> Option<SequenceCheck> {
        if stream_id == 0 {
            return None;
        }
        let peer = self.peers.get_mut(&peer_id)?;

        let result = if peer.stream_id != stream_id {
            peer.stream_id = stream_id;
            SequenceCheck::NewStream
        }
        else if sequence != peer.next_sequence {
            SequenceCheck::OutOfSequence {
                expected: peer.next_sequence,
                actual: sequence,
            }
        }
        else {
            SequenceCheck::InSequence
        };

        peer.last_sequence = sequence;
        peer.next_sequence = sequence.wrapping_add(1);
        Some(result)
    }

    pub fn running_peers(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
            .filter(|p| p.is_running())
    }

    /// Removes and returns all peers that have not pinged for longer than `timeout`
    pub fn sweep(&mut self, now: Instant, timeout: Duration) -> Vec<PeerRecord> {
        let expired = self.peers.values()
            .filter(|p| p.last_ping + timeout < now)
            .map(|p| p.peer_id)
            .collect::<Vec<_>>();

        expired.into_iter()
            .filter_map(|id| self.peers.remove(&id))
            .collect()
    }
}
