use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use tokio::select;
use tokio::sync::Mutex;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::fne::auth::{verify_auth_hash, AUTH_HASH_LENGTH};
use crate::fne::config::MasterConfig;
use crate::fne::frame::{FneFrame, OutboundSequencer};
use crate::fne::handler::{FneHandler, GrantRequest};
use crate::fne::opcodes::{AnnounceSubFunction, Function, MasterCommand, Tag, TrafficFamily, TransferSubFunction, SUB_FUNCTION_NONE};
use crate::fne::peer_details::PeerDetails;
use crate::fne::peer_registry::{ConnectionState, PeerRegistry, SequenceCheck};
use crate::fne::traffic::TrafficFrame;
use crate::fne::transport::Transport;
use crate::util::buf::{get_u24, put_id_list};
use crate::util::random::new_salt;

/// offset of opcode specific fields in a control payload, after tag and peer id
pub const CONTROL_FIELDS_OFFSET: usize = 8;

pub fn control_payload(tag: Tag, peer_id: u32, fields: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(CONTROL_FIELDS_OFFSET + fields.len());
    buf.put_slice(&tag.0);
    buf.put_u32(peer_id);
    buf.put_slice(fields);
    buf
}

/// The master role of the FNE protocol: it accepts logins from peers, authenticates them, tracks
///  their liveness and exchanges traffic with them.
pub struct FneMaster {
    config: Arc<MasterConfig>,
    transport: Arc<dyn Transport>,
    handler: Arc<dyn FneHandler>,
    registry: Mutex<PeerRegistry>,
    /// for frames to addresses without a peer record, e.g. NAKs to unknown peers
    unregistered_tx: Mutex<OutboundSequencer>,
}

impl Debug for FneMaster {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "FneMaster{{{}@{:?}}}", self.config.name, self.config.bind_addr)
    }
}

impl FneMaster {
    pub fn new(config: Arc<MasterConfig>, transport: Arc<dyn Transport>, handler: Arc<dyn FneHandler>) -> FneMaster {
        FneMaster {
            config,
            transport,
            handler,
            registry: Mutex::new(PeerRegistry::new()),
            unregistered_tx: Mutex::new(OutboundSequencer::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Runs the receive loop and the maintenance loop until `cancel` is triggered. Peers are
    ///  notified when the master shuts down.
    pub async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        info!(system = self.name(), "starting FNE master on {:?}", self.config.bind_addr);

        tokio::join!(
            self.recv_loop(&cancel),
            self.maintenance_loop(&cancel),
        );

        self.close().await;
        info!(system = self.name(), "FNE master stopped");
        Ok(())
    }

    async fn recv_loop(&self, cancel: &CancellationToken) {
        loop {
            select! {
                _ = cancel.cancelled() => break,
                received = self.transport.recv() => match received {
                    Ok((buf, from)) => self.on_datagram(&buf, from).await,
                    Err(e) => {
                        warn!(system = self.name(), "error receiving datagram: {}", e);
                        let _ = time::timeout(self.config.recv_error_backoff, cancel.cancelled()).await;
                    }
                }
            }
        }
    }

    async fn maintenance_loop(&self, cancel: &CancellationToken) {
        let mut ticks = time::interval(self.config.ping_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = cancel.cancelled() => break,
                _ = ticks.tick() => self.maintenance_sweep().await,
            }
        }
    }

    /// Removes peers that missed too many pings
    pub async fn maintenance_sweep(&self) {
        let expired = self.registry.lock().await
            .sweep(Instant::now(), self.config.peer_timeout());

        for peer in expired {
            warn!(system = self.name(), peer_id = peer.peer_id, "peer timed out after {:?} without a ping - removing", self.config.peer_timeout());
            if peer.connected {
                self.handler.on_peer_disconnected(peer.peer_id).await;
            }
        }
    }

    /// Notifies all peers that the master is closing and forgets them.
    pub async fn close(&self) {
        let peers = {
            let mut registry = self.registry.lock().await;
            let ids = registry.running_peers()
                .map(|p| p.peer_id)
                .collect::<Vec<_>>();
            for &peer_id in &ids {
                self.send_control_to_peer(&mut registry, peer_id, Function::MasterClosing, Tag::MASTER_CLOSING, &[]).await;
                registry.remove(peer_id);
            }
            ids
        };

        for peer_id in peers {
            self.handler.on_peer_disconnected(peer_id).await;
        }
    }

    pub async fn running_peer_ids(&self) -> Vec<u32> {
        self.registry.lock().await
            .running_peers()
            .map(|p| p.peer_id)
            .collect()
    }

    pub async fn connection_state(&self, peer_id: u32) -> Option<ConnectionState> {
        self.registry.lock().await
            .get(peer_id)
            .map(|p| p.state)
    }

    pub async fn peer_details(&self, peer_id: u32) -> Option<PeerDetails> {
        self.registry.lock().await
            .get(peer_id)
            .and_then(|p| p.details.clone())
    }

    /// Sends a traffic frame to every running peer that `accept_peer` lets through. The header's
    ///  peer id is the recipient's.
    pub async fn send_traffic(&self, family: TrafficFamily, stream_id: u32, payload: &[u8], accept_peer: impl Fn(u32) -> bool) {
        let mut registry = self.registry.lock().await;
        let recipients = registry.running_peers()
            .map(|p| p.peer_id)
            .filter(|&id| accept_peer(id))
            .collect::<Vec<_>>();

        for peer_id in recipients {
            self.send_registered(&mut registry, peer_id, Function::Protocol, family.into(), stream_id, payload).await;
        }
    }

    pub async fn send_master_command(&self, peer_id: u32, command: MasterCommand, ids: &[u32]) -> bool {
        let mut payload = BytesMut::new();
        put_id_list(&mut payload, ids);
        self.send_to_peer(peer_id, Function::MasterCommand, command.into(), 0, &payload).await
    }

    /// Sends a frame to a running peer, returning `false` if there is no such peer
    pub async fn send_to_peer(&self, peer_id: u32, function: Function, sub_function: u8, stream_id: u32, payload: &[u8]) -> bool {
        let mut registry = self.registry.lock().await;
        let is_running = registry.get(peer_id)
            .map(|p| p.is_running())
            .unwrap_or(false);
        if is_running {
            self.send_registered(&mut registry, peer_id, function, sub_function, stream_id, payload).await;
        }
        is_running
    }

    async fn send_registered(&self, registry: &mut PeerRegistry, peer_id: u32, function: Function, sub_function: u8, stream_id: u32, payload: &[u8]) {
        if let Some(peer) = registry.get_mut(peer_id) {
            let buf = peer.tx.encode(function, sub_function, stream_id, peer_id, payload);
            self.transport.send(peer.addr, &buf).await;
        }
    }

    async fn send_control_to_peer(&self, registry: &mut PeerRegistry, peer_id: u32, function: Function, tag: Tag, fields: &[u8]) {
        let payload = control_payload(tag, peer_id, fields);
        self.send_registered(registry, peer_id, function, SUB_FUNCTION_NONE, 0, &payload).await;
    }

    async fn send_nak(&self, peer_id: u32, to: SocketAddr) {
        let payload = control_payload(Tag::NAK, peer_id, &[]);
        let buf = self.unregistered_tx.lock().await
            .encode(Function::Nak, SUB_FUNCTION_NONE, 0, peer_id, &payload);
        self.transport.send(to, &buf).await;
    }

    /// Entry point for every received datagram
    pub async fn on_datagram(&self, buf: &[u8], from: SocketAddr) {
        let frame = match FneFrame::decode(buf) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(system = self.name(), "dropping malformed frame from {:?}: {}", from, e);
                return;
            }
        };
        trace!(system = self.name(), "received {:?} from {:?}", frame, from);

        let peer_id = frame.fne.peer_id;
        let stream_id = frame.fne.stream_id;

        // only the registered address of a connected peer may move its sequence tracking
        let sequence_check = {
            let mut registry = self.registry.lock().await;
            if registry.is_authorised_sender(peer_id, from) {
                registry.track_sequence(peer_id, stream_id, frame.rtp.sequence)
            }
            else {
                None
            }
        };
        if let Some(SequenceCheck::OutOfSequence { expected, actual }) = sequence_check {
            warn!(system = self.name(), peer_id, stream_id, "out of sequence frame: expected {}, got {}", expected, actual);
        }

        let Some(function) = frame.function() else {
            warn!(system = self.name(), peer_id, "unknown function 0x{:02X} - dropping", frame.fne.function);
            return;
        };

        match function {
            Function::Protocol => self.on_protocol(&frame, from).await,
            Function::Login => self.on_login(peer_id, from).await,
            Function::Auth => self.on_auth(&frame, from).await,
            Function::Config => self.on_config(&frame, from).await,
            Function::Ping => self.on_ping(peer_id, from).await,
            Function::RepeaterClosing => self.on_repeater_closing(peer_id, from).await,
            Function::GrantRequest => self.on_grant_request(&frame, from).await,
            Function::Transfer => self.on_transfer(&frame, from).await,
            Function::Announce => self.on_announce(&frame, from).await,
            Function::MasterCommand | Function::MasterClosing | Function::Pong | Function::Ack | Function::Nak => {
                warn!(system = self.name(), peer_id, "unexpected {:?} from {:?} - dropping", function, from);
            }
        }
    }

    async fn on_protocol(&self, frame: &FneFrame<'_>, from: SocketAddr) {
        let peer_id = frame.fne.peer_id;
        let stream_id = frame.fne.stream_id;

        let Ok(family) = TrafficFamily::try_from(frame.fne.sub_function) else {
            warn!(system = self.name(), peer_id, "unknown protocol 0x{:02X} - dropping", frame.fne.sub_function);
            return;
        };

        if !self.registry.lock().await.is_authorised_sender(peer_id, from) {
            warn!(system = self.name(), peer_id, "{:?} traffic from unknown or unauthorised peer at {:?} - NAK", family, from);
            self.send_nak(peer_id, from).await;
            return;
        }

        if stream_id == 0 {
            warn!(system = self.name(), peer_id, "{:?} traffic without stream id - dropping", family);
            return;
        }

        let traffic = match TrafficFrame::new(family, peer_id, stream_id, frame.rtp.sequence, frame.payload) {
            Ok(traffic) => traffic,
            Err(e) => {
                warn!(system = self.name(), peer_id, stream_id, "malformed traffic: {}", e);
                return;
            }
        };

        deliver_traffic(self.name(), self.handler.as_ref(), &traffic).await;
    }

    async fn on_login(&self, peer_id: u32, from: SocketAddr) {
        let salt = new_salt();
        let created = self.registry.lock().await
            .insert_new(peer_id, from, salt, Instant::now());

        if !created {
            warn!(system = self.name(), peer_id, "login from {:?} for a peer id that is already registered - NAK", from);
            self.send_nak(peer_id, from).await;
            return;
        }

        info!(system = self.name(), peer_id, "login request from {:?}", from);
        let mut registry = self.registry.lock().await;
        self.send_control_to_peer(&mut registry, peer_id, Function::Ack, Tag::ACK, &salt.to_be_bytes()).await;
    }

    async fn on_auth(&self, frame: &FneFrame<'_>, from: SocketAddr) {
        let peer_id = frame.fne.peer_id;
        let mut registry = self.registry.lock().await;

        let Some(peer) = registry.get_mut(peer_id) else {
            warn!(system = self.name(), peer_id, "authentication from unknown peer - NAK");
            drop(registry);
            self.send_nak(peer_id, from).await;
            return;
        };
        if peer.addr != from {
            warn!(system = self.name(), peer_id, "authentication from {:?}, but peer logged in from {:?} - NAK", from, peer.addr);
            drop(registry);
            self.send_nak(peer_id, from).await;
            return;
        }

        let hash = frame.payload.get(CONTROL_FIELDS_OFFSET..)
            .map(|h| &h[..h.len().min(AUTH_HASH_LENGTH)])
            .unwrap_or(&[]);

        if peer.state == ConnectionState::WaitingAuthorisation && verify_auth_hash(peer.salt, &self.config.passphrase, hash) {
            peer.state = ConnectionState::WaitingConfig;
            info!(system = self.name(), peer_id, "peer authenticated");
            self.send_control_to_peer(&mut registry, peer_id, Function::Ack, Tag::ACK, &[]).await;
        }
        else {
            warn!(system = self.name(), peer_id, "authentication failed in state {:?} - removing peer", peer.state);
            registry.remove(peer_id);
            drop(registry);
            self.send_nak(peer_id, from).await;
        }
    }

    async fn on_config(&self, frame: &FneFrame<'_>, from: SocketAddr) {
        let peer_id = frame.fne.peer_id;
        let mut registry = self.registry.lock().await;

        let Some(peer) = registry.get_mut(peer_id) else {
            warn!(system = self.name(), peer_id, "config from unknown peer - NAK");
            drop(registry);
            self.send_nak(peer_id, from).await;
            return;
        };
        if peer.addr != from {
            warn!(system = self.name(), peer_id, "config from {:?}, but peer logged in from {:?} - NAK", from, peer.addr);
            drop(registry);
            self.send_nak(peer_id, from).await;
            return;
        }
        if peer.state != ConnectionState::WaitingConfig {
            warn!(system = self.name(), peer_id, "config in state {:?} - removing peer", peer.state);
            registry.remove(peer_id);
            drop(registry);
            self.send_nak(peer_id, from).await;
            return;
        }

        let details = match PeerDetails::from_rptc_payload(frame.payload) {
            Ok(details) => details,
            Err(e) => {
                warn!(system = self.name(), peer_id, "could not parse peer config, using placeholder: {}", e);
                PeerDetails::out_of_date()
            }
        };

        peer.details = Some(details.clone());
        peer.state = ConnectionState::Running;
        peer.connected = true;
        peer.last_ping = Instant::now();
        info!(system = self.name(), peer_id, identity = details.identity.as_str(), "peer connected");

        self.send_control_to_peer(&mut registry, peer_id, Function::Ack, Tag::ACK, &[]).await;
        drop(registry);

        self.handler.on_peer_connected(peer_id, &details).await;
    }

    async fn on_ping(&self, peer_id: u32, from: SocketAddr) {
        let mut registry = self.registry.lock().await;

        let accepted = match registry.get_mut(peer_id) {
            Some(peer) if peer.is_running() && peer.addr == from => {
                peer.pings_received = peer.pings_received.wrapping_add(1);
                peer.last_ping = Instant::now();
                trace!(system = self.name(), peer_id, "ping #{}", peer.pings_received);
                true
            }
            _ => false,
        };

        if accepted {
            self.send_control_to_peer(&mut registry, peer_id, Function::Pong, Tag::PONG, &[]).await;
        }
        else {
            drop(registry);
            warn!(system = self.name(), peer_id, "ping from unknown or not running peer at {:?} - NAK", from);
            self.send_nak(peer_id, from).await;
        }
    }

    async fn on_repeater_closing(&self, peer_id: u32, from: SocketAddr) {
        let removed = {
            let mut registry = self.registry.lock().await;
            let known_sender = registry.get(peer_id)
                .map(|p| p.addr == from)
                .unwrap_or(false);
            if known_sender {
                registry.remove(peer_id)
            }
            else {
                None
            }
        };

        self.send_nak(peer_id, from).await;

        match removed {
            Some(peer) => {
                info!(system = self.name(), peer_id, "peer is closing its connection");
                if peer.connected {
                    self.handler.on_peer_disconnected(peer_id).await;
                }
            }
            None => debug!(system = self.name(), peer_id, "closing from unknown peer at {:?}", from),
        }
    }

    /// authorisation check shared by the opcodes that only running peers may send
    async fn check_running_sender(&self, frame: &FneFrame<'_>, from: SocketAddr) -> bool {
        let peer_id = frame.fne.peer_id;
        if self.registry.lock().await.is_authorised_sender(peer_id, from) {
            return true;
        }
        warn!(system = self.name(), peer_id, "0x{:02X} from unknown or unauthorised peer at {:?} - NAK", frame.fne.function, from);
        self.send_nak(peer_id, from).await;
        false
    }

    async fn on_grant_request(&self, frame: &FneFrame<'_>, from: SocketAddr) {
        if !self.check_running_sender(frame, from).await {
            return;
        }
        match GrantRequest::deser(frame.payload) {
            Ok(request) => {
                debug!(system = self.name(), peer_id = frame.fne.peer_id, "grant request {:?}", request);
                self.handler.on_grant_request(&request).await;
            }
            Err(e) => warn!(system = self.name(), peer_id = frame.fne.peer_id, "malformed grant request: {}", e),
        }
    }

    async fn on_transfer(&self, frame: &FneFrame<'_>, from: SocketAddr) {
        if !self.check_running_sender(frame, from).await {
            return;
        }
        let Ok(kind) = TransferSubFunction::try_from(frame.fne.sub_function) else {
            warn!(system = self.name(), peer_id = frame.fne.peer_id, "unknown transfer type 0x{:02X}", frame.fne.sub_function);
            return;
        };

        let text = String::from_utf8_lossy(frame.payload.get(CONTROL_FIELDS_OFFSET..).unwrap_or(&[]));
        self.handler.on_transfer(frame.fne.peer_id, kind, &text).await;
    }

    async fn on_announce(&self, frame: &FneFrame<'_>, from: SocketAddr) {
        if !self.check_running_sender(frame, from).await {
            return;
        }
        let Ok(kind) = AnnounceSubFunction::try_from(frame.fne.sub_function) else {
            debug!(system = self.name(), peer_id = frame.fne.peer_id, "ignoring announcement 0x{:02X}", frame.fne.sub_function);
            return;
        };
        if frame.payload.len() < 6 {
            warn!(system = self.name(), peer_id = frame.fne.peer_id, "announcement too short: {} bytes", frame.payload.len());
            return;
        }

        let src_id = get_u24(frame.payload, 0);
        let dst_id = get_u24(frame.payload, 3);
        let affiliated = kind == AnnounceSubFunction::GroupAffiliation;
        debug!(system = self.name(), peer_id = frame.fne.peer_id, src_id, dst_id, affiliated, "affiliation announcement");
        self.handler.on_affiliation(frame.fne.peer_id, src_id, dst_id, affiliated).await;
    }
}

/// Validation and ignore checks for a received traffic frame, then delivery to the handler. This
///  is shared by both roles.
pub(crate) async fn deliver_traffic(system: &str, handler: &dyn FneHandler, traffic: &TrafficFrame<'_>) {
    if !traffic.is_terminator() && !handler.validate(traffic).await {
        debug!(system, "rejected by validator: {:?}", traffic);
        return;
    }
    if handler.peer_ignored(traffic).await {
        trace!(system, "peer ignored: {:?}", traffic);
        return;
    }
    handler.on_traffic(traffic).await;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::fne::auth::auth_hash;
    use crate::fne::frame::RtpHeader;
    use crate::fne::opcodes::RTP_PAYLOAD_TYPE_TRAFFIC;
    use crate::test_util::frames::*;
    use crate::test_util::handler::{HandlerEvent, TrackingHandler};
    use crate::test_util::transport::TrackingTransport;

    const PEER: u32 = 312000;

    struct Fixture {
        master: FneMaster,
        transport: Arc<TrackingTransport>,
        handler: Arc<TrackingHandler>,
    }

    fn fixture() -> Fixture {
        let transport = Arc::new(TrackingTransport::new());
        let handler = Arc::new(TrackingHandler::accepting());
        let config = Arc::new(MasterConfig::new("master", test_addr(62031), "s3cret"));
        let master = FneMaster::new(config, transport.clone(), handler.clone());
        Fixture { master, transport, handler }
    }

    /// drives a peer through login, auth and config, returning the fixture with empty trackers
    async fn connected_fixture() -> Fixture {
        let f = fixture();
        let from = test_addr(1);

        f.master.on_datagram(&control_frame(Function::Login, PEER, Tag::LOGIN, &[]), from).await;
        let salt = f.transport.take_one().await.salt();

        f.master.on_datagram(&control_frame(Function::Auth, PEER, Tag::AUTH, &auth_hash(salt, "s3cret")), from).await;
        f.master.on_datagram(&config_frame(PEER, &PeerDetails::default()), from).await;

        f.transport.take_all().await;
        f.handler.take_events().await;
        f
    }

    #[tokio::test]
    async fn test_login_auth_config_reaches_running() {
        let f = fixture();
        let from = test_addr(1);

        f.master.on_datagram(&control_frame(Function::Login, PEER, Tag::LOGIN, &[]), from).await;
        let ack = f.transport.take_one().await;
        assert_eq!(ack.to, from);
        assert_eq!(ack.function(), Function::Ack);
        assert_eq!(ack.tag(), Tag::ACK);
        assert_eq!(ack.peer_id(), PEER);
        assert_eq!(f.master.connection_state(PEER).await, Some(ConnectionState::WaitingAuthorisation));

        f.master.on_datagram(&control_frame(Function::Auth, PEER, Tag::AUTH, &auth_hash(ack.salt(), "s3cret")), from).await;
        assert_eq!(f.transport.take_one().await.function(), Function::Ack);
        assert_eq!(f.master.connection_state(PEER).await, Some(ConnectionState::WaitingConfig));

        let details = PeerDetails { identity: "RPT1".to_string(), ..Default::default() };
        f.master.on_datagram(&config_frame(PEER, &details), from).await;
        assert_eq!(f.transport.take_one().await.function(), Function::Ack);
        assert_eq!(f.master.connection_state(PEER).await, Some(ConnectionState::Running));
        assert_eq!(f.master.running_peer_ids().await, vec![PEER]);
        assert_eq!(f.master.peer_details(PEER).await, Some(details.clone()));

        assert_eq!(f.handler.take_events().await, vec![HandlerEvent::PeerConnected(PEER, details)]);
    }

    #[tokio::test]
    async fn test_second_login_is_nakked() {
        let f = fixture();
        f.master.on_datagram(&control_frame(Function::Login, PEER, Tag::LOGIN, &[]), test_addr(1)).await;
        f.transport.take_all().await;

        f.master.on_datagram(&control_frame(Function::Login, PEER, Tag::LOGIN, &[]), test_addr(2)).await;
        let nak = f.transport.take_one().await;
        assert_eq!(nak.function(), Function::Nak);
        assert_eq!(nak.to, test_addr(2));
        assert_eq!(f.master.connection_state(PEER).await, Some(ConnectionState::WaitingAuthorisation));
    }

    #[tokio::test]
    async fn test_wrong_auth_hash_removes_peer() {
        let f = fixture();
        let from = test_addr(1);

        f.master.on_datagram(&control_frame(Function::Login, PEER, Tag::LOGIN, &[]), from).await;
        let salt = f.transport.take_one().await.salt();

        f.master.on_datagram(&control_frame(Function::Auth, PEER, Tag::AUTH, &auth_hash(salt, "wrong")), from).await;
        assert_eq!(f.transport.take_one().await.function(), Function::Nak);
        assert_eq!(f.master.connection_state(PEER).await, None);

        // the peer is unknown now: traffic is NAKed and never delivered
        f.master.on_datagram(&dmr_frame(PEER, 0x1234, 0, &dmr_voice_payload(1, 100, 1, 0x1234)), from).await;
        assert_eq!(f.transport.take_one().await.function(), Function::Nak);
        assert!(f.handler.take_events().await.is_empty());
    }

    #[tokio::test]
    async fn test_auth_in_wrong_state_removes_peer() {
        let f = connected_fixture().await;

        f.master.on_datagram(&control_frame(Function::Auth, PEER, Tag::AUTH, &[0u8; 32]), test_addr(1)).await;
        assert_eq!(f.transport.take_one().await.function(), Function::Nak);
        assert_eq!(f.master.connection_state(PEER).await, None);
    }

    #[tokio::test]
    async fn test_unparseable_config_uses_placeholder() {
        let f = fixture();
        let from = test_addr(1);
        f.master.on_datagram(&control_frame(Function::Login, PEER, Tag::LOGIN, &[]), from).await;
        let salt = f.transport.take_one().await.salt();
        f.master.on_datagram(&control_frame(Function::Auth, PEER, Tag::AUTH, &auth_hash(salt, "s3cret")), from).await;

        f.master.on_datagram(&control_frame(Function::Config, PEER, Tag::CONFIG, b"{not json"), from).await;

        assert_eq!(f.master.connection_state(PEER).await, Some(ConnectionState::Running));
        assert!(f.master.peer_details(PEER).await.unwrap().is_out_of_date());
        assert_eq!(f.handler.take_events().await, vec![HandlerEvent::PeerConnected(PEER, PeerDetails::out_of_date())]);
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let f = connected_fixture().await;

        f.master.on_datagram(&control_frame(Function::Ping, PEER, Tag::PING, &[]), test_addr(1)).await;
        let pong = f.transport.take_one().await;
        assert_eq!(pong.function(), Function::Pong);
        assert_eq!(pong.tag(), Tag::PONG);
        assert_eq!(f.master.registry.lock().await.get(PEER).unwrap().pings_received, 1);
    }

    #[tokio::test]
    async fn test_ping_from_unknown_peer_is_nakked() {
        let f = fixture();
        f.master.on_datagram(&control_frame(Function::Ping, PEER, Tag::PING, &[]), test_addr(1)).await;
        assert_eq!(f.transport.take_one().await.function(), Function::Nak);
    }

    #[tokio::test]
    async fn test_repeater_closing() {
        let f = connected_fixture().await;

        f.master.on_datagram(&control_frame(Function::RepeaterClosing, PEER, Tag::REPEATER_CLOSING, &[]), test_addr(1)).await;

        assert_eq!(f.transport.take_one().await.function(), Function::Nak);
        assert_eq!(f.master.connection_state(PEER).await, None);
        assert_eq!(f.handler.take_events().await, vec![HandlerEvent::PeerDisconnected(PEER)]);
    }

    #[tokio::test]
    async fn test_traffic_is_delivered() {
        let f = connected_fixture().await;

        f.master.on_datagram(&dmr_frame(PEER, 0x1234, 0, &dmr_voice_payload(1, 100, 1, 0x1234)), test_addr(1)).await;

        assert_eq!(f.handler.take_events().await, vec![HandlerEvent::Traffic(TrafficFamily::Dmr, PEER, 0x1234, 1, 100)]);
        f.transport.assert_nothing_sent().await;
    }

    #[tokio::test]
    async fn test_traffic_from_wrong_address_is_nakked() {
        let f = connected_fixture().await;

        f.master.on_datagram(&dmr_frame(PEER, 0x1234, 0, &dmr_voice_payload(1, 100, 1, 0x1234)), test_addr(2)).await;

        let nak = f.transport.take_one().await;
        assert_eq!(nak.function(), Function::Nak);
        assert_eq!(nak.to, test_addr(2));
        assert!(f.handler.take_events().await.is_empty());
    }

    #[tokio::test]
    async fn test_traffic_from_wrong_address_does_not_move_sequence() {
        let f = connected_fixture().await;
        f.master.on_datagram(&dmr_frame(PEER, 0x1234, 3, &dmr_voice_payload(1, 100, 1, 0x1234)), test_addr(1)).await;

        f.master.on_datagram(&dmr_frame(PEER, 0x9999, 40, &dmr_voice_payload(1, 100, 1, 0x9999)), test_addr(2)).await;

        let registry = f.master.registry.lock().await;
        let peer = registry.get(PEER).unwrap();
        assert_eq!(peer.stream_id, 0x1234);
        assert_eq!(peer.next_sequence, 4);
    }

    #[tokio::test]
    async fn test_traffic_without_stream_id_is_dropped() {
        let f = connected_fixture().await;

        f.master.on_datagram(&dmr_frame(PEER, 0, 0, &dmr_voice_payload(1, 100, 1, 0)), test_addr(1)).await;

        assert!(f.handler.take_events().await.is_empty());
        f.transport.assert_nothing_sent().await;
    }

    #[tokio::test]
    async fn test_malformed_frame_is_dropped_silently() {
        let f = connected_fixture().await;
        let mut buf = dmr_frame(PEER, 0x1234, 0, &dmr_voice_payload(1, 100, 1, 0x1234));
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;

        f.master.on_datagram(&buf, test_addr(1)).await;

        assert!(f.handler.take_events().await.is_empty());
        f.transport.assert_nothing_sent().await;
    }

    #[tokio::test]
    async fn test_validator_rejects_but_terminator_passes() {
        let transport = Arc::new(TrackingTransport::new());
        let handler = Arc::new(TrackingHandler::rejecting());
        let config = Arc::new(MasterConfig::new("master", test_addr(62031), "s3cret"));
        let master = FneMaster::new(config, transport.clone(), handler.clone());
        connect_peer(&master, &transport, PEER, test_addr(1), "s3cret").await;
        handler.take_events().await;

        master.on_datagram(&dmr_frame(PEER, 0x1234, 0, &dmr_voice_payload(1, 100, 1, 0x1234)), test_addr(1)).await;
        assert!(handler.take_events().await.is_empty());

        master.on_datagram(&dmr_frame(PEER, 0x1234, 1, &dmr_terminator_payload(1, 100, 1, 0x1234)), test_addr(1)).await;
        assert_eq!(handler.take_events().await, vec![HandlerEvent::Traffic(TrafficFamily::Dmr, PEER, 0x1234, 1, 100)]);
    }

    #[tokio::test]
    async fn test_ignored_peer_is_accounted_but_not_delivered() {
        let transport = Arc::new(TrackingTransport::new());
        let handler = Arc::new(TrackingHandler::ignoring());
        let config = Arc::new(MasterConfig::new("master", test_addr(62031), "s3cret"));
        let master = FneMaster::new(config, transport.clone(), handler.clone());
        connect_peer(&master, &transport, PEER, test_addr(1), "s3cret").await;
        handler.take_events().await;

        master.on_datagram(&dmr_frame(PEER, 0x1234, 7, &dmr_voice_payload(1, 100, 1, 0x1234)), test_addr(1)).await;

        assert!(handler.take_events().await.is_empty());
        let registry = master.registry.lock().await;
        let peer = registry.get(PEER).unwrap();
        assert_eq!(peer.stream_id, 0x1234);
        assert_eq!(peer.next_sequence, 8);
    }

    #[tokio::test]
    async fn test_out_of_sequence_frame_is_not_dropped() {
        let f = connected_fixture().await;
        for seq in [10, 11, 14] {
            f.master.on_datagram(&dmr_frame(PEER, 0x55, seq, &dmr_voice_payload(1, 100, 1, 0x55)), test_addr(1)).await;
        }

        assert_eq!(f.handler.take_events().await.len(), 3);
        assert_eq!(f.master.registry.lock().await.get(PEER).unwrap().next_sequence, 15);
    }

    #[tokio::test]
    async fn test_unexpected_payload_type_is_dropped() {
        let f = connected_fixture().await;
        let rtp = RtpHeader::new(0x12, 0, 0, 0x1234);
        let buf = FneFrame::encode(&rtp, 0x00, 0x00, 0x1234, PEER, &dmr_voice_payload(1, 100, 1, 0x1234));

        f.master.on_datagram(&buf, test_addr(1)).await;
        assert!(f.handler.take_events().await.is_empty());

        let rtp = RtpHeader::new(RTP_PAYLOAD_TYPE_TRAFFIC, 0, 0, 0x1234);
        let buf = FneFrame::encode(&rtp, 0x00, 0x00, 0x1234, PEER, &dmr_voice_payload(1, 100, 1, 0x1234));
        f.master.on_datagram(&buf, test_addr(1)).await;
        assert_eq!(f.handler.take_events().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_removes_silent_peer() {
        let f = connected_fixture().await;

        time::sleep(Duration::from_secs(10)).await;
        f.master.maintenance_sweep().await;
        assert_eq!(f.master.connection_state(PEER).await, Some(ConnectionState::Running));

        time::sleep(Duration::from_secs(5)).await;
        f.master.maintenance_sweep().await;
        assert_eq!(f.master.connection_state(PEER).await, Some(ConnectionState::Running));

        time::sleep(Duration::from_millis(1)).await;
        f.master.maintenance_sweep().await;
        assert_eq!(f.master.connection_state(PEER).await, None);
        assert_eq!(f.handler.take_events().await, vec![HandlerEvent::PeerDisconnected(PEER)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_keeps_peer_alive() {
        let f = connected_fixture().await;

        for _ in 0..5 {
            time::sleep(Duration::from_secs(5)).await;
            f.master.on_datagram(&control_frame(Function::Ping, PEER, Tag::PING, &[]), test_addr(1)).await;
            f.master.maintenance_sweep().await;
        }
        assert_eq!(f.master.connection_state(PEER).await, Some(ConnectionState::Running));
    }

    #[tokio::test]
    async fn test_send_traffic_to_filtered_running_peers() {
        let f = connected_fixture().await;
        connect_peer(&f.master, &f.transport, PEER + 1, test_addr(2), "s3cret").await;
        connect_peer(&f.master, &f.transport, PEER + 2, test_addr(3), "s3cret").await;

        let payload = dmr_voice_payload(1, 100, 1, 0x77);
        f.master.send_traffic(TrafficFamily::Dmr, 0x77, &payload, |id| id != PEER + 1).await;

        let mut sent = f.transport.take_all().await;
        sent.sort_by_key(|s| s.peer_id());
        assert_eq!(sent.iter().map(|s| (s.peer_id(), s.to)).collect::<Vec<_>>(), vec![(PEER, test_addr(1)), (PEER + 2, test_addr(3))]);
        for s in sent {
            let frame = s.frame();
            assert_eq!(frame.fne.stream_id, 0x77);
            assert_eq!(frame.fne.function, 0x00);
            assert_eq!(frame.payload, &payload[..]);
        }
    }

    #[tokio::test]
    async fn test_master_command() {
        let f = connected_fixture().await;

        assert!(f.master.send_master_command(PEER, MasterCommand::BlacklistRids, &[1, 2, 3]).await);
        assert!(!f.master.send_master_command(PEER + 1, MasterCommand::BlacklistRids, &[1, 2, 3]).await);

        let sent = f.transport.take_one().await;
        let frame = sent.frame();
        assert_eq!(frame.fne.function, 0x01);
        assert_eq!(frame.fne.sub_function, 0x01);
        assert_eq!(frame.payload, b"\0\0\0\x03\0\0\0\x01\0\0\0\x02\0\0\0\x03");
    }

    #[tokio::test]
    async fn test_grant_transfer_and_announce() {
        let f = connected_fixture().await;
        let from = test_addr(1);

        let request = GrantRequest { peer_id: PEER, src_id: 5, dst_id: 6, slot: 1, unit_to_unit: false };
        f.master.on_datagram(&control_frame_raw(Function::GrantRequest, 0, PEER, &request.ser()), from).await;
        f.master.on_datagram(&control_frame_raw(Function::Transfer, 0x01, PEER, &control_payload(Tag::TRANSFER, PEER, b"call ended")), from).await;
        f.master.on_datagram(&control_frame_raw(Function::Announce, 0x00, PEER, &[0, 0, 5, 0, 0, 100]), from).await;
        f.master.on_datagram(&control_frame_raw(Function::Announce, 0x03, PEER, &[0, 0, 5, 0, 0, 100]), from).await;

        assert_eq!(f.handler.take_events().await, vec![
            HandlerEvent::GrantRequest(request),
            HandlerEvent::Transfer(PEER, TransferSubFunction::ActivityLog, "call ended".to_string()),
            HandlerEvent::Affiliation(PEER, 5, 100, true),
            HandlerEvent::Affiliation(PEER, 5, 100, false),
        ]);
    }

    #[tokio::test]
    async fn test_close_notifies_peers() {
        let f = connected_fixture().await;

        f.master.close().await;

        let sent = f.transport.take_one().await;
        assert_eq!(sent.function(), Function::MasterClosing);
        assert!(f.master.running_peer_ids().await.is_empty());
        assert_eq!(f.handler.take_events().await, vec![HandlerEvent::PeerDisconnected(PEER)]);
    }

    #[tokio::test]
    async fn test_run_until_cancelled() {
        let f = connected_fixture().await;
        let cancel = CancellationToken::new();

        let transport = f.transport.clone();
        let canceller = cancel.clone();
        let injector = async move {
            transport.inject(control_frame(Function::Ping, PEER, Tag::PING, &[]), test_addr(1)).await;
            time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        };

        let (result, _) = tokio::join!(f.master.run(cancel), injector);
        assert!(result.is_ok());

        let functions = f.transport.take_all().await.iter().map(|s| s.function()).collect::<Vec<_>>();
        assert_eq!(functions, vec![Function::Pong, Function::MasterClosing]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recv_errors_back_off_until_cancelled() {
        let f = fixture();
        f.transport.fail_recv();
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        let stopper = async move {
            time::sleep(Duration::from_millis(3_500)).await;
            canceller.cancel();
        };
        let (result, _) = tokio::join!(f.master.run(cancel), stopper);

        assert!(result.is_ok());
        f.transport.assert_nothing_sent().await;
    }
}
