use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::select;
use tokio::sync::Mutex;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::fne::auth::auth_hash;
use crate::fne::config::PeerConfig;
use crate::fne::frame::{FneFrame, OutboundSequencer};
use crate::fne::handler::{FneHandler, GrantRequest};
use crate::fne::master::{control_payload, deliver_traffic, CONTROL_FIELDS_OFFSET};
use crate::fne::opcodes::{AnnounceSubFunction, Function, MasterCommand, Tag, TrafficFamily, TransferSubFunction, SUB_FUNCTION_NONE};
use crate::fne::peer_registry::ConnectionState;
use crate::fne::traffic::TrafficFrame;
use crate::fne::transport::Transport;
use crate::util::buf::{get_u32, set_u24, try_get_id_list};

/// The peer's view of its single connection to the master
#[derive(Debug)]
struct PeerSession {
    state: ConnectionState,
    salt: u32,
    connected: bool,
    pings_sent: u32,
    pongs_received: u32,
    /// pings sent since the last pong
    missed_pings: u32,
    /// maintenance ticks spent in the current handshake phase
    handshake_ticks: u32,
    rx_stream_id: u32,
    rx_next_sequence: u16,
    tx: OutboundSequencer,
}

impl PeerSession {
    fn new() -> PeerSession {
        PeerSession {
            state: ConnectionState::WaitingLogin,
            salt: 0,
            connected: false,
            pings_sent: 0,
            pongs_received: 0,
            missed_pings: 0,
            handshake_ticks: 0,
            rx_stream_id: 0,
            rx_next_sequence: 0,
            tx: OutboundSequencer::new(),
        }
    }

    /// back to square one, returning whether the session was connected before
    fn reset(&mut self) -> bool {
        let was_connected = self.connected;
        self.state = ConnectionState::WaitingLogin;
        self.salt = 0;
        self.connected = false;
        self.missed_pings = 0;
        self.handshake_ticks = 0;
        was_connected
    }

    fn is_running(&self) -> bool {
        self.connected && self.state == ConnectionState::Running
    }
}

/// The peer role of the FNE protocol: it logs into a configured master, keeps the connection
///  alive with pings, and exchanges traffic with the master.
pub struct FnePeer {
    config: Arc<PeerConfig>,
    transport: Arc<dyn Transport>,
    handler: Arc<dyn FneHandler>,
    session: Mutex<PeerSession>,
}

impl Debug for FnePeer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "FnePeer{{{}:{} -> {:?}}}", self.config.name, self.config.peer_id, self.config.master_addr)
    }
}

impl FnePeer {
    pub fn new(config: Arc<PeerConfig>, transport: Arc<dyn Transport>, handler: Arc<dyn FneHandler>) -> FnePeer {
        FnePeer {
            config,
            transport,
            handler,
            session: Mutex::new(PeerSession::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.session.lock().await.state
    }

    pub async fn is_running(&self) -> bool {
        self.session.lock().await.is_running()
    }

    /// Runs the receive loop and the maintenance loop until `cancel` is triggered, closing the
    ///  connection to the master afterwards.
    pub async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        info!(system = self.name(), peer_id = self.config.peer_id, "starting FNE peer, master is {:?}", self.config.master_addr);

        tokio::join!(
            self.recv_loop(&cancel),
            self.maintenance_loop(&cancel),
        );

        self.close().await;
        info!(system = self.name(), "FNE peer stopped");
        Ok(())
    }

    async fn recv_loop(&self, cancel: &CancellationToken) {
        loop {
            select! {
                _ = cancel.cancelled() => break,
                received = self.transport.recv() => match received {
                    Ok((buf, from)) => self.on_datagram(&buf, from).await,
                    Err(e) => {
                        warn!(system = self.name(), "error receiving datagram, reconnecting: {}", e);
                        self.reconnect().await;
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
                _ = ticks.tick() => self.maintenance_tick().await,
            }
        }
    }

    /// Logs in while disconnected, pings while running, and gives up on a connection whose pings
    ///  or handshake went unanswered for too long.
    pub async fn maintenance_tick(&self) {
        let mut session = self.session.lock().await;

        match session.state {
            ConnectionState::WaitingLogin => {
                debug!(system = self.name(), "sending login to {:?}", self.config.master_addr);
                let buf = self.encode_control(&mut session, Function::Login, Tag::LOGIN, &[]);
                drop(session);
                self.send_to_master(&buf).await;
            }
            ConnectionState::Running => {
                if session.missed_pings >= self.config.max_missed_pings {
                    warn!(system = self.name(), "master did not answer {} pings - reconnecting", session.missed_pings);
                    let was_connected = session.reset();
                    drop(session);
                    self.notify_disconnected(was_connected).await;
                    return;
                }

                session.pings_sent = session.pings_sent.wrapping_add(1);
                session.missed_pings += 1;
                trace!(system = self.name(), "ping #{}", session.pings_sent);
                let buf = self.encode_control(&mut session, Function::Ping, Tag::PING, &[]);
                drop(session);
                self.send_to_master(&buf).await;
            }
            ConnectionState::WaitingAuthorisation | ConnectionState::WaitingConfig => {
                session.handshake_ticks += 1;
                if session.handshake_ticks > self.config.max_missed_pings {
                    warn!(system = self.name(), "handshake stalled in {:?} - starting over", session.state);
                    session.reset();
                }
            }
        }
    }

    /// drops the session and logs in again right away
    async fn reconnect(&self) {
        let mut session = self.session.lock().await;
        let was_connected = session.reset();
        let buf = self.encode_control(&mut session, Function::Login, Tag::LOGIN, &[]);
        drop(session);

        self.send_to_master(&buf).await;
        self.notify_disconnected(was_connected).await;
    }

    /// Notifies the master that this peer is going away, and resets the session
    pub async fn close(&self) {
        let mut session = self.session.lock().await;
        if session.state == ConnectionState::WaitingLogin {
            return;
        }

        info!(system = self.name(), "closing connection to master");
        let buf = self.encode_control(&mut session, Function::RepeaterClosing, Tag::REPEATER_CLOSING, &[]);
        let was_connected = session.reset();
        drop(session);

        self.send_to_master(&buf).await;
        self.notify_disconnected(was_connected).await;
    }

    async fn notify_disconnected(&self, was_connected: bool) {
        if was_connected {
            self.handler.on_master_disconnected().await;
        }
    }

    fn encode_control(&self, session: &mut PeerSession, function: Function, tag: Tag, fields: &[u8]) -> BytesMut {
        let payload = control_payload(tag, self.config.peer_id, fields);
        session.tx.encode(function, SUB_FUNCTION_NONE, 0, self.config.peer_id, &payload)
    }

    async fn send_to_master(&self, buf: &[u8]) {
        self.transport.send(self.config.master_addr, buf).await;
    }

    /// Sends a frame to the master if the connection is running, returning whether it was sent
    async fn send_if_running(&self, function: Function, sub_function: u8, stream_id: u32, payload: &[u8]) -> bool {
        let mut session = self.session.lock().await;
        if !session.is_running() {
            debug!(system = self.name(), "not connected to master - dropping outbound {:?}", function);
            return false;
        }
        let buf = session.tx.encode(function, sub_function, stream_id, self.config.peer_id, payload);
        drop(session);

        self.send_to_master(&buf).await;
        true
    }

    pub async fn send_traffic(&self, family: TrafficFamily, stream_id: u32, payload: &[u8]) -> bool {
        self.send_if_running(Function::Protocol, family.into(), stream_id, payload).await
    }

    /// transfers activity or diagnostic log text to the master
    pub async fn transfer_log(&self, kind: TransferSubFunction, text: &str) -> bool {
        let payload = control_payload(Tag::TRANSFER, self.config.peer_id, text.as_bytes());
        self.send_if_running(Function::Transfer, kind.into(), 0, &payload).await
    }

    pub async fn send_grant_request(&self, src_id: u32, dst_id: u32, slot: u8, unit_to_unit: bool) -> bool {
        let request = GrantRequest {
            peer_id: self.config.peer_id,
            src_id,
            dst_id,
            slot,
            unit_to_unit,
        };
        self.send_if_running(Function::GrantRequest, SUB_FUNCTION_NONE, 0, &request.ser()).await
    }

    /// announces a unit's (un-)affiliation with a talkgroup to the master
    pub async fn send_affiliation(&self, src_id: u32, dst_id: u32, affiliated: bool) -> bool {
        let mut payload = BytesMut::zeroed(6);
        set_u24(&mut payload, 0, src_id);
        set_u24(&mut payload, 3, dst_id);

        let kind = if affiliated { AnnounceSubFunction::GroupAffiliation } else { AnnounceSubFunction::GroupUnaffiliation };
        self.send_if_running(Function::Announce, kind.into(), 0, &payload).await
    }

    /// Entry point for every received datagram
    pub async fn on_datagram(&self, buf: &[u8], from: SocketAddr) {
        if from != self.config.master_addr {
            debug!(system = self.name(), "dropping datagram from {:?}, which is not the master", from);
            return;
        }

        let frame = match FneFrame::decode(buf) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(system = self.name(), "dropping malformed frame from master: {}", e);
                return;
            }
        };
        trace!(system = self.name(), "received {:?}", frame);

        let Some(function) = frame.function() else {
            warn!(system = self.name(), "unknown function 0x{:02X} - dropping", frame.fne.function);
            return;
        };

        match function {
            Function::Ack => self.on_ack(&frame).await,
            Function::Nak => {
                warn!(system = self.name(), "master sent NAK - logging in again");
                self.reset_and_notify().await;
            }
            Function::MasterClosing => {
                info!(system = self.name(), "master is closing");
                self.reset_and_notify().await;
            }
            Function::Pong => {
                let mut session = self.session.lock().await;
                if session.is_running() {
                    session.missed_pings = 0;
                    session.pongs_received = session.pongs_received.wrapping_add(1);
                }
            }
            Function::Protocol => self.on_protocol(&frame).await,
            Function::MasterCommand => self.on_master_command(&frame).await,
            _ => warn!(system = self.name(), "unexpected {:?} from master - dropping", function),
        }
    }

    async fn reset_and_notify(&self) {
        let was_connected = self.session.lock().await.reset();
        self.notify_disconnected(was_connected).await;
    }

    async fn on_ack(&self, frame: &FneFrame<'_>) {
        if frame.fne.peer_id != self.config.peer_id {
            warn!(system = self.name(), "ACK for peer id {} - logging in again", frame.fne.peer_id);
            self.reset_and_notify().await;
            return;
        }

        let mut session = self.session.lock().await;
        match session.state {
            ConnectionState::WaitingLogin => {
                let Some(salt) = frame.payload.get(CONTROL_FIELDS_OFFSET..CONTROL_FIELDS_OFFSET + 4) else {
                    warn!(system = self.name(), "login ACK without salt: {} bytes", frame.payload.len());
                    return;
                };
                session.salt = get_u32(salt, 0);
                session.state = ConnectionState::WaitingAuthorisation;
                session.handshake_ticks = 0;
                debug!(system = self.name(), "login accepted, authenticating");

                let hash = auth_hash(session.salt, &self.config.passphrase);
                let buf = self.encode_control(&mut session, Function::Auth, Tag::AUTH, &hash);
                drop(session);
                self.send_to_master(&buf).await;
            }
            ConnectionState::WaitingAuthorisation => {
                let payload = match self.config.details.to_rptc_payload(self.config.peer_id) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(system = self.name(), "could not serialize peer details: {}", e);
                        session.reset();
                        return;
                    }
                };
                session.state = ConnectionState::WaitingConfig;
                session.handshake_ticks = 0;
                debug!(system = self.name(), "authenticated, sending config");

                let buf = session.tx.encode(Function::Config, SUB_FUNCTION_NONE, 0, self.config.peer_id, &payload);
                drop(session);
                self.send_to_master(&buf).await;
            }
            ConnectionState::WaitingConfig => {
                session.state = ConnectionState::Running;
                session.connected = true;
                session.missed_pings = 0;
                session.handshake_ticks = 0;
                drop(session);

                info!(system = self.name(), "connected to master {:?}", self.config.master_addr);
                self.handler.on_master_connected().await;
            }
            ConnectionState::Running => {
                trace!(system = self.name(), "ACK while running - ignoring");
            }
        }
    }

    async fn on_protocol(&self, frame: &FneFrame<'_>) {
        let stream_id = frame.fne.stream_id;

        let Ok(family) = TrafficFamily::try_from(frame.fne.sub_function) else {
            warn!(system = self.name(), "unknown protocol 0x{:02X} - dropping", frame.fne.sub_function);
            return;
        };

        {
            let mut session = self.session.lock().await;
            if !session.is_running() {
                debug!(system = self.name(), "{:?} traffic while not connected - dropping", family);
                return;
            }
            if stream_id == 0 {
                warn!(system = self.name(), "{:?} traffic without stream id - dropping", family);
                return;
            }

            let sequence = frame.rtp.sequence;
            if session.rx_stream_id != stream_id {
                session.rx_stream_id = stream_id;
            }
            else if sequence != session.rx_next_sequence {
                warn!(system = self.name(), stream_id, "out of sequence frame: expected {}, got {}", session.rx_next_sequence, sequence);
            }
            session.rx_next_sequence = sequence.wrapping_add(1);
        }

        // frames from the master carry the recipient's peer id, the originating peer is unknown
        let traffic = match TrafficFrame::new(family, frame.fne.peer_id, stream_id, frame.rtp.sequence, frame.payload) {
            Ok(traffic) => traffic,
            Err(e) => {
                warn!(system = self.name(), stream_id, "malformed traffic: {}", e);
                return;
            }
        };

        deliver_traffic(self.name(), self.handler.as_ref(), &traffic).await;
    }

    async fn on_master_command(&self, frame: &FneFrame<'_>) {
        if !self.session.lock().await.is_running() {
            debug!(system = self.name(), "master command while not connected - dropping");
            return;
        }

        let Ok(command) = MasterCommand::try_from(frame.fne.sub_function) else {
            warn!(system = self.name(), "unknown master command 0x{:02X}", frame.fne.sub_function);
            return;
        };

        let mut buf = frame.payload;
        match try_get_id_list(&mut buf) {
            Ok(ids) => {
                debug!(system = self.name(), "master command {:?} with {} ids", command, ids.len());
                self.handler.on_master_command(command, &ids).await;
            }
            Err(e) => warn!(system = self.name(), "malformed master command {:?}: {}", command, e),
        }
    }
}
