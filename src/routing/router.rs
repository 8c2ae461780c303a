use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::fne::handler::{FneHandler, GrantRequest};
use crate::fne::master::FneMaster;
use crate::fne::opcodes::{MasterCommand, TrafficFamily, TransferSubFunction};
use crate::fne::peer_details::PeerDetails;
use crate::fne::system::FneSystem;
use crate::fne::traffic::{FrameKind, TrafficFrame, DMR_DT_VOICE_LC_HEADER};
use crate::routing::acl::{AclStore, RadioIdLists, RadioIdSource};
use crate::routing::affiliation::GroupAffiliationTable;
use crate::routing::call_events::{CallEndData, CallEvent, CallEventNotifier, CallStartData, CollisionData, RouteRejectedData};
use crate::routing::contention::{ContentionResolver, Decision, RouteCandidate};
use crate::routing::link_control::{LinkControl, LinkControlCodec, PrivacyLc};
use crate::routing::rewriter::FrameRewriter;
use crate::routing::rules::{RuleDestination, RuleSource, RuleStore, RuleTable};
use crate::routing::slot_status::{ReceiveOutcome, SystemStatus};

pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_millis(360);

#[derive(Debug)]
pub struct RouterConfig {
    /// a slot counts as busy with a call for this long after its last frame
    pub stream_timeout: Duration,
    pub rule_reload_interval: Duration,
    pub acl_reload_interval: Duration,
}

impl RouterConfig {
    pub fn new() -> RouterConfig {
        RouterConfig {
            stream_timeout: DEFAULT_STREAM_TIMEOUT,
            rule_reload_interval: Duration::from_secs(60),
            acl_reload_interval: Duration::from_secs(60),
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig::new()
    }
}

/// Routing state for one attached system
struct RoutedSystem {
    name: String,
    system: Arc<FneSystem>,
    status: Mutex<SystemStatus>,
    affiliations: Mutex<GroupAffiliationTable>,
}

impl RoutedSystem {
    fn master(&self) -> Option<&FneMaster> {
        match self.system.as_ref() {
            FneSystem::Master(master) => Some(master),
            FneSystem::Peer(_) => None,
        }
    }
}

/// Link control decoded from the headers of the call a frame belongs to
#[derive(Debug, Clone, Copy, Default)]
struct ReceivedLc {
    lc: Option<LinkControl>,
    pi: Option<PrivacyLc>,
}

/// Which peers of a master target receive a forwarded frame
struct PeerFilter {
    ignored: Vec<u32>,
    /// `None` if the target rule does not require affiliation
    affiliated: Option<Vec<u32>>,
    /// the peer a frame came from, if it is routed back into its own system
    origin: Option<u32>,
}

impl PeerFilter {
    fn accepts(&self, peer_id: u32) -> bool {
        Some(peer_id) != self.origin
            && !self.ignored.contains(&peer_id)
            && self.affiliated.as_ref().map_or(true, |peers| peers.contains(&peer_id))
    }
}

/// Routes traffic between FNE systems according to the routing rules. Every system gets its
///  [FneHandler] from [Router::handler_for] and is attached to the router once it is created.
///
/// Each attached system has its own slot status table behind its own lock. At most one of these
///  locks is held at any time: the source system's status is updated and released before any
///  target's status is locked.
pub struct Router {
    config: Arc<RouterConfig>,
    rules: RuleStore,
    acl: AclStore,
    resolver: ContentionResolver,
    rewriter: FrameRewriter,
    systems: RwLock<FxHashMap<String, Arc<RoutedSystem>>>,
    events: CallEventNotifier,
}

impl Router {
    pub fn new(config: Arc<RouterConfig>, rules: RuleTable, acl: RadioIdLists, codec: Arc<dyn LinkControlCodec>) -> Arc<Router> {
        Arc::new(Router {
            resolver: ContentionResolver::new(config.stream_timeout),
            config,
            rules: RuleStore::with_rules(rules),
            acl: AclStore::with_lists(acl),
            rewriter: FrameRewriter::new(codec),
            systems: Default::default(),
            events: CallEventNotifier::new(),
        })
    }

    pub fn rules(&self) -> &RuleStore {
        &self.rules
    }

    pub fn acl(&self) -> &AclStore {
        &self.acl
    }

    /// The handler to create the protocol instance for system `name` with
    pub fn handler_for(self: &Arc<Self>, name: &str) -> Arc<SystemHandler> {
        Arc::new(SystemHandler {
            router: Arc::downgrade(self),
            system: name.to_string(),
        })
    }

    /// Makes a system available as a routing source and target. Attaching a system with the same
    ///  name again replaces it and resets its slot status.
    pub async fn attach(&self, system: Arc<FneSystem>) {
        let name = system.name().to_string();
        info!(system = name.as_str(), "attaching system to router");

        let routed = RoutedSystem {
            name: name.clone(),
            system,
            status: Default::default(),
            affiliations: Default::default(),
        };
        self.systems.write().await
            .insert(name, Arc::new(routed));
    }

    pub fn call_events(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    async fn system(&self, name: &str) -> Option<Arc<RoutedSystem>> {
        self.systems.read().await
            .get(name)
            .cloned()
    }

    async fn masters(&self) -> Vec<Arc<RoutedSystem>> {
        self.systems.read().await
            .values()
            .filter(|s| s.system.is_master())
            .cloned()
            .collect()
    }

    /// Reloads rules and radio id lists from their sources until `cancel` is triggered, and
    ///  pushes changes to the peers of all attached masters
    pub async fn run(&self, cancel: CancellationToken, rule_source: Arc<dyn RuleSource>, acl_source: Arc<dyn RadioIdSource>) {
        let rule_changes = self.rules.subscribe();
        let acl_changes = self.acl.subscribe();

        tokio::join!(
            self.rules.run_reload_loop(self.config.rule_reload_interval, cancel.clone(), || rule_source.load()),
            self.acl.run_reload_loop(self.config.acl_reload_interval, cancel.clone(), || acl_source.load()),
            self.push_changes(rule_changes, acl_changes, cancel.clone()),
        );
    }

    async fn push_changes(&self, mut rule_changes: watch::Receiver<Arc<RuleTable>>, mut acl_changes: watch::Receiver<Arc<RadioIdLists>>, cancel: CancellationToken) {
        loop {
            select! {
                _ = cancel.cancelled() => break,
                changed = rule_changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    for routed in self.masters().await {
                        self.broadcast_talkgroups(&routed.name).await;
                    }
                }
                changed = acl_changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let lists = self.acl.snapshot();
                    for routed in self.masters().await {
                        if let Some(master) = routed.master() {
                            for peer_id in master.running_peer_ids().await {
                                send_radio_id_lists(master, peer_id, &lists).await;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Pushes the active and deactivated talkgroups of a master system to all its running peers,
    ///  if its rule asks for that
    pub async fn broadcast_talkgroups(&self, system: &str) {
        let Some(routed) = self.system(system).await else {
            debug!(system, "not broadcasting talkgroups for unknown system");
            return;
        };
        let Some(master) = routed.master() else {
            return;
        };

        let rules = self.rules.snapshot();
        for peer_id in master.running_peer_ids().await {
            send_talkgroups(master, peer_id, &rules).await;
        }
    }

    async fn on_peer_connected(&self, system: &str, peer_id: u32) {
        let Some(routed) = self.system(system).await else {
            warn!(system, peer_id, "peer connected to a system that is not attached");
            return;
        };
        let Some(master) = routed.master() else {
            return;
        };

        send_radio_id_lists(master, peer_id, &self.acl.snapshot()).await;
        send_talkgroups(master, peer_id, &self.rules.snapshot()).await;
    }

    async fn on_peer_disconnected(&self, system: &str, peer_id: u32) {
        if let Some(routed) = self.system(system).await {
            routed.affiliations.lock().await
                .remove_peer(peer_id);
        }
    }

    async fn on_affiliation(&self, system: &str, peer_id: u32, src_id: u32, tgid: u32, affiliated: bool) {
        let Some(routed) = self.system(system).await else {
            warn!(system, peer_id, "affiliation for a system that is not attached");
            return;
        };

        let mut affiliations = routed.affiliations.lock().await;
        if affiliated {
            debug!(system, peer_id, src_id, "affiliation with TG {}", tgid);
            affiliations.affiliate(peer_id, src_id, tgid);
        }
        else {
            debug!(system, peer_id, src_id, "unaffiliation from TG {}", tgid);
            affiliations.unaffiliate(peer_id, src_id, tgid);
        }
    }

    /// Radio id ACL, and talkgroup activation for group calls
    fn validate(&self, system: &str, frame: &TrafficFrame<'_>) -> bool {
        let src_id = frame.src_id();
        if !self.acl.snapshot().permits(src_id) {
            debug!(system, src_id, "radio id not permitted");
            return false;
        }
        if frame.is_group_call() && !self.rules.snapshot().is_active(system, frame.family, frame.dst_id(), frame.slot()) {
            debug!(system, src_id, "TG {} on slot {} is not active", frame.dst_id(), frame.slot());
            return false;
        }
        true
    }

    fn is_peer_ignored(&self, system: &str, frame: &TrafficFrame<'_>) -> bool {
        self.rules.snapshot()
            .find(system, frame.family, frame.dst_id(), frame.slot())
            .map(|rule| rule.is_peer_ignored(frame.peer_id))
            .unwrap_or(false)
    }

    /// Tracks a frame received by `source` and forwards it to all destinations of matching rules
    pub async fn route(&self, source: &str, frame: &TrafficFrame<'_>) {
        let Some(source_system) = self.system(source).await else {
            warn!(system = source, "traffic for a system that is not attached - dropping");
            return;
        };
        let now = Instant::now();
        let slot = frame.slot();

        let (outcome, received) = {
            let mut status = source_system.status.lock().await;
            let slot_status = status.slot_mut(frame.family, slot);
            let outcome = slot_status.on_receive(frame, now, self.config.stream_timeout);

            if frame.family == TrafficFamily::Dmr && outcome.is_forwarded() {
                match frame.kind() {
                    FrameKind::VoiceHeader => match self.rewriter.codec().decode_full(frame.dmr_burst(), DMR_DT_VOICE_LC_HEADER) {
                        Ok(lc) => slot_status.rx_lc = Some(lc),
                        Err(e) => debug!(system = source, stream_id = frame.stream_id, "could not decode voice header LC: {}", e),
                    },
                    FrameKind::PrivacyHeader => match self.rewriter.codec().decode_pi_header(frame.dmr_burst()) {
                        Ok(pi) => slot_status.rx_pi_lc = Some(pi),
                        Err(e) => debug!(system = source, stream_id = frame.stream_id, "could not decode PI header: {}", e),
                    },
                    _ => {}
                }
            }
            (outcome, ReceivedLc { lc: slot_status.rx_lc, pi: slot_status.rx_pi_lc })
        };

        self.report(source, frame, outcome);
        if !outcome.is_forwarded() {
            return;
        }
        if !frame.is_group_call() {
            trace!(system = source, stream_id = frame.stream_id, "private call is not routed");
            return;
        }

        let rules = self.rules.snapshot();
        for rule in rules.routes(source, frame.family, frame.dst_id(), slot) {
            for destination in &rule.destinations {
                self.route_to(source, frame, received, destination, &rules, now).await;
            }
        }
    }

    fn report(&self, source: &str, frame: &TrafficFrame<'_>, outcome: ReceiveOutcome) {
        let stream_id = frame.stream_id;
        match outcome {
            ReceiveOutcome::CallStart => {
                info!(system = source, stream_id, "{:?} call start from {} to TG {} on slot {}", frame.family, frame.src_id(), frame.dst_id(), frame.slot());
                self.events.send_event(CallEvent::CallStart(CallStartData {
                    system: source.to_string(),
                    family: frame.family,
                    slot: frame.slot(),
                    src_id: frame.src_id(),
                    tgid: frame.dst_id(),
                    stream_id,
                }));
            }
            ReceiveOutcome::CallEnd { duration } => {
                info!(system = source, stream_id, "{:?} call end from {} to TG {} on slot {}, {:.2}s", frame.family, frame.src_id(), frame.dst_id(), frame.slot(), duration.as_secs_f64());
                self.events.send_event(CallEvent::CallEnd(CallEndData {
                    system: source.to_string(),
                    family: frame.family,
                    slot: frame.slot(),
                    src_id: frame.src_id(),
                    tgid: frame.dst_id(),
                    stream_id,
                    duration,
                }));
            }
            ReceiveOutcome::Collision { active_src_id } => {
                warn!(system = source, stream_id, "{:?} collision on slot {}: {} keyed up during call from {} - dropping", frame.family, frame.slot(), frame.src_id(), active_src_id);
                self.events.send_event(CallEvent::Collision(CollisionData {
                    system: source.to_string(),
                    family: frame.family,
                    slot: frame.slot(),
                    src_id: frame.src_id(),
                    active_src_id,
                }));
            }
            ReceiveOutcome::StaleTerminator => {
                debug!(system = source, stream_id, "terminator for a call that is not active - ignoring");
            }
            ReceiveOutcome::Continuation => {}
        }
    }

    async fn route_to(&self, source: &str, frame: &TrafficFrame<'_>, received: ReceivedLc, destination: &RuleDestination, rules: &RuleTable, now: Instant) {
        let Some(target) = self.system(&destination.network).await else {
            debug!(system = source, "no attached system {} to route to", destination.network);
            return;
        };
        // P25 and NXDN have one fixed pseudo-slot, regardless of the destination's slot
        let target_slot = if frame.family == TrafficFamily::Dmr { destination.slot } else { 1 };

        let Some(peer_filter) = self.peer_filter(source, frame, &target, destination.tgid, target_slot, rules).await else {
            trace!(system = source, stream_id = frame.stream_id, "no peer of {} affiliated with TG {}", target.name, destination.tgid);
            return;
        };

        // nobody would receive the frame, so the target slot must not look busy
        if !target.system.has_recipient(|peer_id| peer_filter.accepts(peer_id)).await {
            trace!(system = source, stream_id = frame.stream_id, "no peer of {} to route TG {} to", target.name, destination.tgid);
            return;
        }

        let candidate = RouteCandidate {
            tgid: destination.tgid,
            src_id: frame.src_id(),
            stream_id: frame.stream_id,
        };

        let payload = {
            let mut status = target.status.lock().await;
            let slot_status = status.slot_mut(frame.family, target_slot);

            let decision = self.resolver.evaluate(slot_status, &candidate, rules.hangtime(&target.name), now);
            let new_stream = match decision {
                Decision::Forward { new_stream } => new_stream,
                Decision::Reject(reason) => {
                    info!(system = source, stream_id = frame.stream_id, "not routing TG {} to {} TG {} slot {}: {}", frame.dst_id(), target.name, destination.tgid, target_slot, reason);
                    self.events.send_event(CallEvent::RouteRejected(RouteRejectedData {
                        source: source.to_string(),
                        target: target.name.clone(),
                        tgid: destination.tgid,
                        slot: target_slot,
                        reason,
                    }));
                    return;
                }
            };

            self.resolver.apply(slot_status, &candidate, decision, now);
            if new_stream {
                debug!(system = source, stream_id = frame.stream_id, "routing TG {} to {} TG {} slot {}", frame.dst_id(), target.name, destination.tgid, target_slot);
                if frame.family == TrafficFamily::Dmr {
                    match self.rewriter.regenerate_lc(frame, received.lc.as_ref(), destination.tgid) {
                        Ok(lc) => slot_status.tx_lc = Some(lc),
                        Err(e) => warn!(system = source, stream_id = frame.stream_id, "could not encode link control for {}: {}", target.name, e),
                    }
                }
            }

            // the PI header can change within a stream, so it is compared rather than cached once
            if let (FrameKind::PrivacyHeader, Some(pi)) = (frame.kind(), received.pi) {
                let expected = PrivacyLc { dst_id: destination.tgid, ..pi };
                if slot_status.tx_pi_lc.as_ref().map(|cached| cached.lc) != Some(expected) {
                    match self.rewriter.regenerate_pi_lc(&pi, destination.tgid) {
                        Ok(pi_lc) => slot_status.tx_pi_lc = Some(pi_lc),
                        Err(e) => warn!(system = source, stream_id = frame.stream_id, "could not encode PI header for {}: {}", target.name, e),
                    }
                }
            }

            self.rewriter.rewrite(frame, destination.tgid, target_slot, slot_status.tx_lc.as_ref(), slot_status.tx_pi_lc.as_ref())
        };

        target.system.send_traffic(frame.family, frame.stream_id, &payload, |peer_id| peer_filter.accepts(peer_id)).await;
    }

    /// `None` if the target is a master, its rule requires affiliation, and no peer is affiliated
    async fn peer_filter(&self, source: &str, frame: &TrafficFrame<'_>, target: &RoutedSystem, tgid: u32, slot: u8, rules: &RuleTable) -> Option<PeerFilter> {
        let origin = (target.name == source).then_some(frame.peer_id);

        let Some(rule) = rules.find(&target.name, frame.family, tgid, slot).filter(|_| target.system.is_master()) else {
            return Some(PeerFilter { ignored: vec![], affiliated: None, origin });
        };

        let affiliated = if rule.requires_affiliation() {
            let peers = target.affiliations.lock().await
                .affiliated_peers(tgid);
            if peers.is_empty() {
                return None;
            }
            Some(peers)
        }
        else {
            None
        };

        Some(PeerFilter {
            ignored: rule.config.ignored.clone(),
            affiliated,
            origin,
        })
    }
}

async fn send_radio_id_lists(master: &FneMaster, peer_id: u32, lists: &RadioIdLists) {
    master.send_master_command(peer_id, MasterCommand::WhitelistRids, &lists.sorted_whitelist()).await;
    master.send_master_command(peer_id, MasterCommand::BlacklistRids, &lists.sorted_blacklist()).await;
}

async fn send_talkgroups(master: &FneMaster, peer_id: u32, rules: &RuleTable) {
    let send_tgid = rules.system(master.name())
        .map(|r| r.send_tgid)
        .unwrap_or(false);
    if !send_tgid {
        return;
    }

    let (active, deactivated) = rules.talkgroups(master.name());
    master.send_master_command(peer_id, MasterCommand::ActiveTgids, &active).await;
    master.send_master_command(peer_id, MasterCommand::DeactiveTgids, &deactivated).await;
}

/// The [FneHandler] of one system, connecting it to the router
pub struct SystemHandler {
    router: Weak<Router>,
    system: String,
}

#[async_trait]
impl FneHandler for SystemHandler {
    async fn validate(&self, frame: &TrafficFrame<'_>) -> bool {
        match self.router.upgrade() {
            Some(router) => router.validate(&self.system, frame),
            None => false,
        }
    }

    async fn peer_ignored(&self, frame: &TrafficFrame<'_>) -> bool {
        match self.router.upgrade() {
            Some(router) => router.is_peer_ignored(&self.system, frame),
            None => false,
        }
    }

    async fn on_traffic(&self, frame: &TrafficFrame<'_>) {
        if let Some(router) = self.router.upgrade() {
            router.route(&self.system, frame).await;
        }
    }

    async fn on_peer_connected(&self, peer_id: u32, _details: &PeerDetails) {
        if let Some(router) = self.router.upgrade() {
            router.on_peer_connected(&self.system, peer_id).await;
        }
    }

    async fn on_peer_disconnected(&self, peer_id: u32) {
        if let Some(router) = self.router.upgrade() {
            router.on_peer_disconnected(&self.system, peer_id).await;
        }
    }

    async fn on_master_connected(&self) {
        info!(system = self.system.as_str(), "connected to master");
    }

    async fn on_master_disconnected(&self) {
        warn!(system = self.system.as_str(), "connection to master lost");
    }

    async fn on_master_command(&self, command: MasterCommand, ids: &[u32]) {
        debug!(system = self.system.as_str(), "{:?} from master: {} ids", command, ids.len());
    }

    async fn on_grant_request(&self, request: &GrantRequest) {
        info!(system = self.system.as_str(), peer_id = request.peer_id, "grant request from {} to {} on slot {}", request.src_id, request.dst_id, request.slot);
    }

    async fn on_transfer(&self, peer_id: u32, kind: TransferSubFunction, text: &str) {
        match kind {
            TransferSubFunction::ActivityLog => info!(system = self.system.as_str(), peer_id, "activity: {}", text),
            TransferSubFunction::DiagnosticLog => debug!(system = self.system.as_str(), peer_id, "diagnostics: {}", text),
        }
    }

    async fn on_affiliation(&self, peer_id: u32, src_id: u32, dst_id: u32, affiliated: bool) {
        if let Some(router) = self.router.upgrade() {
            router.on_affiliation(&self.system, peer_id, src_id, dst_id, affiliated).await;
        }
    }
}
