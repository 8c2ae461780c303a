use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::fne::opcodes::TrafficFamily;
use crate::routing::snapshot::SnapshotStore;

/// In an ignored peer list, this entry means 'only affiliated peers'
pub const IGNORED_PEER_REQUIRE_AFFILIATION: u32 = 0;

/// The routing rules for one system
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RoutingRule {
    /// the system the rules apply to
    pub name: String,
    /// seconds
    pub group_hangtime: u32,
    pub master: bool,
    /// a master pushes its active and deactivated talkgroups to its peers
    pub send_tgid: bool,
    pub group_voice: Vec<GroupVoiceRule>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct GroupVoiceRule {
    pub name: String,
    pub source: RuleSourceAddr,
    pub config: GroupVoiceConfig,
    pub destinations: Vec<RuleDestination>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, Eq, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RuleSourceAddr {
    pub tgid: u32,
    pub slot: u8,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct GroupVoiceConfig {
    pub active: bool,
    pub affiliated: bool,
    pub routable: bool,
    pub ignored: Vec<u32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RuleDestination {
    pub network: String,
    pub tgid: u32,
    pub slot: u8,
}

impl GroupVoiceRule {
    /// P25 and NXDN have a single pseudo-slot, so only the talkgroup is compared for them
    pub fn matches(&self, family: TrafficFamily, tgid: u32, slot: u8) -> bool {
        self.source.tgid == tgid && (family != TrafficFamily::Dmr || self.source.slot == slot)
    }

    pub fn requires_affiliation(&self) -> bool {
        self.config.affiliated || self.config.ignored.contains(&IGNORED_PEER_REQUIRE_AFFILIATION)
    }

    pub fn is_peer_ignored(&self, peer_id: u32) -> bool {
        peer_id != IGNORED_PEER_REQUIRE_AFFILIATION && self.config.ignored.contains(&peer_id)
    }
}

impl RoutingRule {
    pub fn hangtime(&self) -> Duration {
        Duration::from_secs(self.group_hangtime.into())
    }
}

/// All routing rules, keyed by system name
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RuleTable {
    systems: FxHashMap<String, RoutingRule>,
}

impl RuleTable {
    pub fn new(rules: Vec<RoutingRule>) -> RuleTable {
        RuleTable {
            systems: rules.into_iter()
                .map(|r| (r.name.clone(), r))
                .collect(),
        }
    }

    /// the rule document is a JSON array of [RoutingRule]s
    pub fn from_json(json: &[u8]) -> anyhow::Result<RuleTable> {
        let rules: Vec<RoutingRule> = serde_json::from_slice(json)?;
        Ok(RuleTable::new(rules))
    }

    pub fn system(&self, name: &str) -> Option<&RoutingRule> {
        self.systems.get(name)
    }

    pub fn hangtime(&self, system: &str) -> Duration {
        self.system(system)
            .map(|r| r.hangtime())
            .unwrap_or_default()
    }

    /// The first group voice rule of `system` with this source, regardless of its flags
    pub fn find(&self, system: &str, family: TrafficFamily, tgid: u32, slot: u8) -> Option<&GroupVoiceRule> {
        self.system(system)?
            .group_voice.iter()
            .find(|r| r.matches(family, tgid, slot))
    }

    pub fn is_active(&self, system: &str, family: TrafficFamily, tgid: u32, slot: u8) -> bool {
        self.system(system)
            .map(|s| s.group_voice.iter().any(|r| r.matches(family, tgid, slot) && r.config.active))
            .unwrap_or(false)
    }

    /// All active and routable rules of `system` with this source
    pub fn routes<'a>(&'a self, system: &str, family: TrafficFamily, tgid: u32, slot: u8) -> impl Iterator<Item = &'a GroupVoiceRule> + 'a {
        self.system(system)
            .into_iter()
            .flat_map(|s| s.group_voice.iter())
            .filter(move |r| r.matches(family, tgid, slot) && r.config.active && r.config.routable)
    }

    /// active and deactivated talkgroups of a system, each sorted and without duplicates
    pub fn talkgroups(&self, system: &str) -> (Vec<u32>, Vec<u32>) {
        let mut active = FxHashSet::default();
        let mut deactivated = FxHashSet::default();
        for rule in self.system(system).into_iter().flat_map(|s| s.group_voice.iter()) {
            if rule.config.active {
                active.insert(rule.source.tgid);
            }
            else {
                deactivated.insert(rule.source.tgid);
            }
        }
        // a talkgroup with an active rule on any slot counts as active
        deactivated.retain(|tgid| !active.contains(tgid));

        let mut active = active.into_iter().collect::<Vec<_>>();
        let mut deactivated = deactivated.into_iter().collect::<Vec<_>>();
        active.sort();
        deactivated.sort();
        (active, deactivated)
    }
}

/// Where routing rules are loaded from, e.g. a rule file or a management API
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RuleSource: Send + Sync + 'static {
    async fn load(&self) -> anyhow::Result<RuleTable>;
}

pub type RuleStore = SnapshotStore<RuleTable>;

impl SnapshotStore<RuleTable> {
    pub fn with_rules(rules: RuleTable) -> RuleStore {
        SnapshotStore::new("routing rules", rules)
    }
}
