use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::routing::snapshot::SnapshotStore;

/// Radio id white- and blacklist. An empty whitelist admits every id that is not blacklisted.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct RadioIdLists {
    pub whitelist: FxHashSet<u32>,
    pub blacklist: FxHashSet<u32>,
}

impl RadioIdLists {
    pub fn new(whitelist: impl IntoIterator<Item = u32>, blacklist: impl IntoIterator<Item = u32>) -> RadioIdLists {
        RadioIdLists {
            whitelist: whitelist.into_iter().collect(),
            blacklist: blacklist.into_iter().collect(),
        }
    }

    pub fn from_json(json: &[u8]) -> anyhow::Result<RadioIdLists> {
        Ok(serde_json::from_slice(json)?)
    }

    pub fn permits(&self, radio_id: u32) -> bool {
        !self.blacklist.contains(&radio_id)
            && (self.whitelist.is_empty() || self.whitelist.contains(&radio_id))
    }

    pub fn sorted_whitelist(&self) -> Vec<u32> {
        sorted(&self.whitelist)
    }

    pub fn sorted_blacklist(&self) -> Vec<u32> {
        sorted(&self.blacklist)
    }
}

fn sorted(ids: &FxHashSet<u32>) -> Vec<u32> {
    let mut result = ids.iter().copied().collect::<Vec<_>>();
    result.sort();
    result
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait RadioIdSource: Send + Sync + 'static {
    async fn load(&self) -> anyhow::Result<RadioIdLists>;
}

pub type AclStore = SnapshotStore<RadioIdLists>;

impl SnapshotStore<RadioIdLists> {
    pub fn with_lists(lists: RadioIdLists) -> AclStore {
        SnapshotStore::new("radio id lists", lists)
    }
}
