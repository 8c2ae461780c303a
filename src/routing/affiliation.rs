use rustc_hash::{FxHashMap, FxHashSet};

/// For one master: which radio ids are affiliated with which talkgroups, per peer. A radio id is
///  affiliated with at most one talkgroup per peer at any time.
#[derive(Debug, Default)]
pub struct GroupAffiliationTable {
    /// peer id -> talkgroup -> radio ids
    peers: FxHashMap<u32, FxHashMap<u32, FxHashSet<u32>>>,
}

impl GroupAffiliationTable {
    pub fn new() -> GroupAffiliationTable {
        Default::default()
    }

    /// affiliates `src_id` with `tgid` on a peer, dropping its previous affiliation there
    pub fn affiliate(&mut self, peer_id: u32, src_id: u32, tgid: u32) {
        let groups = self.peers.entry(peer_id).or_default();
        for (_, members) in groups.iter_mut() {
            members.remove(&src_id);
        }
        groups.retain(|_, members| !members.is_empty());

        groups.entry(tgid).or_default().insert(src_id);
    }

    pub fn unaffiliate(&mut self, peer_id: u32, src_id: u32, tgid: u32) {
        if let Some(groups) = self.peers.get_mut(&peer_id) {
            if let Some(members) = groups.get_mut(&tgid) {
                members.remove(&src_id);
                if members.is_empty() {
                    groups.remove(&tgid);
                }
            }
            if groups.is_empty() {
                self.peers.remove(&peer_id);
            }
        }
    }

    pub fn remove_peer(&mut self, peer_id: u32) {
        self.peers.remove(&peer_id);
    }

    pub fn is_affiliated(&self, peer_id: u32, tgid: u32) -> bool {
        self.peers.get(&peer_id)
            .map(|groups| groups.contains_key(&tgid))
            .unwrap_or(false)
    }

    /// all peers with at least one radio id affiliated with `tgid`, sorted
    pub fn affiliated_peers(&self, tgid: u32) -> Vec<u32> {
        let mut result = self.peers.iter()
            .filter(|(_, groups)| groups.contains_key(&tgid))
            .map(|(&peer_id, _)| peer_id)
            .collect::<Vec<_>>();
        result.sort();
        result
    }
}
