use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use shv_client::RpcPeer;
use shv_rpc::RpcRI;

/// Idle limit applied between accept and a finished login.
pub const LOGIN_TIMEOUT: Duration = Duration::from_secs(5);
/// Idle limit applied after login unless the client asked for another one.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(180);

/// Book-keeping of one connected peer.
pub struct PeerEntry {
    pub peer: RpcPeer,
    /// Name of the logged-in user; `None` until login finishes.
    pub user: Option<String>,
    pub mount: Option<String>,
    pub idle_timeout: Duration,
    /// Whether the peer was identified as a broker itself.
    pub is_broker: Option<bool>,
}

/// The broker tables; always mutated under one lock, each mutation a single
/// atomic step from the tasks' point of view.
#[derive(Default)]
pub struct BrokerState {
    peers: HashMap<i64, PeerEntry>,
    next_peer_id: i64,
    /// `mount path -> peer id`; no mount is a prefix of another.
    mounts: BTreeMap<String, i64>,
    /// `subscription -> subscribed peer ids`.
    subs: BTreeMap<RpcRI, BTreeSet<i64>>,
    /// Reference counts of subscriptions forwarded to mounted sub-brokers,
    /// keyed by mount path and the RI relative to it.
    forwarded: HashMap<String, HashMap<RpcRI, usize>>,
}

impl BrokerState {
    pub fn register(&mut self, peer: RpcPeer) -> i64 {
        let id = self.next_peer_id;
        self.next_peer_id += 1;
        self.peers.insert(
            id,
            PeerEntry {
                peer,
                user: None,
                mount: None,
                idle_timeout: LOGIN_TIMEOUT,
                is_broker: None,
            },
        );
        id
    }

    /// Drop a peer, returning its mount (if any) for the lsmod signal and
    /// the forwarded subscriptions that reached zero because of it.
    pub fn unregister(&mut self, id: i64) -> (Option<String>, Vec<(i64, RpcRI)>) {
        let mut removed_subs = Vec::new();
        for (ri, ids) in std::mem::take(&mut self.subs) {
            let mut ids = ids;
            ids.remove(&id);
            if ids.is_empty() {
                removed_subs.push(ri);
            } else {
                self.subs.insert(ri, ids);
            }
        }
        let mut gone_upstream = Vec::new();
        for ri in removed_subs {
            gone_upstream.extend(self.forward_release(&ri));
        }
        let mount = self.peers.get(&id).and_then(|e| e.mount.clone());
        if let Some(mount) = &mount {
            self.mounts.remove(mount);
            self.forwarded.remove(mount);
        }
        self.peers.remove(&id);
        (mount, gone_upstream)
    }

    pub fn entry(&self, id: i64) -> Option<&PeerEntry> {
        self.peers.get(&id)
    }

    pub fn entry_mut(&mut self, id: i64) -> Option<&mut PeerEntry> {
        self.peers.get_mut(&id)
    }

    pub fn peer(&self, id: i64) -> Option<RpcPeer> {
        self.peers.get(&id).map(|e| e.peer.clone())
    }

    pub fn peer_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.peers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn mounts(&self) -> Vec<String> {
        self.mounts.keys().cloned().collect()
    }

    pub fn mounted_peers(&self) -> Vec<(String, i64)> {
        self.mounts.iter().map(|(m, id)| (m.clone(), *id)).collect()
    }

    /// Whether `candidate` collides with the mount table: equal to, prefix
    /// of, or extension of an existing mount.
    pub fn mount_conflicts(&self, candidate: &str) -> bool {
        self.mounts.keys().any(|mnt| {
            mnt == candidate
                || mnt.starts_with(&format!("{candidate}/"))
                || candidate.starts_with(&format!("{mnt}/"))
        })
    }

    /// Install a mount; the caller already checked for conflicts.
    pub fn mount(&mut self, id: i64, mount: String) {
        self.mounts.insert(mount.clone(), id);
        if let Some(entry) = self.peers.get_mut(&id) {
            entry.mount = Some(mount);
        }
    }

    pub fn mount_of(&self, id: i64) -> Option<String> {
        self.peers.get(&id).and_then(|e| e.mount.clone())
    }

    /// Resolve a path to the peer mounted under it; gives the peer id and
    /// the path relative to the mount point.
    ///
    /// `.broker/client/<id>/…` addresses a peer directly. Mounts cannot
    /// nest, so the first match is the only one.
    pub fn peer_on_path(&self, path: &str) -> Option<(i64, String)> {
        if let Some(rest) = path.strip_prefix(".broker/client/") {
            let (id, rel) = match rest.split_once('/') {
                Some((id, rel)) => (id, rel),
                None => (rest, ""),
            };
            let id: i64 = id.parse().ok()?;
            self.peers.contains_key(&id).then(|| (id, rel.to_string()))
        } else {
            self.mounts.iter().find_map(|(mnt, id)| {
                if path == mnt {
                    Some((*id, String::new()))
                } else {
                    path.strip_prefix(&format!("{mnt}/"))
                        .map(|rel| (*id, rel.to_string()))
                }
            })
        }
    }

    /// Add a subscription for a peer. True when the broker newly tracks the
    /// RI; the second element lists sub-broker forwards going 0 to 1.
    pub fn subscribe(&mut self, ri: RpcRI, id: i64) -> (bool, Vec<(i64, RpcRI)>) {
        if let Some(ids) = self.subs.get_mut(&ri) {
            ids.insert(id);
            return (false, Vec::new());
        }
        self.subs.insert(ri.clone(), BTreeSet::from([id]));
        (true, self.forward_acquire(&ri))
    }

    /// Remove a peer's subscription. True when the RI was tracked; the
    /// second element lists sub-broker forwards going 1 to 0.
    pub fn unsubscribe(&mut self, ri: &RpcRI, id: i64) -> (bool, Vec<(i64, RpcRI)>) {
        let Some(ids) = self.subs.get_mut(ri) else {
            return (false, Vec::new());
        };
        ids.remove(&id);
        if !ids.is_empty() {
            return (true, Vec::new());
        }
        self.subs.remove(ri);
        (true, self.forward_release(ri))
    }

    pub fn subscriptions(&self, id: Option<i64>) -> Vec<RpcRI> {
        self.subs
            .iter()
            .filter(|(_, ids)| id.is_none_or(|id| ids.contains(&id)))
            .map(|(ri, _)| ri.clone())
            .collect()
    }

    /// Peers whose subscription matches the signal.
    pub fn signal_targets(&self, path: &str, source: &str, signal: &str) -> Vec<i64> {
        let mut res = BTreeSet::new();
        for (ri, ids) in &self.subs {
            if ri.signal_match(path, source, signal) {
                res.extend(ids);
            }
        }
        res.into_iter().collect()
    }

    /// Count a new RI against every mounted sub-broker it applies to,
    /// reporting the forwards that need an upstream subscribe.
    fn forward_acquire(&mut self, ri: &RpcRI) -> Vec<(i64, RpcRI)> {
        let mut res = Vec::new();
        for (mount, id) in self.mounts.clone() {
            if self.peers.get(&id).and_then(|e| e.is_broker) != Some(true) {
                continue;
            }
            if let Some(rel) = ri.relative_to(&mount) {
                let counter = self
                    .forwarded
                    .entry(mount.clone())
                    .or_default()
                    .entry(rel.clone())
                    .or_insert(0);
                *counter += 1;
                if *counter == 1 {
                    res.push((id, rel));
                }
            }
        }
        res
    }

    /// Drop an RI's count on every mounted sub-broker, reporting forwards
    /// that need an upstream unsubscribe.
    fn forward_release(&mut self, ri: &RpcRI) -> Vec<(i64, RpcRI)> {
        let mut res = Vec::new();
        for (mount, id) in self.mounts.clone() {
            if let Some(rel) = ri.relative_to(&mount) {
                if let Some(counters) = self.forwarded.get_mut(&mount) {
                    if let Some(counter) = counters.get_mut(&rel) {
                        *counter -= 1;
                        if *counter == 0 {
                            counters.remove(&rel);
                            res.push((id, rel));
                        }
                    }
                }
            }
        }
        res
    }

    /// Build the forward table for a freshly mounted sub-broker from the
    /// current subscriptions; reports the RIs to subscribe upstream.
    pub fn forward_rebuild(&mut self, mount: &str) -> Vec<RpcRI> {
        let mut counters: HashMap<RpcRI, usize> = HashMap::new();
        for ri in self.subs.keys() {
            if let Some(rel) = ri.relative_to(mount) {
                *counters.entry(rel).or_insert(0) += 1;
            }
        }
        let ris = counters.keys().cloned().collect();
        self.forwarded.insert(mount.to_string(), counters);
        ris
    }

    /// The `lsmod` change a mount appearance or disappearance causes:
    /// `(parent path, child name)` of the topmost tree node that changed.
    pub fn lsmod_change(mount: &str, remaining: &[String]) -> (String, String) {
        let segs: Vec<&str> = mount.split('/').collect();
        for i in 1..=segs.len() {
            let prefix = segs[..i].join("/");
            let shared = remaining
                .iter()
                .any(|m| *m == prefix || m.starts_with(&format!("{prefix}/")));
            if !shared {
                return (segs[..i - 1].join("/"), segs[i - 1].to_string());
            }
        }
        (
            segs[..segs.len() - 1].join("/"),
            segs[segs.len() - 1].to_string(),
        )
    }
}
