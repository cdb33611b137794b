pub mod hash;

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::Result;
use crate::metrics::CoreMetrics;
use crate::shim::{KernelShim, SetBatchOp};

/// The kernel representation an IP-set is realised as.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetKind {
    HashIp,
    HashIpPort,
    ListOfSets,
}

/// What an IP-set *means*, independent of its kernel representation. Carried explicitly
/// (rather than recovered later via a regex over the name, see Design Notes (c)) so the
/// debug converter never has to guess.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SemanticType {
    Namespace,
    KeyLabelOfNamespace,
    KeyValueLabelOfNamespace,
    KeyLabelOfPod,
    KeyValueLabelOfPod,
    NestedLabelOfPod,
    NamedPort,
    CidrBlocks,
    AllNamespaces,
    ListOfSets,
}

impl SemanticType {
    /// The kernel set kind a semantic type is always realised as (spec.md §4.2).
    ///
    /// `NestedLabelOfPod` is realised as `ListOfSets` whose children are the per-(key,value)
    /// sets it refers to (see the GLOSSARY's "Nested label" entry); §4.2's prose literally
    /// groups it with the hash-of-IP types, which this implementation treats as the
    /// distilled spec's own imprecision and resolves in favour of the GLOSSARY (see
    /// DESIGN.md).
    pub fn kind(&self) -> SetKind {
        match self {
            SemanticType::NamedPort => SetKind::HashIpPort,
            SemanticType::AllNamespaces | SemanticType::ListOfSets | SemanticType::NestedLabelOfPod => {
                SetKind::ListOfSets
            }
            _ => SetKind::HashIp,
        }
    }
}

/// One member of a `hash:ip`-kind set: either a bare IP or a CIDR block, the latter
/// optionally a negative ("nomatch") hole cut out of a broader IP-block peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpMember {
    pub cidr: String,
    pub nomatch: bool,
}

/// The full set of elements an IP-set may hold, one variant per `SetKind`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Members {
    /// owner keys per IP/CIDR member, used by hash-ip and (address part of) hash-ip-port sets
    ips: HashMap<String, HashSet<String>>,
    /// nomatch flag per IP/CIDR member (CIDR-blocks sets only)
    nomatch: HashMap<String, bool>,
    /// owner keys per child-set-name member, used by list-of-sets
    children: HashMap<String, HashSet<String>>,
}

impl Members {
    pub fn ip_entries(&self) -> Vec<IpMember> {
        let mut v: Vec<IpMember> = self
            .ips
            .keys()
            .map(|cidr| IpMember {
                cidr: cidr.clone(),
                nomatch: *self.nomatch.get(cidr).unwrap_or(&false),
            })
            .collect();
        v.sort_by(|a, b| a.cidr.cmp(&b.cidr));
        v
    }

    pub fn child_names(&self) -> Vec<String> {
        let mut v: Vec<String> = self.children.keys().cloned().collect();
        v.sort();
        v
    }

    pub fn is_empty(&self) -> bool {
        self.ips.is_empty() && self.children.is_empty()
    }
}

/// A named, reference-counted kernel IP-set record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IpSet {
    pub name: String,
    pub hashed_name: String,
    pub kind: SetKind,
    pub semantic_type: SemanticType,
    pub ref_count: u32,
    pub members: Members,
}

/// The in-memory, ref-counted registry of IP sets (spec.md §4.2).
///
/// All mutations are staged here and only reach the kernel via [`IpSetManager::apply`],
/// which batches every dirty record into one shim call.
pub struct IpSetManager {
    sets: HashMap<String, IpSet>,
    dirty: HashSet<String>,
    pending_delete: HashSet<String>,
}

impl Default for IpSetManager {
    fn default() -> Self {
        Self::new()
    }
}

impl IpSetManager {
    pub fn new() -> Self {
        Self {
            sets: HashMap::new(),
            dirty: HashSet::new(),
            pending_delete: HashSet::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&IpSet> {
        self.sets.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sets.contains_key(name)
    }

    /// Creates the record if missing and increments its reference count.
    pub fn ensure(&mut self, name: &str, semantic_type: SemanticType) -> &IpSet {
        let entry = self.sets.entry(name.to_string()).or_insert_with(|| {
            trace!(set = name, ?semantic_type, "creating ip set record");
            IpSet {
                name: name.to_string(),
                hashed_name: hash::hash_name(name),
                kind: semantic_type.kind(),
                semantic_type,
                ref_count: 0,
                members: Members::default(),
            }
        });
        entry.ref_count += 1;
        self.pending_delete.remove(name);
        self.dirty.insert(name.to_string());
        self.sets.get(name).unwrap()
    }

    /// Decrements the reference count; at zero the set is marked for deletion on next apply.
    pub fn release(&mut self, name: &str) {
        if let Some(set) = self.sets.get_mut(name) {
            set.ref_count = set.ref_count.saturating_sub(1);
            if set.ref_count == 0 {
                self.pending_delete.insert(name.to_string());
                self.dirty.insert(name.to_string());
            }
        }
    }

    /// Idempotent per `(element, owner_key)`: re-adding the same pair from a second owner
    /// is a no-op on the kernel member but still tracked so the element survives until
    /// every owner has released it.
    pub fn add_member(&mut self, name: &str, element: &str, owner_key: &str) {
        self.add_member_inner(name, element, owner_key, false);
    }

    /// CIDR-blocks convenience: add a member with the `nomatch` (exception) flag set.
    pub fn add_nomatch_member(&mut self, name: &str, element: &str, owner_key: &str) {
        self.add_member_inner(name, element, owner_key, true);
    }

    fn add_member_inner(&mut self, name: &str, element: &str, owner_key: &str, nomatch: bool) {
        let Some(set) = self.sets.get_mut(name) else {
            return;
        };
        match set.kind {
            SetKind::ListOfSets => {
                set.members
                    .children
                    .entry(element.to_string())
                    .or_default()
                    .insert(owner_key.to_string());
            }
            SetKind::HashIp | SetKind::HashIpPort => {
                set.members
                    .ips
                    .entry(element.to_string())
                    .or_default()
                    .insert(owner_key.to_string());
                set.members.nomatch.insert(element.to_string(), nomatch);
            }
        }
        self.dirty.insert(name.to_string());
    }

    /// Idempotent per `(element, owner_key)`: a second removal of the same pair is a no-op.
    pub fn remove_member(&mut self, name: &str, element: &str, owner_key: &str) {
        let Some(set) = self.sets.get_mut(name) else {
            return;
        };
        let became_empty = match set.kind {
            SetKind::ListOfSets => {
                if let Some(owners) = set.members.children.get_mut(element) {
                    owners.remove(owner_key);
                    let now_empty = owners.is_empty();
                    if now_empty {
                        set.members.children.remove(element);
                    }
                    now_empty
                } else {
                    false
                }
            }
            SetKind::HashIp | SetKind::HashIpPort => {
                if let Some(owners) = set.members.ips.get_mut(element) {
                    owners.remove(owner_key);
                    let now_empty = owners.is_empty();
                    if now_empty {
                        set.members.ips.remove(element);
                        set.members.nomatch.remove(element);
                    }
                    now_empty
                } else {
                    false
                }
            }
        };
        if became_empty {
            self.dirty.insert(name.to_string());
        }
    }

    /// Serialises every dirty record into a kernel batch and applies it via the shim.
    ///
    /// On success the dirty list is cleared (and fully-released sets are dropped from the
    /// registry); on failure the dirty list is left intact so the next reconcile retries.
    /// Either way the batch is counted on `metrics` (spec.md §B.4).
    pub async fn apply(&mut self, shim: &dyn KernelShim, metrics: &CoreMetrics) -> Result<()> {
        if self.dirty.is_empty() {
            return Ok(());
        }

        let mut ops = Vec::new();
        let mut dirty: Vec<String> = self.dirty.iter().cloned().collect();
        dirty.sort();

        for name in &dirty {
            if self.pending_delete.contains(name) {
                if let Some(set) = self.sets.get(name) {
                    ops.push(SetBatchOp::Destroy {
                        hashed_name: set.hashed_name.clone(),
                    });
                }
                continue;
            }
            let Some(set) = self.sets.get(name) else {
                continue;
            };
            ops.push(SetBatchOp::Create {
                hashed_name: set.hashed_name.clone(),
                kind: set.kind,
            });
            ops.push(SetBatchOp::Flush {
                hashed_name: set.hashed_name.clone(),
            });
            match set.kind {
                SetKind::ListOfSets => {
                    for child in set.members.child_names() {
                        let child_hashed = self
                            .sets
                            .get(&child)
                            .map(|c| c.hashed_name.clone())
                            .unwrap_or_else(|| hash::hash_name(&child));
                        ops.push(SetBatchOp::Add {
                            hashed_name: set.hashed_name.clone(),
                            element: child_hashed,
                        });
                    }
                }
                SetKind::HashIp | SetKind::HashIpPort => {
                    for entry in set.members.ip_entries() {
                        ops.push(SetBatchOp::Add {
                            hashed_name: set.hashed_name.clone(),
                            element: if entry.nomatch {
                                format!("{},nomatch", entry.cidr)
                            } else {
                                entry.cidr
                            },
                        });
                    }
                }
            }
        }

        metrics.ipset_apply_total.inc();
        if let Err(e) = shim.set_apply(&ops).await {
            metrics.ipset_apply_failures_total.inc();
            return Err(e);
        }

        for name in dirty {
            if self.pending_delete.remove(&name) {
                self.sets.remove(&name);
            }
        }
        self.dirty.clear();
        Ok(())
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IpSet> {
        self.sets.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::shim::MockShim;

    #[test]
    fn ensure_and_release_round_trip() {
        let mut mgr = IpSetManager::new();
        mgr.ensure("ns-default", SemanticType::Namespace);
        assert_eq!(mgr.get("ns-default").unwrap().ref_count, 1);
        mgr.ensure("ns-default", SemanticType::Namespace);
        assert_eq!(mgr.get("ns-default").unwrap().ref_count, 2);
        mgr.release("ns-default");
        assert_eq!(mgr.get("ns-default").unwrap().ref_count, 1);
    }

    #[test]
    fn add_member_idempotent_per_owner() {
        let mut mgr = IpSetManager::new();
        mgr.ensure("ns-default", SemanticType::Namespace);
        mgr.add_member("ns-default", "10.0.0.1", "y/a");
        mgr.add_member("ns-default", "10.0.0.1", "y/a");
        assert_eq!(mgr.get("ns-default").unwrap().members.ip_entries().len(), 1);
        mgr.remove_member("ns-default", "10.0.0.1", "y/a");
        assert!(mgr.get("ns-default").unwrap().members.ip_entries().is_empty());
        // second removal is a no-op
        mgr.remove_member("ns-default", "10.0.0.1", "y/a");
        assert!(mgr.get("ns-default").unwrap().members.ip_entries().is_empty());
    }

    #[test]
    fn multiple_owners_keep_member_until_all_release() {
        let mut mgr = IpSetManager::new();
        mgr.ensure("ns-default", SemanticType::Namespace);
        mgr.add_member("ns-default", "10.0.0.1", "policy-a");
        mgr.add_member("ns-default", "10.0.0.1", "policy-b");
        mgr.remove_member("ns-default", "10.0.0.1", "policy-a");
        assert_eq!(mgr.get("ns-default").unwrap().members.ip_entries().len(), 1);
        mgr.remove_member("ns-default", "10.0.0.1", "policy-b");
        assert!(mgr.get("ns-default").unwrap().members.ip_entries().is_empty());
    }

    #[tokio::test]
    async fn apply_clears_dirty_on_success() {
        let mut mgr = IpSetManager::new();
        mgr.ensure("ns-default", SemanticType::Namespace);
        mgr.add_member("ns-default", "10.0.0.1", "y/a");
        let shim = MockShim::default();
        let metrics = Metrics::new(&[]);
        mgr.apply(&shim, &metrics.core).await.unwrap();
        assert_eq!(mgr.dirty_count(), 0);
        assert_eq!(shim.set_apply_calls(), 1);
        assert_eq!(metrics.core.ipset_apply_total.get(), 1);
        assert_eq!(metrics.core.ipset_apply_failures_total.get(), 0);
    }

    #[tokio::test]
    async fn apply_leaves_dirty_on_failure() {
        let mut mgr = IpSetManager::new();
        mgr.ensure("ns-default", SemanticType::Namespace);
        let shim = MockShim::failing();
        let metrics = Metrics::new(&[]);
        assert!(mgr.apply(&shim, &metrics.core).await.is_err());
        assert_eq!(mgr.dirty_count(), 1);
        assert_eq!(metrics.core.ipset_apply_failures_total.get(), 1);
    }

    #[test]
    fn release_to_zero_marks_pending_delete() {
        let mut mgr = IpSetManager::new();
        mgr.ensure("ns-default", SemanticType::Namespace);
        mgr.release("ns-default");
        assert!(mgr.pending_delete.contains("ns-default"));
    }
}
