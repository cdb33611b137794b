//! NPM Cache (spec.md §4.6): the node-local view of every namespace, pod, and IP set the
//! controllers have observed, kept for the debug endpoint and the traffic analyzer. Guarded
//! by a single reader/writer lock since writers (the three controllers) and readers (the
//! debug HTTP handler) run concurrently.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::ipset::{IpSetManager, SemanticType, SetKind};
use crate::model::{NamespaceSnapshot, ObjectKey, PodSnapshot};
use crate::translate::RequiredSet;

/// `hashed-name -> canonical-name` entry for a plain (hash:ip / hash:ip,port) set.
///
/// Carries `semantic_type` explicitly (spec.md §9 Design Notes (c)) so the debug converter
/// never has to recover it with a name-pattern heuristic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SetCacheEntry {
    pub canonical_name: String,
    pub semantic_type: SemanticType,
}

/// `hashed-name -> canonical-name` entry for a list-of-sets, plus its resolved children so
/// the debug converter never needs a second lookup pass.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ListCacheEntry {
    pub canonical_name: String,
    pub semantic_type: SemanticType,
    pub child_hashed_names: Vec<String>,
}

/// The four maps spec.md §4.6 names, snapshotted together under one lock acquisition so a
/// reader never observes a torn update.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NpmCacheSnapshot {
    pub namespace_map: BTreeMap<String, NamespaceSnapshot>,
    pub pod_map: BTreeMap<ObjectKey, PodSnapshot>,
    pub set_map: BTreeMap<String, SetCacheEntry>,
    pub list_map: BTreeMap<String, ListCacheEntry>,
}

/// Shared, lock-guarded handle to the cache. Cloning is cheap (an `Arc`); every controller
/// and the debug HTTP handler hold a clone of the same instance.
#[derive(Clone, Default)]
pub struct NpmCache {
    inner: Arc<RwLock<NpmCacheSnapshot>>,
    /// Per-policy required-set bookkeeping (spec.md §4.2 teardown invariant), kept separate
    /// from `NpmCacheSnapshot` since it is NetworkPolicy controller-internal and not part of
    /// the debug endpoint's JSON shape. Lets a policy contribute exactly one ref per set
    /// across any number of reconciles, by diffing this against each reconcile's translation.
    policy_sets: Arc<RwLock<BTreeMap<ObjectKey, Vec<RequiredSet>>>>,
}

impl NpmCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> NpmCacheSnapshot {
        self.inner.read().await.clone()
    }

    pub async fn upsert_namespace(&self, ns: NamespaceSnapshot) {
        let mut guard = self.inner.write().await;
        guard.namespace_map.insert(ns.name.clone(), ns);
    }

    pub async fn remove_namespace(&self, name: &str) {
        let mut guard = self.inner.write().await;
        guard.namespace_map.remove(name);
    }

    pub async fn upsert_pod(&self, pod: PodSnapshot) {
        let mut guard = self.inner.write().await;
        guard.pod_map.insert(pod.key.clone(), pod);
    }

    pub async fn remove_pod(&self, key: &str) {
        let mut guard = self.inner.write().await;
        guard.pod_map.remove(key);
    }

    /// Rebuilds `set_map`/`list_map` wholesale from the IPSet Manager's current registry.
    ///
    /// Called by every controller immediately after a successful `IpSetManager::apply()`
    /// (spec.md §4.6: the cache is written only by controller workers, under the same
    /// coarse lock that guards the kernel apply). Rebuilding from scratch rather than
    /// tracking an incremental diff keeps this trivially correct: the ipset registry is
    /// already the authoritative source for which sets exist.
    pub async fn sync_ipsets(&self, ipset: &IpSetManager) {
        let mut set_map = BTreeMap::new();
        let mut list_map = BTreeMap::new();
        for set in ipset.iter() {
            match set.kind {
                SetKind::ListOfSets => {
                    let child_hashed_names = set
                        .members
                        .child_names()
                        .into_iter()
                        .map(|child| {
                            ipset
                                .get(&child)
                                .map(|c| c.hashed_name.clone())
                                .unwrap_or_else(|| crate::ipset::hash::hash_name(&child))
                        })
                        .collect();
                    list_map.insert(
                        set.hashed_name.clone(),
                        ListCacheEntry {
                            canonical_name: set.name.clone(),
                            semantic_type: set.semantic_type,
                            child_hashed_names,
                        },
                    );
                }
                SetKind::HashIp | SetKind::HashIpPort => {
                    set_map.insert(
                        set.hashed_name.clone(),
                        SetCacheEntry {
                            canonical_name: set.name.clone(),
                            semantic_type: set.semantic_type,
                        },
                    );
                }
            }
        }
        let mut guard = self.inner.write().await;
        guard.set_map = set_map;
        guard.list_map = list_map;
    }

    pub async fn pod_count(&self) -> usize {
        self.inner.read().await.pod_map.len()
    }

    /// The required sets installed for `key` on its last successful reconcile, if any.
    pub async fn installed_required_sets(&self, key: &str) -> Option<Vec<RequiredSet>> {
        self.policy_sets.read().await.get(key).cloned()
    }

    /// Records the required sets a policy now references, replacing whatever was recorded
    /// for it before.
    pub async fn set_installed_required_sets(&self, key: &str, sets: Vec<RequiredSet>) {
        self.policy_sets.write().await.insert(key.to_string(), sets);
    }

    /// Forgets a policy's required sets entirely, returning what was recorded so the caller
    /// can release every one of them.
    pub async fn take_installed_required_sets(&self, key: &str) -> Option<Vec<RequiredSet>> {
        self.policy_sets.write().await.remove(key)
    }
}
