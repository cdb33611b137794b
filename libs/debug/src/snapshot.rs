//! JSON shape served by the live debug HTTP endpoint (spec.md §6 `GET
//! /npm/v1/debug/manager`) and consumed by the offline `debug convertiptable`/`gettuples`
//! CLI subcommands from a `-c cache-file` — one struct, one source of truth, per
//! SPEC_FULL.md §C.5.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use npm_core::cache::{ListCacheEntry, NpmCacheSnapshot, SetCacheEntry};
use npm_core::model::{NamespaceSnapshot, ObjectKey, PodSnapshot};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DebugManagerResponse {
    #[serde(rename = "NsMap")]
    pub ns_map: BTreeMap<String, NamespaceSnapshot>,
    #[serde(rename = "PodMap")]
    pub pod_map: BTreeMap<ObjectKey, PodSnapshot>,
    #[serde(rename = "SetMap")]
    pub set_map: BTreeMap<String, SetCacheEntry>,
    #[serde(rename = "ListMap")]
    pub list_map: BTreeMap<String, ListCacheEntry>,
    #[serde(rename = "NodeName")]
    pub node_name: String,
}

impl DebugManagerResponse {
    pub fn new(snapshot: NpmCacheSnapshot, node_name: String) -> Self {
        Self {
            ns_map: snapshot.namespace_map,
            pod_map: snapshot.pod_map,
            set_map: snapshot.set_map,
            list_map: snapshot.list_map,
            node_name,
        }
    }

    pub fn into_cache_snapshot(self) -> NpmCacheSnapshot {
        NpmCacheSnapshot {
            namespace_map: self.ns_map,
            pod_map: self.pod_map,
            set_map: self.set_map,
            list_map: self.list_map,
        }
    }
}
