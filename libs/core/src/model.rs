//! Domain types shared by the cache, translator, rule engine and debug converter.
//!
//! These are plain snapshots, not `kube`/`k8s-openapi` types: controllers translate the
//! live Kubernetes objects into these before handing them to the CORE, which never touches
//! the Kubernetes API types directly (spec.md §3).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// L4 protocol carried on a port rule or named port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
    Sctp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Sctp => "sctp",
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TCP" => Ok(Protocol::Tcp),
            "UDP" => Ok(Protocol::Udp),
            "SCTP" => Ok(Protocol::Sctp),
            other => Err(format!("unknown protocol {other}")),
        }
    }
}

/// Pod lifecycle phase relevant to reconcile decisions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl PodPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }
}

/// One named container port, resolved at pod-sync time so the translator and the named-port
/// IPSet maintenance never have to look back at the live Pod object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedPort {
    pub name: String,
    pub port: u16,
    pub protocol: Protocol,
}

/// Stable key `<namespace>/<name>` shared by pods, namespaces (name only) and policies.
pub type ObjectKey = String;

pub fn object_key(namespace: &str, name: &str) -> ObjectKey {
    format!("{namespace}/{name}")
}

/// In-memory snapshot of a Pod, as recorded by the NPM cache.
///
/// Invariant (spec.md §3): never stored if `host_network` is true or `ip` is empty.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PodSnapshot {
    pub key: ObjectKey,
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub ip: String,
    pub named_ports: Vec<NamedPort>,
    pub labels: BTreeMap<String, String>,
    pub phase: PodPhase,
    pub host_network: bool,
    pub resource_version: String,
}

impl PodSnapshot {
    /// Canonical name of this pod's namespace IPSet, e.g. `ns-default`.
    pub fn namespace_set_name(&self) -> String {
        namespace_set_name(&self.namespace)
    }

    /// Canonical names of the key and key:value label sets this pod belongs to.
    pub fn label_set_names(&self) -> Vec<String> {
        let mut sets = Vec::with_capacity(self.labels.len() * 2);
        for (k, v) in &self.labels {
            sets.push(key_label_set_name(k));
            sets.push(key_value_label_set_name(k, v));
        }
        sets
    }
}

pub fn namespace_set_name(namespace: &str) -> String {
    format!("ns-{namespace}")
}

pub fn key_label_set_name(key: &str) -> String {
    key.to_string()
}

pub fn key_value_label_set_name(key: &str, value: &str) -> String {
    format!("{key}:{value}")
}

/// `nested-label-of-pod` canonical name encodes `key:v1:v2:...`.
pub fn nested_label_set_name(key: &str, values: &[String]) -> String {
    let mut name = key.to_string();
    for v in values {
        name.push(':');
        name.push_str(v);
    }
    name
}

pub const ALL_NAMESPACES_LIST: &str = "all-namespaces";

/// In-memory snapshot of a Namespace.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NamespaceSnapshot {
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

/// Which directions a NetworkPolicy declares.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyTypeMask {
    pub ingress: bool,
    pub egress: bool,
}

/// A port clause on a peer: protocol plus either a numeric or a named port.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PortClause {
    pub protocol: Protocol,
    pub port: PortRef,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PortRef {
    Number(u16),
    Named(String),
}

/// One label requirement: `key` present, or `key` present with one of `values`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LabelSelectorReq {
    pub key: String,
    /// Empty means "key exists", non-empty is a nested (key ∈ {v1,v2,...}) requirement.
    pub values: Vec<String>,
}

/// A label selector is a conjunction of requirements; empty selects everything.
pub type LabelSelector = Vec<LabelSelectorReq>;

/// One ingress/egress peer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Peer {
    /// pod-selector [+ namespace-selector]; `namespace_selector: None` means "same namespace".
    PodSelector {
        pod_selector: LabelSelector,
        namespace_selector: Option<LabelSelector>,
    },
    NamespaceSelector(LabelSelector),
    IpBlock {
        cidr: String,
        except: Vec<String>,
    },
}

/// One ingress or egress rule block of a NetworkPolicy: peers plus the ports that apply.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyPeerRule {
    /// Empty peer list means "deny all" in this direction (no peers ever match).
    pub peers: Vec<Peer>,
    pub ports: Vec<PortClause>,
}

/// In-memory snapshot of a NetworkPolicy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetworkPolicySnapshot {
    pub key: ObjectKey,
    pub namespace: String,
    pub name: String,
    pub pod_selector: LabelSelector,
    pub policy_types: PolicyTypeMask,
    pub ingress: Vec<PolicyPeerRule>,
    pub egress: Vec<PolicyPeerRule>,
}
