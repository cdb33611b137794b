//! Translates live Kubernetes API types into the plain snapshots `npm_core::model` works
//! with. The CORE never sees a `k8s_openapi`/`kube` type directly (spec.md §3); this module
//! is the only seam that does.

use k8s_openapi::api::core::v1::{Namespace, Pod};
use k8s_openapi::api::networking::v1::{
    NetworkPolicy, NetworkPolicyIngressRule, NetworkPolicyPeer, NetworkPolicyPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::ResourceExt;

use npm_core::model::{
    object_key, LabelSelector as NpmLabelSelector, LabelSelectorReq, NamedPort,
    NamespaceSnapshot, NetworkPolicySnapshot, Peer, PodPhase, PodSnapshot, PolicyPeerRule,
    PolicyTypeMask, PortClause, PortRef, Protocol,
};

fn parse_phase(phase: Option<&str>) -> PodPhase {
    match phase {
        Some("Succeeded") => PodPhase::Succeeded,
        Some("Failed") => PodPhase::Failed,
        Some("Running") => PodPhase::Running,
        _ => PodPhase::Pending,
    }
}

/// Converts a live `Pod`. Returns `None` when the pod is host-network or has no IP yet
/// (spec.md §3 invariant: never stored in that case).
pub fn convert_pod(pod: &Pod) -> Option<PodSnapshot> {
    let spec = pod.spec.as_ref()?;
    if spec.host_network.unwrap_or(false) {
        return None;
    }
    let ip = pod.status.as_ref().and_then(|s| s.pod_ip.clone())?;
    if ip.is_empty() {
        return None;
    }

    let namespace = pod.namespace().unwrap_or_default();
    let name = pod.name_any();
    let named_ports = spec
        .containers
        .iter()
        .flat_map(|c| c.ports.iter().flatten())
        .filter_map(|p| {
            let name = p.name.clone()?;
            let protocol = p
                .protocol
                .as_deref()
                .unwrap_or("TCP")
                .parse::<Protocol>()
                .ok()?;
            Some(NamedPort {
                name,
                port: u16::try_from(p.container_port).ok()?,
                protocol,
            })
        })
        .collect();

    Some(PodSnapshot {
        key: object_key(&namespace, &name),
        namespace,
        name,
        uid: pod.uid().unwrap_or_default(),
        ip,
        named_ports,
        labels: pod.labels().clone().into_iter().collect(),
        phase: parse_phase(pod.status.as_ref().and_then(|s| s.phase.as_deref())),
        host_network: false,
        resource_version: pod.resource_version().unwrap_or_default(),
    })
}

/// True once a pod should be torn down from every IP set (spec.md §4.5, §8): terminal phase
/// or a deletion timestamp, checked against the raw object since a tombstone delivers the
/// last-known object as-is.
pub fn pod_is_complete(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
        || matches!(
            pod.status.as_ref().and_then(|s| s.phase.as_deref()),
            Some("Succeeded") | Some("Failed")
        )
}

pub fn convert_namespace(ns: &Namespace) -> NamespaceSnapshot {
    NamespaceSnapshot {
        name: ns.name_any(),
        labels: ns.labels().clone().into_iter().collect(),
    }
}

fn convert_label_selector(selector: &LabelSelector) -> NpmLabelSelector {
    let mut reqs = Vec::new();
    if let Some(match_labels) = &selector.match_labels {
        for (k, v) in match_labels {
            reqs.push(LabelSelectorReq {
                key: k.clone(),
                values: vec![v.clone()],
            });
        }
    }
    if let Some(exprs) = &selector.match_expressions {
        for expr in exprs {
            match expr.operator.as_str() {
                "In" => reqs.push(LabelSelectorReq {
                    key: expr.key.clone(),
                    values: expr.values.clone().unwrap_or_default(),
                }),
                "Exists" => reqs.push(LabelSelectorReq {
                    key: expr.key.clone(),
                    values: vec![],
                }),
                // NotIn/DoesNotExist express negation, which the translated rule model
                // (spec.md §3/§4.3) has no slot for; dropped here rather than silently
                // mistranslated (see DESIGN.md Open Questions).
                _ => {}
            }
        }
    }
    reqs
}

fn convert_port(port: &NetworkPolicyPort) -> Option<PortClause> {
    let protocol = port
        .protocol
        .as_deref()
        .unwrap_or("TCP")
        .parse::<Protocol>()
        .ok()?;
    let port_ref = match port.port.as_ref()? {
        k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(n) => {
            PortRef::Number(u16::try_from(*n).ok()?)
        }
        k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::String(s) => {
            PortRef::Named(s.clone())
        }
    };
    Some(PortClause {
        protocol,
        port: port_ref,
    })
}

fn convert_peer(policy_namespace: &str, peer: &NetworkPolicyPeer) -> Option<Peer> {
    if let Some(block) = &peer.ip_block {
        return Some(Peer::IpBlock {
            cidr: block.cidr.clone(),
            except: block.except.clone().unwrap_or_default(),
        });
    }
    match (&peer.pod_selector, &peer.namespace_selector) {
        (Some(pod_sel), ns_sel) => Some(Peer::PodSelector {
            pod_selector: convert_label_selector(pod_sel),
            namespace_selector: ns_sel.as_ref().map(convert_label_selector),
        }),
        (None, Some(ns_sel)) => Some(Peer::NamespaceSelector(convert_label_selector(ns_sel))),
        (None, None) => {
            let _ = policy_namespace;
            None
        }
    }
}

fn convert_peer_rule(
    policy_namespace: &str,
    ports: Option<&Vec<NetworkPolicyPort>>,
    peers: Option<&Vec<NetworkPolicyPeer>>,
) -> PolicyPeerRule {
    PolicyPeerRule {
        peers: peers
            .into_iter()
            .flatten()
            .filter_map(|p| convert_peer(policy_namespace, p))
            .collect(),
        ports: ports.into_iter().flatten().filter_map(convert_port).collect(),
    }
}

pub fn convert_network_policy(np: &NetworkPolicy) -> Option<NetworkPolicySnapshot> {
    let spec = np.spec.as_ref()?;
    let namespace = np.namespace().unwrap_or_default();
    let name = np.name_any();

    let policy_types = spec.policy_types.clone().unwrap_or_default();
    let mask = PolicyTypeMask {
        ingress: policy_types.iter().any(|t| t == "Ingress") || policy_types.is_empty(),
        egress: policy_types.iter().any(|t| t == "Egress"),
    };

    let ingress: Vec<PolicyPeerRule> = spec
        .ingress
        .as_ref()
        .map(|rules: &Vec<NetworkPolicyIngressRule>| {
            rules
                .iter()
                .map(|r| convert_peer_rule(&namespace, r.ports.as_ref(), r.from.as_ref()))
                .collect()
        })
        .unwrap_or_default();

    let egress: Vec<PolicyPeerRule> = spec
        .egress
        .as_ref()
        .map(|rules| {
            rules
                .iter()
                .map(|r| convert_peer_rule(&namespace, r.ports.as_ref(), r.to.as_ref()))
                .collect()
        })
        .unwrap_or_default();

    Some(NetworkPolicySnapshot {
        key: object_key(&namespace, &name),
        namespace,
        name,
        pod_selector: convert_label_selector(&spec.pod_selector),
        policy_types: mask,
        ingress,
        egress,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ContainerPort, PodSpec, PodStatus};
    use kube::api::ObjectMeta;

    fn pod_with(ip: Option<&str>, host_network: bool, phase: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                namespace: Some("x".to_string()),
                name: Some("b".to_string()),
                labels: Some([("pod".to_string(), "b".to_string())].into()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                host_network: Some(host_network),
                containers: vec![k8s_openapi::api::core::v1::Container {
                    name: "c".to_string(),
                    ports: Some(vec![ContainerPort {
                        name: Some("serve-80-tcp".to_string()),
                        container_port: 80,
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                pod_ip: ip.map(str::to_string),
                phase: phase.map(str::to_string),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn host_network_pod_is_dropped() {
        assert!(convert_pod(&pod_with(Some("10.0.0.1"), true, Some("Running"))).is_none());
    }

    #[test]
    fn pod_without_ip_is_dropped() {
        assert!(convert_pod(&pod_with(None, false, Some("Running"))).is_none());
    }

    #[test]
    fn running_pod_with_ip_is_kept_with_named_port() {
        let snap = convert_pod(&pod_with(Some("10.0.0.1"), false, Some("Running"))).unwrap();
        assert_eq!(snap.ip, "10.0.0.1");
        assert_eq!(snap.named_ports.len(), 1);
        assert_eq!(snap.named_ports[0].port, 80);
    }

    #[test]
    fn terminal_phase_is_complete() {
        assert!(pod_is_complete(&pod_with(Some("10.0.0.1"), false, Some("Succeeded"))));
        assert!(!pod_is_complete(&pod_with(Some("10.0.0.1"), false, Some("Running"))));
    }
}
