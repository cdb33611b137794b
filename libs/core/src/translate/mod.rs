//! Policy Translator (spec.md §4.3): converts one [`NetworkPolicySnapshot`] into an ordered
//! list of [`PolicyRule`]s plus the IP sets that must exist (and, for CIDR-blocks sets, the
//! members that must be seeded) before those rules are installed.

use crate::ipset::SemanticType;
use crate::model::{
    key_label_set_name, key_value_label_set_name, namespace_set_name, nested_label_set_name,
    LabelSelector, NetworkPolicySnapshot, Peer, PolicyPeerRule, PortClause, PortRef,
    ALL_NAMESPACES_LIST,
};
use crate::rules::{Action, Direction, MatchSetRef, Placement, PolicyRule};

/// One IP set the translated rules reference, which must be `ensure()`d (and, for
/// CIDR-blocks/list-of-sets, have `members` added) before the rules are installed.
#[derive(Clone, Debug, PartialEq)]
pub struct RequiredSet {
    pub name: String,
    pub semantic_type: SemanticType,
    /// For CIDR-blocks: `(cidr, is_nomatch)`. For list-of-sets: `(child_canonical_name, false)`.
    /// Empty for plain label/namespace leaf sets, whose membership the Pod/Namespace
    /// controllers maintain independently of any one policy.
    pub members: Vec<(String, bool)>,
}

pub struct Translation {
    pub rules: Vec<PolicyRule>,
    pub required_sets: Vec<RequiredSet>,
}

/// Canonical name for an IP-block peer's CIDR-blocks set; shared across policies that
/// express the identical block so it is ref-counted rather than duplicated.
pub fn cidr_set_name(cidr: &str, except: &[String]) -> String {
    let mut sorted = except.to_vec();
    sorted.sort();
    format!("cidr:{cidr}:{}", sorted.join(","))
}

fn push_required(sets: &mut Vec<RequiredSet>, set: RequiredSet) {
    if !sets.iter().any(|s| s.name == set.name) {
        sets.push(set);
    }
}

fn resolve_label_selector(
    selector: &LabelSelector,
    namespace_scope: bool,
) -> (Vec<MatchSetRef>, Vec<RequiredSet>) {
    let mut matches = Vec::new();
    let mut required = Vec::new();

    for req in selector {
        if req.values.is_empty() {
            let name = key_label_set_name(&req.key);
            let semantic = if namespace_scope {
                SemanticType::KeyLabelOfNamespace
            } else {
                SemanticType::KeyLabelOfPod
            };
            push_required(
                &mut required,
                RequiredSet {
                    name: name.clone(),
                    semantic_type: semantic,
                    members: vec![],
                },
            );
            matches.push(MatchSetRef::included(name));
        } else if req.values.len() == 1 {
            let name = key_value_label_set_name(&req.key, &req.values[0]);
            let semantic = if namespace_scope {
                SemanticType::KeyValueLabelOfNamespace
            } else {
                SemanticType::KeyValueLabelOfPod
            };
            push_required(
                &mut required,
                RequiredSet {
                    name: name.clone(),
                    semantic_type: semantic,
                    members: vec![],
                },
            );
            matches.push(MatchSetRef::included(name));
        } else {
            let nested_name = nested_label_set_name(&req.key, &req.values);
            let child_semantic = if namespace_scope {
                SemanticType::KeyValueLabelOfNamespace
            } else {
                SemanticType::KeyValueLabelOfPod
            };
            let mut children = Vec::new();
            for value in &req.values {
                let child_name = key_value_label_set_name(&req.key, value);
                push_required(
                    &mut required,
                    RequiredSet {
                        name: child_name.clone(),
                        semantic_type: child_semantic,
                        members: vec![],
                    },
                );
                children.push((child_name, false));
            }
            push_required(
                &mut required,
                RequiredSet {
                    name: nested_name.clone(),
                    semantic_type: SemanticType::NestedLabelOfPod,
                    members: children,
                },
            );
            matches.push(MatchSetRef::included(nested_name));
        }
    }

    (matches, required)
}

fn resolve_peer(policy_namespace: &str, peer: &Peer) -> (Vec<MatchSetRef>, Vec<RequiredSet>) {
    match peer {
        Peer::PodSelector {
            pod_selector,
            namespace_selector,
        } => {
            let (mut ns_matches, mut ns_required) = match namespace_selector {
                None => {
                    let name = namespace_set_name(policy_namespace);
                    (
                        vec![MatchSetRef::included(name.clone())],
                        vec![RequiredSet {
                            name,
                            semantic_type: SemanticType::Namespace,
                            members: vec![],
                        }],
                    )
                }
                Some(sel) if sel.is_empty() => (
                    vec![MatchSetRef::included(ALL_NAMESPACES_LIST)],
                    vec![RequiredSet {
                        name: ALL_NAMESPACES_LIST.to_string(),
                        semantic_type: SemanticType::AllNamespaces,
                        members: vec![],
                    }],
                ),
                Some(sel) => resolve_label_selector(sel, true),
            };
            let (pod_matches, pod_required) = resolve_label_selector(pod_selector, false);
            ns_matches.extend(pod_matches);
            ns_required.extend(pod_required);
            (ns_matches, ns_required)
        }
        Peer::NamespaceSelector(sel) => {
            if sel.is_empty() {
                (
                    vec![MatchSetRef::included(ALL_NAMESPACES_LIST)],
                    vec![RequiredSet {
                        name: ALL_NAMESPACES_LIST.to_string(),
                        semantic_type: SemanticType::AllNamespaces,
                        members: vec![],
                    }],
                )
            } else {
                resolve_label_selector(sel, true)
            }
        }
        Peer::IpBlock { cidr, except } => {
            let name = cidr_set_name(cidr, except);
            let mut members = vec![(cidr.clone(), false)];
            members.extend(except.iter().map(|e| (e.clone(), true)));
            (
                vec![MatchSetRef::included(name.clone())],
                vec![RequiredSet {
                    name,
                    semantic_type: SemanticType::CidrBlocks,
                    members,
                }],
            )
        }
    }
}

fn target_sets(policy: &NetworkPolicySnapshot) -> (Vec<MatchSetRef>, Vec<RequiredSet>) {
    let ns_name = namespace_set_name(&policy.namespace);
    let mut matches = vec![MatchSetRef::included(ns_name.clone())];
    let mut required = vec![RequiredSet {
        name: ns_name,
        semantic_type: SemanticType::Namespace,
        members: vec![],
    }];
    let (pod_matches, pod_required) = resolve_label_selector(&policy.pod_selector, false);
    matches.extend(pod_matches);
    required.extend(pod_required);
    (matches, required)
}

fn emit_direction(
    policy: &NetworkPolicySnapshot,
    direction: Direction,
    target: &[MatchSetRef],
    blocks: &[PolicyPeerRule],
    rules: &mut Vec<PolicyRule>,
    required: &mut Vec<RequiredSet>,
) {
    let (header_src, header_dst) = match direction {
        Direction::Ingress => (vec![], target.to_vec()),
        Direction::Egress => (target.to_vec(), vec![]),
    };
    rules.push(PolicyRule {
        policy_key: policy.key.clone(),
        direction,
        placement: Placement::TopChain,
        src: header_src,
        dst: header_dst,
        protocol: None,
        src_port: None,
        dst_port: None,
        action: Action::MarkAndAccept,
        comment: Some(format!("jump to {} chain for {}", direction_label(direction), policy.key)),
    });

    for block in blocks {
        for peer in &block.peers {
            let (peer_matches, peer_required) = resolve_peer(&policy.namespace, peer);
            for req in peer_required {
                push_required(required, req);
            }

            let port_clauses: Vec<Option<&PortClause>> = if block.ports.is_empty() {
                vec![None]
            } else {
                block.ports.iter().map(Some).collect()
            };

            for port in port_clauses {
                let (mut dst, src) = match direction {
                    Direction::Ingress => (vec![], peer_matches.clone()),
                    Direction::Egress => (peer_matches.clone(), vec![]),
                };
                let mut protocol = None;
                let mut src_port = None;
                let mut dst_port = None;

                if let Some(clause) = port {
                    match &clause.port {
                        PortRef::Number(n) => {
                            protocol = Some(clause.protocol);
                            dst_port = Some(*n);
                        }
                        PortRef::Named(name) => {
                            let set_name = format!("namedport:{name}");
                            push_required(
                                required,
                                RequiredSet {
                                    name: set_name.clone(),
                                    semantic_type: SemanticType::NamedPort,
                                    members: vec![],
                                },
                            );
                            dst.push(MatchSetRef::included(set_name));
                        }
                    }
                }

                rules.push(PolicyRule {
                    policy_key: policy.key.clone(),
                    direction,
                    placement: Placement::PolicyChain,
                    src,
                    dst,
                    protocol,
                    src_port,
                    dst_port,
                    action: Action::MarkAndAccept,
                    comment: None,
                });
            }
        }
    }

    rules.push(PolicyRule {
        policy_key: policy.key.clone(),
        direction,
        placement: Placement::PolicyChain,
        src: vec![],
        dst: vec![],
        protocol: None,
        src_port: None,
        dst_port: None,
        action: Action::Drop,
        comment: Some("deny traffic matching no peer".to_string()),
    });
}

fn direction_label(direction: Direction) -> &'static str {
    match direction {
        Direction::Ingress => "ingress",
        Direction::Egress => "egress",
    }
}

/// Translates one policy snapshot into its ordered rule list and required IP sets.
///
/// Peer order within a direction is preserved (spec.md §4.3): the caller must install the
/// returned rules in this order since the first matching mark-and-accept short-circuits the
/// terminal drop.
pub fn translate(policy: &NetworkPolicySnapshot) -> Translation {
    let mut rules = Vec::new();
    let mut required_sets = Vec::new();

    let (target, target_required) = target_sets(policy);
    for req in target_required {
        push_required(&mut required_sets, req);
    }

    if policy.policy_types.ingress {
        emit_direction(
            policy,
            Direction::Ingress,
            &target,
            &policy.ingress,
            &mut rules,
            &mut required_sets,
        );
    }
    if policy.policy_types.egress {
        emit_direction(
            policy,
            Direction::Egress,
            &target,
            &policy.egress,
            &mut rules,
            &mut required_sets,
        );
    }

    Translation {
        rules,
        required_sets,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LabelSelectorReq, PolicyTypeMask, Protocol};

    fn policy_allow_a_to_b_named_port() -> NetworkPolicySnapshot {
        NetworkPolicySnapshot {
            key: "x/allow-b".to_string(),
            namespace: "x".to_string(),
            name: "allow-b".to_string(),
            pod_selector: vec![LabelSelectorReq {
                key: "pod".to_string(),
                values: vec!["b".to_string()],
            }],
            policy_types: PolicyTypeMask {
                ingress: true,
                egress: false,
            },
            ingress: vec![PolicyPeerRule {
                peers: vec![Peer::PodSelector {
                    pod_selector: vec![LabelSelectorReq {
                        key: "pod".to_string(),
                        values: vec!["a".to_string()],
                    }],
                    namespace_selector: Some(vec![LabelSelectorReq {
                        key: "kubernetes.io/metadata.name".to_string(),
                        values: vec!["y".to_string()],
                    }]),
                }],
                ports: vec![PortClause {
                    protocol: Protocol::Tcp,
                    port: PortRef::Named("serve-80-tcp".to_string()),
                }],
            }],
            egress: vec![],
        }
    }

    #[test]
    fn emits_header_peer_and_terminal_drop_in_order() {
        let policy = policy_allow_a_to_b_named_port();
        let t = translate(&policy);
        assert_eq!(t.rules.len(), 3);
        assert_eq!(t.rules[0].placement, Placement::TopChain);
        assert_eq!(t.rules[1].placement, Placement::PolicyChain);
        assert_eq!(t.rules[1].action, Action::MarkAndAccept);
        assert_eq!(t.rules[2].action, Action::Drop);
    }

    #[test]
    fn named_port_adds_dst_match_set_without_literal_port() {
        let policy = policy_allow_a_to_b_named_port();
        let t = translate(&policy);
        let peer_rule = &t.rules[1];
        assert!(peer_rule.protocol.is_none());
        assert!(peer_rule.dst.iter().any(|m| m.name == "namedport:serve-80-tcp"));
        assert!(t
            .required_sets
            .iter()
            .any(|s| s.name == "namedport:serve-80-tcp" && s.semantic_type == SemanticType::NamedPort));
    }

    #[test]
    fn empty_pod_selector_targets_namespace_set() {
        let policy = NetworkPolicySnapshot {
            key: "x/deny-all".to_string(),
            namespace: "x".to_string(),
            name: "deny-all".to_string(),
            pod_selector: vec![],
            policy_types: PolicyTypeMask {
                ingress: true,
                egress: false,
            },
            ingress: vec![],
            egress: vec![],
        };
        let t = translate(&policy);
        // header + terminal drop only: no peers means deny all in that direction
        assert_eq!(t.rules.len(), 2);
        assert_eq!(t.rules[0].dst, vec![MatchSetRef::included("ns-x")]);
        assert_eq!(t.rules[1].action, Action::Drop);
    }

    #[test]
    fn ip_block_peer_becomes_cidr_set_with_nomatch_exception() {
        let policy = NetworkPolicySnapshot {
            key: "x/ipblock".to_string(),
            namespace: "x".to_string(),
            name: "ipblock".to_string(),
            pod_selector: vec![],
            policy_types: PolicyTypeMask {
                ingress: false,
                egress: true,
            },
            ingress: vec![],
            egress: vec![PolicyPeerRule {
                peers: vec![Peer::IpBlock {
                    cidr: "10.0.0.0/8".to_string(),
                    except: vec!["10.0.1.0/24".to_string()],
                }],
                ports: vec![],
            }],
        };
        let t = translate(&policy);
        let cidr_set = t
            .required_sets
            .iter()
            .find(|s| s.semantic_type == SemanticType::CidrBlocks)
            .unwrap();
        assert_eq!(cidr_set.members.len(), 2);
        assert!(cidr_set.members.contains(&("10.0.0.0/8".to_string(), false)));
        assert!(cidr_set.members.contains(&("10.0.1.0/24".to_string(), true)));
    }

    #[test]
    fn nested_label_requirement_creates_list_of_sets_with_children() {
        let policy = NetworkPolicySnapshot {
            key: "x/nested".to_string(),
            namespace: "x".to_string(),
            name: "nested".to_string(),
            pod_selector: vec![],
            policy_types: PolicyTypeMask {
                ingress: true,
                egress: false,
            },
            ingress: vec![PolicyPeerRule {
                peers: vec![Peer::PodSelector {
                    pod_selector: vec![LabelSelectorReq {
                        key: "env".to_string(),
                        values: vec!["dev".to_string(), "staging".to_string()],
                    }],
                    namespace_selector: None,
                }],
                ports: vec![],
            }],
            egress: vec![],
        };
        let t = translate(&policy);
        let nested = t
            .required_sets
            .iter()
            .find(|s| s.semantic_type == SemanticType::NestedLabelOfPod)
            .unwrap();
        assert_eq!(nested.name, "env:dev:staging");
        assert_eq!(nested.members.len(), 2);
    }
}
