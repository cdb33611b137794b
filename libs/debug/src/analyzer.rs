//! Traffic Analyzer (spec.md §4.7): walks the resolved rule list produced by
//! [`crate::converter::convert`] and answers which rules would fire for one src/dst flow.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use npm_core::cache::NpmCacheSnapshot;
use npm_core::ipset::SemanticType;
use npm_core::model::{PodSnapshot, Protocol};
use npm_core::shim::dump::MatchDir;

use crate::converter::{Direction, ResolvedMatch, ResolvedRule, ResolvedSetMatch, ResolvedTarget};

/// Classification of a raw CLI-style endpoint argument, independent of whether it resolves
/// to anything in the cache (spec.md §8 universal invariant: `GetInputType("External") =
/// EXTERNAL`, `GetInputType(any dotted-quad) = IPADDRS`, anything else = POD-key).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputType {
    External,
    IpAddrs,
    PodKey,
}

/// Classifies a raw `src`/`dst` CLI argument by its syntactic shape alone.
pub fn get_input_type(input: &str) -> InputType {
    if input.eq_ignore_ascii_case("external") {
        InputType::External
    } else if input.parse::<std::net::Ipv4Addr>().is_ok() {
        InputType::IpAddrs
    } else {
        InputType::PodKey
    }
}

/// One endpoint of a traffic query: a known pod, a bare IP (matched against CIDR-blocks
/// sets only), or the literal "External" (matches no pod/namespace/label set at all).
#[derive(Clone, Debug, PartialEq)]
pub enum Endpoint {
    Pod(PodSnapshot),
    Ip(String),
    External,
}

impl Endpoint {
    /// Resolves a CLI-style endpoint argument against the cache, dispatching on
    /// [`get_input_type`] first: a pod key looks up the pod map directly, a dotted-quad is
    /// matched against known pod addresses before falling back to an opaque external
    /// address, and `External` never touches the cache at all.
    pub fn resolve(input: &str, cache: &NpmCacheSnapshot) -> Self {
        match get_input_type(input) {
            InputType::External => Endpoint::External,
            InputType::PodKey => cache
                .pod_map
                .get(input)
                .cloned()
                .map(Endpoint::Pod)
                .unwrap_or_else(|| Endpoint::Ip(input.to_string())),
            InputType::IpAddrs => cache
                .pod_map
                .values()
                .find(|p| p.ip == input)
                .cloned()
                .map(Endpoint::Pod)
                .unwrap_or_else(|| Endpoint::Ip(input.to_string())),
        }
    }

    fn pod(&self) -> Option<&PodSnapshot> {
        match self {
            Endpoint::Pod(p) => Some(p),
            _ => None,
        }
    }

    fn ip(&self) -> Option<&str> {
        match self {
            Endpoint::Pod(p) => Some(p.ip.as_str()),
            Endpoint::Ip(s) => Some(s.as_str()),
            Endpoint::External => None,
        }
    }

    fn display_ip(&self) -> String {
        self.ip().map(str::to_string).unwrap_or_else(|| "External".to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Allowed,
    NotAllowed,
}

/// One hit rule, reported in the shape spec.md §4.7 names: unspecified port/protocol fields
/// are the literal `"ANY"`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrafficTuple {
    #[serde(rename = "ruleType")]
    pub rule_type: Verdict,
    pub direction: Direction,
    #[serde(rename = "srcIP")]
    pub src_ip: String,
    #[serde(rename = "srcPort")]
    pub src_port: String,
    #[serde(rename = "dstIP")]
    pub dst_ip: String,
    #[serde(rename = "dstPort")]
    pub dst_port: String,
    pub protocol: String,
}

const ANY: &str = "ANY";

fn kv_match(canonical_name: &str, labels: &BTreeMap<String, String>) -> bool {
    match canonical_name.split_once(':') {
        Some((key, value)) => labels.get(key).map(|v| v == value).unwrap_or(false),
        None => false,
    }
}

fn cidr_member_hit(members: &[npm_core::shim::SetMember], ip: &str) -> bool {
    let Ok(addr) = ip.parse::<std::net::IpAddr>() else {
        return false;
    };
    let mut positive = false;
    let mut excluded = false;
    for member in members {
        let Some(network) = parse_cidr(&member.element) else {
            continue;
        };
        if network_contains(&network, &addr) {
            if member.nomatch {
                excluded = true;
            } else {
                positive = true;
            }
        }
    }
    positive && !excluded
}

fn parse_cidr(text: &str) -> Option<cidr::IpCidr> {
    if let Ok(c) = text.parse::<cidr::IpCidr>() {
        return Some(c);
    }
    let addr: std::net::IpAddr = text.parse().ok()?;
    let suffixed = match addr {
        std::net::IpAddr::V4(_) => format!("{addr}/32"),
        std::net::IpAddr::V6(_) => format!("{addr}/128"),
    };
    suffixed.parse().ok()
}

fn network_contains(network: &cidr::IpCidr, addr: &std::net::IpAddr) -> bool {
    use cidr::Cidr;
    network.contains(addr)
}

/// Evaluates one resolved match-set against an endpoint, per spec.md §4.7's per-semantic-type
/// rules, applying the inclusion/exclusion flag last.
fn evaluate_set(node: &ResolvedSetMatch, endpoint: &Endpoint, cache: &NpmCacheSnapshot) -> bool {
    let raw = match node.semantic_type {
        SemanticType::Namespace => endpoint
            .pod()
            .map(|p| p.namespace_set_name() == node.canonical_name)
            .unwrap_or(false),
        SemanticType::KeyLabelOfNamespace => endpoint
            .pod()
            .and_then(|p| cache.namespace_map.get(&p.namespace))
            .map(|ns| ns.labels.contains_key(&node.canonical_name))
            .unwrap_or(false),
        SemanticType::KeyValueLabelOfNamespace => endpoint
            .pod()
            .and_then(|p| cache.namespace_map.get(&p.namespace))
            .map(|ns| kv_match(&node.canonical_name, &ns.labels))
            .unwrap_or(false),
        SemanticType::KeyLabelOfPod => endpoint
            .pod()
            .map(|p| p.labels.contains_key(&node.canonical_name))
            .unwrap_or(false),
        SemanticType::KeyValueLabelOfPod => endpoint
            .pod()
            .map(|p| kv_match(&node.canonical_name, &p.labels))
            .unwrap_or(false),
        SemanticType::NamedPort => endpoint
            .pod()
            .map(|p| {
                let port_name = node.canonical_name.strip_prefix("namedport:").unwrap_or(&node.canonical_name);
                p.named_ports.iter().any(|np| np.name == port_name)
            })
            .unwrap_or(false),
        SemanticType::CidrBlocks => node
            .cidr_members
            .as_deref()
            .zip(endpoint.ip())
            .map(|(members, ip)| cidr_member_hit(members, ip))
            .unwrap_or(false),
        SemanticType::AllNamespaces | SemanticType::ListOfSets | SemanticType::NestedLabelOfPod => {
            node.children.iter().any(|child| evaluate_set(child, endpoint, cache))
        }
    };
    if node.included {
        raw
    } else {
        !raw
    }
}

/// Looks up the concrete port/protocol a named-port match-set resolved to on the given
/// endpoint, for port rewriting in the reported tuple (spec.md §4.7).
fn named_port_resolution(node: &ResolvedSetMatch, endpoint: &Endpoint) -> Option<(Protocol, u16)> {
    let pod = endpoint.pod()?;
    let port_name = node.canonical_name.strip_prefix("namedport:").unwrap_or(&node.canonical_name);
    pod.named_ports
        .iter()
        .find(|np| np.name == port_name)
        .map(|np| (np.protocol, np.port))
}

struct RuleEvaluation {
    matched: bool,
    protocol: Option<Protocol>,
    src_port: Option<u16>,
    dst_port: Option<u16>,
}

fn evaluate_rule(rule: &ResolvedRule, src: &Endpoint, dst: &Endpoint, cache: &NpmCacheSnapshot) -> RuleEvaluation {
    let mut src_ok = true;
    let mut dst_ok = true;
    let mut protocol = None;
    let mut src_port = None;
    let mut dst_port = None;

    for m in &rule.matches {
        match m {
            ResolvedMatch::Set(set) => {
                for dir in &set.dirs {
                    let (endpoint, ok) = match dir {
                        MatchDir::Src => (src, &mut src_ok),
                        MatchDir::Dst => (dst, &mut dst_ok),
                    };
                    let hit = evaluate_set(set, endpoint, cache);
                    *ok &= hit;
                    if hit && set.semantic_type == SemanticType::NamedPort {
                        if let Some((p, port)) = named_port_resolution(set, endpoint) {
                            protocol = Some(p);
                            match dir {
                                MatchDir::Src => src_port = Some(port),
                                MatchDir::Dst => dst_port = Some(port),
                            }
                        }
                    }
                }
            }
            ResolvedMatch::Port {
                protocol: p,
                dport,
                sport,
            } => {
                protocol = Some(*p);
                if dport.is_some() {
                    dst_port = *dport;
                }
                if sport.is_some() {
                    src_port = *sport;
                }
            }
            ResolvedMatch::Comment(_) => {}
        }
    }

    RuleEvaluation {
        matched: src_ok && dst_ok,
        protocol,
        src_port,
        dst_port,
    }
}

fn port_field(port: Option<u16>) -> String {
    port.map(|p| p.to_string()).unwrap_or_else(|| ANY.to_string())
}

/// Evaluates every rule in installation order and returns a tuple for every rule whose
/// match-sets hit (spec.md §4.7: "returns, per hit rule, a tuple"). `RETURN` targets fall
/// through to the chain's next rule without producing a verdict of their own. The first
/// tuple for a given direction is the one that determines that direction's overall verdict;
/// a direction with no tuples at all is default-allow.
pub fn analyze(rules: &[ResolvedRule], src: &Endpoint, dst: &Endpoint, cache: &NpmCacheSnapshot) -> Vec<TrafficTuple> {
    let mut tuples = Vec::new();
    for rule in rules {
        let eval = evaluate_rule(rule, src, dst, cache);
        if !eval.matched {
            continue;
        }
        let verdict = match rule.target {
            ResolvedTarget::MarkAndAccept | ResolvedTarget::Accept => Verdict::Allowed,
            ResolvedTarget::Drop => Verdict::NotAllowed,
            ResolvedTarget::Return => continue,
        };
        tuples.push(TrafficTuple {
            rule_type: verdict,
            direction: rule.direction,
            src_ip: src.display_ip(),
            src_port: port_field(eval.src_port),
            dst_ip: dst.display_ip(),
            dst_port: port_field(eval.dst_port),
            protocol: eval.protocol.map(|p| p.as_str().to_string()).unwrap_or_else(|| ANY.to_string()),
        });
    }
    tuples
}

#[cfg(test)]
mod tests {
    use super::*;
    use npm_core::model::{object_key, NamedPort, PodPhase};
    use npm_core::rules::{Action, Direction as RDirection, MatchSetRef, Placement, PolicyRule};
    use npm_core::shim::dump::{Chain, Match as DumpMatch, MatchDir as DMatchDir, Rule as DumpRule, SetMatch, Target as DumpTarget};
    use npm_core::shim::{MockShim, SetMember};

    fn pod(key: &str, ns: &str, name: &str, ip: &str, labels: &[(&str, &str)]) -> PodSnapshot {
        PodSnapshot {
            key: object_key(ns, name),
            namespace: ns.to_string(),
            name: name.to_string(),
            uid: key.to_string(),
            ip: ip.to_string(),
            named_ports: vec![NamedPort {
                name: "serve-80-tcp".to_string(),
                port: 80,
                protocol: Protocol::Tcp,
            }],
            labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            phase: PodPhase::Running,
            host_network: false,
            resource_version: "1".to_string(),
        }
    }

    fn installed_rules(key: &str) -> Vec<PolicyRule> {
        vec![
            PolicyRule {
                policy_key: key.to_string(),
                direction: RDirection::Egress,
                placement: Placement::TopChain,
                src: vec![],
                dst: vec![],
                protocol: None,
                src_port: None,
                dst_port: None,
                action: Action::MarkAndAccept,
                comment: None,
            },
            PolicyRule {
                policy_key: key.to_string(),
                direction: RDirection::Egress,
                placement: Placement::PolicyChain,
                src: vec![MatchSetRef::included("ns-y"), MatchSetRef::included("pod:a")],
                dst: vec![MatchSetRef::included("ns-x"), MatchSetRef::included("namedport:serve-80-tcp")],
                protocol: None,
                src_port: None,
                dst_port: None,
                action: Action::MarkAndAccept,
                comment: Some("allow a to b".to_string()),
            },
            PolicyRule {
                policy_key: key.to_string(),
                direction: RDirection::Egress,
                placement: Placement::PolicyChain,
                src: vec![],
                dst: vec![],
                protocol: None,
                src_port: None,
                dst_port: None,
                action: Action::Drop,
                comment: None,
            },
        ]
    }

    fn build_cache() -> NpmCacheSnapshot {
        use npm_core::cache::SetCacheEntry;
        use npm_core::ipset::hash::hash_name;

        let mut cache = NpmCacheSnapshot::default();
        for (name, sem) in [
            ("ns-y", SemanticType::Namespace),
            ("ns-x", SemanticType::Namespace),
            ("pod:a", SemanticType::KeyValueLabelOfPod),
            ("namedport:serve-80-tcp", SemanticType::NamedPort),
        ] {
            cache.set_map.insert(
                hash_name(name),
                SetCacheEntry {
                    canonical_name: name.to_string(),
                    semantic_type: sem,
                },
            );
        }
        cache
    }

    fn render_dump(key: &str) -> npm_core::shim::dump::RuleDump {
        use npm_core::ipset::hash::hash_name;

        let rules = installed_rules(key);
        let mut top = Chain {
            name: npm_core::rules::EGRESS_CHAIN.to_string(),
            rules: vec![],
        };
        let mut sub = Chain {
            name: PolicyRule::policy_chain_name(key, RDirection::Egress),
            rules: vec![],
        };
        for r in rules {
            let matches: Vec<DumpMatch> = r
                .src
                .iter()
                .map(|s| {
                    DumpMatch::Set(SetMatch {
                        hashed_name: hash_name(&s.name),
                        dirs: vec![DMatchDir::Src],
                        negate: !s.included,
                    })
                })
                .chain(r.dst.iter().map(|s| {
                    DumpMatch::Set(SetMatch {
                        hashed_name: hash_name(&s.name),
                        dirs: vec![DMatchDir::Dst],
                        negate: !s.included,
                    })
                }))
                .collect();
            match r.placement {
                Placement::TopChain => top.rules.push(DumpRule {
                    matches,
                    target: DumpTarget::Jump(sub.name.clone()),
                }),
                Placement::PolicyChain => {
                    let target = match r.action {
                        Action::MarkAndAccept => DumpTarget::MarkAndAccept("0x2000".to_string()),
                        Action::Drop => DumpTarget::Drop,
                    };
                    sub.rules.push(DumpRule { matches, target });
                }
            }
        }
        npm_core::shim::dump::RuleDump {
            chains: vec![top, sub],
        }
    }

    #[tokio::test]
    async fn allowed_named_port_flow_and_terminal_drop_both_reported() {
        let cache = build_cache();
        let dump = render_dump("x/allow-b");
        let shim = MockShim::default();
        let rules = crate::converter::convert(&dump, &cache, &shim).await.unwrap();

        let src = Endpoint::Pod(pod("a", "y", "a", "10.224.0.17", &[("pod", "a")]));
        let dst = Endpoint::Pod(pod("b", "x", "b", "10.224.0.20", &[("pod", "b")]));

        let tuples = analyze(&rules, &src, &dst, &cache);
        assert_eq!(tuples.len(), 2);
        assert_eq!(tuples[0].rule_type, Verdict::Allowed);
        assert_eq!(tuples[0].direction, Direction::Egress);
        assert_eq!(tuples[0].protocol, "tcp");
        assert_eq!(tuples[0].dst_port, "80");
        assert_eq!(tuples[1].rule_type, Verdict::NotAllowed);
    }

    #[tokio::test]
    async fn mismatched_source_namespace_never_hits_the_peer_rule() {
        let cache = build_cache();
        let dump = render_dump("x/allow-b");
        let shim = MockShim::default();
        let rules = crate::converter::convert(&dump, &cache, &shim).await.unwrap();

        let src = Endpoint::Pod(pod("c", "z", "c", "10.224.0.99", &[("pod", "a")]));
        let dst = Endpoint::Pod(pod("b", "x", "b", "10.224.0.20", &[("pod", "b")]));

        let tuples = analyze(&rules, &src, &dst, &cache);
        assert_eq!(tuples.len(), 1);
        assert_eq!(tuples[0].rule_type, Verdict::NotAllowed);
    }

    #[test]
    fn cidr_block_with_nomatch_hole_excludes_member() {
        let node = ResolvedSetMatch {
            hashed_name: "azure-npm-1".to_string(),
            canonical_name: "cidr:10.0.0.0/8:10.0.1.0/24".to_string(),
            semantic_type: SemanticType::CidrBlocks,
            dirs: vec![MatchDir::Dst],
            included: true,
            cidr_members: Some(vec![
                SetMember {
                    element: "10.0.0.0/8".to_string(),
                    nomatch: false,
                },
                SetMember {
                    element: "10.0.1.0/24".to_string(),
                    nomatch: true,
                },
            ]),
            children: vec![],
        };
        let cache = NpmCacheSnapshot::default();
        assert!(!evaluate_set(&node, &Endpoint::Ip("10.0.1.5".to_string()), &cache));
        assert!(evaluate_set(&node, &Endpoint::Ip("10.0.2.5".to_string()), &cache));
    }

    #[test]
    fn external_endpoint_never_matches_label_sets() {
        let node = ResolvedSetMatch {
            hashed_name: "azure-npm-2".to_string(),
            canonical_name: "ns-x".to_string(),
            semantic_type: SemanticType::Namespace,
            dirs: vec![MatchDir::Dst],
            included: true,
            cidr_members: None,
            children: vec![],
        };
        let cache = NpmCacheSnapshot::default();
        assert!(!evaluate_set(&node, &Endpoint::External, &cache));
    }

    #[test]
    fn input_type_classifies_external_ip_and_pod_key() {
        assert_eq!(get_input_type("External"), InputType::External);
        assert_eq!(get_input_type("external"), InputType::External);
        assert_eq!(get_input_type("10.224.0.17"), InputType::IpAddrs);
        assert_eq!(get_input_type("y/a"), InputType::PodKey);
    }

    #[test]
    fn resolve_falls_back_to_opaque_ip_for_unknown_addresses() {
        let cache = NpmCacheSnapshot::default();
        assert_eq!(
            Endpoint::resolve("10.1.2.3", &cache),
            Endpoint::Ip("10.1.2.3".to_string())
        );
        assert_eq!(Endpoint::resolve("External", &cache), Endpoint::External);
    }
}
