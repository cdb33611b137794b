//! Debug Converter (spec.md §4.7): joins a saved kernel rule dump with an NPM cache
//! snapshot, resolving every match-set reference from its hashed name back to its canonical
//! name and semantic type. For CIDR-blocks sets it additionally consults the live kernel
//! (via the [`KernelShim`]) to list concrete members, since neither the rule dump nor the
//! cache snapshot carries element contents for that set kind.

use serde::{Deserialize, Serialize};

use npm_core::cache::NpmCacheSnapshot;
use npm_core::ipset::SemanticType;
use npm_core::model::Protocol;
use npm_core::rules::{EGRESS_CHAIN, INGRESS_CHAIN};
use npm_core::shim::dump::{Match as DumpMatch, MatchDir, RuleDump, Target as DumpTarget};
use npm_core::shim::{KernelShim, SetMember};

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Ingress,
    Egress,
}

/// One match-set reference, resolved from its hashed name.
///
/// List-of-sets semantic types (`AllNamespaces`, `ListOfSets`, `NestedLabelOfPod`) carry
/// their constituent sets in `children`, resolved recursively, so the traffic analyzer never
/// needs a second cache lookup pass to evaluate them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResolvedSetMatch {
    pub hashed_name: String,
    pub canonical_name: String,
    pub semantic_type: SemanticType,
    pub dirs: Vec<MatchDir>,
    /// `true` unless the dump carried `set ! --match-set ...` (spec.md §4.7 "XOR with
    /// inclusion flag").
    pub included: bool,
    /// Concrete members, populated only for `SemanticType::CidrBlocks` by a live kernel
    /// `list_set` call.
    pub cidr_members: Option<Vec<SetMember>>,
    pub children: Vec<ResolvedSetMatch>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ResolvedMatch {
    Set(ResolvedSetMatch),
    Port {
        protocol: Protocol,
        dport: Option<u16>,
        sport: Option<u16>,
    },
    Comment(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ResolvedTarget {
    MarkAndAccept,
    Drop,
    Return,
    Accept,
}

/// One fully resolved rule, flattened from the top-level direction chain's jump into its
/// policy sub-chain (spec.md §4.7: "iterate over the structured rules in installation
/// order" — the flattening preserves that order).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRule {
    pub direction: Direction,
    pub matches: Vec<ResolvedMatch>,
    pub target: ResolvedTarget,
}

/// Resolves one hashed name (and, for list-of-sets, its children) against the cache. Pure
/// and synchronous: CIDR members are filled in by [`populate_cidr_members`] afterwards since
/// that step needs the kernel shim.
fn resolve_set(
    hashed_name: &str,
    dirs: &[MatchDir],
    negate: bool,
    cache: &NpmCacheSnapshot,
) -> Result<ResolvedSetMatch> {
    if let Some(entry) = cache.set_map.get(hashed_name) {
        return Ok(ResolvedSetMatch {
            hashed_name: hashed_name.to_string(),
            canonical_name: entry.canonical_name.clone(),
            semantic_type: entry.semantic_type,
            dirs: dirs.to_vec(),
            included: !negate,
            cidr_members: None,
            children: Vec::new(),
        });
    }
    if let Some(entry) = cache.list_map.get(hashed_name) {
        let children = entry
            .child_hashed_names
            .iter()
            .map(|child| resolve_set(child, &[], false, cache))
            .collect::<Result<Vec<_>>>()?;
        return Ok(ResolvedSetMatch {
            hashed_name: hashed_name.to_string(),
            canonical_name: entry.canonical_name.clone(),
            semantic_type: entry.semantic_type,
            dirs: dirs.to_vec(),
            included: !negate,
            cidr_members: None,
            children,
        });
    }
    Err(Error::UnknownSetType(hashed_name.to_string()))
}

async fn populate_cidr_members(node: &mut ResolvedSetMatch, shim: &dyn KernelShim) -> Result<()> {
    if node.semantic_type == SemanticType::CidrBlocks {
        node.cidr_members = Some(shim.list_set(&node.hashed_name).await?);
    }
    for child in &mut node.children {
        Box::pin(populate_cidr_members(child, shim)).await?;
    }
    Ok(())
}

async fn resolve_match(
    m: &DumpMatch,
    cache: &NpmCacheSnapshot,
    shim: &dyn KernelShim,
) -> Result<ResolvedMatch> {
    match m {
        DumpMatch::Set(s) => {
            let mut resolved = resolve_set(&s.hashed_name, &s.dirs, s.negate, cache)?;
            populate_cidr_members(&mut resolved, shim).await?;
            Ok(ResolvedMatch::Set(resolved))
        }
        DumpMatch::Port {
            protocol,
            dport,
            sport,
        } => Ok(ResolvedMatch::Port {
            protocol: *protocol,
            dport: *dport,
            sport: *sport,
        }),
        DumpMatch::Comment(text) => Ok(ResolvedMatch::Comment(text.clone())),
    }
}

async fn resolve_chain_rules(
    dump: &RuleDump,
    chain_name: &str,
    direction: Direction,
    cache: &NpmCacheSnapshot,
    shim: &dyn KernelShim,
    out: &mut Vec<ResolvedRule>,
) -> Result<()> {
    let Some(chain) = dump.chain(chain_name) else {
        return Ok(());
    };
    for rule in &chain.rules {
        match &rule.target {
            DumpTarget::Jump(sub_chain) => {
                Box::pin(resolve_chain_rules(dump, sub_chain, direction, cache, shim, out)).await?;
            }
            DumpTarget::MarkAndAccept(_) | DumpTarget::Drop | DumpTarget::Return | DumpTarget::Accept => {
                let mut matches = Vec::with_capacity(rule.matches.len());
                for m in &rule.matches {
                    matches.push(resolve_match(m, cache, shim).await?);
                }
                let target = match &rule.target {
                    DumpTarget::MarkAndAccept(_) => ResolvedTarget::MarkAndAccept,
                    DumpTarget::Drop => ResolvedTarget::Drop,
                    DumpTarget::Return => ResolvedTarget::Return,
                    DumpTarget::Accept => ResolvedTarget::Accept,
                    DumpTarget::Jump(_) => unreachable!(),
                };
                out.push(ResolvedRule {
                    direction,
                    matches,
                    target,
                });
            }
        }
    }
    Ok(())
}

/// Converts a saved rule dump into the ordered, resolved rule list the traffic analyzer
/// walks. Ingress rules precede egress rules, each in installation order.
pub async fn convert(dump: &RuleDump, cache: &NpmCacheSnapshot, shim: &dyn KernelShim) -> Result<Vec<ResolvedRule>> {
    let mut rules = Vec::new();
    resolve_chain_rules(dump, INGRESS_CHAIN, Direction::Ingress, cache, shim, &mut rules).await?;
    resolve_chain_rules(dump, EGRESS_CHAIN, Direction::Egress, cache, shim, &mut rules).await?;
    Ok(rules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use npm_core::cache::SetCacheEntry;
    use npm_core::rules::{Action, Direction as RDirection, MatchSetRef, Placement, PolicyRule};
    use npm_core::shim::MockShim;

    fn sample_rules(key: &str) -> Vec<PolicyRule> {
        vec![
            PolicyRule {
                policy_key: key.to_string(),
                direction: RDirection::Ingress,
                placement: Placement::TopChain,
                src: vec![],
                dst: vec![MatchSetRef::included("ns-x")],
                protocol: None,
                src_port: None,
                dst_port: None,
                action: Action::MarkAndAccept,
                comment: None,
            },
            PolicyRule {
                policy_key: key.to_string(),
                direction: RDirection::Ingress,
                placement: Placement::PolicyChain,
                src: vec![MatchSetRef::included("ns-y")],
                dst: vec![],
                protocol: Some(Protocol::Tcp),
                src_port: None,
                dst_port: Some(80),
                action: Action::MarkAndAccept,
                comment: Some("allow a to b".to_string()),
            },
            PolicyRule {
                policy_key: key.to_string(),
                direction: RDirection::Ingress,
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

    #[tokio::test]
    async fn flattens_jump_into_subchain_preserving_order() {
        let shim = MockShim::default();
        let dump = npm_core::shim::dump::parse(&npm_core::shim::dump::render(&sample_dump())).unwrap();

        let mut cache = NpmCacheSnapshot::default();
        cache.set_map.insert(
            npm_core::ipset::hash::hash_name("ns-x"),
            SetCacheEntry {
                canonical_name: "ns-x".to_string(),
                semantic_type: SemanticType::Namespace,
            },
        );
        cache.set_map.insert(
            npm_core::ipset::hash::hash_name("ns-y"),
            SetCacheEntry {
                canonical_name: "ns-y".to_string(),
                semantic_type: SemanticType::Namespace,
            },
        );

        let resolved = convert(&dump, &cache, &shim).await.unwrap();
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].target, ResolvedTarget::MarkAndAccept);
        assert_eq!(resolved[1].target, ResolvedTarget::Drop);
        match &resolved[0].matches[0] {
            ResolvedMatch::Set(s) => assert_eq!(s.canonical_name, "ns-y"),
            _ => panic!("expected set match"),
        }
    }

    #[tokio::test]
    async fn unknown_hashed_name_is_an_error() {
        let shim = MockShim::default();
        let dump = RuleDump {
            chains: vec![npm_core::shim::dump::Chain {
                name: INGRESS_CHAIN.to_string(),
                rules: vec![npm_core::shim::dump::Rule {
                    matches: vec![DumpMatch::Set(npm_core::shim::dump::SetMatch {
                        hashed_name: "azure-npm-unknown".to_string(),
                        dirs: vec![MatchDir::Dst],
                        negate: false,
                    })],
                    target: DumpTarget::Drop,
                }],
            }],
        };
        let cache = NpmCacheSnapshot::default();
        let err = convert(&dump, &cache, &shim).await.unwrap_err();
        assert!(matches!(err, Error::UnknownSetType(_)));
    }

    // `RuleEngine::render_dump` is private, so the test reconstructs the same two chains the
    // engine would install for `sample_rules` directly through the dump types.
    fn sample_dump() -> RuleDump {
        use npm_core::rules::{Direction as RDirection, PolicyRule as PR};
        use npm_core::shim::dump::{Chain, Match, Rule, SetMatch, Target};

        let key = "x/pol";
        let rules = sample_rules(key);
        let mut ingress_top = Chain {
            name: INGRESS_CHAIN.to_string(),
            rules: vec![],
        };
        let mut sub = Chain {
            name: PR::policy_chain_name(key, RDirection::Ingress),
            rules: vec![],
        };
        for r in rules {
            let matches: Vec<Match> = r
                .src
                .iter()
                .map(|s| {
                    Match::Set(SetMatch {
                        hashed_name: npm_core::ipset::hash::hash_name(&s.name),
                        dirs: vec![MatchDir::Src],
                        negate: !s.included,
                    })
                })
                .chain(r.dst.iter().map(|s| {
                    Match::Set(SetMatch {
                        hashed_name: npm_core::ipset::hash::hash_name(&s.name),
                        dirs: vec![MatchDir::Dst],
                        negate: !s.included,
                    })
                }))
                .collect();
            match r.placement {
                npm_core::rules::Placement::TopChain => {
                    ingress_top.rules.push(Rule {
                        matches,
                        target: Target::Jump(sub.name.clone()),
                    });
                }
                npm_core::rules::Placement::PolicyChain => {
                    let target = match r.action {
                        npm_core::rules::Action::MarkAndAccept => Target::MarkAndAccept("0x2000".to_string()),
                        npm_core::rules::Action::Drop => Target::Drop,
                    };
                    sub.rules.push(Rule { matches, target });
                }
            }
        }
        RuleDump {
            chains: vec![ingress_top, sub],
        }
    }
}
