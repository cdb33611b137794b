//! Rule Engine (spec.md §4.4): owns the two top-level chains plus one sub-chain per
//! installed policy, and issues at most one atomic restore per apply tick.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::Result;
use crate::ipset::hash::hash_name;
use crate::metrics::CoreMetrics;
use crate::model::{ObjectKey, Protocol};
use crate::shim::dump::{Chain, Match, MatchDir, Rule as DumpRule, RuleDump, SetMatch, Target};
use crate::shim::KernelShim;

pub const INGRESS_CHAIN: &str = "AZURE-NPM-INGRESS";
pub const EGRESS_CHAIN: &str = "AZURE-NPM-EGRESS";
pub const FILTER_TABLE: &str = "filter";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Ingress,
    Egress,
}

impl Direction {
    pub fn top_chain(&self) -> &'static str {
        match self {
            Direction::Ingress => INGRESS_CHAIN,
            Direction::Egress => EGRESS_CHAIN,
        }
    }

    fn suffix(&self) -> &'static str {
        match self {
            Direction::Ingress => "IN",
            Direction::Egress => "OUT",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    MarkAndAccept,
    Drop,
}

/// A match-set reference within a rule: the canonical IP-set name plus whether the match is
/// inclusive or exclusive (spec.md §3 Policy-rule).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchSetRef {
    pub name: String,
    pub included: bool,
}

impl MatchSetRef {
    pub fn included(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            included: true,
        }
    }
}

/// Where in the chain topology a [`PolicyRule`] lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Placement {
    /// The chain-header rule, installed in the direction's top-level chain, jumping into
    /// this policy's sub-chain.
    TopChain,
    /// A peer rule or the terminal drop, installed in the policy's own sub-chain.
    PolicyChain,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub policy_key: ObjectKey,
    pub direction: Direction,
    pub placement: Placement,
    pub src: Vec<MatchSetRef>,
    pub dst: Vec<MatchSetRef>,
    pub protocol: Option<Protocol>,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub action: Action,
    pub comment: Option<String>,
}

impl PolicyRule {
    pub fn policy_chain_name(policy_key: &str, direction: Direction) -> String {
        format!(
            "AZURE-NPM-{:x}-{}",
            crc_like(policy_key),
            direction.suffix()
        )
    }
}

/// Small, fast, deterministic digest used only to keep generated chain names short; the
/// source of truth for external identity is still the canonical name via [`hash_name`].
fn crc_like(s: &str) -> u32 {
    let mut h: u32 = 2166136261;
    for b in s.as_bytes() {
        h ^= *b as u32;
        h = h.wrapping_mul(16777619);
    }
    h
}

fn render_match_set(m: &MatchSetRef, dir: MatchDir) -> Match {
    Match::Set(SetMatch {
        hashed_name: hash_name(&m.name),
        dirs: vec![dir],
        negate: !m.included,
    })
}

fn render_rule(rule: &PolicyRule) -> DumpRule {
    let mut matches = Vec::new();
    for s in &rule.src {
        matches.push(render_match_set(s, MatchDir::Src));
    }
    for d in &rule.dst {
        matches.push(render_match_set(d, MatchDir::Dst));
    }
    if let Some(protocol) = rule.protocol {
        matches.push(Match::Port {
            protocol,
            dport: rule.dst_port,
            sport: rule.src_port,
        });
    }
    if let Some(comment) = &rule.comment {
        matches.push(Match::Comment(comment.clone()));
    }

    let target = match &rule.placement {
        Placement::TopChain => Target::Jump(PolicyRule::policy_chain_name(&rule.policy_key, rule.direction)),
        Placement::PolicyChain => match rule.action {
            Action::MarkAndAccept => Target::MarkAndAccept("0x2000".to_string()),
            Action::Drop => Target::Drop,
        },
    };

    DumpRule { matches, target }
}

/// Owns the desired and last-applied rule lists for every policy, and renders/installs the
/// full two-chain topology in one atomic restore per apply tick.
pub struct RuleEngine {
    applied: HashMap<ObjectKey, Vec<PolicyRule>>,
    failed: std::collections::HashSet<ObjectKey>,
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleEngine {
    pub fn new() -> Self {
        Self {
            applied: HashMap::new(),
            failed: std::collections::HashSet::new(),
        }
    }

    pub fn is_failed(&self, key: &str) -> bool {
        self.failed.contains(key)
    }

    pub fn applied_rules(&self, key: &str) -> Option<&[PolicyRule]> {
        self.applied.get(key).map(Vec::as_slice)
    }

    /// Installs (or updates, since this replaces whatever was applied for `key`) a policy's
    /// rule set. A no-op diff against the currently applied rules issues no kernel call at
    /// all (spec.md §8 idempotence property).
    pub async fn install_policy(
        &mut self,
        shim: &dyn KernelShim,
        key: &str,
        rules: Vec<PolicyRule>,
        metrics: &CoreMetrics,
    ) -> Result<()> {
        if self.applied.get(key) == Some(&rules) {
            trace!(policy = key, "install_policy no-op, already applied");
            return Ok(());
        }

        let mut next = self.applied.clone();
        next.insert(key.to_string(), rules.clone());
        let dump = self.render_dump(&next);

        match shim.restore(FILTER_TABLE, &dump).await {
            Ok(()) => {
                metrics.rule_engine_restarts_total.inc();
                self.applied = next;
                self.failed.remove(key);
                Ok(())
            }
            Err(e) => {
                self.failed.insert(key.to_string());
                Err(e)
            }
        }
    }

    /// Shorthand for remove-then-install within one atomic restore.
    pub async fn update_policy(
        &mut self,
        shim: &dyn KernelShim,
        key: &str,
        rules: Vec<PolicyRule>,
        metrics: &CoreMetrics,
    ) -> Result<()> {
        self.install_policy(shim, key, rules, metrics).await
    }

    /// Drops every rule owned by `key` and deletes its sub-chains.
    pub async fn remove_policy(&mut self, shim: &dyn KernelShim, key: &str, metrics: &CoreMetrics) -> Result<()> {
        if !self.applied.contains_key(key) {
            return Ok(());
        }
        let mut next = self.applied.clone();
        next.remove(key);
        let dump = self.render_dump(&next);
        shim.restore(FILTER_TABLE, &dump).await?;
        metrics.rule_engine_restarts_total.inc();
        self.applied = next;
        self.failed.remove(key);
        debug!(policy = key, "removed policy chains");
        Ok(())
    }

    fn render_dump(&self, policies: &HashMap<ObjectKey, Vec<PolicyRule>>) -> RuleDump {
        let mut ingress_top = Chain {
            name: INGRESS_CHAIN.to_string(),
            rules: Vec::new(),
        };
        let mut egress_top = Chain {
            name: EGRESS_CHAIN.to_string(),
            rules: Vec::new(),
        };
        let mut sub_chains: Vec<Chain> = Vec::new();

        let mut keys: Vec<&ObjectKey> = policies.keys().collect();
        keys.sort();

        for key in keys {
            let rules = &policies[key];
            let mut ingress_sub: Option<Chain> = None;
            let mut egress_sub: Option<Chain> = None;

            for rule in rules {
                let dump_rule = render_rule(rule);
                match (rule.placement, rule.direction) {
                    (Placement::TopChain, Direction::Ingress) => ingress_top.rules.push(dump_rule),
                    (Placement::TopChain, Direction::Egress) => egress_top.rules.push(dump_rule),
                    (Placement::PolicyChain, Direction::Ingress) => ingress_sub
                        .get_or_insert_with(|| Chain {
                            name: PolicyRule::policy_chain_name(key, Direction::Ingress),
                            rules: Vec::new(),
                        })
                        .rules
                        .push(dump_rule),
                    (Placement::PolicyChain, Direction::Egress) => egress_sub
                        .get_or_insert_with(|| Chain {
                            name: PolicyRule::policy_chain_name(key, Direction::Egress),
                            rules: Vec::new(),
                        })
                        .rules
                        .push(dump_rule),
                }
            }

            sub_chains.extend(ingress_sub);
            sub_chains.extend(egress_sub);
        }

        let mut chains = vec![ingress_top, egress_top];
        chains.extend(sub_chains);
        RuleDump { chains }
    }
}
