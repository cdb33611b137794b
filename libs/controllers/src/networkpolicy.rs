//! NetworkPolicy controller (spec.md §4.5): runs the Policy Translator, ensures every
//! required IP set (and seeds its members for CIDR-blocks/list-of-sets), then installs the
//! policy's rules into the Rule Engine. Delete tears both down in reverse.

use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::runtime::reflector::store::Writer;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, ResourceExt};
use tracing::{debug, error, instrument, trace, warn};

use npm_core::cache::NpmCache;
use npm_core::ipset::IpSetManager;
use npm_core::metrics::{CoreMetrics, TriggerAction};
use npm_core::model::{object_key, NetworkPolicySnapshot};
use npm_core::rules::RuleEngine;
use npm_core::shim::KernelShim;
use npm_core::telemetry;
use npm_core::translate::{translate, RequiredSet};

use crate::context::{Agent, NETWORKPOLICY_CONTROLLER};
use crate::convert::convert_network_policy;

/// Ensures every required set added since `previous` and releases every one dropped since,
/// so that a policy contributes exactly one ref per set regardless of how many times it is
/// reconciled (spec.md §4.2 teardown invariant) — the same owner-keyed diff `pod.rs`'s
/// `reconcile_sets` already does for label-set membership, applied here to set-level refs.
fn diff_required_sets(ipset: &mut IpSetManager, owner: &str, previous: &[RequiredSet], desired: &[RequiredSet]) {
    let desired_names: HashSet<&str> = desired.iter().map(|s| s.name.as_str()).collect();
    let previous_names: HashSet<&str> = previous.iter().map(|s| s.name.as_str()).collect();

    for gone in previous.iter().filter(|s| !desired_names.contains(s.name.as_str())) {
        for (member, _) in &gone.members {
            ipset.remove_member(&gone.name, member, owner);
        }
        ipset.release(&gone.name);
    }

    for new in desired.iter().filter(|s| !previous_names.contains(s.name.as_str())) {
        ipset.ensure(&new.name, new.semantic_type);
        for (member, nomatch) in &new.members {
            if *nomatch {
                ipset.add_nomatch_member(&new.name, member, owner);
            } else {
                ipset.add_member(&new.name, member, owner);
            }
        }
    }

    // Sets required both before and after keep their set-level ref, but their seeded
    // members (CIDR-blocks exceptions, list-of-sets children) can still change.
    for new in desired {
        let Some(old) = previous.iter().find(|s| s.name == new.name) else {
            continue;
        };
        let old_members: HashSet<&(String, bool)> = old.members.iter().collect();
        let new_members: HashSet<&(String, bool)> = new.members.iter().collect();
        for (member, _) in old.members.iter().filter(|m| !new_members.contains(m)) {
            ipset.remove_member(&new.name, member, owner);
        }
        for (member, nomatch) in new.members.iter().filter(|m| !old_members.contains(m)) {
            if *nomatch {
                ipset.add_nomatch_member(&new.name, member, owner);
            } else {
                ipset.add_member(&new.name, member, owner);
            }
        }
    }
}

/// Diffs the translation's required sets against what this policy last installed, applies
/// the minimal ensure/release/member calls, then installs the translated rules (spec.md
/// §4.3-§4.4: sets must exist before the rules that reference them are installed).
async fn install(
    ipset: &mut IpSetManager,
    rules: &mut RuleEngine,
    shim: &dyn KernelShim,
    cache: &NpmCache,
    metrics: &CoreMetrics,
    policy: &NetworkPolicySnapshot,
) -> npm_core::Result<()> {
    let translation = translate(policy);
    let previous = cache.installed_required_sets(&policy.key).await.unwrap_or_default();

    diff_required_sets(ipset, &policy.key, &previous, &translation.required_sets);
    ipset.apply(shim, metrics).await?;
    cache
        .set_installed_required_sets(&policy.key, translation.required_sets.clone())
        .await;

    rules.install_policy(shim, &policy.key, translation.rules, metrics).await
}

/// Removes a policy's rules, then releases every set it last installed (whose members, for
/// CIDR-blocks sets, were only ever referenced by this policy key).
async fn uninstall(
    ipset: &mut IpSetManager,
    rules: &mut RuleEngine,
    shim: &dyn KernelShim,
    cache: &NpmCache,
    metrics: &CoreMetrics,
    policy: &NetworkPolicySnapshot,
) -> npm_core::Result<()> {
    rules.remove_policy(shim, &policy.key, metrics).await?;

    let previous = cache.take_installed_required_sets(&policy.key).await.unwrap_or_default();
    diff_required_sets(ipset, &policy.key, &previous, &[]);
    ipset.apply(shim, metrics).await
}

fn find_policy(agent: &Agent, key: &str) -> Option<Arc<NetworkPolicy>> {
    let (namespace, name) = key.split_once('/')?;
    agent
        .networkpolicy_store
        .state()
        .into_iter()
        .find(|p| p.namespace().as_deref() == Some(namespace) && p.name_any() == name)
}

#[instrument(skip(agent))]
async fn reconcile_key(agent: &Agent, key: &str) -> npm_core::Result<()> {
    let trace_id = telemetry::get_trace_id();
    trace!(%key, %trace_id, "reconciling networkpolicy");
    let live = find_policy(agent, key);

    let is_gone_or_deleted = match &live {
        None => true,
        Some(p) => p.metadata.deletion_timestamp.is_some(),
    };

    let mut ipset = agent.ipset.lock().await;
    let mut rules = agent.rules.lock().await;

    if is_gone_or_deleted {
        if let Some(p) = live.as_deref() {
            if let Some(policy) = convert_network_policy(p) {
                uninstall(&mut ipset, &mut rules, agent.shim.as_ref(), &agent.cache, &agent.metrics.core, &policy)
                    .await?;
                agent.cache.sync_ipsets(&ipset).await;
            }
        }
        return Ok(());
    }

    let Some(policy) = live.as_deref().and_then(convert_network_policy) else {
        return Ok(());
    };

    // install_policy no-ops on an identical rule set, so create and update both funnel here
    // without tracking a separate "changed" signal.
    install(&mut ipset, &mut rules, agent.shim.as_ref(), &agent.cache, &agent.metrics.core, &policy).await?;
    agent.cache.sync_ipsets(&ipset).await;
    Ok(())
}

pub async fn run_worker(agent: Arc<Agent>) {
    loop {
        let key = tokio::select! {
            key = agent.networkpolicy_queue.recv() => key,
            _ = agent.stop.cancelled() => None,
        };
        let Some(key) = key else { break };

        let metrics = agent.metrics.controllers.get(NETWORKPOLICY_CONTROLLER).unwrap();
        let _timer = metrics.reconcile_count_and_measure();
        match reconcile_key(&agent, &key).await {
            Ok(()) => {
                agent.networkpolicy_queue.forget(&key).await;
            }
            Err(e) => {
                metrics.reconcile_failure_inc();
                agent.metrics.core.policy_install_failures_total.inc();
                warn!(error = %e, %key, "networkpolicy reconcile failed, requeueing");
                if agent.networkpolicy_queue.add_rate_limited(key.clone()).await.is_none() {
                    error!(%key, "networkpolicy key forgotten after max attempts");
                    metrics.key_forgotten_inc();
                }
            }
        }
        agent.networkpolicy_queue.done(&key).await;
    }
}

pub async fn run_watch(agent: Arc<Agent>, api: Api<NetworkPolicy>, writer: Writer<NetworkPolicy>) {
    let metrics = agent.metrics.controllers.get(NETWORKPOLICY_CONTROLLER).unwrap().clone();
    metrics.ready_set(1);
    watcher(api, watcher::Config::default())
        .default_backoff()
        .reflect_shared(writer)
        .for_each(|event| {
            let agent = agent.clone();
            let metrics = metrics.clone();
            async move {
                match event {
                    Ok(watcher::Event::Apply(np)) => {
                        let key = object_key(&np.namespace().unwrap_or_default(), &np.name_any());
                        metrics.triggered_inc(TriggerAction::Apply);
                        agent.networkpolicy_queue.add(key).await;
                    }
                    Ok(watcher::Event::Delete(np)) => {
                        let key = object_key(&np.namespace().unwrap_or_default(), &np.name_any());
                        metrics.triggered_inc(TriggerAction::Delete);
                        agent.networkpolicy_queue.add(key).await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(error = %e, "networkpolicy watch error");
                        metrics.watch_operations_failed_inc();
                    }
                }
            }
        })
        .await;
    metrics.ready_set(0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use npm_core::metrics::Metrics;
    use npm_core::model::{LabelSelectorReq, Peer, PolicyPeerRule, PolicyTypeMask, PortClause, PortRef, Protocol};
    use npm_core::shim::MockShim;

    fn policy() -> NetworkPolicySnapshot {
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
                    namespace_selector: None,
                }],
                ports: vec![PortClause {
                    protocol: Protocol::Tcp,
                    port: PortRef::Number(80),
                }],
            }],
            egress: vec![],
        }
    }

    #[tokio::test]
    async fn install_creates_sets_and_rules_then_uninstall_reverses_it() {
        let shim = MockShim::default();
        let metrics = Metrics::new(&[]);
        let cache = NpmCache::new();
        let mut ipset = IpSetManager::new();
        let mut rules = RuleEngine::new();
        let p = policy();

        install(&mut ipset, &mut rules, &shim, &cache, &metrics.core, &p).await.unwrap();
        assert!(rules.applied_rules(&p.key).is_some());
        assert!(ipset.contains("ns-x"));
        assert!(ipset.contains("pod:b"));
        assert!(ipset.contains("pod:a"));

        uninstall(&mut ipset, &mut rules, &shim, &cache, &metrics.core, &p).await.unwrap();
        assert!(rules.applied_rules(&p.key).is_none());
        assert!(!ipset.contains("ns-x"));
    }

    #[tokio::test]
    async fn reinstalling_identical_policy_issues_no_extra_restore() {
        let shim = MockShim::default();
        let metrics = Metrics::new(&[]);
        let cache = NpmCache::new();
        let mut ipset = IpSetManager::new();
        let mut rules = RuleEngine::new();
        let p = policy();

        install(&mut ipset, &mut rules, &shim, &cache, &metrics.core, &p).await.unwrap();
        install(&mut ipset, &mut rules, &shim, &cache, &metrics.core, &p).await.unwrap();
        assert_eq!(shim.restore_calls(), 1);
    }

    #[tokio::test]
    async fn repeated_install_does_not_inflate_set_ref_count() {
        let shim = MockShim::default();
        let metrics = Metrics::new(&[]);
        let cache = NpmCache::new();
        let mut ipset = IpSetManager::new();
        let mut rules = RuleEngine::new();
        let p = policy();

        // A relisted watcher re-emits Apply for an unchanged object; install() must be safe
        // to call repeatedly for the same policy generation.
        for _ in 0..5 {
            install(&mut ipset, &mut rules, &shim, &cache, &metrics.core, &p).await.unwrap();
        }
        assert_eq!(ipset.get("ns-x").unwrap().ref_count, 1);
        assert_eq!(ipset.get("pod:a").unwrap().ref_count, 1);

        uninstall(&mut ipset, &mut rules, &shim, &cache, &metrics.core, &p).await.unwrap();
        assert!(!ipset.contains("ns-x"));
        assert!(!ipset.contains("pod:a"));
    }

    #[tokio::test]
    async fn changing_peer_selector_moves_the_ref_without_leaking_the_old_set() {
        let shim = MockShim::default();
        let metrics = Metrics::new(&[]);
        let cache = NpmCache::new();
        let mut ipset = IpSetManager::new();
        let mut rules = RuleEngine::new();
        let mut p = policy();

        install(&mut ipset, &mut rules, &shim, &cache, &metrics.core, &p).await.unwrap();
        assert!(ipset.contains("pod:a"));

        p.ingress[0].peers = vec![Peer::PodSelector {
            pod_selector: vec![LabelSelectorReq {
                key: "pod".to_string(),
                values: vec!["c".to_string()],
            }],
            namespace_selector: None,
        }];
        install(&mut ipset, &mut rules, &shim, &cache, &metrics.core, &p).await.unwrap();

        assert!(!ipset.contains("pod:a"));
        assert!(ipset.contains("pod:c"));
        // the namespace set is still required by both generations: exactly one ref, never
        // released along the way
        assert_eq!(ipset.get("ns-x").unwrap().ref_count, 1);
    }
}
