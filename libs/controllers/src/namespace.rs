//! Namespace controller (spec.md §4.5). Maintains the `all-namespaces` list-of-sets plus one
//! set per distinct namespace key/key:value label, and keeps the namespace's own `ns-<name>`
//! set (created on demand by the first pod that needs it) registered in `all-namespaces`.

use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::runtime::reflector::store::Writer;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, ResourceExt};
use tracing::{debug, error, instrument, trace, warn};

use npm_core::ipset::{IpSetManager, SemanticType};
use npm_core::metrics::TriggerAction;
use npm_core::model::{
    key_label_set_name, key_value_label_set_name, namespace_set_name, NamespaceSnapshot,
    ALL_NAMESPACES_LIST,
};
use npm_core::telemetry;

use crate::context::{Agent, NAMESPACE_CONTROLLER};
use crate::convert::convert_namespace;

fn desired_label_sets(ns: &NamespaceSnapshot) -> Vec<(String, SemanticType)> {
    let mut sets = Vec::with_capacity(ns.labels.len() * 2);
    for (k, v) in &ns.labels {
        sets.push((key_label_set_name(k), SemanticType::KeyLabelOfNamespace));
        sets.push((key_value_label_set_name(k, v), SemanticType::KeyValueLabelOfNamespace));
    }
    sets
}

/// Diffs `cached` against `desired` and issues the minimal ensure/release/add/remove calls,
/// plus registers/deregisters the namespace's own set in `all-namespaces`.
pub fn reconcile_sets(ipset: &mut IpSetManager, cached: Option<&NamespaceSnapshot>, desired: &NamespaceSnapshot) {
    let owner = &desired.name;
    let own_set = namespace_set_name(&desired.name);

    if cached.is_none() {
        ipset.ensure(ALL_NAMESPACES_LIST, SemanticType::AllNamespaces);
        ipset.add_member(ALL_NAMESPACES_LIST, &own_set, owner);
    }

    let desired_label = desired_label_sets(desired);
    let desired_names: HashSet<&str> = desired_label.iter().map(|(n, _)| n.as_str()).collect();

    if let Some(cached) = cached {
        let cached_label = desired_label_sets(cached);
        let cached_names: HashSet<&str> = cached_label.iter().map(|(n, _)| n.as_str()).collect();
        for (name, _) in cached_label.iter().filter(|(n, _)| !desired_names.contains(n.as_str())) {
            ipset.remove_member(name, &own_set, owner);
            ipset.release(name);
        }
        for (name, semantic) in desired_label
            .iter()
            .filter(|(n, _)| !cached_names.contains(n.as_str()))
        {
            ipset.ensure(name, *semantic);
            ipset.add_member(name, &own_set, owner);
        }
    } else {
        for (name, semantic) in &desired_label {
            ipset.ensure(name, *semantic);
            ipset.add_member(name, &own_set, owner);
        }
    }
}

/// Releases every set a namespace referenced, including its own registration in
/// `all-namespaces`. Does not delete `ns-<name>` itself: that set is owned by whichever pods
/// are members of it, and is torn down only once the last pod in the namespace is gone.
pub fn reconcile_delete(ipset: &mut IpSetManager, cached: &NamespaceSnapshot) {
    let owner = &cached.name;
    let own_set = namespace_set_name(&cached.name);
    for (name, _) in desired_label_sets(cached) {
        ipset.remove_member(&name, &own_set, owner);
        ipset.release(&name);
    }
    ipset.remove_member(ALL_NAMESPACES_LIST, &own_set, owner);
    ipset.release(ALL_NAMESPACES_LIST);
}

fn find_namespace(agent: &Agent, name: &str) -> Option<Arc<Namespace>> {
    agent.namespace_store.state().into_iter().find(|n| n.name_any() == name)
}

#[instrument(skip(agent))]
async fn reconcile_key(agent: &Agent, name: &str) -> npm_core::Result<()> {
    let trace_id = telemetry::get_trace_id();
    trace!(%name, %trace_id, "reconciling namespace");
    let live = find_namespace(agent, name);
    let cached = agent.cache.snapshot().await.namespace_map.get(name).cloned();

    let mut ipset = agent.ipset.lock().await;
    let (is_gone, live_deleted) = match &live {
        None => (true, false),
        Some(n) => (false, n.metadata.deletion_timestamp.is_some()),
    };

    if is_gone || live_deleted {
        if let Some(cached) = cached {
            reconcile_delete(&mut ipset, &cached);
            ipset.apply(agent.shim.as_ref(), &agent.metrics.core).await?;
            agent.cache.sync_ipsets(&ipset).await;
            agent.cache.remove_namespace(name).await;
        }
        return Ok(());
    }

    let ns = convert_namespace(live.as_deref().unwrap());
    if cached.as_ref() == Some(&ns) {
        return Ok(());
    }

    reconcile_sets(&mut ipset, cached.as_ref(), &ns);
    ipset.apply(agent.shim.as_ref()).await?;
    agent.cache.sync_ipsets(&ipset).await;
    drop(ipset);
    agent.cache.upsert_namespace(ns).await;
    Ok(())
}

pub async fn run_worker(agent: Arc<Agent>) {
    loop {
        let key = tokio::select! {
            key = agent.namespace_queue.recv() => key,
            _ = agent.stop.cancelled() => None,
        };
        let Some(key) = key else { break };

        let metrics = agent.metrics.controllers.get(NAMESPACE_CONTROLLER).unwrap();
        let _timer = metrics.reconcile_count_and_measure();
        match reconcile_key(&agent, &key).await {
            Ok(()) => {
                agent.namespace_queue.forget(&key).await;
            }
            Err(e) => {
                metrics.reconcile_failure_inc();
                warn!(error = %e, %key, "namespace reconcile failed, requeueing");
                if agent.namespace_queue.add_rate_limited(key.clone()).await.is_none() {
                    error!(%key, "namespace key forgotten after max attempts");
                    metrics.key_forgotten_inc();
                }
            }
        }
        agent.namespace_queue.done(&key).await;
    }
}

pub async fn run_watch(agent: Arc<Agent>, api: Api<Namespace>, writer: Writer<Namespace>) {
    let metrics = agent.metrics.controllers.get(NAMESPACE_CONTROLLER).unwrap().clone();
    metrics.ready_set(1);
    watcher(api, watcher::Config::default())
        .default_backoff()
        .reflect_shared(writer)
        .for_each(|event| {
            let agent = agent.clone();
            let metrics = metrics.clone();
            async move {
                match event {
                    Ok(watcher::Event::Apply(ns)) => {
                        metrics.triggered_inc(TriggerAction::Apply);
                        agent.namespace_queue.add(ns.name_any()).await;
                    }
                    Ok(watcher::Event::Delete(ns)) => {
                        metrics.triggered_inc(TriggerAction::Delete);
                        agent.namespace_queue.add(ns.name_any()).await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(error = %e, "namespace watch error");
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
    use std::collections::BTreeMap;

    fn namespace(name: &str, labels: &[(&str, &str)]) -> NamespaceSnapshot {
        NamespaceSnapshot {
            name: name.to_string(),
            labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn new_namespace_registers_in_all_namespaces_and_label_sets() {
        let mut ipset = IpSetManager::new();
        let ns = namespace("y", &[("team", "payments")]);
        reconcile_sets(&mut ipset, None, &ns);
        assert!(ipset
            .get(ALL_NAMESPACES_LIST)
            .unwrap()
            .members
            .child_names()
            .contains(&"ns-y".to_string()));
        assert!(ipset
            .get("team:payments")
            .unwrap()
            .members
            .ip_entries()
            .iter()
            .any(|m| m.cidr == "ns-y"));
    }

    #[test]
    fn deleted_namespace_releases_every_set() {
        let mut ipset = IpSetManager::new();
        let ns = namespace("y", &[("team", "payments")]);
        reconcile_sets(&mut ipset, None, &ns);
        reconcile_delete(&mut ipset, &ns);
        assert!(!ipset
            .get(ALL_NAMESPACES_LIST)
            .unwrap()
            .members
            .child_names()
            .contains(&"ns-y".to_string()));
        assert!(ipset.get("team:payments").unwrap().members.ip_entries().is_empty());
    }

    #[test]
    fn relabel_moves_membership_without_double_counting() {
        let mut ipset = IpSetManager::new();
        let before = namespace("y", &[("team", "payments")]);
        reconcile_sets(&mut ipset, None, &before);
        let after = namespace("y", &[("team", "platform")]);
        reconcile_sets(&mut ipset, Some(&before), &after);
        assert!(ipset.get("team:payments").unwrap().members.ip_entries().is_empty());
        assert!(ipset
            .get("team:platform")
            .unwrap()
            .members
            .ip_entries()
            .iter()
            .any(|m| m.cidr == "ns-y"));
    }
}
