//! Pod controller (spec.md §4.5). Maintains namespace/label/named-port IPSet membership for
//! every non-host-network pod that has an IP.

use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::reflector::store::Writer;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, ResourceExt};
use tracing::{debug, error, instrument, trace, warn};

use npm_core::ipset::{IpSetManager, SemanticType};
use npm_core::metrics::TriggerAction;
use npm_core::model::{key_label_set_name, key_value_label_set_name, object_key, PodSnapshot};
use npm_core::telemetry;

use crate::context::{Agent, POD_CONTROLLER};
use crate::convert::{convert_pod, pod_is_complete};

fn namedport_set_name(name: &str) -> String {
    format!("namedport:{name}")
}

fn namedport_member(pod: &PodSnapshot, port: u16, protocol: npm_core::model::Protocol) -> String {
    format!("{},{}:{}", pod.ip, protocol.as_str(), port)
}

/// `(set-name, semantic-type)` pairs a pod is a member of given its namespace and labels.
fn desired_label_sets(pod: &PodSnapshot) -> Vec<(String, SemanticType)> {
    let mut sets = vec![(pod.namespace_set_name(), SemanticType::Namespace)];
    for (k, v) in &pod.labels {
        sets.push((key_label_set_name(k), SemanticType::KeyLabelOfPod));
        sets.push((key_value_label_set_name(k, v), SemanticType::KeyValueLabelOfPod));
    }
    sets
}

fn desired_named_port_sets(pod: &PodSnapshot) -> Vec<(String, String)> {
    pod.named_ports
        .iter()
        .map(|np| (namedport_set_name(&np.name), namedport_member(pod, np.port, np.protocol)))
        .collect()
}

/// Diffs `cached` against `desired` and issues the minimal ensure/release/add/remove calls
/// to converge (spec.md §4.5 Pod reconcile, §8 scenario 5: no intermediate state where a
/// renamed label is a member of both the old and new set).
pub fn reconcile_sets(ipset: &mut IpSetManager, cached: Option<&PodSnapshot>, desired: &PodSnapshot) {
    let owner = &desired.key;
    let desired_label = desired_label_sets(desired);
    let desired_names: HashSet<&str> = desired_label.iter().map(|(n, _)| n.as_str()).collect();

    let ip_changed = cached.map(|c| c.ip != desired.ip).unwrap_or(false);

    if let Some(cached) = cached {
        let cached_label = desired_label_sets(cached);
        if ip_changed {
            for (name, _) in &cached_label {
                ipset.remove_member(name, &cached.ip, owner);
                ipset.release(name);
            }
            for (name, semantic) in &desired_label {
                ipset.ensure(name, *semantic);
                ipset.add_member(name, &desired.ip, owner);
            }
        } else {
            let cached_names: HashSet<&str> = cached_label.iter().map(|(n, _)| n.as_str()).collect();
            for (name, _) in cached_label.iter().filter(|(n, _)| !desired_names.contains(n.as_str())) {
                ipset.remove_member(name, &cached.ip, owner);
                ipset.release(name);
            }
            for (name, semantic) in desired_label
                .iter()
                .filter(|(n, _)| !cached_names.contains(n.as_str()))
            {
                ipset.ensure(name, *semantic);
                ipset.add_member(name, &desired.ip, owner);
            }
        }
    } else {
        for (name, semantic) in &desired_label {
            ipset.ensure(name, *semantic);
            ipset.add_member(name, &desired.ip, owner);
        }
    }

    // Named ports: diff-only update, deliberately not the legacy delete-all-then-re-add
    // (spec.md §9 Design Notes, uncertain-behaviour (a)).
    let desired_ports = desired_named_port_sets(desired);
    if let Some(cached) = cached {
        let cached_ports = if ip_changed {
            Vec::new()
        } else {
            desired_named_port_sets(cached)
        };
        if ip_changed {
            for (name, member) in desired_named_port_sets(cached) {
                ipset.remove_member(&name, &member, owner);
                ipset.release(&name);
            }
        } else {
            for (name, member) in &cached_ports {
                if !desired_ports.iter().any(|(n, m)| n == name && m == member) {
                    ipset.remove_member(name, member, owner);
                    ipset.release(name);
                }
            }
        }
        for (name, member) in &desired_ports {
            if !cached_ports.iter().any(|(n, m)| n == name && m == member) {
                ipset.ensure(name, SemanticType::NamedPort);
                ipset.add_member(name, member, owner);
            }
        }
    } else {
        for (name, member) in &desired_ports {
            ipset.ensure(name, SemanticType::NamedPort);
            ipset.add_member(name, member, owner);
        }
    }
}

/// Removes every trace of a pod that is absent, complete, or deleted (spec.md §4.5, §8).
pub fn reconcile_delete(ipset: &mut IpSetManager, cached: &PodSnapshot) {
    let owner = &cached.key;
    for (name, _) in desired_label_sets(cached) {
        ipset.remove_member(&name, &cached.ip, owner);
        ipset.release(&name);
    }
    for (name, member) in desired_named_port_sets(cached) {
        ipset.remove_member(&name, &member, owner);
        ipset.release(&name);
    }
}

fn find_pod(agent: &Agent, key: &str) -> Option<Arc<Pod>> {
    let (namespace, name) = key.split_once('/')?;
    agent
        .pod_store
        .state()
        .into_iter()
        .find(|p| p.namespace().as_deref() == Some(namespace) && p.name_any() == name)
}

#[instrument(skip(agent))]
async fn reconcile_key(agent: &Agent, key: &str) -> npm_core::Result<()> {
    let trace_id = telemetry::get_trace_id();
    trace!(%key, %trace_id, "reconciling pod");
    let live = find_pod(agent, key);
    let cached = agent.cache.snapshot().await.pod_map.get(key).cloned();

    let is_gone_or_complete = match &live {
        None => true,
        Some(p) => pod_is_complete(p),
    };

    let mut ipset = agent.ipset.lock().await;
    if is_gone_or_complete {
        if let Some(cached) = cached {
            reconcile_delete(&mut ipset, &cached);
            ipset.apply(agent.shim.as_ref(), &agent.metrics.core).await?;
            agent.cache.sync_ipsets(&ipset).await;
            agent.cache.remove_pod(key).await;
        }
        return Ok(());
    }

    let Some(pod) = live.as_deref().and_then(convert_pod) else {
        return Ok(());
    };

    if cached.as_ref() == Some(&pod) {
        return Ok(());
    }

    reconcile_sets(&mut ipset, cached.as_ref(), &pod);
    ipset.apply(agent.shim.as_ref()).await?;
    agent.cache.sync_ipsets(&ipset).await;
    drop(ipset);
    agent.cache.upsert_pod(pod).await;
    Ok(())
}

/// Drains the pod work queue until the agent's stop signal fires.
pub async fn run_worker(agent: Arc<Agent>) {
    loop {
        let key = tokio::select! {
            key = agent.pod_queue.recv() => key,
            _ = agent.stop.cancelled() => None,
        };
        let Some(key) = key else { break };

        let metrics = agent.metrics.controllers.get(POD_CONTROLLER).unwrap();
        let _timer = metrics.reconcile_count_and_measure();
        match reconcile_key(&agent, &key).await {
            Ok(()) => {
                agent.pod_queue.forget(&key).await;
            }
            Err(e) => {
                metrics.reconcile_failure_inc();
                warn!(error = %e, %key, "pod reconcile failed, requeueing");
                if agent.pod_queue.add_rate_limited(key.clone()).await.is_none() {
                    error!(%key, "pod key forgotten after max attempts");
                    metrics.key_forgotten_inc();
                }
            }
        }
        agent.pod_queue.done(&key).await;
    }
}

/// Watches Pods, reflects every event into the shared store, and pushes keys onto the work
/// queue (informer dispatch thread, spec.md §5: filter + enqueue only, never blocking on
/// anything but the queue itself).
pub async fn run_watch(agent: Arc<Agent>, api: Api<Pod>, writer: Writer<Pod>) {
    let metrics = agent.metrics.controllers.get(POD_CONTROLLER).unwrap().clone();
    metrics.ready_set(1);
    watcher(api, watcher::Config::default())
        .default_backoff()
        .reflect_shared(writer)
        .for_each(|event| {
            let agent = agent.clone();
            let metrics = metrics.clone();
            async move {
                match event {
                    Ok(watcher::Event::Apply(pod)) => {
                        if convert_pod(&pod).is_some() || pod_is_complete(&pod) {
                            let key = object_key(&pod.namespace().unwrap_or_default(), &pod.name_any());
                            metrics.triggered_inc(TriggerAction::Apply);
                            agent.pod_queue.add(key).await;
                        }
                    }
                    Ok(watcher::Event::Delete(pod)) => {
                        let key = object_key(&pod.namespace().unwrap_or_default(), &pod.name_any());
                        metrics.triggered_inc(TriggerAction::Delete);
                        agent.pod_queue.add(key).await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(error = %e, "pod watch error");
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
    use npm_core::model::{object_key, NamedPort, PodPhase, Protocol};
    use std::collections::BTreeMap;

    fn pod(ns: &str, name: &str, ip: &str, labels: &[(&str, &str)]) -> PodSnapshot {
        PodSnapshot {
            key: object_key(ns, name),
            namespace: ns.to_string(),
            name: name.to_string(),
            uid: "uid".to_string(),
            ip: ip.to_string(),
            named_ports: vec![],
            labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect::<BTreeMap<_, _>>(),
            phase: PodPhase::Running,
            host_network: false,
            resource_version: "1".to_string(),
        }
    }

    #[test]
    fn new_pod_joins_namespace_and_label_sets() {
        let mut ipset = IpSetManager::new();
        let a = pod("y", "a", "10.224.0.17", &[("pod", "a")]);
        reconcile_sets(&mut ipset, None, &a);
        assert!(ipset.get("ns-y").unwrap().members.ip_entries().iter().any(|m| m.cidr == "10.224.0.17"));
        assert!(ipset.get("pod").unwrap().members.ip_entries().iter().any(|m| m.cidr == "10.224.0.17"));
        assert!(ipset.get("pod:a").unwrap().members.ip_entries().iter().any(|m| m.cidr == "10.224.0.17"));
    }

    #[test]
    fn deleting_pod_removes_ip_from_every_set() {
        let mut ipset = IpSetManager::new();
        let a = pod("y", "a", "10.224.0.17", &[("pod", "a")]);
        reconcile_sets(&mut ipset, None, &a);
        reconcile_delete(&mut ipset, &a);
        assert!(ipset.get("ns-y").unwrap().members.ip_entries().is_empty());
        assert!(ipset.get("pod:a").unwrap().members.ip_entries().is_empty());
    }

    #[test]
    fn relabel_moves_membership_without_overlap() {
        let mut ipset = IpSetManager::new();
        let before = pod("x", "web", "10.0.0.5", &[("app", "frontend")]);
        reconcile_sets(&mut ipset, None, &before);
        let after = pod("x", "web", "10.0.0.5", &[("app", "backend")]);
        reconcile_sets(&mut ipset, Some(&before), &after);
        assert!(ipset.get("app:frontend").unwrap().members.ip_entries().is_empty());
        assert!(ipset
            .get("app:backend")
            .unwrap()
            .members
            .ip_entries()
            .iter()
            .any(|m| m.cidr == "10.0.0.5"));
    }

    #[test]
    fn ip_change_moves_membership_to_new_address() {
        let mut ipset = IpSetManager::new();
        let before = pod("x", "web", "10.0.0.5", &[("app", "frontend")]);
        reconcile_sets(&mut ipset, None, &before);
        let after = pod("x", "web", "10.0.0.9", &[("app", "frontend")]);
        reconcile_sets(&mut ipset, Some(&before), &after);
        let members = ipset.get("app:frontend").unwrap().members.ip_entries();
        assert!(members.iter().any(|m| m.cidr == "10.0.0.9"));
        assert!(!members.iter().any(|m| m.cidr == "10.0.0.5"));
    }

    #[test]
    fn named_port_membership_is_diffed_not_delete_all() {
        let mut ipset = IpSetManager::new();
        let mut before = pod("x", "b", "10.0.0.20", &[]);
        before.named_ports = vec![NamedPort {
            name: "serve-80-tcp".to_string(),
            port: 80,
            protocol: Protocol::Tcp,
        }];
        reconcile_sets(&mut ipset, None, &before);
        // no port change: re-running with identical snapshot must not touch the set again
        reconcile_sets(&mut ipset, Some(&before), &before.clone());
        let members = ipset.get("namedport:serve-80-tcp").unwrap().members.ip_entries();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].cidr, "10.0.0.20,tcp:80");
    }
}
