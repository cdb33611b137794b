//! `Agent`: the explicit, constructed value that owns every controller, the cache and the
//! kernel shim (spec.md §9 Design Notes: "Global mutable state" — no process-wide singleton).

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Namespace, Pod};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::runtime::reflector::Store;
use kube::Client;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use npm_core::cache::NpmCache;
use npm_core::ipset::IpSetManager;
use npm_core::metrics::Metrics;
use npm_core::model::ObjectKey;
use npm_core::rules::RuleEngine;
use npm_core::shim::KernelShim;
use npm_core::workqueue::RateLimitingQueue;

pub const POD_CONTROLLER: &str = "pod";
pub const NAMESPACE_CONTROLLER: &str = "namespace";
pub const NETWORKPOLICY_CONTROLLER: &str = "networkpolicy";

pub const CONTROLLER_IDS: [&str; 3] = [POD_CONTROLLER, NAMESPACE_CONTROLLER, NETWORKPOLICY_CONTROLLER];

/// Shared state every controller worker and the debug HTTP handler read from.
///
/// The NPM-wide lock spec.md §5 calls for is the pair of `Mutex`es around the IPSet Manager
/// and Rule Engine: both are only ever touched from inside one reconcile at a time, and a
/// reconcile that mutates sets always applies them before installing rules that reference
/// them, so the two locks are taken in that fixed order everywhere in this crate.
pub struct Agent {
    pub client: Client,
    pub cache: NpmCache,
    pub ipset: Mutex<IpSetManager>,
    pub rules: Mutex<RuleEngine>,
    pub shim: Arc<dyn KernelShim>,
    pub metrics: Arc<Metrics>,
    pub pod_store: Store<Pod>,
    pub namespace_store: Store<Namespace>,
    pub networkpolicy_store: Store<NetworkPolicy>,
    pub pod_queue: RateLimitingQueue<ObjectKey>,
    pub namespace_queue: RateLimitingQueue<ObjectKey>,
    pub networkpolicy_queue: RateLimitingQueue<ObjectKey>,
    pub stop: CancellationToken,
}

impl Agent {
    pub fn new(
        client: Client,
        shim: Arc<dyn KernelShim>,
        pod_store: Store<Pod>,
        namespace_store: Store<Namespace>,
        networkpolicy_store: Store<NetworkPolicy>,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            cache: NpmCache::new(),
            ipset: Mutex::new(IpSetManager::new()),
            rules: Mutex::new(RuleEngine::new()),
            shim,
            metrics: Arc::new(Metrics::new(&CONTROLLER_IDS)),
            pod_store,
            namespace_store,
            networkpolicy_store,
            pod_queue: RateLimitingQueue::new(),
            namespace_queue: RateLimitingQueue::new(),
            networkpolicy_queue: RateLimitingQueue::new(),
            stop: CancellationToken::new(),
        })
    }
}
