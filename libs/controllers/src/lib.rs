pub mod context;
pub mod convert;
pub mod namespace;
pub mod networkpolicy;
pub mod pod;

pub use context::Agent;

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Namespace, Pod};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::runtime::reflector;
use kube::{Api, Client};
use npm_core::shim::KernelShim;

/// Reflector store buffer size (spec.md §5 doesn't pin a number; chosen to comfortably hold
/// one full resync burst without a subscriber lagging far enough behind to miss events).
const STORE_BUFFER: usize = 256;

/// Builds the shared [`Agent`] and spawns the watch-dispatch and worker tasks for all three
/// controllers. Returns once every task has been spawned; callers await `agent.stop.cancelled()`
/// (or a signal handler that cancels it) to know when to shut the process down (spec.md §9
/// Design Notes: graceful shutdown via a cancellation token, not a bare process exit).
pub fn bootstrap(client: Client, shim: Arc<dyn KernelShim>) -> (Arc<Agent>, Vec<tokio::task::JoinHandle<()>>) {
    let (pod_store, pod_writer) = reflector::store_shared(STORE_BUFFER);
    let (namespace_store, namespace_writer) = reflector::store_shared(STORE_BUFFER);
    let (networkpolicy_store, networkpolicy_writer) = reflector::store_shared(STORE_BUFFER);

    let agent = Agent::new(client, shim, pod_store, namespace_store, networkpolicy_store);

    let pod_api: Api<Pod> = Api::all(agent.client.clone());
    let namespace_api: Api<Namespace> = Api::all(agent.client.clone());
    let networkpolicy_api: Api<NetworkPolicy> = Api::all(agent.client.clone());

    let tasks = vec![
        tokio::spawn(pod::run_watch(agent.clone(), pod_api, pod_writer)),
        tokio::spawn(pod::run_worker(agent.clone())),
        tokio::spawn(namespace::run_watch(agent.clone(), namespace_api, namespace_writer)),
        tokio::spawn(namespace::run_worker(agent.clone())),
        tokio::spawn(networkpolicy::run_watch(
            agent.clone(),
            networkpolicy_api,
            networkpolicy_writer,
        )),
        tokio::spawn(networkpolicy::run_worker(agent.clone())),
    ];

    (agent, tasks)
}
