use kube::{Client, Config};

/// Build a `kube::Client` from the given config.
///
/// Kept as its own function (rather than calling `Client::try_from` inline at every call
/// site) so the agent has one place to grow TLS/proxy tweaks without touching callers.
pub async fn new_client(config: Config) -> kube::Result<Client> {
    Client::try_from(config)
}
