/// Node name for this agent, used by the debug snapshot's `NodeName` field.
///
/// Reads the conventional downward-API `NODE_NAME` env var first, falling back to the
/// OS hostname, since not every deployment mode injects the env var.
pub fn node_name() -> String {
    std::env::var("NODE_NAME")
        .ok()
        .or_else(|| hostname::get().ok().and_then(|h| h.into_string().ok()))
        .unwrap_or_else(|| "unknown".to_string())
}
