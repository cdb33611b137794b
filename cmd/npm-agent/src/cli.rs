//! `clap` surface for the `npm-agent` binary (SPEC_FULL.md §B.3): one `start` subcommand that
//! runs the agent, plus three `debug` subcommands mirroring the offline rule-dump tooling
//! `spec.md` §6 describes.

use std::path::PathBuf;

use clap::{crate_authors, crate_description, crate_version, Parser, Subcommand};

use npm_core::telemetry::LogFormat;

#[derive(Parser, Debug)]
#[command(
    name = "npm-agent",
    about = crate_description!(),
    version = crate_version!(),
    author = crate_authors!("\n"),
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Runs the per-node agent: watches Pods/Namespaces/NetworkPolicies and reconciles
    /// iptables/ipset state, serving the debug and metrics HTTP endpoints.
    Start(StartArgs),
    /// Offline rule-dump tooling (spec.md §6), operating on a saved `iptables-save`-style
    /// file instead of live kernel state.
    #[command(subcommand)]
    Debug(DebugCommand),
}

#[derive(Parser, Debug)]
pub struct StartArgs {
    /// Path to a kubeconfig file. Falls back to in-cluster config, then `$KUBECONFIG`.
    #[arg(long, env)]
    pub kubeconfig: Option<PathBuf>,

    /// Listen on given port for the debug and metrics HTTP endpoints.
    #[arg(short, long, default_value_t = 10091, env)]
    pub port: u16,

    /// Path to the cooperative lock file guarding iptables/ipset invocations.
    #[arg(long, default_value = "/run/npm-agent.lock", env)]
    pub lock_path: PathBuf,

    /// Set logging filter directive for `tracing_subscriber::filter::EnvFilter`. Example: "info,kube=debug,npm_core=debug"
    #[arg(long, default_value = "info", env)]
    pub log_filter: String,

    /// Set log format
    #[arg(long, value_enum, default_value = "text", env)]
    pub log_format: LogFormat,
}

#[derive(Subcommand, Debug)]
pub enum DebugCommand {
    /// Parses an `iptables-save`-style rule dump and prints it back out re-rendered, to
    /// check the parser's grammar against a captured dump.
    Parseiptable(ParseIptableArgs),
    /// Resolves a rule dump against a cache snapshot into the flattened per-rule view
    /// `spec.md` §4.7 describes.
    Convertiptable(ConvertIptableArgs),
    /// Evaluates the resolved rules against one source/destination flow and prints the
    /// resulting traffic tuples (spec.md §4.7).
    Gettuples(GetTuplesArgs),
}

#[derive(Parser, Debug)]
pub struct ParseIptableArgs {
    /// Rule dump file. Reads stdin if omitted.
    #[arg(short, long)]
    pub input: Option<PathBuf>,
}

#[derive(Parser, Debug)]
pub struct ConvertIptableArgs {
    /// Rule dump file. Reads stdin if omitted.
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// Debug manager cache snapshot (the JSON shape `GET /npm/v1/debug/manager` returns).
    #[arg(short = 'c', long)]
    pub cache_file: PathBuf,

    /// Path to the cooperative lock file guarding iptables/ipset invocations, used to list
    /// live CIDR-blocks set members while resolving the dump.
    #[arg(long, default_value = "/run/npm-agent.lock", env)]
    pub lock_path: PathBuf,
}

#[derive(Parser, Debug)]
pub struct GetTuplesArgs {
    /// Rule dump file. Reads stdin if omitted.
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// Debug manager cache snapshot (the JSON shape `GET /npm/v1/debug/manager` returns).
    #[arg(short = 'c', long)]
    pub cache_file: PathBuf,

    /// Source endpoint: a pod name, a pod IP, or the literal "external".
    #[arg(short, long)]
    pub src: String,

    /// Destination endpoint: a pod name, a pod IP, or the literal "external".
    #[arg(short, long)]
    pub dst: String,

    #[arg(long, default_value = "/run/npm-agent.lock", env)]
    pub lock_path: PathBuf,
}
