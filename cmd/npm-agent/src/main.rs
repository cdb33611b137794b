mod cli;
mod http;

use std::io::Read as _;
use std::sync::Arc;

use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};

use npm_core::shim::dump;
use npm_core::shim::{KernelShim, ProcessKernelShim};
use npm_debug::snapshot::DebugManagerResponse;

use cli::{Args, Command, ConvertIptableArgs, DebugCommand, GetTuplesArgs, ParseIptableArgs, StartArgs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Start(start_args) => run_start(start_args).await,
        Command::Debug(DebugCommand::Parseiptable(a)) => run_parseiptable(a),
        Command::Debug(DebugCommand::Convertiptable(a)) => run_convertiptable(a).await,
        Command::Debug(DebugCommand::Gettuples(a)) => run_gettuples(a).await,
    }
}

async fn run_start(args: StartArgs) -> anyhow::Result<()> {
    npm_core::telemetry::init(&args.log_filter, args.log_format)?;

    let config = match args.kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(&path)?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?
        }
        None => Config::infer().await?,
    };
    let client: Client = npm_k8s_util::client::new_client(config).await?;

    let shim: Arc<dyn KernelShim> = Arc::new(ProcessKernelShim::new(args.lock_path));

    let (agent, tasks) = npm_controllers::bootstrap(client, shim);

    let app = http::router(agent.clone());
    let listener = TcpListener::bind(format!("0.0.0.0:{}", args.port)).await?;
    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal(agent.clone()));

    tracing::info!(port = args.port, "npm-agent started");

    let serve_result = server.await;

    agent.stop.cancel();
    for task in tasks {
        let _ = task.await;
    }
    serve_result?;
    Ok(())
}

async fn shutdown_signal(agent: Arc<npm_controllers::Agent>) {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM signal handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigterm.recv() => {},
        _ = agent.stop.cancelled() => {},
    }
}

fn read_input(input: Option<std::path::PathBuf>) -> anyhow::Result<String> {
    match input {
        Some(path) => Ok(std::fs::read_to_string(path)?),
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            Ok(buf)
        }
    }
}

fn read_cache_snapshot(path: &std::path::Path) -> anyhow::Result<npm_core::cache::NpmCacheSnapshot> {
    let text = std::fs::read_to_string(path)?;
    let resp: DebugManagerResponse = serde_json::from_str(&text)?;
    Ok(resp.into_cache_snapshot())
}

fn run_parseiptable(args: ParseIptableArgs) -> anyhow::Result<()> {
    let text = read_input(args.input)?;
    let parsed = dump::parse(&text)?;
    println!("{}", dump::render(&parsed));
    Ok(())
}

async fn run_convertiptable(args: ConvertIptableArgs) -> anyhow::Result<()> {
    let text = read_input(args.input)?;
    let parsed = dump::parse(&text)?;
    let cache = read_cache_snapshot(&args.cache_file)?;
    let shim = ProcessKernelShim::new(args.lock_path);

    let resolved = npm_debug::convert(&parsed, &cache, &shim).await?;
    println!("{}", serde_json::to_string_pretty(&resolved)?);
    Ok(())
}

async fn run_gettuples(args: GetTuplesArgs) -> anyhow::Result<()> {
    let text = read_input(args.input)?;
    let parsed = dump::parse(&text)?;
    let cache = read_cache_snapshot(&args.cache_file)?;
    let shim = ProcessKernelShim::new(args.lock_path);

    let resolved = npm_debug::convert(&parsed, &cache, &shim).await?;
    let src = npm_debug::Endpoint::resolve(&args.src, &cache);
    let dst = npm_debug::Endpoint::resolve(&args.dst, &cache);
    let tuples = npm_debug::analyze(&resolved, &src, &dst, &cache);
    println!("{}", serde_json::to_string_pretty(&tuples)?);
    Ok(())
}
