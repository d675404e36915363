//! `cri-resource-manager`: node-level, topology-aware container resource
//! manager that transparently intercepts the CRI gRPC protocol between
//! kubelet and the container runtime.
//!
//! Grounded on `zerovisor-sdk/src/bin/cli.rs`'s `clap::Parser` CLI shape and
//! `zerovisor-sdk/src/bin/cri_server.rs`'s `#[tokio::main]` construct-then-serve
//! `main`, generalized to the longer startup/shutdown sequence `crm-supervisor`
//! owns.

mod discovery;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crm_policy::PolicyRegistry;
use crm_supervisor::{config, StartupOptions, Supervisor};

/// Node-level, topology-aware container resource manager.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file, read once at startup.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Configuration file used only if no agent connects within the
    /// startup grace window; overridden by a live agent's `SetConfig`.
    #[arg(long, value_name = "FILE")]
    force_config: Option<PathBuf>,

    /// UDS path of the real container runtime's CRI socket.
    #[arg(long, value_name = "PATH", default_value = "/var/run/crm/runtime.sock")]
    runtime_socket: PathBuf,

    /// UDS path of the real container runtime's image-service socket, if
    /// served separately from the runtime socket.
    #[arg(long, value_name = "PATH")]
    image_socket: Option<PathBuf>,

    /// UDS path this process serves the intercepted CRI surface on, the
    /// address kubelet should be pointed at.
    #[arg(long, value_name = "PATH", default_value = "/var/run/crm/relay.sock")]
    relay_socket: PathBuf,

    /// UDS path the node agent dials for `SetConfig`/`SetAdjustment`.
    #[arg(long, value_name = "PATH", default_value = "/var/run/crm/agent.sock")]
    agent_socket: PathBuf,

    /// UDS path this process serves `SetConfig`/`SetAdjustment` on. Alias
    /// retained for the agent-facing name of `--agent-socket`.
    #[arg(long, value_name = "PATH")]
    config_socket: Option<PathBuf>,

    /// Rejects any `policy.Active` change arriving via config, file or agent.
    #[arg(long)]
    disable_policy_switch: bool,

    /// Discards any persisted policy state and starts the active policy fresh.
    #[arg(long)]
    reset_policy: bool,

    /// Prints the fully resolved configuration and exits.
    #[arg(long)]
    print_config: bool,

    /// Lists registered policies and exits.
    #[arg(long)]
    list_policies: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Prints help for a configuration topic (or every topic, if omitted).
    ConfigHelp { topic: Option<String> },
}

const STARTUP_GRACE: Duration = Duration::from_secs(5);
const CACHE_MAX_AGE: Duration = Duration::from_secs(300);

fn init_tracing(debug: bool) {
    let default_filter = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).json().init();
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("cri-resource-manager: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    if cli.list_policies {
        for (name, description) in PolicyRegistry::default().names() {
            println!("{name}: {description}");
        }
        return Ok(());
    }

    if let Some(Command::ConfigHelp { topic }) = &cli.command {
        print_config_help(topic.as_deref());
        return Ok(());
    }

    let resolved = resolve_config(&cli).context("resolving configuration")?;
    init_tracing(resolved.logger_debug);

    if cli.print_config {
        println!("{}", serde_yaml::to_string(&ResolvedConfigView::from(&resolved))?);
        return Ok(());
    }

    let node_name = std::env::var("NODE_NAME").context("NODE_NAME environment variable is required")?;

    let options = StartupOptions {
        node_name,
        runtime_socket: cli.runtime_socket,
        image_socket: cli.image_socket,
        relay_socket: cli.relay_socket,
        agent_socket: cli.config_socket.unwrap_or(cli.agent_socket),
        cache_snapshot_path: PathBuf::from("/var/lib/crm/cache.json"),
        cache_max_age: CACHE_MAX_AGE,
        startup_grace: STARTUP_GRACE,
        cgroup_root: PathBuf::from("/sys/fs/cgroup"),
        resctrl_root: PathBuf::from("/sys/fs/resctrl"),
        resolved_config: resolved,
        disable_policy_switch: cli.disable_policy_switch,
    };

    if cli.reset_policy {
        let snapshot = options.cache_snapshot_path.clone();
        if snapshot.exists() {
            std::fs::remove_file(&snapshot).context("removing cache snapshot for --reset-policy")?;
        }
    }

    let topology_input = discovery::discover_topology();
    let supervisor = std::sync::Arc::new(Supervisor::start(&options, topology_input).await.context("starting up")?);
    tracing::info!("cri-resource-manager ready");

    let debug_toggle = supervisor.clone();
    let shutdown = async move {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing SIGTERM handler");
        let mut sigusr1 = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined1())
            .expect("installing SIGUSR1 handler");
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = sigterm.recv() => break,
                _ = sigusr1.recv() => {
                    let enabled = debug_toggle.toggle_debug();
                    tracing::info!(debug_enabled = enabled, "SIGUSR1 received, toggling debug logging");
                }
            }
        }
    };

    supervisor.serve(shutdown).await.context("serving")?;
    supervisor.shutdown().await.context("shutting down")?;
    tracing::info!("graceful shutdown complete");
    Ok(())
}

fn resolve_config(cli: &Cli) -> Result<config::ResolvedConfig> {
    if let Some(path) = &cli.config {
        return config::load_file(path).map_err(Into::into);
    }
    if let Some(path) = &cli.force_config {
        return config::load_file(path).map_err(Into::into);
    }
    Ok(config::ResolvedConfig::default())
}

fn print_config_help(topic: Option<&str>) {
    const TOPICS: &[(&str, &str)] = &[
        ("policy.Active", "name of the policy to run (see --list-policies)"),
        ("policy.ReservedResources.CPU", "comma list of CPU ids reserved cluster-wide"),
        ("logger.Debug", "enable debug-level logging"),
        ("logger.Enable", "enable logging entirely"),
        ("dump.Config", "log the fully resolved configuration at startup"),
        ("instrumentation.JaegerAgent", "Jaeger agent endpoint for trace export"),
        ("instrumentation.JaegerCollector", "Jaeger collector endpoint for trace export"),
        ("instrumentation.PrometheusExport", "Prometheus scrape endpoint"),
    ];
    match topic {
        Some(t) => match TOPICS.iter().find(|(k, _)| *k == t) {
            Some((k, v)) => println!("{k}: {v}"),
            None => println!("no help available for {t:?}"),
        },
        None => {
            for (k, v) in TOPICS {
                println!("{k}: {v}");
            }
        }
    }
}

#[derive(serde::Serialize)]
struct ResolvedConfigView {
    policy_active: String,
    reserved_cpus: Vec<u32>,
    logger_debug: bool,
    logger_enable: bool,
}

impl From<&config::ResolvedConfig> for ResolvedConfigView {
    fn from(c: &config::ResolvedConfig) -> Self {
        Self {
            policy_active: c.policy_active.clone(),
            reserved_cpus: c.reserved_cpus.clone(),
            logger_debug: c.logger_debug,
            logger_enable: c.logger_enable,
        }
    }
}
