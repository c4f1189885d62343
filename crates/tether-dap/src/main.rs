use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use tether_dap::config::{AdapterConfig, DebugMode, ServerTrace, WaitStrategy};
use tether_dap::breakpoints::{BreakpointSynchronizer, DefaultBreakpointPolicy};
use tether_dap::exceptions::ExceptionFilterRegistry;
use tether_dap::process::AdapterProcess;
use tether_dap::readiness::{ReadinessMonitor, ReadinessRegistry, ReadinessSurface};
use tether_dap::session::{DebugSession, SessionParams};
use tether_dap::settings::FilterSettingsStore;

/// Smoke-test driver for the session engine.
///
/// Spawns (or attaches to) a debug adapter, connects, pushes any requested
/// breakpoints, and idles until Ctrl-C.
#[derive(Debug, Parser)]
#[command(name = "tether-dap", version, about)]
struct Cli {
    /// Command line of the adapter to spawn, e.g. "python -m debugpy.adapter".
    #[arg(long)]
    adapter: Option<String>,

    /// Identity of the adapter definition; keys persisted preferences.
    #[arg(long, default_value = "default")]
    adapter_id: String,

    /// Port the adapter listens on. When absent and no trace pattern
    /// extracts one, the adapter's standard streams carry the protocol.
    #[arg(long)]
    port: Option<u16>,

    /// `launch` or `attach`.
    #[arg(long, default_value = "launch")]
    mode: String,

    /// Run instead of debug: sets the `noDebug` launch parameter.
    #[arg(long)]
    run: bool,

    /// Wait strategy selector: `timeout:N`, `trace:"text"` or `none`.
    #[arg(long, default_value = "none")]
    wait: String,

    /// Launch/attach parameters as a JSON object.
    #[arg(long)]
    params: Option<String>,

    /// Source breakpoints to install, as path:line pairs.
    #[arg(long = "breakpoint")]
    breakpoints: Vec<String>,

    /// Protocol message tracing: `off`, `messages` or `verbose`.
    #[arg(long, default_value = "off")]
    wire_trace: String,

    /// Path of the persisted-preferences file.
    #[arg(long)]
    settings: Option<PathBuf>,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mode = match cli.mode.as_str() {
        "launch" => DebugMode::Launch,
        "attach" => DebugMode::Attach,
        other => anyhow::bail!("unknown mode {other:?}: expected launch or attach"),
    };
    let trace = match cli.wire_trace.as_str() {
        "off" => ServerTrace::Off,
        "messages" => ServerTrace::Messages,
        "verbose" => ServerTrace::Verbose,
        other => anyhow::bail!("unknown wire trace level {other:?}"),
    };
    let mut config = AdapterConfig::new(cli.adapter_id.clone(), mode);
    config.debug = !cli.run;
    config.trace = trace;
    config.wait = WaitStrategy::parse(&cli.wait)?;
    if let Some(params) = &cli.params {
        config.parameters = serde_json::from_str(params).context("parsing --params")?;
    }

    let process = match &cli.adapter {
        Some(command_line) => {
            let mut parts = command_line.split_whitespace();
            let program = parts.next().context("empty --adapter command line")?;
            let mut command = tokio::process::Command::new(program);
            command.args(parts);
            // Socket transports watch the process output; stdio transports
            // hand stdout/stdin to the protocol.
            let process = if cli.port.is_some() || matches!(config.wait, WaitStrategy::Trace(_)) {
                AdapterProcess::spawn_piped(command)
            } else {
                AdapterProcess::spawn_stdio(command)
            }
            .context("spawning debug adapter")?;
            Some(Arc::new(process))
        }
        None => None,
    };

    let registry = ReadinessRegistry::new();
    let readiness = match &process {
        Some(process) => {
            let monitor = Arc::new(ReadinessMonitor::start(
                config.wait.clone(),
                ReadinessSurface::of_process(process, cli.port),
            ));
            registry.insert(process.key(), Arc::clone(&monitor));
            monitor
        }
        None => Arc::new(ReadinessMonitor::start(
            config.wait.clone(),
            ReadinessSurface::detached(cli.port),
        )),
    };

    let store = Arc::new(match cli.settings {
        Some(path) => FilterSettingsStore::open(path),
        None => FilterSettingsStore::in_memory(),
    });
    let breakpoints = Arc::new(BreakpointSynchronizer::new(Arc::new(
        DefaultBreakpointPolicy::new(tether_dap::config::accept_all_files()),
    )));
    let exceptions = Arc::new(ExceptionFilterRegistry::new(cli.adapter_id, store));

    for pair in &cli.breakpoints {
        let (path, line) = pair
            .rsplit_once(':')
            .context("breakpoint must be given as path:line")?;
        let line: u32 = line.parse().context("breakpoint line")?;
        let descriptor = Arc::new(tether_dap::breakpoints::BreakpointDescriptor::new(
            path, line,
        ));
        breakpoints.register(&descriptor).await;
    }

    let session = DebugSession::new(SessionParams {
        config,
        process: process.clone(),
        readiness,
        breakpoints,
        exceptions,
        byte_trace: None,
    });

    let cancel = CancellationToken::new();
    let connect_cancel = cancel.clone();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            connect_cancel.cancel();
            session.terminate().await;
            return Ok(());
        }
        connected = session.connect(cancel.clone()) => {
            connected.context("connecting to debug adapter")?;
        }
    }
    tracing::info!(capabilities = ?session.capabilities(), "connected");

    tokio::signal::ctrl_c().await.ok();
    session.terminate().await;

    if let Some(process) = &process {
        registry.remove(process.key());
    }
    Ok(())
}
