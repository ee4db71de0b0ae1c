// # cregd - container service registrator daemon
//
// Thin integration layer. It:
// 1. Reads configuration from environment variables (or CREG_CONFIG_FILE)
// 2. Initializes logging and the runtime
// 3. Registers sources and backends with the plugin registry
// 4. Wires sources -> multiplexer -> backends and runs until a signal
//
// All registration logic lives in creg-core.
//
// ## Example
//
// ```bash
// export CREG_ADDRESS=10.0.0.5
// export CREG_BACKENDS=consul,adguardhome
// export CREG_CONSUL_ADDRESS=http://127.0.0.1:8500
// export CREG_ADGUARD_ADDRESS=http://127.0.0.1:3000
// export CREG_ADGUARD_AUTH=admin:secret
// export CREG_ADGUARD_DOMAIN_SUFFIX=.home.lan
//
// cregd
// ```

mod config;

use anyhow::Result;
use config::DaemonConfig;
use creg_core::{
    Backend, ContainerInfo, Eligibility, EventMultiplexer, EventSource, PluginRegistry, StartupPlan,
};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Exit codes for different termination scenarios
///
/// These codes follow systemd conventions:
/// - 0: Clean shutdown
/// - 1: Configuration or startup error
/// - 2: Runtime error (a backend failed)
#[derive(Debug, Clone, Copy)]
enum CregExitCode {
    /// Clean shutdown (normal exit)
    CleanShutdown = 0,
    /// Configuration error or startup failure
    ConfigError = 1,
    /// Runtime error
    RuntimeError = 2,
}

impl From<CregExitCode> for ExitCode {
    fn from(code: CregExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Why the daemon stopped
enum Outcome {
    Clean,
    BackendsFailed(Vec<String>),
}

fn main() -> ExitCode {
    let config = match DaemonConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            return CregExitCode::ConfigError.into();
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {:#}", e);
        return CregExitCode::ConfigError.into();
    }

    let subscriber = FmtSubscriber::builder()
        .with_max_level(config.level())
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return CregExitCode::ConfigError.into();
    }

    info!(
        instance = %config.creg.instance_id,
        address = %config.creg.forward_address,
        sources = config.creg.sources.len(),
        backends = config.creg.backends.len(),
        "Starting cregd"
    );

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return CregExitCode::RuntimeError.into();
        }
    };

    let code = rt.block_on(async {
        match run_daemon(config).await {
            Ok(Outcome::Clean) => CregExitCode::CleanShutdown,
            Ok(Outcome::BackendsFailed(names)) => {
                error!(backends = ?names, "Exiting after backend failures");
                CregExitCode::RuntimeError
            }
            Err(e) => {
                error!("Startup error: {:#}", e);
                CregExitCode::ConfigError
            }
        }
    });

    code.into()
}

fn plugins() -> PluginRegistry {
    let registry = PluginRegistry::with_builtins();

    #[cfg(feature = "docker")]
    creg_source_docker::register(&registry);

    #[cfg(feature = "consul")]
    creg_backend_consul::register(&registry);

    #[cfg(feature = "etcd")]
    creg_backend_etcd::register(&registry);

    #[cfg(feature = "adguardhome")]
    creg_backend_adguardhome::register(&registry);

    info!(
        sources = ?registry.list_sources(),
        backends = ?registry.list_backends(),
        "Plugins registered"
    );
    registry
}

/// Run the daemon
///
/// Errors are startup failures; anything after wiring is reported through
/// the returned [`Outcome`].
async fn run_daemon(config: DaemonConfig) -> Result<Outcome> {
    let creg = config.creg;
    let registry = plugins();
    let eligibility = Eligibility::new(&creg.labels, creg.instance_id.clone());

    let mut sources = Vec::with_capacity(creg.sources.len());
    for source in &creg.sources {
        sources.push(registry.create_source(source, &eligibility)?);
    }

    let mut backends: Vec<Arc<dyn Backend>> = Vec::with_capacity(creg.backends.len());
    for backend in &creg.backends {
        backends.push(Arc::from(registry.create_backend(backend, &creg)?));
    }

    let mut snapshot: Vec<ContainerInfo> = Vec::new();
    if creg.engine.refresh_on_start {
        for source in &sources {
            match source.running().await {
                Ok(running) => snapshot.extend(running),
                Err(e) => warn!(source = %source.source_name(), error = %e, "Snapshot failed"),
            }
        }
        info!(containers = snapshot.len(), "Captured startup snapshot");
    }

    let shutdown = CancellationToken::new();
    let mut mux = EventMultiplexer::new(creg.labels.backends.clone(), creg.engine.output_buffer);

    let mut tasks = JoinSet::new();
    for backend in backends {
        let name = backend.name().to_string();
        let events = mux.new_output(name.clone());
        let plan = StartupPlan::routed(
            creg.engine.purge_on_start,
            &snapshot,
            &creg.labels.backends,
            &name,
        );
        let shutdown = shutdown.clone();

        tasks.spawn(async move {
            let result = backend.run(events, plan, shutdown).await;
            (name, result)
        });
    }

    for source in &sources {
        mux.add_input(source.source_name().to_string(), source.events(shutdown.clone()));
    }
    let mux = mux.run(shutdown.clone());

    let signal = wait_for_signal();
    tokio::pin!(signal);

    let mut failed = Vec::new();
    loop {
        tokio::select! {
            received = &mut signal => {
                match received {
                    Ok(name) => info!(signal = name, "Received shutdown signal"),
                    Err(e) => error!("Signal handling failed, shutting down: {:#}", e),
                }
                break;
            }
            joined = tasks.join_next() => match joined {
                Some(joined) => record(joined, &mut failed),
                None => {
                    warn!("All backends stopped");
                    break;
                }
            },
        }
    }

    shutdown.cancel();

    let grace = creg.engine.shutdown_timeout();
    let drained = tokio::time::timeout(grace, async {
        while let Some(joined) = tasks.join_next().await {
            record(joined, &mut failed);
        }
        mux.join().await
    })
    .await;

    match drained {
        Ok(delivered) => info!(delivered, "Shutdown complete"),
        Err(_) => {
            warn!(timeout = ?grace, "Backends did not stop in time, aborting");
            tasks.abort_all();
        }
    }

    if failed.is_empty() {
        Ok(Outcome::Clean)
    } else {
        Ok(Outcome::BackendsFailed(failed))
    }
}

fn record(
    joined: std::result::Result<(String, creg_core::Result<creg_core::RunSummary>), tokio::task::JoinError>,
    failed: &mut Vec<String>,
) {
    match joined {
        Ok((name, Ok(summary))) => {
            info!(backend = %name, events = summary.events_handled, "Backend finished")
        }
        Ok((name, Err(e))) => {
            error!(backend = %name, error = %e, "Backend failed");
            failed.push(name);
        }
        Err(e) => {
            error!(error = %e, "Backend task panicked");
            failed.push("<panicked>".to_string());
        }
    }
}

/// Wait for SIGTERM or SIGINT
#[cfg(unix)]
async fn wait_for_signal() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGINT handler: {}", e))?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

/// Wait for CTRL-C
///
/// Fallback implementation for non-Unix platforms.
#[cfg(not(unix))]
async fn wait_for_signal() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to wait for CTRL-C: {}", e))?;
    Ok("SIGINT")
}
