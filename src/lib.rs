use std::sync::Arc;

use error::ResultOkLogExt;
use runtime::RuntimeClient;
use tokio::sync::mpsc;
use tracer::{Event, EventType};

/// Sense Agent: attributes kernel events to the containers that produced them.
///
/// The agent loads a kernel-version specific instrumentation image, drains its
/// perf buffers, maps every event's pid to a container through the process's
/// cgroup and runtime metadata, and keeps per-container connection statistics
/// that are exposed over a small HTTP API.
pub mod api;
pub mod cgroup;
pub mod config;
pub mod conntrack;
pub mod error;
pub mod fsutil;
pub mod kubernetes;
pub mod proc;
pub mod registry;
pub mod runtime;
pub mod tracer;

/// Runs the agent until Ctrl-C.
///
/// # Errors
///
/// Possible errors include:
/// - Invalid configuration values in the environment.
/// - An unsupported architecture or kernel, or unavailable kernel tracing.
/// - Failure to detect the cgroup namespace prefix.
/// - Failure to start the perf reader threads.
pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = config::Config::from_env()?;
    log::debug!("Configuration: {:?}", config);

    let kernel_release = proc::kernel_release()?;
    log::info!("Kernel release: {}", kernel_release);

    let prefix = cgroup::CgroupPrefix::detect(&config.proc_root)?;
    log::debug!("Cgroup prefix: `{}`", prefix.as_str());
    let resolver = cgroup::CgroupResolver::new(&config.proc_root, prefix);

    let mut tracer_config = tracer::TracerConfig::new(&config.ebpf_dir);
    tracer_config.disable_l7 = config.disable_l7;
    let mut tracer = tracer::Tracer::new(&kernel_release, &tracer_config)?;

    let runtime = runtime::RuntimeClientProvider::detect(
        proc::host_root_path(&config.proc_root, &config.containerd_socket),
        proc::host_root_path(&config.proc_root, &config.docker_socket),
    )
    .await;
    if let Some(ids) = runtime.list_container_ids().await.ok_log_at(log::Level::Warn) {
        log::info!("{} reports {} containers", runtime.name(), ids.len());
    }

    let table = conntrack::ProcConntrack::new(&config.proc_root);
    let conntrack: Arc<dyn conntrack::Conntrack> = if table.is_available() {
        Arc::new(table)
    } else {
        log::warn!("Conntrack table unavailable, NAT destinations will not be resolved");
        Arc::new(conntrack::NoConntrack)
    };

    let (tx, rx) = mpsc::channel(config.event_buffer);
    for kind in EventType::ALL {
        tracer.subscribe(kind, tx.clone());
    }

    let registry = registry::Registry::new(resolver, runtime, conntrack, config.connection_ttl);
    let containers = registry.containers();
    let registry_task = tokio::spawn(registry.run(rx));

    // Processes that started before the agent only show up through this sweep.
    let proc_root = config.proc_root.clone();
    tokio::spawn(async move {
        let Some(pids) = proc::list_pids(&proc_root).ok_log() else {
            return;
        };
        log::debug!("Sweeping {} existing processes", pids.len());
        for pid in pids {
            if tx.send(Arc::new(Event::process_start(pid))).await.is_err() {
                break;
            }
        }
    });

    tracer.run()?;
    log::debug!("Started perf readers");

    let api = api::APIServer::new(containers);
    let api_listen = config.api_listen;
    let api_task = tokio::spawn(async move {
        api.listen(api_listen).await.ok_log();
    });

    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down");
    api_task.abort();

    tracer.close();
    // Dropping the tracer drops the last funnel senders, which ends the registry loop.
    drop(tracer);
    registry_task.await?;
    Ok(())
}
