use std::{env, sync::Arc};

use anyhow::{Context, Result, bail};
use plugin_sdk::{
    CredentialStore, ProcessSpawner, ProcessSpec, Supervisor, WorkerRuntime, WorkerSlot,
    init_tracing,
};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::{
    builder::PlatformContextBuilder,
    config::HostConfig,
    service::{WorkerService, bind_shared},
};

/// Run the master: spawn the pool, relay state, respawn the dead.
///
/// Returns when Ctrl-C is received, or with an error if a worker sent a
/// malformed coordination message.
pub async fn run_master(config: HostConfig) -> Result<()> {
    let (log_level, _guard) = init_tracing(
        config.log_level,
        config.log_dir.as_deref(),
        "plugin-host-master.log",
    )?;

    let exe = env::current_exe().context("could not locate own executable")?;
    let spec = ProcessSpec::new(exe).args(config.worker_args()).arg("worker");
    let supervisor_config = config.supervisor();
    info!(
        workers = supervisor_config.workers,
        sync_on_spawn = supervisor_config.sync_on_spawn,
        addr = %config.listen_addr(),
        "plugin host master starting"
    );

    let (supervisor, mut pool) =
        Supervisor::start(supervisor_config, ProcessSpawner::new(spec), log_level).await;

    tokio::select! {
        finished = &mut pool => {
            finished.context("supervisor task panicked")??;
            bail!("supervisor stopped unexpectedly");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, stopping workers");
            supervisor.shutdown().await;
        }
    }

    pool.await.context("supervisor task panicked")??;
    info!("plugin host stopped");
    Ok(())
}

/// Run one worker. Stdin/stdout are the coordination channel to the master;
/// the control surface listens on the shared port.
pub async fn run_worker(config: HostConfig, slot: WorkerSlot) -> Result<()> {
    let (log_level, _guard) = init_tracing(
        config.log_level,
        config.log_dir.as_deref(),
        &format!("plugin-host-worker-{slot}.log"),
    )?;

    let (runtime, link) = WorkerRuntime::run_stdio(CredentialStore::new(), log_level);
    let builder = PlatformContextBuilder::new(&config.platform_url, config.platform_timeout())?;
    let service = Arc::new(WorkerService::new(runtime, builder, config.context_ttl()));
    let _sweeper = service.cache().spawn_sweeper(config.context_ttl());

    let addr = config.listen_addr();
    let listener = bind_shared(addr).with_context(|| format!("could not bind {addr}"))?;
    info!(slot, pid = std::process::id(), %addr, "worker listening");

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let mut server = tokio::spawn(Arc::clone(&service).serve(listener, async move {
        let _ = stop_rx.await;
    }));

    let outcome: Result<()> = tokio::select! {
        linked = link => match linked {
            Ok(Ok(())) => {
                info!(slot, "master closed the channel, exiting");
                Ok(())
            }
            Ok(Err(err)) => {
                error!(slot, error = %err, "coordination failure");
                Err(err.into())
            }
            Err(join) => Err(anyhow::Error::new(join).context("coordination task panicked")),
        },
        served = &mut server => {
            return match served {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(anyhow::Error::new(err).context("control surface failed")),
                Err(join) => Err(anyhow::Error::new(join).context("control surface task panicked")),
            };
        }
        _ = tokio::signal::ctrl_c() => {
            info!(slot, "interrupted");
            Ok(())
        }
    };

    let _ = stop_tx.send(());
    if let Ok(Err(err)) = server.await {
        warn!(slot, error = %err, "control surface failed");
    }
    outcome
}
