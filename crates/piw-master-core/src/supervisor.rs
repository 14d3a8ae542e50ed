//! Supervisor: spawns the six cooperating tasks, relays internal status to
//! the external publish socket, processes control commands, and orchestrates
//! shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use piw_protocol::control::ControlCommand;
use tokio::task::JoinSet;
use zeromq::{PubSocket, PullSocket, Socket, SocketRecv, SocketSend, ZmqMessage};

use crate::api::{MasterConfig, MasterHandle};
use crate::channels::{self, ShutdownTx, TransferHandoff, TransferOutcome};
use crate::db::MasterDb;
use crate::pypi::PypiIndex;
use crate::tasks::{bigbrother, build_catcher, index_scribbler, scraper, slave_driver, stuffer};

/// Grace window given to workers to notice shutdown has begun before the
/// quit broadcast fires.
const WORKER_DRAIN_WINDOW: Duration = Duration::from_secs(5);
/// Hard deadline for the final task-join phase; a task wedged in a blocking
/// call cannot be forcibly killed, so the process exits non-zero instead of
/// hanging forever.
const JOIN_DEADLINE: Duration = Duration::from_secs(10);

/// Spawn the supervisor task, which in turn spawns the six cooperating
/// tasks, and return a handle to it.
pub fn start(config: MasterConfig, db: Arc<dyn MasterDb>, pypi: Arc<dyn PypiIndex>) -> MasterHandle {
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let join = tokio::spawn(run(config, db, pypi, shutdown_tx.clone()));
    MasterHandle { shutdown_tx, join }
}

async fn run(
    config: MasterConfig,
    db: Arc<dyn MasterDb>,
    pypi: Arc<dyn PypiIndex>,
    shutdown_tx: ShutdownTx,
) -> anyhow::Result<()> {
    let paused = Arc::new(AtomicBool::new(false));
    let draining = Arc::new(AtomicBool::new(false));

    let (builds_tx, builds_rx) = tokio::sync::mpsc::channel(channels::BUILDS_CAPACITY);
    let (indexes_tx, indexes_rx) = tokio::sync::mpsc::channel(channels::INDEXES_CAPACITY);
    let (status_tx, mut status_rx) = tokio::sync::mpsc::channel(channels::STATUS_CAPACITY);
    let (handoff_tx, handoff_rx) = tokio::sync::mpsc::channel::<TransferHandoff>(channels::TRANSFER_CAPACITY);
    let (outcome_tx, outcome_rx) = tokio::sync::mpsc::channel::<TransferOutcome>(channels::TRANSFER_CAPACITY);
    let (kill_tx, kill_rx) = tokio::sync::mpsc::channel(1);

    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

    tasks.spawn(scraper::run(
        db.clone(),
        pypi.clone(),
        paused.clone(),
        shutdown_tx.subscribe(),
    ));
    tasks.spawn(stuffer::run(db.clone(), builds_tx, shutdown_tx.subscribe()));
    tasks.spawn(bigbrother::run(
        db.clone(),
        config.output.clone(),
        status_tx.clone(),
        shutdown_tx.subscribe(),
    ));
    tasks.spawn(index_scribbler::run(
        db.clone(),
        config.output.clone(),
        indexes_rx,
        shutdown_tx.subscribe(),
    ));

    let slave_driver_channels = slave_driver::SlaveDriverChannels {
        builds_rx,
        indexes_tx,
        status_tx: status_tx.clone(),
        handoff_tx,
        outcome_rx,
        kill_rx,
        shutdown_rx: shutdown_tx.subscribe(),
    };
    let worker_bind = config.worker_bind.clone();
    let slave_driver_db = db.clone();
    let slave_driver_output = config.output.clone();
    let slave_driver_paused = paused.clone();
    let slave_driver_draining = draining.clone();
    tasks.spawn(async move {
        slave_driver::run(
            slave_driver_db,
            slave_driver_output,
            &worker_bind,
            slave_driver_paused,
            slave_driver_draining,
            slave_driver_channels,
        )
        .await
    });

    let output = config.output.clone();
    let file_bind = config.file_bind.clone();
    let build_catcher_shutdown_rx = shutdown_tx.subscribe();
    tasks.spawn(async move {
        build_catcher::run(output, &file_bind, handoff_rx, outcome_tx, build_catcher_shutdown_rx).await
    });

    remove_stale_ipc_socket(&config.control_bind);
    let mut control_socket = PullSocket::new();
    control_socket.bind(&config.control_bind).await?;
    let mut status_socket = PubSocket::new();
    status_socket.bind(&config.status_bind).await?;

    let mut shutdown_rx = shutdown_tx.subscribe();

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break,
            Some(status) = status_rx.recv() => {
                let body = serde_json::to_vec(&status.encode())?;
                let _ = status_socket.send(ZmqMessage::from(body)).await;
            }
            recv = control_socket.recv() => {
                let multipart = recv?;
                let Some(frame) = multipart.into_vec().into_iter().next() else { continue };
                let value: serde_json::Value = match serde_json::from_slice(&frame) {
                    Ok(v) => v,
                    Err(err) => {
                        tracing::error!(%err, "malformed control message");
                        continue;
                    }
                };
                match ControlCommand::decode(&value) {
                    Ok(ControlCommand::Quit) => break,
                    Ok(ControlCommand::Kill { slave_id }) => {
                        let _ = kill_tx.send(slave_id).await;
                    }
                    Ok(ControlCommand::Pause) => {
                        paused.store(true, Ordering::Relaxed);
                    }
                    Ok(ControlCommand::Resume) => {
                        paused.store(false, Ordering::Relaxed);
                    }
                    Err(err) => tracing::error!(%err, "malformed control command"),
                }
            }
        }
    }

    draining.store(true, Ordering::Relaxed);
    tokio::time::sleep(WORKER_DRAIN_WINDOW).await;
    let _ = shutdown_tx.send(());

    let join_all = async {
        while let Some(res) = tasks.join_next().await {
            match res {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::error!(%err, "task exited with error"),
                Err(err) => tracing::error!(%err, "task panicked"),
            }
        }
    };
    if tokio::time::timeout(JOIN_DEADLINE, join_all).await.is_err() {
        tracing::error!("task join phase exceeded deadline, aborting remaining tasks");
        tasks.abort_all();
    }

    Ok(())
}

fn remove_stale_ipc_socket(bind_addr: &str) {
    if let Some(path) = bind_addr.strip_prefix("ipc://") {
        let path = std::path::Path::new(path);
        if path.exists() {
            let _ = std::fs::remove_file(path);
        }
    }
}
