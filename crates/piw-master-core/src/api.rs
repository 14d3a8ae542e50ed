//! Public configuration and handle types for the master.

use std::path::PathBuf;
use std::sync::Arc;

use reqwest::Url;

use crate::db::MasterDb;
use crate::pypi::PypiIndex;

/// Configuration for one master instance.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Root URL of the upstream package index PackageScraper polls.
    pub pypi_root: Url,
    /// Postgres connection string.
    pub dsn: String,
    /// Root of the output (served) wheel tree.
    pub output: PathBuf,
    /// Bind address for the worker (build dispatch) socket.
    pub worker_bind: String,
    /// Bind address for the file (artifact transfer) socket.
    pub file_bind: String,
    /// Bind address for the control socket.
    pub control_bind: String,
    /// Bind address for the external status publish socket.
    pub status_bind: String,
}

impl MasterConfig {
    /// Default worker socket bind address.
    pub const DEFAULT_WORKER_BIND: &'static str = "tcp://*:5555";
    /// Default file socket bind address.
    pub const DEFAULT_FILE_BIND: &'static str = "tcp://*:5556";
    /// Default control socket bind address.
    pub const DEFAULT_CONTROL_BIND: &'static str = "ipc:///tmp/piw-control";
    /// Default status socket bind address.
    pub const DEFAULT_STATUS_BIND: &'static str = "ipc:///tmp/piw-status";
}

/// Handle to a running master instance.
pub struct MasterHandle {
    pub(crate) shutdown_tx: crate::channels::ShutdownTx,
    pub(crate) join: tokio::task::JoinHandle<anyhow::Result<()>>,
}

/// Start a master instance: spawns the supervisor, which in turn spawns the
/// six cooperating tasks.
pub fn start_master(
    config: MasterConfig,
    db: Arc<dyn MasterDb>,
    pypi: Arc<dyn PypiIndex>,
) -> MasterHandle {
    crate::supervisor::start(config, db, pypi)
}

impl MasterHandle {
    /// Request an orderly shutdown (equivalent to the `QUIT` control
    /// command), without needing the control socket.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// A cheap, cloneable callback equivalent to [`Self::request_shutdown`],
    /// for handing to a signal handler that outlives a borrow of `self`.
    pub fn shutdown_requester(&self) -> impl Fn() + Send + Sync + 'static {
        let shutdown_tx = self.shutdown_tx.clone();
        move || {
            let _ = shutdown_tx.send(());
        }
    }

    /// Wait for the master to finish shutting down.
    pub async fn wait(self) -> anyhow::Result<()> {
        match self.join.await {
            Ok(res) => res,
            Err(err) => Err(anyhow::anyhow!("supervisor task join error: {err}")),
        }
    }
}
