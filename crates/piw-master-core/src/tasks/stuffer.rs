//! QueueStuffer: pulls pending (package, version) pairs from the database
//! into the in-process builds queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use crate::channels::{BuildsTx, ShutdownRx};
use crate::db::MasterDb;

/// Delay between one pending-builds poll and the next, once the current
/// batch has been fully enqueued.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Run the QueueStuffer task until shutdown.
pub async fn run(
    db: Arc<dyn MasterDb>,
    builds_tx: BuildsTx,
    mut shutdown_rx: ShutdownRx,
) -> anyhow::Result<()> {
    loop {
        let pending = db.pending_builds().await?;
        for build in pending {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => return Ok(()),
                res = builds_tx.send(build) => {
                    if res.is_err() {
                        return Ok(());
                    }
                }
            }
        }
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => return Ok(()),
            _ = sleep(POLL_INTERVAL) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::fake::FakeDb;

    #[tokio::test]
    async fn enqueues_pending_builds() {
        let db = Arc::new(FakeDb::new());
        db.seed_pending("foo", "1.0");
        let (builds_tx, mut builds_rx) = tokio::sync::mpsc::channel(10);
        let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);

        let handle = tokio::spawn(run(db, builds_tx, shutdown_rx));
        let build = builds_rx.recv().await.unwrap();
        assert_eq!(build.package, "foo");
        assert_eq!(build.version, "1.0");

        let _ = shutdown_tx.send(());
        let _ = handle.await;
    }
}
