//! PackageScraper: polls the upstream index and refreshes the package and
//! version tables.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use crate::channels::ShutdownRx;
use crate::db::MasterDb;
use crate::pypi::PypiIndex;

/// Delay between one full package/version refresh pass and the next.
const REFRESH_INTERVAL: Duration = Duration::from_secs(60);
/// Delay between packages while paused or between individual version
/// refreshes, so a pause is noticed promptly and quit latency stays bounded.
const STEP_INTERVAL: Duration = Duration::from_secs(1);

/// Run the PackageScraper task until shutdown.
pub async fn run(
    db: Arc<dyn MasterDb>,
    pypi: Arc<dyn PypiIndex>,
    paused: Arc<AtomicBool>,
    mut shutdown_rx: ShutdownRx,
) -> anyhow::Result<()> {
    loop {
        let packages = match pypi.list_packages().await {
            Ok(p) => p,
            Err(err) => {
                tracing::error!(%err, "failed to list packages from upstream index");
                Vec::new()
            }
        };
        if !packages.is_empty() {
            db.sync_packages(&packages).await?;
        }

        for package in &packages {
            if shutdown_rx.try_recv().is_ok() {
                return Ok(());
            }
            while paused.load(Ordering::Relaxed) {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => return Ok(()),
                    _ = sleep(STEP_INTERVAL) => {}
                }
            }
            match pypi.package_releases(package).await {
                Ok(versions) => {
                    if let Err(err) = db.sync_versions(package, &versions).await {
                        tracing::error!(%err, package, "failed to persist versions");
                    }
                }
                Err(err) => tracing::error!(%err, package, "failed to fetch releases"),
            }
        }

        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => return Ok(()),
            _ = sleep(REFRESH_INTERVAL) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::fake::FakeDb;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakePypi {
        packages: Vec<String>,
        releases: Mutex<std::collections::BTreeMap<String, Vec<String>>>,
    }

    #[async_trait]
    impl PypiIndex for FakePypi {
        async fn list_packages(&self) -> anyhow::Result<Vec<String>> {
            Ok(self.packages.clone())
        }
        async fn package_releases(&self, package: &str) -> anyhow::Result<Vec<String>> {
            Ok(self
                .releases
                .lock()
                .unwrap()
                .get(package)
                .cloned()
                .unwrap_or_default())
        }
    }

    #[tokio::test]
    async fn one_pass_syncs_packages_and_versions() {
        let db = Arc::new(FakeDb::new());
        let mut releases = std::collections::BTreeMap::new();
        releases.insert("foo".to_string(), vec!["1.0".to_string()]);
        let pypi = Arc::new(FakePypi {
            packages: vec!["foo".to_string()],
            releases: Mutex::new(releases),
        });
        let paused = Arc::new(AtomicBool::new(false));
        let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);

        let handle = tokio::spawn(run(db.clone(), pypi, paused, shutdown_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = shutdown_tx.send(());
        let _ = handle.await;

        let pending = db.pending_builds().await.unwrap();
        assert_eq!(
            pending,
            vec![crate::db::PendingBuild {
                package: "foo".into(),
                version: "1.0".into(),
            }]
        );
    }
}
