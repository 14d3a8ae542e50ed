//! IndexScribbler: consumes package-publish notifications and rewrites the
//! affected HTML indexes atomically.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use crate::channels::{IndexesRx, ShutdownRx};
use crate::db::MasterDb;
use crate::html;

/// Run the IndexScribbler task until shutdown.
pub async fn run(
    db: Arc<dyn MasterDb>,
    output_root: PathBuf,
    mut indexes_rx: IndexesRx,
    mut shutdown_rx: ShutdownRx,
) -> anyhow::Result<()> {
    std::fs::create_dir_all(&output_root)?;
    let mut known: HashSet<String> = std::fs::read_dir(&output_root)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();

    loop {
        let package = tokio::select! {
            biased;
            _ = shutdown_rx.recv() => return Ok(()),
            msg = indexes_rx.recv() => match msg {
                Some(package) => package,
                None => return Ok(()),
            },
        };

        if known.insert(package.clone()) {
            let root_html = html::render_root(&sorted(&known));
            let root = output_root.clone();
            tokio::task::spawn_blocking(move || html::write_atomic(&root, "index.html", &root_html))
                .await??;
        }

        let files = db.package_files(&package).await?;
        let package_html = html::render_package(&package, &files);
        let package_dir = output_root.join(&package);
        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&package_dir)?;
            html::write_atomic(&package_dir, "index.html", &package_html)
        })
        .await??;
    }
}

fn sorted(known: &HashSet<String>) -> Vec<String> {
    let mut v: Vec<String> = known.iter().cloned().collect();
    v.sort();
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::fake::FakeDb;
    use crate::state::BuildState;

    fn sample_build(package: &str, filename: &str) -> BuildState {
        BuildState {
            slave_id: 1,
            package: package.into(),
            version: "1.0".into(),
            status: true,
            output: String::new(),
            filename: filename.into(),
            filesize: 10,
            filehash: "deadbeef".into(),
            duration: 1.0,
            package_version_tag: "1.0".into(),
            py_version_tag: "py3".into(),
            abi_tag: "none".into(),
            platform_tag: "any".into(),
        }
    }

    #[tokio::test]
    async fn writes_root_and_package_index_for_new_package() {
        let db = Arc::new(FakeDb::new());
        db.log_build(&sample_build("foo", "foo-1.0.whl")).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let (indexes_tx, indexes_rx) = tokio::sync::mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);

        let handle = tokio::spawn(run(db, dir.path().to_path_buf(), indexes_rx, shutdown_rx));
        indexes_tx.send("foo".to_string()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let _ = shutdown_tx.send(());
        drop(indexes_tx);
        let _ = handle.await;

        let root_html = std::fs::read_to_string(dir.path().join("index.html")).unwrap();
        assert!(root_html.contains("foo"));
        let package_html =
            std::fs::read_to_string(dir.path().join("foo/index.html")).unwrap();
        assert!(package_html.contains("foo-1.0.whl"));
    }
}
