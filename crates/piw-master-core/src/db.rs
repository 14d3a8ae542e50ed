//! The database boundary: a narrow set of named queries the rest of the
//! master needs, kept deliberately small so the concrete schema is not a
//! concern of this crate.

use async_trait::async_trait;
use piw_protocol::status::MasterCounters;

use crate::state::BuildState;

/// A (package, version) pair still awaiting a successful build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingBuild {
    /// Package name.
    pub package: String,
    /// Version string.
    pub version: String,
}

/// One committed build artifact, as listed in a package index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// File name on disk, relative to the package directory.
    pub filename: String,
    /// Lowercase hex SHA-256 of the file contents.
    pub filehash: String,
}

/// The set of database operations the master's tasks need.
///
/// Implementors only need to make these operations observably correct; the
/// concrete schema, migrations, and connection pooling are this trait's
/// business, not its callers'.
#[async_trait]
pub trait MasterDb: Send + Sync {
    /// Replace the known package list with `packages`, adding any new ones.
    async fn sync_packages(&self, packages: &[String]) -> anyhow::Result<()>;

    /// Replace the known version list for `package` with `versions`.
    async fn sync_versions(&self, package: &str, versions: &[String]) -> anyhow::Result<()>;

    /// All (package, version) pairs that have never had a successful build.
    async fn pending_builds(&self) -> anyhow::Result<Vec<PendingBuild>>;

    /// Persist the outcome of a build attempt.
    async fn log_build(&self, build: &BuildState) -> anyhow::Result<()>;

    /// Every successfully built artifact currently on record for `package`.
    async fn package_files(&self, package: &str) -> anyhow::Result<Vec<FileRecord>>;

    /// The counters BigBrother publishes on its periodic sample.
    async fn counters(&self) -> anyhow::Result<MasterCounters>;
}

/// An in-memory [`MasterDb`] used by task-level tests.
#[cfg(test)]
pub mod fake {
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Mutex;

    use super::*;

    /// A `MasterDb` backed by in-process maps, for deterministic tests.
    #[derive(Default)]
    pub struct FakeDb {
        inner: Mutex<FakeDbInner>,
    }

    #[derive(Default)]
    struct FakeDbInner {
        packages: BTreeSet<String>,
        versions: BTreeMap<String, BTreeSet<String>>,
        built_versions: BTreeSet<(String, String)>,
        files: BTreeMap<String, Vec<FileRecord>>,
        builds_logged: u64,
        builds_succeeded: u64,
    }

    impl FakeDb {
        /// Construct an empty fake database.
        pub fn new() -> Self {
            Self::default()
        }

        /// Seed a pending (package, version) pair directly, bypassing
        /// `sync_packages`/`sync_versions`.
        pub fn seed_pending(&self, package: &str, version: &str) {
            let mut inner = self.inner.lock().expect("fake db lock");
            inner.packages.insert(package.to_string());
            inner
                .versions
                .entry(package.to_string())
                .or_default()
                .insert(version.to_string());
        }
    }

    #[async_trait]
    impl MasterDb for FakeDb {
        async fn sync_packages(&self, packages: &[String]) -> anyhow::Result<()> {
            let mut inner = self.inner.lock().expect("fake db lock");
            inner.packages.extend(packages.iter().cloned());
            Ok(())
        }

        async fn sync_versions(&self, package: &str, versions: &[String]) -> anyhow::Result<()> {
            let mut inner = self.inner.lock().expect("fake db lock");
            inner
                .versions
                .entry(package.to_string())
                .or_default()
                .extend(versions.iter().cloned());
            Ok(())
        }

        async fn pending_builds(&self) -> anyhow::Result<Vec<PendingBuild>> {
            let inner = self.inner.lock().expect("fake db lock");
            let mut out = Vec::new();
            for (package, versions) in &inner.versions {
                for version in versions {
                    let key = (package.clone(), version.clone());
                    if !inner.built_versions.contains(&key) {
                        out.push(PendingBuild {
                            package: package.clone(),
                            version: version.clone(),
                        });
                    }
                }
            }
            Ok(out)
        }

        async fn log_build(&self, build: &BuildState) -> anyhow::Result<()> {
            let mut inner = self.inner.lock().expect("fake db lock");
            inner.builds_logged += 1;
            if build.status {
                inner.builds_succeeded += 1;
                inner
                    .built_versions
                    .insert((build.package.clone(), build.version.clone()));
                inner
                    .files
                    .entry(build.package.clone())
                    .or_default()
                    .push(FileRecord {
                        filename: build.filename.clone(),
                        filehash: build.filehash.clone(),
                    });
            }
            Ok(())
        }

        async fn package_files(&self, package: &str) -> anyhow::Result<Vec<FileRecord>> {
            let inner = self.inner.lock().expect("fake db lock");
            Ok(inner.files.get(package).cloned().unwrap_or_default())
        }

        async fn counters(&self) -> anyhow::Result<MasterCounters> {
            let inner = self.inner.lock().expect("fake db lock");
            Ok(MasterCounters {
                packages_count: inner.packages.len() as u64,
                packages_built: inner.files.keys().count() as u64,
                versions_count: inner.versions.values().map(|v| v.len() as u64).sum(),
                versions_built: inner.built_versions.len() as u64,
                builds_count: inner.builds_logged,
                builds_last_hour: inner.builds_logged,
                builds_success: inner.builds_succeeded,
                builds_time: 0.0,
                builds_size: 0,
                disk_free: 0,
                disk_size: 0,
            })
        }
    }
}
