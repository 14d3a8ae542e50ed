//! A [`MasterDb`] backed by PostgreSQL via `sqlx`.
//!
//! This adapter assumes a minimal schema (`packages`, `versions`, `builds`,
//! `files` tables keyed the obvious way); the schema itself is not a concern
//! of this crate, only the shape of queries issued against it.

use async_trait::async_trait;
use piw_protocol::status::MasterCounters;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use crate::db::{FileRecord, MasterDb, PendingBuild};
use crate::state::BuildState;

/// A [`MasterDb`] implementation backed by a `sqlx` Postgres connection pool.
pub struct PgMasterDb {
    pool: PgPool,
}

impl PgMasterDb {
    /// Connect to `dsn`, establishing a small connection pool.
    pub async fn connect(dsn: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(dsn)
            .await?;
        Ok(PgMasterDb { pool })
    }
}

#[async_trait]
impl MasterDb for PgMasterDb {
    async fn sync_packages(&self, packages: &[String]) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        for package in packages {
            sqlx::query(
                "INSERT INTO packages (name) VALUES ($1) ON CONFLICT (name) DO NOTHING",
            )
            .bind(package)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn sync_versions(&self, package: &str, versions: &[String]) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        for version in versions {
            sqlx::query(
                "INSERT INTO versions (package, version) VALUES ($1, $2) \
                 ON CONFLICT (package, version) DO NOTHING",
            )
            .bind(package)
            .bind(version)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn pending_builds(&self) -> anyhow::Result<Vec<PendingBuild>> {
        let rows = sqlx::query(
            "SELECT v.package, v.version FROM versions v \
             WHERE NOT EXISTS ( \
                 SELECT 1 FROM builds b \
                 WHERE b.package = v.package AND b.version = v.version AND b.status \
             ) \
             ORDER BY v.package, v.version",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| PendingBuild {
                package: row.get("package"),
                version: row.get("version"),
            })
            .collect())
    }

    async fn log_build(&self, build: &BuildState) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO builds \
             (slave_id, package, version, status, output, filename, filesize, filehash, \
              duration, package_version_tag, py_version_tag, abi_tag, platform_tag) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(build.slave_id as i64)
        .bind(&build.package)
        .bind(&build.version)
        .bind(build.status)
        .bind(&build.output)
        .bind(&build.filename)
        .bind(build.filesize as i64)
        .bind(&build.filehash)
        .bind(build.duration)
        .bind(&build.package_version_tag)
        .bind(&build.py_version_tag)
        .bind(&build.abi_tag)
        .bind(&build.platform_tag)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn package_files(&self, package: &str) -> anyhow::Result<Vec<FileRecord>> {
        let rows = sqlx::query(
            "SELECT filename, filehash FROM builds \
             WHERE package = $1 AND status ORDER BY filename",
        )
        .bind(package)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| FileRecord {
                filename: row.get("filename"),
                filehash: row.get("filehash"),
            })
            .collect())
    }

    async fn counters(&self) -> anyhow::Result<MasterCounters> {
        let row = sqlx::query(
            "SELECT \
                (SELECT count(*) FROM packages) AS packages_count, \
                (SELECT count(DISTINCT package) FROM builds WHERE status) AS packages_built, \
                (SELECT count(*) FROM versions) AS versions_count, \
                (SELECT count(*) FROM builds WHERE status) AS versions_built, \
                (SELECT count(*) FROM builds) AS builds_count, \
                (SELECT count(*) FROM builds WHERE created_at > now() - interval '1 hour') \
                    AS builds_last_hour, \
                (SELECT count(*) FROM builds WHERE status) AS builds_success, \
                (SELECT coalesce(sum(duration), 0) FROM builds) AS builds_time, \
                (SELECT coalesce(sum(filesize), 0) FROM builds WHERE status) AS builds_size",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(MasterCounters {
            packages_count: row.get::<i64, _>("packages_count") as u64,
            packages_built: row.get::<i64, _>("packages_built") as u64,
            versions_count: row.get::<i64, _>("versions_count") as u64,
            versions_built: row.get::<i64, _>("versions_built") as u64,
            builds_count: row.get::<i64, _>("builds_count") as u64,
            builds_last_hour: row.get::<i64, _>("builds_last_hour") as u64,
            builds_success: row.get::<i64, _>("builds_success") as u64,
            builds_time: row.get::<f64, _>("builds_time"),
            builds_size: row.get::<i64, _>("builds_size") as u64,
            disk_free: 0,
            disk_size: 0,
        })
    }
}
