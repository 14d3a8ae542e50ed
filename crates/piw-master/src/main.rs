mod cli;
mod shutdown;

use std::sync::Arc;

use clap::Parser;

use piw_master_core::{MasterConfig, MasterDb, PypiIndex};
use piw_master_core::db_postgres::PgMasterDb;
use piw_master_core::pypi::ReqwestPypiIndex;

use crate::cli::Cli;
use crate::shutdown::{ShutdownController, spawn_ctrl_c_handler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(cli.log_level.clone()))
        .init();

    let output = cli.expand_output();
    let config = MasterConfig {
        pypi_root: cli.pypi_root.clone(),
        dsn: cli.dsn.clone(),
        output,
        worker_bind: cli.worker_bind.clone(),
        file_bind: cli.file_bind.clone(),
        control_bind: cli.control_bind.clone(),
        status_bind: cli.status_bind.clone(),
    };

    let db: Arc<dyn MasterDb> = Arc::new(PgMasterDb::connect(&config.dsn).await?);
    let pypi: Arc<dyn PypiIndex> = Arc::new(ReqwestPypiIndex::new(config.pypi_root.clone()));

    tracing::info!(
        pypi_root = %config.pypi_root,
        output = %config.output.display(),
        worker_bind = %config.worker_bind,
        "starting piwheels master",
    );

    let handle = piw_master_core::api::start_master(config, db, pypi);

    let shutdown = Arc::new(ShutdownController::new());
    spawn_ctrl_c_handler(shutdown, &handle);

    handle.wait().await?;
    tracing::info!("piwheels master exited cleanly");
    Ok(())
}
