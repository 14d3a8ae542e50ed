#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Orchestration core for the `piwheels` master: the six cooperating tasks,
//! their shared state and channel wiring, the database and upstream-index
//! trait boundaries, and the HTML index writer.

/// Public configuration and handle types for the master.
pub mod api;

pub mod channels;
pub mod db;
pub mod db_postgres;
pub mod html;
pub mod pypi;
pub mod state;
pub mod supervisor;
pub mod tasks;

pub use api::{MasterConfig, MasterHandle};
pub use db::MasterDb;
pub use pypi::PypiIndex;
