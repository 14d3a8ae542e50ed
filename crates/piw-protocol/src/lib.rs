#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Wire protocol and range bookkeeping shared between the `piwheels` master
//! tasks and, eventually, any slave-side tooling speaking the same wire.

pub mod control;
pub mod ranges;
pub mod status;
pub mod transfer;
pub mod worker;

pub use control::ControlCommand;
pub use ranges::{exclude, intersect};
pub use status::StatusMessage;
pub use transfer::{TransferFrame, TransferReply};
pub use worker::{WorkerReply, WorkerRequest};
