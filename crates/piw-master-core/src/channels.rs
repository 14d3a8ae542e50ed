//! Typed internal channels wiring the six tasks together. Every channel here
//! is process-internal; the externally-reachable endpoints are ZeroMQ
//! sockets owned directly by the task that binds them.

use piw_protocol::status::StatusMessage;
use tokio::sync::{broadcast, mpsc};

use crate::db::PendingBuild;
use crate::state::{BuildState, TransferState};

/// Capacity of the builds queue (QueueStuffer -> SlaveDriver).
pub const BUILDS_CAPACITY: usize = 10;
/// Capacity of the indexes queue (SlaveDriver -> IndexScribbler).
pub const INDEXES_CAPACITY: usize = 10;
/// Capacity of the internal status queue (PackageScraper/BigBrother/SlaveDriver -> Supervisor).
pub const STATUS_CAPACITY: usize = 10;
/// Capacity of the transfer handoff/outcome channels between SlaveDriver and BuildCatcher.
pub const TRANSFER_CAPACITY: usize = 16;

/// Sending half of the builds queue.
pub type BuildsTx = mpsc::Sender<PendingBuild>;
/// Receiving half of the builds queue.
pub type BuildsRx = mpsc::Receiver<PendingBuild>;

/// Sending half of the indexes queue.
pub type IndexesTx = mpsc::Sender<String>;
/// Receiving half of the indexes queue.
pub type IndexesRx = mpsc::Receiver<String>;

/// Sending half of the internal status queue.
pub type StatusTx = mpsc::Sender<StatusMessage>;
/// Receiving half of the internal status queue.
pub type StatusRx = mpsc::Receiver<StatusMessage>;

/// Sending half of the shutdown broadcast.
pub type ShutdownTx = broadcast::Sender<()>;
/// Receiving half of the shutdown broadcast.
pub type ShutdownRx = broadcast::Receiver<()>;

/// "Begin transfer": SlaveDriver hands BuildCatcher the build whose artifact
/// is about to be uploaded, as soon as it replies `SEND`, and waits for the
/// worker to announce itself with a matching `HELLO` on the file socket.
pub enum TransferHandoff {
    /// A brand new upload: BuildCatcher allocates a fresh
    /// [`crate::state::TransferState`] (and temp file) for it.
    New {
        /// The worker that will perform the upload.
        slave_id: u32,
        /// The build whose artifact is being uploaded.
        build: BuildState,
    },
    /// A retry after a failed hash verification. `transfer` is the same
    /// object used on the first attempt, already [`TransferState::reset`] by
    /// SlaveDriver — no new temp file is allocated.
    Retry {
        /// The worker that will perform the upload.
        slave_id: u32,
        /// The build whose artifact is being uploaded.
        build: BuildState,
        /// The reset transfer state, reused across the retry.
        transfer: TransferState,
    },
}

/// "Wire transfer complete": BuildCatcher reports back once every byte of
/// the artifact has been received over the file socket. This does *not*
/// mean the artifact is verified — hashing and commit happen on SlaveDriver,
/// once it has also seen the worker's `SENT`, so the two can race in either
/// order.
pub struct TransferOutcome {
    /// The worker the transfer belonged to.
    pub slave_id: u32,
    /// The build whose artifact was uploaded.
    pub build: BuildState,
    /// The fully-received, not-yet-verified transfer state.
    pub transfer: TransferState,
}

/// Sending half of the handoff channel.
pub type HandoffTx = mpsc::Sender<TransferHandoff>;
/// Receiving half of the handoff channel.
pub type HandoffRx = mpsc::Receiver<TransferHandoff>;
/// Sending half of the outcome channel.
pub type OutcomeTx = mpsc::Sender<TransferOutcome>;
/// Receiving half of the outcome channel.
pub type OutcomeRx = mpsc::Receiver<TransferOutcome>;

/// Sending half of the KILL relay (Supervisor -> SlaveDriver).
pub type KillTx = mpsc::Sender<u32>;
/// Receiving half of the KILL relay (Supervisor -> SlaveDriver).
pub type KillRx = mpsc::Receiver<u32>;
