use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use piw_master_core::MasterHandle;

#[derive(Debug)]
pub struct ShutdownController {
    forced: AtomicU8,
}

impl ShutdownController {
    pub fn new() -> Self {
        Self {
            forced: AtomicU8::new(0),
        }
    }

    pub fn bump_forced(&self) -> u8 {
        self.forced.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// On the first Ctrl+C, request an orderly shutdown (equivalent to `QUIT` on
/// the control socket). On a second Ctrl+C, exit the process immediately
/// without waiting for the worker-drain window.
pub fn spawn_ctrl_c_handler(shutdown: Arc<ShutdownController>, handle_shutdown_tx: &MasterHandle) {
    let requester = handle_shutdown_tx.shutdown_requester();
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            let n = shutdown.bump_forced();
            if n == 1 {
                requester();
            } else {
                std::process::exit(130);
            }
        }
    });
}
