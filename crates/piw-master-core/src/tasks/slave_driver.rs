//! SlaveDriver: owns the worker protocol state machine and the sole
//! address -> [`SlaveState`] map.
//!
//! Hash verification and commit for a finished upload run here, not in
//! BuildCatcher, once both the worker's `SENT` and BuildCatcher's
//! [`TransferOutcome`] have been observed — the two can arrive in either
//! order, so neither event alone is enough to proceed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use piw_protocol::status::StatusMessage;
use piw_protocol::worker::{WorkerReply, WorkerRequest};
use zeromq::{RouterSocket, Socket, SocketRecv, SocketSend, ZmqMessage};

use crate::channels::{
    BuildsRx, HandoffTx, IndexesTx, KillRx, OutcomeRx, ShutdownRx, StatusTx, TransferHandoff,
    TransferOutcome,
};
use crate::db::{MasterDb, PendingBuild};
use crate::state::{BuildState, SlaveState, TransferState, WorkerStage};

const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Channels the SlaveDriver task is wired up with.
pub struct SlaveDriverChannels {
    /// Pending (package, version) pairs to hand out on `IDLE`.
    pub builds_rx: BuildsRx,
    /// Package names to publish once their index needs rewriting.
    pub indexes_tx: IndexesTx,
    /// Status events for the Supervisor to relay externally.
    pub status_tx: StatusTx,
    /// Outbound "begin transfer" notifications to BuildCatcher.
    pub handoff_tx: HandoffTx,
    /// Inbound "wire transfer complete" notifications from BuildCatcher.
    pub outcome_rx: OutcomeRx,
    /// Worker ids the Supervisor wants killed.
    pub kill_rx: KillRx,
    /// Shutdown broadcast receiver.
    pub shutdown_rx: ShutdownRx,
}

/// Tracks the SENT/[`TransferOutcome`] race for each in-flight upload.
/// Either message can arrive first; the worker is not dispatched to
/// (verify, reply) until both have been observed.
#[derive(Default)]
struct PendingVerifications {
    awaiting_outcome: HashMap<u32, Vec<u8>>,
    completed: HashMap<u32, (TransferState, BuildState)>,
}

impl PendingVerifications {
    /// Record that the worker's `SENT` arrived. Returns the completed
    /// transfer if BuildCatcher's outcome had already arrived.
    fn sent(&mut self, slave_id: u32, address: Vec<u8>) -> Option<(TransferState, BuildState)> {
        if let Some(entry) = self.completed.remove(&slave_id) {
            Some(entry)
        } else {
            self.awaiting_outcome.insert(slave_id, address);
            None
        }
    }

    /// Record that BuildCatcher's outcome arrived. Returns the address to
    /// reply to if the worker's `SENT` had already arrived.
    fn outcome(&mut self, outcome: TransferOutcome) -> Option<(Vec<u8>, BuildState, TransferState)> {
        if let Some(address) = self.awaiting_outcome.remove(&outcome.slave_id) {
            Some((address, outcome.build, outcome.transfer))
        } else {
            self.completed.insert(outcome.slave_id, (outcome.transfer, outcome.build));
            None
        }
    }

    /// Drop any bookkeeping for a worker that said `BYE` mid-transfer.
    fn forget(&mut self, slave_id: u32) {
        self.awaiting_outcome.remove(&slave_id);
        self.completed.remove(&slave_id);
    }
}

/// Outcome of a `spawn_blocking` hash-and-commit pass, fed back into the
/// main select loop so verification never blocks socket polling.
struct VerifyDone {
    slave_id: u32,
    address: Vec<u8>,
    build: BuildState,
    verified: bool,
    /// `Some` on mismatch (or commit failure) — the still-open transfer,
    /// ready to be reset and retried. `None` on success, since `commit`
    /// consumes it.
    transfer: Option<TransferState>,
}

fn spawn_verify(
    slave_id: u32,
    address: Vec<u8>,
    build: BuildState,
    transfer: TransferState,
    output_root: PathBuf,
    verify_tx: tokio::sync::mpsc::Sender<VerifyDone>,
) {
    tokio::task::spawn_blocking(move || {
        let matched = match transfer.verify(&build.filehash) {
            Ok(m) => m,
            Err(err) => {
                tracing::error!(%err, "failed to hash received transfer");
                false
            }
        };
        let done = if matched {
            match transfer.commit(&output_root, &build.package, &build.filename) {
                Ok(()) => VerifyDone { slave_id, address, build, verified: true, transfer: None },
                Err(err) => {
                    tracing::error!(%err, "failed to commit verified transfer");
                    VerifyDone { slave_id, address, build, verified: false, transfer: None }
                }
            }
        } else {
            VerifyDone { slave_id, address, build, verified: false, transfer: Some(transfer) }
        };
        let _ = verify_tx.blocking_send(done);
    });
}

/// Run the SlaveDriver task until shutdown. `draining` is set by the
/// Supervisor at the start of the shutdown sequence, before the quit
/// broadcast fires; every currently-known worker is marked terminated
/// within one `POLL_TIMEOUT` tick (rather than waiting for its next `IDLE`),
/// and every subsequent `IDLE` is answered with `BYE`.
pub async fn run(
    db: Arc<dyn MasterDb>,
    output_root: PathBuf,
    bind_addr: &str,
    paused: Arc<AtomicBool>,
    draining: Arc<AtomicBool>,
    mut channels: SlaveDriverChannels,
) -> anyhow::Result<()> {
    remove_stale_ipc_socket(bind_addr);
    let mut socket = RouterSocket::new();
    socket.bind(bind_addr).await?;

    let mut slaves: HashMap<Vec<u8>, SlaveState> = HashMap::new();
    let mut next_slave_id: u32 = 1;
    let mut verifications = PendingVerifications::default();
    let (verify_tx, mut verify_rx) = tokio::sync::mpsc::channel::<VerifyDone>(16);

    loop {
        if draining.load(Ordering::Relaxed) {
            for slave in slaves.values_mut() {
                slave.kill();
            }
        }

        tokio::select! {
            biased;
            _ = channels.shutdown_rx.recv() => break,
            Some(slave_id) = channels.kill_rx.recv() => {
                if let Some(slave) = slaves.values_mut().find(|s| s.slave_id() == slave_id) {
                    slave.kill();
                }
            }
            Some(outcome) = channels.outcome_rx.recv() => {
                if let Some((address, build, transfer)) = verifications.outcome(outcome) {
                    spawn_verify(build.slave_id, address, build, transfer, output_root.clone(), verify_tx.clone());
                }
            }
            Some(done) = verify_rx.recv() => {
                if let Some(slave) = slaves.get_mut(&done.address) {
                    let reply = if done.verified {
                        let _ = channels.indexes_tx.send(done.build.package.clone()).await;
                        slave.clear_build();
                        WorkerReply::Done
                    } else if let Some(mut transfer) = done.transfer {
                        if let Err(err) = transfer.reset() {
                            tracing::error!(%err, "failed to reset transfer for retry");
                        }
                        let _ = channels
                            .handoff_tx
                            .send(TransferHandoff::Retry {
                                slave_id: done.slave_id,
                                build: done.build,
                                transfer,
                            })
                            .await;
                        WorkerReply::Send
                    } else {
                        // commit failed after a successful hash match; nothing left
                        // to retry with (the temp file is gone), so end the cycle.
                        slave.clear_build();
                        WorkerReply::Done
                    };
                    send_reply(&mut socket, &done.address, &reply).await?;
                    publish_status(&channels.status_tx, slave, &reply);
                }
            }
            recv = tokio::time::timeout(POLL_TIMEOUT, socket.recv()) => {
                let Ok(recv) = recv else { continue };
                let multipart = recv?;
                let frames: Vec<Vec<u8>> =
                    multipart.into_vec().into_iter().map(|b| b.to_vec()).collect();
                let Some((address, rest)) = frames.split_first() else {
                    continue;
                };
                let address = address.clone();
                let Some(payload) = rest.first() else {
                    tracing::warn!("worker message had no payload frame");
                    continue;
                };
                let value: serde_json::Value = match serde_json::from_slice(payload) {
                    Ok(v) => v,
                    Err(err) => {
                        tracing::error!(%err, "malformed worker message JSON");
                        continue;
                    }
                };
                let request = match WorkerRequest::decode(&value) {
                    Ok(r) => r,
                    Err(err) => {
                        tracing::error!(%err, "malformed worker message");
                        continue;
                    }
                };

                let now = Utc::now();
                if !slaves.contains_key(&address) {
                    if !matches!(request, WorkerRequest::Hello) {
                        tracing::warn!("first message from unknown address was not HELLO");
                        continue;
                    }
                    let slave_id = next_slave_id;
                    next_slave_id += 1;
                    slaves.insert(address.clone(), SlaveState::new(slave_id, now));
                    let reply = WorkerReply::Hello { slave_id };
                    send_reply(&mut socket, &address, &reply).await?;
                    let slave = slaves.get(&address).expect("just inserted");
                    publish_status(&channels.status_tx, slave, &reply);
                    continue;
                }

                let slave = slaves.get_mut(&address).expect("checked above");
                slave.touch(now);
                let slave_id = slave.slave_id();

                let mut remove_after = false;
                let reply = match (slave.stage(), request) {
                    (_, WorkerRequest::Bye) => {
                        remove_after = true;
                        None
                    }
                    (WorkerStage::Idle, WorkerRequest::Idle) => {
                        Some(handle_idle(slave, &paused, &mut channels.builds_rx))
                    }
                    (WorkerStage::Building, WorkerRequest::Built {
                        status,
                        output,
                        filename,
                        filesize,
                        filehash,
                        duration,
                        package_version_tag,
                        py_version_tag,
                        abi_tag,
                        platform_tag,
                    }) => {
                        let build = slave
                            .finish_build(
                                status,
                                output,
                                filename,
                                filesize,
                                filehash,
                                duration,
                                package_version_tag,
                                py_version_tag,
                                abi_tag,
                                platform_tag,
                            )
                            .clone();
                        db.log_build(&build).await?;
                        if build.status {
                            let _ = channels
                                .handoff_tx
                                .send(TransferHandoff::New { slave_id: slave.slave_id(), build })
                                .await;
                            Some(WorkerReply::Send)
                        } else {
                            slave.clear_build();
                            Some(WorkerReply::Done)
                        }
                    }
                    (WorkerStage::Sending, WorkerRequest::Sent) => {
                        if let Some((transfer, build)) = verifications.sent(slave_id, address.clone()) {
                            spawn_verify(slave_id, address.clone(), build, transfer, output_root.clone(), verify_tx.clone());
                        }
                        None
                    }
                    (stage, other) => {
                        tracing::warn!(?stage, ?other, "invalid worker message for current stage");
                        None
                    }
                };

                if remove_after {
                    verifications.forget(slave_id);
                    slaves.remove(&address);
                    continue;
                }
                let Some(reply) = reply else { continue };
                send_reply(&mut socket, &address, &reply).await?;
                let slave = slaves.get(&address).expect("checked above");
                publish_status(&channels.status_tx, slave, &reply);
                if matches!(reply, WorkerReply::Bye) {
                    slaves.remove(&address);
                }
            }
        }
    }

    Ok(())
}

fn handle_idle(slave: &mut SlaveState, paused: &AtomicBool, builds_rx: &mut BuildsRx) -> WorkerReply {
    if slave.terminated() {
        slave.mark_dead();
        return WorkerReply::Bye;
    }
    if paused.load(Ordering::Relaxed) {
        return WorkerReply::Sleep;
    }
    match builds_rx.try_recv() {
        Ok(PendingBuild { package, version }) => {
            slave.start_build(package.clone(), version.clone());
            WorkerReply::Build { package, version }
        }
        Err(_) => WorkerReply::Sleep,
    }
}

fn remove_stale_ipc_socket(bind_addr: &str) {
    if let Some(path) = bind_addr.strip_prefix("ipc://") {
        let path = Path::new(path);
        if path.exists() {
            let _ = std::fs::remove_file(path);
        }
    }
}

async fn send_reply(
    socket: &mut RouterSocket,
    address: &[u8],
    reply: &WorkerReply,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(&reply.encode())?;
    let mut multipart = ZmqMessage::from(address.to_vec());
    multipart.push_back(body.into());
    socket.send(multipart).await?;
    Ok(())
}

fn publish_status(status_tx: &StatusTx, slave: &SlaveState, reply: &WorkerReply) {
    let msg = StatusMessage::new(
        slave.slave_id() as i64,
        slave.last_seen().timestamp() as f64,
        reply.tag(),
        Vec::new(),
    );
    let _ = status_tx.try_send(msg);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::fake::FakeDb;

    fn sample_build(filesize: u64, filehash: &str) -> BuildState {
        BuildState {
            slave_id: 1,
            package: "foo".into(),
            version: "1.0".into(),
            status: true,
            output: String::new(),
            filename: "foo-1.0.whl".into(),
            filesize,
            filehash: filehash.into(),
            duration: 1.0,
            package_version_tag: "1.0".into(),
            py_version_tag: "py3".into(),
            abi_tag: "none".into(),
            platform_tag: "any".into(),
        }
    }

    #[test]
    fn sent_before_outcome_waits_then_fires_on_outcome() {
        let mut v = PendingVerifications::default();
        assert!(v.sent(1, b"addr".to_vec()).is_none());

        let dir = tempfile::tempdir().unwrap();
        let transfer = TransferState::new(10, dir.path()).unwrap();
        let outcome = TransferOutcome { slave_id: 1, build: sample_build(10, "hash"), transfer };
        let ready = v.outcome(outcome);
        assert!(ready.is_some());
        let (address, build, _transfer) = ready.unwrap();
        assert_eq!(address, b"addr".to_vec());
        assert_eq!(build.package, "foo");
    }

    #[test]
    fn outcome_before_sent_waits_then_fires_on_sent() {
        let mut v = PendingVerifications::default();
        let dir = tempfile::tempdir().unwrap();
        let transfer = TransferState::new(10, dir.path()).unwrap();
        let outcome = TransferOutcome { slave_id: 2, build: sample_build(10, "hash"), transfer };
        assert!(v.outcome(outcome).is_none());

        let ready = v.sent(2, b"addr2".to_vec());
        assert!(ready.is_some());
        let (_transfer, build) = ready.unwrap();
        assert_eq!(build.package, "foo");
    }

    #[test]
    fn unrelated_slave_is_unaffected_by_another_slaves_sent() {
        let mut v = PendingVerifications::default();
        assert!(v.sent(3, b"addr3".to_vec()).is_none());
        assert!(!v.completed.contains_key(&4));
        assert!(!v.awaiting_outcome.contains_key(&4));
    }

    #[test]
    fn forget_clears_both_sides_of_the_race() {
        let mut v = PendingVerifications::default();
        v.sent(5, b"addr5".to_vec());
        v.forget(5);
        assert!(v.awaiting_outcome.get(&5).is_none());

        let dir = tempfile::tempdir().unwrap();
        let transfer = TransferState::new(10, dir.path()).unwrap();
        v.outcome(TransferOutcome { slave_id: 6, build: sample_build(10, "hash"), transfer });
        v.forget(6);
        assert!(v.completed.get(&6).is_none());
    }

    #[tokio::test]
    async fn idle_with_no_queue_replies_sleep() {
        let mut slave = SlaveState::new(1, Utc::now());
        let (_tx, mut rx) = tokio::sync::mpsc::channel(1);
        let paused = AtomicBool::new(false);
        let reply = handle_idle(&mut slave, &paused, &mut rx);
        assert_eq!(reply, WorkerReply::Sleep);
    }

    #[tokio::test]
    async fn idle_pops_queued_build() {
        let mut slave = SlaveState::new(1, Utc::now());
        let (tx, mut rx) = tokio::sync::mpsc::channel(1);
        tx.send(PendingBuild {
            package: "foo".into(),
            version: "1.0".into(),
        })
        .await
        .unwrap();
        let paused = AtomicBool::new(false);
        let reply = handle_idle(&mut slave, &paused, &mut rx);
        assert_eq!(
            reply,
            WorkerReply::Build {
                package: "foo".into(),
                version: "1.0".into(),
            }
        );
        assert_eq!(slave.stage(), WorkerStage::Building);
    }

    #[tokio::test]
    async fn paused_overrides_queued_build() {
        let mut slave = SlaveState::new(1, Utc::now());
        let (tx, mut rx) = tokio::sync::mpsc::channel(1);
        tx.send(PendingBuild {
            package: "foo".into(),
            version: "1.0".into(),
        })
        .await
        .unwrap();
        let paused = AtomicBool::new(true);
        let reply = handle_idle(&mut slave, &paused, &mut rx);
        assert_eq!(reply, WorkerReply::Sleep);
    }

    #[tokio::test]
    async fn terminated_worker_gets_bye() {
        let mut slave = SlaveState::new(1, Utc::now());
        slave.kill();
        let (_tx, mut rx) = tokio::sync::mpsc::channel(1);
        let paused = AtomicBool::new(false);
        let reply = handle_idle(&mut slave, &paused, &mut rx);
        assert_eq!(reply, WorkerReply::Bye);
    }

    #[tokio::test]
    async fn finish_build_pairs_dispatched_package_version() {
        let db = Arc::new(FakeDb::new());
        let mut slave = SlaveState::new(1, Utc::now());
        slave.start_build("foo".into(), "1.0".into());
        let build = slave
            .finish_build(
                true,
                "ok".into(),
                "foo-1.0.whl".into(),
                10,
                "hash".into(),
                1.0,
                "1.0".into(),
                "py3".into(),
                "none".into(),
                "any".into(),
            )
            .clone();
        assert_eq!(build.package, "foo");
        assert_eq!(build.version, "1.0");
        db.log_build(&build).await.unwrap();
    }

    #[tokio::test]
    async fn verify_then_commit_via_spawn_verify_reports_success() {
        use sha2::{Digest, Sha256};
        let dir = tempfile::tempdir().unwrap();
        let data = b"artifact bytes".to_vec();
        let hash = hex::encode(Sha256::digest(&data));
        let mut transfer = TransferState::new(data.len() as u64, dir.path()).unwrap();
        transfer.chunk(0, &data).unwrap();
        let build = sample_build(data.len() as u64, &hash);

        let (verify_tx, mut verify_rx) = tokio::sync::mpsc::channel(1);
        spawn_verify(1, b"addr".to_vec(), build, transfer, dir.path().to_path_buf(), verify_tx);
        let done = verify_rx.recv().await.unwrap();
        assert!(done.verified);
        assert!(done.transfer.is_none());
        assert!(dir.path().join("foo/foo-1.0.whl").exists());
    }

    #[tokio::test]
    async fn verify_mismatch_via_spawn_verify_keeps_transfer_for_retry() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"artifact bytes".to_vec();
        let mut transfer = TransferState::new(data.len() as u64, dir.path()).unwrap();
        transfer.chunk(0, &data).unwrap();
        let build = sample_build(data.len() as u64, "0000deadbeef");

        let (verify_tx, mut verify_rx) = tokio::sync::mpsc::channel(1);
        spawn_verify(1, b"addr".to_vec(), build, transfer, dir.path().to_path_buf(), verify_tx);
        let done = verify_rx.recv().await.unwrap();
        assert!(!done.verified);
        assert!(done.transfer.is_some());
        assert!(!dir.path().join("foo/foo-1.0.whl").exists());
    }
}
