//! BuildCatcher: owns the file-transfer protocol and the sole
//! address -> [`TransferState`] map.
//!
//! BuildCatcher only drives the wire exchange (`HELLO`/`CHUNK`/`FETCH`/
//! `DONE`). Hashing and commit happen on SlaveDriver once it has also seen
//! the worker's `SENT` — see [`crate::channels::TransferOutcome`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use piw_protocol::transfer::{TransferFrame, TransferReply};
use zeromq::{RouterSocket, Socket, SocketRecv, SocketSend, ZmqMessage};

use crate::channels::{HandoffRx, OutcomeTx, ShutdownRx, TransferHandoff, TransferOutcome};
use crate::state::{BuildState, TransferState};

const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Run the BuildCatcher task until shutdown.
pub async fn run(
    output_root: PathBuf,
    bind_addr: &str,
    mut handoff_rx: HandoffRx,
    outcome_tx: OutcomeTx,
    mut shutdown_rx: ShutdownRx,
) -> anyhow::Result<()> {
    remove_stale_ipc_socket(bind_addr);
    let mut socket = RouterSocket::new();
    socket.bind(bind_addr).await?;

    // Transfers allocated by SlaveDriver but not yet claimed by a HELLO on
    // this socket, keyed by slave_id.
    let mut pending: HashMap<u32, (TransferState, BuildState)> = HashMap::new();
    // Transfers actively in flight, keyed by the worker's transport address
    // on *this* socket (which may differ from its address on the worker
    // socket).
    let mut active: HashMap<Vec<u8>, (u32, TransferState, BuildState)> = HashMap::new();

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break,
            Some(handoff) = handoff_rx.recv() => {
                match handoff {
                    TransferHandoff::New { slave_id, build } => {
                        match TransferState::new(build.filesize, &output_root) {
                            Ok(transfer) => {
                                pending.insert(slave_id, (transfer, build));
                            }
                            Err(err) => {
                                tracing::error!(%err, "failed to allocate transfer buffer");
                            }
                        }
                    }
                    TransferHandoff::Retry { slave_id, build, transfer } => {
                        pending.insert(slave_id, (transfer, build));
                    }
                }
            }
            recv = tokio::time::timeout(POLL_TIMEOUT, socket.recv()) => {
                let Ok(recv) = recv else { continue };
                let multipart = recv?;
                let frames: Vec<Vec<u8>> =
                    multipart.into_vec().into_iter().map(|b| b.to_vec()).collect();
                let Some((address, rest)) = frames.split_first() else { continue };
                let address = address.clone();

                let frame = match TransferFrame::decode(rest) {
                    Ok(f) => f,
                    Err(err) => {
                        if active.contains_key(&address) {
                            tracing::error!(%err, "invalid transfer frame");
                        } else {
                            tracing::debug!(%err, "ignoring frame for unknown transfer");
                        }
                        continue;
                    }
                };

                match frame {
                    TransferFrame::Hello { slave_id } => {
                        if let Some(entry) = active.get_mut(&address) {
                            entry.1.reset_credit();
                        } else if let Some((transfer, build)) = pending.remove(&slave_id) {
                            active.insert(address.clone(), (slave_id, transfer, build));
                        } else {
                            tracing::error!(slave_id, "HELLO for unknown or already-claimed transfer");
                            continue;
                        }
                    }
                    TransferFrame::Chunk { offset, bytes } => {
                        let Some((slave_id, transfer, _)) = active.get_mut(&address) else {
                            tracing::debug!("redundant CHUNK for unknown transfer");
                            continue;
                        };
                        if let Err(err) = transfer.chunk(offset, &bytes) {
                            tracing::error!(%err, "failed to write transfer chunk");
                            continue;
                        }
                        if transfer.done() {
                            send_reply(&mut socket, &address, &TransferReply::Done).await?;
                            let slave_id = *slave_id;
                            let (_, transfer, build) = active.remove(&address).unwrap();
                            if outcome_tx
                                .send(TransferOutcome { slave_id, build, transfer })
                                .await
                                .is_err()
                            {
                                tracing::error!("SlaveDriver outcome channel closed");
                            }
                            continue;
                        }
                    }
                }

                if let Some((_, transfer, _)) = active.get_mut(&address) {
                    while let Some(range) = transfer.fetch() {
                        let reply = TransferReply::Fetch {
                            offset: range.start,
                            length: range.end - range.start,
                        };
                        send_reply(&mut socket, &address, &reply).await?;
                    }
                }
            }
        }
    }

    Ok(())
}

fn remove_stale_ipc_socket(bind_addr: &str) {
    if let Some(path) = bind_addr.strip_prefix("ipc://") {
        let path = std::path::Path::new(path);
        if path.exists() {
            let _ = std::fs::remove_file(path);
        }
    }
}

async fn send_reply(
    socket: &mut RouterSocket,
    address: &[u8],
    reply: &TransferReply,
) -> anyhow::Result<()> {
    let mut multipart = ZmqMessage::from(address.to_vec());
    for frame in reply.encode() {
        multipart.push_back(frame.into());
    }
    socket.send(multipart).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[tokio::test]
    async fn new_handoff_allocates_pending_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let (handoff_tx, mut handoff_rx) = tokio::sync::mpsc::channel(1);
        handoff_tx
            .send(TransferHandoff::New { slave_id: 7, build: sample_build(10, "hash") })
            .await
            .unwrap();
        drop(handoff_tx);

        let handoff = handoff_rx.recv().await.unwrap();
        let mut pending: HashMap<u32, (TransferState, BuildState)> = HashMap::new();
        match handoff {
            TransferHandoff::New { slave_id, build } => {
                let transfer = TransferState::new(build.filesize, dir.path()).unwrap();
                pending.insert(slave_id, (transfer, build));
            }
            TransferHandoff::Retry { .. } => panic!("expected New"),
        }
        assert!(pending.contains_key(&7));
    }

    #[tokio::test]
    async fn retry_handoff_reuses_existing_transfer_without_new_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut transfer = TransferState::new(10, dir.path()).unwrap();
        transfer.chunk(0, b"0123456789").unwrap();
        assert!(transfer.done());
        transfer.reset().unwrap();
        assert!(!transfer.done());

        let (handoff_tx, mut handoff_rx) = tokio::sync::mpsc::channel(1);
        handoff_tx
            .send(TransferHandoff::Retry { slave_id: 3, build: sample_build(10, "hash"), transfer })
            .await
            .unwrap();
        drop(handoff_tx);

        let mut pending: HashMap<u32, (TransferState, BuildState)> = HashMap::new();
        match handoff_rx.recv().await.unwrap() {
            TransferHandoff::Retry { slave_id, build, transfer } => {
                pending.insert(slave_id, (transfer, build));
            }
            TransferHandoff::New { .. } => panic!("expected Retry"),
        }
        let (transfer, _) = pending.remove(&3).unwrap();
        assert!(!transfer.done());
    }
}
