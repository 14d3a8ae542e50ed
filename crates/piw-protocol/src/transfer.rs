//! File-transfer protocol messages exchanged over the build-catcher socket.
//!
//! Unlike the worker protocol these frames are binary, not JSON: integers are
//! carried as ASCII decimal text so the framing stays trivially debuggable on
//! the wire, and the artifact payload is never copied through a text codec.

use thiserror::Error;

/// Failure decoding a transfer-protocol frame set.
#[derive(Debug, Error)]
pub enum TransferProtocolError {
    /// No frames were received at all.
    #[error("transfer message has no frames")]
    Empty,
    /// The tag frame was not valid UTF-8.
    #[error("transfer message tag is not valid UTF-8")]
    BadTag,
    /// A numeric frame did not parse as ASCII decimal.
    #[error("transfer message field is not a valid integer")]
    BadInteger,
    /// The frame count didn't match what the tag requires.
    #[error("transfer message {0:?} has the wrong frame count")]
    BadArity(String),
    /// The tag was not recognized.
    #[error("unknown transfer message tag {0:?}")]
    UnknownTag(String),
}

/// A message sent by a worker to the master on the file socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferFrame {
    /// Announces (or re-announces) the sending worker's stable id.
    Hello {
        /// The worker's `slave_id`, as assigned on the worker socket.
        slave_id: u32,
    },
    /// Delivers `bytes` starting at `offset` in the artifact file.
    Chunk {
        /// Byte offset within the artifact.
        offset: u64,
        /// The bytes themselves.
        bytes: Vec<u8>,
    },
}

impl TransferFrame {
    /// Decode a frame set (`[tag, ...args]`, with the router's address frame
    /// already stripped) into a [`TransferFrame`].
    pub fn decode(frames: &[Vec<u8>]) -> Result<Self, TransferProtocolError> {
        let (tag, rest) = frames.split_first().ok_or(TransferProtocolError::Empty)?;
        let tag = std::str::from_utf8(tag).map_err(|_| TransferProtocolError::BadTag)?;
        match tag {
            "HELLO" => {
                let [slave_id] = rest else {
                    return Err(TransferProtocolError::BadArity(tag.to_string()));
                };
                let slave_id = ascii_to_u64(slave_id)? as u32;
                Ok(TransferFrame::Hello { slave_id })
            }
            "CHUNK" => {
                let [offset, bytes] = rest else {
                    return Err(TransferProtocolError::BadArity(tag.to_string()));
                };
                let offset = ascii_to_u64(offset)?;
                Ok(TransferFrame::Chunk {
                    offset,
                    bytes: bytes.clone(),
                })
            }
            other => Err(TransferProtocolError::UnknownTag(other.to_string())),
        }
    }
}

/// A message sent by the master to a worker on the file socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferReply {
    /// Requests `length` bytes starting at `offset`.
    Fetch {
        /// Byte offset within the artifact.
        offset: u64,
        /// Number of bytes requested.
        length: u64,
    },
    /// The transfer is complete and verified.
    Done,
}

impl TransferReply {
    /// Encode this reply as the frame list to send after the router address
    /// frame (and the empty delimiter frame, if the transport requires one).
    pub fn encode(&self) -> Vec<Vec<u8>> {
        match self {
            TransferReply::Fetch { offset, length } => vec![
                b"FETCH".to_vec(),
                offset.to_string().into_bytes(),
                length.to_string().into_bytes(),
            ],
            TransferReply::Done => vec![b"DONE".to_vec()],
        }
    }
}

fn ascii_to_u64(field: &[u8]) -> Result<u64, TransferProtocolError> {
    std::str::from_utf8(field)
        .map_err(|_| TransferProtocolError::BadInteger)?
        .parse::<u64>()
        .map_err(|_| TransferProtocolError::BadInteger)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_hello() {
        let frames = vec![b"HELLO".to_vec(), b"7".to_vec()];
        assert_eq!(
            TransferFrame::decode(&frames).unwrap(),
            TransferFrame::Hello { slave_id: 7 }
        );
    }

    #[test]
    fn decodes_chunk() {
        let frames = vec![b"CHUNK".to_vec(), b"65536".to_vec(), vec![1, 2, 3]];
        assert_eq!(
            TransferFrame::decode(&frames).unwrap(),
            TransferFrame::Chunk {
                offset: 65536,
                bytes: vec![1, 2, 3],
            }
        );
    }

    #[test]
    fn encodes_fetch() {
        let reply = TransferReply::Fetch {
            offset: 0,
            length: 65536,
        };
        assert_eq!(reply.encode(), vec![b"FETCH".to_vec(), b"0".to_vec(), b"65536".to_vec()]);
    }

    #[test]
    fn rejects_bad_tag() {
        let frames = vec![b"WAT".to_vec()];
        assert!(matches!(
            TransferFrame::decode(&frames),
            Err(TransferProtocolError::UnknownTag(_))
        ));
    }
}
