//! Worker protocol messages exchanged over the slave (build dispatch) socket.
//!
//! Each message is a JSON array whose first element is a string tag; the
//! remaining elements are positional arguments. This mirrors the wire format
//! exactly (no envelope object, no field names on the wire) so the encoding
//! matches what a non-Rust worker implementation already speaks.

use serde_json::Value;
use thiserror::Error;

/// Failure decoding or encoding a worker-protocol message.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The JSON value was not a non-empty array.
    #[error("worker message is not a non-empty JSON array")]
    NotAnArray,
    /// The first array element was not a string tag.
    #[error("worker message tag is not a string")]
    TagNotString,
    /// The tag was recognized but the argument list didn't match.
    #[error("worker message tag {0:?} has the wrong argument shape")]
    BadArguments(String),
    /// The tag was not recognized at all.
    #[error("unknown worker message tag {0:?}")]
    UnknownTag(String),
}

/// A message sent by a worker to the master on the slave socket.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerRequest {
    /// First contact from a previously-unseen transport address.
    Hello,
    /// The worker has no build in progress and is ready for one.
    Idle,
    /// The worker finished a build, successfully or not.
    Built {
        /// Whether the build succeeded.
        status: bool,
        /// Captured build log text.
        output: String,
        /// Artifact file name (empty on failure).
        filename: String,
        /// Artifact size in bytes (zero on failure).
        filesize: u64,
        /// Lowercase hex SHA-256 of the artifact (empty on failure).
        filehash: String,
        /// Wall-clock build duration in seconds.
        duration: f64,
        /// Package/version tag embedded in the wheel filename.
        package_version_tag: String,
        /// Python version tag (e.g. `cp311`).
        py_version_tag: String,
        /// ABI tag (e.g. `cp311`, `none`).
        abi_tag: String,
        /// Platform tag (e.g. `manylinux_2_17_x86_64`).
        platform_tag: String,
    },
    /// The worker finished uploading the artifact for the current build.
    Sent,
    /// The worker is disconnecting cleanly.
    Bye,
}

impl WorkerRequest {
    /// Decode a `WorkerRequest` from its wire JSON array form.
    pub fn decode(value: &Value) -> Result<Self, ProtocolError> {
        let items = value.as_array().ok_or(ProtocolError::NotAnArray)?;
        let (tag, args) = items.split_first().ok_or(ProtocolError::NotAnArray)?;
        let tag = tag.as_str().ok_or(ProtocolError::TagNotString)?;
        match tag {
            "HELLO" if args.is_empty() => Ok(WorkerRequest::Hello),
            "IDLE" if args.is_empty() => Ok(WorkerRequest::Idle),
            "BYE" if args.is_empty() => Ok(WorkerRequest::Bye),
            "SENT" if args.is_empty() => Ok(WorkerRequest::Sent),
            "BUILT" if args.len() == 10 => Ok(WorkerRequest::Built {
                status: args[0]
                    .as_bool()
                    .ok_or_else(|| ProtocolError::BadArguments(tag.to_string()))?,
                output: str_arg(&args[1], tag)?,
                filename: str_arg(&args[2], tag)?,
                filesize: args[3]
                    .as_u64()
                    .ok_or_else(|| ProtocolError::BadArguments(tag.to_string()))?,
                filehash: str_arg(&args[4], tag)?,
                duration: args[5]
                    .as_f64()
                    .ok_or_else(|| ProtocolError::BadArguments(tag.to_string()))?,
                package_version_tag: str_arg(&args[6], tag)?,
                py_version_tag: str_arg(&args[7], tag)?,
                abi_tag: str_arg(&args[8], tag)?,
                platform_tag: str_arg(&args[9], tag)?,
            }),
            "HELLO" | "IDLE" | "BYE" | "SENT" | "BUILT" => {
                Err(ProtocolError::BadArguments(tag.to_string()))
            }
            other => Err(ProtocolError::UnknownTag(other.to_string())),
        }
    }
}

/// A message sent by the master to a worker on the slave socket.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerReply {
    /// Assigns the worker its stable numeric identity.
    Hello {
        /// Monotonically increasing worker identifier.
        slave_id: u32,
    },
    /// No work is currently available (or the queue is paused).
    Sleep,
    /// Directs the worker to build a specific package/version.
    Build {
        /// Package name.
        package: String,
        /// Version string.
        version: String,
    },
    /// Directs the worker to begin (or resume) uploading its artifact.
    Send,
    /// The current build/transfer cycle is complete.
    Done,
    /// Directs the worker to disconnect; it will not be given more work.
    Bye,
}

impl WorkerReply {
    /// Encode this reply to its wire JSON array form.
    pub fn encode(&self) -> Value {
        match self {
            WorkerReply::Hello { slave_id } => Value::Array(vec![
                Value::String("HELLO".into()),
                Value::from(*slave_id),
            ]),
            WorkerReply::Sleep => Value::Array(vec![Value::String("SLEEP".into())]),
            WorkerReply::Build { package, version } => Value::Array(vec![
                Value::String("BUILD".into()),
                Value::String(package.clone()),
                Value::String(version.clone()),
            ]),
            WorkerReply::Send => Value::Array(vec![Value::String("SEND".into())]),
            WorkerReply::Done => Value::Array(vec![Value::String("DONE".into())]),
            WorkerReply::Bye => Value::Array(vec![Value::String("BYE".into())]),
        }
    }

    /// The wire tag for this reply, used for status reporting.
    pub fn tag(&self) -> &'static str {
        match self {
            WorkerReply::Hello { .. } => "HELLO",
            WorkerReply::Sleep => "SLEEP",
            WorkerReply::Build { .. } => "BUILD",
            WorkerReply::Send => "SEND",
            WorkerReply::Done => "DONE",
            WorkerReply::Bye => "BYE",
        }
    }
}

fn str_arg(value: &Value, tag: &str) -> Result<String, ProtocolError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| ProtocolError::BadArguments(tag.to_string()))
}
