//! Commands accepted on the local control socket.

use serde_json::Value;
use thiserror::Error;

/// Failure decoding a control command.
#[derive(Debug, Error)]
pub enum ControlProtocolError {
    /// The JSON value was not a non-empty array.
    #[error("control message is not a non-empty JSON array")]
    NotAnArray,
    /// The first array element was not a string tag.
    #[error("control message tag is not a string")]
    TagNotString,
    /// `KILL` requires exactly one integer argument.
    #[error("KILL requires a single integer slave_id argument")]
    BadKillArgument,
    /// The tag was not recognized.
    #[error("unknown control command {0:?}")]
    UnknownTag(String),
}

/// An administrative command delivered over the control socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Begin an orderly shutdown of the whole process.
    Quit,
    /// Mark a single worker for removal once it next goes idle.
    Kill {
        /// The target worker's `slave_id`.
        slave_id: u32,
    },
    /// Stop handing out new builds until `Resume`.
    Pause,
    /// Resume handing out new builds.
    Resume,
}

impl ControlCommand {
    /// Decode a command from its wire JSON array form.
    pub fn decode(value: &Value) -> Result<Self, ControlProtocolError> {
        let items = value.as_array().ok_or(ControlProtocolError::NotAnArray)?;
        let (tag, args) = items
            .split_first()
            .ok_or(ControlProtocolError::NotAnArray)?;
        let tag = tag.as_str().ok_or(ControlProtocolError::TagNotString)?;
        match tag {
            "QUIT" => Ok(ControlCommand::Quit),
            "PAUSE" => Ok(ControlCommand::Pause),
            "RESUME" => Ok(ControlCommand::Resume),
            "KILL" => {
                let slave_id = args
                    .first()
                    .and_then(Value::as_u64)
                    .ok_or(ControlProtocolError::BadKillArgument)? as u32;
                Ok(ControlCommand::Kill { slave_id })
            }
            other => Err(ControlProtocolError::UnknownTag(other.to_string())),
        }
    }
}
