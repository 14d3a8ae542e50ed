//! Messages relayed from the master's internal status queue to the external
//! status publish socket.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One status event: either a worker's own reply echoed for observers
/// (`slave_id >= 0`), or a master-wide sample (`slave_id == -1`).
#[derive(Debug, Clone, PartialEq)]
pub struct StatusMessage {
    /// `-1` for master-wide samples, otherwise the reporting worker's id.
    pub slave_id: i64,
    /// Unix timestamp (seconds, fractional) of the observation.
    pub timestamp: f64,
    /// The tag, e.g. a worker reply tag or `"STATUS"`.
    pub tag: String,
    /// Tag-specific positional arguments.
    pub args: Vec<Value>,
}

impl StatusMessage {
    /// Build a status event carrying a single JSON argument.
    pub fn new(slave_id: i64, timestamp: f64, tag: impl Into<String>, args: Vec<Value>) -> Self {
        StatusMessage {
            slave_id,
            timestamp,
            tag: tag.into(),
            args,
        }
    }

    /// Encode to the wire array form `[slave_id, timestamp, tag, ...args]`.
    pub fn encode(&self) -> Value {
        let mut items = vec![
            Value::from(self.slave_id),
            Value::from(self.timestamp),
            Value::String(self.tag.clone()),
        ];
        items.extend(self.args.iter().cloned());
        Value::Array(items)
    }
}

/// The named counters BigBrother samples every period; carried as the sole
/// argument of a `StatusMessage` tagged `"STATUS"`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct MasterCounters {
    /// Number of known packages.
    pub packages_count: u64,
    /// Number of packages with at least one successful build.
    pub packages_built: u64,
    /// Number of known (package, version) pairs.
    pub versions_count: u64,
    /// Number of versions with at least one successful build.
    pub versions_built: u64,
    /// Total number of build attempts recorded.
    pub builds_count: u64,
    /// Build attempts in the last hour.
    pub builds_last_hour: u64,
    /// Successful build attempts.
    pub builds_success: u64,
    /// Total wall-clock seconds spent building.
    pub builds_time: f64,
    /// Total bytes of committed build artifacts.
    pub builds_size: u64,
    /// Free bytes on the output filesystem.
    pub disk_free: u64,
    /// Total bytes on the output filesystem.
    pub disk_size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_status_array_shape() {
        let msg = StatusMessage::new(-1, 1700000000.0, "STATUS", vec![serde_json::json!({})]);
        let v = msg.encode();
        let arr = v.as_array().unwrap();
        assert_eq!(arr.len(), 4);
        assert_eq!(arr[0], serde_json::json!(-1));
        assert_eq!(arr[2], serde_json::json!("STATUS"));
    }
}
