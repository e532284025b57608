//! The `Streamer` contract: one per-protocol lifecycle shell, driven by the
//! stream manager's reconcile loop.

mod passthrough;
mod process;

pub use passthrough::PassthroughStreamer;
pub use process::ProcessStreamer;

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::Config;
use crate::error::{HearthampError, HearthampResult};
use crate::runtime::TaskSpawner;
use crate::state::StreamInfo;
use std::path::Path;
use std::sync::Arc;

/// Per-protocol lifecycle shell. Each implementation owns its upstream
/// process (if any) and its loopback bridge (if routed); the stream
/// manager never reaches past this trait into implementation details.
#[async_trait]
pub trait Streamer: Send + Sync {
    /// Starts the upstream process (and any metadata poller), writing
    /// per-instance config under `config_dir`.
    async fn activate(&self, virtual_slot: usize, config_dir: &Path) -> HearthampResult<()>;

    /// Stops the upstream process and any metadata poller.
    async fn deactivate(&self) -> HearthampResult<()>;

    /// Starts a loopback bridge from this streamer's virtual slot to
    /// `phys_src`.
    async fn connect(&self, phys_src: u32, known_physical_channels: &[u32]) -> HearthampResult<()>;

    /// Stops the loopback bridge, if any.
    async fn disconnect(&self) -> HearthampResult<()>;

    /// Sends a type-specific command (`play`, `pause`, `station=42`, ...).
    async fn send_cmd(&self, cmd: &str) -> HearthampResult<()>;

    /// Current metadata snapshot.
    fn info(&self) -> StreamInfo;

    /// Whether the process must keep running even when unrouted.
    fn is_persistent(&self) -> bool;

    /// The stream type tag this streamer was built for.
    fn stream_type(&self) -> &'static str;
}

const PERSISTENT_TYPES: &[&str] = &["airplay", "spotify", "dlna", "lms", "bluetooth", "pandora", "internet_radio"];

/// Stream types that drive a hardware input directly and need no virtual
/// slot. Checked by the stream manager before it allocates one.
pub const PASSTHROUGH_TYPES: &[&str] = &["rca", "aux", "plexamp"];

/// Whether `stream_type` is a passthrough (no virtual slot required).
pub fn is_passthrough(stream_type: &str) -> bool {
    PASSTHROUGH_TYPES.contains(&stream_type)
}

/// Builds the `Streamer` implementation for a stream's configured type.
/// Returns `None` for an unrecognized type so callers can skip with a
/// log line rather than fail the whole reconcile pass.
pub fn build(
    stream_type: &str,
    config: &HashMap<String, Value>,
    daemon_config: Arc<Config>,
    spawner: Arc<dyn TaskSpawner>,
) -> Option<Box<dyn Streamer>> {
    if PASSTHROUGH_TYPES.contains(&stream_type) {
        return Some(Box::new(PassthroughStreamer::new(stream_type)));
    }

    let binary = process::binary_for_type(stream_type)?;
    let persistent = PERSISTENT_TYPES.contains(&stream_type);
    Some(Box::new(ProcessStreamer::new(
        stream_type,
        binary,
        config.clone(),
        persistent,
        daemon_config,
        spawner,
    )))
}

pub fn is_known_type(stream_type: &str) -> bool {
    PASSTHROUGH_TYPES.contains(&stream_type) || process::binary_for_type(stream_type).is_some()
}

pub(crate) fn missing_field(field: &str) -> HearthampError {
    HearthampError::BadRequest(format!("stream config missing required field '{}'", field))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_type_reports_not_known() {
        assert!(!is_known_type("not_a_real_type"));
    }

    #[test]
    fn passthrough_types_are_known() {
        for t in PASSTHROUGH_TYPES {
            assert!(is_known_type(t));
        }
    }
}
