//! Reconciles the configured `(streams, sources)` against the live
//! streamer fleet: which streamers exist, which are activated, and which
//! are routed to a physical output.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::allocator::SlotAllocator;
use crate::config::Config;
use crate::error::{HearthampError, HearthampResult};
use crate::runtime::TaskSpawner;
use crate::state::{Source, Stream, StreamInfo};
use crate::streamer::{self, Streamer};

struct LiveStream {
    streamer: Arc<dyn Streamer>,
    slot: Option<usize>,
    phys_src: Option<u32>,
    active: bool,
}

/// Owns the virtual-slot pool and the live streamer fleet, and reconciles
/// both against the controller's committed state on every call to
/// [`StreamManager::sync`]. Reconciliation itself is not reentrant-safe: the
/// controller is expected to serialize calls to `sync`.
pub struct StreamManager {
    live: Mutex<HashMap<u32, LiveStream>>,
    allocator: SlotAllocator,
    config_dir: PathBuf,
    daemon_config: Arc<Config>,
    spawner: Arc<dyn TaskSpawner>,
    /// Physical output channels the bridge may route to, derived from the
    /// hardware profile's `total_sources`. The loopback bridge falls back to
    /// channel 0 for anything outside this set.
    physical_channels: Vec<u32>,
}

impl StreamManager {
    /// `total_sources` comes from the detected [`Profile`](crate::hardware::Profile)
    /// and fixes the physical channel set (`0..total_sources`) the loopback
    /// bridge may route to.
    pub fn new(config_dir: impl Into<PathBuf>, daemon_config: Arc<Config>, spawner: Arc<dyn TaskSpawner>, total_sources: u32) -> Self {
        let slot_count = daemon_config.virtual_slot_count;
        Self {
            live: Mutex::new(HashMap::new()),
            allocator: SlotAllocator::new(slot_count),
            config_dir: config_dir.into(),
            daemon_config,
            spawner,
            physical_channels: (0..total_sources).collect(),
        }
    }

    /// Parses `stream=<id>` source inputs into `stream id -> routed source id`.
    fn stream_to_phys_src(sources: &[Source]) -> HashMap<u32, u32> {
        let mut map = HashMap::new();
        for source in sources {
            if let Some(rest) = source.input.strip_prefix("stream=") {
                if let Ok(stream_id) = rest.parse::<u32>() {
                    map.insert(stream_id, source.id);
                }
            }
        }
        map
    }

    /// Reconciles the live fleet against `streams`/`sources`.
    pub async fn sync(&self, streams: &[Stream], sources: &[Source]) {
        let stream_to_phys_src = Self::stream_to_phys_src(sources);
        let desired_ids: HashSet<u32> = streams.iter().map(|s| s.id).collect();

        self.remove_undesired(&desired_ids).await;
        self.activate_new(streams).await;
        self.reconcile_routing(&stream_to_phys_src).await;
    }

    async fn remove_undesired(&self, desired_ids: &HashSet<u32>) {
        let dropped: Vec<u32> = {
            let live = self.live.lock();
            live.keys().filter(|id| !desired_ids.contains(id)).copied().collect()
        };

        for id in dropped {
            let entry = self.live.lock().remove(&id);
            if let Some(entry) = entry {
                if entry.phys_src.is_some() {
                    let _ = entry.streamer.disconnect().await;
                }
                if entry.active {
                    let _ = entry.streamer.deactivate().await;
                }
                if let Some(slot) = entry.slot {
                    self.allocator.free(slot);
                }
            }
        }
    }

    async fn activate_new(&self, streams: &[Stream]) {
        for stream in streams {
            if self.live.lock().contains_key(&stream.id) {
                continue;
            }

            let Some(built) = streamer::build(&stream.kind, &stream.config, Arc::clone(&self.daemon_config), Arc::clone(&self.spawner)) else {
                log::error!("[StreamManager] unknown stream type '{}' for stream {}", stream.kind, stream.id);
                continue;
            };
            let built: Arc<dyn Streamer> = Arc::from(built);

            let persistent = built.is_persistent();
            let mut slot = None;
            let mut active = false;

            if persistent {
                match self.activate_streamer(&built).await {
                    Ok(s) => {
                        slot = s;
                        active = true;
                    }
                    Err(err) => {
                        log::error!("[StreamManager] failed to activate stream {}: {}", stream.id, err);
                    }
                }
            }

            self.live.lock().insert(stream.id, LiveStream { streamer: built, slot, phys_src: None, active });
        }
    }

    /// Allocates a slot (unless the streamer is a passthrough, which needs
    /// none) and activates it. On failure, frees the slot it just allocated.
    async fn activate_streamer(&self, streamer: &Arc<dyn Streamer>) -> HearthampResult<Option<usize>> {
        let slot = if streamer::is_passthrough(streamer.stream_type()) { None } else { self.allocator.alloc() };
        let vsrc = slot.unwrap_or(0);

        if let Err(err) = streamer.activate(vsrc, &self.config_dir).await {
            if let Some(s) = slot {
                self.allocator.free(s);
            }
            return Err(err);
        }

        Ok(slot)
    }

    fn streamer_handle(&self, id: u32) -> Option<Arc<dyn Streamer>> {
        self.live.lock().get(&id).map(|e| Arc::clone(&e.streamer))
    }

    async fn reconcile_routing(&self, stream_to_phys_src: &HashMap<u32, u32>) {
        let ids: Vec<u32> = self.live.lock().keys().copied().collect();
        for id in ids {
            let desired = stream_to_phys_src.get(&id).copied();
            let (current, was_active) = match self.live.lock().get(&id) {
                Some(entry) => (entry.phys_src, entry.active),
                None => continue,
            };

            match desired {
                Some(phys_src) if Some(phys_src) != current => {
                    self.route(id, phys_src, current.is_some(), was_active).await;
                }
                None if current.is_some() => {
                    self.unroute(id, was_active).await;
                }
                _ => {}
            }
        }
    }

    async fn route(&self, id: u32, phys_src: u32, had_route: bool, was_active: bool) {
        if had_route {
            self.disconnect_stream(id).await;
        }

        if !was_active {
            if let Err(err) = self.ensure_active(id).await {
                log::error!("[StreamManager] failed to activate stream {} on demand: {}", id, err);
                return;
            }
        }

        let Some(streamer) = self.streamer_handle(id) else { return };
        match streamer.connect(phys_src, &self.physical_channels).await {
            Ok(()) => {
                if let Some(entry) = self.live.lock().get_mut(&id) {
                    entry.phys_src = Some(phys_src);
                }
            }
            Err(err) => log::error!("[StreamManager] failed to connect stream {} to {}: {}", id, phys_src, err),
        }
    }

    async fn unroute(&self, id: u32, was_active: bool) {
        self.disconnect_stream(id).await;
        if was_active {
            let is_persistent = self.streamer_handle(id).map(|s| s.is_persistent()).unwrap_or(true);
            if !is_persistent {
                self.deactivate_and_free(id).await;
            }
        }
    }

    async fn disconnect_stream(&self, id: u32) {
        if let Some(streamer) = self.streamer_handle(id) {
            let _ = streamer.disconnect().await;
        }
        if let Some(entry) = self.live.lock().get_mut(&id) {
            entry.phys_src = None;
        }
    }

    async fn ensure_active(&self, id: u32) -> HearthampResult<()> {
        let already_active = self.live.lock().get(&id).map(|e| e.active).unwrap_or(false);
        if already_active {
            return Ok(());
        }

        let streamer = self.streamer_handle(id).ok_or_else(|| HearthampError::NotFound(format!("stream {}", id)))?;
        let slot = self.activate_streamer(&streamer).await?;
        if let Some(entry) = self.live.lock().get_mut(&id) {
            entry.slot = slot;
            entry.active = true;
        }
        Ok(())
    }

    async fn deactivate_and_free(&self, id: u32) {
        if let Some(streamer) = self.streamer_handle(id) {
            let _ = streamer.deactivate().await;
        }
        if let Some(entry) = self.live.lock().get_mut(&id) {
            entry.active = false;
            if let Some(slot) = entry.slot.take() {
                self.allocator.free(slot);
            }
        }
    }

    /// Sends a type-specific command to a live stream.
    pub async fn send_cmd(&self, id: u32, cmd: &str) -> HearthampResult<()> {
        let streamer = self.streamer_handle(id).ok_or_else(|| HearthampError::NotFound(format!("stream {}", id)))?;
        streamer.send_cmd(cmd).await
    }

    /// Current metadata snapshot for a live stream, if any.
    pub fn info(&self, id: u32) -> Option<StreamInfo> {
        self.live.lock().get(&id).map(|e| e.streamer.info())
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Disconnects and deactivates every live streamer.
    pub async fn shutdown(&self) {
        let ids: Vec<u32> = self.live.lock().keys().copied().collect();
        for id in ids {
            self.disconnect_stream(id).await;
            self.deactivate_and_free(id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::TokioSpawner;
    use std::collections::HashMap as Map;

    fn rca_stream(id: u32) -> Stream {
        Stream { id, name: "RCA".into(), kind: "rca".into(), info: StreamInfo::default(), config: Map::new(), disabled: None, browsable: None }
    }

    fn source_routed_to(id: u32, stream_id: u32) -> Source {
        Source { id, name: "Src".into(), input: format!("stream={}", stream_id) }
    }

    fn manager() -> (StreamManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mgr = StreamManager::new(dir.path(), Arc::new(Config::default()), Arc::new(TokioSpawner::current()), 4);
        (mgr, dir)
    }

    #[tokio::test]
    async fn sync_activates_and_connects_passthrough_stream() {
        let (mgr, _dir) = manager();
        let streams = vec![rca_stream(996)];
        let sources = vec![source_routed_to(0, 996)];
        mgr.sync(&streams, &sources).await;
        assert_eq!(mgr.info(996).unwrap().state, "playing");
    }

    #[tokio::test]
    async fn sync_removes_dropped_stream() {
        let (mgr, _dir) = manager();
        let streams = vec![rca_stream(996)];
        mgr.sync(&streams, &[]).await;
        assert!(mgr.info(996).is_some());
        mgr.sync(&[], &[]).await;
        assert!(mgr.info(996).is_none());
    }

    #[tokio::test]
    async fn sync_unroutes_when_source_input_cleared() {
        let (mgr, _dir) = manager();
        let streams = vec![rca_stream(996)];
        let sources = vec![source_routed_to(0, 996)];
        mgr.sync(&streams, &sources).await;
        assert_eq!(mgr.info(996).unwrap().state, "playing");

        let cleared = vec![Source { id: 0, name: "Src".into(), input: String::new() }];
        mgr.sync(&streams, &cleared).await;
        assert!(mgr.info(996).is_some());
    }

    #[tokio::test]
    async fn unknown_stream_type_is_skipped_without_panic() {
        let (mgr, _dir) = manager();
        let streams = vec![Stream { id: 1000, name: "X".into(), kind: "not_a_type".into(), info: StreamInfo::default(), config: Map::new(), disabled: None, browsable: None }];
        mgr.sync(&streams, &[]).await;
        assert!(mgr.info(1000).is_none());
    }

    #[tokio::test]
    async fn activating_same_stream_twice_is_idempotent() {
        let (mgr, _dir) = manager();
        let streams = vec![rca_stream(996)];
        mgr.sync(&streams, &[]).await;
        mgr.sync(&streams, &[]).await;
        assert!(mgr.info(996).is_some());
    }
}
