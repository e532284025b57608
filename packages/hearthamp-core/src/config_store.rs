//! Debounced, atomic persistence of the whole [`State`] tree to a single
//! JSON file, plus migration-on-load.
//!
//! Writes go to `<path>.tmp` then `rename` over the target so a reader
//! never observes a half-written file. Saves are debounced: repeated calls
//! within the debounce window collapse into one write of the latest state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{Duration, Instant};

use crate::error::HearthampResult;
use crate::state::{Source, State, Stream, StreamInfo, MIN_DB, MAX_DB};

const DEBOUNCE: Duration = Duration::from_millis(500);

/// Persists [`State`] to disk with a debounced, atomic writer, and loads it
/// back (running migration) on startup.
pub struct ConfigStore {
    path: PathBuf,
    pending: Arc<Mutex<Option<State>>>,
    notify: Arc<Notify>,
}

impl ConfigStore {
    /// Creates a store bound to `path` and spawns its debounce-writer task
    /// on `spawner`.
    pub fn new(path: impl Into<PathBuf>, spawner: &dyn crate::runtime::TaskSpawner) -> Self {
        let store = Self {
            path: path.into(),
            pending: Arc::new(Mutex::new(None)),
            notify: Arc::new(Notify::new()),
        };
        store.spawn_writer(spawner);
        store
    }

    fn spawn_writer(&self, spawner: &dyn crate::runtime::TaskSpawner) {
        let pending = Arc::clone(&self.pending);
        let notify = Arc::clone(&self.notify);
        let path = self.path.clone();
        spawner.spawn(Box::pin(async move {
            loop {
                notify.notified().await;
                tokio::time::sleep(DEBOUNCE).await;
                let next = pending.lock().take();
                if let Some(state) = next {
                    if let Err(err) = write_atomic(&path, &state) {
                        log::error!("[ConfigStore] failed to persist state: {}", err);
                    }
                }
            }
        }));
    }

    /// Loads state from disk, running migration. Returns a default state on
    /// a missing or unparsable file (logging a warning in the latter case).
    pub fn load(&self) -> State {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => match serde_json::from_str::<State>(&contents) {
                Ok(mut state) => {
                    migrate(&mut state);
                    state
                }
                Err(err) => {
                    log::warn!("[ConfigStore] failed to parse {}: {}, using defaults", self.path.display(), err);
                    State::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => State::default(),
            Err(err) => {
                log::warn!("[ConfigStore] failed to read {}: {}, using defaults", self.path.display(), err);
                State::default()
            }
        }
    }

    /// Schedules a debounced save of `state`. Cancels (replaces) any save
    /// already pending.
    pub fn save(&self, state: State) {
        *self.pending.lock() = Some(state);
        self.notify.notify_one();
    }

    /// Forces any pending write to happen now, bypassing the debounce.
    pub fn flush(&self) -> HearthampResult<()> {
        let next = self.pending.lock().take();
        if let Some(state) = next {
            write_atomic(&self.path, &state)?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_atomic(path: &Path, state: &State) -> HearthampResult<()> {
    let tmp = path.with_extension("tmp");
    let json = serde_json::to_string_pretty(state)?;
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Fills defaults for fields missing or out-of-range in a freshly loaded
/// state. Never destructive: user names/configs are always preserved.
fn migrate(state: &mut State) {
    while state.sources.len() < 4 {
        let id = state.sources.len() as u32;
        state.sources.push(Source { id, name: format!("Source {}", id + 1), input: String::new() });
    }

    for zone in &mut state.zones {
        if zone.vol_min == 0 && zone.vol_max == 0 {
            zone.vol_min = MIN_DB;
            zone.vol_max = MAX_DB;
        }
        zone.canonicalize();
    }

    ensure_builtin_streams(state);
    state.canonicalize();
}

fn ensure_builtin_streams(state: &mut State) {
    use crate::state::{STREAM_ID_AUX, STREAM_ID_RCA_BASE};

    if !state.streams.iter().any(|s| s.id == STREAM_ID_AUX) {
        state.streams.push(Stream {
            id: STREAM_ID_AUX,
            name: "Aux".to_string(),
            kind: "aux".to_string(),
            info: StreamInfo { state: "playing".into(), ..Default::default() },
            config: Default::default(),
            disabled: None,
            browsable: Some(false),
        });
    }

    for i in 0..4u32 {
        let id = STREAM_ID_RCA_BASE + i;
        if !state.streams.iter().any(|s| s.id == id) {
            state.streams.push(Stream {
                id,
                name: format!("RCA {}", i + 1),
                kind: "rca".to_string(),
                info: StreamInfo { state: "playing".into(), ..Default::default() },
                config: Default::default(),
                disabled: None,
                browsable: Some(false),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::TokioSpawner;
    use crate::state::Zone;

    #[tokio::test]
    async fn load_missing_file_returns_default_with_builtins_after_migrate() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("house.json"), &TokioSpawner::current());
        let mut state = store.load();
        migrate(&mut state);
        assert!(state.streams.iter().any(|s| s.kind == "aux"));
        assert_eq!(state.streams.iter().filter(|s| s.kind == "rca").count(), 4);
    }

    #[tokio::test]
    async fn flush_writes_file_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("house.json");
        let store = ConfigStore::new(&path, &TokioSpawner::current());
        let mut state = State::default();
        state.info.firmware_version = "1.0-deadbeef".into();
        store.save(state.clone());
        store.flush().unwrap();
        assert!(path.exists());
        let loaded: State = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.info.firmware_version, "1.0-deadbeef");
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn migrate_clamps_out_of_range_volume() {
        let mut state = State::default();
        state.zones.push(Zone { id: 0, name: "Z".into(), source_id: 0, mute: false, vol: 999, vol_f: 0.0, vol_min: -80, vol_max: 0, disabled: false });
        migrate(&mut state);
        assert_eq!(state.zones[0].vol, 0);
    }
}
