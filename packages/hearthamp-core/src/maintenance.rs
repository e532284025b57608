//! Periodic background workers: network reachability, release checks, and
//! config backups. Each runs its own `tokio::time::interval` loop behind a
//! shared shutdown token, reporting in to the [`Controller`] through its
//! public methods rather than touching state directly.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::config_store::ConfigStore;
use crate::controller::Controller;
use crate::runtime::TaskSpawner;

/// Looks up whether a newer release than `current_version` is available.
/// The actual download/apply of an update is out of scope; this is consulted
/// only to flip `Info.update_available`.
#[async_trait]
pub trait ReleaseChecker: Send + Sync {
    async fn newer_release_available(&self, current_version: &str) -> bool;
}

/// Receives the current persisted config bytes on each backup tick. Storage
/// target (local rotation, cloud upload, ...) is the implementation's concern.
#[async_trait]
pub trait BackupSink: Send + Sync {
    async fn backup(&self, config_json: &[u8]);
}

/// `ReleaseChecker` that never reports an update. Used when no real
/// release feed is configured.
pub struct NoopReleaseChecker;

#[async_trait]
impl ReleaseChecker for NoopReleaseChecker {
    async fn newer_release_available(&self, _current_version: &str) -> bool {
        false
    }
}

/// `BackupSink` that only logs; used when no real backup target is
/// configured.
pub struct NoopBackupSink;

#[async_trait]
impl BackupSink for NoopBackupSink {
    async fn backup(&self, config_json: &[u8]) {
        log::debug!("[Maintenance] backup tick ({} bytes, no sink configured)", config_json.len());
    }
}

/// Owns the three periodic workers and the token that stops them.
pub struct MaintenanceScheduler {
    controller: Arc<Controller>,
    store: Arc<ConfigStore>,
    config: Arc<Config>,
    release_checker: Arc<dyn ReleaseChecker>,
    backup_sink: Arc<dyn BackupSink>,
    cancel: CancellationToken,
}

impl MaintenanceScheduler {
    pub fn new(
        controller: Arc<Controller>,
        store: Arc<ConfigStore>,
        config: Arc<Config>,
        release_checker: Arc<dyn ReleaseChecker>,
        backup_sink: Arc<dyn BackupSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self { controller, store, config, release_checker, backup_sink, cancel }
    }

    /// Spawns all three workers. Returns immediately; the workers run until
    /// the shared cancellation token fires.
    pub fn start(self: &Arc<Self>, spawner: &dyn TaskSpawner) {
        self.clone().spawn_online_probe(spawner);
        self.clone().spawn_release_probe(spawner);
        self.clone().spawn_backup(spawner);
    }

    fn spawn_online_probe(self: Arc<Self>, spawner: &dyn TaskSpawner) {
        spawner.spawn(Box::pin(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(self.config.online_probe_interval_secs));
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        log::info!("[Maintenance] online probe stopping");
                        return;
                    }
                    _ = interval.tick() => {}
                }

                let reachable = probe_reachability().await;
                if let Err(err) = self.controller.set_offline(!reachable).await {
                    log::error!("[Maintenance] failed to apply offline state: {}", err);
                }
            }
        }));
    }

    fn spawn_release_probe(self: Arc<Self>, spawner: &dyn TaskSpawner) {
        spawner.spawn(Box::pin(async move {
            self.run_release_check().await;

            let mut interval = tokio::time::interval(Duration::from_secs(self.config.release_probe_interval_secs));
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        log::info!("[Maintenance] release probe stopping");
                        return;
                    }
                    _ = interval.tick() => {}
                }
                self.run_release_check().await;
            }
        }));
    }

    async fn run_release_check(&self) {
        let current_version = self.controller.get_info().await.firmware_version;
        let newer = self.release_checker.newer_release_available(&current_version).await;
        if newer {
            if let Err(err) = self.controller.set_update_available(true).await {
                log::error!("[Maintenance] failed to flag update available: {}", err);
            }
        }
    }

    fn spawn_backup(self: Arc<Self>, spawner: &dyn TaskSpawner) {
        spawner.spawn(Box::pin(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(self.config.backup_interval_secs));
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        log::info!("[Maintenance] backup worker stopping");
                        return;
                    }
                    _ = interval.tick() => {}
                }

                if let Err(err) = self.store.flush() {
                    log::error!("[Maintenance] failed to flush config before backup: {}", err);
                    continue;
                }
                match std::fs::read(self.store.path()) {
                    Ok(bytes) => self.backup_sink.backup(&bytes).await,
                    Err(err) => log::error!("[Maintenance] failed to read {} for backup: {}", self.store.path().display(), err),
                }
            }
        }));
    }
}

/// Lightweight outbound reachability probe: a short-timeout GET against a
/// well-known endpoint. Any error (timeout, DNS, connection refused) is
/// treated as "offline" — this worker never surfaces the underlying cause,
/// only the boolean state `Controller::set_offline` wants.
async fn probe_reachability() -> bool {
    let client = match reqwest::Client::builder().timeout(Duration::from_secs(5)).build() {
        Ok(client) => client,
        Err(_) => return false,
    };
    client.head("https://connectivitycheck.gstatic.com/generate_204").send().await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_store::ConfigStore;
    use crate::events::EventBus;
    use crate::hardware::{detect, MockBus};
    use crate::runtime::TokioSpawner;
    use crate::state::State;
    use crate::stream_manager::StreamManager;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct FlaggingReleaseChecker {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ReleaseChecker for FlaggingReleaseChecker {
        async fn newer_release_available(&self, _current_version: &str) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    struct RecordingBackupSink {
        called: Arc<AtomicBool>,
    }

    #[async_trait]
    impl BackupSink for RecordingBackupSink {
        async fn backup(&self, _config_json: &[u8]) {
            self.called.store(true, Ordering::SeqCst);
        }
    }

    async fn test_controller(store: Arc<ConfigStore>) -> Arc<Controller> {
        let bus: Arc<dyn crate::hardware::HardwareBus> = Arc::new(MockBus::new(500, 1));
        bus.init().await.unwrap();
        let profile = detect(bus.as_ref()).await.unwrap();
        let event_bus = Arc::new(EventBus::new());
        let dir = tempfile::tempdir().unwrap();
        let stream_manager = Arc::new(StreamManager::new(dir.path(), Arc::new(Config::default()), Arc::new(TokioSpawner::current()), profile.total_sources));
        Arc::new(Controller::new(State::default(), bus, profile, store, event_bus, stream_manager))
    }

    #[tokio::test]
    async fn release_probe_runs_once_at_startup_and_flags_update() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ConfigStore::new(dir.path().join("house.json"), &TokioSpawner::current()));
        let controller = test_controller(Arc::clone(&store)).await;
        let checker = Arc::new(FlaggingReleaseChecker { calls: AtomicU32::new(0) });
        let config = Arc::new(Config { release_probe_interval_secs: 3600, ..Config::default() });
        let cancel = CancellationToken::new();
        let scheduler = Arc::new(MaintenanceScheduler::new(
            Arc::clone(&controller),
            Arc::clone(&store),
            config,
            checker.clone(),
            Arc::new(NoopBackupSink),
            cancel.clone(),
        ));

        scheduler.clone().spawn_release_probe(&TokioSpawner::current());
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        assert!(checker.calls.load(Ordering::SeqCst) >= 1);
        assert!(controller.get_info().await.update_available);
    }

    #[tokio::test]
    async fn backup_worker_flushes_and_calls_sink() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ConfigStore::new(dir.path().join("house.json"), &TokioSpawner::current()));
        store.save(State::default());
        let controller = test_controller(Arc::clone(&store)).await;
        let called = Arc::new(AtomicBool::new(false));
        let sink = Arc::new(RecordingBackupSink { called: Arc::clone(&called) });
        let config = Arc::new(Config { backup_interval_secs: 1, ..Config::default() });
        let cancel = CancellationToken::new();
        let scheduler = Arc::new(MaintenanceScheduler::new(
            controller,
            store,
            config,
            Arc::new(NoopReleaseChecker),
            sink,
            cancel.clone(),
        ));

        scheduler.clone().spawn_backup(&TokioSpawner::current());
        tokio::time::sleep(Duration::from_millis(1200)).await;
        cancel.cancel();

        assert!(called.load(Ordering::SeqCst));
    }
}
