//! Application bootstrap and dependency wiring.
//!
//! This module is the composition root - the single place where every
//! service is instantiated and wired together. Keeping it separate from
//! `main` means the test suite and any future embedder can stand up a full
//! daemon instance without going through a CLI.

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::config_store::ConfigStore;
use crate::controller::Controller;
use crate::error::{HearthampError, HearthampResult};
use crate::events::EventBus;
use crate::hardware::{detect, make_bus};
use crate::maintenance::{BackupSink, MaintenanceScheduler, NoopBackupSink, NoopReleaseChecker, ReleaseChecker};
use crate::runtime::{TaskSpawner, TokioSpawner};
use crate::stream_manager::StreamManager;

/// Container for all bootstrapped services, consumed by the server binary
/// to build its router state and drive shutdown.
#[derive(Clone)]
pub struct Services {
    pub controller: Arc<Controller>,
    pub event_bus: Arc<EventBus>,
    pub store: Arc<ConfigStore>,
    pub stream_manager: Arc<StreamManager>,
    pub maintenance: Arc<MaintenanceScheduler>,
    pub cancel_token: CancellationToken,
}

impl Services {
    /// Initiates graceful shutdown: stops the maintenance workers, tears
    /// down every live streamer, and forces any pending config save to
    /// disk before returning.
    pub async fn shutdown(&self) {
        log::info!("[Bootstrap] beginning shutdown");
        self.cancel_token.cancel();
        self.stream_manager.shutdown().await;
        if let Err(err) = self.store.flush() {
            log::error!("[Bootstrap] failed to flush config store on shutdown: {}", err);
        }
        log::info!("[Bootstrap] shutdown complete");
    }
}

/// Bootstraps all application services with their dependencies.
///
/// Wiring order matters - each step only depends on what came before it:
///
/// 1. Hardware bus (real or mock) and one-shot profile discovery
/// 2. Config store, loading persisted state (or defaults) from `config_dir`
/// 3. Event bus for state-change fan-out
/// 4. Stream manager, owning the virtual slot pool and live streamer fleet
/// 5. Controller, the single owner of `State`
/// 6. Maintenance scheduler (reachability, release checks, backups)
///
/// `mock_hardware` selects [`MockBus`](crate::hardware::MockBus) over the
/// real I2C/serial bus; the server binary sets this from a `--mock` flag.
pub async fn bootstrap(
    config_dir: &Path,
    daemon_config: Config,
    mock_hardware: bool,
    release_checker: Arc<dyn ReleaseChecker>,
    backup_sink: Arc<dyn BackupSink>,
) -> HearthampResult<Services> {
    daemon_config.validate().map_err(HearthampError::Internal)?;
    let daemon_config = Arc::new(daemon_config);

    std::fs::create_dir_all(config_dir)?;

    let spawner = Arc::new(TokioSpawner::current());

    let bus = make_bus(mock_hardware, daemon_config.bus_rate_limit_per_sec);
    bus.init().await?;
    let profile = detect(bus.as_ref()).await?;
    log::info!("[Bootstrap] detected hardware profile: {:?}", profile);

    let store = Arc::new(ConfigStore::new(config_dir.join("house.json"), spawner.as_ref()));
    let initial = store.load();

    let event_bus = Arc::new(EventBus::new());

    let stream_manager = Arc::new(StreamManager::new(
        config_dir,
        Arc::clone(&daemon_config),
        Arc::clone(&spawner) as Arc<dyn TaskSpawner>,
        profile.total_sources,
    ));

    let controller = Arc::new(Controller::new(initial, bus, profile, Arc::clone(&store), Arc::clone(&event_bus), Arc::clone(&stream_manager)));

    let cancel_token = CancellationToken::new();
    let maintenance = Arc::new(MaintenanceScheduler::new(
        Arc::clone(&controller),
        Arc::clone(&store),
        Arc::clone(&daemon_config),
        release_checker,
        backup_sink,
        cancel_token.clone(),
    ));
    maintenance.start(spawner.as_ref());

    Ok(Services {
        controller,
        event_bus,
        store,
        stream_manager,
        maintenance,
        cancel_token,
    })
}

/// Convenience wrapper for callers with no release-check or backup
/// collaborator, e.g. the server binary's default run mode.
pub async fn bootstrap_with_defaults(config_dir: &Path, daemon_config: Config, mock_hardware: bool) -> HearthampResult<Services> {
    bootstrap(config_dir, daemon_config, mock_hardware, Arc::new(NoopReleaseChecker), Arc::new(NoopBackupSink)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bootstrap_with_mock_hardware_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let services = bootstrap_with_defaults(dir.path(), Config::default(), true).await.unwrap();
        let _state = services.controller.state().await;
        services.shutdown().await;
    }

    #[tokio::test]
    async fn bootstrap_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.bus_rate_limit_per_sec = 0;
        let result = bootstrap_with_defaults(dir.path(), cfg, true).await;
        assert!(result.is_err());
    }
}
