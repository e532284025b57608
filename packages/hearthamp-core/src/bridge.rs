//! A loopback bridge: a supervised transfer process piping one virtual
//! slot's capture side to a physical output channel.

use std::sync::Arc;

use crate::allocator::{capture_device, physical_device};
use crate::config::Config;
use crate::runtime::TaskSpawner;
use crate::supervisor::Supervisor;

/// Path to the transfer binary used to bridge a loopback capture device to
/// a physical output. Any PCM-copy tool with this argument shape works.
const BRIDGE_BINARY: &str = "hearthamp-bridge";

/// Owns the supervisor for one active route from a virtual slot to a
/// physical output.
pub struct LoopbackBridge {
    supervisor: Arc<Supervisor>,
    pub virtual_slot: usize,
    pub phys_src: u32,
}

impl LoopbackBridge {
    /// Starts a bridge from `virtual_slot`'s capture device to
    /// `phys_src`'s channel. If `known_physical_channels` doesn't contain
    /// `phys_src`, falls back to channel 0 per the hardware profile's
    /// reported output set.
    pub fn start(
        virtual_slot: usize,
        phys_src: u32,
        known_physical_channels: &[u32],
        config: &Config,
        spawner: &dyn TaskSpawner,
    ) -> Self {
        let phys_src = if known_physical_channels.contains(&phys_src) {
            phys_src
        } else {
            log::warn!("[Bridge] phys_src {} not present in hardware profile, falling back to 0", phys_src);
            0
        };

        let args = vec![capture_device(virtual_slot), physical_device(phys_src)];
        let supervisor = Arc::new(Supervisor::new(BRIDGE_BINARY, args, config));
        supervisor.start(spawner);

        Self { supervisor, virtual_slot, phys_src }
    }

    pub async fn stop(&self) {
        self.supervisor.stop().await;
    }

    pub fn is_running(&self) -> bool {
        self.supervisor.is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::TokioSpawner;

    #[tokio::test]
    async fn falls_back_to_channel_zero_when_phys_src_unknown() {
        let config = Config::default();
        let bridge = LoopbackBridge::start(0, 9, &[0, 1, 2, 3], &config, &TokioSpawner::current());
        assert_eq!(bridge.phys_src, 0);
        bridge.stop().await;
    }

    #[tokio::test]
    async fn keeps_requested_phys_src_when_known() {
        let config = Config::default();
        let bridge = LoopbackBridge::start(0, 2, &[0, 1, 2, 3], &config, &TokioSpawner::current());
        assert_eq!(bridge.phys_src, 2);
        bridge.stop().await;
    }
}
