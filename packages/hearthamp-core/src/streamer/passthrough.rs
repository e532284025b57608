//! Hardware-passthrough streamer types (`rca`, `aux`, `plexamp`): no
//! process, no virtual slot, always reporting playing.

use async_trait::async_trait;
use std::path::Path;

use crate::error::HearthampResult;
use crate::state::StreamInfo;

use super::Streamer;

pub struct PassthroughStreamer {
    stream_type: &'static str,
}

impl PassthroughStreamer {
    pub fn new(stream_type: &str) -> Self {
        let stream_type = match stream_type {
            "rca" => "rca",
            "aux" => "aux",
            _ => "plexamp",
        };
        Self { stream_type }
    }
}

#[async_trait]
impl Streamer for PassthroughStreamer {
    async fn activate(&self, _virtual_slot: usize, _config_dir: &Path) -> HearthampResult<()> {
        Ok(())
    }

    async fn deactivate(&self) -> HearthampResult<()> {
        Ok(())
    }

    async fn connect(&self, _phys_src: u32, _known_physical_channels: &[u32]) -> HearthampResult<()> {
        Ok(())
    }

    async fn disconnect(&self) -> HearthampResult<()> {
        Ok(())
    }

    async fn send_cmd(&self, _cmd: &str) -> HearthampResult<()> {
        Ok(())
    }

    fn info(&self) -> StreamInfo {
        StreamInfo { state: "playing".to_string(), ..Default::default() }
    }

    fn is_persistent(&self) -> bool {
        true
    }

    fn stream_type(&self) -> &'static str {
        self.stream_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passthrough_reports_playing_and_requires_no_slot() {
        let streamer = PassthroughStreamer::new("rca");
        assert_eq!(streamer.info().state, "playing");
        assert!(streamer.is_persistent());
        streamer.activate(0, Path::new("/tmp")).await.unwrap();
        streamer.connect(0, &[0]).await.unwrap();
    }
}
