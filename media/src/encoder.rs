// Collaborator contracts for capture and encoding backends.
//
// The core never talks to a GPU or a sound server; it pulls raw frames and
// Opus packets through these traits and pushes compressed video back out as
// datagrams. Encoders are looked up through an explicitly passed registry,
// and the only cross-thread entry into a running encoder is the bitrate
// reconfigure hook.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use bytes::Bytes;

use crate::config::VideoConfig;

/// A captured frame handed to the encoder. The payload stays opaque to the
/// core.
pub struct RawFrame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub timestamp: Instant,
}

/// One compressed frame out of the encoder.
pub struct VideoPacket {
    pub data: Vec<u8>,
    pub frame_index: u64,
    pub idr: bool,
    /// Set on the first frame encoded after a reference-frame invalidation
    /// so the client knows prediction history was dropped.
    pub after_ref_frame_invalidation: bool,
    pub frame_timestamp: Option<Instant>,
    /// Codec-header substitutions to apply during packetization (SPS/VPS
    /// rewrites). None for encoders that emit spec-compliant headers.
    pub replacements: Option<Vec<(Bytes, Bytes)>>,
}

/// Capture source for the video plane. Implementations block until a frame
/// is available and provide latest-wins semantics so a stalled plane never
/// accumulates latency.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<RawFrame>;
}

/// Opus packet source for the audio plane; one call per encoded packet.
pub trait AudioPacketSource: Send {
    fn next_packet(&mut self) -> Result<Bytes>;
}

/// Runtime bitrate reconfiguration. This is invoked from the control thread
/// while the video thread owns the encoder, so implementations must
/// serialize internally. Returning `false` means no change was applied.
pub trait ReconfigureBitrate: Send + Sync {
    fn reconfigure_bitrate(&self, new_bitrate_kbps: u32) -> bool;
}

/// A running video encoder, owned by the session's video thread.
pub trait EncodeSession: Send {
    fn encode(&mut self, frame: RawFrame) -> Result<VideoPacket>;

    /// The next encoded frame must be an IDR keyframe.
    fn request_idr_frame(&mut self);

    fn request_normal_frame(&mut self);

    /// Drop references to frames in `[first_frame, last_frame]` and tag the
    /// next output with `after_ref_frame_invalidation`.
    fn invalidate_ref_frames(&mut self, first_frame: u64, last_frame: u64);

    /// Handle used for runtime bitrate changes; `None` when the encoder
    /// cannot reconfigure while running.
    fn bitrate_hook(&self) -> Option<Arc<dyn ReconfigureBitrate>> {
        None
    }
}

pub type EncoderFactory = Box<dyn Fn(&VideoConfig) -> Result<Box<dyn EncodeSession>> + Send + Sync>;

/// Available encoder backends, in preference order. Replaces per-backend
/// globals: the embedder registers what the platform offers and passes the
/// registry to the server.
#[derive(Default)]
pub struct EncoderRegistry {
    factories: Vec<(String, EncoderFactory)>,
}

impl EncoderRegistry {
    pub fn new() -> EncoderRegistry {
        EncoderRegistry {
            factories: Vec::new(),
        }
    }

    pub fn register(&mut self, name: &str, factory: EncoderFactory) {
        self.factories.push((name.to_string(), factory));
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Instantiate `name`, or the first registered backend when `name` is
    /// `None`.
    pub fn create(
        &self,
        name: Option<&str>,
        config: &VideoConfig,
    ) -> Result<Box<dyn EncodeSession>> {
        let entry = match name {
            Some(name) => self
                .factories
                .iter()
                .find(|(n, _)| n == name)
                .ok_or_else(|| anyhow!("encoder {name} is not registered"))?,
            None => self
                .factories
                .first()
                .ok_or_else(|| anyhow!("no encoders registered"))?,
        };
        (entry.1)(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn registry_prefers_first_backend() {
        let mut registry = EncoderRegistry::new();
        registry.register("software", Box::new(|_| Ok(testutil::StubEncoder::boxed())));
        registry.register("nvenc", Box::new(|_| Ok(testutil::StubEncoder::boxed())));
        assert_eq!(registry.names(), vec!["software", "nvenc"]);
        assert!(registry.create(None, &testutil::test_video_config()).is_ok());
        assert!(registry
            .create(Some("nvenc"), &testutil::test_video_config())
            .is_ok());
        assert!(registry
            .create(Some("quicksync"), &testutil::test_video_config())
            .is_err());
    }

    #[test]
    fn empty_registry_errors() {
        let registry = EncoderRegistry::new();
        assert!(registry.create(None, &testutil::test_video_config()).is_err());
    }
}
