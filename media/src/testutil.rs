// Shared fixtures for the module tests.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::broadcast::BroadcastHub;
use crate::config::{
    AudioConfig, SessionConfig, VideoConfig, VideoFormat, ENC_FLAG_AUDIO, ENC_FLAG_CONTROL_V2,
    ENC_FLAG_VIDEO, FF_SESSION_ID_V1,
};
use crate::encoder::{EncodeSession, RawFrame, VideoPacket};
use crate::launch::{AutoBitrateRequest, LaunchDescriptor, Permissions};
use crate::session::Session;

pub(crate) fn test_video_config() -> VideoConfig {
    VideoConfig {
        width: 1920,
        height: 1080,
        framerate: 60,
        bitrate_kbps: 10_000,
        slices_per_frame: 1,
        num_ref_frames: 4,
        video_format: VideoFormat::H264,
        dynamic_range: 0,
        chroma_sampling_type: 0,
        enable_intra_refresh: false,
        encoding_framerate: 60,
    }
}

pub(crate) fn test_session_config(encrypted: bool) -> SessionConfig {
    SessionConfig {
        video: test_video_config(),
        audio: AudioConfig {
            packet_duration_ms: 5,
            channels: 2,
            mask: 0x3,
            high_quality: false,
            host_audio: true,
        },
        packet_size: 1024,
        min_required_fec_packets: 2,
        ml_feature_flags: FF_SESSION_ID_V1,
        audio_qos_type: 0,
        video_qos_type: 0,
        encryption_flags_enabled: if encrypted {
            ENC_FLAG_VIDEO | ENC_FLAG_AUDIO | ENC_FLAG_CONTROL_V2
        } else {
            0
        },
    }
}

pub(crate) fn test_launch() -> LaunchDescriptor {
    LaunchDescriptor {
        id: 1,
        gcm_key: [7u8; 16],
        iv: [9u8; 16],
        ping_payload: "lumen-ping-0001".to_string(),
        control_connect_data: 0x4C4D4E01,
        device_name: "couch".to_string(),
        device_uuid: "6f9619ff-8b86-d011-b42d-00cf4fc964ff".to_string(),
        permissions: Permissions::DEFAULT | Permissions::ALL_INPUTS,
        width: 1920,
        height: 1080,
        fps: 60,
        surround_info: 0,
        hdr_enabled: false,
        sops_enabled: true,
        input_only: false,
        host_audio: true,
        auto_bitrate: AutoBitrateRequest {
            enabled: true,
            min_kbps: 0,
            max_kbps: 0,
        },
        rtsp_cipher: None,
    }
}

pub(crate) fn test_session(encrypted: bool) -> Arc<Session> {
    Session::new(
        test_session_config(encrypted),
        &test_launch(),
        Duration::from_secs(10),
    )
}

/// A session whose client predates session-id connect data.
pub(crate) fn test_legacy_session() -> Arc<Session> {
    let mut config = test_session_config(false);
    config.ml_feature_flags = 0;
    Session::new(config, &test_launch(), Duration::from_secs(10))
}

/// A hub on ephemeral loopback ports with no receive loops; tests feed
/// datagrams through `handle_datagram` directly.
pub(crate) fn test_hub() -> Arc<BroadcastHub> {
    BroadcastHub::bind_loopback().expect("loopback hub")
}

pub(crate) struct StubEncoder {
    next_frame_index: u64,
    force_idr: bool,
}

impl StubEncoder {
    pub(crate) fn boxed() -> Box<dyn EncodeSession> {
        Box::new(StubEncoder {
            next_frame_index: 0,
            force_idr: true,
        })
    }
}

impl EncodeSession for StubEncoder {
    fn encode(&mut self, frame: RawFrame) -> Result<VideoPacket> {
        let index = self.next_frame_index;
        self.next_frame_index += 1;
        let idr = self.force_idr;
        self.force_idr = false;
        Ok(VideoPacket {
            data: frame.data.to_vec(),
            frame_index: index,
            idr,
            after_ref_frame_invalidation: false,
            frame_timestamp: Some(frame.timestamp),
            replacements: None,
        })
    }

    fn request_idr_frame(&mut self) {
        self.force_idr = true;
    }

    fn request_normal_frame(&mut self) {
        self.force_idr = false;
    }

    fn invalidate_ref_frames(&mut self, _first_frame: u64, _last_frame: u64) {
        self.force_idr = true;
    }
}
