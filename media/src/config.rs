// Host configuration and the per-session negotiated stream parameters.
//
// The host config is TOML on disk; a missing or unparseable file falls back
// to defaults. Out-of-range values are clamped with a one-time warning, the
// host never aborts over configuration.

use std::fs;
use std::net::IpAddr;

use serde::Deserialize;
use strum_macros::Display;
use tracing::warn;

// UDP port offsets from the configured base port.
pub const VIDEO_STREAM_PORT: u16 = 9;
pub const CONTROL_PORT: u16 = 10;
pub const AUDIO_STREAM_PORT: u16 = 11;
pub const RTSP_SETUP_PORT: u16 = 21;

// Video encryption modes negotiated by the RTSP front-end.
pub const ENCRYPTION_MODE_NEVER: u32 = 0;
pub const ENCRYPTION_MODE_OPPORTUNISTIC: u32 = 1;
pub const ENCRYPTION_MODE_MANDATORY: u32 = 2;

// Per-plane encryption bits carried in `encryption_flags_enabled`.
pub const ENC_FLAG_VIDEO: u32 = 0x01;
pub const ENC_FLAG_AUDIO: u32 = 0x02;
pub const ENC_FLAG_CONTROL_V2: u32 = 0x04;

// Client feature flags.
pub const FF_PEN_TOUCH_EVENTS: u32 = 0x01;
pub const FF_CONTROLLER_TOUCH_EVENTS: u32 = 0x02;
pub const FF_SESSION_ID_V1: u32 = 0x04;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub address: IpAddr,
    pub port: u16,
    pub ping_timeout_ms: u64,
    pub fec_percentage: u32,
    pub lan_encryption_mode: u32,
    pub wan_encryption_mode: u32,
    pub audio_data_shards: usize,
    pub audio_parity_shards: usize,
    pub auto_bitrate: AutoBitrateSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: IpAddr::from([0, 0, 0, 0]),
            port: 47989,
            ping_timeout_ms: 10_000,
            fec_percentage: 20,
            lan_encryption_mode: ENCRYPTION_MODE_NEVER,
            wan_encryption_mode: ENCRYPTION_MODE_OPPORTUNISTIC,
            audio_data_shards: 4,
            audio_parity_shards: 2,
            auto_bitrate: AutoBitrateSettings::default(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Config {
        let mut config = match fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    warn!(path, error = %e, "config file unparseable, using defaults");
                    Config::default()
                }
            },
            Err(_) => {
                warn!(path, "config file missing, using defaults");
                Config::default()
            }
        };
        config.sanitize();
        config
    }

    fn sanitize(&mut self) {
        if self.fec_percentage > 255 {
            warn!(
                fec_percentage = self.fec_percentage,
                "fec_percentage out of range, clamping to 255"
            );
            self.fec_percentage = 255;
        }
        if self.audio_data_shards == 0 {
            warn!("audio_data_shards must be at least 1, clamping");
            self.audio_data_shards = 1;
        }
        if self.audio_parity_shards == 0 {
            warn!("audio_parity_shards must be at least 1, clamping");
            self.audio_parity_shards = 1;
        }
        if self.ping_timeout_ms == 0 {
            warn!("ping_timeout_ms must be nonzero, clamping to 10000");
            self.ping_timeout_ms = 10_000;
        }
    }

    /// Auto-bitrate settings are read per call so a config reload takes
    /// effect on the next control message.
    pub fn auto_bitrate(&self) -> AutoBitrateSettings {
        self.auto_bitrate
    }

    pub fn video_port(&self) -> u16 {
        self.port + VIDEO_STREAM_PORT
    }

    pub fn control_port(&self) -> u16 {
        self.port + CONTROL_PORT
    }

    pub fn audio_port(&self) -> u16 {
        self.port + AUDIO_STREAM_PORT
    }
}

/// Tunables for the adaptive bitrate controller. Percentages are whole
/// percent, intervals are milliseconds.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct AutoBitrateSettings {
    pub min_kbps: i32,
    pub max_kbps: i32,
    pub adjustment_interval_ms: i64,
    pub min_adjustment_pct: i32,
    pub loss_severe_pct: i32,
    pub loss_moderate_pct: i32,
    pub loss_mild_pct: i32,
    pub decrease_severe_pct: i32,
    pub decrease_moderate_pct: i32,
    pub decrease_mild_pct: i32,
    pub increase_good_pct: i32,
    pub good_stability_ms: i64,
    pub increase_min_interval_ms: i64,
    pub poor_status_cap_pct: i32,
    pub max_bitrate_cap: i32,
}

impl Default for AutoBitrateSettings {
    fn default() -> Self {
        Self {
            min_kbps: 1,
            max_kbps: 0,
            adjustment_interval_ms: 3000,
            min_adjustment_pct: 5,
            loss_severe_pct: 10,
            loss_moderate_pct: 5,
            loss_mild_pct: 1,
            decrease_severe_pct: 25,
            decrease_moderate_pct: 12,
            decrease_mild_pct: 5,
            increase_good_pct: 5,
            good_stability_ms: 5000,
            increase_min_interval_ms: 3000,
            poor_status_cap_pct: 25,
            max_bitrate_cap: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum VideoFormat {
    #[strum(serialize = "h264")]
    H264,
    #[strum(serialize = "hevc")]
    Hevc,
    #[strum(serialize = "av1")]
    Av1,
}

/// Encoding parameters requested by the client during the RTSP handshake.
#[derive(Clone, Debug)]
pub struct VideoConfig {
    pub width: u32,
    pub height: u32,
    /// Frames per second, or millifps when above 1000 (59940 = 59.94 fps).
    pub framerate: u32,
    pub bitrate_kbps: u32,
    pub slices_per_frame: u32,
    pub num_ref_frames: u32,
    pub video_format: VideoFormat,
    pub dynamic_range: u32,
    pub chroma_sampling_type: u32,
    pub enable_intra_refresh: bool,
    pub encoding_framerate: u32,
}

#[derive(Clone, Debug)]
pub struct AudioConfig {
    pub packet_duration_ms: u32,
    pub channels: u32,
    pub mask: u32,
    pub high_quality: bool,
    pub host_audio: bool,
}

/// Immutable stream parameters shared with the plane threads.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub video: VideoConfig,
    pub audio: AudioConfig,

    pub packet_size: usize,
    pub min_required_fec_packets: usize,
    pub ml_feature_flags: u32,
    pub audio_qos_type: u32,
    pub video_qos_type: u32,

    pub encryption_flags_enabled: u32,
}

impl SessionConfig {
    /// Modern clients carry a session id in their control connect; legacy
    /// clients are matched by peer address instead.
    pub fn supports_session_id(&self) -> bool {
        self.ml_feature_flags & FF_SESSION_ID_V1 != 0
    }

    pub fn video_encrypted(&self) -> bool {
        self.encryption_flags_enabled & ENC_FLAG_VIDEO != 0
    }

    pub fn control_encrypted(&self) -> bool {
        self.encryption_flags_enabled & ENC_FLAG_CONTROL_V2 != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.port, 47989);
        assert_eq!(config.video_port(), 47998);
        assert_eq!(config.control_port(), 47999);
        assert_eq!(config.audio_port(), 48000);
        assert_eq!(config.fec_percentage, 20);

        let ab = config.auto_bitrate();
        assert_eq!(ab.adjustment_interval_ms, 3000);
        assert_eq!(ab.min_adjustment_pct, 5);
        assert_eq!(
            (ab.loss_mild_pct, ab.loss_moderate_pct, ab.loss_severe_pct),
            (1, 5, 10)
        );
        assert_eq!(
            (
                ab.decrease_mild_pct,
                ab.decrease_moderate_pct,
                ab.decrease_severe_pct
            ),
            (5, 12, 25)
        );
        assert_eq!(ab.good_stability_ms, 5000);
        assert_eq!(ab.poor_status_cap_pct, 25);
        assert_eq!(ab.min_kbps, 1);
    }

    #[test]
    fn sanitize_clamps_out_of_range() {
        let mut config = Config {
            fec_percentage: 900,
            audio_data_shards: 0,
            ..Config::default()
        };
        config.sanitize();
        assert_eq!(config.fec_percentage, 255);
        assert_eq!(config.audio_data_shards, 1);
    }

    #[test]
    fn parses_partial_toml() {
        let config: Config = toml::from_str("port = 48100\nfec_percentage = 10\n").unwrap();
        assert_eq!(config.port, 48100);
        assert_eq!(config.fec_percentage, 10);
        assert_eq!(config.auto_bitrate.good_stability_ms, 5000);
    }
}
