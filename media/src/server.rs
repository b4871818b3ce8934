// Host-level wiring: the global service config, the broadcast hub, the
// control server, and the session launch path.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use lazy_static::lazy_static;
use tracing::info;

use crate::broadcast::BroadcastHub;
use crate::config::Config;
use crate::control::ControlServer;
use crate::encoder::{AudioPacketSource, EncoderRegistry, FrameSource};
use crate::launch::LaunchDescriptor;
use crate::session::{self, MediaPipeline, Session};

lazy_static! {
    pub static ref SERVICE: StreamService = StreamService::new();
}

const CONFIG_PATH_ENV: &str = "LUMEN_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "/etc/lumen/lumen.toml";

pub struct StreamService {
    pub config: Config,
}

impl StreamService {
    fn new() -> StreamService {
        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        StreamService {
            config: Config::load(&path),
        }
    }
}

/// Capture collaborators for a media-carrying session.
pub struct CaptureSources {
    pub frames: Box<dyn FrameSource>,
    pub audio: Box<dyn AudioPacketSource>,
}

pub struct Server {
    hub: Arc<BroadcastHub>,
    control: Arc<ControlServer>,
    encoders: EncoderRegistry,
}

impl Server {
    /// Bind the transport plane. The encoder registry is provided by the
    /// embedder; the core never probes hardware itself.
    pub async fn new(encoders: EncoderRegistry) -> Result<Server> {
        let config = &SERVICE.config;
        let hub = BroadcastHub::bind(config)?;
        let control = ControlServer::bind(SocketAddr::new(config.address, config.control_port())).await?;
        tokio::spawn(control.clone().run());
        Ok(Server {
            hub,
            control,
            encoders,
        })
    }

    pub fn control(&self) -> &Arc<ControlServer> {
        &self.control
    }

    pub fn encoder_names(&self) -> Vec<&str> {
        self.encoders.names()
    }

    /// Bring up a session from a completed RTSP handshake. `peer_address`
    /// is the client address the handshake arrived from; legacy clients are
    /// matched against it. `capture` must be `None` for input-only
    /// sessions.
    pub async fn launch(
        &self,
        descriptor: LaunchDescriptor,
        config: crate::config::SessionConfig,
        encoder_name: Option<&str>,
        peer_address: IpAddr,
        capture: Option<CaptureSources>,
    ) -> Result<Arc<Session>> {
        let session = Session::new(
            config,
            &descriptor,
            Duration::from_millis(SERVICE.config.ping_timeout_ms),
        );

        let media = match capture {
            Some(capture) => Some(MediaPipeline {
                encoder: self.encoders.create(encoder_name, &session.config.video)?,
                frames: capture.frames,
                audio: capture.audio,
            }),
            None => None,
        };

        session::start(&session, &self.hub, &self.control, peer_address, media)?;
        Ok(session)
    }

    /// Request a stop on every live session; used on host shutdown.
    pub async fn terminate_sessions(&self) {
        for session in self.control.live_sessions() {
            self.control.graceful_stop(&session).await;
        }
    }

    /// Serve until interrupted, then tear every session down.
    pub async fn run(&self) {
        info!("streaming core running");
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested, terminating sessions");
        self.terminate_sessions().await;
    }
}
