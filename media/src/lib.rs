//! # Lumen Streaming Core
//!
//! Per-session streaming pipeline for the Lumen game-streaming host. A
//! session owns three transport planes and an adaptive bitrate loop:
//!
//! - **video**: packetize encoder output, erasure-code it, seal with
//!   AES-GCM, send over UDP
//! - **audio**: Opus packets, Reed-Solomon parity, AES-CBC, RTP over UDP
//! - **control**: reliable datagrams carrying client feedback (pings, loss
//!   stats, IDR requests, reference-frame invalidation, HDR, rumble)
//!
//! The broadcast hub multiplexes inbound datagrams from the two media
//! sockets onto per-session queues; the control server does the same for
//! the reliable-datagram host. Capture backends, encoders, and the RTSP
//! handshake are external collaborators reached through the traits in
//! [`encoder`] and the [`launch::LaunchDescriptor`] handoff.

pub mod audio;
pub mod bitrate;
pub mod broadcast;
pub mod config;
pub mod control;
pub mod encoder;
pub mod launch;
pub mod packet;
pub mod reliable;
pub mod server;
pub mod session;
pub mod video;

#[cfg(test)]
pub(crate) mod testutil;

pub use server::Server;
pub use session::Session;
