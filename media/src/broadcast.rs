// Broadcast hub: owns the video and audio UDP sockets and fans inbound
// datagrams out to per-session plane queues.
//
// The receive side is a single async task per socket. Client pings bind the
// source endpoint to a session, either through the ping payload issued at
// the RTSP handshake or, for bare pings, by source IP among unclaimed
// sessions. Everything else lands in a bounded FIFO that drops oldest on
// overflow; recovering from that loss is the client's FEC's job.
//
// Plane threads send through blocking clones of the same sockets, so
// outbound traffic keeps the bound source port without touching the
// reactor.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use strum_macros::Display;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::session::{upgrade_all, Session};

// Bare ping magic from clients that predate ping payloads.
pub const PING_MAGIC: &[u8] = b"PING";

// Anything at most this long is considered a candidate ping payload.
const MAX_PING_LEN: usize = 32;

const RECV_BUFFER_LEN: usize = 2048;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum PlaneKind {
    #[strum(serialize = "video")]
    Video,
    #[strum(serialize = "audio")]
    Audio,
}

/// Bounded per-session, per-plane FIFO. Overflow discards the oldest
/// datagram so a stalled plane never exerts backpressure on the reactor.
pub struct PlaneQueue {
    inner: Mutex<VecDeque<(SocketAddr, Bytes)>>,
    cond: Condvar,
    capacity: usize,
}

impl PlaneQueue {
    pub fn new(capacity: usize) -> PlaneQueue {
        PlaneQueue {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            cond: Condvar::new(),
            capacity,
        }
    }

    pub fn push(&self, addr: SocketAddr, data: Bytes) {
        let mut inner = self.inner.lock();
        if inner.len() == self.capacity {
            inner.pop_front();
            debug!("plane queue full, dropping oldest datagram");
        }
        inner.push_back((addr, data));
        self.cond.notify_one();
    }

    pub fn try_pop(&self) -> Option<(SocketAddr, Bytes)> {
        self.inner.lock().pop_front()
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Option<(SocketAddr, Bytes)> {
        let mut inner = self.inner.lock();
        if let Some(item) = inner.pop_front() {
            return Some(item);
        }
        self.cond.wait_for(&mut inner, timeout);
        inner.pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

pub struct BroadcastHub {
    video_sock: std::net::UdpSocket,
    audio_sock: std::net::UdpSocket,
    sessions: Mutex<Vec<Weak<Session>>>,
}

impl BroadcastHub {
    /// Bind both media sockets and start their receive loops. The hub is
    /// shared by every session and closes when the last reference drops;
    /// the receive tasks hold only weak handles so they cannot keep it
    /// alive.
    pub fn bind(config: &Config) -> Result<Arc<BroadcastHub>> {
        let video_std = std::net::UdpSocket::bind((config.address, config.video_port()))?;
        let audio_std = std::net::UdpSocket::bind((config.address, config.audio_port()))?;

        let hub = Arc::new(BroadcastHub {
            video_sock: video_std.try_clone()?,
            audio_sock: audio_std.try_clone()?,
            sessions: Mutex::new(Vec::new()),
        });

        for (kind, sock) in [(PlaneKind::Video, video_std), (PlaneKind::Audio, audio_std)] {
            sock.set_nonblocking(true)?;
            let sock = tokio::net::UdpSocket::from_std(sock)?;
            tokio::spawn(recv_loop(Arc::downgrade(&hub), kind, sock));
        }

        info!(
            video_port = config.video_port(),
            audio_port = config.audio_port(),
            "broadcast hub bound"
        );
        Ok(hub)
    }

    /// Ephemeral loopback sockets, no receive loops; tests inject
    /// datagrams straight into `handle_datagram`.
    #[cfg(test)]
    pub(crate) fn bind_loopback() -> Result<Arc<BroadcastHub>> {
        Ok(Arc::new(BroadcastHub {
            video_sock: std::net::UdpSocket::bind("127.0.0.1:0")?,
            audio_sock: std::net::UdpSocket::bind("127.0.0.1:0")?,
            sessions: Mutex::new(Vec::new()),
        }))
    }

    pub fn register(&self, session: &Arc<Session>) {
        let mut sessions = self.sessions.lock();
        sessions.retain(|weak| weak.strong_count() > 0);
        sessions.push(Arc::downgrade(session));
    }

    pub fn unregister(&self, id: u32) {
        self.sessions
            .lock()
            .retain(|weak| match weak.upgrade() {
                Some(session) => session.id() != id,
                None => false,
            });
    }

    fn live_sessions(&self) -> Vec<Arc<Session>> {
        upgrade_all(&self.sessions.lock())
    }

    /// Classify one inbound datagram: ping-bind it or queue it.
    fn handle_datagram(&self, kind: PlaneKind, addr: SocketAddr, data: Bytes) {
        if data.len() <= MAX_PING_LEN {
            // Payload pings name their session outright.
            if let Some(session) = self.find_by_ping_payload(kind, &data) {
                if session.plane_peer(kind).bind(addr) {
                    info!(session = session.id(), plane = %kind, peer = %addr, "plane peer bound");
                }
                return;
            }
            // Bare pings fall back to source-IP matching among sessions
            // that have not claimed this plane yet.
            if data.as_ref() == PING_MAGIC {
                if let Some(session) = self.find_unclaimed_by_ip(kind, addr) {
                    if session.plane_peer(kind).bind(addr) {
                        info!(session = session.id(), plane = %kind, peer = %addr, "plane peer bound by address");
                    }
                } else {
                    debug!(plane = %kind, peer = %addr, "ping from unknown peer dropped");
                }
                return;
            }
        }

        match self.find_by_peer(kind, addr) {
            Some(session) => session.plane_queue(kind).push(addr, data),
            None => debug!(plane = %kind, peer = %addr, "datagram from unbound peer dropped"),
        }
    }

    fn find_by_ping_payload(&self, kind: PlaneKind, payload: &[u8]) -> Option<Arc<Session>> {
        self.live_sessions().into_iter().find(|session| {
            !session.plane_ping_payload(kind).is_empty()
                && session.plane_ping_payload(kind).as_bytes() == payload
        })
    }

    fn find_unclaimed_by_ip(&self, kind: PlaneKind, addr: SocketAddr) -> Option<Arc<Session>> {
        self.live_sessions().into_iter().find(|session| {
            !session.plane_peer(kind).is_bound()
                && session.control.expected_peer_address() == Some(addr.ip())
        })
    }

    fn find_by_peer(&self, kind: PlaneKind, addr: SocketAddr) -> Option<Arc<Session>> {
        self.live_sessions()
            .into_iter()
            .find(|session| session.plane_peer(kind).get() == Some(addr))
    }

    /// Blocking sender clone for a plane thread.
    pub fn plane_sender(&self, kind: PlaneKind) -> std::io::Result<std::net::UdpSocket> {
        match kind {
            PlaneKind::Video => self.video_sock.try_clone(),
            PlaneKind::Audio => self.audio_sock.try_clone(),
        }
    }
}

impl Drop for BroadcastHub {
    fn drop(&mut self) {
        info!("broadcast hub closed");
    }
}

async fn recv_loop(hub: Weak<BroadcastHub>, kind: PlaneKind, sock: tokio::net::UdpSocket) {
    let mut buf = [0u8; RECV_BUFFER_LEN];
    loop {
        match sock.recv_from(&mut buf).await {
            Ok((n, addr)) => {
                let Some(hub) = hub.upgrade() else {
                    return;
                };
                hub.handle_datagram(kind, addr, Bytes::copy_from_slice(&buf[..n]));
            }
            Err(e) => {
                if hub.upgrade().is_none() {
                    return;
                }
                warn!(plane = %kind, error = %e, "media socket receive error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn plane_queue_drops_oldest_on_overflow() {
        let queue = PlaneQueue::new(2);
        let peer = addr("10.0.0.1:48000");
        queue.push(peer, Bytes::from_static(b"a"));
        queue.push(peer, Bytes::from_static(b"b"));
        queue.push(peer, Bytes::from_static(b"c"));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_pop().unwrap().1.as_ref(), b"b");
        assert_eq!(queue.try_pop().unwrap().1.as_ref(), b"c");
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn plane_queue_preserves_arrival_order() {
        let queue = PlaneQueue::new(8);
        let peer = addr("10.0.0.1:48000");
        for payload in [b"1", b"2", b"3"] {
            queue.push(peer, Bytes::from_static(payload));
        }
        assert_eq!(queue.try_pop().unwrap().1.as_ref(), b"1");
        assert_eq!(queue.try_pop().unwrap().1.as_ref(), b"2");
        assert_eq!(queue.try_pop().unwrap().1.as_ref(), b"3");
    }

    #[tokio::test]
    async fn ping_payload_binds_plane_peer() {
        let hub = testutil::test_hub();
        let session = testutil::test_session(false);
        hub.register(&session);

        let peer = addr("10.1.2.3:50000");
        let payload = Bytes::copy_from_slice(session.video.ping_payload.as_bytes());
        hub.handle_datagram(PlaneKind::Video, peer, payload);

        assert_eq!(session.video.peer.get(), Some(peer));
        assert_eq!(session.audio.peer.get(), None);
    }

    #[tokio::test]
    async fn bare_ping_binds_by_expected_address() {
        let hub = testutil::test_hub();
        let session = testutil::test_session(false);
        session.control.set_expected_peer_address(addr("10.1.2.3:0").ip());
        hub.register(&session);

        // A bare ping from an unrelated address is ignored.
        hub.handle_datagram(
            PlaneKind::Audio,
            addr("10.9.9.9:50001"),
            Bytes::from_static(PING_MAGIC),
        );
        assert_eq!(session.audio.peer.get(), None);

        let peer = addr("10.1.2.3:50001");
        hub.handle_datagram(PlaneKind::Audio, peer, Bytes::from_static(PING_MAGIC));
        assert_eq!(session.audio.peer.get(), Some(peer));
    }

    #[tokio::test]
    async fn datagrams_route_to_bound_session_queue() {
        let hub = testutil::test_hub();
        let session = testutil::test_session(false);
        hub.register(&session);

        let peer = addr("10.1.2.3:50000");
        session.video.peer.bind(peer);

        let payload = Bytes::copy_from_slice(&[0u8; 64]);
        hub.handle_datagram(PlaneKind::Video, peer, payload.clone());
        assert_eq!(session.video.queue.try_pop().unwrap().1, payload);

        // Unknown source: dropped, not queued.
        hub.handle_datagram(PlaneKind::Video, addr("10.9.9.9:1"), payload);
        assert!(session.video.queue.is_empty());
    }

    #[tokio::test]
    async fn unregister_removes_session() {
        let hub = testutil::test_hub();
        let session = testutil::test_session(false);
        hub.register(&session);
        hub.unregister(session.id());

        let peer = addr("10.1.2.3:50000");
        let payload = Bytes::copy_from_slice(session.video.ping_payload.as_bytes());
        hub.handle_datagram(PlaneKind::Video, peer, payload);
        assert_eq!(session.video.peer.get(), None);
    }
}
