// Control plane: message dispatch, envelope crypto, and the bitrate loop
// glue.
//
// One control server per process drives the reliable-datagram host and
// serves every session. Sessions are tracked by id; the peer map only holds
// ids, so a dead session can never be reached through a stale pointer.
// Handlers for a given session run serially on the server task.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::bitrate::ConnectionStatus;
use crate::packet::{decode_envelope, encode_envelope};
use crate::reliable::{HostEvent, ReliableHost};
use crate::server::SERVICE;
use crate::session::{upgrade_all, FeedbackEvent, HdrEvent, Session};

/// Control message types. The envelope is `type:u16 | length:u16 | body`;
/// when the session negotiated control encryption, the real message rides
/// inside an ENCRYPTED envelope.
pub mod message_type {
    pub const ENCRYPTED: u16 = 0x0001;
    pub const TERMINATE: u16 = 0x0100;
    pub const RUMBLE: u16 = 0x010B;
    pub const HDR_TOGGLE: u16 = 0x010E;
    pub const PING: u16 = 0x0200;
    pub const LOSS_STATS: u16 = 0x0201;
    pub const LOSS_STATS_V2: u16 = 0x0204;
    pub const CONNECTION_STATUS: u16 = 0x0205;
    pub const REKEY: u16 = 0x0207;
    pub const BITRATE_STATUS: u16 = 0x0208;
    pub const INVALIDATE_REF_FRAMES: u16 = 0x0301;
    pub const REQUEST_IDR: u16 = 0x0302;
}

const SERVICE_TIMEOUT: Duration = Duration::from_millis(150);

pub struct ControlServer {
    host: ReliableHost,
    sessions: Mutex<HashMap<u32, Weak<Session>>>,
    peer_to_session: Mutex<HashMap<SocketAddr, u32>>,
}

impl ControlServer {
    pub async fn bind(addr: SocketAddr) -> Result<Arc<ControlServer>> {
        let host = ReliableHost::bind(addr).await?;
        info!(addr = %host.local_addr()?, "control server bound");
        Ok(Arc::new(ControlServer {
            host,
            sessions: Mutex::new(HashMap::new()),
            peer_to_session: Mutex::new(HashMap::new()),
        }))
    }

    pub fn register(&self, session: &Arc<Session>) {
        self.sessions
            .lock()
            .insert(session.id(), Arc::downgrade(session));
    }

    pub fn unregister(&self, id: u32) {
        self.sessions.lock().remove(&id);
        self.peer_to_session.lock().retain(|_, v| *v != id);
    }

    pub fn live_sessions(&self) -> Vec<Arc<Session>> {
        let sessions: Vec<Weak<Session>> = self.sessions.lock().values().cloned().collect();
        upgrade_all(&sessions)
    }

    /// Drive the host until the process exits. All sessions share this
    /// loop; per-session handlers run serially here.
    pub async fn run(self: Arc<Self>) {
        loop {
            match self.host.service(SERVICE_TIMEOUT).await {
                Ok(Some(event)) => self.handle_event(event).await,
                Ok(None) => {
                    self.sessions.lock().retain(|_, weak| weak.strong_count() > 0);
                }
                Err(e) => warn!(error = %e, "control host error"),
            }
        }
    }

    /// Resolve the session a peer belongs to. A claimed peer hits the id
    /// map; an unclaimed connect matches either the session-id connect data
    /// (modern clients) or the expected peer address (legacy clients).
    fn get_session(&self, peer: SocketAddr, connect_data: u32) -> Option<Arc<Session>> {
        if let Some(id) = self.peer_to_session.lock().get(&peer) {
            return self.sessions.lock().get(id)?.upgrade();
        }

        self.live_sessions().into_iter().find(|session| {
            if session.control.peer().is_some() || session.should_stop() {
                return false;
            }
            if session.config.supports_session_id() {
                session.control.connect_data() == connect_data
            } else {
                session.control.expected_peer_address() == Some(peer.ip())
            }
        })
    }

    fn session_for_peer(&self, peer: SocketAddr) -> Option<Arc<Session>> {
        let id = *self.peer_to_session.lock().get(&peer)?;
        self.sessions.lock().get(&id)?.upgrade()
    }

    async fn handle_event(&self, event: HostEvent) {
        match event {
            HostEvent::Connect { peer, connect_data } => {
                let Some(session) = self.get_session(peer, connect_data) else {
                    warn!(peer = %peer, "control connect with no matching session");
                    self.host.disconnect(peer).await;
                    return;
                };
                if session.control.bind_peer(peer) {
                    self.peer_to_session.lock().insert(peer, session.id());
                    session.reset_ping_deadline(Instant::now());
                    session.advance_running();
                    info!(session = session.id(), peer = %peer, "control peer connected");
                }
            }
            HostEvent::Receive { peer, data } => {
                let Some(session) = self.session_for_peer(peer) else {
                    debug!(peer = %peer, "control message from unknown peer dropped");
                    return;
                };
                match decode_envelope(&data) {
                    Ok((msg_type, payload)) => {
                        self.call(&session, msg_type, payload, false).await;
                    }
                    Err(e) => {
                        // One malformed message is dropped and logged; only
                        // repeated auth failures escalate.
                        warn!(session = session.id(), error = %e, "unparseable control message dropped");
                    }
                }
            }
            HostEvent::Disconnect { peer } => {
                if let Some(session) = self.session_for_peer(peer) {
                    warn!(session = session.id(), peer = %peer, "control peer lost, stopping session");
                    session.stop();
                }
                self.peer_to_session.lock().remove(&peer);
            }
        }
    }

    /// Dispatch one control message. `reinjected` marks messages that were
    /// unwrapped from an ENCRYPTED envelope.
    pub async fn call(&self, session: &Arc<Session>, msg_type: u16, payload: &[u8], reinjected: bool) {
        use message_type::*;

        match msg_type {
            ENCRYPTED if !reinjected => self.on_encrypted(session, payload).await,
            PING => session.reset_ping_deadline(Instant::now()),
            REQUEST_IDR => {
                debug!(session = session.id(), "client requested idr frame");
                session.video.request_idr();
            }
            INVALIDATE_REF_FRAMES => self.on_invalidate_ref_frames(session, payload),
            LOSS_STATS => {
                self.on_loss_stats(session, payload);
                self.run_bitrate_loop(session).await;
            }
            LOSS_STATS_V2 => {
                self.on_loss_stats_v2(session, payload);
                self.run_bitrate_loop(session).await;
            }
            CONNECTION_STATUS => {
                self.on_connection_status(session, payload);
                self.run_bitrate_loop(session).await;
            }
            HDR_TOGGLE => {
                if let Some(&enabled) = payload.first() {
                    session.control.push_hdr(HdrEvent {
                        enabled: enabled != 0,
                    });
                }
            }
            RUMBLE => self.on_rumble(session, payload),
            REKEY => self.on_rekey(session, payload),
            TERMINATE => {
                info!(session = session.id(), "client requested termination");
                session.stop();
            }
            other => {
                debug!(session = session.id(), msg_type = other, "unknown control message dropped");
            }
        }
    }

    /// Unwrap `seq:u32 | tag | ciphertext`, then reinject the inner
    /// envelope. Two authentication failures within a second read as
    /// tampering and stop the session.
    async fn on_encrypted(&self, session: &Arc<Session>, payload: &[u8]) {
        if payload.len() < 4 {
            warn!(session = session.id(), "encrypted control message truncated");
            return;
        }
        let seq = LittleEndian::read_u32(&payload[..4]);
        let now = Instant::now();
        match session.control.open_incoming(seq, &payload[4..], now) {
            Ok(plaintext) => match decode_envelope(&plaintext) {
                Ok((msg_type, inner)) => {
                    Box::pin(self.call(session, msg_type, inner, true)).await;
                }
                Err(e) => {
                    warn!(session = session.id(), error = %e, "decrypted control message unparseable");
                }
            },
            Err(e) => {
                if session.control.record_auth_failure(now) {
                    warn!(session = session.id(), error = %e, "repeated control auth failures, treating as tampering");
                    session.stop();
                } else {
                    warn!(session = session.id(), error = %e, "control message failed authentication, dropped");
                }
            }
        }
    }

    fn on_invalidate_ref_frames(&self, session: &Arc<Session>, payload: &[u8]) {
        if payload.len() < 16 {
            warn!(session = session.id(), "invalidate ref frames payload truncated");
            return;
        }
        let first = LittleEndian::read_u64(&payload[..8]);
        let last = LittleEndian::read_u64(&payload[8..16]);
        debug!(session = session.id(), first, last, "client invalidated reference frames");
        session.video.invalidate_ref_frames(first, last);
    }

    /// Legacy loss report: `last_good_frame:u64 | interval_ms:u32`. Ignored
    /// once the client has upgraded to V2 telemetry.
    fn on_loss_stats(&self, session: &Arc<Session>, payload: &[u8]) {
        if session.bitrate.v2_active() {
            return;
        }
        if payload.len() < 12 {
            warn!(session = session.id(), "loss stats payload truncated");
            return;
        }
        let last_good_frame = LittleEndian::read_u64(&payload[..8]);
        let interval_ms = LittleEndian::read_u32(&payload[8..12]);
        session.bitrate.process_loss_stats(
            last_good_frame,
            Duration::from_millis(u64::from(interval_ms)),
            Instant::now(),
        );
    }

    /// V2 loss report: `loss_pct:f32 | last_good_frame:u64`, the client's
    /// own loss computation taken verbatim.
    fn on_loss_stats_v2(&self, session: &Arc<Session>, payload: &[u8]) {
        if payload.len() < 12 {
            warn!(session = session.id(), "loss stats v2 payload truncated");
            return;
        }
        let loss_pct = LittleEndian::read_f32(&payload[..4]);
        let last_good_frame = LittleEndian::read_u64(&payload[4..12]);
        session.bitrate.mark_v2_active();
        session
            .bitrate
            .process_loss_stats_direct(f64::from(loss_pct), last_good_frame, Instant::now());
    }

    fn on_connection_status(&self, session: &Arc<Session>, payload: &[u8]) {
        if payload.len() < 4 {
            warn!(session = session.id(), "connection status payload truncated");
            return;
        }
        let status = ConnectionStatus::from_wire(LittleEndian::read_u32(&payload[..4]));
        debug!(session = session.id(), status = %status, "client connection status");
        session.bitrate.process_connection_status(status);
    }

    fn on_rumble(&self, session: &Arc<Session>, payload: &[u8]) {
        if payload.len() < 6 {
            warn!(session = session.id(), "rumble payload truncated");
            return;
        }
        session.control.push_feedback(FeedbackEvent::Rumble {
            id: LittleEndian::read_u16(&payload[..2]),
            low_frequency: LittleEndian::read_u16(&payload[2..4]),
            high_frequency: LittleEndian::read_u16(&payload[4..6]),
        });
    }

    fn on_rekey(&self, session: &Arc<Session>, payload: &[u8]) {
        if payload.len() < 16 {
            warn!(session = session.id(), "rekey payload truncated");
            return;
        }
        let mut key = [0u8; 16];
        key.copy_from_slice(&payload[..16]);
        session.control.rekey(&key, Instant::now());
        info!(session = session.id(), "control cipher rekeyed");
    }

    /// The bitrate loop body: consult the controller on every loss or
    /// status message, apply through the encoder hook, confirm the outcome,
    /// and notify the client when something changed.
    async fn run_bitrate_loop(&self, session: &Arc<Session>) {
        let settings = SERVICE.config.auto_bitrate();
        let now = Instant::now();

        let mut adjusted = false;
        if session.bitrate.should_adjust_bitrate(&settings, now) {
            let new_bitrate = session.bitrate.calculate_new_bitrate(&settings, now);
            let applied = session.reconfigure_bitrate(new_bitrate as u32);
            session
                .bitrate
                .confirm_bitrate_change(new_bitrate, applied, Instant::now());
            if applied {
                info!(
                    session = session.id(),
                    bitrate_kbps = new_bitrate,
                    loss_pct = session.bitrate.loss_percentage(),
                    "bitrate adjusted"
                );
                adjusted = true;
            } else {
                debug!(
                    session = session.id(),
                    bitrate_kbps = new_bitrate,
                    "encoder rejected bitrate reconfigure"
                );
            }
        }

        let status = session.bitrate.connection_status();
        let status_changed = session.swap_last_sent_status(status.to_wire() as i32) != status.to_wire() as i32;
        if adjusted || status_changed {
            let mut payload = [0u8; 8];
            LittleEndian::write_u32(&mut payload[..4], session.bitrate.current_bitrate() as u32);
            LittleEndian::write_u32(&mut payload[4..], status.to_wire());
            if let Err(e) = self
                .send(session, message_type::BITRATE_STATUS, &payload)
                .await
            {
                debug!(session = session.id(), error = %e, "bitrate status notify failed");
            }
        }
    }

    /// Send a control message to the session's peer, sealing it when the
    /// session negotiated control encryption.
    pub async fn send(&self, session: &Arc<Session>, msg_type: u16, payload: &[u8]) -> Result<()> {
        let peer = session
            .control
            .peer()
            .ok_or_else(|| anyhow!("session {} has no control peer", session.id()))?;

        if session.control.encrypted() {
            let inner = encode_envelope(msg_type, payload);
            let (seq, sealed) = match session.control.seal_outgoing(&inner) {
                Ok(sealed) => sealed,
                Err(e) => {
                    // IV exhaustion is fatal for the key; the session must
                    // stop and rekey.
                    warn!(session = session.id(), error = %e, "control seal failed, stopping session");
                    session.stop();
                    return Err(e.into());
                }
            };
            let mut outer = Vec::with_capacity(4 + sealed.len());
            outer.extend_from_slice(&seq.to_le_bytes());
            outer.extend_from_slice(&sealed);
            self.host
                .send(peer, &encode_envelope(message_type::ENCRYPTED, &outer))
                .await
        } else {
            self.host.send(peer, &encode_envelope(msg_type, payload)).await
        }
    }

    /// Tell the client the stream is over, then stop. Plain `stop` skips
    /// the courtesy message.
    pub async fn graceful_stop(&self, session: &Arc<Session>) {
        let payload = 0u32.to_le_bytes();
        if let Err(e) = self.send(session, message_type::TERMINATE, &payload).await {
            debug!(session = session.id(), error = %e, "terminate notify failed");
        }
        session.stop();
    }
}
