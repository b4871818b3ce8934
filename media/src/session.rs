// Session lifecycle and per-plane substates.
//
// One session per connected client. The state machine is a monotonically
// advancing atomic: STOPPED -> STARTING -> RUNNING -> STOPPING -> STOPPED,
// with no back edges. Every blocking wait in the session observes the
// shutdown event and abandons work once STOPPING is visible.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::{Condvar, Mutex};
use strum_macros::Display;
use thiserror::Error;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tracing::{info, warn};
use uuid::Uuid;

use lumen_crypto::{CbcCipher, CryptoError, GcmCipher, GCM_IV_COUNTER_LIMIT};

use crate::audio;
use crate::bitrate::BitrateController;
use crate::broadcast::{BroadcastHub, PlaneKind, PlaneQueue};
use crate::config::SessionConfig;
use crate::control::ControlServer;
use crate::encoder::{AudioPacketSource, EncodeSession, FrameSource, ReconfigureBitrate};
use crate::launch::{LaunchDescriptor, Permissions};
use crate::video;

// How long the previous control cipher stays valid after a rekey, roughly
// one round-trip of in-flight messages.
const REKEY_GRACE: Duration = Duration::from_millis(250);

// Two authentication failures inside this window count as tampering.
const AUTH_FAILURE_WINDOW: Duration = Duration::from_secs(1);

const RAW_STOPPED: u8 = 0;
const RAW_STARTING: u8 = 1;
const RAW_RUNNING: u8 = 2;
const RAW_STOPPING: u8 = 3;
const RAW_DONE: u8 = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum State {
    #[strum(serialize = "stopped")]
    Stopped,
    #[strum(serialize = "starting")]
    Starting,
    #[strum(serialize = "running")]
    Running,
    #[strum(serialize = "stopping")]
    Stopping,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is input-only but media sources were supplied")]
    UnexpectedMedia,

    #[error("session needs media sources unless it is input-only")]
    MissingMedia,
}

/// Single-fire cooperative cancellation token.
pub struct ShutdownEvent {
    fired: AtomicBool,
    notify: Notify,
}

impl Default for ShutdownEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownEvent {
    pub fn new() -> ShutdownEvent {
        ShutdownEvent {
            fired: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn raise(&self) {
        if !self.fired.swap(true, Ordering::AcqRel) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_raised(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    pub async fn wait(&self) {
        while !self.is_raised() {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before re-checking so a raise between the check and
            // the await cannot be lost.
            notified.as_mut().enable();
            if self.is_raised() {
                return;
            }
            notified.await;
        }
    }
}

/// Peer endpoint learned from the client's first ping on a media socket.
/// First bind wins; the plane thread parks here until it is set.
pub struct PeerSlot {
    inner: Mutex<Option<SocketAddr>>,
    cond: Condvar,
}

impl Default for PeerSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerSlot {
    pub fn new() -> PeerSlot {
        PeerSlot {
            inner: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    /// Returns true when this call performed the first bind.
    pub fn bind(&self, addr: SocketAddr) -> bool {
        let mut inner = self.inner.lock();
        if inner.is_some() {
            return false;
        }
        *inner = Some(addr);
        self.cond.notify_all();
        true
    }

    pub fn get(&self) -> Option<SocketAddr> {
        *self.inner.lock()
    }

    pub fn is_bound(&self) -> bool {
        self.get().is_some()
    }

    /// Block until a peer binds or the shutdown event fires.
    pub fn wait_bound(&self, shutdown: &ShutdownEvent) -> Option<SocketAddr> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(addr) = *inner {
                return Some(addr);
            }
            if shutdown.is_raised() {
                return None;
            }
            self.cond.wait_for(&mut inner, Duration::from_millis(100));
        }
    }
}

pub struct VideoPlane {
    pub ping_payload: String,
    pub peer: PeerSlot,
    pub queue: PlaneQueue,

    cipher: Option<GcmCipher>,
    iv_counter: AtomicU64,
    lowest_seq: AtomicU16,

    idr_requested: AtomicBool,
    invalidate: Mutex<Option<(u64, u64)>>,
}

impl VideoPlane {
    fn new(launch: &LaunchDescriptor, config: &SessionConfig) -> VideoPlane {
        let cipher = config
            .video_encrypted()
            .then(|| GcmCipher::new(&launch.gcm_key));
        VideoPlane {
            ping_payload: launch.ping_payload.clone(),
            peer: PeerSlot::new(),
            queue: PlaneQueue::new(128),
            cipher,
            iv_counter: AtomicU64::new(0),
            lowest_seq: AtomicU16::new(0),
            idr_requested: AtomicBool::new(false),
            invalidate: Mutex::new(None),
        }
    }

    pub fn cipher(&self) -> Option<&GcmCipher> {
        self.cipher.as_ref()
    }

    /// Hand out the next IV counter value. Counters never repeat for the
    /// lifetime of a key; running out is fatal and forces a rekey.
    pub fn next_iv_counter(&self) -> Result<u64, CryptoError> {
        let counter = self.iv_counter.fetch_add(1, Ordering::AcqRel);
        if counter >= GCM_IV_COUNTER_LIMIT {
            return Err(CryptoError::IvExhausted);
        }
        Ok(counter)
    }

    pub fn request_idr(&self) {
        self.idr_requested.store(true, Ordering::Release);
    }

    pub fn take_idr_request(&self) -> bool {
        self.idr_requested.swap(false, Ordering::AcqRel)
    }

    /// Merge the invalidation range with any pending one; the encoder sees
    /// the union when the video thread drains it.
    pub fn invalidate_ref_frames(&self, first_frame: u64, last_frame: u64) {
        let mut pending = self.invalidate.lock();
        *pending = match *pending {
            Some((first, last)) => Some((first.min(first_frame), last.max(last_frame))),
            None => Some((first_frame, last_frame)),
        };
    }

    pub fn take_invalidation(&self) -> Option<(u64, u64)> {
        self.invalidate.lock().take()
    }

    pub fn store_lowest_seq(&self, seq: u16) {
        self.lowest_seq.store(seq, Ordering::Relaxed);
    }

    pub fn lowest_seq(&self) -> u16 {
        self.lowest_seq.load(Ordering::Relaxed)
    }
}

pub struct AudioPlane {
    pub ping_payload: String,
    pub peer: PeerSlot,
    pub queue: PlaneQueue,

    cipher: CbcCipher,
    sequence: AtomicU16,
    av_ri_key_id: u32,
    timestamp: AtomicU32,
}

impl AudioPlane {
    fn new(launch: &LaunchDescriptor) -> AudioPlane {
        AudioPlane {
            ping_payload: launch.ping_payload.clone(),
            peer: PeerSlot::new(),
            queue: PlaneQueue::new(64),
            cipher: CbcCipher::new(&launch.gcm_key),
            sequence: AtomicU16::new(0),
            av_ri_key_id: launch.av_ri_key_id(),
            timestamp: AtomicU32::new(0),
        }
    }

    pub fn cipher(&self) -> &CbcCipher {
        &self.cipher
    }

    pub fn av_ri_key_id(&self) -> u32 {
        self.av_ri_key_id
    }

    pub fn next_sequence(&self) -> u16 {
        self.sequence.fetch_add(1, Ordering::AcqRel)
    }

    /// Returns the timestamp for the current packet and advances by its
    /// duration in samples.
    pub fn advance_timestamp(&self, samples: u32) -> u32 {
        self.timestamp.fetch_add(samples, Ordering::AcqRel)
    }
}

struct ControlCiphers {
    current: GcmCipher,
    previous: Option<(GcmCipher, Instant)>,
}

#[derive(Debug)]
pub struct HdrEvent {
    pub enabled: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum FeedbackEvent {
    Rumble {
        id: u16,
        low_frequency: u16,
        high_frequency: u16,
    },
}

pub struct ControlPlane {
    ciphers: Mutex<ControlCiphers>,
    encrypted: bool,
    incoming_iv: AtomicU64,
    outgoing_iv: AtomicU64,

    /// Clients without full control encryption still encrypt input events
    /// under the launch IV.
    legacy_input_iv: Option<[u8; 16]>,
    /// Peer-address match for legacy clients without session-id connect
    /// data.
    expected_peer_address: Mutex<Option<IpAddr>>,
    connect_data: u32,

    peer: Mutex<Option<SocketAddr>>,

    feedback_tx: UnboundedSender<FeedbackEvent>,
    feedback_rx: Mutex<Option<UnboundedReceiver<FeedbackEvent>>>,
    hdr_tx: UnboundedSender<HdrEvent>,
    hdr_rx: Mutex<Option<UnboundedReceiver<HdrEvent>>>,

    auth_failure_at: Mutex<Option<Instant>>,
}

impl ControlPlane {
    fn new(launch: &LaunchDescriptor, config: &SessionConfig) -> ControlPlane {
        let encrypted = config.control_encrypted();
        let (feedback_tx, feedback_rx) = unbounded_channel();
        let (hdr_tx, hdr_rx) = unbounded_channel();
        ControlPlane {
            ciphers: Mutex::new(ControlCiphers {
                current: GcmCipher::new(&launch.gcm_key),
                previous: None,
            }),
            encrypted,
            incoming_iv: AtomicU64::new(0),
            outgoing_iv: AtomicU64::new(0),
            legacy_input_iv: (!encrypted).then_some(launch.iv),
            expected_peer_address: Mutex::new(None),
            connect_data: launch.control_connect_data,
            peer: Mutex::new(None),
            feedback_tx,
            feedback_rx: Mutex::new(Some(feedback_rx)),
            hdr_tx,
            hdr_rx: Mutex::new(Some(hdr_rx)),
            auth_failure_at: Mutex::new(None),
        }
    }

    pub fn encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn connect_data(&self) -> u32 {
        self.connect_data
    }

    pub fn legacy_input_iv(&self) -> Option<&[u8; 16]> {
        self.legacy_input_iv.as_ref()
    }

    pub fn expected_peer_address(&self) -> Option<IpAddr> {
        *self.expected_peer_address.lock()
    }

    pub fn set_expected_peer_address(&self, addr: IpAddr) {
        *self.expected_peer_address.lock() = Some(addr);
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        *self.peer.lock()
    }

    pub fn bind_peer(&self, addr: SocketAddr) -> bool {
        let mut peer = self.peer.lock();
        if peer.is_some() {
            return false;
        }
        *peer = Some(addr);
        true
    }

    /// Seal an outgoing message; returns the sequence the receiver needs to
    /// rebuild the IV.
    pub fn seal_outgoing(&self, plaintext: &[u8]) -> Result<(u32, Vec<u8>), CryptoError> {
        let counter = self.outgoing_iv.fetch_add(1, Ordering::AcqRel);
        if counter >= GCM_IV_COUNTER_LIMIT {
            return Err(CryptoError::IvExhausted);
        }
        let sealed = self.ciphers.lock().current.seal(counter, plaintext)?;
        Ok((counter as u32, sealed))
    }

    /// Open an incoming sealed message. Right after a rekey the previous
    /// cipher is still accepted for `REKEY_GRACE` so in-flight messages are
    /// not dropped.
    pub fn open_incoming(&self, seq: u32, tagged: &[u8], now: Instant) -> Result<Vec<u8>, CryptoError> {
        let counter = seq as u64;
        let ciphers = self.ciphers.lock();
        match ciphers.current.open(counter, tagged) {
            Ok(plaintext) => {
                self.incoming_iv.store(counter + 1, Ordering::Release);
                Ok(plaintext)
            }
            Err(e) => {
                if let Some((previous, deadline)) = &ciphers.previous {
                    if now < *deadline {
                        let plaintext = previous.open(counter, tagged)?;
                        return Ok(plaintext);
                    }
                }
                Err(e)
            }
        }
    }

    /// Swap in a new control key. IV counters restart since the counter
    /// space belongs to the key.
    pub fn rekey(&self, key: &[u8; 16], now: Instant) {
        let mut ciphers = self.ciphers.lock();
        let old = std::mem::replace(&mut ciphers.current, GcmCipher::new(key));
        ciphers.previous = Some((old, now + REKEY_GRACE));
        self.incoming_iv.store(0, Ordering::Release);
        self.outgoing_iv.store(0, Ordering::Release);
    }

    /// Track authentication failures; two within one second reads as
    /// tampering and the caller must stop the session.
    pub fn record_auth_failure(&self, now: Instant) -> bool {
        let mut last = self.auth_failure_at.lock();
        let tampering = matches!(*last, Some(prev) if now.duration_since(prev) < AUTH_FAILURE_WINDOW);
        *last = Some(now);
        tampering
    }

    pub fn push_feedback(&self, event: FeedbackEvent) {
        let _ = self.feedback_tx.send(event);
    }

    pub fn push_hdr(&self, event: HdrEvent) {
        let _ = self.hdr_tx.send(event);
    }

    /// Hand the feedback stream to the input collaborator; single consumer.
    pub fn take_feedback_receiver(&self) -> Option<UnboundedReceiver<FeedbackEvent>> {
        self.feedback_rx.lock().take()
    }

    pub fn take_hdr_receiver(&self) -> Option<UnboundedReceiver<HdrEvent>> {
        self.hdr_rx.lock().take()
    }
}

struct DeviceInfo {
    name: String,
    uuid: String,
    permissions: Permissions,
}

pub type TeardownHook = Box<dyn FnOnce() + Send>;

pub struct Session {
    id: u32,
    uuid: Uuid,
    pub config: SessionConfig,

    state: AtomicU8,
    pub shutdown: ShutdownEvent,

    ping_deadline: Mutex<Instant>,
    ping_timeout: Duration,

    device: Mutex<DeviceInfo>,

    pub video: VideoPlane,
    pub audio: AudioPlane,
    pub control: ControlPlane,
    pub bitrate: BitrateController,

    hub: Mutex<Option<Arc<BroadcastHub>>>,
    tasks: Mutex<Vec<std::thread::JoinHandle<()>>>,
    undo_cmds: Mutex<Vec<TeardownHook>>,
    bitrate_hook: Mutex<Option<Arc<dyn ReconfigureBitrate>>>,

    last_sent_connection_status: AtomicI32,
    input_only: bool,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        launch: &LaunchDescriptor,
        ping_timeout: Duration,
    ) -> Arc<Session> {
        let now = Instant::now();
        let bitrate = BitrateController::new(
            launch.auto_bitrate.enabled,
            config.video.bitrate_kbps as i32,
            launch.auto_bitrate.min_kbps,
            launch.auto_bitrate.max_kbps,
            config.video.framerate,
            now,
        );
        Arc::new(Session {
            id: launch.id,
            uuid: launch.session_uuid(),
            video: VideoPlane::new(launch, &config),
            audio: AudioPlane::new(launch),
            control: ControlPlane::new(launch, &config),
            bitrate,
            config,
            state: AtomicU8::new(RAW_STOPPED),
            shutdown: ShutdownEvent::new(),
            ping_deadline: Mutex::new(now + ping_timeout),
            ping_timeout,
            device: Mutex::new(DeviceInfo {
                name: launch.device_name.clone(),
                uuid: launch.device_uuid.clone(),
                permissions: launch.permissions,
            }),
            hub: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            undo_cmds: Mutex::new(Vec::new()),
            bitrate_hook: Mutex::new(None),
            last_sent_connection_status: AtomicI32::new(-1),
            input_only: launch.input_only,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn uuid_match(&self, uuid: &str) -> bool {
        self.uuid.to_string() == uuid
    }

    pub fn input_only(&self) -> bool {
        self.input_only
    }

    pub fn device_name(&self) -> String {
        self.device.lock().name.clone()
    }

    pub fn device_uuid(&self) -> String {
        self.device.lock().uuid.clone()
    }

    pub fn permissions(&self) -> Permissions {
        self.device.lock().permissions
    }

    /// Apply a permission update from the pairing layer. A client that can
    /// no longer view streams gets disconnected.
    pub fn update_device_info(&self, name: &str, permissions: Permissions) {
        {
            let mut device = self.device.lock();
            device.name = name.to_string();
            device.permissions = permissions;
        }
        if !permissions.allows_view() {
            info!(session = self.id, "view permission revoked, stopping session");
            self.stop();
        }
    }

    pub fn state(&self) -> State {
        match self.state.load(Ordering::Acquire) {
            RAW_STARTING => State::Starting,
            RAW_RUNNING => State::Running,
            RAW_STOPPING => State::Stopping,
            _ => State::Stopped,
        }
    }

    // fetch_max keeps the machine monotonic; a late transition request to
    // an earlier state is a no-op.
    fn advance(&self, raw: u8) {
        self.state.fetch_max(raw, Ordering::AcqRel);
    }

    pub(crate) fn advance_running(&self) {
        self.advance(RAW_RUNNING);
    }

    /// Planes poll this between units of work.
    pub fn should_stop(&self) -> bool {
        self.shutdown.is_raised() || self.state.load(Ordering::Acquire) >= RAW_STOPPING
    }

    pub fn stop(&self) {
        self.shutdown.raise();
    }

    pub fn reset_ping_deadline(&self, now: Instant) {
        *self.ping_deadline.lock() = now + self.ping_timeout;
    }

    pub fn ping_expired(&self, now: Instant) -> bool {
        now >= *self.ping_deadline.lock()
    }

    /// Register work to run exactly once on the STOPPING -> STOPPED edge.
    pub fn push_undo(&self, hook: TeardownHook) {
        self.undo_cmds.lock().push(hook);
    }

    pub(crate) fn set_bitrate_hook(&self, hook: Option<Arc<dyn ReconfigureBitrate>>) {
        *self.bitrate_hook.lock() = hook;
    }

    /// Ask the encoder for a runtime bitrate change. The hook serializes
    /// internally; `false` means no change was applied.
    pub fn reconfigure_bitrate(&self, new_bitrate_kbps: u32) -> bool {
        match self.bitrate_hook.lock().as_ref() {
            Some(hook) => hook.reconfigure_bitrate(new_bitrate_kbps),
            None => false,
        }
    }

    /// Dedup helper for status notifications; returns the previous value.
    pub fn swap_last_sent_status(&self, status: i32) -> i32 {
        self.last_sent_connection_status.swap(status, Ordering::AcqRel)
    }

    pub fn plane_queue(&self, kind: PlaneKind) -> &PlaneQueue {
        match kind {
            PlaneKind::Video => &self.video.queue,
            PlaneKind::Audio => &self.audio.queue,
        }
    }

    pub fn plane_peer(&self, kind: PlaneKind) -> &PeerSlot {
        match kind {
            PlaneKind::Video => &self.video.peer,
            PlaneKind::Audio => &self.audio.peer,
        }
    }

    pub fn plane_ping_payload(&self, kind: PlaneKind) -> &str {
        match kind {
            PlaneKind::Video => &self.video.ping_payload,
            PlaneKind::Audio => &self.audio.ping_payload,
        }
    }

    fn push_task(&self, handle: std::thread::JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    async fn join_planes(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for handle in tasks {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
    }

    fn release_hub(&self) {
        self.hub.lock().take();
    }
}

/// Media collaborators for a full (not input-only) session.
pub struct MediaPipeline {
    pub encoder: Box<dyn EncodeSession>,
    pub frames: Box<dyn FrameSource>,
    pub audio: Box<dyn AudioPacketSource>,
}

/// Publish the session into the hub and control server and spin up its
/// plane threads. The session stays STARTING until the client's control
/// connect is matched; media sending starts when the first ping binds each
/// plane's peer endpoint.
pub fn start(
    session: &Arc<Session>,
    hub: &Arc<BroadcastHub>,
    control: &Arc<ControlServer>,
    peer_address: IpAddr,
    media: Option<MediaPipeline>,
) -> Result<()> {
    if session.input_only() && media.is_some() {
        return Err(SessionError::UnexpectedMedia.into());
    }
    if !session.input_only() && media.is_none() {
        return Err(SessionError::MissingMedia.into());
    }

    session.advance(RAW_STARTING);
    session.reset_ping_deadline(Instant::now());
    if !session.config.supports_session_id() {
        session.control.set_expected_peer_address(peer_address);
    }

    *session.hub.lock() = Some(hub.clone());
    hub.register(session);
    control.register(session);

    if let Some(media) = media {
        session.set_bitrate_hook(media.encoder.bitrate_hook());
        session.push_task(video::spawn(
            session.clone(),
            hub.clone(),
            media.encoder,
            media.frames,
        )?);
        session.push_task(audio::spawn(session.clone(), hub.clone(), media.audio)?);
    }

    tokio::spawn(lifecycle(session.clone(), hub.clone(), control.clone()));

    info!(
        session = session.id(),
        device = %session.device_name(),
        input_only = session.input_only(),
        "session starting"
    );
    Ok(())
}

/// Watches the ping deadline, then runs teardown once the shutdown event
/// fires: join plane threads, fire undo hooks, drop the hub reference.
async fn lifecycle(session: Arc<Session>, hub: Arc<BroadcastHub>, control: Arc<ControlServer>) {
    loop {
        tokio::select! {
            _ = session.shutdown.wait() => break,
            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                if session.ping_expired(Instant::now()) {
                    warn!(session = session.id(), "ping deadline exceeded, stopping");
                    session.stop();
                    break;
                }
            }
        }
    }

    session.advance(RAW_STOPPING);
    session.join_planes().await;

    let hooks = std::mem::take(&mut *session.undo_cmds.lock());
    for hook in hooks {
        hook();
    }

    control.unregister(session.id());
    hub.unregister(session.id());
    session.release_hub();
    session.advance(RAW_DONE);
    info!(session = session.id(), "session stopped");
}

/// Weak session handles keyed by id, shared by the hub and the control
/// server so neither keeps a dead session alive.
pub(crate) fn upgrade_all(sessions: &[Weak<Session>]) -> Vec<Arc<Session>> {
    sessions.iter().filter_map(Weak::upgrade).collect()
}
