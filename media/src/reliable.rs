// Reliable datagram host for the control plane.
//
// One host per process; sessions register with the control server that
// drives it. Delivery is reliable and in-order per peer: every DATA frame
// carries a sequence number, the receiver acks cumulatively with the next
// expected sequence, and unacked frames are retransmitted on a fixed timer.
// A peer that stops acking is disconnected after the retry budget.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

const HEADER_LEN: usize = 5;

const KIND_CONNECT: u8 = 1;
const KIND_CONNECT_ACK: u8 = 2;
const KIND_DATA: u8 = 3;
const KIND_ACK: u8 = 4;
const KIND_DISCONNECT: u8 = 5;

const RETRANSMIT_INTERVAL: Duration = Duration::from_millis(100);
const MAX_RETRANSMITS: u8 = 10;

// Frames this far ahead of the next expected sequence are dropped instead
// of buffered.
const REORDER_WINDOW: u32 = 256;

const RECV_BUFFER_LEN: usize = 2048;

#[derive(Debug, PartialEq, Eq)]
pub enum HostEvent {
    Connect { peer: SocketAddr, connect_data: u32 },
    Receive { peer: SocketAddr, data: Bytes },
    Disconnect { peer: SocketAddr },
}

struct Pending {
    frame: Bytes,
    last_sent: Instant,
    retries: u8,
}

struct PeerState {
    next_out_seq: u32,
    unacked: BTreeMap<u32, Pending>,
    next_in_seq: u32,
    reorder: BTreeMap<u32, Bytes>,
}

impl PeerState {
    fn new() -> PeerState {
        PeerState {
            next_out_seq: 0,
            unacked: BTreeMap::new(),
            next_in_seq: 0,
            reorder: BTreeMap::new(),
        }
    }
}

pub struct ReliableHost {
    sock: UdpSocket,
    peers: Mutex<HashMap<SocketAddr, PeerState>>,
    pending_events: Mutex<VecDeque<HostEvent>>,
}

fn frame(kind: u8, seq: u32, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    out.put_u8(kind);
    out.put_u32_le(seq);
    out.put_slice(payload);
    out.freeze()
}

impl ReliableHost {
    pub async fn bind(addr: SocketAddr) -> Result<ReliableHost> {
        let sock = UdpSocket::bind(addr).await?;
        Ok(ReliableHost {
            sock,
            peers: Mutex::new(HashMap::new()),
            pending_events: Mutex::new(VecDeque::new()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.sock.local_addr()?)
    }

    /// Retransmit due frames, then wait up to `timeout` for one inbound
    /// frame and surface at most one event. `None` means the timeout
    /// elapsed quietly.
    pub async fn service(&self, timeout: Duration) -> Result<Option<HostEvent>> {
        self.retransmit_due(Instant::now()).await?;

        if let Some(event) = self.pending_events.lock().pop_front() {
            return Ok(Some(event));
        }

        let mut buf = [0u8; RECV_BUFFER_LEN];
        match tokio::time::timeout(timeout, self.sock.recv_from(&mut buf)).await {
            Err(_) => Ok(None),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok((n, addr))) => {
                self.handle_frame(addr, &buf[..n]).await?;
                Ok(self.pending_events.lock().pop_front())
            }
        }
    }

    /// Register `peer` locally and send a connect frame. Used by the
    /// client side of a host pair and by tests.
    pub async fn connect(&self, peer: SocketAddr, connect_data: u32) -> Result<()> {
        self.peers.lock().entry(peer).or_insert_with(PeerState::new);
        let mut payload = [0u8; 4];
        LittleEndian::write_u32(&mut payload, connect_data);
        self.sock
            .send_to(&frame(KIND_CONNECT, 0, &payload), peer)
            .await?;
        Ok(())
    }

    /// Queue a reliable datagram to `peer`. The frame is retransmitted
    /// until acked or the peer is declared dead.
    pub async fn send(&self, peer: SocketAddr, payload: &[u8]) -> Result<()> {
        let framed = {
            let mut peers = self.peers.lock();
            let state = peers
                .get_mut(&peer)
                .ok_or_else(|| anyhow!("send to unknown peer {peer}"))?;
            let seq = state.next_out_seq;
            state.next_out_seq += 1;
            let framed = frame(KIND_DATA, seq, payload);
            state.unacked.insert(
                seq,
                Pending {
                    frame: framed.clone(),
                    last_sent: Instant::now(),
                    retries: 0,
                },
            );
            framed
        };
        self.sock.send_to(&framed, peer).await?;
        Ok(())
    }

    /// Drop a peer and tell it so. Pending frames are abandoned.
    pub async fn disconnect(&self, peer: SocketAddr) {
        let removed = self.peers.lock().remove(&peer).is_some();
        if removed {
            let _ = self.sock.send_to(&frame(KIND_DISCONNECT, 0, &[]), peer).await;
        }
    }

    async fn handle_frame(&self, addr: SocketAddr, data: &[u8]) -> Result<()> {
        if data.len() < HEADER_LEN {
            debug!(peer = %addr, "runt control frame dropped");
            return Ok(());
        }
        let kind = data[0];
        let seq = LittleEndian::read_u32(&data[1..5]);
        let payload = &data[HEADER_LEN..];

        match kind {
            KIND_CONNECT => {
                let connect_data = if payload.len() >= 4 {
                    LittleEndian::read_u32(payload)
                } else {
                    0
                };
                let is_new = {
                    let mut peers = self.peers.lock();
                    match peers.entry(addr) {
                        std::collections::hash_map::Entry::Occupied(_) => false,
                        std::collections::hash_map::Entry::Vacant(entry) => {
                            entry.insert(PeerState::new());
                            true
                        }
                    }
                };
                // Re-ack duplicate connects; the first ack may have been
                // lost.
                self.sock
                    .send_to(&frame(KIND_CONNECT_ACK, 0, &[]), addr)
                    .await?;
                if is_new {
                    self.pending_events
                        .lock()
                        .push_back(HostEvent::Connect {
                            peer: addr,
                            connect_data,
                        });
                }
            }
            KIND_CONNECT_ACK => {
                // Our own connect went through; nothing to surface.
            }
            KIND_DATA => {
                let ack = {
                    let mut peers = self.peers.lock();
                    let Some(state) = peers.get_mut(&addr) else {
                        debug!(peer = %addr, "data from unconnected peer dropped");
                        return Ok(());
                    };
                    let mut events = self.pending_events.lock();
                    if seq == state.next_in_seq {
                        events.push_back(HostEvent::Receive {
                            peer: addr,
                            data: Bytes::copy_from_slice(payload),
                        });
                        state.next_in_seq += 1;
                        // Drain anything the reorder buffer now makes
                        // contiguous.
                        while let Some(data) = state.reorder.remove(&state.next_in_seq) {
                            events.push_back(HostEvent::Receive { peer: addr, data });
                            state.next_in_seq += 1;
                        }
                    } else if seq > state.next_in_seq
                        && seq - state.next_in_seq < REORDER_WINDOW
                    {
                        state
                            .reorder
                            .entry(seq)
                            .or_insert_with(|| Bytes::copy_from_slice(payload));
                    }
                    // else: duplicate of something already delivered;
                    // re-acking below is all it needs.
                    state.next_in_seq
                };
                self.sock.send_to(&frame(KIND_ACK, ack, &[]), addr).await?;
            }
            KIND_ACK => {
                let mut peers = self.peers.lock();
                if let Some(state) = peers.get_mut(&addr) {
                    // Cumulative: everything below the ack is delivered.
                    state.unacked.retain(|s, _| *s >= seq);
                }
            }
            KIND_DISCONNECT => {
                if self.peers.lock().remove(&addr).is_some() {
                    self.pending_events
                        .lock()
                        .push_back(HostEvent::Disconnect { peer: addr });
                }
            }
            _ => debug!(peer = %addr, kind, "unknown control frame kind dropped"),
        }
        Ok(())
    }

    async fn retransmit_due(&self, now: Instant) -> Result<()> {
        let mut to_send: Vec<(SocketAddr, Bytes)> = Vec::new();
        let mut dead: Vec<SocketAddr> = Vec::new();
        {
            let mut peers = self.peers.lock();
            for (addr, state) in peers.iter_mut() {
                let mut exhausted = false;
                for pending in state.unacked.values_mut() {
                    if now.duration_since(pending.last_sent) < RETRANSMIT_INTERVAL {
                        continue;
                    }
                    if pending.retries >= MAX_RETRANSMITS {
                        exhausted = true;
                        break;
                    }
                    pending.retries += 1;
                    pending.last_sent = now;
                    to_send.push((*addr, pending.frame.clone()));
                }
                if exhausted {
                    dead.push(*addr);
                }
            }
            for addr in &dead {
                peers.remove(addr);
                self.pending_events
                    .lock()
                    .push_back(HostEvent::Disconnect { peer: *addr });
            }
        }
        for addr in dead {
            warn!(peer = %addr, "control peer unresponsive, disconnecting");
        }
        for (addr, framed) in to_send {
            self.sock.send_to(&framed, addr).await?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn unacked_count(&self, peer: SocketAddr) -> usize {
        self.peers
            .lock()
            .get(&peer)
            .map(|state| state.unacked.len())
            .unwrap_or(0)
    }
}
