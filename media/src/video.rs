// Video plane: pull frames from capture, encode, packetize, erasure-code,
// seal, send.
//
// The thread owns the encoder. Feedback from the control plane arrives as
// atomic signals on the session (IDR request, reference-frame invalidation)
// and is applied before the next frame is pulled. Every frame becomes
// exactly `k + m` datagrams tagged with its frame number.

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use bytes::Bytes;
use tracing::{debug, info, warn};

use lumen_fec::{parity_shards_for, ReedSolomon, MAX_TOTAL_SHARDS};

use crate::broadcast::{BroadcastHub, PlaneKind};
use crate::encoder::{EncodeSession, FrameSource, VideoPacket};
use crate::packet::{VideoDatagram, FLAG_AFTER_REF_INVALIDATION, FLAG_IDR, FLAG_PARITY};
use crate::server::SERVICE;
use crate::session::Session;

pub fn spawn(
    session: Arc<Session>,
    hub: Arc<BroadcastHub>,
    encoder: Box<dyn EncodeSession>,
    frames: Box<dyn FrameSource>,
) -> Result<thread::JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name(format!("video-{}", session.id()))
        .spawn(move || {
            if let Err(e) = run(&session, &hub, encoder, frames) {
                warn!(session = session.id(), error = %e, "video plane stopped with error");
                session.stop();
            }
        })?;
    Ok(handle)
}

fn run(
    session: &Arc<Session>,
    hub: &Arc<BroadcastHub>,
    mut encoder: Box<dyn EncodeSession>,
    mut frames: Box<dyn FrameSource>,
) -> Result<()> {
    let sock = hub.plane_sender(PlaneKind::Video)?;
    let Some(peer) = session.video.peer.wait_bound(&session.shutdown) else {
        return Ok(());
    };
    info!(session = session.id(), peer = %peer, "video plane active");

    let fec_percentage = SERVICE.config.fec_percentage;
    let mut codecs: HashMap<(usize, usize), ReedSolomon> = HashMap::new();
    let mut seq: u16 = 0;

    while !session.should_stop() {
        // Inbound video datagrams are pings only; anything queued here is
        // noise the FEC discipline already covers.
        while session.video.queue.try_pop().is_some() {}

        if session.video.take_idr_request() {
            debug!(session = session.id(), "idr frame requested");
            encoder.request_idr_frame();
        }
        if let Some((first, last)) = session.video.take_invalidation() {
            debug!(session = session.id(), first, last, "invalidating reference frames");
            encoder.invalidate_ref_frames(first, last);
        }

        let frame = frames.next_frame().context("capture source failed")?;
        let packet = encoder.encode(frame).context("encoder failed")?;
        let was_idr = packet.idr;

        seq = send_packet(session, &sock, peer, &packet, seq, fec_percentage, &mut codecs)?;

        if was_idr {
            encoder.request_normal_frame();
        }
    }
    Ok(())
}

/// Fragment, pad, erasure-code, seal, and send one encoded frame. Returns
/// the stream sequence number for the next frame.
fn send_packet(
    session: &Arc<Session>,
    sock: &UdpSocket,
    peer: SocketAddr,
    packet: &VideoPacket,
    start_seq: u16,
    fec_percentage: u32,
    codecs: &mut HashMap<(usize, usize), ReedSolomon>,
) -> Result<u16> {
    let replaced;
    let payload: &[u8] = match &packet.replacements {
        Some(replacements) => {
            replaced = replace_headers(&packet.data, replacements);
            &replaced
        }
        None => &packet.data,
    };

    let shard_len = session.config.packet_size;
    let data_shards = payload
        .len()
        .div_ceil(shard_len)
        .max(1)
        .max(session.config.min_required_fec_packets);

    // Oversized frames cannot be erasure-coded in one block; fall back to
    // plain fragmentation rather than stalling the encoder.
    let (fec_percentage, parity_shards) = if data_shards >= MAX_TOTAL_SHARDS {
        warn!(
            session = session.id(),
            frame = packet.frame_index,
            data_shards,
            "frame too large for fec block, sending without parity"
        );
        (0, 0)
    } else {
        (fec_percentage, parity_shards_for(data_shards, fec_percentage))
    };

    let mut shards: Vec<Vec<u8>> = Vec::with_capacity(data_shards + parity_shards);
    for i in 0..data_shards {
        let mut shard = vec![0u8; shard_len];
        let start = i * shard_len;
        if start < payload.len() {
            let end = (start + shard_len).min(payload.len());
            shard[..end - start].copy_from_slice(&payload[start..end]);
        }
        shards.push(shard);
    }
    if parity_shards > 0 {
        let rs = match codecs.entry((data_shards, parity_shards)) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(ReedSolomon::new(data_shards, parity_shards)?)
            }
        };
        shards.extend(rs.encode(&shards)?);
    }

    let mut flags = 0u8;
    if packet.idr {
        flags |= FLAG_IDR;
    }
    if packet.after_ref_frame_invalidation {
        flags |= FLAG_AFTER_REF_INVALIDATION;
    }

    for (i, shard) in shards.iter().enumerate() {
        let mut datagram = VideoDatagram::new(shard.len() + lumen_crypto::GCM_TAG_LEN);
        datagram.set_sequence(start_seq.wrapping_add(i as u16));
        datagram.set_frame_index(packet.frame_index as u32);
        datagram.set_shard_index(i as u16);
        datagram.set_shard_count(data_shards as u16);
        datagram.set_flags(if i >= data_shards {
            flags | FLAG_PARITY
        } else {
            flags
        });
        datagram.set_fec_percentage(fec_percentage as u8);

        match session.video.cipher() {
            Some(cipher) => {
                let counter = session.video.next_iv_counter()?;
                let sealed = cipher.seal(counter, shard)?;
                datagram.set_payload(&sealed);
            }
            None => datagram.set_payload(shard),
        }

        sock.send_to(datagram.data(), peer)
            .context("video send failed")?;
    }

    session.video.store_lowest_seq(start_seq);
    Ok(start_seq.wrapping_add(shards.len() as u16))
}

/// Codec-header substitution filter. Pure: replaces every occurrence of
/// each `old` byte sequence with its `new` counterpart, left to right.
pub fn replace_headers(data: &[u8], replacements: &[(Bytes, Bytes)]) -> Vec<u8> {
    let mut out = data.to_vec();
    for (old, new) in replacements {
        if old.is_empty() {
            continue;
        }
        out = replace_all(&out, old, new);
    }
    out
}

fn replace_all(data: &[u8], old: &[u8], new: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i..].starts_with(old) {
            out.extend_from_slice(new);
            i += old.len();
        } else {
            out.push(data[i]);
            i += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use std::collections::HashMap;

    fn recv_all(sock: &UdpSocket, count: usize) -> Vec<Vec<u8>> {
        let mut buf = [0u8; 2048];
        (0..count)
            .map(|_| {
                let (n, _) = sock.recv_from(&mut buf).unwrap();
                buf[..n].to_vec()
            })
            .collect()
    }

    fn test_packet(len: usize, idr: bool) -> VideoPacket {
        VideoPacket {
            data: (0..len).map(|i| i as u8).collect(),
            frame_index: 42,
            idr,
            after_ref_frame_invalidation: false,
            frame_timestamp: None,
            replacements: None,
        }
    }

    fn send_and_collect(encrypted: bool, packet: &VideoPacket) -> (Arc<Session>, Vec<Vec<u8>>) {
        let session = testutil::test_session(encrypted);
        let hub = testutil::test_hub();
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let peer = receiver.local_addr().unwrap();
        let sock = hub.plane_sender(PlaneKind::Video).unwrap();

        let mut codecs = HashMap::new();
        let next_seq = send_packet(&session, &sock, peer, packet, 0, 20, &mut codecs).unwrap();
        let datagrams = recv_all(&receiver, next_seq as usize);
        (session, datagrams)
    }

    #[test]
    fn frame_becomes_k_plus_m_datagrams() {
        // 4000 bytes at packet_size 1024 -> k = 4, 20% fec -> m = 1.
        let (_, datagrams) = send_and_collect(false, &test_packet(4000, true));
        assert_eq!(datagrams.len(), 5);

        for (i, dg) in datagrams.iter().enumerate() {
            assert_eq!(VideoDatagram::get_frame_index(dg), 42);
            assert_eq!(VideoDatagram::get_sequence(dg), i as u16);
            assert_eq!(VideoDatagram::get_shard_index(dg), i as u16);
            assert_eq!(VideoDatagram::get_shard_count(dg), 4);
            assert_eq!(VideoDatagram::get_fec_percentage(dg), 20);
            let flags = VideoDatagram::get_flags(dg);
            assert_eq!(flags & FLAG_IDR, FLAG_IDR);
            assert_eq!(flags & FLAG_PARITY != 0, i >= 4);
        }
    }

    #[test]
    fn short_frames_pad_to_min_required_shards() {
        // One real fragment, but min_required_fec_packets = 2.
        let (_, datagrams) = send_and_collect(false, &test_packet(100, false));
        // k = 2 data shards, 20% -> 1 parity shard.
        assert_eq!(datagrams.len(), 3);
        assert_eq!(VideoDatagram::get_shard_count(&datagrams[0]), 2);
        // The pad shard is all zeros.
        assert!(VideoDatagram::payload(&datagrams[1]).iter().all(|b| *b == 0));
    }

    #[test]
    fn fragments_reassemble_into_the_frame() {
        let packet = test_packet(2500, false);
        let (_, datagrams) = send_and_collect(false, &packet);
        let k = VideoDatagram::get_shard_count(&datagrams[0]) as usize;
        let mut payload = Vec::new();
        for dg in datagrams.iter().take(k) {
            payload.extend_from_slice(VideoDatagram::payload(dg));
        }
        assert_eq!(&payload[..packet.data.len()], &packet.data[..]);
    }

    #[test]
    fn encrypted_shards_open_with_stream_counters() {
        let packet = test_packet(3000, false);
        let (session, datagrams) = send_and_collect(true, &packet);
        let cipher = session.video.cipher().unwrap();

        for (i, dg) in datagrams.iter().enumerate() {
            let opened = cipher.open(i as u64, VideoDatagram::payload(dg)).unwrap();
            assert_eq!(opened.len(), session.config.packet_size);
        }
        // Counter moved past every datagram sent.
        assert_eq!(
            session.video.next_iv_counter().unwrap(),
            datagrams.len() as u64
        );
    }

    #[test]
    fn parity_shards_recover_dropped_fragments() {
        let packet = test_packet(4000, false);
        let (_, datagrams) = send_and_collect(false, &packet);
        let k = VideoDatagram::get_shard_count(&datagrams[0]) as usize;
        let m = datagrams.len() - k;

        let rs = ReedSolomon::new(k, m).unwrap();
        let mut shards: Vec<Option<Vec<u8>>> = datagrams
            .iter()
            .map(|dg| Some(VideoDatagram::payload(dg).to_vec()))
            .collect();
        shards[1] = None;
        rs.reconstruct(&mut shards).unwrap();
        assert_eq!(&shards[1].as_ref().unwrap()[..], &packet.data[1024..2048]);
    }

    #[test]
    fn replace_headers_substitutes_all_occurrences() {
        let data = b"xxSPSyySPSzz";
        let table = vec![(Bytes::from_static(b"SPS"), Bytes::from_static(b"VPS!"))];
        assert_eq!(replace_headers(data, &table), b"xxVPS!yyVPS!zz");
    }

    #[test]
    fn replace_headers_is_idempotent() {
        let data = b"aa\x00\x00\x01\x67bb\x00\x00\x01\x67";
        let table = vec![(
            Bytes::from_static(b"\x00\x00\x01\x67"),
            Bytes::from_static(b"\x00\x00\x01\x68"),
        )];
        let once = replace_headers(data, &table);
        let twice = replace_headers(&once, &table);
        assert_eq!(once, twice);
    }
}
