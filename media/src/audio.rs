// Audio plane: Opus packets in, CBC-sealed RTP datagrams out, with
// Reed-Solomon parity every `data_shards` packets.
//
// Parity is computed over the ciphertext so the client can verify FEC
// recovery before decrypting. The FEC datagram is a single persistent
// template mutated in place per shard.

use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use tracing::{info, warn};

use lumen_crypto::cbc_iv;
use lumen_fec::ReedSolomon;

use crate::broadcast::{BroadcastHub, PlaneKind};
use crate::encoder::AudioPacketSource;
use crate::packet::{AudioFecPacket, RtpPacket};
use crate::server::SERVICE;
use crate::session::Session;

pub const AUDIO_PAYLOAD_TYPE: u8 = 97;
pub const AUDIO_FEC_PAYLOAD_TYPE: u8 = 127;

/// The fixed channel layouts a client can negotiate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AudioStreamKind {
    Stereo,
    HighStereo,
    Surround51,
    HighSurround51,
    Surround71,
    HighSurround71,
}

/// Opus parameters for one stream kind. The mapping array is the Opus
/// channel mapping table; unused tail entries stay 0xff.
pub struct OpusStreamConfig {
    pub sample_rate: u32,
    pub channels: u8,
    pub streams: u8,
    pub coupled_streams: u8,
    pub mapping: [u8; 8],
    pub bitrate: u32,
}

static STREAM_CONFIGS: [OpusStreamConfig; 6] = [
    // Stereo
    OpusStreamConfig {
        sample_rate: 48_000,
        channels: 2,
        streams: 1,
        coupled_streams: 1,
        mapping: [0, 1, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff],
        bitrate: 96_000,
    },
    // HighStereo
    OpusStreamConfig {
        sample_rate: 48_000,
        channels: 2,
        streams: 1,
        coupled_streams: 1,
        mapping: [0, 1, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff],
        bitrate: 512_000,
    },
    // Surround51
    OpusStreamConfig {
        sample_rate: 48_000,
        channels: 6,
        streams: 4,
        coupled_streams: 2,
        mapping: [0, 1, 4, 5, 2, 3, 0xff, 0xff],
        bitrate: 256_000,
    },
    // HighSurround51
    OpusStreamConfig {
        sample_rate: 48_000,
        channels: 6,
        streams: 6,
        coupled_streams: 0,
        mapping: [0, 1, 2, 3, 4, 5, 0xff, 0xff],
        bitrate: 1_536_000,
    },
    // Surround71
    OpusStreamConfig {
        sample_rate: 48_000,
        channels: 8,
        streams: 5,
        coupled_streams: 3,
        mapping: [0, 1, 6, 7, 2, 3, 4, 5],
        bitrate: 450_000,
    },
    // HighSurround71
    OpusStreamConfig {
        sample_rate: 48_000,
        channels: 8,
        streams: 8,
        coupled_streams: 0,
        mapping: [0, 1, 2, 3, 4, 5, 6, 7],
        bitrate: 2_048_000,
    },
];

pub fn stream_config(kind: AudioStreamKind) -> &'static OpusStreamConfig {
    let index = match kind {
        AudioStreamKind::Stereo => 0,
        AudioStreamKind::HighStereo => 1,
        AudioStreamKind::Surround51 => 2,
        AudioStreamKind::HighSurround51 => 3,
        AudioStreamKind::Surround71 => 4,
        AudioStreamKind::HighSurround71 => 5,
    };
    &STREAM_CONFIGS[index]
}

/// Map the negotiated channel count and quality flag onto a layout.
pub fn select_stream_kind(channels: u32, high_quality: bool) -> AudioStreamKind {
    match (channels, high_quality) {
        (6, false) => AudioStreamKind::Surround51,
        (6, true) => AudioStreamKind::HighSurround51,
        (8, false) => AudioStreamKind::Surround71,
        (8, true) => AudioStreamKind::HighSurround71,
        (_, true) => AudioStreamKind::HighStereo,
        _ => AudioStreamKind::Stereo,
    }
}

pub fn spawn(
    session: Arc<Session>,
    hub: Arc<BroadcastHub>,
    source: Box<dyn AudioPacketSource>,
) -> Result<thread::JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name(format!("audio-{}", session.id()))
        .spawn(move || {
            if let Err(e) = run(&session, &hub, source) {
                warn!(session = session.id(), error = %e, "audio plane stopped with error");
                session.stop();
            }
        })?;
    Ok(handle)
}

fn run(
    session: &Arc<Session>,
    hub: &Arc<BroadcastHub>,
    mut source: Box<dyn AudioPacketSource>,
) -> Result<()> {
    let sock = hub.plane_sender(PlaneKind::Audio)?;
    let Some(peer) = session.audio.peer.wait_bound(&session.shutdown) else {
        return Ok(());
    };
    info!(session = session.id(), peer = %peer, "audio plane active");

    let data_shards = SERVICE.config.audio_data_shards;
    let parity_shards = SERVICE.config.audio_parity_shards;
    let rs = ReedSolomon::new(data_shards, parity_shards)?;

    let kind = select_stream_kind(session.config.audio.channels, session.config.audio.high_quality);
    let samples_per_packet =
        session.config.audio.packet_duration_ms * stream_config(kind).sample_rate / 1000;

    let mut block = FecBlock::new(rs, AUDIO_PAYLOAD_TYPE, AUDIO_FEC_PAYLOAD_TYPE);
    let mut rtp = RtpPacket::new(AUDIO_PAYLOAD_TYPE);
    rtp.set_ssrc(0);

    while !session.should_stop() {
        while session.audio.queue.try_pop().is_some() {}

        let opus = source.next_packet().context("audio source failed")?;
        let sequence = session.audio.next_sequence();
        let timestamp = session.audio.advance_timestamp(samples_per_packet);

        let iv = cbc_iv(session.audio.av_ri_key_id(), sequence);
        let ciphertext = session.audio.cipher().encrypt(&iv, &opus);

        rtp.set_sequence(sequence);
        rtp.set_timestamp(timestamp);
        rtp.set_payload(&ciphertext);
        sock.send_to(rtp.data(), peer).context("audio send failed")?;

        if let Some(parity) = block.push(sequence, timestamp, ciphertext)? {
            for datagram in parity {
                let sequence = session.audio.next_sequence();
                block.fec_packet.set_sequence(sequence);
                block.fec_packet.set_payload(&datagram.payload);
                block.fec_packet.set_shard_index(datagram.shard_index);
                block.fec_packet.set_base_sequence(datagram.base_sequence);
                block.fec_packet.set_timestamp(datagram.timestamp);
                sock.send_to(block.fec_packet.data(), peer)
                    .context("audio fec send failed")?;
            }
        }
    }
    Ok(())
}

pub(crate) struct ParityDatagram {
    pub shard_index: u8,
    pub base_sequence: u16,
    pub timestamp: u32,
    pub payload: Vec<u8>,
}

/// Accumulates ciphertext shards until a full FEC block is ready, then
/// yields the parity datagrams to send.
pub(crate) struct FecBlock {
    rs: ReedSolomon,
    shards: Vec<Vec<u8>>,
    base_sequence: u16,
    base_timestamp: u32,
    pub fec_packet: AudioFecPacket,
}

impl FecBlock {
    pub fn new(rs: ReedSolomon, payload_type: u8, fec_payload_type: u8) -> FecBlock {
        FecBlock {
            shards: Vec::with_capacity(rs.data_shard_count()),
            rs,
            base_sequence: 0,
            base_timestamp: 0,
            fec_packet: AudioFecPacket::new(payload_type, fec_payload_type),
        }
    }

    pub fn push(
        &mut self,
        sequence: u16,
        timestamp: u32,
        ciphertext: Vec<u8>,
    ) -> Result<Option<Vec<ParityDatagram>>> {
        if self.shards.is_empty() {
            self.base_sequence = sequence;
            self.base_timestamp = timestamp;
        }
        self.shards.push(ciphertext);
        if self.shards.len() < self.rs.data_shard_count() {
            return Ok(None);
        }

        // Packets in a block can differ in ciphertext length; pad to the
        // longest before computing parity.
        let shard_len = self.shards.iter().map(Vec::len).max().unwrap_or(0);
        for shard in &mut self.shards {
            shard.resize(shard_len, 0);
        }
        let parity = self.rs.encode(&self.shards)?;
        self.shards.clear();

        Ok(Some(
            parity
                .into_iter()
                .enumerate()
                .map(|(i, payload)| ParityDatagram {
                    shard_index: i as u8,
                    base_sequence: self.base_sequence,
                    timestamp: self.base_timestamp,
                    payload,
                })
                .collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{AUDIO_FEC_HEADER_LEN, RTP_HEADER_LEN};
    use lumen_crypto::pkcs7_padded_len;

    #[test]
    fn stream_configs_cover_all_layouts() {
        assert_eq!(stream_config(AudioStreamKind::Stereo).channels, 2);
        assert_eq!(stream_config(AudioStreamKind::Surround51).channels, 6);
        assert_eq!(stream_config(AudioStreamKind::HighSurround51).coupled_streams, 0);
        assert_eq!(stream_config(AudioStreamKind::Surround71).streams, 5);
        assert_eq!(stream_config(AudioStreamKind::HighSurround71).streams, 8);
        for kind in [
            AudioStreamKind::Stereo,
            AudioStreamKind::HighStereo,
            AudioStreamKind::Surround51,
            AudioStreamKind::HighSurround51,
            AudioStreamKind::Surround71,
            AudioStreamKind::HighSurround71,
        ] {
            assert_eq!(stream_config(kind).sample_rate, 48_000);
        }
    }

    #[test]
    fn layout_selection_follows_channels_and_quality() {
        assert_eq!(select_stream_kind(2, false), AudioStreamKind::Stereo);
        assert_eq!(select_stream_kind(2, true), AudioStreamKind::HighStereo);
        assert_eq!(select_stream_kind(6, false), AudioStreamKind::Surround51);
        assert_eq!(select_stream_kind(8, true), AudioStreamKind::HighSurround71);
    }

    #[test]
    fn fec_block_yields_parity_after_data_shards() {
        let rs = ReedSolomon::new(4, 2).unwrap();
        let mut block = FecBlock::new(rs, AUDIO_PAYLOAD_TYPE, AUDIO_FEC_PAYLOAD_TYPE);

        for i in 0..3u16 {
            assert!(block
                .push(10 + i, 480 * i as u32, vec![i as u8; 32])
                .unwrap()
                .is_none());
        }
        let parity = block.push(13, 480 * 3, vec![3u8; 32]).unwrap().unwrap();
        assert_eq!(parity.len(), 2);
        assert_eq!(parity[0].shard_index, 0);
        assert_eq!(parity[1].shard_index, 1);
        assert_eq!(parity[0].base_sequence, 10);
        assert_eq!(parity[0].timestamp, 0);
        assert_eq!(parity[0].payload.len(), 32);

        // The block resets; the next push starts a new base sequence.
        assert!(block.push(14, 480 * 4, vec![9u8; 32]).unwrap().is_none());
        assert_eq!(block.base_sequence, 14);
    }

    #[test]
    fn fec_block_pads_uneven_ciphertexts() {
        let rs = ReedSolomon::new(2, 1).unwrap();
        let mut block = FecBlock::new(rs, AUDIO_PAYLOAD_TYPE, AUDIO_FEC_PAYLOAD_TYPE);
        assert!(block.push(0, 0, vec![1u8; 16]).unwrap().is_none());
        let parity = block.push(1, 480, vec![2u8; 48]).unwrap().unwrap();
        assert_eq!(parity[0].payload.len(), 48);
    }

    #[test]
    fn fec_template_wire_format() {
        let rs = ReedSolomon::new(2, 1).unwrap();
        let mut block = FecBlock::new(rs, AUDIO_PAYLOAD_TYPE, AUDIO_FEC_PAYLOAD_TYPE);
        block.push(7, 0, vec![1u8; 16]).unwrap();
        let parity = block.push(8, 480, vec![2u8; 16]).unwrap().unwrap();

        block.fec_packet.set_sequence(9);
        block.fec_packet.set_payload(&parity[0].payload);
        block.fec_packet.set_shard_index(parity[0].shard_index);
        block.fec_packet.set_base_sequence(parity[0].base_sequence);

        let data = block.fec_packet.data();
        assert_eq!(data.len(), RTP_HEADER_LEN + AUDIO_FEC_HEADER_LEN + 16);
        assert_eq!(RtpPacket::get_payload_type(data), AUDIO_FEC_PAYLOAD_TYPE);
        assert_eq!(RtpPacket::get_sequence(data), 9);
        assert_eq!(AudioFecPacket::get_base_sequence(data), 7);
    }

    #[test]
    fn ciphertext_length_is_pkcs7_padded() {
        // An 80-byte Opus packet grows to 96 bytes of CBC ciphertext; the
        // RTP datagram adds the 12-byte header on top.
        assert_eq!(pkcs7_padded_len(80), 96);
        assert_eq!(pkcs7_padded_len(96), 112);
    }
}
