// Wire formats for the three planes.
//
// Video datagrams carry a 12-byte little-endian header; audio rides a
// minimal RTP header plus a 4-byte FEC trailer header; control messages use
// a `type | length | body` envelope. Packet structs wrap a `BytesMut` and
// poke fields at fixed offsets so templates can be mutated in place.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use bytes::{Bytes, BytesMut};
use thiserror::Error;

pub const VIDEO_HEADER_LEN: usize = 12;
pub const RTP_HEADER_LEN: usize = 12;
pub const AUDIO_FEC_HEADER_LEN: usize = 4;
pub const CONTROL_HEADER_LEN: usize = 4;

pub const RTP_VERSION: u8 = 2;

// Video datagram flags (low byte of the flags field). The high byte carries
// the FEC percentage so the client can derive the parity shard count from
// the data shard count.
pub const FLAG_IDR: u8 = 0x01;
pub const FLAG_AFTER_REF_INVALIDATION: u8 = 0x02;
pub const FLAG_PARITY: u8 = 0x04;

// Video header field offsets.
const SEQUENCE_OFFSET: usize = 0;
const FRAME_OFFSET: usize = 2;
const SHARD_INDEX_OFFSET: usize = 6;
const SHARD_COUNT_OFFSET: usize = 8;
const FLAGS_OFFSET: usize = 10;
const FEC_PERCENTAGE_OFFSET: usize = 11;

// RTP header field offsets (big-endian, as on the wire).
const RTP_SEQUENCE_OFFSET: usize = 2;
const RTP_TIMESTAMP_OFFSET: usize = 4;
const RTP_SSRC_OFFSET: usize = 8;
const PT_MASK: u8 = 0x7f;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("control envelope truncated")]
    Truncated,

    #[error("control envelope length field disagrees with the body")]
    LengthMismatch,
}

/// One video shard on the wire:
/// `seq:u16 | frame:u32 | shard_index:u16 | shard_count:u16 | flags:u16`
/// (little-endian) followed by the shard payload, which is
/// `tag(16) || ciphertext` when the plane cipher is present.
pub struct VideoDatagram {
    inner: BytesMut,
}

impl VideoDatagram {
    pub fn new(payload_len: usize) -> VideoDatagram {
        let mut inner = BytesMut::with_capacity(VIDEO_HEADER_LEN + payload_len);
        inner.resize(VIDEO_HEADER_LEN, 0);
        VideoDatagram { inner }
    }

    pub fn set_sequence(&mut self, val: u16) {
        LittleEndian::write_u16(&mut self.inner[SEQUENCE_OFFSET..], val);
    }

    pub fn get_sequence(packet: &[u8]) -> u16 {
        LittleEndian::read_u16(&packet[SEQUENCE_OFFSET..])
    }

    pub fn set_frame_index(&mut self, val: u32) {
        LittleEndian::write_u32(&mut self.inner[FRAME_OFFSET..], val);
    }

    pub fn get_frame_index(packet: &[u8]) -> u32 {
        LittleEndian::read_u32(&packet[FRAME_OFFSET..])
    }

    pub fn set_shard_index(&mut self, val: u16) {
        LittleEndian::write_u16(&mut self.inner[SHARD_INDEX_OFFSET..], val);
    }

    pub fn get_shard_index(packet: &[u8]) -> u16 {
        LittleEndian::read_u16(&packet[SHARD_INDEX_OFFSET..])
    }

    /// Data shard count `k`; parity count is derived client-side from the
    /// FEC percentage.
    pub fn set_shard_count(&mut self, val: u16) {
        LittleEndian::write_u16(&mut self.inner[SHARD_COUNT_OFFSET..], val);
    }

    pub fn get_shard_count(packet: &[u8]) -> u16 {
        LittleEndian::read_u16(&packet[SHARD_COUNT_OFFSET..])
    }

    pub fn set_flags(&mut self, val: u8) {
        self.inner[FLAGS_OFFSET] = val;
    }

    pub fn get_flags(packet: &[u8]) -> u8 {
        packet[FLAGS_OFFSET]
    }

    pub fn set_fec_percentage(&mut self, val: u8) {
        self.inner[FEC_PERCENTAGE_OFFSET] = val;
    }

    pub fn get_fec_percentage(packet: &[u8]) -> u8 {
        packet[FEC_PERCENTAGE_OFFSET]
    }

    pub fn set_payload(&mut self, payload: &[u8]) {
        self.inner.truncate(VIDEO_HEADER_LEN);
        self.inner.extend_from_slice(payload);
    }

    pub fn payload(packet: &[u8]) -> &[u8] {
        &packet[VIDEO_HEADER_LEN..]
    }

    pub fn data(&self) -> &[u8] {
        &self.inner
    }
}

/// Minimal RTP packet for the audio plane. Only the fields the stream
/// mutates get setters; everything else stays zero.
pub struct RtpPacket {
    inner: BytesMut,
}

impl RtpPacket {
    pub fn new(payload_type: u8) -> RtpPacket {
        let mut inner = BytesMut::with_capacity(RTP_HEADER_LEN + 256);
        inner.resize(RTP_HEADER_LEN, 0);
        let mut p = RtpPacket { inner };
        p.inner[0] = RTP_VERSION << 6;
        p.set_payload_type(payload_type);
        p
    }

    pub fn set_payload_type(&mut self, val: u8) {
        self.inner[1] = (self.inner[1] & !PT_MASK) | (val & PT_MASK);
    }

    pub fn get_payload_type(packet: &[u8]) -> u8 {
        packet[1] & PT_MASK
    }

    pub fn set_sequence(&mut self, val: u16) {
        BigEndian::write_u16(&mut self.inner[RTP_SEQUENCE_OFFSET..], val);
    }

    pub fn get_sequence(packet: &[u8]) -> u16 {
        BigEndian::read_u16(&packet[RTP_SEQUENCE_OFFSET..])
    }

    pub fn set_timestamp(&mut self, val: u32) {
        BigEndian::write_u32(&mut self.inner[RTP_TIMESTAMP_OFFSET..], val);
    }

    pub fn get_timestamp(packet: &[u8]) -> u32 {
        BigEndian::read_u32(&packet[RTP_TIMESTAMP_OFFSET..])
    }

    pub fn set_ssrc(&mut self, val: u32) {
        BigEndian::write_u32(&mut self.inner[RTP_SSRC_OFFSET..], val);
    }

    pub fn set_payload(&mut self, payload: &[u8]) {
        self.inner.truncate(RTP_HEADER_LEN);
        self.inner.extend_from_slice(payload);
    }

    pub fn data(&self) -> &[u8] {
        &self.inner
    }
}

/// The persistent audio FEC template: RTP header, then
/// `shard_index:u8 | payload_type:u8 | base_sequence:u16be`, then the parity
/// shard. One instance per stream, mutated in place for every parity
/// datagram.
pub struct AudioFecPacket {
    inner: BytesMut,
}

impl AudioFecPacket {
    pub fn new(payload_type: u8, fec_payload_type: u8) -> AudioFecPacket {
        let mut inner = BytesMut::with_capacity(RTP_HEADER_LEN + AUDIO_FEC_HEADER_LEN + 256);
        inner.resize(RTP_HEADER_LEN + AUDIO_FEC_HEADER_LEN, 0);
        inner[0] = RTP_VERSION << 6;
        inner[1] = fec_payload_type & PT_MASK;
        inner[RTP_HEADER_LEN + 1] = payload_type;
        AudioFecPacket { inner }
    }

    pub fn set_sequence(&mut self, val: u16) {
        BigEndian::write_u16(&mut self.inner[RTP_SEQUENCE_OFFSET..], val);
    }

    pub fn set_timestamp(&mut self, val: u32) {
        BigEndian::write_u32(&mut self.inner[RTP_TIMESTAMP_OFFSET..], val);
    }

    pub fn set_shard_index(&mut self, val: u8) {
        self.inner[RTP_HEADER_LEN] = val;
    }

    pub fn get_shard_index(packet: &[u8]) -> u8 {
        packet[RTP_HEADER_LEN]
    }

    pub fn set_base_sequence(&mut self, val: u16) {
        BigEndian::write_u16(&mut self.inner[RTP_HEADER_LEN + 2..], val);
    }

    pub fn get_base_sequence(packet: &[u8]) -> u16 {
        BigEndian::read_u16(&packet[RTP_HEADER_LEN + 2..])
    }

    pub fn set_payload(&mut self, payload: &[u8]) {
        self.inner.truncate(RTP_HEADER_LEN + AUDIO_FEC_HEADER_LEN);
        self.inner.extend_from_slice(payload);
    }

    pub fn data(&self) -> &[u8] {
        &self.inner
    }
}

/// Frame a control message: `type:u16 | length:u16 | body` (little-endian).
pub fn encode_envelope(msg_type: u16, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(CONTROL_HEADER_LEN + payload.len());
    out.resize(CONTROL_HEADER_LEN, 0);
    LittleEndian::write_u16(&mut out[0..], msg_type);
    LittleEndian::write_u16(&mut out[2..], payload.len() as u16);
    out.extend_from_slice(payload);
    out.freeze()
}

pub fn decode_envelope(data: &[u8]) -> Result<(u16, &[u8]), PacketError> {
    if data.len() < CONTROL_HEADER_LEN {
        return Err(PacketError::Truncated);
    }
    let msg_type = LittleEndian::read_u16(&data[0..]);
    let length = LittleEndian::read_u16(&data[2..]) as usize;
    let body = &data[CONTROL_HEADER_LEN..];
    if body.len() != length {
        return Err(PacketError::LengthMismatch);
    }
    Ok((msg_type, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_header_fields_roundtrip() {
        let mut dg = VideoDatagram::new(16);
        dg.set_sequence(0xBEEF);
        dg.set_frame_index(123_456);
        dg.set_shard_index(3);
        dg.set_shard_count(7);
        dg.set_flags(FLAG_IDR | FLAG_PARITY);
        dg.set_fec_percentage(20);
        dg.set_payload(b"0123456789abcdef");

        let data = dg.data();
        assert_eq!(data.len(), VIDEO_HEADER_LEN + 16);
        assert_eq!(VideoDatagram::get_sequence(data), 0xBEEF);
        assert_eq!(VideoDatagram::get_frame_index(data), 123_456);
        assert_eq!(VideoDatagram::get_shard_index(data), 3);
        assert_eq!(VideoDatagram::get_shard_count(data), 7);
        assert_eq!(VideoDatagram::get_flags(data), FLAG_IDR | FLAG_PARITY);
        assert_eq!(VideoDatagram::get_fec_percentage(data), 20);
        assert_eq!(VideoDatagram::payload(data), b"0123456789abcdef");
    }

    #[test]
    fn video_header_is_little_endian() {
        let mut dg = VideoDatagram::new(0);
        dg.set_sequence(0x0102);
        assert_eq!(&dg.data()[..2], &[0x02, 0x01]);
    }

    #[test]
    fn rtp_packet_template_reuse() {
        let mut rtp = RtpPacket::new(97);
        rtp.set_sequence(1);
        rtp.set_timestamp(480);
        rtp.set_payload(b"aaaa");
        assert_eq!(rtp.data().len(), RTP_HEADER_LEN + 4);

        rtp.set_sequence(2);
        rtp.set_payload(b"bb");
        let data = rtp.data();
        assert_eq!(data.len(), RTP_HEADER_LEN + 2);
        assert_eq!(data[0] >> 6, RTP_VERSION);
        assert_eq!(RtpPacket::get_payload_type(data), 97);
        assert_eq!(RtpPacket::get_sequence(data), 2);
        assert_eq!(RtpPacket::get_timestamp(data), 480);
    }

    #[test]
    fn audio_fec_template_mutates_in_place() {
        let mut fec = AudioFecPacket::new(97, 127);
        fec.set_sequence(9);
        fec.set_shard_index(1);
        fec.set_base_sequence(4);
        fec.set_payload(&[0xAB; 8]);

        let data = fec.data();
        assert_eq!(data.len(), RTP_HEADER_LEN + AUDIO_FEC_HEADER_LEN + 8);
        assert_eq!(RtpPacket::get_payload_type(data), 127);
        assert_eq!(AudioFecPacket::get_shard_index(data), 1);
        assert_eq!(AudioFecPacket::get_base_sequence(data), 4);

        fec.set_shard_index(2);
        fec.set_payload(&[0xCD; 8]);
        assert_eq!(AudioFecPacket::get_shard_index(fec.data()), 2);
        assert_eq!(fec.data().len(), RTP_HEADER_LEN + AUDIO_FEC_HEADER_LEN + 8);
    }

    #[test]
    fn envelope_roundtrip() {
        let framed = encode_envelope(0x0302, b"payload");
        let (msg_type, body) = decode_envelope(&framed).unwrap();
        assert_eq!(msg_type, 0x0302);
        assert_eq!(body, b"payload");
    }

    #[test]
    fn envelope_rejects_bad_length() {
        assert_eq!(decode_envelope(&[1, 2]).unwrap_err(), PacketError::Truncated);
        let mut framed = encode_envelope(7, b"xy").to_vec();
        framed.push(0);
        assert_eq!(
            decode_envelope(&framed).unwrap_err(),
            PacketError::LengthMismatch
        );
    }
}
