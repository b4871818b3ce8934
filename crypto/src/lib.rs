// Cipher contexts for the three stream planes.
//
// Video and control datagrams are sealed with AES-128-GCM under a
// counter-derived 12-byte IV; audio packets use AES-128-CBC with PKCS#7
// padding and a sequence-derived IV. IV counters are monotonic and never
// reused for the lifetime of a key.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes_gcm::aead::AeadInPlace;
use aes_gcm::{Aes128Gcm, Key, KeyInit, Nonce, Tag};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use thiserror::Error;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

pub const GCM_TAG_LEN: usize = 16;
pub const GCM_IV_LEN: usize = 12;
pub const CBC_IV_LEN: usize = 16;
pub const AES_BLOCK_LEN: usize = 16;

// A 64-bit counter only covers 48 bits of the practical packet budget; past
// this the key must be rotated.
pub const GCM_IV_COUNTER_LIMIT: u64 = 1 << 48;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("gcm seal failed")]
    Seal,

    #[error("gcm authentication failed")]
    Auth,

    #[error("ciphertext shorter than the gcm tag")]
    Truncated,

    #[error("cbc padding invalid")]
    Padding,

    #[error("gcm iv counter exhausted, rekey required")]
    IvExhausted,
}

/// Pack a monotonic counter into a GCM IV: counter little-endian in bytes
/// 0..8, bytes 8..12 zero. Uniqueness per key is a hard invariant.
pub fn gcm_iv(counter: u64) -> [u8; GCM_IV_LEN] {
    let mut iv = [0u8; GCM_IV_LEN];
    LittleEndian::write_u64(&mut iv[..8], counter);
    iv
}

/// Audio CBC IV: big-endian `av_ri_key_id + sequence` in bytes 0..4, rest
/// zero.
pub fn cbc_iv(av_ri_key_id: u32, sequence: u16) -> [u8; CBC_IV_LEN] {
    let mut iv = [0u8; CBC_IV_LEN];
    BigEndian::write_u32(&mut iv[..4], av_ri_key_id.wrapping_add(sequence as u32));
    iv
}

/// Output length of a PKCS#7-padded CBC encryption. Padding always adds at
/// least one byte, so block-aligned input grows by a full block.
pub const fn pkcs7_padded_len(len: usize) -> usize {
    (len / AES_BLOCK_LEN + 1) * AES_BLOCK_LEN
}

pub struct GcmCipher {
    cipher: Aes128Gcm,
}

impl GcmCipher {
    pub fn new(key: &[u8; 16]) -> Self {
        Self {
            cipher: Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(key)),
        }
    }

    /// Seal `plaintext` under the counter-derived IV. Output layout is
    /// `tag(16) || ciphertext`, matching the datagram framing.
    pub fn seal(&self, counter: u64, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.seal_with_iv(&gcm_iv(counter), plaintext)
    }

    pub fn seal_with_iv(
        &self,
        iv: &[u8; GCM_IV_LEN],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let mut out = vec![0u8; GCM_TAG_LEN + plaintext.len()];
        out[GCM_TAG_LEN..].copy_from_slice(plaintext);
        let tag = self
            .cipher
            .encrypt_in_place_detached(Nonce::from_slice(iv), &[], &mut out[GCM_TAG_LEN..])
            .map_err(|_| CryptoError::Seal)?;
        out[..GCM_TAG_LEN].copy_from_slice(&tag);
        Ok(out)
    }

    /// Open `tag(16) || ciphertext` sealed under the counter-derived IV.
    pub fn open(&self, counter: u64, tagged: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.open_with_iv(&gcm_iv(counter), tagged)
    }

    pub fn open_with_iv(
        &self,
        iv: &[u8; GCM_IV_LEN],
        tagged: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if tagged.len() < GCM_TAG_LEN {
            return Err(CryptoError::Truncated);
        }
        let (tag, ciphertext) = tagged.split_at(GCM_TAG_LEN);
        let mut out = ciphertext.to_vec();
        self.cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(iv),
                &[],
                &mut out,
                Tag::from_slice(tag),
            )
            .map_err(|_| CryptoError::Auth)?;
        Ok(out)
    }
}

pub struct CbcCipher {
    key: [u8; 16],
}

impl CbcCipher {
    pub fn new(key: &[u8; 16]) -> Self {
        Self { key: *key }
    }

    /// PKCS#7-padded CBC encryption; output length is
    /// `pkcs7_padded_len(plaintext.len())`.
    pub fn encrypt(&self, iv: &[u8; CBC_IV_LEN], plaintext: &[u8]) -> Vec<u8> {
        Aes128CbcEnc::new(&self.key.into(), iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext)
    }

    pub fn decrypt(
        &self,
        iv: &[u8; CBC_IV_LEN],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        Aes128CbcDec::new(&self.key.into(), iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CryptoError::Padding)
    }
}
