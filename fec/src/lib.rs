// Systematic Reed-Solomon erasure coding over GF(2^8).
//
// Each media frame becomes `k` data shards plus `m` parity shards; any `k`
// of the `k + m` datagrams reconstruct the frame. The code is systematic so
// data shards go on the wire unmodified. Field polynomial is 0x11d with
// generator 2, the conventional choice for byte-oriented RS codes.

use lazy_static::lazy_static;
use thiserror::Error;

mod matrix;

use matrix::Matrix;

const FIELD_SIZE: usize = 256;
const GENERATOR_POLY: u16 = 0x11d;

/// Shard counts live in a single byte on the wire, and the Vandermonde
/// construction needs k + m distinct field elements.
pub const MAX_TOTAL_SHARDS: usize = FIELD_SIZE;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FecError {
    #[error("data shard count must be at least 1")]
    NoDataShards,

    #[error("parity shard count must be at least 1")]
    NoParityShards,

    #[error("total shard count {0} exceeds the gf(2^8) field size")]
    TooManyShards(usize),

    #[error("shard sizes differ or are empty")]
    ShardSizeMismatch,

    #[error("wrong number of shards supplied")]
    ShardCountMismatch,

    #[error("not enough shards present to reconstruct")]
    NotEnoughShards,
}

lazy_static! {
    static ref TABLES: GfTables = GfTables::new();
}

struct GfTables {
    exp: [u8; FIELD_SIZE * 2],
    log: [u8; FIELD_SIZE],
}

impl GfTables {
    fn new() -> Self {
        let mut exp = [0u8; FIELD_SIZE * 2];
        let mut log = [0u8; FIELD_SIZE];
        let mut x: u16 = 1;
        for i in 0..FIELD_SIZE - 1 {
            exp[i] = x as u8;
            log[x as usize] = i as u8;
            x <<= 1;
            if x & 0x100 != 0 {
                x ^= GENERATOR_POLY;
            }
        }
        // Double-length exp table avoids a modulo in gf_mul.
        for i in FIELD_SIZE - 1..FIELD_SIZE * 2 {
            exp[i] = exp[i - (FIELD_SIZE - 1)];
        }
        Self { exp, log }
    }
}

pub(crate) fn gf_mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    let t = &*TABLES;
    t.exp[t.log[a as usize] as usize + t.log[b as usize] as usize]
}

pub(crate) fn gf_div(a: u8, b: u8) -> u8 {
    debug_assert_ne!(b, 0, "division by zero in GF(2^8)");
    if a == 0 {
        return 0;
    }
    let t = &*TABLES;
    t.exp[t.log[a as usize] as usize + FIELD_SIZE - 1 - t.log[b as usize] as usize]
}

fn gf_pow(a: u8, n: usize) -> u8 {
    if n == 0 {
        return 1;
    }
    if a == 0 {
        return 0;
    }
    let t = &*TABLES;
    t.exp[(t.log[a as usize] as usize * n) % (FIELD_SIZE - 1)]
}

#[derive(Debug)]
pub struct ReedSolomon {
    data_shards: usize,
    parity_shards: usize,
    // Rows k..k+m of the systematic encoding matrix; the top k rows are the
    // identity and never materialized.
    parity_rows: Matrix,
    encode_matrix: Matrix,
}

impl ReedSolomon {
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self, FecError> {
        if data_shards == 0 {
            return Err(FecError::NoDataShards);
        }
        if parity_shards == 0 {
            return Err(FecError::NoParityShards);
        }
        let total = data_shards + parity_shards;
        if total > MAX_TOTAL_SHARDS {
            return Err(FecError::TooManyShards(total));
        }

        // Vandermonde rows evaluated at distinct points, normalized so the
        // top k x k block is the identity. Any k rows of the result are
        // invertible, which is what makes reconstruction possible.
        let vandermonde = Matrix::from_fn(total, data_shards, |r, c| gf_pow(r as u8, c));
        let top = vandermonde.sub_matrix(0, data_shards);
        let encode_matrix = vandermonde.mul(&top.invert().expect("vandermonde top block is invertible"));
        let parity_rows = encode_matrix.sub_matrix(data_shards, total);

        Ok(Self {
            data_shards,
            parity_shards,
            parity_rows,
            encode_matrix,
        })
    }

    pub fn data_shard_count(&self) -> usize {
        self.data_shards
    }

    pub fn parity_shard_count(&self) -> usize {
        self.parity_shards
    }

    pub fn total_shard_count(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Compute parity shards from `data`. `data` must hold exactly `k`
    /// equal-length shards; returns `m` shards of the same length.
    pub fn encode(&self, data: &[impl AsRef<[u8]>]) -> Result<Vec<Vec<u8>>, FecError> {
        if data.len() != self.data_shards {
            return Err(FecError::ShardCountMismatch);
        }
        let shard_len = shard_len(data)?;

        let mut parity = vec![vec![0u8; shard_len]; self.parity_shards];
        for (row, out) in parity.iter_mut().enumerate() {
            for (col, shard) in data.iter().enumerate() {
                let coeff = self.parity_rows.get(row, col);
                if coeff == 0 {
                    continue;
                }
                for (o, b) in out.iter_mut().zip(shard.as_ref()) {
                    *o ^= gf_mul(coeff, *b);
                }
            }
        }
        Ok(parity)
    }

    /// Rebuild the missing shards in place. `shards` must hold `k + m`
    /// entries in shard-index order, with `None` marking losses; at least
    /// `k` entries must be present.
    pub fn reconstruct(&self, shards: &mut [Option<Vec<u8>>]) -> Result<(), FecError> {
        if shards.len() != self.total_shard_count() {
            return Err(FecError::ShardCountMismatch);
        }
        if shards.iter().all(|s| s.is_some()) {
            return Ok(());
        }

        let present: Vec<usize> = shards
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i))
            .collect();
        if present.len() < self.data_shards {
            return Err(FecError::NotEnoughShards);
        }
        let rows: Vec<&Vec<u8>> = present
            .iter()
            .take(self.data_shards)
            .map(|&i| shards[i].as_ref().unwrap())
            .collect();
        let shard_len = shard_len(&rows)?;

        // Invert the sub-matrix made of the surviving rows; multiplying the
        // surviving shards by it recovers the original data shards.
        let sub = Matrix::from_fn(self.data_shards, self.data_shards, |r, c| {
            self.encode_matrix.get(present[r], c)
        });
        let decode = sub.invert().ok_or(FecError::NotEnoughShards)?;

        let mut data: Vec<Vec<u8>> = Vec::with_capacity(self.data_shards);
        for row in 0..self.data_shards {
            if let Some(shard) = &shards[row] {
                data.push(shard.clone());
                continue;
            }
            let mut out = vec![0u8; shard_len];
            for (col, shard) in rows.iter().enumerate() {
                let coeff = decode.get(row, col);
                if coeff == 0 {
                    continue;
                }
                for (o, b) in out.iter_mut().zip(shard.iter()) {
                    *o ^= gf_mul(coeff, *b);
                }
            }
            data.push(out);
        }

        let parity = self.encode(&data)?;
        for (i, shard) in data.into_iter().enumerate() {
            shards[i].get_or_insert(shard);
        }
        for (i, shard) in parity.into_iter().enumerate() {
            shards[self.data_shards + i].get_or_insert(shard);
        }
        Ok(())
    }
}

fn shard_len(shards: &[impl AsRef<[u8]>]) -> Result<usize, FecError> {
    let len = shards
        .first()
        .map(|s| s.as_ref().len())
        .ok_or(FecError::ShardSizeMismatch)?;
    if len == 0 || shards.iter().any(|s| s.as_ref().len() != len) {
        return Err(FecError::ShardSizeMismatch);
    }
    Ok(len)
}

/// Parity shard count for a video frame: `ceil(k * pct / 100)`, at least one
/// shard whenever a nonzero percentage is configured, capped so the block
/// stays addressable.
pub fn parity_shards_for(data_shards: usize, fec_percentage: u32) -> usize {
    if fec_percentage == 0 {
        return 0;
    }
    let m = (data_shards * fec_percentage as usize).div_ceil(100).max(1);
    m.min(MAX_TOTAL_SHARDS - data_shards)
}
