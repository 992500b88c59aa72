// File format (all little-endian):
//   Header: [magic:u32 = "GRU1"][version:u32 = 1][num_output:u32][input_size:u32][direction:u32]
//   Per direction: weight_xc f32[3H*I], bias_c f32[4H], weight_hc f32[3H*H]
//
// Matrices are row-major and gate-major (R rows, then U, then N). Bias rows
// are R, U, WN, BN.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use gru_core::{GruError, Result};
use gru_tensor::pack::RawDirection;
use gru_tensor::{ElemType, Tensor};

use crate::config::{Direction, GruConfig};

/// Magic number: "GRU1" in little-endian
pub const GRU_MAGIC: u32 = u32::from_le_bytes(*b"GRU1");
pub const GRU_VERSION: u32 = 1;

/// Raw GRU weights, one channel per direction.
///
/// - `weight_xc`: `w = I`, `h = 3H`, `c = dirs`
/// - `bias_c`:    `w = H`, `h = 4`,  `c = dirs`
/// - `weight_hc`: `w = H`, `h = 3H`, `c = dirs`
#[derive(Debug, Clone)]
pub struct GruWeights {
    config: GruConfig,
    pub weight_xc: Tensor,
    pub bias_c: Tensor,
    pub weight_hc: Tensor,
}

impl GruWeights {
    /// Build from flat f32 blocks covering every direction, direction-major.
    pub fn from_f32(
        config: &GruConfig,
        weight_xc: &[f32],
        bias_c: &[f32],
        weight_hc: &[f32],
    ) -> Result<Self> {
        config.validate()?;
        let (h, i, dirs) = (config.num_output, config.input_size, config.num_directions());
        let weights = Self {
            config: config.clone(),
            weight_xc: Tensor::from_f32_3d(i, 3 * h, dirs, weight_xc)?,
            bias_c: Tensor::from_f32_3d(h, 4, dirs, bias_c)?,
            weight_hc: Tensor::from_f32_3d(h, 3 * h, dirs, weight_hc)?,
        };
        weights.validate()?;
        Ok(weights)
    }

    /// Deterministic pseudo-random weights, for demos and benchmarks.
    pub fn synthetic(config: &GruConfig, seed: u32) -> Result<Self> {
        let dirs = config.num_directions();
        let gen = |n: usize, salt: u32, amp: f32| -> Vec<f32> {
            (0..n as u32)
                .map(|k| {
                    let v = k.wrapping_add(seed).wrapping_add(salt).wrapping_mul(2654435761) >> 16;
                    ((v % 200) as f32 / 100.0 - 1.0) * amp
                })
                .collect()
        };
        Self::from_f32(
            config,
            &gen(config.weight_xc_len() * dirs, 0x1000, 0.5),
            &gen(config.bias_len() * dirs, 0x2000, 0.1),
            &gen(config.weight_hc_len() * dirs, 0x3000, 0.5),
        )
    }

    pub fn config(&self) -> &GruConfig {
        &self.config
    }

    /// Check tensor shapes and element types against the config.
    pub fn validate(&self) -> Result<()> {
        let (h, i, dirs) = (
            self.config.num_output,
            self.config.input_size,
            self.config.num_directions(),
        );
        let expect = [
            (&self.weight_xc, [i, 3 * h, dirs]),
            (&self.bias_c, [h, 4, dirs]),
            (&self.weight_hc, [h, 3 * h, dirs]),
        ];
        for (t, shape) in expect {
            if t.shape() != shape {
                return Err(GruError::shape(&shape, &t.shape()));
            }
            if t.elem() != ElemType::F32 {
                return Err(GruError::Unsupported(format!(
                    "raw weights must be f32, got {}",
                    t.elem()
                )));
            }
        }
        Ok(())
    }

    /// Whether these weights fit a layer configured as `layer` (the int8
    /// flag is a runtime choice and is not compared).
    pub fn matches(&self, layer: &GruConfig) -> bool {
        self.config.num_output == layer.num_output
            && self.config.input_size == layer.input_size
            && self.config.direction == layer.direction
    }

    /// Borrowed raw blocks of direction `d`.
    pub fn direction(&self, d: usize) -> Result<RawDirection<'_>> {
        Ok(RawDirection {
            weight_xc: self.weight_xc.channel::<f32>(d)?,
            bias_c: self.bias_c.channel::<f32>(d)?,
            weight_hc: self.weight_hc.channel::<f32>(d)?,
        })
    }

    pub fn directions(&self) -> Result<Vec<RawDirection<'_>>> {
        (0..self.config.num_directions())
            .map(|d| self.direction(d))
            .collect()
    }

    pub fn size_bytes(&self) -> usize {
        (self.weight_xc.total() + self.bias_c.total() + self.weight_hc.total())
            * std::mem::size_of::<f32>()
    }

    /// Read a weight file from any reader.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let magic = read_u32(r)?;
        if magic != GRU_MAGIC {
            return Err(invalid(format!("invalid GRU magic: {:#010x}", magic)));
        }
        let version = read_u32(r)?;
        if version != GRU_VERSION {
            return Err(invalid(format!("unsupported GRU version: {}", version)));
        }
        let num_output = read_u32(r)? as usize;
        let input_size = read_u32(r)? as usize;
        let direction = Direction::from_code(read_u32(r)?)?;

        let config = GruConfig::new(num_output, input_size, direction);
        config.validate()?;

        // Blocks grow as bytes arrive, never from the header's sizes alone.
        let (mut xc, mut bias, mut hc) = (Vec::new(), Vec::new(), Vec::new());
        for _ in 0..config.num_directions() {
            read_block(r, &mut xc, config.weight_xc_len())?;
            read_block(r, &mut bias, config.bias_len())?;
            read_block(r, &mut hc, config.weight_hc_len())?;
        }

        log::debug!(
            "read GRU weights: H={} I={} direction={:?}",
            num_output,
            input_size,
            direction
        );
        Self::from_f32(&config, &xc, &bias, &hc)
    }

    /// Write the weight file format to any writer.
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        self.validate()?;
        w.write_all(&GRU_MAGIC.to_le_bytes())?;
        w.write_all(&GRU_VERSION.to_le_bytes())?;
        w.write_all(&(self.config.num_output as u32).to_le_bytes())?;
        w.write_all(&(self.config.input_size as u32).to_le_bytes())?;
        w.write_all(&self.config.direction.code().to_le_bytes())?;
        for raw in self.directions()? {
            write_block(w, raw.weight_xc)?;
            write_block(w, raw.bias_c)?;
            write_block(w, raw.weight_hc)?;
        }
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        Self::read_from(&mut reader)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.write_to(&mut writer)?;
        writer.flush()?;
        Ok(())
    }
}

fn invalid(msg: String) -> GruError {
    GruError::Io(io::Error::new(io::ErrorKind::InvalidData, msg))
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut buf4 = [0u8; 4];
    r.read_exact(&mut buf4)?;
    Ok(u32::from_le_bytes(buf4))
}

/// Floats decoded per read.
const READ_CHUNK: usize = 1 << 16;

/// Append `len` little-endian floats from `r` to `dst`.
fn read_block<R: Read>(r: &mut R, dst: &mut Vec<f32>, len: usize) -> Result<()> {
    let mut buf = vec![0u8; len.min(READ_CHUNK) * 4];
    let mut left = len;
    while left > 0 {
        let n = left.min(READ_CHUNK);
        let bytes = &mut buf[..n * 4];
        r.read_exact(bytes)?;
        dst.try_reserve(n).map_err(|_| GruError::OutOfMemory {
            bytes: (dst.len() + n) * std::mem::size_of::<f32>(),
        })?;
        dst.extend(
            bytes
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        );
        left -= n;
    }
    Ok(())
}

fn write_block<W: Write>(w: &mut W, src: &[f32]) -> Result<()> {
    let mut buf = Vec::with_capacity(src.len() * 4);
    for v in src {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    w.write_all(&buf)?;
    Ok(())
}
