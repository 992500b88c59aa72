//! Symmetric int8 quantization.
//!
//! Dynamic (per call): every timestep of an input sequence gets its own
//! scale, so one loud step never crushes the range of a quiet one:
//!   absmax  = max(|x_t|)
//!   scale   = 127 / absmax
//!   descale = absmax / 127
//!   q       = clamp(round(x * scale), -127, 127)
//!
//! Static (pipeline creation): the same formula per weight row, see `pack`.
//!
//! An all-zero slice has no meaningful scale. It gets scale = descale = 0,
//! which quantizes to zeros and dequantizes back to zeros.

use std::sync::Arc;

use half::{bf16, f16};

use gru_core::{GruError, Result};

use crate::aligned::{AlignedVec, Allocator};
use crate::codec::{ElemType, Element};
use crate::tensor::Tensor;

/// Largest magnitude of a quantized value.
pub const INT8_MAX: f32 = 127.0;

/// max(|x|), ignoring NaN.
#[inline]
pub fn absmax(x: &[f32]) -> f32 {
    x.iter().fold(0.0f32, |m, v| m.max(v.abs()))
}

/// (scale, descale) for a slice whose absmax is `absmax`.
#[inline]
pub fn scale_pair(absmax: f32) -> (f32, f32) {
    let scale = INT8_MAX / absmax;
    if absmax > 0.0 && absmax.is_finite() && scale.is_finite() {
        (scale, absmax / INT8_MAX)
    } else {
        (0.0, 0.0)
    }
}

/// Quantize one value with a precomputed scale.
#[inline(always)]
pub fn quantize_value(v: f32, scale: f32) -> i8 {
    (v * scale).round().clamp(-INT8_MAX, INT8_MAX) as i8
}

/// Quantize `x` into `out` with a fixed scale.
pub fn quantize_into(x: &[f32], scale: f32, out: &mut [i8]) {
    assert_eq!(x.len(), out.len(), "quantize_into: length mismatch");
    for (dst, &v) in out.iter_mut().zip(x) {
        *dst = quantize_value(v, scale);
    }
}

/// Dynamically quantize one vector. Returns its descale.
pub fn quantize_dynamic(x: &[f32], out: &mut [i8]) -> f32 {
    let (scale, descale) = scale_pair(absmax(x));
    quantize_into(x, scale, out);
    descale
}

/// Per-timestep quantized copy of a `T x size` sequence.
#[derive(Debug)]
pub struct QuantizedSequence {
    /// `T * size` quantized values, row-major by timestep.
    pub data: AlignedVec<i8>,
    /// `127 / absmax` per timestep.
    pub scales: AlignedVec<f32>,
    /// `absmax / 127` per timestep.
    pub descales: AlignedVec<f32>,
    pub size: usize,
    pub steps: usize,
}

impl QuantizedSequence {
    /// Quantized features of timestep `t`.
    pub fn step(&self, t: usize) -> &[i8] {
        &self.data[t * self.size..(t + 1) * self.size]
    }

    pub fn descale(&self, t: usize) -> f32 {
        self.descales[t]
    }

    /// Approximate reconstruction of timestep `t`.
    pub fn dequantize_step(&self, t: usize) -> Vec<f32> {
        let d = self.descales[t];
        self.step(t).iter().map(|&q| q as f32 * d).collect()
    }
}

fn quantize_rows<E: Element>(
    src: &[E],
    size: usize,
    steps: usize,
    alloc: &Arc<dyn Allocator>,
) -> Result<QuantizedSequence> {
    let mut data = AlignedVec::<i8>::try_zeroed(size * steps, alloc)?;
    let mut scales = AlignedVec::<f32>::try_zeroed(steps, alloc)?;
    let mut descales = AlignedVec::<f32>::try_zeroed(steps, alloc)?;

    let mut row = AlignedVec::<f32>::try_zeroed(size, alloc)?;
    for t in 0..steps {
        E::decode_into(&src[t * size..(t + 1) * size], &mut row[..]);
        let (scale, descale) = scale_pair(absmax(&row[..]));
        scales[t] = scale;
        descales[t] = descale;
        quantize_into(&row[..], scale, &mut data[t * size..(t + 1) * size]);
    }

    Ok(QuantizedSequence {
        data,
        scales,
        descales,
        size,
        steps,
    })
}

/// Quantize a 2-D sequence tensor (`w` features, `h` timesteps) stored as
/// f32, f16 or bf16.
pub fn dynamic_quantize(seq: &Tensor, alloc: &Arc<dyn Allocator>) -> Result<QuantizedSequence> {
    let (size, steps) = (seq.w(), seq.h());
    let q = match seq.elem() {
        ElemType::F32 => quantize_rows(seq.data::<f32>()?, size, steps, alloc)?,
        ElemType::F16 => quantize_rows(seq.data::<f16>()?, size, steps, alloc)?,
        ElemType::Bf16 => quantize_rows(seq.data::<bf16>()?, size, steps, alloc)?,
        ElemType::I8 => {
            return Err(GruError::Unsupported(
                "sequence is already quantized".into(),
            ))
        }
    };
    log::trace!("dynamic quantize: {} steps x {} features", steps, size);
    Ok(q)
}
