//! Precision codec: reduced-precision storage <-> f32 working values.
//!
//! Storage formats:
//!   F32  — IEEE binary32, stored as is
//!   F16  — IEEE binary16, round-to-nearest-even on encode
//!   Bf16 — upper 16 bits of binary32, round-to-nearest-even on encode
//!   I8   — symmetric quantized, needs an external descale (see `quant`)
//!
//! All arithmetic happens on f32. Reduced formats are decoded right before
//! use and encoded right after.

use half::slice::HalfFloatSliceExt;
use half::{bf16, f16};
use serde::{Deserialize, Serialize};

use crate::aligned::Zeroable;

/// Storage format tag carried by every tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElemType {
    F32,
    F16,
    Bf16,
    I8,
}

impl ElemType {
    /// Bytes per scalar element.
    pub const fn elemsize(self) -> usize {
        match self {
            ElemType::F32 => 4,
            ElemType::F16 | ElemType::Bf16 => 2,
            ElemType::I8 => 1,
        }
    }

    /// Bits per scalar element.
    pub const fn elembits(self) -> usize {
        self.elemsize() * 8
    }

    pub const fn name(self) -> &'static str {
        match self {
            ElemType::F32 => "f32",
            ElemType::F16 => "f16",
            ElemType::Bf16 => "bf16",
            ElemType::I8 => "i8",
        }
    }

    /// True for formats the float kernels can decode without side tables.
    pub const fn is_float(self) -> bool {
        !matches!(self, ElemType::I8)
    }
}

impl std::fmt::Display for ElemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A float storage element the recurrence can read and write.
pub trait Element: Zeroable + std::fmt::Debug + PartialEq {
    const ELEM: ElemType;

    fn to_f32(self) -> f32;
    fn from_f32(v: f32) -> Self;

    /// Decode a run of stored values. Lengths must match.
    #[inline]
    fn decode_into(src: &[Self], dst: &mut [f32]) {
        assert_eq!(src.len(), dst.len(), "decode_into: length mismatch");
        for (d, &s) in dst.iter_mut().zip(src) {
            *d = s.to_f32();
        }
    }

    /// Encode a run of f32 values. Lengths must match.
    #[inline]
    fn encode_from(src: &[f32], dst: &mut [Self]) {
        assert_eq!(src.len(), dst.len(), "encode_from: length mismatch");
        for (d, &s) in dst.iter_mut().zip(src) {
            *d = Self::from_f32(s);
        }
    }
}

impl Element for f32 {
    const ELEM: ElemType = ElemType::F32;

    #[inline(always)]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline(always)]
    fn from_f32(v: f32) -> Self {
        v
    }

    #[inline]
    fn decode_into(src: &[Self], dst: &mut [f32]) {
        dst.copy_from_slice(src);
    }

    #[inline]
    fn encode_from(src: &[f32], dst: &mut [Self]) {
        dst.copy_from_slice(src);
    }
}

impl Element for f16 {
    const ELEM: ElemType = ElemType::F16;

    #[inline(always)]
    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }

    #[inline(always)]
    fn from_f32(v: f32) -> Self {
        f16::from_f32(v)
    }

    #[inline]
    fn decode_into(src: &[Self], dst: &mut [f32]) {
        src.convert_to_f32_slice(dst);
    }

    #[inline]
    fn encode_from(src: &[f32], dst: &mut [Self]) {
        dst.convert_from_f32_slice(src);
    }
}

impl Element for bf16 {
    const ELEM: ElemType = ElemType::Bf16;

    #[inline(always)]
    fn to_f32(self) -> f32 {
        bf16::to_f32(self)
    }

    #[inline(always)]
    fn from_f32(v: f32) -> Self {
        bf16::from_f32(v)
    }

    #[inline]
    fn decode_into(src: &[Self], dst: &mut [f32]) {
        src.convert_to_f32_slice(dst);
    }

    #[inline]
    fn encode_from(src: &[f32], dst: &mut [Self]) {
        dst.convert_from_f32_slice(src);
    }
}

/// binary32 -> binary16 bit pattern.
#[inline]
pub fn float32_to_float16(v: f32) -> u16 {
    f16::from_f32(v).to_bits()
}

/// binary16 bit pattern -> binary32.
#[inline]
pub fn float16_to_float32(bits: u16) -> f32 {
    f16::from_bits(bits).to_f32()
}

/// binary32 -> bfloat16 bit pattern.
#[inline]
pub fn float32_to_bfloat16(v: f32) -> u16 {
    bf16::from_f32(v).to_bits()
}

/// bfloat16 bit pattern -> binary32. Exact: bf16 is a truncated binary32.
#[inline]
pub fn bfloat16_to_float32(bits: u16) -> f32 {
    f32::from_bits((bits as u32) << 16)
}

/// Decode a whole slice into a fresh Vec.
pub fn decode_vec<E: Element>(src: &[E]) -> Vec<f32> {
    let mut out = vec![0.0f32; src.len()];
    E::decode_into(src, &mut out);
    out
}

/// Encode a whole slice into a fresh Vec.
pub fn encode_vec<E: Element>(src: &[f32]) -> Vec<E> {
    let mut out = vec![E::from_f32(0.0); src.len()];
    E::encode_from(src, &mut out);
    out
}
