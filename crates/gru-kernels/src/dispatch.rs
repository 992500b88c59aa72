//! ISA and precision dispatch.
//!
//! Both choices are pure lookups over an explicit `Capabilities` value, the
//! runtime options and the element tag of the input tensor.
//!
//! ```text
//! Precision  Chosen when                                         Weights  Input/output
//! ─────────  ──────────────────────────────────────────────────  ───────  ────────────
//! Int8       layer flagged int8 (int8 compiled in)               i8       f32/f16/bf16
//! F16        input f16 + use_fp16_storage + fp16 storage         f16      f16
//! Bf16       input bf16 + use_bf16_storage + bf16 storage        bf16     bf16
//! F32        input f32                                           f32      f32
//! ```
//!
//! Anything else is `GruError::Unsupported`. There is no silent fallback to
//! a different precision.

use gru_core::{GruError, Result, RuntimeConfig};
use gru_tensor::ElemType;

use crate::cpu::Capabilities;

/// Instruction set the recurrence is instantiated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Isa {
    Scalar,
    Portable4,
    #[cfg(target_arch = "x86_64")]
    Sse2,
    #[cfg(target_arch = "aarch64")]
    Neon,
}

impl Isa {
    /// Widest first.
    pub const PRIORITY: &'static [Isa] = &[
        #[cfg(target_arch = "aarch64")]
        Isa::Neon,
        #[cfg(target_arch = "x86_64")]
        Isa::Sse2,
        Isa::Portable4,
        Isa::Scalar,
    ];

    pub fn lanes(self) -> usize {
        crate::with_batch!(self, B => <B as crate::simd::VectorBatch>::LANES)
    }

    pub fn name(self) -> &'static str {
        crate::with_batch!(self, B => <B as crate::simd::VectorBatch>::NAME)
    }
}

impl std::fmt::Display for Isa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Evaluate `body` with the type alias `B` bound to the batch type of `isa`.
///
/// ```ignore
/// let lanes = with_batch!(isa, B => B::LANES);
/// ```
#[macro_export]
macro_rules! with_batch {
    ($isa:expr, $B:ident => $body:expr) => {
        match $isa {
            $crate::dispatch::Isa::Scalar => {
                type $B = $crate::simd::ScalarBatch;
                $body
            }
            $crate::dispatch::Isa::Portable4 => {
                type $B = $crate::simd::F32x4;
                $body
            }
            #[cfg(target_arch = "x86_64")]
            $crate::dispatch::Isa::Sse2 => {
                type $B = $crate::simd::Sse2F32x4;
                $body
            }
            #[cfg(target_arch = "aarch64")]
            $crate::dispatch::Isa::Neon => {
                type $B = $crate::simd::NeonF32x4;
                $body
            }
        }
    };
}

/// Numeric path of the recurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Precision {
    F32,
    F16,
    Bf16,
    Int8,
}

impl Precision {
    pub fn name(self) -> &'static str {
        match self {
            Precision::F32 => "fp32",
            Precision::F16 => "fp16",
            Precision::Bf16 => "bf16",
            Precision::Int8 => "int8",
        }
    }
}

impl std::fmt::Display for Precision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Storage the pipeline packs weights for, decided once at
/// `create_pipeline` time: int8 > fp16 > bf16 > fp32.
pub fn pipeline_precision(
    caps: &Capabilities,
    opt: &RuntimeConfig,
    int8_layer: bool,
) -> Result<Precision> {
    opt.validate_layer(caps.storage_support(), int8_layer)?;
    if int8_layer {
        return Ok(Precision::Int8);
    }
    if opt.use_fp16_storage && caps.fp16_storage {
        return Ok(Precision::F16);
    }
    if opt.use_bf16_storage && caps.bf16_storage {
        return Ok(Precision::Bf16);
    }
    Ok(Precision::F32)
}

/// Precision for one forward call given the input's element tag.
pub fn select_precision(
    caps: &Capabilities,
    opt: &RuntimeConfig,
    int8_layer: bool,
    input: ElemType,
) -> Result<Precision> {
    if int8_layer {
        if !caps.storage_support().int8 {
            return Err(GruError::Unsupported("int8 recurrence not compiled in".into()));
        }
        if !input.is_float() {
            return Err(GruError::Unsupported(
                "int8 layer expects a float input sequence".into(),
            ));
        }
        return Ok(Precision::Int8);
    }

    match input {
        ElemType::F16 if opt.use_fp16_storage && caps.fp16_storage => Ok(Precision::F16),
        ElemType::Bf16 if opt.use_bf16_storage && caps.bf16_storage => Ok(Precision::Bf16),
        ElemType::F32 => Ok(Precision::F32),
        other => Err(GruError::Unsupported(format!(
            "no recurrence for {} input (fp16_storage={}, bf16_storage={})",
            other, opt.use_fp16_storage, opt.use_bf16_storage
        ))),
    }
}
