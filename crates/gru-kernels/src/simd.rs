//! Fixed-width f32 batches.
//!
//! The recurrence is written once against `VectorBatch`; each ISA supplies a
//! batch type whose `LANES` matches the packed record width. The scalar batch
//! (`LANES = 1`) is both the portable fallback and the type used for the
//! tail units of every layout.
//!
//! ```text
//! Type         LANES  Requirement       Platform
//! ───────────  ─────  ────────────────  ─────────
//! NeonF32x4    4      AArch64 NEON      aarch64
//! Sse2F32x4    4      SSE2 (baseline)   x86_64
//! F32x4        4      Portable          Any
//! ScalarBatch  1      Portable          Any
//! ```
//!
//! Activations are applied lane by lane through the same scalar functions on
//! every ISA, so the only cross-ISA difference is the accumulation order of
//! fused multiply-adds.

use gru_tensor::verify::sigmoid;

/// Widest batch any ISA provides.
pub const MAX_LANES: usize = 8;

pub trait VectorBatch: Copy + Send + Sync + 'static {
    const LANES: usize;
    const NAME: &'static str;

    fn splat(v: f32) -> Self;

    /// Load `LANES` values from the front of `src`.
    fn load(src: &[f32]) -> Self;

    /// Store `LANES` values to the front of `dst`.
    fn store(self, dst: &mut [f32]);

    fn add(self, other: Self) -> Self;
    fn sub(self, other: Self) -> Self;
    fn mul(self, other: Self) -> Self;

    /// `self + a * b`
    fn mul_add(self, a: Self, b: Self) -> Self;

    #[inline]
    fn map(self, f: impl Fn(f32) -> f32) -> Self {
        let mut buf = [0.0f32; MAX_LANES];
        self.store(&mut buf[..Self::LANES]);
        for v in &mut buf[..Self::LANES] {
            *v = f(*v);
        }
        Self::load(&buf[..Self::LANES])
    }

    #[inline]
    fn sigmoid(self) -> Self {
        self.map(sigmoid)
    }

    #[inline]
    fn tanh(self) -> Self {
        self.map(f32::tanh)
    }
}

// ============================================================
// Scalar
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalarBatch(pub f32);

impl VectorBatch for ScalarBatch {
    const LANES: usize = 1;
    const NAME: &'static str = "scalar";

    #[inline(always)]
    fn splat(v: f32) -> Self {
        ScalarBatch(v)
    }

    #[inline(always)]
    fn load(src: &[f32]) -> Self {
        ScalarBatch(src[0])
    }

    #[inline(always)]
    fn store(self, dst: &mut [f32]) {
        dst[0] = self.0;
    }

    #[inline(always)]
    fn add(self, other: Self) -> Self {
        ScalarBatch(self.0 + other.0)
    }

    #[inline(always)]
    fn sub(self, other: Self) -> Self {
        ScalarBatch(self.0 - other.0)
    }

    #[inline(always)]
    fn mul(self, other: Self) -> Self {
        ScalarBatch(self.0 * other.0)
    }

    #[inline(always)]
    fn mul_add(self, a: Self, b: Self) -> Self {
        ScalarBatch(self.0 + a.0 * b.0)
    }

    #[inline(always)]
    fn map(self, f: impl Fn(f32) -> f32) -> Self {
        ScalarBatch(f(self.0))
    }
}

// ============================================================
// Portable 4-lane
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct F32x4(pub [f32; 4]);

impl F32x4 {
    #[inline(always)]
    fn zip(self, other: Self, f: impl Fn(f32, f32) -> f32) -> Self {
        let (a, b) = (self.0, other.0);
        F32x4([f(a[0], b[0]), f(a[1], b[1]), f(a[2], b[2]), f(a[3], b[3])])
    }
}

impl VectorBatch for F32x4 {
    const LANES: usize = 4;
    const NAME: &'static str = "portable4";

    #[inline(always)]
    fn splat(v: f32) -> Self {
        F32x4([v; 4])
    }

    #[inline(always)]
    fn load(src: &[f32]) -> Self {
        F32x4([src[0], src[1], src[2], src[3]])
    }

    #[inline(always)]
    fn store(self, dst: &mut [f32]) {
        dst[..4].copy_from_slice(&self.0);
    }

    #[inline(always)]
    fn add(self, other: Self) -> Self {
        self.zip(other, |a, b| a + b)
    }

    #[inline(always)]
    fn sub(self, other: Self) -> Self {
        self.zip(other, |a, b| a - b)
    }

    #[inline(always)]
    fn mul(self, other: Self) -> Self {
        self.zip(other, |a, b| a * b)
    }

    #[inline(always)]
    fn mul_add(self, a: Self, b: Self) -> Self {
        self.add(a.mul(b))
    }
}

// ============================================================
// SSE2 (x86_64 baseline)
// ============================================================

#[cfg(target_arch = "x86_64")]
pub use sse2::Sse2F32x4;

#[cfg(target_arch = "x86_64")]
mod sse2 {
    use std::arch::x86_64::*;

    use super::VectorBatch;

    #[derive(Debug, Clone, Copy)]
    pub struct Sse2F32x4(__m128);

    // SAFETY (all blocks below): SSE2 is part of the x86_64 baseline, and
    // every load/store is preceded by a bounds-checked 4-element slice.
    impl VectorBatch for Sse2F32x4 {
        const LANES: usize = 4;
        const NAME: &'static str = "sse2";

        #[inline(always)]
        fn splat(v: f32) -> Self {
            Sse2F32x4(unsafe { _mm_set1_ps(v) })
        }

        #[inline(always)]
        fn load(src: &[f32]) -> Self {
            let src = &src[..4];
            Sse2F32x4(unsafe { _mm_loadu_ps(src.as_ptr()) })
        }

        #[inline(always)]
        fn store(self, dst: &mut [f32]) {
            let dst = &mut dst[..4];
            unsafe { _mm_storeu_ps(dst.as_mut_ptr(), self.0) }
        }

        #[inline(always)]
        fn add(self, other: Self) -> Self {
            Sse2F32x4(unsafe { _mm_add_ps(self.0, other.0) })
        }

        #[inline(always)]
        fn sub(self, other: Self) -> Self {
            Sse2F32x4(unsafe { _mm_sub_ps(self.0, other.0) })
        }

        #[inline(always)]
        fn mul(self, other: Self) -> Self {
            Sse2F32x4(unsafe { _mm_mul_ps(self.0, other.0) })
        }

        #[inline(always)]
        fn mul_add(self, a: Self, b: Self) -> Self {
            // No FMA in the baseline: separate multiply and add.
            Sse2F32x4(unsafe { _mm_add_ps(self.0, _mm_mul_ps(a.0, b.0)) })
        }
    }
}

// ============================================================
// NEON (aarch64 baseline)
// ============================================================

#[cfg(target_arch = "aarch64")]
pub use neon::NeonF32x4;

#[cfg(target_arch = "aarch64")]
mod neon {
    use std::arch::aarch64::*;

    use super::VectorBatch;

    #[derive(Debug, Clone, Copy)]
    pub struct NeonF32x4(float32x4_t);

    // SAFETY (all blocks below): NEON is mandatory on AArch64, and every
    // load/store is preceded by a bounds-checked 4-element slice.
    impl VectorBatch for NeonF32x4 {
        const LANES: usize = 4;
        const NAME: &'static str = "neon";

        #[inline(always)]
        fn splat(v: f32) -> Self {
            NeonF32x4(unsafe { vdupq_n_f32(v) })
        }

        #[inline(always)]
        fn load(src: &[f32]) -> Self {
            let src = &src[..4];
            NeonF32x4(unsafe { vld1q_f32(src.as_ptr()) })
        }

        #[inline(always)]
        fn store(self, dst: &mut [f32]) {
            let dst = &mut dst[..4];
            unsafe { vst1q_f32(dst.as_mut_ptr(), self.0) }
        }

        #[inline(always)]
        fn add(self, other: Self) -> Self {
            NeonF32x4(unsafe { vaddq_f32(self.0, other.0) })
        }

        #[inline(always)]
        fn sub(self, other: Self) -> Self {
            NeonF32x4(unsafe { vsubq_f32(self.0, other.0) })
        }

        #[inline(always)]
        fn mul(self, other: Self) -> Self {
            NeonF32x4(unsafe { vmulq_f32(self.0, other.0) })
        }

        #[inline(always)]
        fn mul_add(self, a: Self, b: Self) -> Self {
            NeonF32x4(unsafe { vfmaq_f32(self.0, a.0, b.0) })
        }
    }
}
