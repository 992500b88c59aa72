//! CPU capability probing.
//!
//! Detection happens once, in `Capabilities::detect()`. The resulting struct
//! is passed explicitly to dispatch; nothing here caches global state.

use gru_core::StorageSupport;

use crate::dispatch::Isa;

/// Check if SSE2 is available (x86_64 only).
#[cfg(target_arch = "x86_64")]
pub fn has_sse2() -> bool {
    std::arch::is_x86_feature_detected!("sse2")
}

#[cfg(not(target_arch = "x86_64"))]
pub fn has_sse2() -> bool {
    false
}

/// Check if NEON is available (always true on AArch64).
#[cfg(target_arch = "aarch64")]
pub fn has_neon() -> bool {
    std::arch::is_aarch64_feature_detected!("neon")
}

#[cfg(not(target_arch = "aarch64"))]
pub fn has_neon() -> bool {
    false
}

/// What this build and this CPU can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub neon: bool,
    pub sse2: bool,
    /// f16 weight/activation storage compiled in.
    pub fp16_storage: bool,
    /// bf16 weight/activation storage compiled in.
    pub bf16_storage: bool,
    /// int8 recurrence compiled in.
    pub int8: bool,
}

impl Capabilities {
    /// Probe the running CPU.
    pub fn detect() -> Self {
        let caps = Self {
            neon: has_neon(),
            sse2: has_sse2(),
            ..Self::scalar()
        };
        log::info!(
            "CPU capabilities: neon={} sse2={} fp16_storage={} bf16_storage={} int8={} -> {}",
            caps.neon,
            caps.sse2,
            caps.fp16_storage,
            caps.bf16_storage,
            caps.int8,
            caps.best_isa().name()
        );
        caps
    }

    /// No vector unit; storage formats as compiled.
    pub fn scalar() -> Self {
        Self {
            neon: false,
            sse2: false,
            fp16_storage: cfg!(feature = "fp16"),
            bf16_storage: cfg!(feature = "bf16"),
            int8: cfg!(feature = "int8"),
        }
    }

    pub fn supports(&self, isa: Isa) -> bool {
        match isa {
            Isa::Scalar | Isa::Portable4 => true,
            #[cfg(target_arch = "x86_64")]
            Isa::Sse2 => self.sse2,
            #[cfg(target_arch = "aarch64")]
            Isa::Neon => self.neon,
        }
    }

    /// Widest native ISA, falling back to scalar. `Portable4` is never
    /// picked here; it runs 4-lane layouts on machines without a vector unit.
    pub fn best_isa(&self) -> Isa {
        Isa::PRIORITY
            .iter()
            .copied()
            .find(|&isa| isa != Isa::Portable4 && self.supports(isa))
            .unwrap_or(Isa::Scalar)
    }

    /// ISA for a pipeline; `force_scalar` pins the scalar batch.
    pub fn isa(&self, force_scalar: bool) -> Isa {
        if force_scalar {
            Isa::Scalar
        } else {
            self.best_isa()
        }
    }

    /// Every ISA this machine can run, widest first.
    pub fn available_isas(&self) -> Vec<Isa> {
        Isa::PRIORITY
            .iter()
            .copied()
            .filter(|&isa| self.supports(isa))
            .collect()
    }

    pub fn storage_support(&self) -> StorageSupport {
        StorageSupport {
            fp16: self.fp16_storage,
            bf16: self.bf16_storage,
            int8: self.int8,
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::detect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_caps() {
        let caps = Capabilities::scalar();
        assert_eq!(caps.best_isa(), Isa::Scalar);
        assert_eq!(caps.isa(false), Isa::Scalar);
        assert!(caps.supports(Isa::Portable4));
    }

    #[test]
    fn test_detect_is_consistent() {
        let caps = Capabilities::detect();
        assert!(caps.supports(caps.best_isa()));
        assert_eq!(caps.isa(true), Isa::Scalar);
        let isas = caps.available_isas();
        assert!(isas.contains(&Isa::Scalar));
        assert!(isas.contains(&Isa::Portable4));
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_sse2_baseline() {
        assert!(has_sse2());
        assert_eq!(Capabilities::detect().best_isa(), Isa::Sse2);
    }

    #[test]
    fn test_storage_support_follows_features() {
        let s = Capabilities::scalar().storage_support();
        assert_eq!(s.fp16, cfg!(feature = "fp16"));
        assert_eq!(s.bf16, cfg!(feature = "bf16"));
        assert_eq!(s.int8, cfg!(feature = "int8"));
    }
}
