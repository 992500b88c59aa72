//! Runtime configuration with TOML support.
//!
//! `RuntimeConfig` is the option bundle a layer receives at pipeline creation
//! and on every forward call. It is consumed, never mutated by the engine.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{GruError, Result};

/// Storage formats a build can execute, as reported by capability probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageSupport {
    pub fp16: bool,
    pub bf16: bool,
    pub int8: bool,
}

impl StorageSupport {
    /// Every reduced format available.
    pub const ALL: Self = Self {
        fp16: true,
        bf16: true,
        int8: true,
    };

    /// fp32 only.
    pub const FP32_ONLY: Self = Self {
        fp16: false,
        bf16: false,
        int8: false,
    };
}

/// Execution options shared by all layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker threads for parallel-for regions. 0 means one per core.
    pub num_threads: usize,
    /// Prefer 16-bit float storage for weights and activations.
    pub use_fp16_storage: bool,
    /// Prefer bfloat16 storage for weights and activations.
    pub use_bf16_storage: bool,
    /// Drop raw weights once the packed copies exist.
    pub lightmode: bool,
    /// Pin the scalar kernels regardless of the detected ISA.
    pub force_scalar: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            num_threads: 0,
            use_fp16_storage: false,
            use_bf16_storage: false,
            lightmode: true,
            force_scalar: false,
        }
    }
}

impl RuntimeConfig {
    /// Single-threaded fp32 options, handy for reference runs.
    pub fn reference() -> Self {
        Self {
            num_threads: 1,
            lightmode: false,
            ..Self::default()
        }
    }

    /// Resolve `num_threads == 0` to the machine's parallelism.
    pub fn effective_threads(&self) -> usize {
        if self.num_threads > 0 {
            return self.num_threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    /// Validate configuration values on their own.
    pub fn validate(&self) -> Result<()> {
        if self.num_threads > 1024 {
            return Err(GruError::InvalidConfig(format!(
                "num_threads={} exceeds 1024",
                self.num_threads
            )));
        }
        Ok(())
    }

    /// Reject storage preferences this build cannot execute.
    pub fn validate_against(&self, support: StorageSupport) -> Result<()> {
        self.validate()?;
        if self.use_fp16_storage && !support.fp16 {
            return Err(GruError::InvalidConfig(
                "use_fp16_storage requested but fp16 storage is not supported".into(),
            ));
        }
        if self.use_bf16_storage && !support.bf16 {
            return Err(GruError::InvalidConfig(
                "use_bf16_storage requested but bf16 storage is not supported".into(),
            ));
        }
        Ok(())
    }

    /// `validate_against`, plus the layer's own int8 request.
    pub fn validate_layer(&self, support: StorageSupport, int8_layer: bool) -> Result<()> {
        self.validate_against(support)?;
        if int8_layer && !support.int8 {
            return Err(GruError::Unsupported(
                "int8 layer requested but the int8 recurrence is not compiled in".into(),
            ));
        }
        Ok(())
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Execution options.
    pub runtime: RuntimeConfig,
    /// Logging level (debug, info, warn, error).
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeConfig::default(),
            log_level: "info".into(),
        }
    }
}

impl AppConfig {
    /// Load configuration from TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            GruError::Other(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        log::debug!("loaded config from {}", path.as_ref().display());
        Ok(config)
    }

    /// Save configuration to TOML file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.validate()?;
        let content = toml::to_string_pretty(self)
            .map_err(|e| GruError::Other(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !matches!(
            self.log_level.as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(GruError::InvalidConfig(format!(
                "unknown log_level {:?}",
                self.log_level
            )));
        }
        self.runtime.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configs_are_valid() {
        RuntimeConfig::default().validate().unwrap();
        RuntimeConfig::reference().validate().unwrap();
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn test_unsupported_storage_rejected() {
        let cfg = RuntimeConfig {
            use_bf16_storage: true,
            ..Default::default()
        };
        assert!(cfg.validate_against(StorageSupport::ALL).is_ok());
        assert!(cfg.validate_against(StorageSupport::FP32_ONLY).is_err());
    }

    #[test]
    fn test_int8_layer_needs_int8_support() {
        let cfg = RuntimeConfig::default();
        let no_int8 = StorageSupport {
            int8: false,
            ..StorageSupport::ALL
        };
        assert!(cfg.validate_layer(StorageSupport::ALL, true).is_ok());
        assert!(cfg.validate_layer(no_int8, false).is_ok());
        let err = cfg.validate_layer(no_int8, true).unwrap_err();
        assert!(matches!(err, GruError::Unsupported(_)));
    }

    #[test]
    fn test_effective_threads() {
        let cfg = RuntimeConfig {
            num_threads: 3,
            ..Default::default()
        };
        assert_eq!(cfg.effective_threads(), 3);
        assert!(RuntimeConfig::default().effective_threads() >= 1);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let cfg: AppConfig = toml::from_str(
            r#"
            log_level = "debug"
            [runtime]
            use_fp16_storage = true
            "#,
        )
        .unwrap();
        assert!(cfg.runtime.use_fp16_storage);
        assert!(cfg.runtime.lightmode);
        assert_eq!(cfg.runtime.num_threads, 0);
    }

    #[test]
    fn test_config_roundtrip() {
        let cfg = AppConfig {
            runtime: RuntimeConfig {
                num_threads: 2,
                use_bf16_storage: true,
                ..Default::default()
            },
            log_level: "warn".into(),
        };
        let tmp = tempfile::NamedTempFile::new().unwrap();
        cfg.save(tmp.path()).unwrap();
        let loaded = AppConfig::from_file(tmp.path()).unwrap();
        assert_eq!(cfg.runtime, loaded.runtime);
        assert_eq!(loaded.log_level, "warn");
    }

    #[test]
    fn test_bad_log_level() {
        let cfg = AppConfig {
            log_level: "loud".into(),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
