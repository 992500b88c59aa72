//! Execution context handed to every pipeline and forward call.

use std::fmt;
use std::sync::Arc;

use rayon::{ThreadPool, ThreadPoolBuilder};

use gru_core::{GruError, Result, RuntimeConfig};
use gru_kernels::{Capabilities, Isa};
use gru_tensor::aligned::{system, Allocator};

/// Runtime options, capabilities, worker pool and allocators.
///
/// The context is consumed by reference; layers never own it.
#[derive(Clone)]
pub struct ExecContext {
    pub config: RuntimeConfig,
    pub caps: Capabilities,
    pool: Arc<ThreadPool>,
    /// Scratch that dies with the call.
    pub workspace_alloc: Arc<dyn Allocator>,
    /// Packed weights and tensors handed back to the caller.
    pub blob_alloc: Arc<dyn Allocator>,
}

impl ExecContext {
    /// Detect capabilities and build a pool from `config`.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        Self::with_capabilities(config, Capabilities::detect())
    }

    /// Use explicit capabilities instead of probing the CPU.
    pub fn with_capabilities(config: RuntimeConfig, caps: Capabilities) -> Result<Self> {
        config.validate_against(caps.storage_support())?;
        let threads = config.effective_threads();
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("gru-worker-{}", i))
            .build()
            .map_err(|e| GruError::Other(format!("failed to build thread pool: {}", e)))?;
        log::debug!("execution context: {} threads, isa={}", threads, caps.isa(config.force_scalar));
        Ok(Self {
            config,
            caps,
            pool: Arc::new(pool),
            workspace_alloc: system(),
            blob_alloc: system(),
        })
    }

    /// Replace both allocators.
    pub fn with_allocators(
        mut self,
        workspace: Arc<dyn Allocator>,
        blob: Arc<dyn Allocator>,
    ) -> Self {
        self.workspace_alloc = workspace;
        self.blob_alloc = blob;
        self
    }

    /// ISA pipelines created under this context are packed for.
    pub fn isa(&self) -> Isa {
        self.caps.isa(self.config.force_scalar)
    }

    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Run `f` inside the worker pool.
    pub fn install<R, F>(&self, f: F) -> R
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        self.pool.install(f)
    }
}

impl fmt::Debug for ExecContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecContext")
            .field("config", &self.config)
            .field("caps", &self.caps)
            .field("threads", &self.pool.current_num_threads())
            .field("workspace_alloc", &self.workspace_alloc)
            .field("blob_alloc", &self.blob_alloc)
            .finish()
    }
}
