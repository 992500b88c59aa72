//! The GRU layer and everything around one forward call.
//!
//! - `config`: layer parameters and direction mode
//! - `weights`: raw weights and the on-disk weight file
//! - `context`: runtime options, capabilities, worker pool, allocators
//! - `workspace`: per-call scratch
//! - `direction`: forward / reverse / bidirectional orchestration
//! - `gru`: the layer itself

pub mod config;
pub mod context;
pub mod direction;
pub mod gru;
pub mod weights;
pub mod workspace;

pub use config::{Direction, GruConfig};
pub use context::ExecContext;
pub use gru::{reference_output, Gru, GruOutput, PackedWeights, Pipeline};
pub use weights::{GruWeights, GRU_MAGIC, GRU_VERSION};
pub use workspace::Workspace;

pub use gru_core::{status_code, GruError, Result, RuntimeConfig};
