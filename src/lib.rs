//! grurt: CPU inference for GRU recurrent layers.
//!
//! Workspace crates:
//! - `gru_core`: errors, status codes, runtime options
//! - `gru_tensor`: aligned tensors, fp16/bf16 codec, weight packing, int8 quantization
//! - `gru_kernels`: vector-batch recurrence kernels with ISA and precision dispatch
//! - `gru_model`: the GRU layer, direction orchestration and the weight file
//!
//! ```no_run
//! use grurt::{Direction, ExecContext, Gru, GruConfig, GruWeights, RuntimeConfig, Tensor};
//!
//! let config = GruConfig::new(64, 32, Direction::Bidirectional);
//! let ctx = ExecContext::new(RuntimeConfig::default())?;
//! let mut gru = Gru::new(config.clone())?;
//! gru.load_weights(GruWeights::synthetic(&config, 42)?)?;
//! gru.create_pipeline(&ctx)?;
//!
//! let input = Tensor::from_f32_2d(32, 10, &vec![0.0; 320])?;
//! let output = gru.forward(&input, &ctx)?;
//! assert_eq!(output.shape(), vec![128, 10]);
//! # Ok::<(), grurt::GruError>(())
//! ```

pub use gru_core;
pub use gru_kernels;
pub use gru_model;
pub use gru_tensor;

pub use gru_core::{status_code, AppConfig, GruError, Result, RuntimeConfig};
pub use gru_kernels::{Capabilities, Isa, Precision};
pub use gru_model::{
    reference_output, Direction, ExecContext, Gru, GruConfig, GruOutput, GruWeights,
};
pub use gru_tensor::{BudgetAllocator, ElemType, Tensor};
