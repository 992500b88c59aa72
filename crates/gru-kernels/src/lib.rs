//! GRU recurrence kernels.
//!
//! - `simd`: the `VectorBatch` abstraction and its per-ISA batch types
//! - `cpu`: explicit capability probing
//! - `dispatch`: ISA and precision selection, `with_batch!`
//! - `cell`: float recurrence (f32 / f16 / bf16 storage)
//! - `cell_int8`: int8 recurrence

pub mod cell;
pub mod cell_int8;
pub mod cpu;
pub mod dispatch;
pub mod simd;

pub use cell::{run_direction, Scratch};
pub use cell_int8::run_direction_int8;
pub use cpu::Capabilities;
pub use dispatch::{pipeline_precision, select_precision, Isa, Precision};
pub use simd::VectorBatch;
