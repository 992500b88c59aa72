//! Tensor storage and the offline weight transforms of the GRU engine.
//!
//! - `aligned`: allocator-backed aligned buffers
//! - `tensor`: shape + element tag + shared storage
//! - `codec`: f16 / bf16 <-> f32
//! - `quant`: symmetric int8 quantization
//! - `pack`: lane-interleaved weight packing and its inverse
//! - `verify`: scalar reference recurrence

pub mod aligned;
pub mod codec;
pub mod pack;
pub mod quant;
pub mod tensor;
pub mod verify;

pub use aligned::{system, AlignedVec, Allocator, BudgetAllocator, SystemAllocator, Zeroable};
pub use codec::{ElemType, Element};
pub use pack::{GruLayout, PackedDirection, RawDirection, RawWeights, RecordView};
pub use quant::{dynamic_quantize, QuantizedSequence};
pub use tensor::{Storable, Tensor};
