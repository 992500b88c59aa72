//! Per-call scratch.
//!
//! A `Workspace` is acquired from the workspace allocator at the start of
//! one orchestration call, owned by exactly one direction, and dropped
//! (returning its memory) when the call ends. Nothing survives between
//! calls.

use std::sync::Arc;

use gru_core::Result;
use gru_kernels::Scratch;
use gru_tensor::aligned::{AlignedVec, Allocator, Zeroable};
use gru_tensor::pack::GruLayout;

#[derive(Debug)]
pub struct Workspace<E: Zeroable> {
    pub scratch: Scratch,
    /// `steps x H` private output rows, bidirectional passes only.
    pub output: AlignedVec<E>,
}

impl<E: Zeroable> Workspace<E> {
    /// Allocate everything one direction needs. With `own_output` the pass
    /// writes into a private buffer instead of the layer output.
    pub fn acquire(
        layout: &GruLayout,
        steps: usize,
        int8: bool,
        own_output: bool,
        alloc: &Arc<dyn Allocator>,
    ) -> Result<Self> {
        let rows = if own_output { steps * layout.num_output } else { 0 };
        Ok(Self {
            scratch: Scratch::try_new(layout, int8, alloc)?,
            output: AlignedVec::try_zeroed(rows, alloc)?,
        })
    }

    pub fn size_bytes(&self) -> usize {
        self.scratch.size_bytes() + self.output.capacity_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gru_tensor::BudgetAllocator;

    #[test]
    fn test_workspace_returns_memory() {
        let budget = Arc::new(BudgetAllocator::new(1 << 20));
        let alloc: Arc<dyn Allocator> = budget.clone();
        let layout = GruLayout::new(4, 8, 3);
        {
            let ws = Workspace::<f32>::acquire(&layout, 5, true, true, &alloc).unwrap();
            // x[3] + gates[16] floats, hidden_q[8] bytes, output[40] floats
            assert_eq!(ws.size_bytes(), 3 * 4 + 16 * 4 + 8 + 40 * 4);
            assert_eq!(budget.used(), ws.size_bytes());
        }
        assert_eq!(budget.used(), 0);
    }

    #[test]
    fn test_workspace_oom() {
        let alloc: Arc<dyn Allocator> = Arc::new(BudgetAllocator::new(64));
        let layout = GruLayout::new(1, 16, 16);
        let err = Workspace::<f32>::acquire(&layout, 4, false, true, &alloc).unwrap_err();
        assert!(err.is_out_of_memory());
    }
}
