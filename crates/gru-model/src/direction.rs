//! Direction orchestration.
//!
//! Forward and reverse layers run one pass straight into the layer output.
//! Bidirectional layers run two independent passes, each with its own
//! hidden slice, workspace and private output rows, concurrently via
//! `rayon::join`; afterwards output row t becomes
//! `concat(forward[t], reverse[t])`.
//!
//! Hidden state is `H x dirs`: row 0 is the forward (or only) direction,
//! row 1 the reverse direction.

use std::sync::Arc;

use gru_core::{GruError, Result};
use gru_kernels::Scratch;
use gru_tensor::aligned::{Allocator, Zeroable};
use gru_tensor::pack::GruLayout;

use crate::config::Direction;
use crate::workspace::Workspace;

/// Run every pass of `direction`.
///
/// `pass(d, reverse, hidden, output, scratch)` runs weight set `d` over the
/// whole sequence. All workspaces are acquired before the first pass starts,
/// so allocation failure leaves `hidden` and `output` untouched.
#[allow(clippy::too_many_arguments)]
pub fn orchestrate<E, F>(
    direction: Direction,
    layout: &GruLayout,
    steps: usize,
    int8: bool,
    hidden: &mut [f32],
    output: &mut [E],
    alloc: &Arc<dyn Allocator>,
    pass: F,
) -> Result<()>
where
    E: Zeroable,
    F: Fn(usize, bool, &mut [f32], &mut [E], &mut Scratch) -> Result<()> + Sync,
{
    let h = layout.num_output;
    let dirs = direction.num_directions();
    if hidden.len() != h * dirs {
        return Err(GruError::shape(&[h, dirs], &[hidden.len()]));
    }
    if output.len() != steps * h * dirs {
        return Err(GruError::shape(&[h * dirs, steps], &[output.len()]));
    }

    match direction {
        Direction::Forward | Direction::Reverse => {
            let mut ws = Workspace::<E>::acquire(layout, steps, int8, false, alloc)?;
            pass(0, direction.is_reversed(0), hidden, output, &mut ws.scratch)
        }
        Direction::Bidirectional => {
            let mut fwd = Workspace::<E>::acquire(layout, steps, int8, true, alloc)?;
            let mut rev = Workspace::<E>::acquire(layout, steps, int8, true, alloc)?;
            let (h_fwd, h_rev) = hidden.split_at_mut(h);

            let (a, b) = rayon::join(
                || pass(0, false, h_fwd, &mut fwd.output[..], &mut fwd.scratch),
                || pass(1, true, h_rev, &mut rev.output[..], &mut rev.scratch),
            );
            a?;
            b?;

            for (t, row) in output.chunks_exact_mut(2 * h).enumerate() {
                let (left, right) = row.split_at_mut(h);
                left.copy_from_slice(&fwd.output[t * h..(t + 1) * h]);
                right.copy_from_slice(&rev.output[t * h..(t + 1) * h]);
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gru_tensor::{system, BudgetAllocator};

    // A fake pass that writes `d * 100 + t` (or its reverse) so the merge
    // layout is visible.
    fn marker(d: usize, reverse: bool, hidden: &mut [f32], out: &mut [f32], _: &mut Scratch) -> Result<()> {
        let h = hidden.len();
        let steps = out.len() / h;
        for t in 0..steps {
            let ti = if reverse { steps - 1 - t } else { t };
            for q in 0..h {
                out[ti * h + q] = (d * 100 + t) as f32;
            }
        }
        hidden.iter_mut().for_each(|v| *v += 1.0 + d as f32);
        Ok(())
    }

    #[test]
    fn test_bidirectional_concat() {
        let layout = GruLayout::new(1, 2, 1);
        let mut hidden = vec![0.0f32; 4];
        let mut out = vec![0.0f32; 3 * 4];
        orchestrate(Direction::Bidirectional, &layout, 3, false, &mut hidden, &mut out, &system(), marker)
            .unwrap();
        assert_eq!(
            out,
            vec![
                0.0, 0.0, 102.0, 102.0, //
                1.0, 1.0, 101.0, 101.0, //
                2.0, 2.0, 100.0, 100.0,
            ]
        );
        assert_eq!(hidden, vec![1.0, 1.0, 2.0, 2.0]);
    }

    #[test]
    fn test_reverse_single_pass() {
        let layout = GruLayout::new(1, 1, 1);
        let mut hidden = vec![0.0f32];
        let mut out = vec![0.0f32; 3];
        orchestrate(Direction::Reverse, &layout, 3, false, &mut hidden, &mut out, &system(), marker)
            .unwrap();
        assert_eq!(out, vec![2.0, 1.0, 0.0]);
    }

    #[test]
    fn test_oom_before_any_pass() {
        let layout = GruLayout::new(1, 8, 8);
        let alloc: Arc<dyn Allocator> = Arc::new(BudgetAllocator::new(256));
        let mut hidden = vec![7.0f32; 16];
        let mut out = vec![-1.0f32; 10 * 16];
        let err = orchestrate(Direction::Bidirectional, &layout, 10, false, &mut hidden, &mut out, &alloc, marker)
            .unwrap_err();
        assert!(err.is_out_of_memory());
        assert!(hidden.iter().all(|&v| v == 7.0));
        assert!(out.iter().all(|&v| v == -1.0));
    }

    #[test]
    fn test_shape_checked() {
        let layout = GruLayout::new(1, 2, 1);
        let mut hidden = vec![0.0f32; 2];
        let mut out = vec![0.0f32; 3];
        assert!(orchestrate(Direction::Forward, &layout, 2, false, &mut hidden, &mut out, &system(), marker).is_err());
    }
}
