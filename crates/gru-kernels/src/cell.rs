//! Float GRU recurrence over packed weights.
//!
//! One generic kernel serves f32, f16 and bf16 storage: weights and inputs
//! are decoded to f32 right before use, the hidden state never leaves f32,
//! and each output row is encoded back to the storage type.
//!
//! Per timestep:
//! 1. decode x_t into scratch
//! 2. every record writes `U[w] N[w]` into its own gate chunk (parallel
//!    across records for wide layers; the implicit join is the barrier)
//! 3. blend `h = (1 - U) * N + U * h` and emit the output row
//!
//! The hidden vector is only written in step 3, after every gate of the
//! timestep has been computed from the old state.

use std::sync::Arc;

use rayon::prelude::*;

use gru_core::{GruError, Result};
use gru_tensor::aligned::{AlignedVec, Allocator};
use gru_tensor::codec::Element;
use gru_tensor::pack::{GruLayout, PackedDirection, RecordView};

use crate::simd::{ScalarBatch, VectorBatch, MAX_LANES};

/// Below this many hidden units the gate region runs on the calling thread.
pub const PARALLEL_THRESHOLD: usize = 128;

/// Per-direction scratch for one forward call.
#[derive(Debug)]
pub struct Scratch {
    /// Decoded input features of the current timestep.
    pub x: AlignedVec<f32>,
    /// `U[w] N[w]` per record, `2 * H` total.
    pub gates: AlignedVec<f32>,
    /// Quantized hidden state, int8 path only.
    pub hidden_q: AlignedVec<i8>,
}

impl Scratch {
    pub fn try_new(layout: &GruLayout, int8: bool, alloc: &Arc<dyn Allocator>) -> Result<Self> {
        let h = layout.num_output;
        Ok(Self {
            x: AlignedVec::try_zeroed(layout.input_size, alloc)?,
            gates: AlignedVec::try_zeroed(2 * h, alloc)?,
            hidden_q: AlignedVec::try_zeroed(if int8 { h } else { 0 }, alloc)?,
        })
    }

    pub fn size_bytes(&self) -> usize {
        self.x.capacity_bytes() + self.gates.capacity_bytes() + self.hidden_q.capacity_bytes()
    }
}

/// Shape checks shared by the float and int8 kernels.
pub(crate) fn check_run(
    layout: &GruLayout,
    lanes: usize,
    steps: usize,
    hidden: usize,
    output: usize,
    scratch: &Scratch,
) -> Result<()> {
    let h = layout.num_output;
    if layout.lanes != lanes {
        return Err(GruError::Unsupported(format!(
            "weights packed for {} lanes, kernel runs {}",
            layout.lanes, lanes
        )));
    }
    if hidden != h {
        return Err(GruError::shape(&[h], &[hidden]));
    }
    if output != steps * h {
        return Err(GruError::shape(&[h, steps], &[output]));
    }
    if scratch.x.len() != layout.input_size || scratch.gates.len() != 2 * h {
        return Err(GruError::Other("scratch does not match layer layout".into()));
    }
    Ok(())
}

/// Run `f(record, gate_chunk)` for every record of `layout`.
pub(crate) fn for_each_record<F>(layout: &GruLayout, gates: &mut [f32], f: F)
where
    F: Fn(usize, &mut [f32]) + Sync,
{
    let (lanes, groups) = (layout.lanes, layout.groups());
    let (head, tail) = gates.split_at_mut(groups * 2 * lanes);

    if layout.num_output < PARALLEL_THRESHOLD {
        for (g, chunk) in head.chunks_mut(2 * lanes).enumerate() {
            f(g, chunk);
        }
        for (j, chunk) in tail.chunks_mut(2).enumerate() {
            f(groups + j, chunk);
        }
        return;
    }

    rayon::join(
        || {
            head.par_chunks_mut(2 * lanes)
                .enumerate()
                .for_each(|(g, chunk)| f(g, chunk));
        },
        || {
            tail.par_chunks_mut(2)
                .enumerate()
                .for_each(|(j, chunk)| f(groups + j, chunk));
        },
    );
}

/// `h = (1 - U) * N + U * h` for every unit.
pub(crate) fn commit(layout: &GruLayout, gates: &[f32], hidden: &mut [f32]) {
    for r in 0..layout.records() {
        let (q0, w) = layout.record_units(r);
        let (u, n) = gates[layout.gate_range(r)].split_at(w);
        for l in 0..w {
            let h = &mut hidden[q0 + l];
            *h = (1.0 - u[l]) * n[l] + u[l] * *h;
        }
    }
}

#[inline(always)]
fn load<V: VectorBatch, E: Element>(src: &[E]) -> V {
    let mut buf = [0.0f32; MAX_LANES];
    E::decode_into(&src[..V::LANES], &mut buf[..V::LANES]);
    V::load(&buf)
}

/// Gates of one record: writes `U[w]` then `N[w]` into `out`.
fn gate_record<V: VectorBatch, E: Element>(
    rec: &RecordView<'_, E>,
    x: &[f32],
    hidden: &[f32],
    out: &mut [f32],
) {
    let w = V::LANES;
    debug_assert_eq!(rec.width, w);
    let (xru, xn) = rec.xc.split_at(2 * w * x.len());
    let (hru, hn) = rec.hc.split_at(2 * w * hidden.len());

    let mut r = V::load(&rec.bias[..w]);
    let mut u = V::load(&rec.bias[w..2 * w]);
    for (c, &xi) in x.iter().enumerate() {
        let xi = V::splat(xi);
        let ru = &xru[c * 2 * w..];
        r = r.mul_add(load::<V, E>(ru), xi);
        u = u.mul_add(load::<V, E>(&ru[w..]), xi);
    }
    for (c, &hi) in hidden.iter().enumerate() {
        let hi = V::splat(hi);
        let ru = &hru[c * 2 * w..];
        r = r.mul_add(load::<V, E>(ru), hi);
        u = u.mul_add(load::<V, E>(&ru[w..]), hi);
    }
    let r = r.sigmoid();
    let u = u.sigmoid();

    // Hidden-side candidate plus BN, scaled by R, then WN and the input side.
    let mut nh = V::load(&rec.bias[2 * w..3 * w]);
    for (c, &hi) in hidden.iter().enumerate() {
        nh = nh.mul_add(load::<V, E>(&hn[c * w..]), V::splat(hi));
    }
    let mut n = V::load(&rec.bias[3 * w..4 * w]).mul_add(r, nh);
    for (c, &xi) in x.iter().enumerate() {
        n = n.mul_add(load::<V, E>(&xn[c * w..]), V::splat(xi));
    }
    let n = n.tanh();

    u.store(&mut out[..w]);
    n.store(&mut out[w..2 * w]);
}

/// Run one direction over `steps` timesteps.
///
/// `input` is `steps x I`, `output` is `steps x H`, both in storage type
/// `E`. `hidden` carries the state in and out. With `reverse` the sequence
/// is visited from the last timestep and output row `ti` receives the state
/// after consuming input row `ti`.
#[allow(clippy::too_many_arguments)]
pub fn run_direction<B: VectorBatch, E: Element>(
    packed: &PackedDirection<E>,
    layout: &GruLayout,
    input: &[E],
    steps: usize,
    reverse: bool,
    hidden: &mut [f32],
    output: &mut [E],
    scratch: &mut Scratch,
) -> Result<()> {
    check_run(layout, B::LANES, steps, hidden.len(), output.len(), scratch)?;
    let (h, i) = (layout.num_output, layout.input_size);
    if input.len() != steps * i {
        return Err(GruError::shape(&[i, steps], &[input.len()]));
    }
    let groups = layout.groups();

    for t in 0..steps {
        let ti = if reverse { steps - 1 - t } else { t };
        E::decode_into(&input[ti * i..(ti + 1) * i], &mut scratch.x);

        {
            let x: &[f32] = &scratch.x;
            let prev: &[f32] = hidden;
            for_each_record(layout, &mut scratch.gates, |r, out| {
                let rec = packed.record(layout, r);
                if r < groups {
                    gate_record::<B, E>(&rec, x, prev, out);
                } else {
                    gate_record::<ScalarBatch, E>(&rec, x, prev, out);
                }
            });
        }

        commit(layout, &scratch.gates, hidden);
        E::encode_from(hidden, &mut output[ti * h..(ti + 1) * h]);
    }

    Ok(())
}
