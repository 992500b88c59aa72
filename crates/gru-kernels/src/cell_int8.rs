//! int8 GRU recurrence.
//!
//! Weights are quantized per row at pipeline creation; the input sequence is
//! quantized per timestep before the loop, and the hidden state is
//! re-quantized at the top of every timestep. Dot products accumulate in
//! i32 and are rescaled by `weight_descale * activation_descale` before the
//! bias is added. Activations, blending and the hidden state stay in f32.

use gru_core::{GruError, Result};
use gru_tensor::codec::Element;
use gru_tensor::pack::{GruLayout, PackedDirection, RecordView};
use gru_tensor::quant::{quantize_dynamic, QuantizedSequence};

use crate::cell::{check_run, commit, for_each_record, Scratch};
use crate::simd::{ScalarBatch, VectorBatch, MAX_LANES};

// Slots of the descale record and of the accumulator block.
const XC_R: usize = 0;
const XC_U: usize = 1;
const XC_N: usize = 2;
const HC_R: usize = 3;
const HC_U: usize = 4;
const HC_N: usize = 5;

/// `acc[l] += sum_c block[c * stride + offset + l] * v[c]`
#[inline(always)]
fn dot_lanes(block: &[i8], v: &[i8], stride: usize, offset: usize, w: usize, acc: &mut [i32; MAX_LANES]) {
    for (c, &vi) in v.iter().enumerate() {
        let row = &block[c * stride + offset..c * stride + offset + w];
        for (a, &wv) in acc[..w].iter_mut().zip(row) {
            *a += wv as i32 * vi as i32;
        }
    }
}

fn gate_record_int8<V: VectorBatch>(
    rec: &RecordView<'_, i8>,
    xq: &[i8],
    dx: f32,
    hq: &[i8],
    dh: f32,
    out: &mut [f32],
) {
    let w = V::LANES;
    debug_assert_eq!(rec.width, w);
    let (xru, xn) = rec.xc.split_at(2 * w * xq.len());
    let (hru, hn) = rec.hc.split_at(2 * w * hq.len());

    let mut acc = [[0i32; MAX_LANES]; 6];
    dot_lanes(xru, xq, 2 * w, 0, w, &mut acc[XC_R]);
    dot_lanes(xru, xq, 2 * w, w, w, &mut acc[XC_U]);
    dot_lanes(xn, xq, w, 0, w, &mut acc[XC_N]);
    dot_lanes(hru, hq, 2 * w, 0, w, &mut acc[HC_R]);
    dot_lanes(hru, hq, 2 * w, w, w, &mut acc[HC_U]);
    dot_lanes(hn, hq, w, 0, w, &mut acc[HC_N]);

    let deq = |slot: usize, act: f32| -> V {
        let mut buf = [0.0f32; MAX_LANES];
        for l in 0..w {
            buf[l] = acc[slot][l] as f32 * (rec.descales[slot * w + l] * act);
        }
        V::load(&buf)
    };

    let r = V::load(&rec.bias[..w])
        .add(deq(XC_R, dx))
        .add(deq(HC_R, dh))
        .sigmoid();
    let u = V::load(&rec.bias[w..2 * w])
        .add(deq(XC_U, dx))
        .add(deq(HC_U, dh))
        .sigmoid();

    let nh = V::load(&rec.bias[2 * w..3 * w]).add(deq(HC_N, dh));
    let n = V::load(&rec.bias[3 * w..4 * w])
        .mul_add(r, nh)
        .add(deq(XC_N, dx))
        .tanh();

    u.store(&mut out[..w]);
    n.store(&mut out[w..2 * w]);
}

/// int8 counterpart of `cell::run_direction`. `input` was quantized with
/// `quant::dynamic_quantize`; `output` is written in the caller's float
/// storage type `E`.
pub fn run_direction_int8<B: VectorBatch, E: Element>(
    packed: &PackedDirection<i8>,
    layout: &GruLayout,
    input: &QuantizedSequence,
    reverse: bool,
    hidden: &mut [f32],
    output: &mut [E],
    scratch: &mut Scratch,
) -> Result<()> {
    let steps = input.steps;
    check_run(layout, B::LANES, steps, hidden.len(), output.len(), scratch)?;
    if input.size != layout.input_size {
        return Err(GruError::shape(&[layout.input_size], &[input.size]));
    }
    if packed.descales.is_none() {
        return Err(GruError::Other("int8 weights have no descale table".into()));
    }
    if scratch.hidden_q.len() != layout.num_output {
        return Err(GruError::Other("scratch has no quantized hidden buffer".into()));
    }

    let h = layout.num_output;
    let groups = layout.groups();

    for t in 0..steps {
        let ti = if reverse { steps - 1 - t } else { t };
        let dh = quantize_dynamic(hidden, &mut scratch.hidden_q);

        {
            let xq = input.step(ti);
            let dx = input.descale(ti);
            let hq: &[i8] = &scratch.hidden_q;
            for_each_record(layout, &mut scratch.gates, |r, out| {
                let rec = packed.record(layout, r);
                if r < groups {
                    gate_record_int8::<B>(&rec, xq, dx, hq, dh, out);
                } else {
                    gate_record_int8::<ScalarBatch>(&rec, xq, dx, hq, dh, out);
                }
            });
        }

        commit(layout, &scratch.gates, hidden);
        E::encode_from(hidden, &mut output[ti * h..(ti + 1) * h]);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::Capabilities;
    use gru_tensor::pack::{pack_direction_int8, RawWeights};
    use gru_tensor::quant::dynamic_quantize;
    use gru_tensor::verify::{gru_sequence_ref, max_diff};
    use gru_tensor::{system, Tensor};

    fn gen(n: usize, seed: u32, amp: f32) -> Vec<f32> {
        (0..n as u32)
            .map(|i| {
                let v = i.wrapping_add(seed).wrapping_mul(2654435761) >> 16;
                ((v % 200) as f32 / 100.0 - 1.0) * amp
            })
            .collect()
    }

    fn run(raw: &RawWeights, h: usize, i: usize, seq: &[f32], steps: usize, reverse: bool) -> Vec<f32> {
        let isa = Capabilities::detect().best_isa();
        let layout = GruLayout::new(isa.lanes(), h, i);
        let packed = pack_direction_int8(&raw.as_direction(), &layout, &system()).unwrap();
        let q = dynamic_quantize(&Tensor::from_f32_2d(i, steps, seq).unwrap(), &system()).unwrap();
        let mut scratch = Scratch::try_new(&layout, true, &system()).unwrap();
        let mut hidden = vec![0.0f32; h];
        let mut out = vec![0.0f32; steps * h];
        crate::with_batch!(isa, B => run_direction_int8::<B, f32>(
            &packed, &layout, &q, reverse, &mut hidden, &mut out, &mut scratch
        ))
        .unwrap();
        out
    }

    #[test]
    fn test_int8_close_to_reference() {
        for &(h, i, steps) in &[(4, 2, 3), (7, 5, 4), (10, 3, 6)] {
            let raw = RawWeights {
                weight_xc: gen(3 * h * i, 1, 0.5),
                bias_c: gen(4 * h, 2, 0.2),
                weight_hc: gen(3 * h * h, 3, 0.5),
            };
            let seq = gen(steps * i, 4, 1.0);
            for reverse in [false, true] {
                let mut h_ref = vec![0.0f32; h];
                let expected =
                    gru_sequence_ref(&raw.as_direction(), i, &seq, steps, reverse, &mut h_ref);
                let got = run(&raw, h, i, &seq, steps, reverse);
                let d = max_diff(&expected, &got);
                assert!(d < 5e-2, "h={} i={} rev={} diff={}", h, i, reverse, d);
            }
        }
    }

    #[test]
    fn test_int8_zero_input_step_is_finite() {
        let (h, i, steps) = (3, 2, 3);
        let raw = RawWeights {
            weight_xc: gen(3 * h * i, 5, 0.5),
            bias_c: gen(4 * h, 6, 0.2),
            weight_hc: gen(3 * h * h, 7, 0.5),
        };
        let seq = [0.0, 0.0, 0.5, -0.5, 0.0, 0.0];
        let out = run(&raw, h, i, &seq, steps, false);
        assert!(out.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_int8_needs_hidden_scratch() {
        let (h, i) = (2, 2);
        let raw = RawWeights {
            weight_xc: gen(3 * h * i, 1, 0.5),
            bias_c: gen(4 * h, 2, 0.2),
            weight_hc: gen(3 * h * h, 3, 0.5),
        };
        let layout = GruLayout::new(1, h, i);
        let packed = pack_direction_int8(&raw.as_direction(), &layout, &system()).unwrap();
        let q = dynamic_quantize(&Tensor::from_f32_2d(i, 1, &[1.0, 2.0]).unwrap(), &system()).unwrap();
        let mut scratch = Scratch::try_new(&layout, false, &system()).unwrap();
        let mut hidden = vec![0.0f32; h];
        let mut out = vec![0.0f32; h];
        assert!(run_direction_int8::<ScalarBatch, f32>(
            &packed, &layout, &q, false, &mut hidden, &mut out, &mut scratch
        )
        .is_err());
    }
}
