//! Scalar reference GRU over raw (unpacked) weights.
//!
//! No packing, no SIMD, no threads. Every kernel path is checked against
//! this.

use crate::pack::{RawDirection, BIAS_BN, BIAS_R, BIAS_U, BIAS_WN};

#[inline]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn dot(row: &[f32], x: &[f32]) -> f32 {
    row.iter().zip(x).map(|(a, b)| a * b).sum()
}

/// One timestep in place: `hidden` is h_{t-1} on entry and h_t on return.
pub fn gru_step_ref(raw: &RawDirection<'_>, input_size: usize, x: &[f32], hidden: &mut [f32]) {
    let h = hidden.len();
    let i = input_size;
    let xc = |row: usize| &raw.weight_xc[row * i..(row + 1) * i];
    let hc = |row: usize| &raw.weight_hc[row * h..(row + 1) * h];
    let b = |kind: usize, q: usize| raw.bias_c[kind * h + q];

    let mut next = vec![0.0f32; h];
    for q in 0..h {
        let r = sigmoid(b(BIAS_R, q) + dot(xc(q), x) + dot(hc(q), hidden));
        let u = sigmoid(b(BIAS_U, q) + dot(xc(h + q), x) + dot(hc(h + q), hidden));
        let n = (b(BIAS_WN, q) + r * (dot(hc(2 * h + q), hidden) + b(BIAS_BN, q)) + dot(xc(2 * h + q), x))
            .tanh();
        next[q] = (1.0 - u) * n + u * hidden[q];
    }
    hidden.copy_from_slice(&next);
}

/// Run one direction over a `steps x input_size` sequence.
///
/// Returns `steps x H` outputs indexed by original timestep; `hidden` holds
/// the final state afterwards.
pub fn gru_sequence_ref(
    raw: &RawDirection<'_>,
    input_size: usize,
    seq: &[f32],
    steps: usize,
    reverse: bool,
    hidden: &mut [f32],
) -> Vec<f32> {
    let h = hidden.len();
    let mut out = vec![0.0f32; steps * h];
    for t in 0..steps {
        let ti = if reverse { steps - 1 - t } else { t };
        gru_step_ref(raw, input_size, &seq[ti * input_size..(ti + 1) * input_size], hidden);
        out[ti * h..(ti + 1) * h].copy_from_slice(hidden);
    }
    out
}

/// Largest absolute elementwise difference.
pub fn max_diff(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len(), "max_diff: length mismatch");
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
}

/// Result of a verification run.
#[derive(Debug)]
pub struct TestResult {
    pub pass: usize,
    pub fail: usize,
    pub max_diff: f32,
}

impl TestResult {
    pub fn ok(&self) -> bool {
        self.fail == 0
    }
}

/// Compare `actual` against `expected` with absolute tolerance `tol`.
pub fn verify_outputs(expected: &[f32], actual: &[f32], tol: f32) -> TestResult {
    assert_eq!(expected.len(), actual.len(), "verify_outputs: length mismatch");
    let mut max_diff = 0.0f32;
    let mut fail = 0;
    for (e, a) in expected.iter().zip(actual) {
        let diff = (e - a).abs();
        if diff > max_diff || diff.is_nan() {
            max_diff = diff;
        }
        if !(diff <= tol) {
            fail += 1;
        }
    }
    TestResult {
        pass: expected.len() - fail,
        fail,
        max_diff,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_weights_keep_hidden_zero() {
        let (h, i) = (4, 2);
        let xc = vec![0.0f32; 3 * h * i];
        let hc = vec![0.0f32; 3 * h * h];
        let bias = vec![0.0f32; 4 * h];
        let raw = RawDirection {
            weight_xc: &xc,
            bias_c: &bias,
            weight_hc: &hc,
        };
        let mut hidden = vec![0.0f32; h];
        let out = gru_sequence_ref(&raw, i, &[1.0, -1.0], 1, false, &mut hidden);
        assert_eq!(out, vec![0.0; h]);
        assert_eq!(hidden, vec![0.0; h]);
    }

    #[test]
    fn test_update_gate_blend() {
        // Zero weights, hidden = 1: R = U = 0.5, N = tanh(0) = 0, h' = 0.5.
        let h = 1;
        let xc = vec![0.0f32; 3];
        let hc = vec![0.0f32; 3];
        let bias = vec![0.0f32; 4];
        let raw = RawDirection {
            weight_xc: &xc,
            bias_c: &bias,
            weight_hc: &hc,
        };
        let mut hidden = vec![1.0f32; h];
        gru_step_ref(&raw, 1, &[3.0], &mut hidden);
        assert!((hidden[0] - 0.5).abs() < 1e-7);
    }

    #[test]
    fn test_candidate_bias_placement() {
        // Only BN is set. With hidden = 0 and zero weights, R = 0.5 so the
        // candidate sees 0.5 * BN; U = 0.5 halves it again.
        let xc = vec![0.0f32; 3];
        let hc = vec![0.0f32; 3];
        let bias = vec![0.0, 0.0, 0.0, 2.0];
        let raw = RawDirection {
            weight_xc: &xc,
            bias_c: &bias,
            weight_hc: &hc,
        };
        let mut hidden = vec![0.0f32];
        gru_step_ref(&raw, 1, &[0.0], &mut hidden);
        assert!((hidden[0] - 0.5 * 1.0f32.tanh()).abs() < 1e-6);

        // WN is added outside the reset product.
        let bias = vec![0.0, 0.0, 2.0, 0.0];
        let raw = RawDirection { bias_c: &bias, ..raw };
        let mut hidden = vec![0.0f32];
        gru_step_ref(&raw, 1, &[0.0], &mut hidden);
        assert!((hidden[0] - 0.5 * 2.0f32.tanh()).abs() < 1e-6);
    }

    #[test]
    fn test_reverse_writes_original_rows() {
        let xc = vec![0.5f32; 3];
        let hc = vec![0.25f32; 3];
        let bias = vec![0.0f32; 4];
        let raw = RawDirection {
            weight_xc: &xc,
            bias_c: &bias,
            weight_hc: &hc,
        };
        let seq = [1.0, 2.0, 3.0];
        let mut h_rev = vec![0.0f32];
        let rev = gru_sequence_ref(&raw, 1, &seq, 3, true, &mut h_rev);

        let flipped = [3.0, 2.0, 1.0];
        let mut h_fwd = vec![0.0f32];
        let fwd = gru_sequence_ref(&raw, 1, &flipped, 3, false, &mut h_fwd);

        assert_eq!(rev, vec![fwd[2], fwd[1], fwd[0]]);
        assert_eq!(h_rev, h_fwd);
    }

    #[test]
    fn test_verify_outputs() {
        let r = verify_outputs(&[1.0, 2.0, 3.0], &[1.0, 2.1, 3.0], 0.05);
        assert_eq!(r.fail, 1);
        assert_eq!(r.pass, 2);
        assert!((r.max_diff - 0.1).abs() < 1e-5);
        assert!(!r.ok());
    }
}
