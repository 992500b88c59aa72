//! GRU weight packing: gate-major raw matrices -> lane-interleaved records.
//!
//! Raw layout per direction (as persisted):
//!   weight_xc: [3H x I]  rows R(0..H), U(H..2H), N(2H..3H)
//!   weight_hc: [3H x H]  same gate order
//!   bias_c:    [4 x H]   rows R, U, WN, BN
//!
//! Hidden units are taken L at a time (L = vector lanes). Each group of L
//! units becomes one record:
//!
//! ```text
//!   for i in 0..K:  R[q..q+L] U[q..q+L]     (2L values, "RURU" per feature)
//!   for i in 0..K:  N[q..q+L]               (L values)
//! ```
//!
//! so a single vector load per feature yields L reset (or update, or
//! candidate) coefficients. Units left over after the last full group are
//! stored one per record with width 1, which is the same formula with L = 1.
//! Bias records are `R[w] U[w] BN[w] WN[w]`.
//!
//! Packing never changes a value for f32 storage. f16/bf16 encode through
//! the codec; int8 quantizes each raw row with its own absmax scale and keeps
//! the row descales in a parallel table.

use std::ops::Range;
use std::sync::Arc;

use rayon::prelude::*;

use gru_core::{GruError, Result};

use crate::aligned::{AlignedVec, Allocator, Zeroable};
use crate::codec::Element;
use crate::quant::{absmax, quantize_value, scale_pair};

/// Gate order of the weight matrices.
pub const GATE_R: usize = 0;
pub const GATE_U: usize = 1;
pub const GATE_N: usize = 2;

/// Row order of the raw bias block.
pub const BIAS_R: usize = 0;
pub const BIAS_U: usize = 1;
pub const BIAS_WN: usize = 2;
pub const BIAS_BN: usize = 3;

/// Where a hidden unit lives in the packed layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitSlot {
    pub record: usize,
    pub lane: usize,
    pub width: usize,
}

/// Packed layout of one `3*units x k` weight block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    pub lanes: usize,
    pub units: usize,
    pub k: usize,
}

impl BlockLayout {
    pub fn groups(&self) -> usize {
        self.units / self.lanes
    }

    pub fn len(&self) -> usize {
        3 * self.units * self.k
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slot of hidden unit `q`.
    pub fn locate(&self, q: usize) -> UnitSlot {
        let full = self.groups() * self.lanes;
        if q < full {
            UnitSlot {
                record: q / self.lanes,
                lane: q % self.lanes,
                width: self.lanes,
            }
        } else {
            UnitSlot {
                record: self.groups() + (q - full),
                lane: 0,
                width: 1,
            }
        }
    }

    /// Element range of record `r`.
    pub fn record_range(&self, r: usize) -> Range<usize> {
        let width = if r < self.groups() { self.lanes } else { 1 };
        let start = record_offset(r, self.groups(), self.lanes, 3 * self.k);
        start..start + 3 * width * self.k
    }

    /// Packed offset of raw element (row `gate * units + q`, column `i`).
    pub fn index(&self, q: usize, gate: usize, i: usize) -> usize {
        let slot = self.locate(q);
        let w = slot.width;
        let base = self.record_range(slot.record).start;
        match gate {
            GATE_R => base + i * 2 * w + slot.lane,
            GATE_U => base + i * 2 * w + w + slot.lane,
            _ => base + 2 * w * self.k + i * w + slot.lane,
        }
    }
}

/// Offset of record `r` when full-group records hold `per_unit * lanes`
/// values and tail records hold `per_unit`.
fn record_offset(r: usize, groups: usize, lanes: usize, per_unit: usize) -> usize {
    if r < groups {
        r * per_unit * lanes
    } else {
        groups * per_unit * lanes + (r - groups) * per_unit
    }
}

/// Shape of one packed GRU direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GruLayout {
    pub lanes: usize,
    pub num_output: usize,
    pub input_size: usize,
}

impl GruLayout {
    pub fn new(lanes: usize, num_output: usize, input_size: usize) -> Self {
        assert!(lanes > 0, "lanes must be > 0");
        Self {
            lanes,
            num_output,
            input_size,
        }
    }

    pub fn groups(&self) -> usize {
        self.num_output / self.lanes
    }

    pub fn remain(&self) -> usize {
        self.num_output % self.lanes
    }

    /// Number of records: full groups plus tail units.
    pub fn records(&self) -> usize {
        self.groups() + self.remain()
    }

    pub fn xc(&self) -> BlockLayout {
        BlockLayout {
            lanes: self.lanes,
            units: self.num_output,
            k: self.input_size,
        }
    }

    pub fn hc(&self) -> BlockLayout {
        BlockLayout {
            lanes: self.lanes,
            units: self.num_output,
            k: self.num_output,
        }
    }

    /// First unit and width of record `r`.
    pub fn record_units(&self, r: usize) -> (usize, usize) {
        if r < self.groups() {
            (r * self.lanes, self.lanes)
        } else {
            (self.groups() * self.lanes + (r - self.groups()), 1)
        }
    }

    /// Bias record `R[w] U[w] BN[w] WN[w]`.
    pub fn bias_range(&self, r: usize) -> Range<usize> {
        let (_, w) = self.record_units(r);
        let start = record_offset(r, self.groups(), self.lanes, 4);
        start..start + 4 * w
    }

    /// Gate scratch record `U[w] N[w]` used by the recurrence.
    pub fn gate_range(&self, r: usize) -> Range<usize> {
        let (_, w) = self.record_units(r);
        let start = record_offset(r, self.groups(), self.lanes, 2);
        start..start + 2 * w
    }

    /// int8 descale record `xcR xcU xcN hcR hcU hcN`, each `w` wide.
    pub fn descale_range(&self, r: usize) -> Range<usize> {
        let (_, w) = self.record_units(r);
        let start = record_offset(r, self.groups(), self.lanes, 6);
        start..start + 6 * w
    }
}

/// Borrowed raw weights of one direction.
#[derive(Debug, Clone, Copy)]
pub struct RawDirection<'a> {
    pub weight_xc: &'a [f32],
    pub bias_c: &'a [f32],
    pub weight_hc: &'a [f32],
}

impl RawDirection<'_> {
    pub fn check(&self, layout: &GruLayout) -> Result<()> {
        let (h, i) = (layout.num_output, layout.input_size);
        if self.weight_xc.len() != 3 * h * i {
            return Err(GruError::shape(&[i, 3 * h], &[self.weight_xc.len()]));
        }
        if self.weight_hc.len() != 3 * h * h {
            return Err(GruError::shape(&[h, 3 * h], &[self.weight_hc.len()]));
        }
        if self.bias_c.len() != 4 * h {
            return Err(GruError::shape(&[h, 4], &[self.bias_c.len()]));
        }
        Ok(())
    }
}

/// Owned raw weights, produced by unpacking.
#[derive(Debug, Clone, PartialEq)]
pub struct RawWeights {
    pub weight_xc: Vec<f32>,
    pub bias_c: Vec<f32>,
    pub weight_hc: Vec<f32>,
}

impl RawWeights {
    pub fn as_direction(&self) -> RawDirection<'_> {
        RawDirection {
            weight_xc: &self.weight_xc,
            bias_c: &self.bias_c,
            weight_hc: &self.weight_hc,
        }
    }
}

/// One direction of packed weights.
#[derive(Debug)]
pub struct PackedDirection<E: Zeroable> {
    pub xc: AlignedVec<E>,
    pub hc: AlignedVec<E>,
    pub bias: AlignedVec<f32>,
    /// Per-row weight descales, int8 packs only.
    pub descales: Option<AlignedVec<f32>>,
}

/// Everything the kernel needs for one record.
#[derive(Debug, Clone, Copy)]
pub struct RecordView<'a, E> {
    /// First hidden unit of the record.
    pub q0: usize,
    /// Units in the record (L or 1).
    pub width: usize,
    pub xc: &'a [E],
    pub hc: &'a [E],
    pub bias: &'a [f32],
    pub descales: &'a [f32],
}

impl<E: Zeroable> PackedDirection<E> {
    pub fn record<'a>(&'a self, layout: &GruLayout, r: usize) -> RecordView<'a, E> {
        let (q0, width) = layout.record_units(r);
        RecordView {
            q0,
            width,
            xc: &self.xc[layout.xc().record_range(r)],
            hc: &self.hc[layout.hc().record_range(r)],
            bias: &self.bias[layout.bias_range(r)],
            descales: match &self.descales {
                Some(d) => &d[layout.descale_range(r)],
                None => &[],
            },
        }
    }

    /// Total bytes held by this direction.
    pub fn size_bytes(&self) -> usize {
        self.xc.capacity_bytes()
            + self.hc.capacity_bytes()
            + self.bias.capacity_bytes()
            + self.descales.as_ref().map_or(0, |d| d.capacity_bytes())
    }
}

/// Gather one record of width `w` starting at unit `q0`.
fn fill_record<E, F>(rec: &mut [E], q0: usize, w: usize, block: &BlockLayout, raw: &[f32], encode: &F)
where
    F: Fn(usize, f32) -> E,
{
    let (h, k) = (block.units, block.k);
    let (ru, n) = rec.split_at_mut(2 * w * k);

    for i in 0..k {
        for l in 0..w {
            let row_r = GATE_R * h + q0 + l;
            let row_u = GATE_U * h + q0 + l;
            ru[i * 2 * w + l] = encode(row_r, raw[row_r * k + i]);
            ru[i * 2 * w + w + l] = encode(row_u, raw[row_u * k + i]);
        }
    }

    for i in 0..k {
        for l in 0..w {
            let row_n = GATE_N * h + q0 + l;
            n[i * w + l] = encode(row_n, raw[row_n * k + i]);
        }
    }
}

/// Pack a whole `3H x K` block. Records are independent and filled in
/// parallel.
fn pack_block<E, F>(raw: &[f32], block: &BlockLayout, out: &mut [E], encode: F)
where
    E: Send,
    F: Fn(usize, f32) -> E + Sync,
{
    debug_assert_eq!(out.len(), block.len());
    if block.k == 0 {
        return;
    }
    let (lanes, k, groups) = (block.lanes, block.k, block.groups());
    let (head, tail) = out.split_at_mut(groups * 3 * lanes * k);

    rayon::join(
        || {
            head.par_chunks_mut(3 * lanes * k)
                .enumerate()
                .for_each(|(g, rec)| fill_record(rec, g * lanes, lanes, block, raw, &encode));
        },
        || {
            tail.par_chunks_mut(3 * k)
                .enumerate()
                .for_each(|(j, rec)| fill_record(rec, groups * lanes + j, 1, block, raw, &encode));
        },
    );
}

fn pack_bias(raw: &[f32], layout: &GruLayout, out: &mut [f32]) {
    let h = layout.num_output;
    for r in 0..layout.records() {
        let (q0, w) = layout.record_units(r);
        let rec = &mut out[layout.bias_range(r)];
        for l in 0..w {
            let q = q0 + l;
            rec[l] = raw[BIAS_R * h + q];
            rec[w + l] = raw[BIAS_U * h + q];
            rec[2 * w + l] = raw[BIAS_BN * h + q];
            rec[3 * w + l] = raw[BIAS_WN * h + q];
        }
    }
}

/// Pack one direction into float storage `E`.
pub fn pack_direction<E: Element>(
    raw: &RawDirection<'_>,
    layout: &GruLayout,
    alloc: &Arc<dyn Allocator>,
) -> Result<PackedDirection<E>> {
    raw.check(layout)?;

    let (xcl, hcl) = (layout.xc(), layout.hc());
    let mut xc = AlignedVec::<E>::try_zeroed(xcl.len(), alloc)?;
    let mut hc = AlignedVec::<E>::try_zeroed(hcl.len(), alloc)?;
    let mut bias = AlignedVec::<f32>::try_zeroed(4 * layout.num_output, alloc)?;

    pack_block(raw.weight_xc, &xcl, &mut xc[..], |_, v| E::from_f32(v));
    pack_block(raw.weight_hc, &hcl, &mut hc[..], |_, v| E::from_f32(v));
    pack_bias(raw.bias_c, layout, &mut bias[..]);

    Ok(PackedDirection {
        xc,
        hc,
        bias,
        descales: None,
    })
}

/// Per-row (scale, descale) of a row-major `rows x k` matrix.
pub fn row_scales(raw: &[f32], rows: usize, k: usize) -> (Vec<f32>, Vec<f32>) {
    (0..rows)
        .map(|r| scale_pair(absmax(&raw[r * k..(r + 1) * k])))
        .unzip()
}

/// Pack one direction with static per-row int8 quantization.
pub fn pack_direction_int8(
    raw: &RawDirection<'_>,
    layout: &GruLayout,
    alloc: &Arc<dyn Allocator>,
) -> Result<PackedDirection<i8>> {
    raw.check(layout)?;

    let (h, i) = (layout.num_output, layout.input_size);
    let (xcl, hcl) = (layout.xc(), layout.hc());
    let mut xc = AlignedVec::<i8>::try_zeroed(xcl.len(), alloc)?;
    let mut hc = AlignedVec::<i8>::try_zeroed(hcl.len(), alloc)?;
    let mut bias = AlignedVec::<f32>::try_zeroed(4 * h, alloc)?;
    let mut descales = AlignedVec::<f32>::try_zeroed(6 * h, alloc)?;

    let (xc_scales, xc_descales) = row_scales(raw.weight_xc, 3 * h, i);
    let (hc_scales, hc_descales) = row_scales(raw.weight_hc, 3 * h, h);

    pack_block(raw.weight_xc, &xcl, &mut xc[..], |row, v| quantize_value(v, xc_scales[row]));
    pack_block(raw.weight_hc, &hcl, &mut hc[..], |row, v| quantize_value(v, hc_scales[row]));
    pack_bias(raw.bias_c, layout, &mut bias[..]);

    for r in 0..layout.records() {
        let (q0, w) = layout.record_units(r);
        let rec = &mut descales[layout.descale_range(r)];
        for gate in 0..3 {
            for l in 0..w {
                let row = gate * h + q0 + l;
                rec[gate * w + l] = xc_descales[row];
                rec[(3 + gate) * w + l] = hc_descales[row];
            }
        }
    }

    Ok(PackedDirection {
        xc,
        hc,
        bias,
        descales: Some(descales),
    })
}

/// Pack every direction, directions in parallel.
pub fn pack_gru<E: Element>(
    raws: &[RawDirection<'_>],
    layout: &GruLayout,
    alloc: &Arc<dyn Allocator>,
) -> Result<Vec<PackedDirection<E>>> {
    raws.par_iter()
        .map(|raw| pack_direction::<E>(raw, layout, alloc))
        .collect()
}

/// int8 counterpart of `pack_gru`.
pub fn pack_gru_int8(
    raws: &[RawDirection<'_>],
    layout: &GruLayout,
    alloc: &Arc<dyn Allocator>,
) -> Result<Vec<PackedDirection<i8>>> {
    raws.par_iter()
        .map(|raw| pack_direction_int8(raw, layout, alloc))
        .collect()
}

fn unpack_with<E: Zeroable, F>(packed: &PackedDirection<E>, layout: &GruLayout, decode: F) -> RawWeights
where
    F: Fn(E, usize, usize) -> f32,
{
    let (h, i) = (layout.num_output, layout.input_size);
    let (xcl, hcl) = (layout.xc(), layout.hc());
    let mut weight_xc = vec![0.0f32; xcl.len()];
    let mut weight_hc = vec![0.0f32; hcl.len()];
    let mut bias_c = vec![0.0f32; 4 * h];

    for gate in 0..3 {
        for q in 0..h {
            let row = gate * h + q;
            for c in 0..i {
                weight_xc[row * i + c] = decode(packed.xc[xcl.index(q, gate, c)], q, gate);
            }
            for c in 0..h {
                weight_hc[row * h + c] = decode(packed.hc[hcl.index(q, gate, c)], q, 3 + gate);
            }
        }
    }

    for r in 0..layout.records() {
        let (q0, w) = layout.record_units(r);
        let rec = &packed.bias[layout.bias_range(r)];
        for l in 0..w {
            let q = q0 + l;
            bias_c[BIAS_R * h + q] = rec[l];
            bias_c[BIAS_U * h + q] = rec[w + l];
            bias_c[BIAS_BN * h + q] = rec[2 * w + l];
            bias_c[BIAS_WN * h + q] = rec[3 * w + l];
        }
    }

    RawWeights {
        weight_xc,
        bias_c,
        weight_hc,
    }
}

/// Invert the packing permutation.
pub fn unpack_direction<E: Element>(packed: &PackedDirection<E>, layout: &GruLayout) -> RawWeights {
    unpack_with(packed, layout, |v, _, _| v.to_f32())
}

/// Invert packing and dequantize an int8 direction.
pub fn dequantize_direction(packed: &PackedDirection<i8>, layout: &GruLayout) -> Result<RawWeights> {
    let descales = packed
        .descales
        .as_ref()
        .ok_or_else(|| GruError::Other("int8 pack has no descale table".into()))?;
    let xcl = layout.xc();
    Ok(unpack_with(packed, layout, |v, q, slot| {
        let s = xcl.locate(q);
        let rec = &descales[layout.descale_range(s.record)];
        v as f32 * rec[slot * s.width + s.lane]
    }))
}
