//! The GRU layer.
//!
//! Lifecycle:
//! 1. `Gru::new(config)`
//! 2. `load_weights(weights)`: raw gate-major blocks, shape checked
//! 3. `create_pipeline(&ctx)`: pick the storage precision and ISA, pack (and
//!    for int8, quantize) every direction; light mode drops the raw weights
//! 4. `forward` / `forward_multi`, any number of times
//!
//! Sequences are 2-D tensors with `w = input_size` features and `h = T`
//! timesteps. Outputs are `w = H * dirs`, `h = T` in the input's element
//! type. Hidden state tensors are `w = H`, `h = dirs`.

use half::{bf16, f16};

use gru_core::{GruError, Result};
use gru_kernels::{
    pipeline_precision, run_direction, run_direction_int8, select_precision, Isa, Precision,
};
use gru_tensor::codec::Element;
use gru_tensor::pack::{pack_gru, pack_gru_int8, GruLayout, PackedDirection};
use gru_tensor::quant::dynamic_quantize;
use gru_tensor::verify::gru_sequence_ref;
use gru_tensor::{AlignedVec, ElemType, Storable, Tensor};

use crate::config::GruConfig;
use crate::context::ExecContext;
use crate::direction::orchestrate;
use crate::weights::GruWeights;

/// Packed weights in the pipeline's storage precision.
#[derive(Debug)]
pub enum PackedWeights {
    F32(Vec<PackedDirection<f32>>),
    F16(Vec<PackedDirection<f16>>),
    Bf16(Vec<PackedDirection<bf16>>),
    Int8(Vec<PackedDirection<i8>>),
}

impl PackedWeights {
    pub fn size_bytes(&self) -> usize {
        match self {
            PackedWeights::F32(p) => p.iter().map(PackedDirection::size_bytes).sum(),
            PackedWeights::F16(p) => p.iter().map(PackedDirection::size_bytes).sum(),
            PackedWeights::Bf16(p) => p.iter().map(PackedDirection::size_bytes).sum(),
            PackedWeights::Int8(p) => p.iter().map(PackedDirection::size_bytes).sum(),
        }
    }
}

/// Everything `create_pipeline` decided and produced.
#[derive(Debug)]
pub struct Pipeline {
    pub precision: Precision,
    pub isa: Isa,
    pub layout: GruLayout,
    pub weights: PackedWeights,
}

/// Result of `forward_multi`.
#[derive(Debug, Clone)]
pub struct GruOutput {
    /// `w = H * dirs`, `h = T`.
    pub output: Tensor,
    /// `w = H`, `h = dirs`, when requested.
    pub hidden: Option<Tensor>,
}

#[derive(Debug)]
pub struct Gru {
    config: GruConfig,
    weights: Option<GruWeights>,
    pipeline: Option<Pipeline>,
    released: bool,
}

impl Gru {
    pub fn new(config: GruConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            weights: None,
            pipeline: None,
            released: false,
        })
    }

    pub fn config(&self) -> &GruConfig {
        &self.config
    }

    /// Raw weights, if loaded and not released by light mode.
    pub fn weights(&self) -> Option<&GruWeights> {
        self.weights.as_ref()
    }

    pub fn pipeline(&self) -> Option<&Pipeline> {
        self.pipeline.as_ref()
    }

    /// Install raw weights. Any existing pipeline is discarded.
    pub fn load_weights(&mut self, weights: GruWeights) -> Result<()> {
        weights.validate()?;
        if !weights.matches(&self.config) {
            let w = weights.config();
            return Err(GruError::shape(
                &[self.config.input_size, self.config.num_output, self.config.num_directions()],
                &[w.input_size, w.num_output, w.num_directions()],
            ));
        }
        self.weights = Some(weights);
        self.pipeline = None;
        self.released = false;
        Ok(())
    }

    /// Pack weights for the context's ISA and storage precision.
    pub fn create_pipeline(&mut self, ctx: &ExecContext) -> Result<()> {
        let weights = match &self.weights {
            Some(w) => w,
            None if self.released => return Err(GruError::WeightsReleased),
            None => return Err(GruError::InvalidConfig("no weights loaded".into())),
        };

        let precision = pipeline_precision(&ctx.caps, &ctx.config, self.config.int8)?;
        let isa = ctx.isa();
        let layout = GruLayout::new(isa.lanes(), self.config.num_output, self.config.input_size);
        let raws = weights.directions()?;
        let alloc = &ctx.blob_alloc;

        let packed = ctx.install(|| -> Result<PackedWeights> {
            Ok(match precision {
                Precision::F32 => PackedWeights::F32(pack_gru::<f32>(&raws, &layout, alloc)?),
                Precision::F16 => PackedWeights::F16(pack_gru::<f16>(&raws, &layout, alloc)?),
                Precision::Bf16 => PackedWeights::Bf16(pack_gru::<bf16>(&raws, &layout, alloc)?),
                Precision::Int8 => PackedWeights::Int8(pack_gru_int8(&raws, &layout, alloc)?),
            })
        })?;

        log::info!(
            "GRU pipeline: H={} I={} {:?} precision={} isa={} packed={} bytes",
            self.config.num_output,
            self.config.input_size,
            self.config.direction,
            precision,
            isa,
            packed.size_bytes()
        );

        self.pipeline = Some(Pipeline {
            precision,
            isa,
            layout,
            weights: packed,
        });

        if ctx.config.lightmode {
            log::debug!("light mode: releasing raw GRU weights");
            self.weights = None;
            self.released = true;
        }
        Ok(())
    }

    /// Run a whole sequence from a zero hidden state.
    pub fn forward(&self, input: &Tensor, ctx: &ExecContext) -> Result<Tensor> {
        self.forward_multi(input, None, false, ctx).map(|o| o.output)
    }

    /// Run a sequence, optionally continuing from `hidden_in` and returning
    /// the final hidden state.
    pub fn forward_multi(
        &self,
        input: &Tensor,
        hidden_in: Option<&Tensor>,
        want_hidden: bool,
        ctx: &ExecContext,
    ) -> Result<GruOutput> {
        let pipeline = self.pipeline.as_ref().ok_or(GruError::PipelineNotReady)?;
        let (h, dirs) = (self.config.num_output, self.config.num_directions());

        self.check_input(input)?;
        let elem = input.elem();
        let precision = select_precision(&ctx.caps, &ctx.config, self.config.int8, elem)?;
        if precision != pipeline.precision {
            return Err(GruError::Unsupported(format!(
                "pipeline packed for {}, {} input needs {}",
                pipeline.precision, elem, precision
            )));
        }
        let steps = input.h();

        // Every allocation happens before the recurrence starts.
        let mut hidden = AlignedVec::<f32>::try_zeroed(h * dirs, &ctx.workspace_alloc)?;
        if let Some(hin) = hidden_in {
            if hin.total() != h * dirs || hin.w() != h {
                return Err(GruError::shape(&[h, dirs], &hin.shape()));
            }
            if hin.elem() != elem {
                return Err(GruError::Unsupported(format!(
                    "hidden state is {} but input is {}",
                    hin.elem(),
                    elem
                )));
            }
            hidden.copy_from_slice(&hin.to_f32_vec()?);
        }
        let mut output = Tensor::new_2d_in(h * dirs, steps, elem, &ctx.blob_alloc)?;
        let mut hidden_out = if want_hidden {
            Some(Tensor::new_2d_in(h, dirs, elem, &ctx.blob_alloc)?)
        } else {
            None
        };

        ctx.install(|| match (&pipeline.weights, elem) {
            (PackedWeights::F32(p), ElemType::F32) => {
                self.run_float::<f32>(pipeline, p, input, &mut hidden, &mut output, ctx)
            }
            (PackedWeights::F16(p), ElemType::F16) => {
                self.run_float::<f16>(pipeline, p, input, &mut hidden, &mut output, ctx)
            }
            (PackedWeights::Bf16(p), ElemType::Bf16) => {
                self.run_float::<bf16>(pipeline, p, input, &mut hidden, &mut output, ctx)
            }
            (PackedWeights::Int8(p), ElemType::F32) => {
                self.run_int8::<f32>(pipeline, p, input, &mut hidden, &mut output, ctx)
            }
            (PackedWeights::Int8(p), ElemType::F16) => {
                self.run_int8::<f16>(pipeline, p, input, &mut hidden, &mut output, ctx)
            }
            (PackedWeights::Int8(p), ElemType::Bf16) => {
                self.run_int8::<bf16>(pipeline, p, input, &mut hidden, &mut output, ctx)
            }
            (_, other) => Err(GruError::Unsupported(format!(
                "{} pipeline cannot run {} input",
                pipeline.precision, other
            ))),
        })?;

        if let Some(t) = hidden_out.as_mut() {
            match elem {
                ElemType::F32 => encode_into::<f32>(&hidden, t)?,
                ElemType::F16 => encode_into::<f16>(&hidden, t)?,
                ElemType::Bf16 => encode_into::<bf16>(&hidden, t)?,
                ElemType::I8 => return Err(GruError::Unsupported("i8 hidden state".into())),
            }
        }

        Ok(GruOutput {
            output,
            hidden: hidden_out,
        })
    }

    fn check_input(&self, input: &Tensor) -> Result<()> {
        if input.dims() != 2 || input.w() != self.config.input_size || input.h() == 0 {
            return Err(GruError::shape(&[self.config.input_size, input.h().max(1)], &input.shape()));
        }
        if input.elempack() != 1 {
            return Err(GruError::Unsupported(format!(
                "input elempack {} (only unpacked sequences are accepted)",
                input.elempack()
            )));
        }
        Ok(())
    }

    fn run_float<E: Element + Storable>(
        &self,
        pipeline: &Pipeline,
        packed: &[PackedDirection<E>],
        input: &Tensor,
        hidden: &mut [f32],
        output: &mut Tensor,
        ctx: &ExecContext,
    ) -> Result<()> {
        let (layout, isa, steps) = (pipeline.layout, pipeline.isa, input.h());
        let src = input.data::<E>()?;
        let dst = output.data_mut::<E>()?;
        orchestrate(
            self.config.direction,
            &layout,
            steps,
            false,
            hidden,
            dst,
            &ctx.workspace_alloc,
            |d, reverse, h, out, scratch| {
                gru_kernels::with_batch!(isa, B => run_direction::<B, E>(
                    &packed[d], &layout, src, steps, reverse, h, out, scratch
                ))
            },
        )
    }

    fn run_int8<E: Element + Storable>(
        &self,
        pipeline: &Pipeline,
        packed: &[PackedDirection<i8>],
        input: &Tensor,
        hidden: &mut [f32],
        output: &mut Tensor,
        ctx: &ExecContext,
    ) -> Result<()> {
        let (layout, isa, steps) = (pipeline.layout, pipeline.isa, input.h());
        let quantized = dynamic_quantize(input, &ctx.workspace_alloc)?;
        let dst = output.data_mut::<E>()?;
        orchestrate(
            self.config.direction,
            &layout,
            steps,
            true,
            hidden,
            dst,
            &ctx.workspace_alloc,
            |d, reverse, h, out, scratch| {
                gru_kernels::with_batch!(isa, B => run_direction_int8::<B, E>(
                    &packed[d], &layout, &quantized, reverse, h, out, scratch
                ))
            },
        )
    }
}

/// Scalar f32 forward over raw weights, merged the way the layer merges
/// directions. `hidden` is `H x dirs` and is carried in and out.
pub fn reference_output(
    weights: &GruWeights,
    input: &[f32],
    steps: usize,
    hidden: &mut [f32],
) -> Result<Vec<f32>> {
    let config = weights.config();
    let (h, i, dirs) = (config.num_output, config.input_size, config.num_directions());
    if input.len() != steps * i {
        return Err(GruError::shape(&[i, steps], &[input.len()]));
    }
    if hidden.len() != h * dirs {
        return Err(GruError::shape(&[h, dirs], &[hidden.len()]));
    }

    let mut out = vec![0.0f32; steps * h * dirs];
    for (d, state) in hidden.chunks_exact_mut(h).enumerate() {
        let raw = weights.direction(d)?;
        let rows = gru_sequence_ref(&raw, i, input, steps, config.direction.is_reversed(d), state);
        for t in 0..steps {
            let dst = t * h * dirs + d * h;
            out[dst..dst + h].copy_from_slice(&rows[t * h..(t + 1) * h]);
        }
    }
    Ok(out)
}

fn encode_into<E: Element + Storable>(values: &[f32], t: &mut Tensor) -> Result<()> {
    E::encode_from(values, t.data_mut::<E>()?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Direction;
    use gru_core::{status_code, RuntimeConfig};
    use gru_tensor::pack::unpack_direction;
    use gru_tensor::verify::max_diff;

    fn ctx(config: RuntimeConfig) -> ExecContext {
        ExecContext::new(config).unwrap()
    }

    fn seq(steps: usize, i: usize) -> Vec<f32> {
        (0..steps * i).map(|k| ((k as f32) * 0.37).sin()).collect()
    }

    fn layer(config: GruConfig, ctx: &ExecContext) -> Gru {
        let mut gru = Gru::new(config.clone()).unwrap();
        gru.load_weights(GruWeights::synthetic(&config, 42).unwrap()).unwrap();
        gru.create_pipeline(ctx).unwrap();
        gru
    }

    #[test]
    fn test_forward_before_pipeline() {
        let config = GruConfig::new(4, 2, Direction::Forward);
        let gru = Gru::new(config).unwrap();
        let input = Tensor::from_f32_2d(2, 1, &[0.0, 0.0]).unwrap();
        let result = gru.forward(&input, &ctx(RuntimeConfig::reference()));
        assert!(matches!(result, Err(GruError::PipelineNotReady)));
        assert_eq!(status_code(&result), -1);
    }

    #[test]
    fn test_pipeline_without_weights() {
        let mut gru = Gru::new(GruConfig::new(4, 2, Direction::Forward)).unwrap();
        assert!(gru.create_pipeline(&ctx(RuntimeConfig::reference())).is_err());
    }

    #[test]
    fn test_forward_matches_reference() {
        let ctx = ctx(RuntimeConfig::reference());
        let (h, i, steps) = (5, 3, 4);
        let config = GruConfig::new(h, i, Direction::Forward);
        let gru = layer(config.clone(), &ctx);

        let x = seq(steps, i);
        let out = gru.forward(&Tensor::from_f32_2d(i, steps, &x).unwrap(), &ctx).unwrap();
        assert_eq!(out.shape(), vec![h, steps]);

        let w = gru.weights().unwrap();
        let mut hidden = vec![0.0f32; h];
        let expected = gru_sequence_ref(&w.direction(0).unwrap(), i, &x, steps, false, &mut hidden);
        assert!(max_diff(&expected, out.data::<f32>().unwrap()) < 1e-5);
    }

    #[test]
    fn test_pipeline_unpacks_to_raw() {
        let ctx = ctx(RuntimeConfig::reference());
        let config = GruConfig::new(7, 3, Direction::Bidirectional);
        let gru = layer(config, &ctx);
        let pipeline = gru.pipeline().unwrap();
        let raw = gru.weights().unwrap();
        match &pipeline.weights {
            PackedWeights::F32(p) => {
                for (d, packed) in p.iter().enumerate() {
                    let back = unpack_direction(packed, &pipeline.layout);
                    let src = raw.direction(d).unwrap();
                    assert_eq!(back.weight_xc, src.weight_xc);
                    assert_eq!(back.bias_c, src.bias_c);
                    assert_eq!(back.weight_hc, src.weight_hc);
                }
            }
            other => panic!("expected f32 pipeline, got {:?}", other),
        }
    }

    #[test]
    fn test_lightmode_releases_weights() {
        let ctx = ctx(RuntimeConfig {
            lightmode: true,
            ..RuntimeConfig::reference()
        });
        let config = GruConfig::new(4, 2, Direction::Forward);
        let mut gru = layer(config, &ctx);
        assert!(gru.weights().is_none());
        assert!(matches!(gru.create_pipeline(&ctx), Err(GruError::WeightsReleased)));

        // The existing pipeline still runs.
        let input = Tensor::from_f32_2d(2, 2, &[0.1, 0.2, 0.3, 0.4]).unwrap();
        assert!(gru.forward(&input, &ctx).is_ok());
    }

    #[test]
    fn test_wrong_input_width() {
        let ctx = ctx(RuntimeConfig::reference());
        let gru = layer(GruConfig::new(4, 2, Direction::Forward), &ctx);
        let input = Tensor::from_f32_2d(3, 2, &[0.0; 6]).unwrap();
        assert!(matches!(gru.forward(&input, &ctx), Err(GruError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_f16_input_needs_fp16_pipeline() {
        let ctx = ctx(RuntimeConfig::reference());
        let gru = layer(GruConfig::new(4, 2, Direction::Forward), &ctx);
        let input = Tensor::from_values_2d::<f16>(2, 1, &[0.5, 0.5]).unwrap();
        assert!(matches!(gru.forward(&input, &ctx), Err(GruError::Unsupported(_))));
    }

    #[test]
    fn test_hidden_roundtrip_shape() {
        let ctx = ctx(RuntimeConfig::reference());
        let (h, i) = (3, 2);
        let gru = layer(GruConfig::new(h, i, Direction::Bidirectional), &ctx);
        let input = Tensor::from_f32_2d(i, 2, &seq(2, i)).unwrap();
        let out = gru.forward_multi(&input, None, true, &ctx).unwrap();
        let hidden = out.hidden.unwrap();
        assert_eq!(hidden.shape(), vec![h, 2]);

        // Forward hidden = last output row's left half, reverse hidden = first
        // output row's right half.
        let o = out.output.data::<f32>().unwrap();
        let hd = hidden.data::<f32>().unwrap();
        assert_eq!(&hd[..h], &o[2 * h..3 * h]);
        assert_eq!(&hd[h..], &o[h..2 * h]);
    }

    #[test]
    fn test_bad_hidden_shape() {
        let ctx = ctx(RuntimeConfig::reference());
        let gru = layer(GruConfig::new(3, 2, Direction::Forward), &ctx);
        let input = Tensor::from_f32_2d(2, 1, &[0.0, 0.0]).unwrap();
        let bad = Tensor::from_f32_2d(2, 1, &[0.0, 0.0]).unwrap();
        assert!(gru.forward_multi(&input, Some(&bad), false, &ctx).is_err());
    }

    #[test]
    fn test_load_mismatched_weights() {
        let mut gru = Gru::new(GruConfig::new(4, 2, Direction::Forward)).unwrap();
        let other = GruWeights::synthetic(&GruConfig::new(4, 3, Direction::Forward), 1).unwrap();
        assert!(gru.load_weights(other).is_err());
    }
}
