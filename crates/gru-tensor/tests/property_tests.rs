//! Property-based tests for packing and quantization.
//!
//! - unpack(pack(w)) == w exactly for every lane width and shape
//! - packing is deterministic
//! - dynamic quantization error stays within half a step per value

use gru_tensor::pack::{pack_direction, unpack_direction, GruLayout, RawWeights};
use gru_tensor::quant::quantize_dynamic;
use gru_tensor::system;
use proptest::prelude::*;

fn raw_strategy() -> impl Strategy<Value = (usize, usize, RawWeights)> {
    (1usize..12, 1usize..10).prop_flat_map(|(h, i)| {
        (
            Just(h),
            Just(i),
            prop::collection::vec(-4.0f32..4.0, 3 * h * i),
            prop::collection::vec(-4.0f32..4.0, 4 * h),
            prop::collection::vec(-4.0f32..4.0, 3 * h * h),
        )
            .prop_map(|(h, i, weight_xc, bias_c, weight_hc)| {
                (
                    h,
                    i,
                    RawWeights {
                        weight_xc,
                        bias_c,
                        weight_hc,
                    },
                )
            })
    })
}

proptest! {
    #[test]
    fn pack_roundtrip_is_exact(
        (h, i, raw) in raw_strategy(),
        lanes in prop::sample::select(vec![1usize, 4, 8]),
    ) {
        let layout = GruLayout::new(lanes, h, i);
        let packed = pack_direction::<f32>(&raw.as_direction(), &layout, &system()).unwrap();
        prop_assert_eq!(unpack_direction(&packed, &layout), raw);
    }

    #[test]
    fn pack_twice_is_identical((h, i, raw) in raw_strategy()) {
        let layout = GruLayout::new(4, h, i);
        let a = pack_direction::<f32>(&raw.as_direction(), &layout, &system()).unwrap();
        let b = pack_direction::<f32>(&raw.as_direction(), &layout, &system()).unwrap();
        prop_assert_eq!(&a.xc[..], &b.xc[..]);
        prop_assert_eq!(&a.hc[..], &b.hc[..]);
        prop_assert_eq!(&a.bias[..], &b.bias[..]);
    }

    #[test]
    fn quantize_error_bounded(x in prop::collection::vec(-100.0f32..100.0, 1..64)) {
        let mut q = vec![0i8; x.len()];
        let descale = quantize_dynamic(&x, &mut q);
        prop_assert!(descale.is_finite());
        for (&v, &qi) in x.iter().zip(&q) {
            prop_assert!((qi as f32 * descale - v).abs() <= descale * 0.5 + 1e-4);
        }
    }
}
