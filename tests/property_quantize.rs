//! Property-based tests for quantization and tensor representation laws
//!
//! These tests use proptest to verify the quantization round-trip bound,
//! the lazy-coherence laws of the dual-representation tensor, and sampler
//! degeneracy across arbitrary inputs.

use proptest::prelude::*;

use inferencia::tensor::{dequantize, quantize, Tensor};
use inferencia::{InferenciaError, Sampler};

/// Strategy: a float vector whose length is `groups * group_size`
fn grouped_values() -> impl Strategy<Value = (Vec<f32>, u32)> {
    (1usize..8, prop::sample::select(vec![2u32, 4, 8, 16, 32])).prop_flat_map(
        |(groups, group_size)| {
            let len = groups * group_size as usize;
            (
                prop::collection::vec(-100.0f32..100.0, len..=len),
                Just(group_size),
            )
        },
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Round-trip error is bounded by max(|group|)/127 per element
    #[test]
    fn prop_roundtrip_error_bounded((values, group_size) in grouped_values()) {
        let qt = quantize(&values, group_size).expect("valid group size");
        let back = dequantize(&qt);
        prop_assert_eq!(back.len(), values.len());

        let gs = group_size as usize;
        for (group_idx, (orig, deq)) in values.chunks_exact(gs).zip(back.chunks_exact(gs)).enumerate() {
            let bound = orig.iter().map(|v| v.abs()).fold(0.0f32, f32::max) / 127.0;
            for (a, b) in orig.iter().zip(deq.iter()) {
                // Half a quantization step plus float slack
                prop_assert!(
                    (a - b).abs() <= bound + 1e-5,
                    "group {}: {} vs {}", group_idx, a, b
                );
            }
        }
    }

    /// Scales are always positive, even for all-zero groups
    #[test]
    fn prop_scales_positive((values, group_size) in grouped_values()) {
        let qt = quantize(&values, group_size).expect("valid group size");
        prop_assert!(qt.s.iter().all(|&s| s > 0.0));
    }

    /// Quantization is deterministic
    #[test]
    fn prop_quantize_deterministic((values, group_size) in grouped_values()) {
        let a = quantize(&values, group_size).expect("valid group size");
        let b = quantize(&values, group_size).expect("valid group size");
        prop_assert_eq!(a, b);
    }

    /// After `quant_mut` then `float`, the float form equals the
    /// dequantized payload
    #[test]
    fn prop_lazy_coherence_quant_to_float((values, group_size) in grouped_values()) {
        let mut t = Tensor::zeros(values.len());
        t.float_mut().expect("float").copy_from_slice(&values);

        t.quant_mut(group_size).expect("quantize");
        let expected = dequantize(t.quant().expect("quant payload"));
        let actual = t.float().expect("float").to_vec();
        prop_assert_eq!(actual, expected);
    }

    /// After `float_mut` then `quant_with`, the quantized form equals a
    /// fresh quantization of the float form
    #[test]
    fn prop_lazy_coherence_float_to_quant((values, group_size) in grouped_values()) {
        let mut t = Tensor::zeros(values.len());
        t.float_mut().expect("float").copy_from_slice(&values);

        let expected = quantize(&values, group_size).expect("quantize");
        let actual = t.quant_with(group_size).expect("quant view").clone();
        prop_assert_eq!(actual, expected);
    }

    /// A second quantized access with any different group size is refused
    #[test]
    fn prop_requantize_refused(
        (values, group_size) in grouped_values(),
        other in prop::sample::select(vec![2u32, 4, 8, 16, 32]),
    ) {
        prop_assume!(other != group_size);

        let mut t = Tensor::zeros(values.len());
        t.float_mut().expect("float").copy_from_slice(&values);
        t.quant_mut(group_size).expect("first quantization");

        let err = t.quant_mut(other).expect_err("must refuse");
        prop_assert_eq!(err, InferenciaError::ReQuantizeRefused {
            existing: group_size,
            requested: other,
        });
    }

    /// Nucleus sampling at vanishing temperature agrees with argmax
    /// whenever the maximum is unique
    #[test]
    fn prop_nucleus_degenerates_to_argmax(
        logits in prop::collection::vec(-5.0f32..5.0, 4..32),
        seed in 1u64..1000,
    ) {
        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let unique = logits.iter().filter(|&&v| (v - max).abs() < 0.3).count() == 1;
        prop_assume!(unique);

        let mut greedy = Sampler::argmax();
        let expected = greedy.sample(&logits);

        let mut nucleus = Sampler::nucleus(logits.len(), 1e-6, 0.9, seed);
        for _ in 0..10 {
            prop_assert_eq!(nucleus.sample(&logits), expected);
        }
    }
}
