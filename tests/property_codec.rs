//! Property-based tests for the descriptor codec using proptest.
//!
//! Invariants under test:
//! - encode → decode round-trips every valid parameter record
//! - decode never panics, whatever bytes it is fed
//! - wrong-length input is always rejected, never misread

use proptest::prelude::*;

use despachar::{
    AlgorithmVariant, DType, FactorDescriptor, FftDescriptor, FftKind,
    FACTOR_DESCRIPTOR_LEN,
};

fn dtype_strategy() -> impl Strategy<Value = DType> {
    prop_oneof![Just(DType::F32), Just(DType::F64)]
}

fn fft_kind_strategy() -> impl Strategy<Value = FftKind> {
    prop_oneof![
        Just(FftKind::Forward),
        Just(FftKind::Inverse),
        Just(FftKind::RealForward),
        Just(FftKind::RealInverse),
    ]
}

prop_compose! {
    fn factor_descriptor_strategy()(
        dtype in dtype_strategy(),
        variant in 0u8..=1,
        batch in 1usize..64,
        rows in 1usize..32,
        cols in 1usize..32,
        pad in 0usize..8,
        workspace_bytes in 0usize..1_000_000,
    ) -> FactorDescriptor {
        FactorDescriptor {
            dtype,
            variant: AlgorithmVariant(variant),
            batch,
            rows,
            cols,
            lead_dim: cols + pad,
            workspace_bytes,
        }
    }
}

prop_compose! {
    fn fft_descriptor_strategy()(
        dtype in dtype_strategy(),
        kind in fft_kind_strategy(),
        extents in prop::collection::vec(1usize..128, 1..4),
        workspace_bytes in 0usize..1_000_000,
    ) -> FftDescriptor {
        FftDescriptor { dtype, kind, extents, workspace_bytes }
    }
}

proptest! {
    /// Factor descriptors survive the wire unchanged
    #[test]
    fn prop_factor_roundtrip(desc in factor_descriptor_strategy()) {
        let bytes = desc.encode().expect("valid record encodes");
        prop_assert_eq!(bytes.len(), FACTOR_DESCRIPTOR_LEN);
        let back = FactorDescriptor::decode(&bytes).expect("decodes");
        prop_assert_eq!(back, desc);
    }

    /// FFT descriptors survive the wire unchanged
    #[test]
    fn prop_fft_roundtrip(desc in fft_descriptor_strategy()) {
        let bytes = desc.encode().expect("valid record encodes");
        let back = FftDescriptor::decode(&bytes).expect("decodes");
        prop_assert_eq!(back, desc);
    }

    /// Identical bytes always decode to the identical descriptor
    #[test]
    fn prop_factor_decode_deterministic(desc in factor_descriptor_strategy()) {
        let bytes = desc.encode().expect("encodes");
        let first = FactorDescriptor::decode(&bytes).expect("decodes");
        let second = FactorDescriptor::decode(&bytes).expect("decodes");
        prop_assert_eq!(first, second);
    }

    /// Arbitrary junk never panics the factor decoder
    #[test]
    fn prop_factor_decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
        let _ = FactorDescriptor::decode(&bytes);
    }

    /// Arbitrary junk never panics the fft decoder
    #[test]
    fn prop_fft_decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
        let _ = FftDescriptor::decode(&bytes);
    }

    /// Any length other than the fixed factor layout is rejected
    #[test]
    fn prop_factor_wrong_length_rejected(
        desc in factor_descriptor_strategy(),
        cut in 1usize..FACTOR_DESCRIPTOR_LEN,
    ) {
        let bytes = desc.encode().expect("encodes");
        prop_assert!(FactorDescriptor::decode(&bytes[..cut]).is_err());
        let mut extended = bytes;
        extended.push(0);
        prop_assert!(FactorDescriptor::decode(&extended).is_err());
    }

    /// Truncating an fft descriptor breaks the declared-rank length check
    #[test]
    fn prop_fft_truncation_rejected(desc in fft_descriptor_strategy(), cut in 1usize..8) {
        let bytes = desc.encode().expect("encodes");
        let keep = bytes.len().saturating_sub(cut);
        prop_assert!(FftDescriptor::decode(&bytes[..keep]).is_err());
    }

    /// Distinct parameter records never encode to the same bytes
    #[test]
    fn prop_factor_encoding_injective(
        a in factor_descriptor_strategy(),
        b in factor_descriptor_strategy(),
    ) {
        let ea = a.encode().expect("encodes");
        let eb = b.encode().expect("encodes");
        if a != b {
            prop_assert_ne!(ea, eb);
        } else {
            prop_assert_eq!(ea, eb);
        }
    }
}
