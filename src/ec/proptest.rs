//! Property-Based Tests for Erasure Coding
//!
//! # Test Properties
//!
//! 1. **Roundtrip Correctness**: decode(encode(data)) = data, any length
//! 2. **Any k of n**: every subset of at least k shards decodes
//! 3. **Loss Detection**: fewer than k valid shards fails with `UnrecoverableLoss`
//! 4. **Determinism**: same input always produces same shards

#![cfg(test)]

use proptest::prelude::*;

use super::encoder::{create_codec, shard_geometry, EncodedObject, ShardInput};
use crate::domain::ErasureScheme;
use crate::error::Error;

// =============================================================================
// Property Strategies
// =============================================================================

/// k: 2-8 data shards, m: 1-4 parity shards
fn ec_config_strategy() -> impl Strategy<Value = ErasureScheme> {
    (2usize..=8, 1usize..=4).prop_map(|(k, m)| ErasureScheme::new(k, m))
}

fn small_ec_config_strategy() -> impl Strategy<Value = ErasureScheme> {
    (2usize..=4, 1usize..=3).prop_map(|(k, m)| ErasureScheme::new(k, m))
}

/// Includes the empty object.
fn data_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..4000)
}

/// A scheme together with a bitmask selecting which shards survive.
fn survivors_strategy() -> impl Strategy<Value = (ErasureScheme, Vec<bool>)> {
    small_ec_config_strategy().prop_flat_map(|scheme| {
        (
            Just(scheme),
            prop::collection::vec(any::<bool>(), scheme.total_shards()),
        )
    })
}

fn keep(encoded: &EncodedObject, mask: &[bool]) -> Vec<ShardInput> {
    encoded
        .shards
        .iter()
        .filter(|s| mask[s.index])
        .map(|s| ShardInput::new(s.index, s.payload.clone()))
        .collect()
}

// =============================================================================
// Roundtrip Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Encoding then decoding without any losses returns the original data.
    #[test]
    fn prop_roundtrip_no_loss(
        scheme in ec_config_strategy(),
        data in data_strategy(),
    ) {
        let (encoder, decoder) = create_codec(scheme)?;
        let encoded = encoder.encode(&data)?;
        prop_assert_eq!(encoded.shards.len(), scheme.total_shards());

        let all = vec![true; scheme.total_shards()];
        let recovered = decoder.decode("p", keep(&encoded, &all), &encoded.shard_checksums(), encoded.pad_len)?;

        let data_len = data.len();
        prop_assert_eq!(recovered, data, "Roundtrip failed for {} with data_len={}", scheme, data_len);
    }

    /// Decode succeeds iff at least k shards survive, whatever their kinds.
    #[test]
    fn prop_any_k_of_n(
        (scheme, mask) in survivors_strategy(),
        data in prop::collection::vec(any::<u8>(), 1..2000),
    ) {
        let (encoder, decoder) = create_codec(scheme)?;
        let encoded = encoder.encode(&data)?;
        let survivors = mask.iter().filter(|&&b| b).count();

        let result = decoder.decode("p", keep(&encoded, &mask), &encoded.shard_checksums(), encoded.pad_len);

        if survivors >= scheme.data_shards {
            prop_assert_eq!(result?, data);
        } else {
            let is_loss = matches!(result, Err(Error::UnrecoverableLoss { .. }));
            prop_assert!(is_loss, "{} survivors of {} should be unrecoverable", survivors, scheme);
        }
    }

    /// Reconstructing the full layout reproduces every original shard.
    #[test]
    fn prop_reconstruct_all_matches_original(
        (scheme, mask) in survivors_strategy(),
        data in prop::collection::vec(any::<u8>(), 1..2000),
    ) {
        let survivors = mask.iter().filter(|&&b| b).count();
        prop_assume!(survivors >= scheme.data_shards);

        let (encoder, decoder) = create_codec(scheme)?;
        let encoded = encoder.encode(&data)?;
        let rebuilt = decoder.reconstruct_all("p", keep(&encoded, &mask), &encoded.shard_checksums())?;

        for (original, payload) in encoded.shards.iter().zip(&rebuilt) {
            prop_assert_eq!(&original.payload, payload);
        }
    }
}

// =============================================================================
// Layout Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    /// Data shards concatenated are the object followed by pad_len zeros.
    #[test]
    fn prop_data_shards_are_padded_object(
        scheme in small_ec_config_strategy(),
        data in data_strategy(),
    ) {
        let (encoder, _) = create_codec(scheme)?;
        let encoded = encoder.encode(&data)?;

        let (shard_size, pad_len) = shard_geometry(data.len(), scheme.data_shards);
        prop_assert_eq!(encoded.shard_size, shard_size);
        prop_assert_eq!(encoded.pad_len, pad_len);

        let mut concatenated: Vec<u8> = Vec::new();
        for shard in encoded.shards.iter().take(scheme.data_shards) {
            prop_assert_eq!(shard.payload.len(), shard_size);
            concatenated.extend_from_slice(&shard.payload);
        }
        prop_assert_eq!(concatenated.len(), data.len() + pad_len);
        prop_assert_eq!(&concatenated[..data.len()], data.as_slice());
        prop_assert!(concatenated[data.len()..].iter().all(|&b| b == 0));
    }

    /// Encoding is deterministic across encoder instances.
    #[test]
    fn prop_encoding_deterministic(
        scheme in small_ec_config_strategy(),
        data in data_strategy(),
    ) {
        let (first, _) = create_codec(scheme)?;
        let (second, _) = create_codec(scheme)?;

        let a = first.encode(&data)?;
        let b = second.encode(&data)?;
        prop_assert_eq!(a.shard_checksums(), b.shard_checksums());
    }
}
