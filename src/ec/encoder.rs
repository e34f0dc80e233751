//! Erasure Coding Encoder/Decoder
//!
//! Systematic Reed-Solomon over GF(2^8) using the `reed-solomon-erasure`
//! crate. The first k shards are the object bytes split into equal blocks
//! (zero-padded to a multiple of k); the remaining m shards are parity.

use std::sync::Arc;

use bytes::Bytes;
use reed_solomon_erasure::galois_8::ReedSolomon;
use tracing::{debug, instrument};

use crate::domain::{content_checksum, ErasureScheme, ShardKind};
use crate::error::{Error, Result};

// =============================================================================
// Encoded Output
// =============================================================================

/// One shard produced by the encoder.
#[derive(Debug, Clone)]
pub struct EncodedShard {
    pub index: usize,
    pub kind: ShardKind,
    pub checksum: String,
    pub payload: Bytes,
}

/// Result of encoding one object.
#[derive(Debug, Clone)]
pub struct EncodedObject {
    pub scheme: ErasureScheme,
    pub shards: Vec<EncodedShard>,
    pub shard_size: usize,
    /// Zero bytes appended to the last data block.
    pub pad_len: usize,
    pub original_len: usize,
}

impl EncodedObject {
    pub fn shard_checksums(&self) -> Vec<String> {
        self.shards.iter().map(|s| s.checksum.clone()).collect()
    }
}

/// Geometry of an object: `(shard_size, pad_len)`.
///
/// Empty objects still produce one-byte shards, since the codec rejects
/// zero-length shards.
pub fn shard_geometry(data_len: usize, data_shards: usize) -> (usize, usize) {
    let shard_size = data_len.div_ceil(data_shards).max(1);
    (shard_size, shard_size * data_shards - data_len)
}

// =============================================================================
// EC Encoder
// =============================================================================

/// Erasure coding encoder for creating parity shards from data shards
pub struct EcEncoder {
    rs: Arc<ReedSolomon>,
    scheme: ErasureScheme,
}

impl EcEncoder {
    /// Create a new encoder for a k+m scheme
    pub fn new(scheme: ErasureScheme) -> Result<Self> {
        Ok(Self {
            rs: build_codec(scheme)?,
            scheme,
        })
    }

    pub(crate) fn with_codec(rs: Arc<ReedSolomon>, scheme: ErasureScheme) -> Self {
        Self { rs, scheme }
    }

    pub fn scheme(&self) -> ErasureScheme {
        self.scheme
    }

    /// Encode an object into k data shards followed by m parity shards.
    #[instrument(skip(self, data), fields(data_len = data.len(), scheme = %self.scheme))]
    pub fn encode(&self, data: &[u8]) -> Result<EncodedObject> {
        let k = self.scheme.data_shards;
        let (shard_size, pad_len) = shard_geometry(data.len(), k);

        let mut shards: Vec<Vec<u8>> = Vec::with_capacity(self.scheme.total_shards());
        for i in 0..k {
            let start = (i * shard_size).min(data.len());
            let end = (start + shard_size).min(data.len());
            let mut shard = data[start..end].to_vec();
            shard.resize(shard_size, 0);
            shards.push(shard);
        }
        for _ in 0..self.scheme.parity_shards {
            shards.push(vec![0u8; shard_size]);
        }

        self.rs
            .encode(&mut shards)
            .map_err(|e| Error::EcEncodingFailed(format!("Reed-Solomon encoding failed: {}", e)))?;

        debug!(
            "Encoded {} bytes into {} shards of {} bytes each",
            data.len(),
            shards.len(),
            shard_size
        );

        let shards = shards
            .into_iter()
            .enumerate()
            .map(|(index, payload)| EncodedShard {
                index,
                kind: self.scheme.kind_of(index),
                checksum: content_checksum(&payload),
                payload: Bytes::from(payload),
            })
            .collect();

        Ok(EncodedObject {
            scheme: self.scheme,
            shards,
            shard_size,
            pad_len,
            original_len: data.len(),
        })
    }

    /// Verify that the parity shards are consistent with data shards
    pub fn verify(&self, shards: &[Vec<u8>]) -> Result<bool> {
        if shards.len() != self.scheme.total_shards() {
            return Err(Error::InvalidEcConfig(format!(
                "Expected {} shards, got {}",
                self.scheme.total_shards(),
                shards.len()
            )));
        }

        self.rs
            .verify(shards)
            .map_err(|e| Error::EcEncodingFailed(format!("Verification failed: {}", e)))
    }
}

// =============================================================================
// EC Decoder
// =============================================================================

/// A shard handed to the decoder, with its index in the k+m layout.
#[derive(Debug, Clone)]
pub struct ShardInput {
    pub index: usize,
    pub payload: Bytes,
}

impl ShardInput {
    pub fn new(index: usize, payload: impl Into<Bytes>) -> Self {
        Self {
            index,
            payload: payload.into(),
        }
    }
}

/// Erasure coding decoder for reconstructing objects and missing shards
pub struct EcDecoder {
    rs: Arc<ReedSolomon>,
    scheme: ErasureScheme,
}

impl EcDecoder {
    /// Create a new decoder for a k+m scheme
    pub fn new(scheme: ErasureScheme) -> Result<Self> {
        Ok(Self {
            rs: build_codec(scheme)?,
            scheme,
        })
    }

    pub(crate) fn with_codec(rs: Arc<ReedSolomon>, scheme: ErasureScheme) -> Self {
        Self { rs, scheme }
    }

    pub fn scheme(&self) -> ErasureScheme {
        self.scheme
    }

    /// Arrange supplied shards by index, dropping any whose checksum does
    /// not match `expected` or whose index or length is wrong.
    fn collect_valid(
        &self,
        object: &str,
        shards: Vec<ShardInput>,
        expected: &[String],
    ) -> Result<(Vec<Option<Vec<u8>>>, usize)> {
        let total = self.scheme.total_shards();
        if expected.len() != total {
            return Err(Error::InvalidEcConfig(format!(
                "Expected {} shard checksums, got {}",
                total,
                expected.len()
            )));
        }

        let mut slots: Vec<Option<Vec<u8>>> = vec![None; total];
        let mut shard_len: Option<usize> = None;
        let mut valid = 0;

        for shard in shards {
            if shard.index >= total || slots[shard.index].is_some() {
                debug!(object, index = shard.index, "Ignoring out-of-range or duplicate shard");
                continue;
            }
            if content_checksum(&shard.payload) != expected[shard.index] {
                debug!(object, index = shard.index, "Dropping shard with checksum mismatch");
                continue;
            }
            match shard_len {
                Some(len) if len != shard.payload.len() => continue,
                _ => shard_len = Some(shard.payload.len()),
            }
            slots[shard.index] = Some(shard.payload.to_vec());
            valid += 1;
        }

        if valid < self.scheme.data_shards {
            return Err(Error::UnrecoverableLoss {
                object: object.to_string(),
                available: valid,
                required: self.scheme.data_shards,
            });
        }

        Ok((slots, valid))
    }

    /// Decode the original bytes from any k valid shards.
    ///
    /// Each shard is checked against `expected` before use. Fails with
    /// `UnrecoverableLoss` when fewer than k shards survive the check.
    #[instrument(skip(self, shards, expected), fields(scheme = %self.scheme))]
    pub fn decode(
        &self,
        object: &str,
        shards: Vec<ShardInput>,
        expected: &[String],
        pad_len: usize,
    ) -> Result<Vec<u8>> {
        let k = self.scheme.data_shards;
        let (mut slots, valid) = self.collect_valid(object, shards, expected)?;

        let all_data_present = slots.iter().take(k).all(Option::is_some);
        if !all_data_present {
            self.rs
                .reconstruct_data(&mut slots)
                .map_err(|e| Error::EcReconstructionFailed {
                    object: object.to_string(),
                    reason: format!("Reed-Solomon data reconstruction failed: {}", e),
                })?;
            debug!("Reconstructed data shards from {}/{} available", valid, slots.len());
        }

        let shard_size = slots
            .iter()
            .flatten()
            .next()
            .map(Vec::len)
            .unwrap_or_default();
        let padded_len = shard_size * k;
        if pad_len > padded_len {
            return Err(Error::Corrupt(format!(
                "{}: pad length {} exceeds padded size {}",
                object, pad_len, padded_len
            )));
        }

        let mut data = Vec::with_capacity(padded_len);
        for s in slots.iter().take(k).flatten() {
            data.extend_from_slice(s);
        }
        data.truncate(padded_len - pad_len);

        Ok(data)
    }

    /// Rebuild every shard of the layout from any k valid shards.
    ///
    /// Returned payloads are in index order and carry their checksums.
    #[instrument(skip(self, shards, expected), fields(scheme = %self.scheme))]
    pub fn reconstruct_all(
        &self,
        object: &str,
        shards: Vec<ShardInput>,
        expected: &[String],
    ) -> Result<Vec<Bytes>> {
        let (mut slots, valid) = self.collect_valid(object, shards, expected)?;

        if valid < slots.len() {
            self.rs
                .reconstruct(&mut slots)
                .map_err(|e| Error::EcReconstructionFailed {
                    object: object.to_string(),
                    reason: format!("Reed-Solomon reconstruction failed: {}", e),
                })?;
            debug!("Reconstructed all shards from {}/{} available", valid, slots.len());
        }

        let mut rebuilt = Vec::with_capacity(slots.len());
        for (index, slot) in slots.into_iter().enumerate() {
            let payload = slot.ok_or_else(|| Error::EcReconstructionFailed {
                object: object.to_string(),
                reason: format!("shard {} missing after reconstruction", index),
            })?;
            if content_checksum(&payload) != expected[index] {
                return Err(Error::EcReconstructionFailed {
                    object: object.to_string(),
                    reason: format!("rebuilt shard {} does not match its checksum", index),
                });
            }
            rebuilt.push(Bytes::from(payload));
        }

        Ok(rebuilt)
    }
}

// =============================================================================
// Convenience Functions
// =============================================================================

pub(crate) fn build_codec(scheme: ErasureScheme) -> Result<Arc<ReedSolomon>> {
    scheme.validate()?;
    let rs = ReedSolomon::new(scheme.data_shards, scheme.parity_shards).map_err(|e| {
        Error::InvalidEcConfig(format!("Failed to create Reed-Solomon codec: {}", e))
    })?;
    Ok(Arc::new(rs))
}

/// Create an encoder/decoder pair with the same configuration
pub fn create_codec(scheme: ErasureScheme) -> Result<(EcEncoder, EcDecoder)> {
    let rs = build_codec(scheme)?;
    Ok((
        EcEncoder::with_codec(Arc::clone(&rs), scheme),
        EcDecoder::with_codec(rs, scheme),
    ))
}

/// Calculate storage overhead ratio (total/data)
pub fn storage_overhead(scheme: ErasureScheme) -> f64 {
    scheme.total_shards() as f64 / scheme.data_shards as f64
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn inputs(encoded: &EncodedObject, keep: impl Fn(usize) -> bool) -> Vec<ShardInput> {
        encoded
            .shards
            .iter()
            .filter(|s| keep(s.index))
            .map(|s| ShardInput::new(s.index, s.payload.clone()))
            .collect()
    }

    #[test]
    fn test_encoder_invalid_config() {
        assert!(EcEncoder::new(ErasureScheme::new(0, 2)).is_err());
        assert!(EcEncoder::new(ErasureScheme::new(4, 0)).is_err());
    }

    #[test]
    fn test_encode_is_systematic() {
        let (encoder, _) = create_codec(ErasureScheme::new(4, 2)).unwrap();
        let data = b"Hello, World! This is a test of erasure coding.";

        let encoded = encoder.encode(data).unwrap();
        assert_eq!(encoded.shards.len(), 6);
        assert_eq!(encoded.shard_size, 12);
        assert_eq!(encoded.pad_len, 1);

        // data shards are the object split in order
        let mut joined = Vec::new();
        for shard in encoded.shards.iter().take(4) {
            assert_eq!(shard.kind, ShardKind::Data);
            joined.extend_from_slice(&shard.payload);
        }
        assert_eq!(&joined[..data.len()], data);
        assert_eq!(encoded.shards[4].kind, ShardKind::Parity);

        let raw: Vec<Vec<u8>> = encoded.shards.iter().map(|s| s.payload.to_vec()).collect();
        assert!(encoder.verify(&raw).unwrap());
    }

    #[test]
    fn test_roundtrip_with_loss() {
        let (encoder, decoder) = create_codec(ErasureScheme::new(4, 2)).unwrap();
        let original = b"Testing recovery from shard loss with erasure coding!";

        let encoded = encoder.encode(original).unwrap();
        let shards = inputs(&encoded, |i| i != 1 && i != 4);

        let recovered = decoder
            .decode("t", shards, &encoded.shard_checksums(), encoded.pad_len)
            .unwrap();
        assert_eq!(recovered, original);
    }

    #[test]
    fn test_corrupt_shard_is_not_used() {
        let (encoder, decoder) = create_codec(ErasureScheme::new(4, 2)).unwrap();
        let original = vec![7u8; 1000];
        let encoded = encoder.encode(&original).unwrap();

        let mut shards = inputs(&encoded, |_| true);
        let mut bad = shards[0].payload.to_vec();
        bad[0] ^= 0xFF;
        shards[0].payload = Bytes::from(bad);

        // five valid shards remain, so decode still succeeds
        let recovered = decoder
            .decode("t", shards, &encoded.shard_checksums(), encoded.pad_len)
            .unwrap();
        assert_eq!(recovered, original);
    }

    #[test]
    fn test_decode_insufficient_shards() {
        let (encoder, decoder) = create_codec(ErasureScheme::new(4, 2)).unwrap();
        let encoded = encoder.encode(b"not enough shards survive").unwrap();
        let shards = inputs(&encoded, |i| i < 3);

        let result = decoder.decode("obj", shards, &encoded.shard_checksums(), encoded.pad_len);
        assert_matches!(
            result,
            Err(Error::UnrecoverableLoss {
                available: 3,
                required: 4,
                ..
            })
        );
    }

    #[test]
    fn test_empty_object() {
        let (encoder, decoder) = create_codec(ErasureScheme::new(4, 2)).unwrap();
        let encoded = encoder.encode(&[]).unwrap();
        assert_eq!(encoded.shard_size, 1);
        assert_eq!(encoded.pad_len, 4);

        let recovered = decoder
            .decode(
                "empty",
                inputs(&encoded, |i| i >= 2),
                &encoded.shard_checksums(),
                encoded.pad_len,
            )
            .unwrap();
        assert!(recovered.is_empty());
    }

    #[test]
    fn test_reconstruct_all_restores_missing_parity_and_data() {
        let (encoder, decoder) = create_codec(ErasureScheme::new(4, 2)).unwrap();
        let encoded = encoder.encode(&[42u8; 4096]).unwrap();

        let rebuilt = decoder
            .reconstruct_all("t", inputs(&encoded, |i| i != 0 && i != 5), &encoded.shard_checksums())
            .unwrap();
        assert_eq!(rebuilt.len(), 6);
        for (shard, payload) in encoded.shards.iter().zip(&rebuilt) {
            assert_eq!(&shard.payload, payload);
        }
    }

    #[test]
    fn test_shard_geometry() {
        assert_eq!(shard_geometry(100, 4), (25, 0));
        assert_eq!(shard_geometry(101, 4), (26, 3));
        assert_eq!(shard_geometry(0, 4), (1, 4));
    }

    #[test]
    fn test_storage_overhead() {
        assert!((storage_overhead(ErasureScheme::new(4, 2)) - 1.5).abs() < 0.001);
        assert!((storage_overhead(ErasureScheme::new(10, 2)) - 1.2).abs() < 0.001);
    }

    #[test]
    fn test_various_configurations() {
        for (k, m) in [(2, 1), (4, 2), (6, 3), (8, 4), (10, 4)] {
            let (encoder, decoder) = create_codec(ErasureScheme::new(k, m)).unwrap();
            let data = b"Test data for various configurations";
            let encoded = encoder.encode(data).unwrap();
            assert_eq!(encoded.shards.len(), k + m);

            // lose the first m shards
            let recovered = decoder
                .decode(
                    "t",
                    inputs(&encoded, |i| i >= m),
                    &encoded.shard_checksums(),
                    encoded.pad_len,
                )
                .unwrap();
            assert_eq!(recovered, data);
        }
    }
}
