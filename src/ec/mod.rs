//! Erasure Coding Engine
//!
//! Splits an object's bytes into k data shards and computes m parity shards;
//! reconstructs the object, or any missing shard, from any k valid shards.
//!
//! # Components
//!
//! - **Encoder/Decoder** (`encoder.rs`): systematic Reed-Solomon using the
//!   `reed-solomon-erasure` crate, with per-shard checksum verification
//!   before any shard is used.
//! - **Codec cache** ([`CodecCache`]): one shared codec per k+m scheme, so
//!   coordinators do not rebuild the coding matrix on every request.
//!
//! # Usage
//!
//! ```rust,ignore
//! use shardstor::ec::CodecCache;
//! use shardstor::domain::ErasureScheme;
//!
//! let codecs = CodecCache::new();
//! let encoded = codecs.encoder(ErasureScheme::new(4, 2))?.encode(b"Hello, World!")?;
//! ```

pub mod encoder;

#[cfg(test)]
mod proptest;

use std::sync::Arc;

use dashmap::DashMap;
use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::domain::ErasureScheme;
use crate::error::Result;

pub use encoder::{
    create_codec, shard_geometry, EcDecoder, EcEncoder, EncodedObject, EncodedShard, ShardInput,
};

/// Shared Reed-Solomon codecs keyed by scheme.
#[derive(Default)]
pub struct CodecCache {
    codecs: DashMap<ErasureScheme, Arc<ReedSolomon>>,
}

impl CodecCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn codec(&self, scheme: ErasureScheme) -> Result<Arc<ReedSolomon>> {
        if let Some(rs) = self.codecs.get(&scheme) {
            return Ok(Arc::clone(&rs));
        }
        let rs = encoder::build_codec(scheme)?;
        self.codecs.insert(scheme, Arc::clone(&rs));
        Ok(rs)
    }

    pub fn encoder(&self, scheme: ErasureScheme) -> Result<EcEncoder> {
        Ok(EcEncoder::with_codec(self.codec(scheme)?, scheme))
    }

    pub fn decoder(&self, scheme: ErasureScheme) -> Result<EcDecoder> {
        Ok(EcDecoder::with_codec(self.codec(scheme)?, scheme))
    }

    pub fn len(&self) -> usize {
        self.codecs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }
}
