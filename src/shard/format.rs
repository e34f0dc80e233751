//! Persisted shard format
//!
//! ```text
//! [MAGIC "SHRD":4][VERSION:1][KIND:1][SHARD_INDEX:2][PAYLOAD_LEN:8][BLAKE3:32]
//! [BUCKET_LEN:2][BUCKET:n][KEY_LEN:2][KEY:n][VERSION_ID:16][PAYLOAD:PAYLOAD_LEN]
//! ```
//!
//! Integers are little-endian. The checksum covers the payload only.

use bytes::{Buf, BufMut, Bytes};
use uuid::Uuid;

use crate::domain::{ObjectId, ShardKind, VersionId};
use crate::error::{Error, Result};

pub const SHARD_MAGIC: [u8; 4] = *b"SHRD";
pub const FORMAT_VERSION: u8 = 1;

/// Fixed-size prefix: magic, version, kind, index, payload length, checksum.
const FIXED_LEN: usize = 4 + 1 + 1 + 2 + 8 + 32;

/// Header stored in front of every shard payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardHeader {
    pub object_id: ObjectId,
    pub shard_index: usize,
    pub kind: ShardKind,
    pub payload_len: u64,
    pub checksum: [u8; 32],
}

impl ShardHeader {
    /// Build a header for `payload` using the hex checksum supplied by the writer.
    pub fn new(
        object_id: ObjectId,
        shard_index: usize,
        kind: ShardKind,
        payload_len: u64,
        checksum_hex: &str,
    ) -> Result<Self> {
        if shard_index > u16::MAX as usize {
            return Err(Error::InvalidShardFormat(format!(
                "shard index {} does not fit the header",
                shard_index
            )));
        }
        let raw = hex::decode(checksum_hex)
            .map_err(|e| Error::InvalidShardFormat(format!("bad checksum hex: {}", e)))?;
        let checksum: [u8; 32] = raw
            .try_into()
            .map_err(|_| Error::InvalidShardFormat("checksum must be 32 bytes".to_string()))?;
        Ok(Self {
            object_id,
            shard_index,
            kind,
            payload_len,
            checksum,
        })
    }

    pub fn checksum_hex(&self) -> String {
        hex::encode(self.checksum)
    }

    /// Whether `payload` hashes to the stored checksum.
    pub fn verifies(&self, payload: &[u8]) -> bool {
        payload.len() as u64 == self.payload_len && blake3::hash(payload).as_bytes() == &self.checksum
    }

    pub fn encoded_len(&self) -> usize {
        FIXED_LEN + 2 + self.object_id.bucket.len() + 2 + self.object_id.key.len() + 16
    }

    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        let bucket = self.object_id.bucket.as_bytes();
        let key = self.object_id.key.as_bytes();
        if bucket.len() > u16::MAX as usize || key.len() > u16::MAX as usize {
            return Err(Error::InvalidShardFormat(
                "bucket or key too long for shard header".to_string(),
            ));
        }

        out.reserve(self.encoded_len());
        out.put_slice(&SHARD_MAGIC);
        out.put_u8(FORMAT_VERSION);
        out.put_u8(self.kind.as_u8());
        out.put_u16_le(self.shard_index as u16);
        out.put_u64_le(self.payload_len);
        out.put_slice(&self.checksum);
        out.put_u16_le(bucket.len() as u16);
        out.put_slice(bucket);
        out.put_u16_le(key.len() as u16);
        out.put_slice(key);
        out.put_slice(self.object_id.version.as_bytes());
        Ok(())
    }

    /// Parse a header from the start of `buf`, returning it with its length.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let total = buf.len();
        let mut cur = buf;

        if cur.remaining() < FIXED_LEN {
            return Err(Error::InvalidShardFormat("truncated header".to_string()));
        }
        let mut magic = [0u8; 4];
        cur.copy_to_slice(&mut magic);
        if magic != SHARD_MAGIC {
            return Err(Error::InvalidShardFormat("bad magic".to_string()));
        }
        let version = cur.get_u8();
        if version != FORMAT_VERSION {
            return Err(Error::InvalidShardFormat(format!(
                "unsupported format version {}",
                version
            )));
        }
        let kind = ShardKind::from_u8(cur.get_u8())
            .ok_or_else(|| Error::InvalidShardFormat("unknown shard kind".to_string()))?;
        let shard_index = cur.get_u16_le() as usize;
        let payload_len = cur.get_u64_le();
        let mut checksum = [0u8; 32];
        cur.copy_to_slice(&mut checksum);

        let bucket = read_str(&mut cur)?;
        let key = read_str(&mut cur)?;
        if cur.remaining() < 16 {
            return Err(Error::InvalidShardFormat("truncated version id".to_string()));
        }
        let mut version_id = [0u8; 16];
        cur.copy_to_slice(&mut version_id);

        let header = Self {
            object_id: ObjectId::new(bucket, key, VersionId(Uuid::from_bytes(version_id))),
            shard_index,
            kind,
            payload_len,
            checksum,
        };
        Ok((header, total - cur.remaining()))
    }
}

fn read_str(cur: &mut &[u8]) -> Result<String> {
    if cur.remaining() < 2 {
        return Err(Error::InvalidShardFormat("truncated length".to_string()));
    }
    let len = cur.get_u16_le() as usize;
    if cur.remaining() < len {
        return Err(Error::InvalidShardFormat("truncated string".to_string()));
    }
    let s = std::str::from_utf8(&cur[..len])
        .map_err(|_| Error::InvalidShardFormat("non utf-8 identity".to_string()))?
        .to_string();
    cur.advance(len);
    Ok(s)
}

/// Serialize header and payload into one buffer.
pub fn encode_shard(header: &ShardHeader, payload: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(header.encoded_len() + payload.len());
    header.encode(&mut out)?;
    out.extend_from_slice(payload);
    Ok(out)
}

/// Split a stored shard into header and payload, without verifying the checksum.
pub fn decode_shard(buf: Bytes) -> Result<(ShardHeader, Bytes)> {
    let (header, header_len) = ShardHeader::decode(&buf)?;
    let payload = buf.slice(header_len..);
    if payload.len() as u64 != header.payload_len {
        return Err(Error::InvalidShardFormat(format!(
            "payload length {} does not match header {}",
            payload.len(),
            header.payload_len
        )));
    }
    Ok((header, payload))
}
