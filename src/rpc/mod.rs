//! Node RPC wire vocabulary
//!
//! Paths, headers, status codes and JSON bodies shared by the hyper node
//! server ([`server`]) and the reqwest clients in `adapters::http`.
//!
//! | Method | Path                  | Body / Answer                          |
//! |--------|-----------------------|----------------------------------------|
//! | PUT    | `/shards?<locator>`   | raw payload / [`PutOutcome`]           |
//! | GET    | `/shards?<locator>`   | raw payload                            |
//! | DELETE | `/shards?<locator>`   | [`DeleteResponse`]                     |
//! | GET    | `/shards/probe?...`   | [`ShardProbe`]                         |
//! | POST   | `/meta/propose`       | [`ProposeBody`] / `ProposeOutcome`     |
//! | POST   | `/meta/commit`        | [`CommitBody`] / `CommitOutcome`       |
//! | POST   | `/meta/read`          | [`ReadBody`] / `Option<VersionedEntry>`|
//! | POST   | `/meta/list`          | `ListFilter` / `Vec<VersionedEntry>`   |
//! | POST   | `/registry/register`  | `Ping`                                 |
//! | POST   | `/registry/ping`      | `Ping` / `NodeHealth`                  |
//! | PUT    | `/objects/{b}/{k}`    | raw object / [`PutObjectResponse`]     |
//! | GET    | `/objects/{b}/{k}`    | raw object                             |
//! | DELETE | `/objects/{b}/{k}`    | [`PutObjectResponse`]                  |
//!
//! Failures answer with an [`ErrorBody`] and the status of [`status_for`].
//!
//! [`PutOutcome`]: crate::domain::PutOutcome
//! [`ShardProbe`]: crate::domain::ShardProbe

pub mod server;

pub use server::NodeServer;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::domain::{MetadataEntry, ObjectId, ProposalNumber, VersionId};
use crate::error::{Error, ErrorKind, Result};

pub const PATH_SHARDS: &str = "/shards";
pub const PATH_SHARD_PROBE: &str = "/shards/probe";
pub const PATH_META_PROPOSE: &str = "/meta/propose";
pub const PATH_META_COMMIT: &str = "/meta/commit";
pub const PATH_META_READ: &str = "/meta/read";
pub const PATH_META_LIST: &str = "/meta/list";
pub const PATH_REGISTER: &str = "/registry/register";
pub const PATH_PING: &str = "/registry/ping";
pub const PATH_OBJECTS: &str = "/objects/";
pub const PATH_HEALTH: &str = "/healthz";

pub const HEADER_SHARD_CHECKSUM: &str = "x-shard-checksum";
pub const HEADER_SHARD_KIND: &str = "x-shard-kind";
pub const HEADER_VERSION_ID: &str = "x-version-id";
pub const HEADER_STORAGE_CLASS: &str = "x-storage-class";
pub const HEADER_DEGRADED: &str = "x-degraded-read";
/// Prefix of user metadata headers on gateway PUTs.
pub const USER_METADATA_PREFIX: &str = "x-meta-";

// =============================================================================
// Errors on the wire
// =============================================================================

/// Body of every failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    /// Set when the node that answered is declared dead.
    #[serde(default)]
    pub node_dead: bool,
}

impl ErrorBody {
    pub fn from_error(err: &Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            node_dead: matches!(err, Error::NodeDead(_)),
        }
    }

    pub fn into_error(self) -> Error {
        if self.node_dead {
            return Error::NodeDead(self.message);
        }
        Error::from_kind(self.kind, self.message)
    }
}

/// HTTP status answered for `err`.
pub fn status_for(err: &Error) -> u16 {
    if let Error::NodeDead(_) = err {
        return 410;
    }
    match err.kind() {
        ErrorKind::Ok => 200,
        ErrorKind::NotFound => 404,
        ErrorKind::Conflict => 409,
        ErrorKind::Corrupt => 422,
        ErrorKind::Invalid => 400,
        ErrorKind::Timeout => 504,
        ErrorKind::Unavailable | ErrorKind::Quorum => 503,
        ErrorKind::InsufficientNodes => 507,
        ErrorKind::UnrecoverableLoss | ErrorKind::Internal => 500,
    }
}

// =============================================================================
// Bodies
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposeBody {
    pub object_id: ObjectId,
    pub proposal: ProposalNumber,
    pub entry: MetadataEntry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitBody {
    pub object_id: ObjectId,
    pub proposal: ProposalNumber,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadBody {
    pub object_id: ObjectId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutObjectResponse {
    pub bucket: String,
    pub key: String,
    pub version: String,
}

// =============================================================================
// Query strings
// =============================================================================

/// Query-string address of one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardLocator {
    pub object_id: ObjectId,
    pub shard_index: usize,
}

impl ShardLocator {
    pub fn new(object_id: &ObjectId, shard_index: usize) -> Self {
        Self {
            object_id: object_id.clone(),
            shard_index,
        }
    }

    pub fn to_query(&self) -> String {
        format!(
            "bucket={}&key={}&version={}&index={}",
            urlencoding::encode(&self.object_id.bucket),
            urlencoding::encode(&self.object_id.key),
            self.object_id.version,
            self.shard_index
        )
    }

    pub fn from_query(params: &HashMap<String, String>) -> Result<Self> {
        let field = |name: &str| {
            params
                .get(name)
                .ok_or_else(|| Error::Config(format!("missing query parameter '{}'", name)))
        };
        let version = VersionId::parse(field("version")?)?;
        let shard_index = field("index")?
            .parse::<usize>()
            .map_err(|e| Error::Config(format!("invalid shard index: {}", e)))?;
        Ok(Self {
            object_id: ObjectId::new(field("bucket")?.as_str(), field("key")?.as_str(), version),
            shard_index,
        })
    }
}

/// Decode `a=1&b=two` into a map; later duplicates win.
pub fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for pair in query.unwrap_or_default().split('&').filter(|p| !p.is_empty()) {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        let decode = |s: &str| {
            urlencoding::decode(&s.replace('+', " "))
                .map(|d| d.into_owned())
                .unwrap_or_else(|_| s.to_string())
        };
        params.insert(decode(name), decode(value));
    }
    params
}

/// Gateway path of `bucket/key`.
pub fn object_path(bucket: &str, key: &str) -> String {
    format!(
        "{}{}/{}",
        PATH_OBJECTS,
        urlencoding::encode(bucket),
        urlencoding::encode(key)
    )
}

/// Split `/objects/{bucket}/{key}`; the key may itself contain `/`.
pub fn parse_object_path(path: &str) -> Option<(String, String)> {
    let rest = path.strip_prefix(PATH_OBJECTS)?;
    let (bucket, key) = rest.split_once('/')?;
    if bucket.is_empty() || key.is_empty() {
        return None;
    }
    let bucket = urlencoding::decode(bucket).ok()?.into_owned();
    let key = urlencoding::decode(key).ok()?.into_owned();
    Some((bucket, key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_shard_locator_query() {
        let id = ObjectId::new("photos", "2024/cat & dog.jpg", VersionId::generate());
        let locator = ShardLocator::new(&id, 3);
        let query = locator.to_query();
        assert!(!query.contains(' '));

        let params = parse_query(Some(&query));
        assert_eq!(ShardLocator::from_query(&params).unwrap(), locator);
    }

    #[test]
    fn test_shard_locator_missing_field() {
        let params = parse_query(Some("bucket=b&key=k&index=1"));
        assert_matches!(ShardLocator::from_query(&params), Err(Error::Config(_)));
    }

    #[test]
    fn test_object_path() {
        let path = object_path("logs", "app/2024/01.log");
        assert_eq!(
            parse_object_path(&path),
            Some(("logs".to_string(), "app/2024/01.log".to_string()))
        );
        assert_eq!(
            parse_object_path("/objects/logs/app/raw.log"),
            Some(("logs".to_string(), "app/raw.log".to_string()))
        );
        assert_eq!(parse_object_path("/objects/logs"), None);
        assert_eq!(parse_object_path("/objects//key"), None);
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(status_for(&Error::NotFound("x".into())), 404);
        assert_eq!(status_for(&Error::Conflict("x".into())), 409);
        assert_eq!(status_for(&Error::Corrupt("x".into())), 422);
        assert_eq!(status_for(&Error::NodeDead("n1".into())), 410);
        assert_eq!(status_for(&Error::Timeout("x".into())), 504);
    }

    #[test]
    fn test_error_body_preserves_kind() {
        let body = ErrorBody::from_error(&Error::Corrupt("bad shard".into()));
        assert_matches!(body.into_error(), Error::Corrupt(_));

        let body = ErrorBody::from_error(&Error::NodeDead("n1".into()));
        assert_matches!(body.into_error(), Error::NodeDead(_));
    }
}
