//! Node RPC server
//!
//! One hyper HTTP/1 listener per node serving shard RPC, metadata RPC and,
//! on the node hosting them, the registry and gateway endpoints.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    parse_object_path, parse_query, status_for, CommitBody, DeleteResponse, ErrorBody,
    ProposeBody, PutObjectResponse, ReadBody, ShardLocator, HEADER_DEGRADED, HEADER_SHARD_CHECKSUM,
    HEADER_SHARD_KIND, HEADER_STORAGE_CLASS, HEADER_VERSION_ID, PATH_HEALTH, PATH_META_COMMIT,
    PATH_META_LIST, PATH_META_PROPOSE, PATH_META_READ, PATH_OBJECTS, PATH_PING, PATH_REGISTER,
    PATH_SHARDS, PATH_SHARD_PROBE, USER_METADATA_PREFIX,
};
use crate::coordinator::PutOptions;
use crate::domain::{ListFilter, NodeId, PutShardRequest, ShardKind, StorageClass, VersionId};
use crate::engine::StorageEngine;
use crate::error::{Error, Result};
use crate::metadata::MetadataReplica;
use crate::registry::{NodeRegistry, Ping};
use crate::shard::ShardStore;

type HttpResponse = Response<Full<Bytes>>;

/// HTTP front of one storage node.
pub struct NodeServer {
    node_id: NodeId,
    shards: Arc<ShardStore>,
    replica: Arc<MetadataReplica>,
    registry: Option<Arc<NodeRegistry>>,
    engine: Option<Arc<StorageEngine>>,
}

impl NodeServer {
    pub fn new(node_id: NodeId, shards: Arc<ShardStore>, replica: Arc<MetadataReplica>) -> Self {
        Self {
            node_id,
            shards,
            replica,
            registry: None,
            engine: None,
        }
    }

    /// Also answer registration and heartbeats.
    pub fn with_registry(mut self, registry: Arc<NodeRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Also serve the gateway object endpoints.
    pub fn with_engine(mut self, engine: Arc<StorageEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub async fn bind(addr: &str) -> Result<TcpListener> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| Error::Config(format!("Invalid listen address '{}': {}", addr, e)))?;
        Ok(TcpListener::bind(addr).await?)
    }

    /// Accept connections until `shutdown` fires.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        info!(node = %self.node_id, addr = ?listener.local_addr().ok(), "Node server listening");

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(node = %self.node_id, "Node server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => accepted?,
            };

            let io = TokioIo::new(stream);
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let server = Arc::clone(&server);
                    async move { Ok::<_, Infallible>(server.handle(req).await) }
                });
                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    debug!(%peer, "Connection error: {}", e);
                }
            });
        }
    }

    async fn handle(&self, req: Request<hyper::body::Incoming>) -> HttpResponse {
        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                return error_response(&Error::Transport(format!("failed to read body: {}", e)))
            }
        };
        self.dispatch(&parts.method, parts.uri.path(), parts.uri.query(), &parts.headers, body)
            .await
    }

    /// Route one request; failures become an [`ErrorBody`] response.
    pub async fn dispatch(
        &self,
        method: &Method,
        path: &str,
        query: Option<&str>,
        headers: &HeaderMap,
        body: Bytes,
    ) -> HttpResponse {
        match self.route(method, path, query, headers, body).await {
            Ok(response) => response,
            Err(e) => {
                if status_for(&e) >= 500 {
                    warn!(%method, path, "Request failed: {}", e);
                } else {
                    debug!(%method, path, "Request rejected: {}", e);
                }
                error_response(&e)
            }
        }
    }

    async fn route(
        &self,
        method: &Method,
        path: &str,
        query: Option<&str>,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<HttpResponse> {
        let params = parse_query(query);

        match (method, path) {
            (&Method::GET, PATH_HEALTH) => Ok(bytes_response(Bytes::from_static(b"ok"))),

            // =================================================================
            // Shard RPC
            // =================================================================
            (&Method::PUT, PATH_SHARDS) => {
                let locator = ShardLocator::from_query(&params)?;
                let checksum = header(headers, HEADER_SHARD_CHECKSUM)?
                    .ok_or_else(|| Error::Config(format!("missing {} header", HEADER_SHARD_CHECKSUM)))?;
                let kind = match header(headers, HEADER_SHARD_KIND)? {
                    Some(kind) => ShardKind::parse(&kind)
                        .ok_or_else(|| Error::Config(format!("unknown shard kind '{}'", kind)))?,
                    None => ShardKind::Data,
                };
                let outcome = self
                    .shards
                    .put(PutShardRequest {
                        object_id: locator.object_id,
                        shard_index: locator.shard_index,
                        kind,
                        checksum,
                        payload: body,
                    })
                    .await?;
                json_response(&outcome)
            }
            (&Method::GET, PATH_SHARDS) => {
                let locator = ShardLocator::from_query(&params)?;
                let payload = self.shards.get(&locator.object_id, locator.shard_index).await?;
                Ok(bytes_response(payload))
            }
            (&Method::DELETE, PATH_SHARDS) => {
                let locator = ShardLocator::from_query(&params)?;
                let deleted = self.shards.delete(&locator.object_id, locator.shard_index).await?;
                json_response(&DeleteResponse { deleted })
            }
            (&Method::GET, PATH_SHARD_PROBE) => {
                let locator = ShardLocator::from_query(&params)?;
                let deep = params.get("deep").is_some_and(|d| d == "true");
                let probe = self
                    .shards
                    .probe(&locator.object_id, locator.shard_index, deep)
                    .await?;
                json_response(&probe)
            }

            // =================================================================
            // Metadata RPC
            // =================================================================
            (&Method::POST, PATH_META_PROPOSE) => {
                let req: ProposeBody = parse_json(&body)?;
                let outcome = self
                    .replica
                    .propose(&req.object_id, &req.proposal, &req.entry)
                    .await?;
                json_response(&outcome)
            }
            (&Method::POST, PATH_META_COMMIT) => {
                let req: CommitBody = parse_json(&body)?;
                let outcome = self.replica.commit(&req.object_id, &req.proposal).await?;
                json_response(&outcome)
            }
            (&Method::POST, PATH_META_READ) => {
                let req: ReadBody = parse_json(&body)?;
                json_response(&self.replica.read(&req.object_id).await)
            }
            (&Method::POST, PATH_META_LIST) => {
                let filter: ListFilter = parse_json(&body)?;
                json_response(&self.replica.list(&filter).await)
            }

            // =================================================================
            // Registry
            // =================================================================
            (&Method::POST, PATH_REGISTER) => {
                let ping: Ping = parse_json(&body)?;
                self.registry()?.register(&ping)?;
                json_response(&ping.node_id)
            }
            (&Method::POST, PATH_PING) => {
                let ping: Ping = parse_json(&body)?;
                let health = self.registry()?.heartbeat(&ping)?;
                json_response(&health)
            }

            // =================================================================
            // Gateway
            // =================================================================
            (_, p) if p.starts_with(PATH_OBJECTS) => {
                let (bucket, key) = parse_object_path(p)
                    .ok_or_else(|| Error::Config(format!("invalid object path '{}'", p)))?;
                let version = params.get("version").map(|v| VersionId::parse(v)).transpose()?;
                self.object_request(method, &bucket, &key, version, headers, body)
                    .await
            }

            _ => Err(Error::NotFound(format!("no route for {} {}", method, path))),
        }
    }

    async fn object_request(
        &self,
        method: &Method,
        bucket: &str,
        key: &str,
        version: Option<VersionId>,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<HttpResponse> {
        let engine = self
            .engine
            .as_ref()
            .ok_or_else(|| Error::NotFound(format!("node {} serves no gateway", self.node_id)))?;

        match *method {
            Method::PUT => {
                let version = engine
                    .put_object(bucket, key, body, put_options(headers)?)
                    .await?;
                json_response(&PutObjectResponse {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    version: version.to_string(),
                })
            }
            Method::GET => {
                let read = engine.read_object(bucket, key, version).await?;
                let mut response = bytes_response(read.data);
                let headers = response.headers_mut();
                headers.insert(
                    HeaderName::from_static(HEADER_VERSION_ID),
                    header_value(&read.entry.object_id.version.to_string())?,
                );
                if let Some(content_type) = &read.entry.content_type {
                    headers.insert(CONTENT_TYPE, header_value(content_type)?);
                }
                if read.degraded {
                    headers.insert(
                        HeaderName::from_static(HEADER_DEGRADED),
                        HeaderValue::from_static("true"),
                    );
                }
                Ok(response)
            }
            Method::DELETE => {
                let version = engine.delete_object(bucket, key, version).await?;
                json_response(&PutObjectResponse {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    version: version.to_string(),
                })
            }
            _ => Err(Error::NotFound(format!("no route for {} on objects", method))),
        }
    }

    fn registry(&self) -> Result<&Arc<NodeRegistry>> {
        self.registry
            .as_ref()
            .ok_or_else(|| Error::NotFound(format!("node {} hosts no registry", self.node_id)))
    }
}

fn put_options(headers: &HeaderMap) -> Result<PutOptions> {
    let storage_class = match header(headers, HEADER_STORAGE_CLASS)? {
        Some(class) => StorageClass::parse(&class)
            .ok_or_else(|| Error::Config(format!("unknown storage class '{}'", class)))?,
        None => StorageClass::Standard,
    };
    let content_type = header(headers, CONTENT_TYPE.as_str())?;

    let mut user_metadata = BTreeMap::new();
    for (name, value) in headers {
        if let Some(meta_key) = name.as_str().strip_prefix(USER_METADATA_PREFIX) {
            let value = value
                .to_str()
                .map_err(|e| Error::Config(format!("invalid header {}: {}", name, e)))?;
            user_metadata.insert(meta_key.to_string(), value.to_string());
        }
    }

    Ok(PutOptions {
        storage_class,
        content_type,
        user_metadata,
    })
}

fn header(headers: &HeaderMap, name: &str) -> Result<Option<String>> {
    headers
        .get(name)
        .map(|v| {
            v.to_str()
                .map(str::to_string)
                .map_err(|e| Error::Config(format!("invalid header {}: {}", name, e)))
        })
        .transpose()
}

fn header_value(s: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(s).map_err(|e| Error::Internal(format!("invalid header value: {}", e)))
}

fn parse_json<T: DeserializeOwned>(body: &Bytes) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| Error::Config(format!("invalid request body: {}", e)))
}

fn json_response<T: Serialize>(value: &T) -> Result<HttpResponse> {
    let body = serde_json::to_vec(value)?;
    let mut response = Response::new(Full::new(Bytes::from(body)));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(response)
}

fn bytes_response(payload: Bytes) -> HttpResponse {
    let mut response = Response::new(Full::new(payload));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
    response
}

fn error_response(err: &Error) -> HttpResponse {
    let body = serde_json::to_vec(&ErrorBody::from_error(err)).unwrap_or_else(|e| {
        error!("Failed to encode error body: {}", e);
        Vec::new()
    });
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() =
        StatusCode::from_u16(status_for(err)).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
