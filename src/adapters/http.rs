//! HTTP transport
//!
//! reqwest clients for the node RPC served by [`crate::rpc::NodeServer`]:
//! shard stores, metadata replicas and the registry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::domain::{
    CommitOutcome, ListFilter, MetadataEntry, MetadataService, NodeConnector, NodeHealth, NodeId,
    NodeInfo, ObjectId, ProposalNumber, ProposeOutcome, PutOutcome, PutShardRequest, ShardProbe,
    ShardService, VersionedEntry,
};
use crate::error::{Error, Result};
use crate::registry::{HeartbeatSink, Ping};
use crate::rpc::{
    CommitBody, DeleteResponse, ErrorBody, ProposeBody, ReadBody, ShardLocator,
    HEADER_SHARD_CHECKSUM, HEADER_SHARD_KIND, PATH_META_COMMIT, PATH_META_LIST, PATH_META_PROPOSE,
    PATH_META_READ, PATH_PING, PATH_REGISTER, PATH_SHARDS, PATH_SHARD_PROBE,
};

/// Shared reqwest client with a per-request timeout.
pub fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))
}

/// `http://` base URL for a node address, unless it already has a scheme.
pub fn base_url(address: &str) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        address.trim_end_matches('/').to_string()
    } else {
        format!("http://{}", address.trim_end_matches('/'))
    }
}

fn transport_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else if e.is_connect() {
        Error::NodeUnavailable(e.to_string())
    } else {
        Error::Transport(e.to_string())
    }
}

/// Turn a non-success response into the error its body describes.
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.bytes().await.map_err(transport_error)?;
    match serde_json::from_slice::<ErrorBody>(&body) {
        Ok(error) => Err(error.into_error()),
        Err(_) => Err(Error::Transport(format!(
            "unexpected status {}: {}",
            status,
            String::from_utf8_lossy(&body)
        ))),
    }
}

async fn json<T: DeserializeOwned>(response: Response) -> Result<T> {
    let body = check(response).await?.bytes().await.map_err(transport_error)?;
    Ok(serde_json::from_slice(&body)?)
}

async fn post_json<B: Serialize, T: DeserializeOwned>(client: &Client, url: String, body: &B) -> Result<T> {
    let response = client
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(transport_error)?;
    json(response).await
}

// =============================================================================
// Shard RPC
// =============================================================================

pub struct HttpShardClient {
    node_id: NodeId,
    base: String,
    client: Client,
}

impl HttpShardClient {
    pub fn new(node_id: NodeId, address: &str, client: Client) -> Self {
        Self {
            node_id,
            base: base_url(address),
            client,
        }
    }

    fn url(&self, path: &str, object_id: &ObjectId, shard_index: usize) -> String {
        format!(
            "{}{}?{}",
            self.base,
            path,
            ShardLocator::new(object_id, shard_index).to_query()
        )
    }
}

#[async_trait]
impl ShardService for HttpShardClient {
    fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    async fn put_shard(&self, request: PutShardRequest) -> Result<PutOutcome> {
        let response = self
            .client
            .put(self.url(PATH_SHARDS, &request.object_id, request.shard_index))
            .header(HEADER_SHARD_CHECKSUM, request.checksum.as_str())
            .header(HEADER_SHARD_KIND, request.kind.as_str())
            .body(request.payload)
            .send()
            .await
            .map_err(transport_error)?;
        json(response).await
    }

    async fn get_shard(&self, object_id: &ObjectId, shard_index: usize) -> Result<Bytes> {
        let response = self
            .client
            .get(self.url(PATH_SHARDS, object_id, shard_index))
            .send()
            .await
            .map_err(transport_error)?;
        check(response).await?.bytes().await.map_err(transport_error)
    }

    async fn delete_shard(&self, object_id: &ObjectId, shard_index: usize) -> Result<bool> {
        let response = self
            .client
            .delete(self.url(PATH_SHARDS, object_id, shard_index))
            .send()
            .await
            .map_err(transport_error)?;
        let answer: DeleteResponse = json(response).await?;
        Ok(answer.deleted)
    }

    async fn probe_shard(
        &self,
        object_id: &ObjectId,
        shard_index: usize,
        deep: bool,
    ) -> Result<ShardProbe> {
        let url = format!("{}&deep={}", self.url(PATH_SHARD_PROBE, object_id, shard_index), deep);
        let response = self.client.get(url).send().await.map_err(transport_error)?;
        json(response).await
    }
}

/// Builds shard clients from registry addresses, one per node.
pub struct HttpConnector {
    client: Client,
    clients: DashMap<NodeId, (String, Arc<HttpShardClient>)>,
}

impl HttpConnector {
    pub fn new(rpc_timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(rpc_timeout)?,
            clients: DashMap::new(),
        })
    }
}

impl NodeConnector for HttpConnector {
    fn shard_service(&self, node: &NodeInfo) -> Result<Arc<dyn ShardService>> {
        if let Some(cached) = self.clients.get(&node.id) {
            if cached.0 == node.address {
                return Ok(Arc::clone(&cached.1) as Arc<dyn ShardService>);
            }
        }
        debug!(node = %node.id, address = %node.address, "Creating shard client");
        let client = Arc::new(HttpShardClient::new(
            node.id.clone(),
            &node.address,
            self.client.clone(),
        ));
        self.clients
            .insert(node.id.clone(), (node.address.clone(), Arc::clone(&client)));
        Ok(client as Arc<dyn ShardService>)
    }
}

// =============================================================================
// Metadata RPC
// =============================================================================

pub struct HttpMetadataClient {
    node_id: NodeId,
    base: String,
    client: Client,
}

impl HttpMetadataClient {
    pub fn new(node_id: NodeId, address: &str, client: Client) -> Self {
        Self {
            node_id,
            base: base_url(address),
            client,
        }
    }
}

#[async_trait]
impl MetadataService for HttpMetadataClient {
    fn replica_id(&self) -> &NodeId {
        &self.node_id
    }

    async fn propose(
        &self,
        object_id: &ObjectId,
        proposal: &ProposalNumber,
        entry: &MetadataEntry,
    ) -> Result<ProposeOutcome> {
        let body = ProposeBody {
            object_id: object_id.clone(),
            proposal: proposal.clone(),
            entry: entry.clone(),
        };
        post_json(&self.client, format!("{}{}", self.base, PATH_META_PROPOSE), &body).await
    }

    async fn commit(&self, object_id: &ObjectId, proposal: &ProposalNumber) -> Result<CommitOutcome> {
        let body = CommitBody {
            object_id: object_id.clone(),
            proposal: proposal.clone(),
        };
        post_json(&self.client, format!("{}{}", self.base, PATH_META_COMMIT), &body).await
    }

    async fn read(&self, object_id: &ObjectId) -> Result<Option<VersionedEntry>> {
        let body = ReadBody {
            object_id: object_id.clone(),
        };
        post_json(&self.client, format!("{}{}", self.base, PATH_META_READ), &body).await
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<VersionedEntry>> {
        post_json(&self.client, format!("{}{}", self.base, PATH_META_LIST), filter).await
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Heartbeats to the node hosting the registry.
pub struct HttpRegistryClient {
    base: String,
    client: Client,
}

impl HttpRegistryClient {
    pub fn new(address: &str, client: Client) -> Self {
        Self {
            base: base_url(address),
            client,
        }
    }
}

#[async_trait]
impl HeartbeatSink for HttpRegistryClient {
    async fn register(&self, ping: &Ping) -> Result<()> {
        let _: NodeId = post_json(&self.client, format!("{}{}", self.base, PATH_REGISTER), ping).await?;
        Ok(())
    }

    async fn ping(&self, ping: &Ping) -> Result<()> {
        let health: NodeHealth = post_json(&self.client, format!("{}{}", self.base, PATH_PING), ping).await?;
        debug!(node = %ping.node_id, %health, "Heartbeat acknowledged");
        Ok(())
    }
}
