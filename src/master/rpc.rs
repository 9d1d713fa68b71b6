// Copyright 2023 The SeamDB Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use compact_str::CompactString;
use hashbrown::hash_map::HashMap;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};

use crate::cluster::ServerIdentity;
use crate::protos::{SplitTabletRequest, TabletRequest, TabletResponse, UnloadTabletRequest};
use crate::tablet::Extent;

/// Requests to tablet servers, each idempotent.
///
/// `lock` is the coordinator's leadership token, `server` carries the session of the target
/// incarnation so that stale incarnations can reject requests.
#[async_trait]
pub trait TabletServerRpc: Send + Sync {
    async fn assign(&self, lock: &[u8], server: &ServerIdentity, extent: &Extent) -> Result<()>;

    async fn unload(&self, lock: &[u8], server: &ServerIdentity, extent: &Extent, save: bool) -> Result<()>;

    async fn chop(&self, lock: &[u8], server: &ServerIdentity, extent: &Extent) -> Result<()>;

    async fn split(&self, lock: &[u8], server: &ServerIdentity, extent: &Extent, row: &[u8]) -> Result<()>;

    async fn compact(&self, lock: &[u8], server: &ServerIdentity, extent: &Extent) -> Result<()>;
}

fn tablet_request(lock: &[u8], server: &ServerIdentity, extent: &Extent) -> TabletRequest {
    TabletRequest { lock: lock.to_vec(), session: server.session().to_string(), extent: Some(extent.to_message()) }
}

/// [TabletServerRpc] over grpc unary calls of service `seamkv.TabletServer`.
#[derive(Debug)]
pub struct GrpcTabletServers {
    channels: Mutex<HashMap<CompactString, Channel>>,
    connect_timeout: Duration,
}

impl GrpcTabletServers {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { channels: Mutex::new(HashMap::new()), connect_timeout }
    }

    fn channel(&self, address: &str) -> Result<Channel> {
        let mut channels = self.channels.lock().unwrap();
        if let Some(channel) = channels.get(address) {
            return Ok(channel.clone());
        }
        let channel = Endpoint::from_shared(format!("http://{address}"))
            .with_context(|| format!("invalid tablet server address {address}"))?
            .connect_timeout(self.connect_timeout)
            .connect_lazy();
        channels.insert(CompactString::new(address), channel.clone());
        Ok(channel)
    }

    async fn call<T>(&self, server: &ServerIdentity, path: &'static str, request: T) -> Result<()>
    where
        T: prost::Message + Send + Sync + 'static, {
        let channel = self.channel(server.address())?;
        let mut client = tonic::client::Grpc::new(channel);
        client.ready().await.with_context(|| format!("tablet server {server} not ready"))?;
        let codec = ProstCodec::<T, TabletResponse>::default();
        client
            .unary(tonic::Request::new(request), PathAndQuery::from_static(path), codec)
            .await
            .map_err(|status| anyhow!("{path} to tablet server {server} failed: {status}"))?;
        Ok(())
    }
}

#[async_trait]
impl TabletServerRpc for GrpcTabletServers {
    async fn assign(&self, lock: &[u8], server: &ServerIdentity, extent: &Extent) -> Result<()> {
        let request = tablet_request(lock, server, extent);
        self.call(server, "/seamkv.TabletServer/AssignTablet", request).await
    }

    async fn unload(&self, lock: &[u8], server: &ServerIdentity, extent: &Extent, save: bool) -> Result<()> {
        let request = UnloadTabletRequest {
            lock: lock.to_vec(),
            session: server.session().to_string(),
            extent: Some(extent.to_message()),
            save,
        };
        self.call(server, "/seamkv.TabletServer/UnloadTablet", request).await
    }

    async fn chop(&self, lock: &[u8], server: &ServerIdentity, extent: &Extent) -> Result<()> {
        let request = tablet_request(lock, server, extent);
        self.call(server, "/seamkv.TabletServer/ChopTablet", request).await
    }

    async fn split(&self, lock: &[u8], server: &ServerIdentity, extent: &Extent, row: &[u8]) -> Result<()> {
        let request = SplitTabletRequest {
            lock: lock.to_vec(),
            session: server.session().to_string(),
            extent: Some(extent.to_message()),
            split_row: row.to_vec(),
        };
        self.call(server, "/seamkv.TabletServer/SplitTablet", request).await
    }

    async fn compact(&self, lock: &[u8], server: &ServerIdentity, extent: &Extent) -> Result<()> {
        let request = tablet_request(lock, server, extent);
        self.call(server, "/seamkv.TabletServer/CompactTablet", request).await
    }
}

#[cfg(test)]
mod tests {
    use assertor::*;

    use super::*;

    #[tokio::test]
    async fn test_grpc_unreachable_server() {
        let rpc = GrpcTabletServers::new(Duration::from_millis(100));
        let server = ServerIdentity::new("127.0.0.1:1", "s1");
        let result = rpc.assign(b"lock", &server, &Extent::whole("1")).await;
        assert_that!(result.is_err()).is_true();
    }

    #[tokio::test]
    async fn test_grpc_invalid_address() {
        let rpc = GrpcTabletServers::new(Duration::from_millis(100));
        assert_that!(rpc.channel("bad address").is_err()).is_true();
    }
}
