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

use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Display, Formatter};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Result};
use compact_str::{format_compact, CompactString};
use etcd_client::{Client, Compare, CompareOp, PutOptions, Txn, TxnOp};
use ignore_result::Ignore;
use prost::Message;
use tokio::sync::watch;
use uuid::Uuid;

use super::etcd::{EtcdHelper, EtcdLease, EtcdPrefixCache, PrefixEntry};
use crate::keys;
use crate::protos::{LocationRecord, ServerRecord, ServerStatusRecord, TableStatusRecord};
use crate::tablet::TableId;

/// Network address of a tablet server plus the session token of its incarnation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerIdentity {
    address: CompactString,
    session: CompactString,
}

impl ServerIdentity {
    pub fn new(address: impl Into<CompactString>, session: impl Into<CompactString>) -> Self {
        Self { address: address.into(), session: session.into() }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn to_record(&self) -> LocationRecord {
        LocationRecord { address: self.address.to_string(), session: self.session.to_string() }
    }

    pub fn from_record(record: &LocationRecord) -> Self {
        Self::new(record.address.as_str(), record.session.as_str())
    }
}

impl Display for ServerIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.address, self.session)
    }
}

/// Self reported status of a live tablet server.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServerStatus {
    pub hold_time: Duration,
    /// Online tablets per table.
    pub tables: HashMap<TableId, u64>,
}

impl ServerStatus {
    pub fn online_tablets(&self) -> u64 {
        self.tables.values().sum()
    }

    pub fn from_record(record: &ServerStatusRecord) -> Self {
        Self {
            hold_time: Duration::from_millis(record.hold_time_ms),
            tables: record.tables.iter().map(|t| (TableId::new(&t.table), t.online)).collect(),
        }
    }

    pub fn to_record(&self) -> ServerStatusRecord {
        ServerStatusRecord {
            hold_time_ms: self.hold_time.as_millis() as u64,
            tables: self
                .tables
                .iter()
                .map(|(table, online)| TableStatusRecord { table: table.to_string(), online: *online })
                .collect(),
        }
    }
}

pub type LiveServers = BTreeMap<ServerIdentity, ServerStatus>;

/// Feed of live tablet servers.
pub trait ServerRegistry: Send + Sync {
    fn live_servers(&self) -> LiveServers;

    /// Watch ticking on every membership or status change.
    fn watch_changes(&self) -> watch::Receiver<u64>;
}

#[derive(Debug)]
pub struct MemoryServerRegistry {
    servers: Mutex<LiveServers>,
    changes: watch::Sender<u64>,
}

impl Default for MemoryServerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryServerRegistry {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self { servers: Mutex::new(LiveServers::new()), changes }
    }

    fn notify(&self) {
        self.changes.send_modify(|n| *n += 1);
    }

    /// Starts a new incarnation of given address.
    pub fn join(&self, address: &str) -> ServerIdentity {
        let server = ServerIdentity::new(address, format_compact!("{}", Uuid::new_v4().simple()));
        self.servers.lock().unwrap().insert(server.clone(), ServerStatus::default());
        self.notify();
        server
    }

    pub fn leave(&self, server: &ServerIdentity) {
        if self.servers.lock().unwrap().remove(server).is_some() {
            self.notify();
        }
    }

    pub fn report(&self, server: &ServerIdentity, status: ServerStatus) {
        let mut servers = self.servers.lock().unwrap();
        if let Some(existing) = servers.get_mut(server) {
            *existing = status;
            drop(servers);
            self.notify();
        }
    }
}

impl ServerRegistry for MemoryServerRegistry {
    fn live_servers(&self) -> LiveServers {
        self.servers.lock().unwrap().clone()
    }

    fn watch_changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }
}

#[derive(Clone, Debug)]
struct ServerEntry {
    server: ServerIdentity,
    status: ServerStatus,
}

impl PrefixEntry for ServerEntry {
    fn decode(name: &str, value: &[u8]) -> Result<Self> {
        let record = ServerRecord::decode(value)?;
        if record.session.is_empty() {
            bail!("server {name} registered with no session")
        }
        let status = record.status.as_ref().map(ServerStatus::from_record).unwrap_or_default();
        Ok(Self { server: ServerIdentity::new(name, record.session), status })
    }
}

fn servers_prefix(root: &str) -> String {
    format!("{root}/{}", keys::SERVERS_PREFIX)
}

/// Live servers registered as leased `servers/<address>` keys in etcd.
pub struct EtcdServerRegistry {
    cache: EtcdPrefixCache<ServerEntry>,
}

impl EtcdServerRegistry {
    pub async fn watch(client: Client, root: &str) -> Result<Self> {
        let cache = EtcdPrefixCache::start(client, servers_prefix(root)).await?;
        Ok(Self { cache })
    }

    /// Registers a tablet server incarnation whose session is its lease id.
    pub async fn join(mut client: Client, root: &str, address: &str, status: &ServerStatus) -> Result<ServerSession> {
        let lease = EtcdHelper::grant_lease(&mut client, None).await?;
        let server = ServerIdentity::new(address, format_compact!("{:x}", lease.id()));
        let key = format!("{}{}", servers_prefix(root), address);
        let record = ServerRecord { session: server.session().to_string(), status: Some(status.to_record()) };
        let txn = Txn::new()
            .when([Compare::create_revision(key.as_str(), CompareOp::Equal, 0)])
            .and_then([TxnOp::put(key.as_str(), record.encode_to_vec(), Some(PutOptions::new().with_lease(lease.id())))]);
        let response = client.txn(txn).await?;
        if !response.succeeded() {
            bail!("server {address} is registered by another incarnation")
        }
        Ok(ServerSession { client, key, server, lease })
    }
}

impl ServerRegistry for EtcdServerRegistry {
    fn live_servers(&self) -> LiveServers {
        self.cache.entries().into_iter().map(|(_, entry)| (entry.server, entry.status)).collect()
    }

    fn watch_changes(&self) -> watch::Receiver<u64> {
        self.cache.watch_changes()
    }
}

/// Registration of one tablet server incarnation, revoked on drop.
pub struct ServerSession {
    client: Client,
    key: String,
    server: ServerIdentity,
    lease: EtcdLease,
}

impl ServerSession {
    pub fn server(&self) -> &ServerIdentity {
        &self.server
    }

    pub fn alive(&self) -> bool {
        self.lease.alive()
    }

    pub async fn report(&mut self, status: &ServerStatus) -> Result<()> {
        let record = ServerRecord { session: self.server.session().to_string(), status: Some(status.to_record()) };
        let options = PutOptions::new().with_lease(self.lease.id());
        self.client.put(self.key.as_str(), record.encode_to_vec(), Some(options)).await?;
        Ok(())
    }

    pub async fn leave(mut self) {
        self.client.delete(self.key.as_str(), None).await.ignore();
    }
}
