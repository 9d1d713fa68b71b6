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

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use compact_str::CompactString;
use etcd_client::{
    Client,
    ConnectOptions,
    EventType,
    GetOptions,
    LeaseClient,
    LeaseKeepAliveStream,
    LeaseKeeper,
    LockOptions,
    WatchOptions,
    WatchResponse,
    WatchStream,
    Watcher,
};
use hashbrown::hash_map::HashMap;
use ignore_result::Ignore;
use scopeguard::defer;
use tokio::select;
use tokio::sync::watch;

use crate::utils::{self, DropOwner, DropWatcher};

pub const SERVER_LEASE_DURATION: Duration = Duration::from_secs(20);

pub struct EtcdLease {
    id: i64,
    ttl: Duration,
    alive: watch::Receiver<bool>,
    keep_alive: DropOwner,
}

impl EtcdLease {
    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// False once keep alive stopped, after which the lease expires in at most one ttl.
    pub fn alive(&self) -> bool {
        *self.alive.borrow()
    }
}

/// Parsed `etcd://host1:port1,host2:port2/root?username=u&password=p`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EtcdUri {
    pub endpoints: Vec<String>,
    pub root: String,
    pub credential: Option<(String, String)>,
}

impl std::str::FromStr for EtcdUri {
    type Err = anyhow::Error;

    fn from_str(uri: &str) -> Result<Self> {
        let (scheme, rest) = uri.split_once("://").ok_or_else(|| anyhow!("no scheme in etcd uri: {uri}"))?;
        let scheme = match scheme {
            "etcd" => "http",
            "etcd+tls" => "https",
            _ => bail!("unsupported etcd uri scheme: {uri}"),
        };
        let (rest, query) = rest.split_once('?').unwrap_or((rest, ""));
        let (hosts, root) = match rest.find('/') {
            None => (rest, ""),
            Some(i) => (&rest[..i], rest[i..].trim_end_matches('/')),
        };
        if hosts.is_empty() {
            bail!("no hosts in etcd uri: {uri}")
        }
        let endpoints = hosts.split(',').map(|host| format!("{scheme}://{host}")).collect();
        let mut username = None;
        let mut password = None;
        for param in query.split('&').filter(|s| !s.is_empty()) {
            match param.split_once('=') {
                Some(("username", value)) => username = Some(value.to_string()),
                Some(("password", value)) => password = Some(value.to_string()),
                _ => bail!("unknown parameter {param} in etcd uri: {uri}"),
            }
        }
        Ok(Self { endpoints, root: root.to_string(), credential: username.zip(password) })
    }
}

pub enum EtcdHelper {}

impl EtcdHelper {
    /// Connects to etcd and returns client with cluster root path.
    pub async fn connect(uri: &str) -> Result<(Client, String)> {
        let uri: EtcdUri = uri.parse()?;
        let mut options = ConnectOptions::default();
        if let Some((username, password)) = &uri.credential {
            options = options.with_user(username.as_str(), password.as_str());
        }
        let client = Client::connect(&uri.endpoints, Some(options)).await?;
        Ok((client, uri.root))
    }

    // TODO: This method could leak lease during cancellation.
    pub async fn grant_lease(client: &mut Client, ttl: Option<Duration>) -> Result<EtcdLease> {
        let response = client.lease_grant(ttl.unwrap_or(SERVER_LEASE_DURATION).as_secs() as i64, None).await?;
        let lease_id = response.id();
        let ttl = Duration::from_secs(response.ttl() as u64);
        let (alive_sender, alive) = watch::channel(true);
        let keep_alive = Self::keep_alive(client.lease_client(), lease_id, ttl, alive_sender).await?;
        Ok(EtcdLease { id: lease_id, ttl, alive, keep_alive })
    }

    async fn heartbeat_lease(
        mut client: LeaseClient,
        mut keeper: LeaseKeeper,
        mut alive_stream: LeaseKeepAliveStream,
        mut watcher: DropWatcher,
        alive: watch::Sender<bool>,
        ttl: Duration,
    ) -> Result<()> {
        defer! {
            alive.send(false).ignore();
        }
        let mut interval = tokio::time::interval(ttl / 3);
        loop {
            select! {
                _ = interval.tick() => {
                    keeper.keep_alive().await?;
                },
                r = alive_stream.message() => match r? {
                    None => break,
                    Some(response) if response.ttl() <= 0 => bail!("lease {} expired", keeper.id()),
                    Some(_) => continue,
                },
                _ = watcher.dropped() => {
                    client.revoke(keeper.id()).await?;
                    break;
                },
            }
        }
        Ok(())
    }

    async fn keep_alive(
        mut client: LeaseClient,
        lease_id: i64,
        ttl: Duration,
        alive: watch::Sender<bool>,
    ) -> Result<DropOwner> {
        let (keeper, alive_stream) = client.keep_alive(lease_id).await?;
        let (owner, watcher) = utils::drop_watcher();
        tokio::spawn(async move {
            if let Err(err) = Self::heartbeat_lease(client, keeper, alive_stream, watcher, alive, ttl).await {
                tracing::warn!("lease {lease_id} stops heartbeat: {err:?}");
            }
        });
        Ok(owner)
    }

    /// Acquires etcd lock bound to given lease, returns the owned lock key.
    pub async fn lock(client: &mut Client, name: &str, lease: &EtcdLease) -> Result<Vec<u8>> {
        let options = LockOptions::new().with_lease(lease.id());
        let response = client.lock(name, Some(options)).await?;
        Ok(response.key().to_vec())
    }
}

/// Decodes a child of a watched etcd prefix.
pub trait PrefixEntry: Clone + Send + Sync + 'static {
    fn decode(name: &str, value: &[u8]) -> Result<Self>;
}

#[derive(Debug)]
struct PrefixState<T> {
    prefix: String,
    entries: Mutex<HashMap<CompactString, T>>,
    changes: watch::Sender<u64>,
}

impl<T: PrefixEntry> PrefixState<T> {
    fn name<'a>(&self, key: &'a str) -> Result<&'a str> {
        key.strip_prefix(&self.prefix).ok_or_else(|| anyhow!("BUG: expect child of {}, got {}", self.prefix, key))
    }

    fn notify(&self) {
        self.changes.send_modify(|n| *n += 1);
    }

    fn apply_update(&self, message: WatchResponse) -> Result<()> {
        for event in message.events() {
            let Some(kv) = event.kv() else {
                continue;
            };
            let name = self.name(kv.key_str()?)?;
            match event.event_type() {
                EventType::Put => match T::decode(name, kv.value()) {
                    Ok(entry) => {
                        self.entries.lock().unwrap().insert(CompactString::new(name), entry);
                    },
                    Err(err) => {
                        tracing::warn!("drop undecodable entry {}{}: {:?}", self.prefix, name, err);
                        self.entries.lock().unwrap().remove(name);
                    },
                },
                EventType::Delete => {
                    self.entries.lock().unwrap().remove(name);
                },
            }
        }
        self.notify();
        Ok(())
    }
}

/// Local cache of children under an etcd prefix, kept current by an etcd watch.
///
/// Cache is cleared once the watch stops, so readers observe an empty set instead of a stale one.
pub struct EtcdPrefixCache<T> {
    state: Arc<PrefixState<T>>,
    _dropper: DropOwner,
}

impl<T: PrefixEntry> EtcdPrefixCache<T> {
    pub async fn start(mut client: Client, prefix: String) -> Result<Self> {
        let response = client.get(prefix.as_str(), Some(GetOptions::new().with_prefix())).await?;
        let revision =
            response.header().map(|header| header.revision()).ok_or_else(|| anyhow!("etcd response has no header"))?;
        let (changes, _) = watch::channel(0);
        let state = Arc::new(PrefixState { prefix, entries: Mutex::new(HashMap::new()), changes });
        {
            let mut entries = state.entries.lock().unwrap();
            for kv in response.kvs() {
                let name = state.name(kv.key_str()?)?;
                match T::decode(name, kv.value()) {
                    Ok(entry) => {
                        entries.insert(CompactString::new(name), entry);
                    },
                    Err(err) => tracing::warn!("skip undecodable entry {}{}: {:?}", state.prefix, name, err),
                }
            }
        }
        let options = WatchOptions::new().with_prefix().with_start_revision(revision + 1);
        let (watcher, stream) = client.watch(state.prefix.as_str(), Some(options)).await?;
        let (dropper, drop_watcher) = utils::drop_watcher();
        let updating = state.clone();
        tokio::spawn(async move {
            let prefix = updating.prefix.clone();
            if let Err(err) = Self::update_entries(updating, drop_watcher, watcher, stream).await {
                tracing::warn!("stop watching etcd prefix {prefix}: {err:?}");
            }
        });
        Ok(Self { state, _dropper: dropper })
    }

    async fn update_entries(
        state: Arc<PrefixState<T>>,
        mut dropper: DropWatcher,
        mut watcher: Watcher,
        mut stream: WatchStream,
    ) -> Result<()> {
        defer! {
            state.entries.lock().unwrap().clear();
            state.notify();
        }
        loop {
            select! {
                _ = dropper.dropped() => {
                    watcher.cancel().await?;
                    break;
                },
                r = stream.message() => match r? {
                    None => break,
                    Some(message) => if message.watch_id() == watcher.watch_id() {
                        if message.canceled() {
                            break;
                        }
                        state.apply_update(message)?;
                    },
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<T> {
        self.state.entries.lock().unwrap().get(name).cloned()
    }

    pub fn entries(&self) -> Vec<(CompactString, T)> {
        let entries = self.state.entries.lock().unwrap();
        entries.iter().map(|(name, entry)| (name.clone(), entry.clone())).collect()
    }

    /// Watch ticking on every applied change.
    pub fn watch_changes(&self) -> watch::Receiver<u64> {
        self.state.changes.subscribe()
    }
}
