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

use std::fmt::{self, Display, Formatter};
use std::sync::Mutex;

use anyhow::{bail, Result};
use etcd_client::Client;
use hashbrown::hash_map::HashMap;
use prost::Message;
use tokio::sync::watch;

use super::etcd::{EtcdPrefixCache, PrefixEntry};
use crate::keys;
use crate::protos::TableRecord;
use crate::tablet::TableId;

/// Lifecycle state of a table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TableState {
    New,
    Online,
    Offline,
    Deleting,
}

impl TableState {
    pub fn from_i32(value: i32) -> Result<Self> {
        match value {
            0 => Ok(Self::New),
            1 => Ok(Self::Online),
            2 => Ok(Self::Offline),
            3 => Ok(Self::Deleting),
            _ => bail!("unknown table state {value}"),
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            Self::New => 0,
            Self::Online => 1,
            Self::Offline => 2,
            Self::Deleting => 3,
        }
    }

    pub fn to_record(self) -> TableRecord {
        TableRecord { state: self.as_i32() }
    }
}

impl Display for TableState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "NEW",
            Self::Online => "ONLINE",
            Self::Offline => "OFFLINE",
            Self::Deleting => "DELETING",
        };
        f.write_str(name)
    }
}

/// Read through lookup of table lifecycle states.
pub trait TableDirectory: Send + Sync {
    /// `None` for unknown table.
    fn table_state(&self, table: &str) -> Option<TableState>;

    /// Watch ticking on every table change.
    fn watch_changes(&self) -> watch::Receiver<u64>;
}

#[derive(Debug)]
pub struct MemoryTableDirectory {
    tables: Mutex<HashMap<TableId, TableState>>,
    changes: watch::Sender<u64>,
}

impl Default for MemoryTableDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTableDirectory {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self { tables: Mutex::new(HashMap::new()), changes }
    }

    pub fn set_state(&self, table: &str, state: TableState) {
        self.tables.lock().unwrap().insert(TableId::new(table), state);
        self.changes.send_modify(|n| *n += 1);
    }

    pub fn remove(&self, table: &str) {
        if self.tables.lock().unwrap().remove(table).is_some() {
            self.changes.send_modify(|n| *n += 1);
        }
    }
}

impl TableDirectory for MemoryTableDirectory {
    fn table_state(&self, table: &str) -> Option<TableState> {
        self.tables.lock().unwrap().get(table).copied()
    }

    fn watch_changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }
}

impl PrefixEntry for TableState {
    fn decode(_name: &str, value: &[u8]) -> Result<Self> {
        let record = TableRecord::decode(value)?;
        TableState::from_i32(record.state)
    }
}

/// Table states persisted under `tables/<table>` of the cluster root in etcd.
pub struct EtcdTableDirectory {
    cache: EtcdPrefixCache<TableState>,
}

impl EtcdTableDirectory {
    pub async fn watch(client: Client, root: &str) -> Result<Self> {
        let prefix = format!("{root}/{}", String::from_utf8_lossy(keys::TABLES_PREFIX));
        let cache = EtcdPrefixCache::start(client, prefix).await?;
        Ok(Self { cache })
    }
}

impl TableDirectory for EtcdTableDirectory {
    fn table_state(&self, table: &str) -> Option<TableState> {
        self.cache.get(table)
    }

    fn watch_changes(&self) -> watch::Receiver<u64> {
        self.cache.watch_changes()
    }
}
