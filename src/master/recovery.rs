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

use std::collections::HashSet;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use prost::Message;
use tracing::info;

use crate::keys;
use crate::meta::{self, Expect};
use crate::protos::{RecoveryRecord, TabletRecord};
use crate::tablet::{Extent, MetadataTable};

const SCAN_PAGE: usize = 1000;

/// Replay of write ahead logs which must finish before a tablet is hosted again.
#[async_trait]
pub trait LogRecovery: Send + Sync {
    /// Requests recovery of given logs of a tablet, returns true while recovery is in progress.
    async fn recover(&self, extent: &Extent, wal_refs: &[String]) -> Result<bool>;

    /// Forgets finished recoveries of logs no tablet refers to anymore. Returns count of forgotten logs.
    async fn sweep(&self) -> Result<usize> {
        Ok(0)
    }
}

/// Log recovery tracked as `recovery/<wal>` markers which recovery workers flip to finished.
#[derive(Clone, Debug)]
pub struct MetaLogRecovery {
    metadata: MetadataTable,
}

impl MetaLogRecovery {
    pub fn new(metadata: MetadataTable) -> Self {
        Self { metadata }
    }

    pub async fn finish(&self, wal: &str) -> Result<()> {
        let value = RecoveryRecord { finished: true }.encode_to_vec();
        self.metadata.kv().put(&keys::recovery_key(wal), value, Expect::Any).await?;
        Ok(())
    }
}

#[async_trait]
impl LogRecovery for MetaLogRecovery {
    async fn recover(&self, extent: &Extent, wal_refs: &[String]) -> Result<bool> {
        let kv = self.metadata.kv();
        let mut in_progress = false;
        for wal in wal_refs {
            let key = keys::recovery_key(wal);
            match kv.get(&key).await? {
                None => {
                    let value = RecoveryRecord { finished: false }.encode_to_vec();
                    if kv.put(&key, value, Expect::Absent).await? {
                        info!("requested recovery of log {wal} for tablet {extent}");
                    }
                    in_progress = true;
                },
                Some(entry) => {
                    let record = RecoveryRecord::decode(entry.value.as_slice())?;
                    in_progress |= !record.finished;
                },
            }
        }
        Ok(in_progress)
    }

    async fn sweep(&self) -> Result<usize> {
        let kv = self.metadata.kv();
        let start = keys::RECOVERY_PREFIX.to_vec();
        let end = keys::prefix_end(keys::RECOVERY_PREFIX);
        let markers: Vec<_> = meta::scan_stream(kv.clone(), start, end, SCAN_PAGE).try_collect().await?;
        let mut finished = vec![];
        for entry in markers {
            if RecoveryRecord::decode(entry.value.as_slice())?.finished {
                finished.push(entry);
            }
        }
        if finished.is_empty() {
            return Ok(0);
        }

        let start = keys::TABLETS_PREFIX.to_vec();
        let end = keys::prefix_end(keys::TABLETS_PREFIX);
        let mut tablets = meta::scan_stream(kv.clone(), start, end, SCAN_PAGE);
        let mut referenced = HashSet::new();
        while let Some(entry) = tablets.try_next().await? {
            let record = TabletRecord::decode(entry.value.as_slice())
                .with_context(|| format!("fail to decode tablet row {}", String::from_utf8_lossy(&entry.key)))?;
            referenced.extend(record.wal_refs);
        }

        let mut swept = 0;
        for entry in finished {
            let wal = String::from_utf8_lossy(&entry.key[keys::RECOVERY_PREFIX.len()..]).into_owned();
            if referenced.contains(&wal) {
                continue;
            }
            if kv.delete(&entry.key, Expect::Version(entry.version)).await? {
                info!("forgot finished recovery of log {wal}");
                swept += 1;
            }
        }
        Ok(swept)
    }
}
