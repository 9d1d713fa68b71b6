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

use std::fmt::{self, Debug, Formatter};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use etcd_client::{Client, Compare, CompareOp, GetOptions, Txn, TxnOp};

use super::{Expect, KeyValue, MetaKv};
use crate::keys;

/// [MetaKv] over etcd, rooted under a cluster path.
///
/// Versions are etcd mod revisions. Writes can be fenced on existence of a key, normally the
/// coordinator lock, so a deposed coordinator fails instead of overwriting its successor.
#[derive(Clone)]
pub struct EtcdMetaKv {
    client: Client,
    root: Vec<u8>,
    fence: Option<Vec<u8>>,
}

impl Debug for EtcdMetaKv {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("EtcdMetaKv")
            .field("root", &String::from_utf8_lossy(&self.root))
            .field("fenced", &self.fence.is_some())
            .finish()
    }
}

impl EtcdMetaKv {
    pub fn new(client: Client, root: &str) -> Self {
        Self { client, root: format!("{root}/").into_bytes(), fence: None }
    }

    pub fn with_fence(self, key: Vec<u8>) -> Self {
        Self { fence: Some(key), ..self }
    }

    fn key(&self, key: &[u8]) -> Vec<u8> {
        let mut full = Vec::with_capacity(self.root.len() + key.len());
        full.extend_from_slice(&self.root);
        full.extend_from_slice(key);
        full
    }

    fn range_end(&self, end: &[u8]) -> Vec<u8> {
        match end.is_empty() {
            true => keys::prefix_end(&self.root),
            false => self.key(end),
        }
    }

    fn entry(&self, kv: &etcd_client::KeyValue) -> Result<KeyValue> {
        let key = kv
            .key()
            .strip_prefix(self.root.as_slice())
            .ok_or_else(|| anyhow!("BUG: expect child of {}, got {}", String::from_utf8_lossy(&self.root), String::from_utf8_lossy(kv.key())))?;
        Ok(KeyValue { key: key.to_vec(), value: kv.value().to_vec(), version: kv.mod_revision() })
    }

    fn compares(&self, key: &[u8], expect: Expect) -> Vec<Compare> {
        let mut compares = Vec::with_capacity(2);
        if let Some(fence) = &self.fence {
            compares.push(Compare::create_revision(fence.clone(), CompareOp::NotEqual, 0));
        }
        match expect {
            Expect::Any => {},
            Expect::Absent => compares.push(Compare::create_revision(self.key(key), CompareOp::Equal, 0)),
            Expect::Version(version) => compares.push(Compare::mod_revision(self.key(key), CompareOp::Equal, version)),
        }
        compares
    }

    async fn commit(&self, compares: Vec<Compare>, op: TxnOp) -> Result<bool> {
        let mut client = self.client.kv_client();
        let txn = Txn::new().when(compares).and_then([op]);
        let response = client.txn(txn).await?;
        if response.succeeded() {
            return Ok(true);
        }
        if let Some(fence) = &self.fence {
            let response = client.get(fence.clone(), None).await?;
            if response.kvs().is_empty() {
                bail!("metadata write fence {} is gone", String::from_utf8_lossy(fence))
            }
        }
        Ok(false)
    }
}

#[async_trait]
impl MetaKv for EtcdMetaKv {
    async fn get(&self, key: &[u8]) -> Result<Option<KeyValue>> {
        let mut client = self.client.kv_client();
        let response = client.get(self.key(key), None).await?;
        response.kvs().first().map(|kv| self.entry(kv)).transpose()
    }

    async fn scan(&self, start: &[u8], end: &[u8], limit: usize) -> Result<Vec<KeyValue>> {
        if limit == 0 || (!end.is_empty() && start >= end) {
            return Ok(vec![]);
        }
        let mut client = self.client.kv_client();
        let options = GetOptions::new().with_range(self.range_end(end)).with_limit(limit as i64);
        let response = client.get(self.key(start), Some(options)).await?;
        response.kvs().iter().map(|kv| self.entry(kv)).collect()
    }

    async fn put(&self, key: &[u8], value: Vec<u8>, expect: Expect) -> Result<bool> {
        self.commit(self.compares(key, expect), TxnOp::put(self.key(key), value, None)).await
    }

    async fn delete(&self, key: &[u8], expect: Expect) -> Result<bool> {
        self.commit(self.compares(key, expect), TxnOp::delete(self.key(key), None)).await
    }
}
