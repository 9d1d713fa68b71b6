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

//! Row level key value capability over which coordinator metadata is persisted.
//!
//! Every mutation is atomic for a single key only. Multi-key updates are sequences of
//! single-key compare-and-swaps, so callers must keep each step idempotent.

mod etcd;
mod memory;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

pub use self::etcd::EtcdMetaKv;
pub use self::memory::MemoryMetaKv;
use crate::keys;

/// Version of a key, bumped on every write.
pub type Version = i64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub version: Version,
}

/// Precondition of a write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Expect {
    Any,
    Absent,
    Version(Version),
}

#[async_trait]
pub trait MetaKv: Send + Sync + std::fmt::Debug + 'static {
    async fn get(&self, key: &[u8]) -> Result<Option<KeyValue>>;

    /// Scans at most `limit` entries within `[start, end)` in key order. Empty `end` means
    /// unbounded.
    async fn scan(&self, start: &[u8], end: &[u8], limit: usize) -> Result<Vec<KeyValue>>;

    /// Writes value if `expect` holds, returns false otherwise.
    async fn put(&self, key: &[u8], value: Vec<u8>, expect: Expect) -> Result<bool>;

    /// Deletes key if `expect` holds, returns false otherwise.
    async fn delete(&self, key: &[u8], expect: Expect) -> Result<bool>;
}

/// Lazily scans `[start, end)` page by page.
pub fn scan_stream(
    kv: Arc<dyn MetaKv>,
    start: Vec<u8>,
    end: Vec<u8>,
    page: usize,
) -> BoxStream<'static, Result<KeyValue>> {
    let page = page.max(1);
    stream::unfold(Some(start), move |cursor| {
        let kv = kv.clone();
        let end = end.clone();
        async move {
            let start = cursor?;
            match kv.scan(&start, &end, page).await {
                Err(err) => Some((vec![Err(err)], None)),
                Ok(entries) if entries.is_empty() => None,
                Ok(entries) => {
                    let next = match entries.last() {
                        Some(last) if entries.len() >= page => Some(keys::successor(&last.key)),
                        _ => None,
                    };
                    Some((entries.into_iter().map(Ok).collect::<Vec<_>>(), next))
                },
            }
        }
    })
    .flat_map(stream::iter)
    .boxed()
}
