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

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

use super::{Expect, KeyValue, MetaKv, Version};

#[derive(Debug, Default)]
struct MemoryState {
    revision: Version,
    entries: BTreeMap<Vec<u8>, (Vec<u8>, Version)>,
}

impl MemoryState {
    fn satisfies(&self, key: &[u8], expect: Expect) -> bool {
        match expect {
            Expect::Any => true,
            Expect::Absent => !self.entries.contains_key(key),
            Expect::Version(version) => self.entries.get(key).map(|(_, v)| *v) == Some(version),
        }
    }
}

/// In process [MetaKv] for single node deployments and tests.
#[derive(Debug, Default)]
pub struct MemoryMetaKv {
    state: Mutex<MemoryState>,
}

impl MemoryMetaKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MetaKv for MemoryMetaKv {
    async fn get(&self, key: &[u8]) -> Result<Option<KeyValue>> {
        let state = self.state.lock().unwrap();
        Ok(state.entries.get(key).map(|(value, version)| KeyValue {
            key: key.to_vec(),
            value: value.clone(),
            version: *version,
        }))
    }

    async fn scan(&self, start: &[u8], end: &[u8], limit: usize) -> Result<Vec<KeyValue>> {
        if !end.is_empty() && start >= end {
            return Ok(vec![]);
        }
        let upper = if end.is_empty() { Bound::Unbounded } else { Bound::Excluded(end.to_vec()) };
        let state = self.state.lock().unwrap();
        let entries = state
            .entries
            .range((Bound::Included(start.to_vec()), upper))
            .take(limit)
            .map(|(key, (value, version))| KeyValue { key: key.clone(), value: value.clone(), version: *version })
            .collect();
        Ok(entries)
    }

    async fn put(&self, key: &[u8], value: Vec<u8>, expect: Expect) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        if !state.satisfies(key, expect) {
            return Ok(false);
        }
        state.revision += 1;
        let revision = state.revision;
        state.entries.insert(key.to_vec(), (value, revision));
        Ok(true)
    }

    async fn delete(&self, key: &[u8], expect: Expect) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        if !state.satisfies(key, expect) {
            return Ok(false);
        }
        if state.entries.remove(key).is_some() {
            state.revision += 1;
        }
        Ok(true)
    }
}
