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

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use etcd_client::Client;
use tracing::info;

use super::etcd::{EtcdHelper, EtcdLease};
use crate::keys;

/// Singleton execution of the coordinator.
pub trait Leadership: Send + Sync {
    fn still_leader(&self) -> bool;

    /// Opaque token carried in requests to tablet servers so they can reject deposed coordinators.
    fn token(&self) -> &[u8];
}

/// Coordinator leadership held through an etcd lock bound to a kept alive lease.
pub struct EtcdMasterLock {
    key: Vec<u8>,
    lease: EtcdLease,
}

impl EtcdMasterLock {
    /// Blocks until this process becomes the coordinator.
    pub async fn acquire(client: &mut Client, root: &str) -> Result<Self> {
        let lease = EtcdHelper::grant_lease(client, None).await?;
        let name = format!("{root}/{}", keys::MASTER_LOCK_KEY);
        let key = EtcdHelper::lock(client, &name, &lease).await?;
        info!("acquired master lock {} with lease {:x}", String::from_utf8_lossy(&key), lease.id());
        Ok(Self { key, lease })
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }
}

impl Leadership for EtcdMasterLock {
    fn still_leader(&self) -> bool {
        self.lease.alive()
    }

    fn token(&self) -> &[u8] {
        &self.key
    }
}

/// Leadership granted by the embedding process, e.g. single node deployments.
#[derive(Debug)]
pub struct LocalLeadership {
    leader: AtomicBool,
    token: Vec<u8>,
}

impl LocalLeadership {
    pub fn new(token: impl Into<Vec<u8>>) -> Self {
        Self { leader: AtomicBool::new(true), token: token.into() }
    }

    pub fn resign(&self) {
        self.leader.store(false, Ordering::Relaxed);
    }
}

impl Leadership for LocalLeadership {
    fn still_leader(&self) -> bool {
        self.leader.load(Ordering::Relaxed)
    }

    fn token(&self) -> &[u8] {
        &self.token
    }
}
