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

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use static_assertions::assert_impl_all;

use super::balancer::{DefaultTabletBalancer, TabletBalancer};
use super::events::EventCoordinator;
use super::migrations::Migrations;
use super::recovery::{LogRecovery, MetaLogRecovery};
use super::rpc::TabletServerRpc;
use crate::cluster::{Leadership, ServerIdentity, ServerRegistry, TableDirectory};
use crate::tablet::MetadataTable;

const PASS_INTERVAL: Duration = Duration::from_secs(5);
const ERROR_BACKOFF: Duration = Duration::from_secs(1);
const WORK_CHUNK_PER_SERVER: usize = 5;
const MERGE_FILE_BATCH: usize = 1000;
const SCAN_PAGE: usize = 1000;
const RPC_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MasterConfig {
    pub pass_interval: Duration,
    pub error_backoff: Duration,
    /// Unassigned plus unloaded tablets per live server accumulated before an early flush.
    pub work_chunk_per_server: usize,
    pub merge_file_batch: usize,
    pub scan_page: usize,
    pub rpc_timeout: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            pass_interval: PASS_INTERVAL,
            error_backoff: ERROR_BACKOFF,
            work_chunk_per_server: WORK_CHUNK_PER_SERVER,
            merge_file_batch: MERGE_FILE_BATCH,
            scan_page: SCAN_PAGE,
            rpc_timeout: RPC_TIMEOUT,
        }
    }
}

impl MasterConfig {
    pub fn with_pass_interval(self, pass_interval: Duration) -> Self {
        Self { pass_interval, ..self }
    }

    pub fn with_error_backoff(self, error_backoff: Duration) -> Self {
        Self { error_backoff, ..self }
    }

    pub fn with_work_chunk_per_server(self, work_chunk_per_server: usize) -> Self {
        Self { work_chunk_per_server: work_chunk_per_server.max(1), ..self }
    }

    pub fn with_merge_file_batch(self, merge_file_batch: usize) -> Self {
        Self { merge_file_batch: merge_file_batch.max(1), ..self }
    }

    pub fn with_scan_page(self, scan_page: usize) -> Self {
        Self { scan_page: scan_page.max(1), ..self }
    }

    pub fn with_rpc_timeout(self, rpc_timeout: Duration) -> Self {
        Self { rpc_timeout, ..self }
    }
}

/// Operator intent to stop servers or the whole cluster gracefully.
#[derive(Debug, Default)]
pub struct ShutdownIntent {
    servers: Mutex<BTreeSet<ServerIdentity>>,
    cluster: AtomicBool,
}

impl ShutdownIntent {
    pub fn shutdown_server(&self, server: ServerIdentity) {
        self.servers.lock().unwrap().insert(server);
    }

    pub fn cancel_server_shutdown(&self, server: &ServerIdentity) {
        self.servers.lock().unwrap().remove(server);
    }

    pub fn servers(&self) -> BTreeSet<ServerIdentity> {
        self.servers.lock().unwrap().clone()
    }

    pub fn stop_cluster(&self) {
        self.cluster.store(true, Ordering::Relaxed);
    }

    pub fn cluster_stopping(&self) -> bool {
        self.cluster.load(Ordering::Relaxed)
    }
}

/// Capabilities the coordinator runs against.
#[derive(Clone)]
pub struct MasterEnv {
    metadata: MetadataTable,
    servers: Arc<dyn ServerRegistry>,
    tables: Arc<dyn TableDirectory>,
    leadership: Arc<dyn Leadership>,
    rpc: Arc<dyn TabletServerRpc>,
    balancer: Arc<dyn TabletBalancer>,
    recovery: Arc<dyn LogRecovery>,
    migrations: Arc<Migrations>,
    shutdown: Arc<ShutdownIntent>,
    events: EventCoordinator,
    config: MasterConfig,
}

assert_impl_all!(MasterEnv: Send, Sync, Clone);

impl MasterEnv {
    pub fn new(
        metadata: MetadataTable,
        servers: Arc<dyn ServerRegistry>,
        tables: Arc<dyn TableDirectory>,
        leadership: Arc<dyn Leadership>,
        rpc: Arc<dyn TabletServerRpc>,
    ) -> Self {
        let recovery = Arc::new(MetaLogRecovery::new(metadata.clone()));
        Self {
            metadata,
            servers,
            tables,
            leadership,
            rpc,
            balancer: Arc::new(DefaultTabletBalancer::new()),
            recovery,
            migrations: Arc::new(Migrations::new()),
            shutdown: Arc::new(ShutdownIntent::default()),
            events: EventCoordinator::new(),
            config: MasterConfig::default(),
        }
    }

    pub fn with_balancer(self, balancer: Arc<dyn TabletBalancer>) -> Self {
        Self { balancer, ..self }
    }

    pub fn with_recovery(self, recovery: Arc<dyn LogRecovery>) -> Self {
        Self { recovery, ..self }
    }

    pub fn with_config(self, config: MasterConfig) -> Self {
        Self { config, ..self }
    }

    #[inline]
    pub fn metadata(&self) -> &MetadataTable {
        &self.metadata
    }

    #[inline]
    pub fn servers(&self) -> &Arc<dyn ServerRegistry> {
        &self.servers
    }

    #[inline]
    pub fn tables(&self) -> &Arc<dyn TableDirectory> {
        &self.tables
    }

    #[inline]
    pub fn leadership(&self) -> &Arc<dyn Leadership> {
        &self.leadership
    }

    #[inline]
    pub fn rpc(&self) -> &Arc<dyn TabletServerRpc> {
        &self.rpc
    }

    #[inline]
    pub fn balancer(&self) -> &Arc<dyn TabletBalancer> {
        &self.balancer
    }

    #[inline]
    pub fn recovery(&self) -> &Arc<dyn LogRecovery> {
        &self.recovery
    }

    #[inline]
    pub fn migrations(&self) -> &Arc<Migrations> {
        &self.migrations
    }

    #[inline]
    pub fn shutdown(&self) -> &Arc<ShutdownIntent> {
        &self.shutdown
    }

    #[inline]
    pub fn events(&self) -> &EventCoordinator {
        &self.events
    }

    #[inline]
    pub fn config(&self) -> &MasterConfig {
        &self.config
    }
}
