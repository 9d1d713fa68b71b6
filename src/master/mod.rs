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

//! Coordinator: goal computation, merges and the per level reconciliation loops.

mod balancer;
mod env;
mod events;
mod goal;
mod merge;
mod migrations;
mod recovery;
mod rpc;
#[cfg(test)]
mod testing;
mod watcher;

use std::sync::Arc;

use anyhow::Result;
use futures::future::join_all;
use tokio::task::JoinHandle;

pub use self::balancer::{DefaultTabletBalancer, TabletBalancer, UnassignedTablets};
pub use self::env::{MasterConfig, MasterEnv, ShutdownIntent};
pub use self::events::{EventCoordinator, EventListener};
pub use self::goal::{goal_state, GoalFacts, TabletGoalState};
pub use self::merge::{next_merge_state, MergeInfo, MergeKind, MergeState, MergeStats};
pub use self::migrations::Migrations;
pub use self::recovery::{LogRecovery, MetaLogRecovery};
pub use self::rpc::{GrpcTabletServers, TabletServerRpc};
pub use self::watcher::{TabletCall, TabletGroupWatcher};
use crate::cluster::ServerIdentity;
use crate::tablet::{Extent, LevelCounts, MetadataStateStore, TableCountsMap, TableStats, TabletLevel};
use crate::utils::{drop_watcher, DropOwner};

/// Coordinator of all tablet levels.
pub struct Master {
    env: MasterEnv,
    system: Arc<TableStats>,
    user: Arc<TableStats>,
}

impl Master {
    pub fn new(env: MasterEnv) -> Self {
        Self { env, system: Arc::new(TableStats::new()), user: Arc::new(TableStats::new()) }
    }

    #[inline]
    pub fn env(&self) -> &MasterEnv {
        &self.env
    }

    fn stats(&self, level: TabletLevel) -> &Arc<TableStats> {
        match level {
            TabletLevel::System => &self.system,
            TabletLevel::User => &self.user,
        }
    }

    /// Builds the reconciliation loop of given level over the metadata table.
    pub fn watcher(&self, level: TabletLevel) -> TabletGroupWatcher {
        let store = MetadataStateStore::new(level, self.env.metadata().clone(), self.env.config().scan_page);
        let watcher = TabletGroupWatcher::new(level, self.env.clone(), Arc::new(store), self.stats(level).clone());
        match level.dependent() {
            None => watcher,
            Some(dependent) => watcher.with_dependent(self.stats(dependent).clone()),
        }
    }

    /// Per table counts published by the last completed pass of given level.
    pub fn table_counts(&self, level: TabletLevel) -> Arc<TableCountsMap> {
        self.stats(level).table_counts()
    }

    /// Spawns one loop per level. Loops end on leadership loss or when the handle stops.
    pub fn start(&self) -> MasterHandle {
        let (stop, watcher) = drop_watcher();
        let tasks = [TabletLevel::System, TabletLevel::User]
            .into_iter()
            .map(|level| tokio::spawn(self.watcher(level).run(watcher.clone())))
            .collect();
        MasterHandle { stop, tasks }
    }

    pub async fn request_merge(&self, range: Extent, kind: MergeKind) -> Result<MergeInfo> {
        let info = self.env.metadata().request_merge(range, kind).await?;
        self.env.events().event(format!("requested {info}"));
        Ok(info)
    }

    pub fn request_migration(&self, extent: Extent, destination: ServerIdentity) {
        let message = format!("requested migration of {extent} to {destination}");
        self.env.migrations().request(extent, destination);
        self.env.events().event(message);
    }

    pub fn shutdown_server(&self, server: ServerIdentity) {
        let message = format!("requested shutdown of tablet server {server}");
        self.env.shutdown().shutdown_server(server);
        self.env.events().event(message);
    }

    pub fn stop_cluster(&self) {
        self.env.shutdown().stop_cluster();
        self.env.events().event("requested cluster stop");
    }
}

/// Running loops of a [Master].
pub struct MasterHandle {
    stop: DropOwner,
    tasks: Vec<JoinHandle<()>>,
}

impl MasterHandle {
    /// Waits until all loops have ended by themselves.
    pub async fn wait(&mut self) {
        join_all(self.tasks.iter_mut().filter(|task| !task.is_finished())).await;
    }

    pub async fn stop(self) {
        let Self { stop, tasks } = self;
        drop(stop);
        join_all(tasks.into_iter().filter(|task| !task.is_finished())).await;
    }
}
