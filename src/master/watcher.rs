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

//! Reconciliation loop of one tablet level.

use std::collections::{BTreeSet, HashSet};
use std::fmt::{self, Display, Formatter};
use std::future::pending;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Result;
use futures::future::join_all;
use futures::{FutureExt, StreamExt};
use hashbrown::hash_map::HashMap;
use static_assertions::assert_impl_all;
use tokio::select;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use super::balancer::UnassignedTablets;
use super::env::MasterEnv;
use super::goal::{goal_state, GoalFacts, TabletGoalState};
use super::merge::{next_merge_state, MergeInfo, MergeKind, MergeState, MergeStats};
use super::rpc::TabletServerRpc;
use crate::cluster::{LiveServers, ServerIdentity};
use crate::tablet::{
    classify,
    Assignment,
    Extent,
    LevelCounts,
    TableCounts,
    TableCountsMap,
    TableId,
    TableStats,
    TabletLevel,
    TabletLocationState,
    TabletState,
    TabletStateStore,
    TabletStoreError,
};
use crate::utils::{display_row, DropWatcher, Truncated};

const LOG_LIMIT: usize = 100;

/// Request sent to a tablet server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TabletCall {
    Assign(Assignment),
    Unload { server: ServerIdentity, extent: Extent, save: bool },
    Chop { server: ServerIdentity, extent: Extent },
    Split { server: ServerIdentity, extent: Extent, row: Vec<u8> },
}

impl TabletCall {
    async fn send(&self, rpc: &dyn TabletServerRpc, lock: &[u8]) -> Result<()> {
        match self {
            Self::Assign(assignment) => rpc.assign(lock, &assignment.server, &assignment.extent).await,
            Self::Unload { server, extent, save } => rpc.unload(lock, server, extent, *save).await,
            Self::Chop { server, extent } => rpc.chop(lock, server, extent).await,
            Self::Split { server, extent, row } => rpc.split(lock, server, extent, row).await,
        }
    }
}

impl Display for TabletCall {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Assign(assignment) => write!(f, "assign {} to {}", assignment.extent, assignment.server),
            Self::Unload { server, extent, save } => write!(f, "unload {extent} from {server}(save: {save})"),
            Self::Chop { server, extent } => write!(f, "chop {extent} on {server}"),
            Self::Split { server, extent, row } => {
                write!(f, "split {extent} at {} on {server}", display_row(Some(row)))
            },
        }
    }
}

/// Work collected in a pass, flushed in chunks.
#[derive(Default)]
struct Batch {
    dead: Vec<TabletLocationState>,
    unassigned: UnassignedTablets,
    migrations: Vec<Assignment>,
    reminders: Vec<Assignment>,
    calls: Vec<TabletCall>,
    unloads: usize,
}

impl Batch {
    fn work(&self) -> usize {
        self.unassigned.len() + self.unloads
    }
}

/// Cluster facts fixed at start of a pass.
struct PassContext {
    live: LiveServers,
    destinations: LiveServers,
    shutting_down: BTreeSet<ServerIdentity>,
    cluster_stopping: bool,
    draining: bool,
    dependent_busy: bool,
}

/// Drives tablets of one level toward their goal states.
pub struct TabletGroupWatcher {
    level: TabletLevel,
    env: MasterEnv,
    store: Arc<dyn TabletStateStore>,
    stats: Arc<TableStats>,
    dependent: Option<Arc<dyn LevelCounts>>,
}

assert_impl_all!(TabletGroupWatcher: Send, Sync);

async fn changed(receiver: &mut watch::Receiver<u64>) {
    if receiver.changed().await.is_err() {
        pending::<()>().await;
    }
}

impl TabletGroupWatcher {
    pub fn new(level: TabletLevel, env: MasterEnv, store: Arc<dyn TabletStateStore>, stats: Arc<TableStats>) -> Self {
        Self { level, env, store, stats, dependent: None }
    }

    /// Counts of the level which must drain before this one during shutdown.
    pub fn with_dependent(self, dependent: Arc<dyn LevelCounts>) -> Self {
        Self { dependent: Some(dependent), ..self }
    }

    pub fn level(&self) -> TabletLevel {
        self.level
    }

    pub fn stats(&self) -> &Arc<TableStats> {
        &self.stats
    }

    /// Runs passes until leadership is lost or `stop` fires.
    pub async fn run(self, mut stop: DropWatcher) {
        let name = self.level.name();
        let mut events = self.env.events().listener();
        let mut servers = self.env.servers().watch_changes();
        let mut tables = self.env.tables().watch_changes();
        info!("{name} tablet watcher started");
        while self.env.leadership().still_leader() {
            let succeeded = match AssertUnwindSafe(self.run_pass()).catch_unwind().await {
                Ok(Ok(())) => true,
                Ok(Err(err)) => {
                    error!("{name} tablet watcher pass failed: {err:?}");
                    false
                },
                Err(_) => {
                    error!("{name} tablet watcher pass panicked");
                    false
                },
            };
            if !succeeded {
                select! {
                    _ = stop.dropped() => break,
                    _ = tokio::time::sleep(self.env.config().error_backoff) => continue,
                }
            }
            select! {
                _ = stop.dropped() => break,
                _ = events.wait() => {},
                _ = changed(&mut servers) => {},
                _ = changed(&mut tables) => {},
                _ = tokio::time::sleep(self.env.config().pass_interval) => {},
            }
        }
        info!("{name} tablet watcher stopped");
    }

    fn pass_context(&self) -> Option<PassContext> {
        let live = self.env.servers().live_servers();
        if live.is_empty() {
            return None;
        }
        let shutting_down: BTreeSet<_> =
            self.env.shutdown().servers().into_iter().filter(|server| live.contains_key(server)).collect();
        let destinations: LiveServers = live
            .iter()
            .filter(|(server, _)| !shutting_down.contains(*server))
            .map(|(server, status)| (server.clone(), status.clone()))
            .collect();
        let cluster_stopping = self.env.shutdown().cluster_stopping();
        let draining = cluster_stopping || destinations.is_empty();
        let dependent_busy =
            self.dependent.as_ref().map(|counts| counts.aggregate_counts().assigned_or_hosted() > 0).unwrap_or(false);
        Some(PassContext { live, destinations, shutting_down, cluster_stopping, draining, dependent_busy })
    }

    /// Scans all tablets of this level once and acts on every one not in its goal state.
    #[instrument(skip_all, fields(level = self.level.name()))]
    pub async fn run_pass(&self) -> Result<()> {
        let Some(context) = self.pass_context() else {
            debug!("no live tablet servers");
            return Ok(());
        };
        let work_limit = context.live.len() * self.env.config().work_chunk_per_server.max(1);
        let mut merges: HashMap<TableId, Option<MergeStats>> = HashMap::new();
        let mut counts = TableCountsMap::new();
        let mut batch = Batch::default();
        let mut unloaded = 0;
        let mut tablets = self.store.scan();
        while let Some(item) = tablets.next().await {
            let tablet = match item {
                Ok(tablet) => tablet,
                Err(TabletStoreError::BadLocationState { row, message }) => {
                    error!("skip tablet row {row}: {message}");
                    continue;
                },
                Err(err) => return Err(err.into()),
            };
            let table = tablet.extent.table_id();
            let Some(table_state) = self.env.tables().table_state(table) else {
                debug!("skip tablet {} of unknown table", tablet.extent);
                continue;
            };
            if !merges.contains_key(table) {
                let merge = self.env.metadata().merge_info(table).await?;
                merges.insert(table.clone(), merge.filter(|info| info.state != MergeState::None).map(MergeStats::new));
            }
            let state = classify(&tablet, &context.live);
            counts.entry(table.clone()).or_default().increment(state);
            if let Some(stats) = merges.get_mut(table).and_then(Option::as_mut) {
                stats.update(&tablet, state);
            }
            let merge = merges.get(table).and_then(Option::as_ref).map(MergeStats::info);
            if let Some(merge) = merge {
                self.check_merge_requests(&tablet, state, merge, &mut batch);
            }

            let mut migration = self.env.migrations().get(&tablet.extent);
            let dead_destination = migration.is_some() && migration.as_ref() == tablet.server();
            if state == TabletState::AssignedToDeadServer && dead_destination {
                info!("cancel migration of tablet {} to dead server", tablet.extent);
                self.env.migrations().cancel(&tablet.extent);
                migration = None;
            }
            let goal = goal_state(&GoalFacts {
                tablet: &tablet,
                state,
                table: Some(table_state),
                merge,
                migration: migration.as_ref(),
                shutting_down: &context.shutting_down,
                cluster_stopping: context.cluster_stopping,
                draining: context.draining,
                dependent_busy: context.dependent_busy,
            });

            if goal == TabletGoalState::Hosted {
                if state != TabletState::Hosted && !tablet.wal_refs.is_empty() {
                    match self.env.recovery().recover(&tablet.extent, &tablet.wal_refs).await {
                        Ok(false) => {},
                        Ok(true) => {
                            debug!("tablet {} waits for log recovery", tablet.extent);
                            continue;
                        },
                        Err(err) => {
                            warn!("fail to request log recovery for tablet {}: {err:#}", tablet.extent);
                            continue;
                        },
                    }
                }
                match state {
                    TabletState::Hosted => {
                        if let Some(current) = &tablet.current {
                            if self.env.migrations().complete(&tablet.extent, current) {
                                info!("tablet {} migrated to {current}", tablet.extent);
                            }
                        }
                    },
                    TabletState::AssignedToDeadServer => batch.dead.push(tablet),
                    TabletState::Assigned => {
                        if let Some(future) = tablet.future {
                            batch.reminders.push(Assignment::new(tablet.extent, future));
                        }
                    },
                    TabletState::Unassigned => match migration {
                        Some(destination) if context.destinations.contains_key(&destination) => {
                            batch.migrations.push(Assignment::new(tablet.extent, destination))
                        },
                        destination => {
                            if let Some(destination) = destination {
                                info!("cancel migration of {} to unavailable server {destination}", tablet.extent);
                                self.env.migrations().cancel(&tablet.extent);
                            }
                            batch.unassigned.insert(tablet.extent, tablet.last);
                        },
                    },
                }
            } else {
                match state {
                    TabletState::Hosted => {
                        if let Some(server) = tablet.current {
                            let save = goal != TabletGoalState::Deleted;
                            batch.calls.push(TabletCall::Unload { server, extent: tablet.extent, save });
                            batch.unloads += 1;
                        }
                    },
                    TabletState::AssignedToDeadServer => batch.dead.push(tablet),
                    TabletState::Assigned | TabletState::Unassigned => {},
                }
            }

            if batch.work() > work_limit {
                unloaded += batch.unloads;
                self.flush(&context, std::mem::take(&mut batch)).await?;
            }
        }
        unloaded += batch.unloads;
        self.flush(&context, batch).await?;
        self.publish_counts(counts, unloaded);
        for stats in merges.into_values().flatten() {
            if let Err(err) = self.update_merge_state(&stats).await {
                error!("fail to update {}: {err:?}", stats.info());
            }
        }
        match self.env.recovery().sweep().await {
            Ok(0) => {},
            Ok(n) => debug!("swept {n} finished log recoveries"),
            Err(err) => warn!("fail to sweep finished log recoveries: {err:#}"),
        }
        Ok(())
    }

    /// Chops or splits tablets a merge is waiting on.
    fn check_merge_requests(&self, tablet: &TabletLocationState, state: TabletState, merge: &MergeInfo, batch: &mut Batch) {
        if state != TabletState::Hosted {
            return;
        }
        let Some(server) = tablet.current.as_ref() else {
            return;
        };
        match merge.state {
            MergeState::WaitingForChopped if !tablet.chopped && merge.needs_to_be_chopped(&tablet.extent) => {
                batch.calls.push(TabletCall::Chop { server: server.clone(), extent: tablet.extent.clone() });
            },
            MergeState::Splitting if merge.kind == MergeKind::DeleteRange && merge.range.overlaps(&tablet.extent) => {
                let boundaries = [merge.range.prev_end_row(), merge.range.end_row()];
                let row = boundaries
                    .into_iter()
                    .flatten()
                    .find(|row| tablet.extent.contains_row(row) && tablet.extent.end_row() != Some(*row));
                if let Some(row) = row {
                    batch.calls.push(TabletCall::Split {
                        server: server.clone(),
                        extent: tablet.extent.clone(),
                        row: row.to_vec(),
                    });
                }
            },
            _ => {},
        }
    }

    /// Persists batched transitions and sends resulting requests to tablet servers.
    async fn flush(&self, context: &PassContext, batch: Batch) -> Result<()> {
        let name = self.level.name();
        if !batch.dead.is_empty() {
            self.store.unassign(&batch.dead).await?;
            self.env.events().event(format!(
                "[{name}]: {} tablets unassigned from dead servers {}",
                batch.dead.len(),
                Truncated::new(&batch.dead, LOG_LIMIT)
            ));
        }
        let mut assignments = batch.migrations;
        if !batch.unassigned.is_empty() {
            if context.destinations.is_empty() {
                warn!("[{name}]: no servers to assign {} unassigned tablets", batch.unassigned.len());
            } else {
                let mut accepted = HashSet::new();
                for assignment in self.env.balancer().assign(&context.destinations, &batch.unassigned) {
                    if !batch.unassigned.contains_key(&assignment.extent)
                        || !context.destinations.contains_key(&assignment.server)
                        || !accepted.insert(assignment.extent.clone())
                    {
                        warn!("[{name}]: discard assignment {assignment} outside of requested tablets and servers");
                        continue;
                    }
                    assignments.push(assignment);
                }
            }
        }
        if !assignments.is_empty() {
            self.store.set_future_locations(&assignments).await?;
            info!("[{name}]: assigning {} tablets {}", assignments.len(), Truncated::new(&assignments, LOG_LIMIT));
        }
        let calls: Vec<_> =
            assignments.into_iter().chain(batch.reminders).map(TabletCall::Assign).chain(batch.calls).collect();
        self.dispatch(&calls).await;
        Ok(())
    }

    async fn dispatch(&self, calls: &[TabletCall]) {
        if calls.is_empty() {
            return;
        }
        let rpc = self.env.rpc().as_ref();
        let lock = self.env.leadership().token();
        let timeout = self.env.config().rpc_timeout;
        let sends = calls.iter().map(|call| async move {
            match tokio::time::timeout(timeout, call.send(rpc, lock)).await {
                Ok(Ok(())) => debug!("sent {call}"),
                Ok(Err(err)) => warn!("fail to {call}: {err:#}"),
                Err(_) => warn!("timeout to {call} after {timeout:?}"),
            }
        });
        join_all(sends).await;
    }

    fn publish_counts(&self, counts: TableCountsMap, unloaded: usize) {
        let previous = TableCounts::aggregate(&self.stats.publish(counts));
        let latest = self.stats.aggregate_counts();
        for state in TabletState::ALL {
            if previous.get(state) != latest.get(state) {
                self.env.events().event(format!("[{}]: {} tablets are {state}", self.level.name(), latest.get(state)));
            }
        }
        if unloaded > 0 {
            self.env.events().event(format!("[{}]: {unloaded} tablets unloaded", self.level.name()));
        }
    }

    /// Advances merge of a table. `Merging` is persisted before metadata is rewritten, so an
    /// interrupted rewrite is redone by later passes.
    async fn update_merge_state(&self, stats: &MergeStats) -> Result<()> {
        let info = stats.info();
        let mut state = next_merge_state(stats);
        if state == MergeState::Merging {
            if info.state != MergeState::Merging {
                self.env.metadata().set_merge_state(info, MergeState::Merging).await?;
                self.env.events().event(format!("{info} moved to {state}"));
            }
            if !stats.ready_to_rewrite() {
                debug!("waiting for tablets of {info} to be unassigned before rewrite");
                return Ok(());
            }
            match info.kind {
                MergeKind::Merge => {
                    self.env.metadata().merge_range(&info.range, self.env.config().merge_file_batch).await?
                },
                MergeKind::DeleteRange => self.env.metadata().delete_range(&info.range).await?,
            }
            state = MergeState::Complete;
        }
        if state == info.state {
            return Ok(());
        }
        self.env.metadata().set_merge_state(info, state).await?;
        match state {
            MergeState::None | MergeState::Complete => self.env.events().event(format!("{info} completed")),
            _ => self.env.events().event(format!("{info} moved to {state}")),
        }
        Ok(())
    }
}
