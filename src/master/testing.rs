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

//! In-process cluster of fake tablet servers driven one pass at a time.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, ensure, Result};
use async_trait::async_trait;

use super::*;
use crate::cluster::{LocalLeadership, MemoryServerRegistry, MemoryTableDirectory, TableState};
use crate::meta::{MemoryMetaKv, MetaKv};
use crate::protos::TabletRecord;
use crate::tablet::{Assignment, MetadataTable, TableCounts, TabletLocationState, TabletRow};
use crate::utils::display_row;

/// Tablet servers which act on requests by rewriting tablet rows as real servers report back.
#[derive(Debug)]
pub struct FakeTabletServers {
    metadata: MetadataTable,
    calls: Mutex<Vec<TabletCall>>,
    unresponsive: AtomicBool,
}

impl FakeTabletServers {
    pub fn new(metadata: MetadataTable) -> Self {
        Self { metadata, calls: Mutex::new(vec![]), unresponsive: AtomicBool::new(false) }
    }

    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.unresponsive.store(unresponsive, Ordering::Relaxed);
    }

    pub fn take_calls(&self) -> Vec<TabletCall> {
        std::mem::take(&mut self.calls.lock().unwrap())
    }

    fn record(&self, call: TabletCall) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        if self.unresponsive.load(Ordering::Relaxed) {
            bail!("tablet server unresponsive")
        }
        Ok(())
    }
}

#[async_trait]
impl TabletServerRpc for FakeTabletServers {
    async fn assign(&self, _lock: &[u8], server: &ServerIdentity, extent: &Extent) -> Result<()> {
        self.record(TabletCall::Assign(Assignment::new(extent.clone(), server.clone())))?;
        let location = vec![server.to_record()];
        self.metadata
            .mutate_tablet(extent.table(), extent.end_row(), |record| {
                if record.prev_end_row.as_deref() != extent.prev_end_row() || record.future != location {
                    return false;
                }
                record.current = std::mem::take(&mut record.future);
                record.last = record.current.clone();
                true
            })
            .await?;
        Ok(())
    }

    async fn unload(&self, _lock: &[u8], server: &ServerIdentity, extent: &Extent, save: bool) -> Result<()> {
        self.record(TabletCall::Unload { server: server.clone(), extent: extent.clone(), save })?;
        let location = vec![server.to_record()];
        self.metadata
            .mutate_tablet(extent.table(), extent.end_row(), |record| {
                if record.current != location {
                    return false;
                }
                record.current.clear();
                true
            })
            .await?;
        Ok(())
    }

    async fn chop(&self, _lock: &[u8], server: &ServerIdentity, extent: &Extent) -> Result<()> {
        self.record(TabletCall::Chop { server: server.clone(), extent: extent.clone() })?;
        let location = vec![server.to_record()];
        self.metadata
            .mutate_tablet(extent.table(), extent.end_row(), |record| {
                record.current == location && !std::mem::replace(&mut record.chopped, true)
            })
            .await?;
        Ok(())
    }

    async fn split(&self, _lock: &[u8], server: &ServerIdentity, extent: &Extent, row: &[u8]) -> Result<()> {
        self.record(TabletCall::Split { server: server.clone(), extent: extent.clone(), row: row.to_vec() })?;
        let location = vec![server.to_record()];
        let Some(existing) = self.metadata.get_tablet(extent.table(), extent.end_row()).await? else {
            bail!("tablet {extent} not found")
        };
        ensure!(existing.extent == *extent && existing.record.current == location, "tablet {extent} not on {server}");
        let (low, _) = extent.split_at(row)?;
        let record = TabletRecord {
            current: location.clone(),
            last: location,
            directory: format!("{}-{}", existing.record.directory, display_row(Some(row))),
            time: existing.record.time,
            ..Default::default()
        };
        self.metadata.insert_tablet(&low, record).await?;
        self.metadata
            .mutate_tablet(extent.table(), extent.end_row(), |record| {
                record.prev_end_row = Some(row.to_vec());
                true
            })
            .await?;
        Ok(())
    }

    async fn compact(&self, _lock: &[u8], _server: &ServerIdentity, _extent: &Extent) -> Result<()> {
        Ok(())
    }
}

pub struct TestCluster {
    pub metadata: MetadataTable,
    pub servers: Arc<MemoryServerRegistry>,
    pub tables: Arc<MemoryTableDirectory>,
    pub leadership: Arc<LocalLeadership>,
    pub rpc: Arc<FakeTabletServers>,
    pub master: Master,
}

impl Default for TestCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl TestCluster {
    pub fn new() -> Self {
        Self::with(Arc::new(MemoryMetaKv::new()), |env| env)
    }

    pub fn with(kv: Arc<dyn MetaKv>, configure: impl FnOnce(MasterEnv) -> MasterEnv) -> Self {
        let metadata = MetadataTable::new(kv);
        let servers = Arc::new(MemoryServerRegistry::new());
        let tables = Arc::new(MemoryTableDirectory::new());
        let leadership = Arc::new(LocalLeadership::new("test-master"));
        let rpc = Arc::new(FakeTabletServers::new(metadata.clone()));
        let env = MasterEnv::new(metadata.clone(), servers.clone(), tables.clone(), leadership.clone(), rpc.clone());
        let master = Master::new(configure(env));
        Self { metadata, servers, tables, leadership, rpc, master }
    }

    pub async fn create_table(&self, table: &str, splits: &[&[u8]]) {
        self.metadata.create_table(table, splits).await.unwrap();
        self.tables.set_state(table, TableState::Online);
    }

    pub async fn pass(&self, level: TabletLevel) {
        self.master.watcher(level).run_pass().await.unwrap();
    }

    pub async fn passes(&self, level: TabletLevel, n: usize) {
        for _ in 0..n {
            self.pass(level).await;
        }
    }

    pub fn counts(&self, level: TabletLevel, table: &str) -> TableCounts {
        self.master.table_counts(level).get(table).copied().unwrap_or_default()
    }

    pub async fn rows(&self, table: &str) -> Vec<TabletRow> {
        self.metadata.table_tablets(table).await.unwrap()
    }

    pub async fn locations(&self, table: &str) -> Vec<TabletLocationState> {
        self.rows(table).await.iter().map(|row| TabletLocationState::try_from(row).unwrap()).collect()
    }

    /// Extents with their current servers.
    pub async fn placements(&self, table: &str) -> Vec<(String, Option<ServerIdentity>)> {
        self.locations(table).await.into_iter().map(|tablet| (tablet.extent.to_string(), tablet.current)).collect()
    }

    /// Places tablet on server as if it had been assigned and loaded.
    pub async fn host(&self, table: &str, end_row: Option<&[u8]>, server: &ServerIdentity) {
        let location = vec![server.to_record()];
        self.metadata
            .mutate_tablet(table, end_row, |record| {
                record.current = location.clone();
                record.last = location.clone();
                true
            })
            .await
            .unwrap()
            .unwrap();
    }
}

mod tests {
    use std::collections::BTreeSet;
    use std::time::Duration;

    use assertor::*;
    use futures::stream::BoxStream;
    use test_case::test_case;

    use super::*;
    use crate::cluster::LiveServers;
    use crate::keys;
    use crate::meta::{Expect, KeyValue};
    use crate::tablet::{LevelCounts, MetadataStateStore, TableStats, TabletState, TabletStateStore, TabletStoreError};

    const USER: TabletLevel = TabletLevel::User;
    const SYSTEM: TabletLevel = TabletLevel::System;

    fn servers_of(calls: &[TabletCall]) -> Vec<ServerIdentity> {
        calls
            .iter()
            .map(|call| match call {
                TabletCall::Assign(assignment) => assignment.server.clone(),
                TabletCall::Unload { server, .. } | TabletCall::Chop { server, .. } | TabletCall::Split { server, .. } => {
                    server.clone()
                },
            })
            .collect()
    }

    fn drain_events(events: &mut tokio::sync::broadcast::Receiver<Arc<str>>) -> Vec<String> {
        let mut messages = vec![];
        while let Ok(message) = events.try_recv() {
            messages.push(message.to_string());
        }
        messages
    }

    #[test_log::test(tokio::test)]
    async fn test_tablets_of_dead_server_reassigned() {
        let cluster = TestCluster::new();
        cluster.create_table("1", &[b"m", b"z"]).await;
        let a = cluster.servers.join("a:1");
        let b = cluster.servers.join("b:1");
        cluster.host("1", Some(b"m"), &a).await;
        cluster.host("1", Some(b"z"), &a).await;
        cluster.host("1", None, &b).await;

        cluster.pass(USER).await;
        assert_that!(cluster.rpc.take_calls()).is_empty();
        assert_that!(cluster.counts(USER, "1").get(TabletState::Hosted)).is_equal_to(3);

        let c = cluster.servers.join("c:1");
        cluster.servers.leave(&a);
        let mut events = cluster.master.env().events().subscribe();

        cluster.pass(USER).await;
        let counts = cluster.counts(USER, "1");
        assert_that!(counts.get(TabletState::AssignedToDeadServer)).is_equal_to(2);
        assert_that!(counts.get(TabletState::Hosted)).is_equal_to(1);
        assert_that!(cluster.rpc.take_calls()).is_empty();
        let currents: Vec<_> = cluster.placements("1").await.into_iter().map(|(_, current)| current).collect();
        assert_that!(currents).is_equal_to(vec![None, None, Some(b.clone())]);
        assert_that!(drain_events(&mut events).iter().any(|event| event.contains("dead servers"))).is_true();

        cluster.pass(USER).await;
        let counts = cluster.counts(USER, "1");
        assert_that!(counts.get(TabletState::Unassigned)).is_equal_to(2);
        let calls = cluster.rpc.take_calls();
        assert_that!(calls.len()).is_equal_to(2);
        assert_that!(calls.iter().all(|call| matches!(call, TabletCall::Assign(_)))).is_true();
        let targets: BTreeSet<_> = servers_of(&calls).into_iter().collect();
        assert_that!(targets).is_equal_to(BTreeSet::from([b.clone(), c.clone()]));

        cluster.pass(USER).await;
        assert_that!(cluster.counts(USER, "1").get(TabletState::Hosted)).is_equal_to(3);
        for (extent, current) in cluster.placements("1").await {
            let current = current.unwrap_or_else(|| panic!("tablet {extent} not hosted"));
            assert_that!(current == b || current == c).is_true();
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_delete_range() {
        let cluster = TestCluster::new();
        cluster.create_table("1", &[b"f"]).await;
        let a = cluster.servers.join("a:1");
        cluster.pass(USER).await;
        assert_that!(cluster.counts(USER, "1").get(TabletState::Unassigned)).is_equal_to(2);
        cluster.rpc.take_calls();

        let range = Extent::new("1", Some(b"d"), Some(b"g"));
        cluster.master.request_merge(range.clone(), MergeKind::DeleteRange).await.unwrap();

        cluster.pass(USER).await;
        let calls = cluster.rpc.take_calls();
        assert_that!(calls).is_equal_to(vec![
            TabletCall::Split { server: a.clone(), extent: Extent::new("1", None, Some(b"f")), row: b"d".to_vec() },
            TabletCall::Split { server: a.clone(), extent: Extent::new("1", Some(b"f"), None), row: b"g".to_vec() },
        ]);
        let extents: Vec<_> = cluster.placements("1").await.into_iter().map(|(extent, _)| extent).collect();
        assert_that!(extents).is_equal_to(vec![
            "1(-,d]".to_string(),
            "1(d,f]".to_string(),
            "1(f,g]".to_string(),
            "1(g,-]".to_string(),
        ]);

        cluster.pass(USER).await;
        let merge = cluster.metadata.merge_info("1").await.unwrap().unwrap();
        assert_that!(merge.state).is_equal_to(MergeState::WaitingForChopped);

        cluster.pass(USER).await;
        let chopped: Vec<_> = cluster
            .rpc
            .take_calls()
            .into_iter()
            .filter_map(|call| match call {
                TabletCall::Chop { extent, .. } => Some(extent.to_string()),
                _ => None,
            })
            .collect();
        assert_that!(chopped).is_equal_to(vec!["1(d,f]".to_string(), "1(f,g]".to_string(), "1(g,-]".to_string()]);

        cluster.passes(USER, 3).await;
        assert_that!(cluster.metadata.merge_info("1").await.unwrap()).is_none();
        let placements = cluster.placements("1").await;
        assert_that!(placements).is_equal_to(vec![
            ("1(-,d]".to_string(), Some(a.clone())),
            ("1(d,-]".to_string(), Some(a.clone())),
        ]);
        let rows = cluster.rows("1").await;
        assert_that!(rows.iter().all(|row| !row.record.chopped)).is_true();
        let candidates: Vec<_> = cluster.metadata.delete_candidates().await.unwrap().into_iter().map(|(path, _)| path).collect();
        assert_that!(candidates).contains(&"/tables/1/t-0000".to_string());
        assert_that!(candidates).contains(&"/tables/1/default_tablet-g".to_string());
    }

    #[test_log::test(tokio::test)]
    async fn test_merge() {
        let cluster = TestCluster::new();
        cluster.create_table("1", &[b"c", b"f", b"m"]).await;
        let a = cluster.servers.join("a:1");
        cluster.pass(USER).await;

        let range = Extent::new("1", Some(b"b"), Some(b"g"));
        cluster.master.request_merge(range, MergeKind::Merge).await.unwrap();
        cluster.pass(USER).await;
        let merge = cluster.metadata.merge_info("1").await.unwrap().unwrap();
        assert_that!(merge.state).is_equal_to(MergeState::WaitingForChopped);

        cluster.passes(USER, 5).await;
        assert_that!(cluster.metadata.merge_info("1").await.unwrap()).is_none();
        assert_that!(cluster.placements("1").await).is_equal_to(vec![
            ("1(-,m]".to_string(), Some(a.clone())),
            ("1(m,-]".to_string(), Some(a.clone())),
        ]);
        let candidates: BTreeSet<_> =
            cluster.metadata.delete_candidates().await.unwrap().into_iter().map(|(path, _)| path).collect();
        assert_that!(candidates)
            .is_equal_to(BTreeSet::from(["/tables/1/t-0000".to_string(), "/tables/1/t-0001".to_string()]));
    }

    #[test_log::test(tokio::test)]
    async fn test_merge_resumes_interrupted_rewrite() {
        #[derive(Debug, Default)]
        struct FailingDeleteKv {
            inner: MemoryMetaKv,
            failures: AtomicUsize,
        }

        #[async_trait]
        impl MetaKv for FailingDeleteKv {
            async fn get(&self, key: &[u8]) -> Result<Option<KeyValue>> {
                self.inner.get(key).await
            }

            async fn scan(&self, start: &[u8], end: &[u8], limit: usize) -> Result<Vec<KeyValue>> {
                self.inner.scan(start, end, limit).await
            }

            async fn put(&self, key: &[u8], value: Vec<u8>, expect: Expect) -> Result<bool> {
                self.inner.put(key, value, expect).await
            }

            async fn delete(&self, key: &[u8], expect: Expect) -> Result<bool> {
                let failing = key.starts_with(keys::TABLETS_PREFIX)
                    && self.failures.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1)).is_ok();
                if failing {
                    bail!("injected delete failure")
                }
                self.inner.delete(key, expect).await
            }
        }

        let kv = Arc::new(FailingDeleteKv { failures: AtomicUsize::new(1), ..Default::default() });
        let cluster = TestCluster::with(kv.clone(), |env| env);
        cluster.create_table("1", &[b"c", b"f", b"m"]).await;
        let a = cluster.servers.join("a:1");
        cluster.pass(USER).await;

        cluster.master.request_merge(Extent::new("1", Some(b"b"), Some(b"g")), MergeKind::Merge).await.unwrap();
        for _ in 0..8 {
            if kv.failures.load(Ordering::Relaxed) == 0 {
                break;
            }
            cluster.pass(USER).await;
        }
        assert_that!(kv.failures.load(Ordering::Relaxed)).is_equal_to(0);
        let merge = cluster.metadata.merge_info("1").await.unwrap().unwrap();
        assert_that!(merge.state).is_equal_to(MergeState::Merging);
        let extents: Vec<_> = cluster.placements("1").await.into_iter().map(|(extent, _)| extent).collect();
        assert_that!(extents).is_equal_to(vec![
            "1(-,c]".to_string(),
            "1(c,f]".to_string(),
            "1(-,m]".to_string(),
            "1(m,-]".to_string(),
        ]);

        cluster.passes(USER, 3).await;
        assert_that!(cluster.metadata.merge_info("1").await.unwrap()).is_none();
        assert_that!(cluster.placements("1").await).is_equal_to(vec![
            ("1(-,m]".to_string(), Some(a.clone())),
            ("1(m,-]".to_string(), Some(a.clone())),
        ]);
        assert_that!(cluster.rows("1").await.iter().all(|row| !row.record.chopped)).is_true();
    }

    #[tokio::test]
    async fn test_merge_within_single_tablet() {
        let cluster = TestCluster::new();
        cluster.create_table("1", &[b"m"]).await;
        cluster.servers.join("a:1");
        cluster.pass(USER).await;

        cluster.master.request_merge(Extent::new("1", Some(b"b"), Some(b"c")), MergeKind::Merge).await.unwrap();
        cluster.pass(USER).await;
        assert_that!(cluster.metadata.merge_info("1").await.unwrap()).is_none();
        assert_that!(cluster.rows("1").await.len()).is_equal_to(2);
    }

    #[tokio::test]
    async fn test_steady_pass_is_noop() {
        let cluster = TestCluster::new();
        cluster.create_table("1", &[b"m"]).await;
        cluster.servers.join("a:1");
        cluster.pass(USER).await;
        assert_that!(cluster.rpc.take_calls().len()).is_equal_to(2);

        let rows = cluster.rows("1").await;
        cluster.passes(USER, 2).await;
        assert_that!(cluster.rpc.take_calls()).is_empty();
        assert_that!(cluster.rows("1").await).is_equal_to(rows);
        assert_that!(cluster.counts(USER, "1").get(TabletState::Hosted)).is_equal_to(2);
    }

    #[tokio::test]
    async fn test_no_live_servers() {
        let cluster = TestCluster::new();
        cluster.create_table("1", &[]).await;
        cluster.pass(USER).await;
        assert_that!(cluster.rpc.take_calls()).is_empty();
        assert_that!(cluster.master.table_counts(USER).is_empty()).is_true();
    }

    #[tokio::test]
    async fn test_unknown_table_skipped() {
        let cluster = TestCluster::new();
        cluster.metadata.create_table("2", &[]).await.unwrap();
        cluster.servers.join("a:1");
        cluster.pass(USER).await;
        assert_that!(cluster.rpc.take_calls()).is_empty();
        assert_that!(cluster.master.table_counts(USER).contains_key("2")).is_false();
    }

    #[test_case(TableState::Offline, true; "offline")]
    #[test_case(TableState::Deleting, false; "deleting")]
    #[tokio::test]
    async fn test_unload_tablets_of_table(state: TableState, save: bool) {
        let cluster = TestCluster::new();
        cluster.create_table("1", &[]).await;
        let a = cluster.servers.join("a:1");
        cluster.host("1", None, &a).await;

        cluster.tables.set_state("1", state);
        cluster.pass(USER).await;
        assert_that!(cluster.rpc.take_calls()).is_equal_to(vec![TabletCall::Unload {
            server: a.clone(),
            extent: Extent::whole("1"),
            save,
        }]);

        cluster.pass(USER).await;
        assert_that!(cluster.rpc.take_calls()).is_empty();
        assert_that!(cluster.counts(USER, "1").get(TabletState::Unassigned)).is_equal_to(1);
    }

    #[tokio::test]
    async fn test_chunked_flush() {
        struct CountingStore {
            inner: MetadataStateStore,
            batches: Mutex<Vec<usize>>,
        }

        #[async_trait]
        impl TabletStateStore for CountingStore {
            fn name(&self) -> &str {
                self.inner.name()
            }

            fn scan(&self) -> BoxStream<'static, Result<TabletLocationState, TabletStoreError>> {
                self.inner.scan()
            }

            async fn set_future_locations(&self, assignments: &[Assignment]) -> Result<(), TabletStoreError> {
                self.batches.lock().unwrap().push(assignments.len());
                self.inner.set_future_locations(assignments).await
            }

            async fn set_locations(&self, assignments: &[Assignment]) -> Result<(), TabletStoreError> {
                self.inner.set_locations(assignments).await
            }

            async fn unassign(&self, tablets: &[TabletLocationState]) -> Result<(), TabletStoreError> {
                self.inner.unassign(tablets).await
            }
        }

        let config = MasterConfig::default().with_work_chunk_per_server(1);
        let cluster = TestCluster::with(Arc::new(MemoryMetaKv::new()), |env| env.with_config(config));
        cluster.create_table("1", &[b"b", b"c", b"d", b"e"]).await;
        cluster.servers.join("a:1");

        let store = Arc::new(CountingStore {
            inner: MetadataStateStore::new(USER, cluster.metadata.clone(), 2),
            batches: Mutex::new(vec![]),
        });
        let stats = Arc::new(TableStats::new());
        let watcher = TabletGroupWatcher::new(USER, cluster.master.env().clone(), store.clone(), stats.clone());
        watcher.run_pass().await.unwrap();
        assert_that!(store.batches.lock().unwrap().clone()).is_equal_to(vec![2, 2, 1]);
        assert_that!(stats.aggregate_counts().get(TabletState::Unassigned)).is_equal_to(5);

        watcher.run_pass().await.unwrap();
        assert_that!(stats.aggregate_counts().get(TabletState::Hosted)).is_equal_to(5);
    }

    #[tokio::test]
    async fn test_discard_assignments_outside_request() {
        struct RogueBalancer {
            ghost: ServerIdentity,
        }

        impl TabletBalancer for RogueBalancer {
            fn assign(&self, servers: &LiveServers, unassigned: &UnassignedTablets) -> Vec<Assignment> {
                let mut assignments: Vec<_> = servers.keys().map(|server| Assignment::new(Extent::whole("9"), server.clone())).collect();
                assignments.extend(unassigned.keys().map(|extent| Assignment::new(extent.clone(), self.ghost.clone())));
                assignments
            }
        }

        let balancer = Arc::new(RogueBalancer { ghost: ServerIdentity::new("ghost:1", "s0") });
        let cluster = TestCluster::with(Arc::new(MemoryMetaKv::new()), |env| env.with_balancer(balancer));
        cluster.create_table("1", &[]).await;
        cluster.servers.join("a:1");

        cluster.pass(USER).await;
        assert_that!(cluster.rpc.take_calls()).is_empty();
        let locations = cluster.locations("1").await;
        assert_that!(locations[0].future).is_none();
        assert_that!(locations[0].current).is_none();
    }

    #[test_log::test(tokio::test)]
    #[tracing_test::traced_test]
    async fn test_skip_malformed_row() {
        let cluster = TestCluster::new();
        cluster.create_table("1", &[b"m"]).await;
        let key = keys::tablet_key("1", Some(b"x"));
        cluster.metadata.kv().put(&key, b"\xff\xff\xff".to_vec(), Expect::Absent).await.unwrap();
        cluster.servers.join("a:1");

        cluster.pass(USER).await;
        assert_that!(cluster.counts(USER, "1").total()).is_equal_to(2);
        assert_that!(cluster.rpc.take_calls().len()).is_equal_to(2);
        assert!(logs_contain("skip tablet row"));
    }

    #[tokio::test]
    async fn test_pass_aborts_on_store_failure() {
        #[derive(Debug, Default)]
        struct FailingScanKv {
            inner: MemoryMetaKv,
            failing: AtomicBool,
        }

        #[async_trait]
        impl MetaKv for FailingScanKv {
            async fn get(&self, key: &[u8]) -> Result<Option<KeyValue>> {
                self.inner.get(key).await
            }

            async fn scan(&self, start: &[u8], end: &[u8], limit: usize) -> Result<Vec<KeyValue>> {
                if self.failing.load(Ordering::Relaxed) {
                    bail!("injected scan failure")
                }
                self.inner.scan(start, end, limit).await
            }

            async fn put(&self, key: &[u8], value: Vec<u8>, expect: Expect) -> Result<bool> {
                self.inner.put(key, value, expect).await
            }

            async fn delete(&self, key: &[u8], expect: Expect) -> Result<bool> {
                self.inner.delete(key, expect).await
            }
        }

        let kv = Arc::new(FailingScanKv::default());
        let cluster = TestCluster::with(kv.clone(), |env| env);
        cluster.create_table("1", &[]).await;
        cluster.servers.join("a:1");

        kv.failing.store(true, Ordering::Relaxed);
        let err = cluster.master.watcher(USER).run_pass().await.unwrap_err();
        assert_that!(format!("{err:#}")).contains("injected scan failure");
        assert_that!(cluster.rpc.take_calls()).is_empty();

        kv.failing.store(false, Ordering::Relaxed);
        cluster.pass(USER).await;
        assert_that!(cluster.rpc.take_calls().len()).is_equal_to(1);
    }

    #[tokio::test]
    async fn test_remind_assigned_server() {
        let cluster = TestCluster::new();
        cluster.create_table("1", &[]).await;
        let a = cluster.servers.join("a:1");
        let assign = TabletCall::Assign(Assignment::new(Extent::whole("1"), a.clone()));

        cluster.rpc.set_unresponsive(true);
        cluster.pass(USER).await;
        assert_that!(cluster.rpc.take_calls()).is_equal_to(vec![assign.clone()]);
        assert_that!(cluster.locations("1").await[0].future.clone()).is_equal_to(Some(a.clone()));

        cluster.pass(USER).await;
        assert_that!(cluster.counts(USER, "1").get(TabletState::Assigned)).is_equal_to(1);
        assert_that!(cluster.rpc.take_calls()).is_equal_to(vec![assign.clone()]);

        cluster.rpc.set_unresponsive(false);
        cluster.passes(USER, 2).await;
        assert_that!(cluster.counts(USER, "1").get(TabletState::Hosted)).is_equal_to(1);
    }

    #[tokio::test]
    async fn test_wait_for_log_recovery() {
        let cluster = TestCluster::new();
        cluster.create_table("1", &[]).await;
        cluster.servers.join("a:1");
        cluster
            .metadata
            .mutate_tablet("1", None, |record| {
                record.wal_refs = vec!["wal-1".to_string()];
                true
            })
            .await
            .unwrap();

        cluster.passes(USER, 2).await;
        assert_that!(cluster.rpc.take_calls()).is_empty();

        MetaLogRecovery::new(cluster.metadata.clone()).finish("wal-1").await.unwrap();
        cluster.pass(USER).await;
        assert_that!(cluster.rpc.take_calls().len()).is_equal_to(1);
    }

    #[tokio::test]
    async fn test_shutdown_server() {
        let cluster = TestCluster::new();
        cluster.create_table("1", &[b"m"]).await;
        let a = cluster.servers.join("a:1");
        let b = cluster.servers.join("b:1");
        cluster.host("1", Some(b"m"), &a).await;
        cluster.host("1", None, &a).await;

        cluster.master.shutdown_server(a.clone());
        cluster.pass(USER).await;
        let calls = cluster.rpc.take_calls();
        assert_that!(calls.len()).is_equal_to(2);
        assert_that!(calls.iter().all(|call| matches!(call, TabletCall::Unload { save: true, .. }))).is_true();

        cluster.passes(USER, 2).await;
        let currents: Vec<_> = cluster.placements("1").await.into_iter().map(|(_, current)| current).collect();
        assert_that!(currents).is_equal_to(vec![Some(b.clone()), Some(b.clone())]);
    }

    #[tokio::test]
    async fn test_migrate_tablet() {
        let cluster = TestCluster::new();
        cluster.create_table("1", &[b"m"]).await;
        let a = cluster.servers.join("a:1");
        let b = cluster.servers.join("b:1");
        cluster.host("1", Some(b"m"), &a).await;
        cluster.host("1", None, &a).await;

        let extent = Extent::new("1", None, Some(b"m"));
        cluster.master.request_migration(extent.clone(), b.clone());
        cluster.pass(USER).await;
        assert_that!(cluster.rpc.take_calls()).is_equal_to(vec![TabletCall::Unload {
            server: a.clone(),
            extent: extent.clone(),
            save: true,
        }]);

        cluster.pass(USER).await;
        assert_that!(cluster.rpc.take_calls())
            .is_equal_to(vec![TabletCall::Assign(Assignment::new(extent.clone(), b.clone()))]);

        cluster.pass(USER).await;
        assert_that!(cluster.master.env().migrations().is_empty()).is_true();
        assert_that!(cluster.placements("1").await).is_equal_to(vec![
            ("1(-,m]".to_string(), Some(b.clone())),
            ("1(m,-]".to_string(), Some(a.clone())),
        ]);
    }

    #[tokio::test]
    async fn test_migration_to_departed_server_cancelled() {
        let cluster = TestCluster::new();
        cluster.create_table("1", &[b"m"]).await;
        let a = cluster.servers.join("a:1");
        let b = cluster.servers.join("b:1");
        cluster.host("1", Some(b"m"), &a).await;
        cluster.host("1", None, &a).await;

        let extent = Extent::new("1", None, Some(b"m"));
        cluster.master.request_migration(extent.clone(), b.clone());
        cluster.servers.leave(&b);
        cluster.pass(USER).await;
        assert_that!(cluster.rpc.take_calls()).is_equal_to(vec![TabletCall::Unload {
            server: a.clone(),
            extent: extent.clone(),
            save: true,
        }]);

        cluster.pass(USER).await;
        assert_that!(cluster.master.env().migrations().is_empty()).is_true();
        assert_that!(cluster.rpc.take_calls())
            .is_equal_to(vec![TabletCall::Assign(Assignment::new(extent.clone(), a.clone()))]);

        cluster.passes(USER, 2).await;
        assert_that!(cluster.rpc.take_calls()).is_empty();
        assert_that!(cluster.counts(USER, "1").get(TabletState::Hosted)).is_equal_to(2);
    }

    #[tokio::test]
    async fn test_migration_to_dead_server_cancelled() {
        let cluster = TestCluster::new();
        cluster.create_table("1", &[]).await;
        let a = cluster.servers.join("a:1");
        let b = cluster.servers.join("b:1");
        cluster.host("1", None, &b).await;

        let extent = Extent::whole("1");
        cluster.master.request_migration(extent.clone(), b.clone());
        cluster.servers.leave(&b);
        cluster.pass(USER).await;
        assert_that!(cluster.master.env().migrations().is_empty()).is_true();
        assert_that!(cluster.counts(USER, "1").get(TabletState::AssignedToDeadServer)).is_equal_to(1);

        cluster.passes(USER, 2).await;
        assert_that!(cluster.placements("1").await).is_equal_to(vec![("1(-,-]".to_string(), Some(a.clone()))]);
    }

    #[tokio::test]
    async fn test_report_unloaded_tablets() {
        let config = MasterConfig::default().with_work_chunk_per_server(1);
        let cluster = TestCluster::with(Arc::new(MemoryMetaKv::new()), |env| env.with_config(config));
        cluster.create_table("1", &[b"c", b"f", b"m"]).await;
        let a = cluster.servers.join("a:1");
        for end_row in [Some(b"c"), Some(b"f"), Some(b"m")] {
            cluster.host("1", end_row.map(|row| row.as_slice()), &a).await;
        }
        cluster.host("1", None, &a).await;

        let mut events = cluster.master.env().events().subscribe();
        cluster.tables.set_state("1", TableState::Offline);
        cluster.pass(USER).await;
        assert_that!(cluster.rpc.take_calls().len()).is_equal_to(4);
        assert_that!(drain_events(&mut events)).contains(&"[user]: 4 tablets unloaded".to_string());

        cluster.pass(USER).await;
        assert_that!(drain_events(&mut events).iter().any(|event| event.contains("unloaded"))).is_false();
    }

    #[tokio::test]
    async fn test_forget_finished_log_recovery() {
        let cluster = TestCluster::new();
        cluster.create_table("1", &[]).await;
        cluster.servers.join("a:1");
        cluster
            .metadata
            .mutate_tablet("1", None, |record| {
                record.wal_refs = vec!["wal-1".to_string()];
                true
            })
            .await
            .unwrap();
        cluster.pass(USER).await;
        MetaLogRecovery::new(cluster.metadata.clone()).finish("wal-1").await.unwrap();
        cluster.passes(USER, 2).await;
        assert_that!(cluster.counts(USER, "1").get(TabletState::Hosted)).is_equal_to(1);
        let marker = keys::recovery_key("wal-1");
        assert_that!(cluster.metadata.kv().get(&marker).await.unwrap()).is_some();

        cluster
            .metadata
            .mutate_tablet("1", None, |record| {
                record.wal_refs.clear();
                true
            })
            .await
            .unwrap();
        cluster.pass(USER).await;
        assert_that!(cluster.metadata.kv().get(&marker).await.unwrap()).is_none();
    }

    #[test_log::test(tokio::test)]
    async fn test_stop_cluster_drains_user_tablets_first() {
        let cluster = TestCluster::new();
        cluster.create_table("!0", &[]).await;
        cluster.create_table("1", &[b"m"]).await;
        let a = cluster.servers.join("a:1");
        cluster.passes(USER, 2).await;
        cluster.passes(SYSTEM, 2).await;
        cluster.rpc.take_calls();
        assert_that!(cluster.counts(SYSTEM, "!0").get(TabletState::Hosted)).is_equal_to(1);

        cluster.master.stop_cluster();
        cluster.pass(SYSTEM).await;
        assert_that!(cluster.rpc.take_calls()).is_empty();

        cluster.pass(USER).await;
        assert_that!(cluster.rpc.take_calls().len()).is_equal_to(2);
        cluster.pass(USER).await;
        assert_that!(cluster.counts(USER, "1").get(TabletState::Unassigned)).is_equal_to(2);

        cluster.pass(SYSTEM).await;
        assert_that!(cluster.rpc.take_calls()).is_equal_to(vec![TabletCall::Unload {
            server: a.clone(),
            extent: Extent::whole("!0"),
            save: true,
        }]);
    }

    #[test_log::test(tokio::test)]
    async fn test_run_until_leadership_lost() {
        let config = MasterConfig::default().with_pass_interval(Duration::from_millis(20));
        let cluster = TestCluster::with(Arc::new(MemoryMetaKv::new()), |env| env.with_config(config));
        cluster.servers.join("a:1");
        let mut handle = cluster.master.start();

        cluster.create_table("1", &[b"m"]).await;
        let hosted = async {
            while cluster.counts(USER, "1").get(TabletState::Hosted) != 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(10), hosted).await.unwrap();

        cluster.leadership.resign();
        tokio::time::timeout(Duration::from_secs(10), handle.wait()).await.unwrap();
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_stop_handle() {
        let cluster = TestCluster::new();
        let handle = cluster.master.start();
        tokio::time::timeout(Duration::from_secs(10), handle.stop()).await.unwrap();
    }
}
