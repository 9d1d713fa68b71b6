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

//! Typed access to coordinator metadata persisted in a [MetaKv].

use std::sync::Arc;

use anyhow::{bail, ensure, Context, Result};
use compact_str::format_compact;
use futures::stream::BoxStream;
use futures::TryStreamExt;
use prost::Message;
use tracing::{debug, info};
use uuid::Uuid;

use super::{Extent, TableId};
use crate::cluster::TableState;
use crate::keys;
use crate::meta::{self, Expect, KeyValue, MetaKv, Version};
use crate::protos::{DataFileRecord, DeleteCandidateRecord, MergeRecord, TableRecord, TabletRecord};

const SCAN_PAGE: usize = 1000;

/// Decoded tablet row.
#[derive(Clone, Debug, PartialEq)]
pub struct TabletRow {
    pub extent: Extent,
    pub record: TabletRecord,
    pub version: Version,
}

impl TabletRow {
    pub fn decode(entry: &KeyValue) -> Result<Self> {
        let (table, end_row) = keys::parse_tablet_key(&entry.key)?;
        let record = TabletRecord::decode(entry.value.as_slice())
            .with_context(|| format!("fail to decode tablet row {}", String::from_utf8_lossy(&entry.key)))?;
        let extent = Extent::new(table, record.prev_end_row.as_deref(), end_row);
        ensure!(extent.is_valid(), "tablet row {extent} has prev row not below end row");
        Ok(Self { extent, record, version: entry.version })
    }

    pub fn is_assigned(&self) -> bool {
        !self.record.current.is_empty() || !self.record.future.is_empty()
    }
}

/// Whether `outer` covers `inner`, both of same table.
fn covers(outer: &Extent, inner: &Extent) -> bool {
    let starts = match (outer.prev_end_row(), inner.prev_end_row()) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(outer), Some(inner)) => outer <= inner,
    };
    let ends = match (outer.end_row(), inner.end_row()) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(outer), Some(inner)) => inner <= outer,
    };
    starts && ends
}

fn directory_of(table: &str, name: &str) -> String {
    format!("/tables/{table}/{name}")
}

#[derive(Clone, Debug)]
pub struct MetadataTable {
    kv: Arc<dyn MetaKv>,
}

impl MetadataTable {
    pub fn new(kv: Arc<dyn MetaKv>) -> Self {
        Self { kv }
    }

    pub fn kv(&self) -> &Arc<dyn MetaKv> {
        &self.kv
    }

    pub fn scan_tablets(&self, range: (Vec<u8>, Vec<u8>), page: usize) -> BoxStream<'static, Result<KeyValue>> {
        meta::scan_stream(self.kv.clone(), range.0, range.1, page)
    }

    pub async fn get_tablet(&self, table: &str, end_row: Option<&[u8]>) -> Result<Option<TabletRow>> {
        let key = keys::tablet_key(table, end_row);
        match self.kv.get(&key).await? {
            None => Ok(None),
            Some(entry) => Ok(Some(TabletRow::decode(&entry)?)),
        }
    }

    /// Tablet rows of given table in row order.
    pub async fn table_tablets(&self, table: &str) -> Result<Vec<TabletRow>> {
        let entries: Vec<_> = self.scan_tablets(keys::table_tablets_range(table), SCAN_PAGE).try_collect().await?;
        entries.iter().map(TabletRow::decode).collect()
    }

    pub async fn insert_tablet(&self, extent: &Extent, mut record: TabletRecord) -> Result<bool> {
        record.prev_end_row = extent.prev_end_row().map(|r| r.to_vec());
        self.kv.put(&extent.metadata_key(), record.encode_to_vec(), Expect::Absent).await
    }

    /// Applies `f` to tablet row with compare-and-swap until it sticks.
    ///
    /// `f` returns false to leave row untouched. Returns the final row or `None` if row is absent.
    pub async fn mutate_tablet<F>(&self, table: &str, end_row: Option<&[u8]>, mut f: F) -> Result<Option<TabletRow>>
    where
        F: FnMut(&mut TabletRecord) -> bool + Send, {
        let key = keys::tablet_key(table, end_row);
        loop {
            let Some(entry) = self.kv.get(&key).await? else {
                return Ok(None);
            };
            let mut row = TabletRow::decode(&entry)?;
            if !f(&mut row.record) {
                return Ok(Some(row));
            }
            let value = row.record.encode_to_vec();
            if self.kv.put(&key, value, Expect::Version(row.version)).await? {
                row.extent = row.extent.with_prev_end_row(row.record.prev_end_row.as_deref());
                return Ok(Some(row));
            }
            debug!("retry conflicting write to tablet row {}", String::from_utf8_lossy(&key));
        }
    }

    pub async fn delete_tablet(&self, extent: &Extent) -> Result<()> {
        self.kv.delete(&extent.metadata_key(), Expect::Any).await?;
        Ok(())
    }

    /// Creates tablet rows of a new table split at given rows and brings it online.
    pub async fn create_table(&self, table: &str, splits: &[&[u8]]) -> Result<()> {
        keys::validate_table_id(table)?;
        ensure!(splits.windows(2).all(|w| w[0] < w[1]), "splits of table {table} are not sorted");
        let key = keys::table_key(table);
        if !self.kv.put(&key, TableState::New.to_record().encode_to_vec(), Expect::Absent).await? {
            bail!("table {table} already exists")
        }
        let mut prev_end_row = None;
        for i in 0..=splits.len() {
            let end_row = splits.get(i).copied();
            let extent = Extent::new(table, prev_end_row, end_row);
            let name = if end_row.is_none() { "default_tablet".to_string() } else { format!("t-{i:04}") };
            let record = TabletRecord { directory: directory_of(table, &name), ..Default::default() };
            self.insert_tablet(&extent, record).await?;
            prev_end_row = end_row;
        }
        self.set_table_state(table, TableState::Online).await?;
        info!("created table {table} with {} tablets", splits.len() + 1);
        Ok(())
    }

    pub async fn set_table_state(&self, table: &str, state: TableState) -> Result<()> {
        self.kv.put(&keys::table_key(table), state.to_record().encode_to_vec(), Expect::Any).await?;
        Ok(())
    }

    pub async fn table_state(&self, table: &str) -> Result<Option<TableState>> {
        let Some(entry) = self.kv.get(&keys::table_key(table)).await? else {
            return Ok(None);
        };
        let record = TableRecord::decode(entry.value.as_slice())?;
        Ok(Some(TableState::from_i32(record.state)?))
    }

    pub async fn add_delete_candidates(&self, table: &str, paths: impl IntoIterator<Item = String>) -> Result<()> {
        let value = DeleteCandidateRecord { table: table.to_string() }.encode_to_vec();
        for path in paths {
            self.kv.put(&keys::delete_key(&path), value.clone(), Expect::Any).await?;
        }
        Ok(())
    }

    /// Paths pending reclamation with their owning tables.
    pub async fn delete_candidates(&self) -> Result<Vec<(String, TableId)>> {
        let start = keys::DELETES_PREFIX.to_vec();
        let end = keys::prefix_end(keys::DELETES_PREFIX);
        let entries: Vec<_> = meta::scan_stream(self.kv.clone(), start, end, SCAN_PAGE).try_collect().await?;
        entries
            .into_iter()
            .map(|entry| {
                let path = String::from_utf8(entry.key[keys::DELETES_PREFIX.len()..].to_vec())?;
                let record = DeleteCandidateRecord::decode(entry.value.as_slice())?;
                Ok((path, TableId::from(record.table)))
            })
            .collect()
    }

    pub async fn merge_record(&self, table: &str) -> Result<Option<(MergeRecord, Version)>> {
        let Some(entry) = self.kv.get(&keys::merge_key(table)).await? else {
            return Ok(None);
        };
        Ok(Some((MergeRecord::decode(entry.value.as_slice())?, entry.version)))
    }

    pub async fn put_merge_record(&self, table: &str, record: &MergeRecord, expect: Expect) -> Result<bool> {
        self.kv.put(&keys::merge_key(table), record.encode_to_vec(), expect).await
    }

    pub async fn delete_merge_record(&self, table: &str, expect: Expect) -> Result<bool> {
        self.kv.delete(&keys::merge_key(table), expect).await
    }

    /// Folds every tablet overlapping `range` into the highest of them.
    ///
    /// Steps are ordered so that re-running after a crash at any point converges to the same rows.
    pub async fn merge_range(&self, range: &Extent, file_batch: usize) -> Result<()> {
        let table = range.table();
        let covered: Vec<_> =
            self.table_tablets(table).await?.into_iter().filter(|row| row.extent.overlaps(range)).collect();
        let Some((high, consumed)) = covered.split_last() else {
            bail!("no tablets in merge range {range}")
        };
        if let Some(row) = covered.iter().find(|row| row.is_assigned()) {
            bail!("can not merge {range}: tablet {} is assigned", row.extent)
        }
        let end_row = high.extent.end_row();
        if consumed.is_empty() {
            self.mutate_tablet(table, end_row, |record| std::mem::replace(&mut record.chopped, false)).await?;
            return Ok(());
        }
        let first_prev = covered.iter().map(|row| row.extent.prev_end_row()).min().flatten().map(|r| r.to_vec());
        let files: Vec<DataFileRecord> = consumed.iter().flat_map(|row| row.record.files.iter().cloned()).collect();
        let time = covered.iter().map(|row| row.record.time).max().unwrap_or_default();

        for chunk in files.chunks(file_batch.max(1)) {
            self.mutate_tablet(table, end_row, |record| {
                let mut changed = false;
                for file in chunk {
                    if !record.files.iter().any(|f| f.path == file.path) {
                        record.files.push(file.clone());
                        changed = true;
                    }
                }
                changed
            })
            .await?;
        }
        self.mutate_tablet(table, end_row, |record| {
            if record.prev_end_row == first_prev && record.time >= time {
                return false;
            }
            record.prev_end_row = first_prev.clone();
            record.time = record.time.max(time);
            true
        })
        .await?;

        self.add_delete_candidates(table, consumed.iter().map(|row| row.record.directory.clone()).collect::<Vec<_>>()).await?;
        for row in consumed {
            self.delete_tablet(&row.extent).await?;
        }
        self.mutate_tablet(table, end_row, |record| std::mem::replace(&mut record.chopped, false)).await?;
        info!("merged {} tablets into {}", consumed.len(), high.extent.with_prev_end_row(first_prev.as_deref()));
        Ok(())
    }

    /// Drops tablets inside `range`, which must sit on tablet boundaries, and stretches the tablet
    /// following it down to the range start.
    ///
    /// Files and directories of dropped tablets become delete candidates. If the range reaches the
    /// end of table, the last tablet is recreated fresh in place.
    pub async fn delete_range(&self, range: &Extent) -> Result<()> {
        let table = range.table();
        let rows = self.table_tablets(table).await?;
        let terminal = rows.last().filter(|row| range.end_row().is_none() && row.extent.end_row().is_none());
        let terminal = terminal.filter(|row| {
            row.extent.prev_end_row() != range.prev_end_row()
                || !row.record.files.is_empty()
                || !row.record.wal_refs.is_empty()
        });
        let consumed: Vec<_> = rows
            .iter()
            .filter(|row| row.extent.end_row().is_some() && covers(range, &row.extent))
            .chain(terminal)
            .collect();
        if let Some(row) = consumed.iter().find(|row| row.is_assigned()) {
            bail!("can not delete {range}: tablet {} is assigned", row.extent)
        }

        let mut paths = vec![];
        for row in consumed.iter() {
            paths.extend(row.record.files.iter().map(|f| f.path.clone()));
            paths.push(row.record.directory.clone());
        }
        self.add_delete_candidates(table, paths).await?;

        for row in consumed.iter().filter(|row| row.extent.end_row().is_some()) {
            self.delete_tablet(&row.extent).await?;
        }

        let prev_end_row = range.prev_end_row().map(|r| r.to_vec());
        match range.end_row() {
            Some(end_row) => {
                let following = rows
                    .iter()
                    .find(|row| row.extent.end_row().map(|r| r > end_row).unwrap_or(true))
                    .with_context(|| format!("no tablet follows deleting range {range}"))?;
                self.mutate_tablet(table, following.extent.end_row(), |record| {
                    if record.prev_end_row == prev_end_row && !record.chopped {
                        return false;
                    }
                    record.prev_end_row = prev_end_row.clone();
                    record.chopped = false;
                    true
                })
                .await?;
            },
            None if terminal.is_some() => {
                self.mutate_tablet(table, None, |record| {
                    let directory = directory_of(table, &format_compact!("t-{}", Uuid::new_v4().simple()));
                    *record = TabletRecord {
                        prev_end_row: prev_end_row.clone(),
                        directory,
                        time: record.time,
                        last: std::mem::take(&mut record.last),
                        ..Default::default()
                    };
                    true
                })
                .await?;
            },
            None => {},
        }
        info!("deleted {} tablets in range {range}", consumed.len());
        Ok(())
    }
}
