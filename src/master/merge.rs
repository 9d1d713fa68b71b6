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

//! Multi-pass progression of merge and delete-range operations.

use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};

use anyhow::{bail, ensure, Result};
use tracing::{debug, info};

use super::goal::TabletGoalState;
use crate::meta::Expect;
use crate::protos::MergeRecord;
use crate::tablet::{cmp_end_rows, Extent, MetadataTable, TabletLocationState, TabletState};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MergeKind {
    Merge,
    DeleteRange,
}

impl MergeKind {
    fn from_i32(value: i32) -> Result<Self> {
        match value {
            0 => Ok(Self::Merge),
            1 => Ok(Self::DeleteRange),
            _ => bail!("unknown merge kind {value}"),
        }
    }

    fn as_i32(self) -> i32 {
        match self {
            Self::Merge => 0,
            Self::DeleteRange => 1,
        }
    }
}

/// Forward only progression of a merge. `Complete` collapses to `None` at once.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MergeState {
    None,
    WaitingForOffline,
    Splitting,
    WaitingForChopped,
    Merging,
    Complete,
}

impl MergeState {
    fn from_i32(value: i32) -> Result<Self> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::WaitingForOffline),
            2 => Ok(Self::Splitting),
            3 => Ok(Self::WaitingForChopped),
            4 => Ok(Self::Merging),
            5 => Ok(Self::Complete),
            _ => bail!("unknown merge state {value}"),
        }
    }

    fn as_i32(self) -> i32 {
        self as i32
    }
}

impl Display for MergeState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "NONE",
            Self::WaitingForOffline => "WAITING_FOR_OFFLINE",
            Self::Splitting => "SPLITTING",
            Self::WaitingForChopped => "WAITING_FOR_CHOPPED",
            Self::Merging => "MERGING",
            Self::Complete => "COMPLETE",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeInfo {
    pub range: Extent,
    pub kind: MergeKind,
    pub state: MergeState,
}

impl MergeInfo {
    /// Merges start waiting for quiescence while delete-ranges start splitting.
    pub fn new(range: Extent, kind: MergeKind) -> Self {
        let state = match kind {
            MergeKind::Merge => MergeState::WaitingForOffline,
            MergeKind::DeleteRange => MergeState::Splitting,
        };
        Self { range, kind, state }
    }

    pub fn is_delete(&self) -> bool {
        self.kind == MergeKind::DeleteRange
    }

    /// Tablets chopped before rewrite. For a delete-range this includes the tablet right after the
    /// range, which is stretched over the deleted rows.
    pub fn needs_to_be_chopped(&self, extent: &Extent) -> bool {
        if self.is_delete()
            && extent.table() == self.range.table()
            && extent.prev_end_row().is_some()
            && extent.prev_end_row() == self.range.end_row()
        {
            return true;
        }
        self.range.overlaps(extent)
    }

    pub fn overlaps(&self, extent: &Extent) -> bool {
        self.range.overlaps(extent) || self.needs_to_be_chopped(extent)
    }

    /// Goal imposed by this operation on a covered tablet.
    pub fn goal(&self, tablet: &TabletLocationState, state: TabletState) -> Option<TabletGoalState> {
        if !self.overlaps(&tablet.extent) {
            return None;
        }
        match self.state {
            MergeState::None | MergeState::Complete => None,
            MergeState::WaitingForOffline | MergeState::Splitting => Some(TabletGoalState::Hosted),
            MergeState::WaitingForChopped => {
                let quiet = state == TabletState::Hosted || tablet.wal_refs.is_empty();
                match tablet.chopped && quiet {
                    true => Some(TabletGoalState::Unassigned),
                    false => Some(TabletGoalState::Hosted),
                }
            },
            MergeState::Merging => Some(TabletGoalState::Unassigned),
        }
    }

    pub fn to_record(&self) -> MergeRecord {
        MergeRecord {
            prev_end_row: self.range.prev_end_row().map(|r| r.to_vec()),
            end_row: self.range.end_row().map(|r| r.to_vec()),
            kind: self.kind.as_i32(),
            state: self.state.as_i32(),
        }
    }

    pub fn from_record(table: &str, record: &MergeRecord) -> Result<Self> {
        let range = Extent::new(table, record.prev_end_row.as_deref(), record.end_row.as_deref());
        ensure!(range.is_valid(), "invalid merge range {range}");
        Ok(Self { range, kind: MergeKind::from_i32(record.kind)?, state: MergeState::from_i32(record.state)? })
    }
}

impl Display for MergeInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            MergeKind::Merge => "merge",
            MergeKind::DeleteRange => "delete-range",
        };
        write!(f, "{kind} {} in {}", self.range, self.state)
    }
}

/// Facts of one pass about tablets of a table under merge.
#[derive(Clone, Debug)]
pub struct MergeStats {
    info: MergeInfo,
    total: usize,
    hosted: usize,
    hosted_without_wals: usize,
    unassigned: usize,
    chopped: usize,
    needs_to_be_chopped: usize,
    lower_split: bool,
    upper_split: bool,
    covered: Vec<Extent>,
}

impl MergeStats {
    pub fn new(info: MergeInfo) -> Self {
        let lower_split = info.range.prev_end_row().is_none();
        let upper_split = info.range.end_row().is_none();
        Self {
            info,
            total: 0,
            hosted: 0,
            hosted_without_wals: 0,
            unassigned: 0,
            chopped: 0,
            needs_to_be_chopped: 0,
            lower_split,
            upper_split,
            covered: vec![],
        }
    }

    pub fn info(&self) -> &MergeInfo {
        &self.info
    }

    /// Accounts a tablet of the merging table. Tablets must come in row order.
    pub fn update(&mut self, tablet: &TabletLocationState, state: TabletState) {
        if self.info.state == MergeState::None {
            return;
        }
        let extent = &tablet.extent;
        let range = &self.info.range;
        if range.end_row().is_some() && range.end_row() == extent.prev_end_row() {
            self.upper_split = true;
        }
        if range.prev_end_row().is_some() && range.prev_end_row() == extent.end_row() {
            self.lower_split = true;
        }
        if !self.info.overlaps(extent) {
            return;
        }
        if self.info.needs_to_be_chopped(extent) {
            self.needs_to_be_chopped += 1;
            if tablet.chopped && (state == TabletState::Hosted || tablet.wal_refs.is_empty()) {
                self.chopped += 1;
            }
        }
        self.total += 1;
        match state {
            TabletState::Hosted => {
                self.hosted += 1;
                if tablet.wal_refs.is_empty() {
                    self.hosted_without_wals += 1;
                }
            },
            TabletState::Unassigned => self.unassigned += 1,
            _ => {},
        }
        self.covered.push(extent.clone());
    }

    /// Whether metadata of covered tablets can be rewritten now.
    pub fn ready_to_rewrite(&self) -> bool {
        self.total > 0 && self.unassigned == self.total
    }

    /// Whether observed covered tablets chain without gap over the whole range.
    fn is_contiguous(&self) -> bool {
        let (Some(first), Some(last)) = (self.covered.first(), self.covered.last()) else {
            return false;
        };
        let range = &self.info.range;
        if first.prev_end_row() > range.prev_end_row() {
            return false;
        }
        if cmp_end_rows(last.end_row(), range.end_row()) == Ordering::Less {
            return false;
        }
        self.covered.windows(2).all(|pair| pair[0].end_row().is_some() && pair[0].end_row() == pair[1].prev_end_row())
    }
}

/// Computes next state of a merge from facts of the current pass.
///
/// `Merging` is returned as long as the rewrite has not been done; callers check
/// [MergeStats::ready_to_rewrite] before rewriting.
pub fn next_merge_state(stats: &MergeStats) -> MergeState {
    let info = &stats.info;
    let mut state = info.state;
    if state == MergeState::Complete {
        return MergeState::None;
    }
    if state == MergeState::WaitingForOffline {
        if !info.is_delete() && stats.total <= 1 {
            info!("merge range {} is already contained in a single tablet", info.range);
            return MergeState::Complete;
        }
        if stats.total > 0 && stats.hosted_without_wals == stats.total {
            state = MergeState::Splitting;
        } else {
            debug!("waiting for {} hosted tablets without logs to be {} in {}", stats.hosted_without_wals, stats.total, info);
        }
    }
    if state == MergeState::Splitting {
        if !info.is_delete() && stats.total <= 1 {
            info!("merge range {} is already contained in a single tablet", info.range);
            return MergeState::Complete;
        }
        if stats.total == 0 || stats.hosted != stats.total {
            debug!("waiting for {} hosted tablets to be {} in {}", stats.hosted, stats.total, info);
        } else if info.is_delete() && !stats.lower_split {
            debug!("waiting for lower split of {info}");
        } else if info.is_delete() && !stats.upper_split {
            debug!("waiting for upper split of {info}");
        } else {
            state = MergeState::WaitingForChopped;
        }
    }
    if state == MergeState::WaitingForChopped {
        if stats.chopped != stats.needs_to_be_chopped {
            debug!("waiting for {} chopped tablets to be {} in {}", stats.chopped, stats.needs_to_be_chopped, info);
        } else if !stats.ready_to_rewrite() {
            debug!("waiting for {} unassigned tablets to be {} in {}", stats.unassigned, stats.total, info);
        } else if !stats.is_contiguous() {
            info!("tablets of {info} are not contiguous, wait for metadata to settle");
        } else {
            state = MergeState::Merging;
        }
    }
    state
}

impl MetadataTable {
    pub async fn merge_info(&self, table: &str) -> Result<Option<MergeInfo>> {
        let Some((record, _version)) = self.merge_record(table).await? else {
            return Ok(None);
        };
        Ok(Some(MergeInfo::from_record(table, &record)?))
    }

    /// Persists a new merge or delete-range request. At most one operation per table.
    pub async fn request_merge(&self, range: Extent, kind: MergeKind) -> Result<MergeInfo> {
        ensure!(range.is_valid(), "invalid merge range {range}");
        if kind == MergeKind::DeleteRange {
            ensure!(range.prev_end_row().is_some() || range.end_row().is_some(), "delete-range {range} covers whole table");
        }
        let info = MergeInfo::new(range, kind);
        if !self.put_merge_record(info.range.table(), &info.to_record(), Expect::Absent).await? {
            bail!("table {} has merge in progress", info.range.table())
        }
        Ok(info)
    }

    /// Persists state of an in-progress operation, dropping it on `None`.
    pub async fn set_merge_state(&self, info: &MergeInfo, state: MergeState) -> Result<()> {
        let table = info.range.table();
        let Some((record, version)) = self.merge_record(table).await? else {
            bail!("merge of table {table} vanished")
        };
        let existing = MergeInfo::from_record(table, &record)?;
        ensure!(existing.range == info.range && existing.kind == info.kind, "merge of table {table} changed to {existing}");
        ensure!(state >= existing.state || state == MergeState::None, "merge {existing} can not go back to {state}");
        let done = match state {
            MergeState::None | MergeState::Complete => self.delete_merge_record(table, Expect::Version(version)).await?,
            _ => {
                let updated = MergeInfo { state, ..existing };
                self.put_merge_record(table, &updated.to_record(), Expect::Version(version)).await?
            },
        };
        ensure!(done, "merge of table {table} changed concurrently");
        Ok(())
    }
}
