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

use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};

use anyhow::{ensure, Result};
use compact_str::CompactString;

use crate::keys;
use crate::protos::ExtentMessage;
use crate::utils::display_row;

pub type TableId = CompactString;

/// Contiguous row range `(prev_end_row, end_row]` of one table. `None` rows are unbounded.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Extent {
    table: TableId,
    end_row: Option<Vec<u8>>,
    prev_end_row: Option<Vec<u8>>,
}

/// Orders end rows with unbounded end after every bounded one.
pub fn cmp_end_rows(a: Option<&[u8]>, b: Option<&[u8]>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => a.cmp(b),
    }
}

/// Whether lower bound `prev` is strictly below upper bound `end`.
fn below(prev: Option<&[u8]>, end: Option<&[u8]>) -> bool {
    match (prev, end) {
        (Some(prev), Some(end)) => prev < end,
        _ => true,
    }
}

impl Extent {
    pub fn new(table: impl Into<TableId>, prev_end_row: Option<&[u8]>, end_row: Option<&[u8]>) -> Self {
        Self { table: table.into(), end_row: end_row.map(|r| r.to_vec()), prev_end_row: prev_end_row.map(|r| r.to_vec()) }
    }

    /// Extent covering whole table.
    pub fn whole(table: impl Into<TableId>) -> Self {
        Self::new(table, None, None)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn table_id(&self) -> &TableId {
        &self.table
    }

    pub fn end_row(&self) -> Option<&[u8]> {
        self.end_row.as_deref()
    }

    pub fn prev_end_row(&self) -> Option<&[u8]> {
        self.prev_end_row.as_deref()
    }

    pub fn is_valid(&self) -> bool {
        below(self.prev_end_row(), self.end_row())
    }

    pub fn contains_row(&self, row: &[u8]) -> bool {
        below(self.prev_end_row(), Some(row)) && cmp_end_rows(Some(row), self.end_row()) != Ordering::Greater
    }

    pub fn overlaps(&self, other: &Extent) -> bool {
        self.table == other.table
            && below(self.prev_end_row(), other.end_row())
            && below(other.prev_end_row(), self.end_row())
    }

    /// Splits this extent at `row` into `(prev, row]` and `(row, end]`.
    pub fn split_at(&self, row: &[u8]) -> Result<(Extent, Extent)> {
        ensure!(self.contains_row(row) && self.end_row() != Some(row), "row {} not inside {self}", display_row(Some(row)));
        let low = Extent::new(self.table.clone(), self.prev_end_row(), Some(row));
        let high = Extent::new(self.table.clone(), Some(row), self.end_row());
        Ok((low, high))
    }

    pub fn with_prev_end_row(&self, prev_end_row: Option<&[u8]>) -> Extent {
        Extent::new(self.table.clone(), prev_end_row, self.end_row())
    }

    pub fn metadata_key(&self) -> Vec<u8> {
        keys::tablet_key(&self.table, self.end_row())
    }

    pub fn to_message(&self) -> ExtentMessage {
        ExtentMessage {
            table: self.table.to_string(),
            end_row: self.end_row.clone(),
            prev_end_row: self.prev_end_row.clone(),
        }
    }

    pub fn from_message(message: &ExtentMessage) -> Result<Self> {
        keys::validate_table_id(&message.table)?;
        let extent = Extent::new(
            message.table.as_str(),
            message.prev_end_row.as_deref(),
            message.end_row.as_deref(),
        );
        ensure!(extent.is_valid(), "invalid extent {extent}");
        Ok(extent)
    }
}

impl Ord for Extent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.table
            .cmp(&other.table)
            .then_with(|| cmp_end_rows(self.end_row(), other.end_row()))
            .then_with(|| self.prev_end_row().cmp(&other.prev_end_row()))
    }
}

impl PartialOrd for Extent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for Extent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}({},{}]", self.table, display_row(self.prev_end_row()), display_row(self.end_row()))
    }
}
