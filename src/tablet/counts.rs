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

use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

use arc_swap::ArcSwap;
use hashbrown::hash_map::HashMap;

use super::{TableId, TabletState};

/// Number of tablets per [TabletState] of one table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TableCounts {
    counts: [usize; 4],
}

impl TableCounts {
    pub fn get(&self, state: TabletState) -> usize {
        self.counts[state.index()]
    }

    pub fn increment(&mut self, state: TabletState) {
        self.counts[state.index()] += 1;
    }

    pub fn assigned_or_hosted(&self) -> usize {
        self.get(TabletState::Assigned) + self.get(TabletState::Hosted)
    }

    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }

    /// Sums counts of all tables.
    pub fn aggregate(counts: &TableCountsMap) -> TableCounts {
        let mut total = TableCounts::default();
        for table in counts.values() {
            total.add(table);
        }
        total
    }

    fn add(&mut self, other: &TableCounts) {
        for (count, other) in self.counts.iter_mut().zip(other.counts.iter()) {
            *count += other;
        }
    }
}

impl Display for TableCounts {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for (i, state) in TabletState::ALL.iter().enumerate() {
            if i != 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}={}", state, self.get(*state))?;
        }
        Ok(())
    }
}

pub type TableCountsMap = HashMap<TableId, TableCounts>;

/// Read only view of counts published by one level.
pub trait LevelCounts: Send + Sync {
    fn table_counts(&self) -> Arc<TableCountsMap>;

    fn aggregate_counts(&self) -> TableCounts {
        TableCounts::aggregate(&self.table_counts())
    }
}

/// Per table counts of the latest complete pass.
///
/// Counts are accumulated privately during a pass and published as an immutable snapshot.
#[derive(Debug)]
pub struct TableStats {
    latest: ArcSwap<TableCountsMap>,
}

impl Default for TableStats {
    fn default() -> Self {
        Self::new()
    }
}

impl TableStats {
    pub fn new() -> Self {
        Self { latest: ArcSwap::from_pointee(TableCountsMap::new()) }
    }

    /// Publishes counts of a finished pass and returns those of the previous one.
    pub fn publish(&self, counts: TableCountsMap) -> Arc<TableCountsMap> {
        self.latest.swap(Arc::new(counts))
    }
}

impl LevelCounts for TableStats {
    fn table_counts(&self) -> Arc<TableCountsMap> {
        self.latest.load_full()
    }
}

#[cfg(test)]
mod tests {
    use assertor::*;

    use super::*;

    #[test]
    fn test_table_stats_publish() {
        let stats = TableStats::new();
        let mut counts = TableCountsMap::new();
        counts.entry(TableId::new("1")).or_default().increment(TabletState::Hosted);
        counts.entry(TableId::new("1")).or_default().increment(TabletState::Assigned);
        counts.entry(TableId::new("2")).or_default().increment(TabletState::Unassigned);

        let snapshot = stats.table_counts();
        let previous = stats.publish(counts);
        assert_that!(previous.is_empty()).is_true();
        assert_that!(snapshot.is_empty()).is_true();

        let total = stats.aggregate_counts();
        assert_that!(total.assigned_or_hosted()).is_equal_to(2);
        assert_that!(total.total()).is_equal_to(3);
        assert_that!(total.to_string())
            .is_equal_to("UNASSIGNED=1 ASSIGNED=1 ASSIGNED_TO_DEAD_SERVER=0 HOSTED=1".to_string());
    }
}
