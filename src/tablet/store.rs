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

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use thiserror::Error;
use tracing::{debug, warn};

use super::metadata::{MetadataTable, TabletRow};
use super::{Assignment, TabletLocationState};
use crate::cluster::ServerIdentity;
use crate::keys;
use crate::protos::LocationRecord;
use crate::utils::display_row;

#[derive(Debug, Error)]
pub enum TabletStoreError {
    #[error("bad location state of tablet row {row}: {message}")]
    BadLocationState { row: String, message: String },
    #[error("distributed store failure: {0:#}")]
    Distributed(anyhow::Error),
}

impl TabletStoreError {
    pub fn bad_location(row: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BadLocationState { row: row.into(), message: message.into() }
    }
}

impl From<anyhow::Error> for TabletStoreError {
    fn from(err: anyhow::Error) -> Self {
        Self::Distributed(err)
    }
}

/// Level of the tablet hierarchy watched by one reconciliation loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TabletLevel {
    System,
    User,
}

impl TabletLevel {
    pub fn name(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
        }
    }

    pub fn of_table(table: &str) -> Self {
        match keys::is_system_table(table) {
            true => Self::System,
            false => Self::User,
        }
    }

    pub fn range(self) -> (Vec<u8>, Vec<u8>) {
        match self {
            Self::System => keys::system_tablets_range(),
            Self::User => keys::user_tablets_range(),
        }
    }

    /// Level whose tablets must be drained before this level's on cluster stop.
    pub fn dependent(self) -> Option<TabletLevel> {
        match self {
            Self::System => Some(Self::User),
            Self::User => None,
        }
    }
}

/// Persisted tablet locations of one level.
///
/// Mutations are atomic per tablet row but not across a batch.
#[async_trait]
pub trait TabletStateStore: Send + Sync {
    fn name(&self) -> &str;

    /// Lazily scans tablets of this level. A malformed row yields [TabletStoreError::BadLocationState]
    /// and scanning continues.
    fn scan(&self) -> BoxStream<'static, Result<TabletLocationState, TabletStoreError>>;

    /// Overwrites future location of each assigned tablet.
    async fn set_future_locations(&self, assignments: &[Assignment]) -> Result<(), TabletStoreError>;

    /// Moves future location to current, recording it also as last location.
    async fn set_locations(&self, assignments: &[Assignment]) -> Result<(), TabletStoreError>;

    /// Clears current and future locations observed in given tablets.
    async fn unassign(&self, tablets: &[TabletLocationState]) -> Result<(), TabletStoreError>;
}

fn single_location(field: &str, locations: &[LocationRecord]) -> Result<Option<ServerIdentity>, String> {
    match locations {
        [] => Ok(None),
        [location] => Ok(Some(ServerIdentity::from_record(location))),
        _ => Err(format!("{} {field} locations", locations.len())),
    }
}

fn is_only(locations: &[LocationRecord], location: &LocationRecord) -> bool {
    locations.len() == 1 && locations[0] == *location
}

impl TryFrom<&TabletRow> for TabletLocationState {
    type Error = String;

    fn try_from(row: &TabletRow) -> Result<Self, String> {
        let current = single_location("current", &row.record.current)?;
        let future = single_location("future", &row.record.future)?;
        let last = single_location("last", &row.record.last)?;
        Ok(Self {
            extent: row.extent.clone(),
            future,
            current,
            last,
            wal_refs: row.record.wal_refs.clone(),
            chopped: row.record.chopped,
        })
    }
}

/// [TabletStateStore] over tablet rows in [MetadataTable].
pub struct MetadataStateStore {
    level: TabletLevel,
    metadata: MetadataTable,
    page: usize,
}

impl MetadataStateStore {
    pub fn new(level: TabletLevel, metadata: MetadataTable, page: usize) -> Self {
        Self { level, metadata, page }
    }

    pub fn level(&self) -> TabletLevel {
        self.level
    }

    fn decode(entry: crate::meta::KeyValue) -> Result<TabletLocationState, TabletStoreError> {
        let row = TabletRow::decode(&entry)
            .map_err(|err| TabletStoreError::bad_location(String::from_utf8_lossy(&entry.key), format!("{err:#}")))?;
        TabletLocationState::try_from(&row).map_err(|message| TabletStoreError::bad_location(row.extent.to_string(), message))
    }
}

#[async_trait]
impl TabletStateStore for MetadataStateStore {
    fn name(&self) -> &str {
        self.level.name()
    }

    fn scan(&self) -> BoxStream<'static, Result<TabletLocationState, TabletStoreError>> {
        self.metadata
            .scan_tablets(self.level.range(), self.page)
            .map(|entry| match entry {
                Err(err) => Err(TabletStoreError::Distributed(err)),
                Ok(entry) => Self::decode(entry),
            })
            .boxed()
    }

    async fn set_future_locations(&self, assignments: &[Assignment]) -> Result<(), TabletStoreError> {
        for assignment in assignments {
            let extent = &assignment.extent;
            let server = assignment.server.to_record();
            let row = self
                .metadata
                .mutate_tablet(extent.table(), extent.end_row(), |record| {
                    if record.prev_end_row.as_deref() != extent.prev_end_row() || !record.current.is_empty() {
                        return false;
                    }
                    if is_only(&record.future, &server) {
                        return false;
                    }
                    record.future = vec![server.clone()];
                    true
                })
                .await?;
            match row {
                None => warn!("skip assignment {assignment}: tablet row vanished"),
                Some(row) if !is_only(&row.record.future, &server) => {
                    warn!(
                        "skip assignment {assignment}: tablet row changed to prev row {} with {} current locations",
                        display_row(row.record.prev_end_row.as_deref()),
                        row.record.current.len()
                    )
                },
                Some(_) => debug!("persisted future location {assignment}"),
            }
        }
        Ok(())
    }

    async fn set_locations(&self, assignments: &[Assignment]) -> Result<(), TabletStoreError> {
        for assignment in assignments {
            let extent = &assignment.extent;
            let server = assignment.server.to_record();
            let row = self
                .metadata
                .mutate_tablet(extent.table(), extent.end_row(), |record| {
                    if record.prev_end_row.as_deref() != extent.prev_end_row() {
                        return false;
                    }
                    let hosted = is_only(&record.current, &server);
                    if !hosted && !is_only(&record.future, &server) {
                        return false;
                    }
                    if hosted && record.future.is_empty() && is_only(&record.last, &server) {
                        return false;
                    }
                    record.current = vec![server.clone()];
                    record.future.clear();
                    record.last = vec![server.clone()];
                    true
                })
                .await?;
            match row {
                Some(row) if is_only(&row.record.current, &server) => {},
                _ => warn!("fail to set location {assignment}: tablet not assigned to server"),
            }
        }
        Ok(())
    }

    async fn unassign(&self, tablets: &[TabletLocationState]) -> Result<(), TabletStoreError> {
        for tablet in tablets {
            let extent = &tablet.extent;
            let current = tablet.current.as_ref().map(|server| server.to_record());
            let future = tablet.future.as_ref().map(|server| server.to_record());
            self.metadata
                .mutate_tablet(extent.table(), extent.end_row(), |record| {
                    let mut changed = false;
                    if let Some(current) = &current {
                        if is_only(&record.current, current) {
                            record.current.clear();
                            changed = true;
                        }
                    }
                    if let Some(future) = &future {
                        if is_only(&record.future, future) {
                            record.future.clear();
                            changed = true;
                        }
                    }
                    changed
                })
                .await?;
        }
        Ok(())
    }
}
