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

//! Tablet locations: extents, observed states and their persisted store.

mod counts;
mod extent;
mod location;
mod metadata;
mod store;

pub use self::counts::{LevelCounts, TableCounts, TableCountsMap, TableStats};
pub use self::extent::{cmp_end_rows, Extent, TableId};
pub use self::location::{classify, Assignment, TabletLocationState, TabletState};
pub use self::metadata::{MetadataTable, TabletRow};
pub use self::store::{MetadataStateStore, TabletLevel, TabletStateStore, TabletStoreError};
