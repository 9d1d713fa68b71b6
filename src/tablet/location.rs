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

use super::Extent;
use crate::cluster::{LiveServers, ServerIdentity};

/// Observed state of a tablet derived from its persisted location and live servers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TabletState {
    Unassigned,
    Assigned,
    AssignedToDeadServer,
    Hosted,
}

impl TabletState {
    pub const ALL: [TabletState; 4] =
        [TabletState::Unassigned, TabletState::Assigned, TabletState::AssignedToDeadServer, TabletState::Hosted];

    pub fn index(self) -> usize {
        self as usize
    }
}

impl Display for TabletState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unassigned => "UNASSIGNED",
            Self::Assigned => "ASSIGNED",
            Self::AssignedToDeadServer => "ASSIGNED_TO_DEAD_SERVER",
            Self::Hosted => "HOSTED",
        };
        f.write_str(name)
    }
}

/// Placement of an extent on a server.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Assignment {
    pub extent: Extent,
    pub server: ServerIdentity,
}

impl Assignment {
    pub fn new(extent: Extent, server: ServerIdentity) -> Self {
        Self { extent, server }
    }
}

impl Display for Assignment {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.extent, self.server)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TabletLocationState {
    pub extent: Extent,
    pub future: Option<ServerIdentity>,
    pub current: Option<ServerIdentity>,
    pub last: Option<ServerIdentity>,
    pub wal_refs: Vec<String>,
    pub chopped: bool,
}

impl TabletLocationState {
    pub fn new(extent: Extent) -> Self {
        Self { extent, future: None, current: None, last: None, wal_refs: vec![], chopped: false }
    }

    /// Most relevant server of this tablet: current, then future, then last.
    pub fn server(&self) -> Option<&ServerIdentity> {
        self.current.as_ref().or(self.future.as_ref()).or(self.last.as_ref())
    }

    pub fn state(&self, live: &LiveServers) -> TabletState {
        classify(self, live)
    }
}

impl Display for TabletLocationState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.extent)?;
        if let Some(current) = &self.current {
            write!(f, "@{current}")?;
        }
        if let Some(future) = &self.future {
            write!(f, "->{future}")?;
        }
        Ok(())
    }
}

pub fn classify(location: &TabletLocationState, live: &LiveServers) -> TabletState {
    match (&location.current, &location.future) {
        (Some(current), _) if live.contains_key(current) => TabletState::Hosted,
        (Some(_), _) => TabletState::AssignedToDeadServer,
        (None, Some(future)) if live.contains_key(future) => TabletState::Assigned,
        (None, Some(_)) => TabletState::AssignedToDeadServer,
        (None, None) => TabletState::Unassigned,
    }
}
