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

use std::collections::BTreeSet;
use std::fmt::{self, Display, Formatter};

use super::merge::MergeInfo;
use crate::cluster::{ServerIdentity, TableState};
use crate::tablet::{TabletLocationState, TabletState};

/// Desired state of a tablet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TabletGoalState {
    Hosted,
    Unassigned,
    Deleted,
}

impl Display for TabletGoalState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Hosted => "HOSTED",
            Self::Unassigned => "UNASSIGNED",
            Self::Deleted => "DELETED",
        };
        f.write_str(name)
    }
}

/// Everything the goal of one tablet depends on.
#[derive(Clone, Copy, Debug)]
pub struct GoalFacts<'a> {
    pub tablet: &'a TabletLocationState,
    pub state: TabletState,
    /// `None` for unknown table.
    pub table: Option<TableState>,
    pub merge: Option<&'a MergeInfo>,
    pub migration: Option<&'a ServerIdentity>,
    pub shutting_down: &'a BTreeSet<ServerIdentity>,
    pub cluster_stopping: bool,
    /// Cluster stop requested or every live server is shutting down.
    pub draining: bool,
    /// Dependent level still has assigned or hosted tablets.
    pub dependent_busy: bool,
}

fn unordered_goal(facts: &GoalFacts<'_>) -> TabletGoalState {
    match facts.table {
        None | Some(TableState::Deleting) => return TabletGoalState::Deleted,
        Some(TableState::New) | Some(TableState::Offline) => return TabletGoalState::Unassigned,
        Some(TableState::Online) => {},
    }
    if facts.cluster_stopping {
        return TabletGoalState::Unassigned;
    }
    let current = facts.tablet.current.as_ref();
    if current.map(|server| facts.shutting_down.contains(server)).unwrap_or(false) {
        return TabletGoalState::Unassigned;
    }
    if let Some(goal) = facts.merge.and_then(|merge| merge.goal(facts.tablet, facts.state)) {
        return goal;
    }
    match (facts.migration, current) {
        (Some(destination), Some(current)) if destination != current => TabletGoalState::Unassigned,
        _ => TabletGoalState::Hosted,
    }
}

/// Computes goal state of a tablet.
///
/// An in-flight assignment is always completed. While draining, a hosted tablet stays hosted until
/// the dependent level has nothing assigned or hosted.
pub fn goal_state(facts: &GoalFacts<'_>) -> TabletGoalState {
    if facts.state == TabletState::Assigned {
        return TabletGoalState::Hosted;
    }
    let goal = unordered_goal(facts);
    if goal == TabletGoalState::Unassigned && facts.state == TabletState::Hosted && facts.draining && facts.dependent_busy
    {
        return TabletGoalState::Hosted;
    }
    goal
}
