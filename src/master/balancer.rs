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

use std::collections::BTreeMap;

use hashbrown::hash_map::HashMap;
use rand::seq::SliceRandom;

use crate::cluster::{LiveServers, ServerIdentity};
use crate::tablet::{Assignment, Extent};

/// Unassigned tablets with their last known servers.
pub type UnassignedTablets = BTreeMap<Extent, Option<ServerIdentity>>;

/// Placement policy for unassigned tablets.
pub trait TabletBalancer: Send + Sync {
    /// Proposes destinations among `servers` for some or all of `unassigned`.
    fn assign(&self, servers: &LiveServers, unassigned: &UnassignedTablets) -> Vec<Assignment>;
}

/// Places a tablet on its last server if eligible, otherwise on the least loaded server.
#[derive(Debug, Default)]
pub struct DefaultTabletBalancer {}

impl DefaultTabletBalancer {
    pub fn new() -> Self {
        Self {}
    }
}

impl TabletBalancer for DefaultTabletBalancer {
    fn assign(&self, servers: &LiveServers, unassigned: &UnassignedTablets) -> Vec<Assignment> {
        if servers.is_empty() {
            return vec![];
        }
        let mut loads: HashMap<&ServerIdentity, u64> =
            servers.iter().map(|(server, status)| (server, status.online_tablets())).collect();
        let mut rng = rand::thread_rng();
        let mut assignments = Vec::with_capacity(unassigned.len());
        for (extent, last) in unassigned.iter() {
            let server = match last.as_ref().and_then(|last| servers.get_key_value(last)) {
                Some((server, _)) => server,
                None => {
                    let Some(least) = loads.values().min().copied() else {
                        break;
                    };
                    let candidates: Vec<_> =
                        servers.keys().filter(|server| loads.get(server).copied() == Some(least)).collect();
                    let Some(server) = candidates.choose(&mut rng) else {
                        break;
                    };
                    *server
                },
            };
            *loads.entry(server).or_default() += 1;
            assignments.push(Assignment::new(extent.clone(), server.clone()));
        }
        assignments
    }
}
