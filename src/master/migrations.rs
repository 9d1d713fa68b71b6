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

use std::sync::Mutex;

use hashbrown::hash_map::HashMap;

use crate::cluster::ServerIdentity;
use crate::tablet::Extent;

/// Operator requested relocations of tablets.
#[derive(Debug, Default)]
pub struct Migrations {
    pending: Mutex<HashMap<Extent, ServerIdentity>>,
}

impl Migrations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self, extent: Extent, destination: ServerIdentity) {
        self.pending.lock().unwrap().insert(extent, destination);
    }

    pub fn get(&self, extent: &Extent) -> Option<ServerIdentity> {
        self.pending.lock().unwrap().get(extent).cloned()
    }

    /// Removes migration of `extent` if it targets `server`.
    pub fn complete(&self, extent: &Extent, server: &ServerIdentity) -> bool {
        let mut pending = self.pending.lock().unwrap();
        match pending.get(extent) {
            Some(destination) if destination == server => pending.remove(extent).is_some(),
            _ => false,
        }
    }

    pub fn cancel(&self, extent: &Extent) {
        self.pending.lock().unwrap().remove(extent);
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
