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

//! Tablet assignment coordinator for a horizontally partitioned sorted key-value store.
//!
//! The coordinator keeps the mapping from tablets to serving processes converging to a desired
//! state. One [master::TabletGroupWatcher] runs per tablet level and repeatedly scans tablet
//! locations, computes goals and dispatches assignments, unloads, chops and splits.

pub mod cluster;
pub mod keys;
pub mod master;
pub mod meta;
pub mod protos;
pub mod tablet;
pub mod utils;
