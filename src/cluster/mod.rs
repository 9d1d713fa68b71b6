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

//! Collaborators of the coordinator living outside this process: live tablet servers, table
//! lifecycle states and coordinator leadership.

pub(crate) mod etcd;
mod lock;
mod servers;
mod tables;

pub use self::etcd::{EtcdHelper, EtcdLease, EtcdUri};
pub use self::lock::{EtcdMasterLock, Leadership, LocalLeadership};
pub use self::servers::{
    EtcdServerRegistry,
    LiveServers,
    MemoryServerRegistry,
    ServerIdentity,
    ServerRegistry,
    ServerSession,
    ServerStatus,
};
pub use self::tables::{EtcdTableDirectory, MemoryTableDirectory, TableDirectory, TableState};
