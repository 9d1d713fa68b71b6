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

//! Persisted metadata records and tablet server rpc messages.

/// Location of a tablet on a server incarnation.
#[derive(Clone, PartialEq, Eq, Hash, ::prost::Message)]
pub struct LocationRecord {
    #[prost(string, tag = "1")]
    pub address: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub session: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DataFileRecord {
    #[prost(string, tag = "1")]
    pub path: ::prost::alloc::string::String,
    #[prost(uint64, tag = "2")]
    pub size: u64,
    #[prost(uint64, tag = "3")]
    pub entries: u64,
}

/// Persisted metadata of one tablet, keyed by table and end row.
///
/// Location fields are repeated so that malformed rows with multiple locations are representable
/// and detectable.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TabletRecord {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub prev_end_row: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    #[prost(message, repeated, tag = "2")]
    pub future: ::prost::alloc::vec::Vec<LocationRecord>,
    #[prost(message, repeated, tag = "3")]
    pub current: ::prost::alloc::vec::Vec<LocationRecord>,
    #[prost(message, repeated, tag = "4")]
    pub last: ::prost::alloc::vec::Vec<LocationRecord>,
    #[prost(string, repeated, tag = "5")]
    pub wal_refs: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(bool, tag = "6")]
    pub chopped: bool,
    #[prost(string, tag = "7")]
    pub directory: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "8")]
    pub files: ::prost::alloc::vec::Vec<DataFileRecord>,
    #[prost(uint64, tag = "9")]
    pub time: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MergeRecord {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub prev_end_row: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub end_row: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    #[prost(int32, tag = "3")]
    pub kind: i32,
    #[prost(int32, tag = "4")]
    pub state: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TableRecord {
    #[prost(int32, tag = "1")]
    pub state: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TableStatusRecord {
    #[prost(string, tag = "1")]
    pub table: ::prost::alloc::string::String,
    #[prost(uint64, tag = "2")]
    pub online: u64,
}

/// Self reported status of a live server.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerStatusRecord {
    #[prost(uint64, tag = "1")]
    pub hold_time_ms: u64,
    #[prost(message, repeated, tag = "2")]
    pub tables: ::prost::alloc::vec::Vec<TableStatusRecord>,
}

/// Registration of a live server under `servers/<address>`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerRecord {
    #[prost(string, tag = "1")]
    pub session: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "2")]
    pub status: ::core::option::Option<ServerStatusRecord>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteCandidateRecord {
    #[prost(string, tag = "1")]
    pub table: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RecoveryRecord {
    #[prost(bool, tag = "1")]
    pub finished: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExtentMessage {
    #[prost(string, tag = "1")]
    pub table: ::prost::alloc::string::String,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub end_row: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub prev_end_row: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
}

/// Request to assign, chop or compact a tablet.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TabletRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub lock: ::prost::alloc::vec::Vec<u8>,
    #[prost(string, tag = "2")]
    pub session: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "3")]
    pub extent: ::core::option::Option<ExtentMessage>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UnloadTabletRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub lock: ::prost::alloc::vec::Vec<u8>,
    #[prost(string, tag = "2")]
    pub session: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "3")]
    pub extent: ::core::option::Option<ExtentMessage>,
    #[prost(bool, tag = "4")]
    pub save: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SplitTabletRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub lock: ::prost::alloc::vec::Vec<u8>,
    #[prost(string, tag = "2")]
    pub session: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "3")]
    pub extent: ::core::option::Option<ExtentMessage>,
    #[prost(bytes = "vec", tag = "4")]
    pub split_row: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TabletResponse {}
