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

//! Key layout of coordinator metadata.
//!
//! Tablet rows are keyed by `tablets/<table>;<end-row>`, or `tablets/<table><` for the last tablet
//! of a table, so rows of one table sort by end row with the last tablet at the end.

use anyhow::{bail, Result};

pub const TABLETS_PREFIX: &[u8] = b"tablets/";
pub const MERGES_PREFIX: &[u8] = b"merges/";
pub const TABLES_PREFIX: &[u8] = b"tables/";
pub const DELETES_PREFIX: &[u8] = b"deletes/";
pub const RECOVERY_PREFIX: &[u8] = b"recovery/";
pub const SERVERS_PREFIX: &str = "servers/";
pub const MASTER_LOCK_KEY: &str = "master/lock";

pub const SYSTEM_TABLE_MARKER: char = '!';

const ROW_SEPARATOR: u8 = b';';
const LAST_TABLET_MARKER: u8 = b'<';

pub fn validate_table_id(table: &str) -> Result<()> {
    let name = table.strip_prefix(SYSTEM_TABLE_MARKER).unwrap_or(table);
    if name.is_empty() {
        bail!("invalid table id: {table:?}")
    }
    if !name.bytes().all(|c| c.is_ascii_alphanumeric() || c == b'_' || c == b'-') {
        bail!("invalid table id: {table:?}")
    }
    Ok(())
}

pub fn is_system_table(table: &str) -> bool {
    table.starts_with(SYSTEM_TABLE_MARKER)
}

fn prefixed(prefix: &[u8], suffix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + suffix.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(suffix);
    key
}

/// Smallest key greater than all keys having given prefix.
pub fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return end;
        }
    }
    vec![]
}

/// Smallest key strictly greater than given key.
pub fn successor(key: &[u8]) -> Vec<u8> {
    let mut next = Vec::with_capacity(key.len() + 1);
    next.extend_from_slice(key);
    next.push(0);
    next
}

pub fn tablet_key(table: &str, end_row: Option<&[u8]>) -> Vec<u8> {
    let mut key = prefixed(TABLETS_PREFIX, table.as_bytes());
    match end_row {
        None => key.push(LAST_TABLET_MARKER),
        Some(row) => {
            key.push(ROW_SEPARATOR);
            key.extend_from_slice(row);
        },
    }
    key
}

pub fn parse_tablet_key(key: &[u8]) -> Result<(&str, Option<&[u8]>)> {
    let Some(suffix) = key.strip_prefix(TABLETS_PREFIX) else {
        bail!("not a tablet key: {}", String::from_utf8_lossy(key))
    };
    let Some(i) = suffix.iter().position(|c| *c == ROW_SEPARATOR || *c == LAST_TABLET_MARKER) else {
        bail!("tablet key has no row: {}", String::from_utf8_lossy(key))
    };
    let table = std::str::from_utf8(&suffix[..i])?;
    validate_table_id(table)?;
    let rest = &suffix[i + 1..];
    match suffix[i] {
        ROW_SEPARATOR => Ok((table, Some(rest))),
        _ if rest.is_empty() => Ok((table, None)),
        _ => bail!("trailing bytes after last tablet key: {}", String::from_utf8_lossy(key)),
    }
}

/// Key range covering all tablet rows of given table.
pub fn table_tablets_range(table: &str) -> (Vec<u8>, Vec<u8>) {
    let start = prefixed(TABLETS_PREFIX, table.as_bytes());
    let mut end = start.clone();
    end.push(LAST_TABLET_MARKER + 1);
    (start, end)
}

/// Key range covering tablet rows of system tables.
pub fn system_tablets_range() -> (Vec<u8>, Vec<u8>) {
    let start = prefixed(TABLETS_PREFIX, &[SYSTEM_TABLE_MARKER as u8]);
    let end = prefix_end(&start);
    (start, end)
}

/// Key range covering tablet rows of user tables.
pub fn user_tablets_range() -> (Vec<u8>, Vec<u8>) {
    let start = prefix_end(&prefixed(TABLETS_PREFIX, &[SYSTEM_TABLE_MARKER as u8]));
    (start, prefix_end(TABLETS_PREFIX))
}

pub fn merge_key(table: &str) -> Vec<u8> {
    prefixed(MERGES_PREFIX, table.as_bytes())
}

pub fn table_key(table: &str) -> Vec<u8> {
    prefixed(TABLES_PREFIX, table.as_bytes())
}

pub fn delete_key(path: &str) -> Vec<u8> {
    prefixed(DELETES_PREFIX, path.as_bytes())
}

pub fn recovery_key(wal: &str) -> Vec<u8> {
    prefixed(RECOVERY_PREFIX, wal.as_bytes())
}
