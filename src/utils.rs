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

use tokio::sync::watch;

#[derive(Debug)]
pub struct DropOwner {
    sender: watch::Sender<()>,
}

#[derive(Clone, Debug)]
pub struct DropWatcher {
    receiver: watch::Receiver<()>,
}

impl DropWatcher {
    /// Resolves after the paired [DropOwner] got dropped.
    pub async fn dropped(&mut self) {
        while self.receiver.changed().await.is_ok() {}
    }
}

impl DropOwner {
    pub fn watch(&self) -> DropWatcher {
        DropWatcher { receiver: self.sender.subscribe() }
    }
}

pub fn drop_watcher() -> (DropOwner, DropWatcher) {
    let (sender, receiver) = watch::channel(());
    (DropOwner { sender }, DropWatcher { receiver })
}

/// Displays at most `limit` items of a slice, followed by `...` if truncated.
pub struct Truncated<'a, T> {
    items: &'a [T],
    limit: usize,
}

impl<'a, T> Truncated<'a, T> {
    pub fn new(items: &'a [T], limit: usize) -> Self {
        Self { items, limit }
    }
}

impl<T: Display> Display for Truncated<'_, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, item) in self.items.iter().take(self.limit).enumerate() {
            if i != 0 {
                f.write_str(", ")?;
            }
            write!(f, "{item}")?;
        }
        if self.items.len() > self.limit {
            f.write_str(", ...")?;
        }
        f.write_str("]")
    }
}

/// Lossy display of a row.
pub fn display_row(row: Option<&[u8]>) -> String {
    match row {
        None => "-".to_string(),
        Some(row) => String::from_utf8_lossy(row).into_owned(),
    }
}
