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

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use ignore_result::Ignore;
use tokio::sync::{broadcast, watch};
use tracing::info;

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug)]
struct EventState {
    sequence: watch::Sender<u64>,
    events: broadcast::Sender<Arc<str>>,
}

/// Notable coordinator events, logged and broadcast, which also wake loops waiting between passes.
#[derive(Clone, Debug)]
pub struct EventCoordinator {
    state: Arc<EventState>,
}

impl Default for EventCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl EventCoordinator {
    pub fn new() -> Self {
        let (sequence, _) = watch::channel(0);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { state: Arc::new(EventState { sequence, events }) }
    }

    pub fn event(&self, message: impl Into<Arc<str>>) {
        let message = message.into();
        info!("event: {message}");
        self.state.events.send(message).ignore();
        self.state.sequence.send_modify(|n| *n += 1);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<str>> {
        self.state.events.subscribe()
    }

    pub fn listener(&self) -> EventListener {
        EventListener { receiver: self.state.sequence.subscribe() }
    }
}

pub struct EventListener {
    receiver: watch::Receiver<u64>,
}

impl EventListener {
    /// Resolves on next event after last wait.
    pub async fn wait(&mut self) {
        if self.receiver.changed().await.is_err() {
            pending::<()>().await;
        }
    }

    /// Waits for next event at most `timeout`, returns whether an event arrived.
    pub async fn wait_for(&mut self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }
}
