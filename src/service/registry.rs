// Copyright 2025 jonefeewang@gmail.com
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

use std::sync::Arc;

use dashmap::DashMap;

use crate::network::Connection;

/// Live connections of one server, keyed by connection id.
///
/// Accept inserts, and whichever of the handling task or the reaper notices
/// the end of a connection first removes it.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        ConnectionRegistry::default()
    }

    /// Last write wins on an id collision.
    pub fn insert(&self, id: String, connection: Arc<Connection>) {
        self.connections.insert(id, connection);
    }

    pub fn remove(&self, id: &str) -> bool {
        self.connections.remove(id).is_some()
    }

    /// Removes `connection` only if its id still maps to that same connection.
    pub fn remove_connection(&self, connection: &Arc<Connection>) -> bool {
        self.connections
            .remove_if(connection.id(), |_, current| Arc::ptr_eq(current, connection))
            .is_some()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.connections.contains_key(id)
    }

    /// Point-in-time copy for the reaper; entries may change right after.
    pub fn snapshot_for_sweep(&self) -> Vec<(String, Arc<Connection>)> {
        self.connections
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
