// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::os::unix::net::UnixStream;

/// Insertion-ordered attribute storage with unique keys. The strings are
/// already bounded by the wire protocol, and session maps stay small, so a
/// flat pair vector beats a real map here and keeps iteration order obvious.
#[derive(Debug, Default, Clone)]
pub(crate) struct AttributeMap {
    entries: Vec<(String, String)>,
}

impl AttributeMap {
    pub fn seeded(initial: &[(String, String)]) -> Self {
        let mut map = Self::default();
        for (key, value) in initial {
            map.set(key.clone(), value.clone());
        }
        map
    }

    /// Inserts, or replaces in place so the key keeps its original position.
    pub fn set(&mut self, key: String, value: String) {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Removes the key if present; absent keys are not an error.
    pub fn delete(&mut self, key: &str) {
        self.entries.retain(|(k, _)| k != key);
    }

    pub fn snapshot(&self) -> Vec<(String, String)> {
        self.entries.clone()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, String)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// One attached host thread, as the monitor sees it: the accepted socket and
/// the thread's attribute map.
#[derive(Debug)]
pub(crate) struct Session {
    pub id: u64,
    pub stream: UnixStream,
    pub attributes: AttributeMap,
}

impl Session {
    pub fn new(id: u64, stream: UnixStream, initial: &[(String, String)]) -> Self {
        Self {
            id,
            stream,
            attributes: AttributeMap::seeded(initial),
        }
    }
}
