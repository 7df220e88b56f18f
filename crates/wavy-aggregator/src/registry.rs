// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::protocol::DeviceId;

/// Set of devices that currently hold a live session, shared by every listener of a node.
///
/// A single lock is enough here: each operation is one hash lookup and the lock is never held
/// across an await point.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    active: Mutex<HashSet<DeviceId>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `device`, returning `false` if it already holds a session.
    pub fn try_register(&self, device: &DeviceId) -> bool {
        let inserted = self.lock().insert(device.clone());
        if inserted {
            debug!("Registered session for {}", device);
        }
        inserted
    }

    /// Removes `device`. Removing an absent device is a no-op.
    pub fn unregister(&self, device: &DeviceId) {
        if self.lock().remove(device) {
            debug!("Unregistered session for {}", device);
        }
    }

    pub fn is_registered(&self, device: &DeviceId) -> bool {
        self.lock().contains(device)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // The set holds no invariant a panicking holder could break, so a poisoned lock is reused.
    fn lock(&self) -> MutexGuard<'_, HashSet<DeviceId>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
