//! Per-aggregate mutual exclusion for writers, rollbacks and repairs.

use crate::domain::{Currency, ParticipantId};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub type AggregateKey = (ParticipantId, Currency);

/// Lock table keyed by `(beneficiary, currency)`.
///
/// Keys are always taken in sorted order so two callers that need
/// overlapping sets cannot deadlock.
#[derive(Debug, Default)]
pub struct AggregateLocks {
    inner: Mutex<HashMap<AggregateKey, Arc<Mutex<()>>>>,
}

/// Held locks; released on drop.
#[derive(Debug)]
pub struct AggregateGuard {
    keys: BTreeSet<AggregateKey>,
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl AggregateGuard {
    pub fn keys(&self) -> &BTreeSet<AggregateKey> {
        &self.keys
    }

    pub fn covers(&self, key: &AggregateKey) -> bool {
        self.keys.contains(key)
    }
}

impl AggregateLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for every lock in `keys`. Duplicates are ignored.
    pub async fn acquire(&self, keys: impl IntoIterator<Item = AggregateKey>) -> AggregateGuard {
        let keys: BTreeSet<AggregateKey> = keys.into_iter().collect();

        let mutexes: Vec<Arc<Mutex<()>>> = {
            let mut table = self.inner.lock().await;
            // Drop entries nobody is holding or waiting on.
            table.retain(|_, m| Arc::strong_count(m) > 1);
            keys.iter()
                .map(|k| table.entry(k.clone()).or_default().clone())
                .collect()
        };

        let mut guards = Vec::with_capacity(mutexes.len());
        for m in mutexes {
            guards.push(m.lock_owned().await);
        }

        AggregateGuard {
            keys,
            _guards: guards,
        }
    }
}
