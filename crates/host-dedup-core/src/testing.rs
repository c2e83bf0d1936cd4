//! In-memory collaborators and fixtures shared by unit tests, benches and
//! downstream crates.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{Map, Value};
use time::{Duration, OffsetDateTime};

use crate::facts::FactExpr;
use crate::resolver::{DeleteOutcome, EventEmitter, HostStore};
use crate::staleness::StalenessConfig;
use crate::{DedupError, Host, HostDeleteEvent, HostId, HostType};

/// Fixed instant fixtures are anchored on.
#[must_use]
pub fn fixture_time() -> OffsetDateTime {
    // 2026-01-01T00:00:00Z
    OffsetDateTime::from_unix_timestamp(1_767_225_600).unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

/// Conventional host in `account` whose `modified_on` is `offset_seconds` from
/// [`fixture_time`] and whose stale timestamp is one day after it.
///
/// Non-object `facts` produce an empty mapping.
#[must_use]
pub fn host_with_facts(account: &str, facts: Value, offset_seconds: i64) -> Host {
    let canonical_facts = match facts {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    Host {
        id: HostId::new(),
        account: account.to_string(),
        display_name: None,
        reporter: Some("fixture".to_string()),
        host_type: HostType::Conventional,
        canonical_facts,
        modified_on: fixture_time() + Duration::seconds(offset_seconds),
        stale_timestamp: fixture_time() + Duration::days(1),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// [`HostStore`] over a sorted map, evaluating filters with [`FactExpr::evaluate`].
#[derive(Debug, Default)]
pub struct InMemoryHostStore {
    hosts: Mutex<BTreeMap<HostId, Host>>,
    staleness: Mutex<BTreeMap<String, StalenessConfig>>,
    page_sizes: Mutex<Vec<usize>>,
}

impl InMemoryHostStore {
    #[must_use]
    pub fn with_hosts(hosts: impl IntoIterator<Item = Host>) -> Self {
        let store = Self::default();
        for host in hosts {
            store.insert(host);
        }
        store
    }

    pub fn insert(&self, host: Host) {
        lock(&self.hosts).insert(host.id, host);
    }

    pub fn set_staleness(&self, account: &str, config: StalenessConfig) {
        lock(&self.staleness).insert(account.to_string(), config);
    }

    #[must_use]
    pub fn contains(&self, id: &HostId) -> bool {
        lock(&self.hosts).contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.hosts).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.hosts).is_empty()
    }

    /// Ids of `account`'s hosts in ascending order.
    #[must_use]
    pub fn host_ids(&self, account: &str) -> Vec<HostId> {
        lock(&self.hosts)
            .values()
            .filter(|host| host.account == account)
            .map(|host| host.id)
            .collect()
    }

    /// Row count returned by each `query_hosts` call so far.
    #[must_use]
    pub fn page_sizes(&self) -> Vec<usize> {
        lock(&self.page_sizes).clone()
    }
}

impl HostStore for InMemoryHostStore {
    fn list_accounts(&self) -> Result<Vec<String>, DedupError> {
        let accounts: BTreeSet<String> =
            lock(&self.hosts).values().map(|host| host.account.clone()).collect();
        Ok(accounts.into_iter().collect())
    }

    fn query_hosts(
        &self,
        account: &str,
        after: Option<&HostId>,
        limit: usize,
    ) -> Result<Vec<Host>, DedupError> {
        let page: Vec<Host> = lock(&self.hosts)
            .values()
            .filter(|host| host.account == account)
            .filter(|host| after.map_or(true, |cursor| host.id > *cursor))
            .take(limit)
            .cloned()
            .collect();
        lock(&self.page_sizes).push(page.len());
        Ok(page)
    }

    fn query_candidates(
        &self,
        account: &str,
        filter: &FactExpr,
    ) -> Result<Vec<Host>, DedupError> {
        let mut candidates: Vec<Host> = lock(&self.hosts)
            .values()
            .filter(|host| host.account == account && filter.evaluate(&host.canonical_facts))
            .cloned()
            .collect();
        candidates.sort_by(|left, right| {
            right.modified_on.cmp(&left.modified_on).then_with(|| right.id.cmp(&left.id))
        });
        Ok(candidates)
    }

    fn delete_host(&self, id: &HostId) -> Result<DeleteOutcome, DedupError> {
        Ok(match lock(&self.hosts).remove(id) {
            Some(_) => DeleteOutcome::Deleted,
            None => DeleteOutcome::NotFound,
        })
    }

    fn staleness_for(&self, account: &str) -> Result<Option<StalenessConfig>, DedupError> {
        Ok(lock(&self.staleness).get(account).copied())
    }
}

/// [`EventEmitter`] that keeps every event, optionally failing for chosen hosts
/// or raising a stop flag after a number of successful emits.
#[derive(Debug, Default)]
pub struct RecordingEmitter {
    events: Vec<(HostId, HostDeleteEvent)>,
    failing: BTreeSet<HostId>,
    stop_after: Option<(usize, Arc<AtomicBool>)>,
    flushes: usize,
}

impl RecordingEmitter {
    #[must_use]
    pub fn failing_for(mut self, ids: impl IntoIterator<Item = HostId>) -> Self {
        self.failing.extend(ids);
        self
    }

    #[must_use]
    pub fn stop_after(mut self, emitted: usize, flag: Arc<AtomicBool>) -> Self {
        self.stop_after = Some((emitted, flag));
        self
    }

    #[must_use]
    pub fn events(&self) -> &[(HostId, HostDeleteEvent)] {
        &self.events
    }

    #[must_use]
    pub fn flushes(&self) -> usize {
        self.flushes
    }
}

impl EventEmitter for RecordingEmitter {
    fn emit(&mut self, key: &HostId, event: &HostDeleteEvent) -> Result<(), DedupError> {
        if self.failing.contains(key) {
            return Err(DedupError::EventEmission {
                host_id: *key,
                message: "recording emitter configured to fail".to_string(),
            });
        }
        self.events.push((*key, event.clone()));
        if let Some((limit, flag)) = &self.stop_after {
            if self.events.len() >= *limit {
                flag.store(true, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), DedupError> {
        self.flushes += 1;
        Ok(())
    }
}
