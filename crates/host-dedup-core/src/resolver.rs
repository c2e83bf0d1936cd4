use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use crate::facts::{identity_facts, match_filter, CanonicalFacts, FactExpr};
use crate::scanner::ChunkedAccountScanner;
use crate::staleness::{StalenessClock, StalenessConfig};
use crate::{DedupError, Host, HostDeleteEvent, HostId};

/// Read/delete access to the host inventory.
pub trait HostStore {
    /// Every account that currently owns at least one host.
    ///
    /// # Errors
    /// Returns [`DedupError::Storage`] when the backing store cannot be read.
    fn list_accounts(&self) -> Result<Vec<String>, DedupError>;

    /// Up to `limit` hosts of `account` with id strictly greater than `after`, ascending by id.
    ///
    /// # Errors
    /// Returns [`DedupError::Storage`] when the backing store cannot be read.
    fn query_hosts(
        &self,
        account: &str,
        after: Option<&HostId>,
        limit: usize,
    ) -> Result<Vec<Host>, DedupError>;

    /// Hosts of `account` satisfying `filter`, most recently modified first.
    ///
    /// # Errors
    /// Returns [`DedupError::Storage`] when the backing store cannot be read.
    fn query_candidates(&self, account: &str, filter: &FactExpr)
        -> Result<Vec<Host>, DedupError>;

    /// Remove one host. Deleting a missing host is not an error.
    ///
    /// # Errors
    /// Returns [`DedupError::Storage`] when the delete cannot be applied.
    fn delete_host(&self, id: &HostId) -> Result<DeleteOutcome, DedupError>;

    /// Tenant override of the staleness offsets, if one is stored.
    ///
    /// # Errors
    /// Returns [`DedupError::Storage`] when the override cannot be read.
    fn staleness_for(&self, _account: &str) -> Result<Option<StalenessConfig>, DedupError> {
        Ok(None)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

/// Keyed publish of delete notifications.
pub trait EventEmitter {
    /// # Errors
    /// Returns [`DedupError::EventEmission`] when the event cannot be handed off.
    fn emit(&mut self, key: &HostId, event: &HostDeleteEvent) -> Result<(), DedupError>;

    /// Block until previously emitted events are delivered.
    ///
    /// # Errors
    /// Returns [`DedupError::EventFlush`] when delivery cannot be confirmed.
    fn flush(&mut self) -> Result<(), DedupError> {
        Ok(())
    }
}

impl<E: EventEmitter + ?Sized> EventEmitter for Box<E> {
    fn emit(&mut self, key: &HostId, event: &HostDeleteEvent) -> Result<(), DedupError> {
        (**self).emit(key, event)
    }

    fn flush(&mut self) -> Result<(), DedupError> {
        (**self).flush()
    }
}

/// Polled before every deletion and between accounts.
pub trait CancellationSignal {
    fn should_stop(&self) -> bool;
}

impl<F: Fn() -> bool> CancellationSignal for F {
    fn should_stop(&self) -> bool {
        self()
    }
}

impl CancellationSignal for AtomicBool {
    fn should_stop(&self) -> bool {
        self.load(AtomicOrdering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NeverStop;

impl CancellationSignal for NeverStop {
    fn should_stop(&self) -> bool {
        false
    }
}

/// What to do after a host was deleted but its event could not be emitted.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum EmitFailurePolicy {
    /// Log, count and keep going.
    Continue,
    /// Stop the run and surface the error.
    #[default]
    Abort,
}

impl EmitFailurePolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::Abort => "abort",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "continue" => Some(Self::Continue),
            "abort" => Some(Self::Abort),
            _ => None,
        }
    }
}

pub const DEFAULT_CHUNK_SIZE: usize = 1_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct ResolverOptions {
    pub chunk_size: usize,
    pub emit_failure: EmitFailurePolicy,
    pub dry_run: bool,
    pub exclude_culled: bool,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            emit_failure: EmitFailurePolicy::default(),
            dry_run: false,
            exclude_culled: false,
        }
    }
}

impl ResolverOptions {
    /// # Errors
    /// Returns [`DedupError::Config`] when `chunk_size` is zero.
    pub fn validate(&self) -> Result<NonZeroUsize, DedupError> {
        NonZeroUsize::new(self.chunk_size)
            .ok_or_else(|| DedupError::Config("chunk_size MUST be a positive integer".to_string()))
    }
}

/// Counters for a whole run, or for a single account when returned by
/// [`DuplicateResolver::resolve_account`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct RunSummary {
    pub accounts_processed: usize,
    pub hosts_scanned: usize,
    pub duplicates_found: usize,
    pub hosts_deleted: usize,
    pub events_emitted: usize,
    pub events_failed: usize,
    pub malformed_skipped: usize,
    pub culled_skipped: usize,
    pub interrupted: bool,
    pub dry_run: bool,
}

impl RunSummary {
    fn absorb(&mut self, account: &Self) {
        self.accounts_processed += account.accounts_processed;
        self.hosts_scanned += account.hosts_scanned;
        self.duplicates_found += account.duplicates_found;
        self.hosts_deleted += account.hosts_deleted;
        self.events_emitted += account.events_emitted;
        self.events_failed += account.events_failed;
        self.malformed_skipped += account.malformed_skipped;
        self.culled_skipped += account.culled_skipped;
        self.interrupted |= account.interrupted;
    }
}

/// Per-account bookkeeping; dropped when the account is finished.
struct AccountPass {
    seen: BTreeSet<HostId>,
    duplicates: BTreeSet<HostId>,
}

impl AccountPass {
    fn new() -> Self {
        Self { seen: BTreeSet::new(), duplicates: BTreeSet::new() }
    }

    fn mark_duplicate(&mut self, id: HostId) {
        self.seen.remove(&id);
        self.duplicates.insert(id);
    }
}

/// Newest `modified_on` first; ties broken by the larger id.
fn survivor_order(left: &Host, right: &Host) -> Ordering {
    right.modified_on.cmp(&left.modified_on).then_with(|| right.id.cmp(&left.id))
}

/// Scans every account and removes hosts that describe the same machine as a
/// more recently modified host.
pub struct DuplicateResolver<'a, S: ?Sized, E: ?Sized, C: ?Sized> {
    store: &'a S,
    emitter: &'a mut E,
    cancel: &'a C,
    options: ResolverOptions,
    chunk_size: NonZeroUsize,
    clock: StalenessClock,
}

impl<'a, S, E, C> DuplicateResolver<'a, S, E, C>
where
    S: HostStore + ?Sized,
    E: EventEmitter + ?Sized,
    C: CancellationSignal + ?Sized,
{
    /// # Errors
    /// Returns [`DedupError::Config`] when `options` are invalid.
    pub fn new(
        store: &'a S,
        emitter: &'a mut E,
        cancel: &'a C,
        options: ResolverOptions,
        clock: StalenessClock,
    ) -> Result<Self, DedupError> {
        let chunk_size = options.validate()?;
        clock.config().validate()?;
        Ok(Self { store, emitter, cancel, options, chunk_size, clock })
    }

    #[must_use]
    pub fn options(&self) -> ResolverOptions {
        self.options
    }

    /// Resolve every account in order, then flush the emitter.
    ///
    /// # Errors
    /// Returns the first storage error, or an emission error under
    /// [`EmitFailurePolicy::Abort`]. Deletions committed before the error stay committed.
    pub fn run(&mut self) -> Result<RunSummary, DedupError> {
        let scanner = ChunkedAccountScanner::new(self.store, self.chunk_size);
        let accounts = scanner.accounts()?;
        info!(
            accounts = accounts.len(),
            chunk_size = self.chunk_size.get(),
            dry_run = self.options.dry_run,
            "starting duplicate host resolution"
        );

        let mut summary = RunSummary { dry_run: self.options.dry_run, ..RunSummary::default() };
        for account in &accounts {
            if self.cancel.should_stop() {
                info!(account = %account, "stop requested before account");
                summary.interrupted = true;
                break;
            }

            match self.resolve_account(account) {
                Ok(outcome) => summary.absorb(&outcome),
                Err(err) => {
                    error!(
                        account = %account,
                        deleted_so_far = summary.hosts_deleted,
                        error = %err,
                        "duplicate host resolution failed"
                    );
                    self.flush_after_error();
                    return Err(err);
                }
            }

            if summary.interrupted {
                break;
            }
        }

        self.emitter.flush()?;
        info!(
            accounts = summary.accounts_processed,
            scanned = summary.hosts_scanned,
            deleted = summary.hosts_deleted,
            events_failed = summary.events_failed,
            interrupted = summary.interrupted,
            "duplicate host resolution finished"
        );
        Ok(summary)
    }

    /// Resolve one account, then flush the emitter. The flush also happens when
    /// resolution fails, so events for committed deletions are not left pending.
    ///
    /// # Errors
    /// Returns the resolution error, or a flush error after a successful pass.
    pub fn run_account(&mut self, account: &str) -> Result<RunSummary, DedupError> {
        match self.resolve_account(account) {
            Ok(summary) => {
                self.emitter.flush()?;
                Ok(summary)
            }
            Err(err) => {
                error!(account = %account, error = %err, "duplicate host resolution failed");
                self.flush_after_error();
                Err(err)
            }
        }
    }

    fn flush_after_error(&mut self) {
        if let Err(flush_err) = self.emitter.flush() {
            warn!(error = %flush_err, "event flush failed after aborted run");
        }
    }

    /// Resolve a single account. Does not flush the emitter.
    ///
    /// # Errors
    /// Returns the first storage error, or an emission error under
    /// [`EmitFailurePolicy::Abort`].
    pub fn resolve_account(&mut self, account: &str) -> Result<RunSummary, DedupError> {
        let clock = match self.store.staleness_for(account)? {
            Some(config) => {
                config.validate()?;
                self.clock.with_config(config)
            }
            None => self.clock,
        };
        let scanner = ChunkedAccountScanner::new(self.store, self.chunk_size);
        let mut pass = AccountPass::new();
        let mut outcome = RunSummary {
            accounts_processed: 1,
            dry_run: self.options.dry_run,
            ..RunSummary::default()
        };

        for host in scanner.hosts(account) {
            let host = host?;
            outcome.hosts_scanned += 1;
            if pass.duplicates.contains(&host.id) {
                debug!(host_id = %host.id, "skipping host already removed as duplicate");
                continue;
            }

            let facts = match CanonicalFacts::from_json(&host.canonical_facts) {
                Ok(facts) => facts,
                Err(err) => {
                    warn!(
                        host_id = %host.id,
                        account = %account,
                        error = %err,
                        "skipping host with malformed canonical facts"
                    );
                    outcome.malformed_skipped += 1;
                    pass.seen.insert(host.id);
                    continue;
                }
            };
            let Some((basis, selected)) = identity_facts(&facts) else {
                pass.seen.insert(host.id);
                continue;
            };
            let Some(filter) = match_filter(&selected) else {
                pass.seen.insert(host.id);
                continue;
            };

            let mut candidates = self.store.query_candidates(account, &filter)?;
            candidates.retain(|candidate| {
                candidate.account == account && !pass.duplicates.contains(&candidate.id)
            });
            if self.options.exclude_culled {
                let before = candidates.len();
                candidates
                    .retain(|candidate| !clock.is_culled(candidate.stale_timestamp, candidate.host_type));
                outcome.culled_skipped += before - candidates.len();
            }
            candidates.sort_by(survivor_order);

            let Some((survivor, duplicates)) = candidates.split_first() else {
                pass.seen.insert(host.id);
                continue;
            };
            pass.seen.insert(survivor.id);
            if !duplicates.is_empty() {
                debug!(
                    host_id = %host.id,
                    survivor_id = %survivor.id,
                    basis = basis.as_str(),
                    duplicates = duplicates.len(),
                    "found duplicate hosts"
                );
            }

            for duplicate in duplicates {
                if self.cancel.should_stop() {
                    info!(
                        account = %account,
                        deleted = outcome.hosts_deleted,
                        "stop requested; leaving remaining duplicates in place"
                    );
                    outcome.interrupted = true;
                    return Ok(outcome);
                }
                pass.mark_duplicate(duplicate.id);
                self.remove_duplicate(duplicate, survivor.id, &mut outcome)?;
            }
        }

        info!(
            account = %account,
            scanned = outcome.hosts_scanned,
            retained = pass.seen.len(),
            deleted = outcome.hosts_deleted,
            malformed = outcome.malformed_skipped,
            "account resolved"
        );
        Ok(outcome)
    }

    fn remove_duplicate(
        &mut self,
        duplicate: &Host,
        survivor_id: HostId,
        outcome: &mut RunSummary,
    ) -> Result<(), DedupError> {
        outcome.duplicates_found += 1;
        if self.options.dry_run {
            info!(
                host_id = %duplicate.id,
                survivor_id = %survivor_id,
                account = %duplicate.account,
                "dry run: would delete duplicate host"
            );
            return Ok(());
        }

        match self.store.delete_host(&duplicate.id)? {
            DeleteOutcome::Deleted => {}
            DeleteOutcome::NotFound => {
                debug!(host_id = %duplicate.id, "duplicate host already gone");
                return Ok(());
            }
        }
        outcome.hosts_deleted += 1;
        info!(
            host_id = %duplicate.id,
            survivor_id = %survivor_id,
            account = %duplicate.account,
            "deleted duplicate host"
        );

        let event = HostDeleteEvent::for_duplicate(duplicate, survivor_id, OffsetDateTime::now_utc());
        match self.emitter.emit(&duplicate.id, &event) {
            Ok(()) => {
                outcome.events_emitted += 1;
                Ok(())
            }
            Err(err) => {
                outcome.events_failed += 1;
                match self.options.emit_failure {
                    EmitFailurePolicy::Continue => {
                        warn!(host_id = %duplicate.id, error = %err, "delete event not emitted");
                        Ok(())
                    }
                    EmitFailurePolicy::Abort => Err(err),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    use proptest::prelude::*;
    use serde_json::json;
    use time::Duration;

    use super::*;
    use crate::testing::{fixture_time, host_with_facts, InMemoryHostStore, RecordingEmitter};
    use crate::HostType;

    fn clock() -> StalenessClock {
        StalenessClock::at(fixture_time(), StalenessConfig::default())
    }

    fn run_with(
        store: &InMemoryHostStore,
        emitter: &mut RecordingEmitter,
        options: ResolverOptions,
    ) -> Result<RunSummary, DedupError> {
        DuplicateResolver::new(store, emitter, &NeverStop, options, clock())?.run()
    }

    fn run_default(
        store: &InMemoryHostStore,
        emitter: &mut RecordingEmitter,
    ) -> Result<RunSummary, DedupError> {
        run_with(store, emitter, ResolverOptions::default())
    }

    // Test IDs: RES-001
    #[test]
    fn elevated_match_keeps_newest_host() -> Result<(), DedupError> {
        let older = host_with_facts("acct-1", json!({"insights_id": "i-1"}), -60);
        let newer = host_with_facts("acct-1", json!({"insights_id": "i-1"}), 0);
        let store = InMemoryHostStore::with_hosts([older.clone(), newer.clone()]);
        let mut emitter = RecordingEmitter::default();

        let summary = run_default(&store, &mut emitter)?;

        assert_eq!(summary.hosts_deleted, 1);
        assert!(store.contains(&newer.id));
        assert!(!store.contains(&older.id));
        assert_eq!(emitter.events().len(), 1);
        let (key, event) = &emitter.events()[0];
        assert_eq!(*key, older.id);
        assert_eq!(event.id, older.id);
        assert_eq!(event.survivor_id, newer.id);
        assert_eq!(event.event_type, HostDeleteEvent::EVENT_TYPE);
        assert_eq!(emitter.flushes(), 1);
        Ok(())
    }

    // Test IDs: RES-002
    #[test]
    fn conflicting_regular_fact_blocks_match() -> Result<(), DedupError> {
        let first = host_with_facts("acct-1", json!({"fqdn": "a", "bios_uuid": "b-1"}), -60);
        let second = host_with_facts("acct-1", json!({"fqdn": "a", "bios_uuid": "b-2"}), 0);
        let store = InMemoryHostStore::with_hosts([first.clone(), second.clone()]);
        let mut emitter = RecordingEmitter::default();

        let summary = run_default(&store, &mut emitter)?;

        assert_eq!(summary.hosts_deleted, 0);
        assert_eq!(store.len(), 2);
        assert!(emitter.events().is_empty());
        Ok(())
    }

    // Test IDs: RES-003
    #[test]
    fn multi_valued_fact_matches_by_containment() -> Result<(), DedupError> {
        let subset = host_with_facts("acct-1", json!({"mac_addresses": ["m1"]}), 0);
        let superset = host_with_facts("acct-1", json!({"mac_addresses": ["m1", "m2"]}), -60);
        let store = InMemoryHostStore::with_hosts([subset.clone(), superset.clone()]);
        let mut emitter = RecordingEmitter::default();

        let summary = run_default(&store, &mut emitter)?;

        assert_eq!(summary.hosts_deleted, 1);
        assert!(store.contains(&subset.id));
        assert!(!store.contains(&superset.id));
        Ok(())
    }

    // Test IDs: RES-004
    #[test]
    fn provider_id_overrides_other_elevated_facts() -> Result<(), DedupError> {
        let first = host_with_facts(
            "acct-1",
            json!({"provider_id": "p-1", "insights_id": "i-1"}),
            -60,
        );
        let second = host_with_facts(
            "acct-1",
            json!({"provider_id": "p-1", "insights_id": "i-2"}),
            0,
        );
        let store = InMemoryHostStore::with_hosts([first.clone(), second.clone()]);
        let mut emitter = RecordingEmitter::default();

        run_default(&store, &mut emitter)?;

        assert_eq!(store.len(), 1);
        assert!(store.contains(&second.id));
        Ok(())
    }

    // Test IDs: RES-005
    #[test]
    fn hosts_without_identity_facts_are_left_alone() -> Result<(), DedupError> {
        let first = host_with_facts("acct-1", json!({"provider_type": "aws"}), -60);
        let second = host_with_facts("acct-1", json!({}), 0);
        let store = InMemoryHostStore::with_hosts([first, second]);
        let mut emitter = RecordingEmitter::default();

        let summary = run_default(&store, &mut emitter)?;

        assert_eq!(summary.hosts_scanned, 2);
        assert_eq!(summary.hosts_deleted, 0);
        assert_eq!(store.len(), 2);
        Ok(())
    }

    // Test IDs: RES-006
    #[test]
    fn identical_facts_in_different_accounts_are_untouched() -> Result<(), DedupError> {
        let first = host_with_facts("acct-1", json!({"insights_id": "i-1"}), -60);
        let second = host_with_facts("acct-2", json!({"insights_id": "i-1"}), 0);
        let store = InMemoryHostStore::with_hosts([first, second]);
        let mut emitter = RecordingEmitter::default();

        let summary = run_default(&store, &mut emitter)?;

        assert_eq!(summary.accounts_processed, 2);
        assert_eq!(summary.hosts_deleted, 0);
        assert_eq!(store.len(), 2);
        Ok(())
    }

    // Test IDs: RES-007
    #[test]
    fn equal_modified_on_keeps_larger_id() -> Result<(), DedupError> {
        let first = host_with_facts("acct-1", json!({"fqdn": "a"}), 0);
        let mut second = host_with_facts("acct-1", json!({"fqdn": "a"}), 0);
        second.modified_on = first.modified_on;
        let (keep, drop) = if first.id > second.id { (first, second) } else { (second, first) };
        let store = InMemoryHostStore::with_hosts([keep.clone(), drop.clone()]);
        let mut emitter = RecordingEmitter::default();

        run_default(&store, &mut emitter)?;

        assert!(store.contains(&keep.id));
        assert!(!store.contains(&drop.id));
        Ok(())
    }

    // Test IDs: RES-008
    #[test]
    fn malformed_host_is_skipped_and_counted() -> Result<(), DedupError> {
        let malformed = host_with_facts("acct-1", json!({"mac_addresses": "aa:bb"}), 0);
        let first = host_with_facts("acct-1", json!({"fqdn": "a"}), -60);
        let second = host_with_facts("acct-1", json!({"fqdn": "a"}), 0);
        let store = InMemoryHostStore::with_hosts([malformed.clone(), first, second]);
        let mut emitter = RecordingEmitter::default();

        let summary = run_default(&store, &mut emitter)?;

        assert_eq!(summary.malformed_skipped, 1);
        assert_eq!(summary.hosts_deleted, 1);
        assert!(store.contains(&malformed.id));
        Ok(())
    }

    // Test IDs: RES-009
    #[test]
    fn second_run_deletes_nothing() -> Result<(), DedupError> {
        let hosts = [
            host_with_facts("acct-1", json!({"fqdn": "a"}), -120),
            host_with_facts("acct-1", json!({"fqdn": "a", "bios_uuid": "b"}), -60),
            host_with_facts("acct-1", json!({"bios_uuid": "b"}), 0),
            host_with_facts("acct-1", json!({"insights_id": "i"}), -30),
            host_with_facts("acct-1", json!({"insights_id": "i"}), -10),
        ];
        let store = InMemoryHostStore::with_hosts(hosts);
        let mut emitter = RecordingEmitter::default();

        let first = run_default(&store, &mut emitter)?;
        let mut second_emitter = RecordingEmitter::default();
        let second = run_default(&store, &mut second_emitter)?;

        assert!(first.hosts_deleted > 0);
        assert_eq!(second.hosts_deleted, 0);
        assert!(second_emitter.events().is_empty());
        Ok(())
    }

    // Test IDs: RES-010
    #[test]
    fn stop_signal_halts_after_current_deletion() -> Result<(), DedupError> {
        let hosts: Vec<Host> = (0..5)
            .map(|offset| host_with_facts("acct-1", json!({"insights_id": "i-1"}), -offset * 60))
            .collect();
        let store = InMemoryHostStore::with_hosts(hosts);
        let stop = Arc::new(AtomicBool::new(false));
        let mut emitter = RecordingEmitter::default().stop_after(2, Arc::clone(&stop));

        let summary = DuplicateResolver::new(
            &store,
            &mut emitter,
            stop.as_ref(),
            ResolverOptions::default(),
            clock(),
        )?
        .run()?;

        assert!(summary.interrupted);
        assert_eq!(summary.hosts_deleted, 2);
        assert_eq!(emitter.events().len(), 2);
        assert_eq!(store.len(), 3);
        Ok(())
    }

    // Test IDs: RES-011
    #[test]
    fn stop_signal_checked_between_accounts() -> Result<(), DedupError> {
        let store = InMemoryHostStore::with_hosts([
            host_with_facts("acct-1", json!({"fqdn": "a"}), 0),
            host_with_facts("acct-2", json!({"fqdn": "a"}), 0),
        ]);
        let polls = AtomicUsize::new(0);
        let cancel = || polls.fetch_add(1, AtomicOrdering::SeqCst) >= 1;
        let mut emitter = RecordingEmitter::default();

        let summary =
            DuplicateResolver::new(&store, &mut emitter, &cancel, ResolverOptions::default(), clock())?
                .run()?;

        assert!(summary.interrupted);
        assert_eq!(summary.accounts_processed, 1);
        Ok(())
    }

    // Test IDs: RES-012
    #[test]
    fn emit_failure_aborts_by_default_after_delete() {
        let older = host_with_facts("acct-1", json!({"fqdn": "a"}), -60);
        let newer = host_with_facts("acct-1", json!({"fqdn": "a"}), 0);
        let store = InMemoryHostStore::with_hosts([older.clone(), newer]);
        let mut emitter = RecordingEmitter::default().failing_for([older.id]);

        let result = run_default(&store, &mut emitter);

        match result {
            Err(DedupError::EventEmission { host_id, .. }) => assert_eq!(host_id, older.id),
            other => panic!("expected emission error, got {other:?}"),
        }
        assert!(!store.contains(&older.id));
    }

    // Test IDs: RES-013
    #[test]
    fn emit_failure_can_continue() -> Result<(), DedupError> {
        let oldest = host_with_facts("acct-1", json!({"fqdn": "a"}), -120);
        let older = host_with_facts("acct-1", json!({"fqdn": "a"}), -60);
        let newest = host_with_facts("acct-1", json!({"fqdn": "a"}), 0);
        let store = InMemoryHostStore::with_hosts([oldest.clone(), older.clone(), newest]);
        let mut emitter = RecordingEmitter::default().failing_for([oldest.id]);
        let options =
            ResolverOptions { emit_failure: EmitFailurePolicy::Continue, ..ResolverOptions::default() };

        let summary = run_with(&store, &mut emitter, options)?;

        assert_eq!(summary.hosts_deleted, 2);
        assert_eq!(summary.events_failed, 1);
        assert_eq!(summary.events_emitted, 1);
        assert_eq!(emitter.events().len(), 1);
        assert_eq!(emitter.events()[0].0, older.id);
        Ok(())
    }

    // Test IDs: RES-014
    #[test]
    fn dry_run_reports_without_deleting() -> Result<(), DedupError> {
        let store = InMemoryHostStore::with_hosts([
            host_with_facts("acct-1", json!({"fqdn": "a"}), -60),
            host_with_facts("acct-1", json!({"fqdn": "a"}), -30),
            host_with_facts("acct-1", json!({"fqdn": "a"}), 0),
        ]);
        let mut emitter = RecordingEmitter::default();
        let options = ResolverOptions { dry_run: true, ..ResolverOptions::default() };

        let summary = run_with(&store, &mut emitter, options)?;

        assert!(summary.dry_run);
        assert_eq!(summary.duplicates_found, 2);
        assert_eq!(summary.hosts_deleted, 0);
        assert_eq!(store.len(), 3);
        assert!(emitter.events().is_empty());
        Ok(())
    }

    // Test IDs: RES-015
    #[test]
    fn exclude_culled_ignores_culled_candidates() -> Result<(), DedupError> {
        let mut culled = host_with_facts("acct-1", json!({"fqdn": "a"}), 60);
        culled.stale_timestamp = fixture_time() - Duration::days(30);
        let live = host_with_facts("acct-1", json!({"fqdn": "a"}), 0);
        let store = InMemoryHostStore::with_hosts([culled.clone(), live.clone()]);
        let mut emitter = RecordingEmitter::default();
        let options = ResolverOptions { exclude_culled: true, ..ResolverOptions::default() };

        let summary = run_with(&store, &mut emitter, options)?;

        assert_eq!(summary.hosts_deleted, 0);
        assert!(summary.culled_skipped > 0);
        assert!(store.contains(&culled.id));
        assert!(store.contains(&live.id));
        Ok(())
    }

    // Test IDs: RES-016
    #[test]
    fn tenant_staleness_override_applies_per_account() -> Result<(), DedupError> {
        let mut old = host_with_facts("acct-1", json!({"fqdn": "a"}), 60);
        old.stale_timestamp = fixture_time() - Duration::days(3);
        old.host_type = HostType::Conventional;
        let live = host_with_facts("acct-1", json!({"fqdn": "a"}), 0);
        let store = InMemoryHostStore::with_hosts([old.clone(), live.clone()]);
        let short = StalenessConfig {
            conventional: crate::StalenessOffsets::new(60, 120, 180),
            ..StalenessConfig::default()
        };
        store.set_staleness("acct-1", short);
        let mut emitter = RecordingEmitter::default();
        let options = ResolverOptions { exclude_culled: true, ..ResolverOptions::default() };

        run_with(&store, &mut emitter, options)?;

        assert!(store.contains(&old.id));
        assert!(store.contains(&live.id));
        Ok(())
    }

    // Test IDs: RES-017
    #[test]
    fn zero_chunk_size_is_rejected() {
        let store = InMemoryHostStore::default();
        let mut emitter = RecordingEmitter::default();
        let options = ResolverOptions { chunk_size: 0, ..ResolverOptions::default() };

        let result = DuplicateResolver::new(&store, &mut emitter, &NeverStop, options, clock());

        assert!(matches!(result, Err(DedupError::Config(_))));
    }

    // Test IDs: RES-018
    #[test]
    fn resolve_account_leaves_other_accounts() -> Result<(), DedupError> {
        let store = InMemoryHostStore::with_hosts([
            host_with_facts("acct-1", json!({"fqdn": "a"}), -60),
            host_with_facts("acct-1", json!({"fqdn": "a"}), 0),
            host_with_facts("acct-2", json!({"fqdn": "a"}), -60),
            host_with_facts("acct-2", json!({"fqdn": "a"}), 0),
        ]);
        let mut emitter = RecordingEmitter::default();

        let outcome = DuplicateResolver::new(
            &store,
            &mut emitter,
            &NeverStop,
            ResolverOptions { chunk_size: 1, ..ResolverOptions::default() },
            clock(),
        )?
        .resolve_account("acct-2")?;

        assert_eq!(outcome.hosts_deleted, 1);
        assert_eq!(store.host_ids("acct-1").len(), 2);
        assert_eq!(store.host_ids("acct-2").len(), 1);
        assert_eq!(emitter.flushes(), 0);
        Ok(())
    }

    // Test IDs: RES-019
    #[test]
    fn conflicting_ip_lists_keep_both_hosts() -> Result<(), DedupError> {
        let store = InMemoryHostStore::with_hosts([
            host_with_facts("acct-1", json!({"fqdn": "f", "ip_addresses": ["10.0.0.1"]}), -60),
            host_with_facts("acct-1", json!({"fqdn": "f", "ip_addresses": ["10.0.0.2"]}), 0),
        ]);
        let mut emitter = RecordingEmitter::default();

        let summary = run_default(&store, &mut emitter)?;

        assert_eq!(summary.hosts_deleted, 0);
        assert_eq!(store.len(), 2);
        Ok(())
    }

    // Test IDs: RES-020
    #[test]
    fn five_groups_of_five_keep_one_host_each() -> Result<(), DedupError> {
        let mut newest = BTreeMap::new();
        let mut hosts = Vec::new();
        for group in 0..5_i64 {
            for member in 0..5_i64 {
                let host = host_with_facts(
                    "acct-1",
                    json!({"provider_id": format!("p-{group}"), "fqdn": format!("m-{member}")}),
                    member * 10,
                );
                if member == 4 {
                    newest.insert(group, host.id);
                }
                hosts.push(host);
            }
        }
        let store = InMemoryHostStore::with_hosts(hosts);
        let mut emitter = RecordingEmitter::default();

        let summary = DuplicateResolver::new(
            &store,
            &mut emitter,
            &NeverStop,
            ResolverOptions { chunk_size: 4, ..ResolverOptions::default() },
            clock(),
        )?
        .run()?;

        assert_eq!(summary.hosts_deleted, 20);
        assert_eq!(summary.events_emitted, 20);
        assert_eq!(emitter.events().len(), 20);
        assert_eq!(store.len(), 5);
        for id in newest.values() {
            assert!(store.contains(id));
        }
        Ok(())
    }

    // Test IDs: RES-021
    #[test]
    fn empty_regular_value_does_not_block_elevated_match() -> Result<(), DedupError> {
        let older = host_with_facts("acct-1", json!({"insights_id": "i-1", "fqdn": ""}), -60);
        let newer = host_with_facts("acct-1", json!({"insights_id": "i-1", "fqdn": ""}), 0);
        let store = InMemoryHostStore::with_hosts([older.clone(), newer.clone()]);
        let mut emitter = RecordingEmitter::default();

        let summary = run_default(&store, &mut emitter)?;

        assert_eq!(summary.malformed_skipped, 0);
        assert_eq!(summary.hosts_deleted, 1);
        assert!(store.contains(&newer.id));
        assert!(!store.contains(&older.id));
        Ok(())
    }

    // Test IDs: RES-022
    #[test]
    fn seven_unique_hosts_page_three_three_one() -> Result<(), DedupError> {
        let store = InMemoryHostStore::with_hosts(
            (0..7_i64)
                .map(|index| host_with_facts("acct-1", json!({"fqdn": format!("h-{index}")}), index)),
        );
        let mut emitter = RecordingEmitter::default();

        let summary = run_with(
            &store,
            &mut emitter,
            ResolverOptions { chunk_size: 3, ..ResolverOptions::default() },
        )?;

        assert_eq!(summary.hosts_scanned, 7);
        assert_eq!(summary.hosts_deleted, 0);
        assert!(emitter.events().is_empty());
        assert_eq!(store.page_sizes(), vec![3, 3, 1]);
        Ok(())
    }

    // Test IDs: RES-023
    #[test]
    fn single_account_run_flushes_before_returning_error() -> Result<(), DedupError> {
        let first = host_with_facts("acct-1", json!({"provider_id": "p-1"}), -120);
        let second = host_with_facts("acct-1", json!({"provider_id": "p-1"}), -60);
        let newest = host_with_facts("acct-1", json!({"provider_id": "p-1"}), 0);
        let store = InMemoryHostStore::with_hosts([first.clone(), second.clone(), newest]);
        let mut emitter = RecordingEmitter::default().failing_for([second.id]);

        let result = DuplicateResolver::new(
            &store,
            &mut emitter,
            &NeverStop,
            ResolverOptions::default(),
            clock(),
        )?
        .run_account("acct-1");

        match result {
            Err(DedupError::EventEmission { host_id, .. }) => assert_eq!(host_id, second.id),
            other => panic!("expected emission failure, got {other:?}"),
        }
        assert!(!store.contains(&second.id));
        assert_eq!(emitter.flushes(), 1);

        let mut healthy = RecordingEmitter::default();
        let summary = DuplicateResolver::new(
            &store,
            &mut healthy,
            &NeverStop,
            ResolverOptions::default(),
            clock(),
        )?
        .run_account("acct-1")?;
        assert_eq!(summary.accounts_processed, 1);
        assert_eq!(healthy.flushes(), 1);
        Ok(())
    }

    fn fact_strategy() -> impl Strategy<Value = serde_json::Value> {
        let pick = |names: &'static [&'static str]| proptest::option::of(proptest::sample::select(names));
        (
            pick(&["i-1", "i-2"]),
            pick(&["p-1"]),
            pick(&["a", "b"]),
            pick(&["u-1", "u-2"]),
            proptest::option::of(proptest::sample::subsequence(vec!["m1", "m2", "m3"], 1..=2)),
        )
            .prop_map(|(insights, provider, fqdn, bios, macs)| {
                let mut facts = serde_json::Map::new();
                if let Some(value) = insights {
                    facts.insert("insights_id".to_string(), json!(value));
                }
                if let Some(value) = provider {
                    facts.insert("provider_id".to_string(), json!(value));
                }
                if let Some(value) = fqdn {
                    facts.insert("fqdn".to_string(), json!(value));
                }
                if let Some(value) = bios {
                    facts.insert("bios_uuid".to_string(), json!(value));
                }
                if let Some(values) = macs {
                    facts.insert("mac_addresses".to_string(), json!(values));
                }
                serde_json::Value::Object(facts)
            })
    }

    fn hosts_strategy() -> impl Strategy<Value = Vec<Host>> {
        proptest::collection::vec(
            (proptest::sample::select(vec!["acct-1", "acct-2"]), fact_strategy(), -50_i64..50),
            0..24,
        )
        .prop_map(|rows| {
            rows.into_iter()
                .map(|(account, facts, offset)| host_with_facts(account, facts, offset))
                .collect()
        })
    }

    proptest! {
        // Test IDs: RES-P001
        #[test]
        fn resolution_is_idempotent_and_keeps_newer_hosts(
            hosts in hosts_strategy(),
            chunk_size in 1_usize..6,
        ) {
            let by_id: BTreeMap<HostId, Host> =
                hosts.iter().map(|host| (host.id, host.clone())).collect();
            let store = InMemoryHostStore::with_hosts(hosts);
            let options = ResolverOptions { chunk_size, ..ResolverOptions::default() };

            let mut emitter = RecordingEmitter::default();
            let first = run_with(&store, &mut emitter, options);
            prop_assert!(first.is_ok());

            for (_, event) in emitter.events() {
                let deleted = &by_id[&event.id];
                let survivor = &by_id[&event.survivor_id];
                prop_assert_eq!(&deleted.account, &survivor.account);
                prop_assert_ne!(
                    survivor_order(survivor, deleted),
                    Ordering::Greater,
                    "survivor must not be older than the host it replaced"
                );
            }

            let mut second_emitter = RecordingEmitter::default();
            let second = run_with(&store, &mut second_emitter, options);
            prop_assert!(matches!(second, Ok(summary) if summary.hosts_deleted == 0));
            prop_assert!(second_emitter.events().is_empty());
        }
    }
}
