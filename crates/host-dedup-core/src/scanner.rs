use std::collections::VecDeque;
use std::num::NonZeroUsize;

use tracing::debug;

use crate::resolver::HostStore;
use crate::{DedupError, Host, HostId};

/// Walks the inventory one account at a time in bounded pages.
///
/// Pages are keyed on the last host id fetched, so rows deleted behind the
/// cursor never shift later pages.
#[derive(Debug)]
pub struct ChunkedAccountScanner<'a, S: ?Sized> {
    store: &'a S,
    chunk_size: NonZeroUsize,
}

impl<'a, S: HostStore + ?Sized> ChunkedAccountScanner<'a, S> {
    #[must_use]
    pub fn new(store: &'a S, chunk_size: NonZeroUsize) -> Self {
        Self { store, chunk_size }
    }

    #[must_use]
    pub fn chunk_size(&self) -> NonZeroUsize {
        self.chunk_size
    }

    /// Distinct accounts in ascending order.
    ///
    /// # Errors
    /// Returns [`DedupError::Storage`] when accounts cannot be listed.
    pub fn accounts(&self) -> Result<Vec<String>, DedupError> {
        let mut accounts = self.store.list_accounts()?;
        accounts.sort();
        accounts.dedup();
        Ok(accounts)
    }

    #[must_use]
    pub fn hosts(&self, account: &str) -> AccountHosts<'a, S> {
        self.hosts_after(account, None)
    }

    /// Resume a scan after `cursor`, typically [`AccountHosts::cursor`] from an earlier pass.
    #[must_use]
    pub fn hosts_after(&self, account: &str, cursor: Option<HostId>) -> AccountHosts<'a, S> {
        AccountHosts {
            store: self.store,
            account: account.to_string(),
            chunk_size: self.chunk_size,
            fetch_cursor: cursor,
            last_yielded: cursor,
            buffer: VecDeque::with_capacity(self.chunk_size.get()),
            exhausted: false,
            pages_fetched: 0,
        }
    }
}

/// Lazy, finite iterator over one account's hosts in ascending id order.
///
/// At most one page is buffered. A short page ends the scan without a further query.
#[derive(Debug)]
pub struct AccountHosts<'a, S: ?Sized> {
    store: &'a S,
    account: String,
    chunk_size: NonZeroUsize,
    fetch_cursor: Option<HostId>,
    last_yielded: Option<HostId>,
    buffer: VecDeque<Host>,
    exhausted: bool,
    pages_fetched: usize,
}

impl<S: HostStore + ?Sized> AccountHosts<'_, S> {
    /// Id of the last host handed out; pass to [`ChunkedAccountScanner::hosts_after`] to resume.
    #[must_use]
    pub fn cursor(&self) -> Option<HostId> {
        self.last_yielded
    }

    #[must_use]
    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    #[must_use]
    pub fn account(&self) -> &str {
        &self.account
    }

    fn fetch_page(&mut self) -> Result<(), DedupError> {
        let limit = self.chunk_size.get();
        let page = self.store.query_hosts(&self.account, self.fetch_cursor.as_ref(), limit)?;
        self.pages_fetched += 1;
        debug!(
            account = %self.account,
            page = self.pages_fetched,
            rows = page.len(),
            "fetched host page"
        );

        if page.len() < limit {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.fetch_cursor = Some(last.id);
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl<S: HostStore + ?Sized> Iterator for AccountHosts<'_, S> {
    type Item = Result<Host, DedupError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() {
            if self.exhausted {
                return None;
            }
            if let Err(err) = self.fetch_page() {
                self.exhausted = true;
                return Some(Err(err));
            }
        }

        let host = self.buffer.pop_front()?;
        self.last_yielded = Some(host.id);
        Some(Ok(host))
    }
}
