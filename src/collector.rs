//! Request/response correlation.
//!
//! Each [`StanzaCollector`] owns one entry in the [`PendingTable`]. The reader offers
//! every inbound stanza to the table; the first entry (in registration order) whose filter
//! accepts it is removed and completed, so one stanza satisfies at most one collector.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{Error, Result, StateError, TimeoutError};
use crate::filter::StanzaFilter;
use crate::stanza::Stanza;

type Delivery = std::result::Result<Stanza, Error>;

struct PendingEntry {
    id: u64,
    filter: Box<dyn StanzaFilter>,
    tx: oneshot::Sender<Delivery>,
}

#[derive(Default)]
pub struct PendingTable {
    entries: Mutex<Vec<PendingEntry>>,
    next_id: AtomicU64,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<PendingEntry>> {
        match self.entries.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn register(&self, filter: Box<dyn StanzaFilter>) -> (u64, oneshot::Receiver<Delivery>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.lock().push(PendingEntry { id, filter, tx });
        (id, rx)
    }

    /// Complete the first matching entry. Returns whether any collector took the stanza.
    pub fn deliver(&self, stanza: &Stanza) -> bool {
        let entry = {
            let mut entries = self.lock();
            let Some(pos) = entries.iter().position(|e| e.filter.accept(stanza)) else {
                return false;
            };
            entries.remove(pos)
        };
        debug!(collector = entry.id, id = ?stanza.id(), "Stanza matched collector");
        // A receiver dropped concurrently simply discards the stanza.
        let _ = entry.tx.send(Ok(stanza.clone()));
        true
    }

    fn remove(&self, id: u64) {
        self.lock().retain(|e| e.id != id);
    }

    /// Fail every outstanding entry with `err`.
    pub fn fail_all(&self, err: Error) {
        let drained: Vec<PendingEntry> = std::mem::take(&mut *self.lock());
        if !drained.is_empty() {
            debug!(count = drained.len(), error = %err, "Failing outstanding collectors");
        }
        for entry in drained {
            let _ = entry.tx.send(Err(err.clone()));
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Waits for the one stanza matching its filter.
pub struct StanzaCollector {
    id: u64,
    rx: Option<oneshot::Receiver<Delivery>>,
    table: Arc<PendingTable>,
    cancelled: bool,
}

impl StanzaCollector {
    pub fn new(table: &Arc<PendingTable>, filter: impl StanzaFilter + 'static) -> Self {
        let (id, rx) = table.register(Box::new(filter));
        Self {
            id,
            rx: Some(rx),
            table: table.clone(),
            cancelled: false,
        }
    }

    /// Wait at most `timeout` for the matching stanza.
    ///
    /// An error-typed stanza is returned as [`Error::Stanza`]. After expiry the entry is
    /// withdrawn; a stanza that raced in just before withdrawal is still returned.
    pub async fn next_result(&mut self, timeout: Duration) -> Result<Stanza> {
        let Some(rx) = self.rx.as_mut() else {
            return Err(StateError::CollectorCancelled.into());
        };

        let delivery = match tokio::time::timeout(timeout, &mut *rx).await {
            Ok(Ok(delivery)) => delivery,
            Ok(Err(_)) => {
                self.rx = None;
                return Err(self.closed_error());
            }
            Err(_) => {
                self.table.remove(self.id);
                match rx.try_recv() {
                    Ok(delivery) => delivery,
                    Err(_) => {
                        self.rx = None;
                        return Err(TimeoutError::new("waiting for reply", timeout).into());
                    }
                }
            }
        };
        self.rx = None;

        let stanza = delivery?;
        match stanza.error() {
            Some(err) => Err(err.into()),
            None => Ok(stanza),
        }
    }

    /// Withdraw from the table. A stanza matched before this call is still returned by
    /// the next [`next_result`](Self::next_result).
    pub fn cancel(&mut self) {
        self.cancelled = true;
        self.table.remove(self.id);
    }

    fn closed_error(&self) -> Error {
        if self.cancelled {
            StateError::CollectorCancelled.into()
        } else {
            StateError::NotConnected.into()
        }
    }
}

impl Drop for StanzaCollector {
    fn drop(&mut self) {
        if self.rx.is_some() {
            self.table.remove(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Element, NS_CLIENT};
    use crate::error::StanzaError;
    use crate::filter::IdFilter;
    use std::time::Instant;

    fn parse(xml: &str) -> Stanza {
        Stanza::from_element(Element::parse(xml, NS_CLIENT).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_result_reply_completes_collector() {
        let table = Arc::new(PendingTable::new());
        let mut collector = StanzaCollector::new(&table, IdFilter("q1".into()));
        assert!(table.deliver(&parse("<iq type='result' id='q1'/>")));
        let reply = collector.next_result(Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply.id(), Some("q1"));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_error_reply_carries_condition() {
        let table = Arc::new(PendingTable::new());
        let mut collector = StanzaCollector::new(&table, IdFilter("q1".into()));
        table.deliver(&parse(
            "<iq type='error' id='q1'><error type='cancel'><item-not-found xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></iq>",
        ));
        match collector.next_result(Duration::from_secs(1)).await {
            Err(Error::Stanza(StanzaError { condition, error_type, .. })) => {
                assert_eq!(condition, "item-not-found");
                assert_eq!(error_type, "cancel");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_is_bounded() {
        let table = Arc::new(PendingTable::new());
        let mut collector = StanzaCollector::new(&table, IdFilter("never".into()));
        let timeout = Duration::from_millis(100);
        let started = Instant::now();
        let err = collector.next_result(timeout).await.unwrap_err();
        let elapsed = started.elapsed();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_millis(500));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_disjoint_collectors_do_not_cross() {
        let table = Arc::new(PendingTable::new());
        let mut a = StanzaCollector::new(&table, IdFilter("a".into()));
        let mut b = StanzaCollector::new(&table, IdFilter("b".into()));
        table.deliver(&parse("<iq type='result' id='b'/>"));
        assert!(a.next_result(Duration::from_millis(50)).await.is_err());
        assert_eq!(b.next_result(Duration::from_secs(1)).await.unwrap().id(), Some("b"));
    }

    #[tokio::test]
    async fn test_first_registered_match_wins_once() {
        let table = Arc::new(PendingTable::new());
        let mut first = StanzaCollector::new(&table, IdFilter("x".into()));
        let mut second = StanzaCollector::new(&table, IdFilter("x".into()));
        let stanza = parse("<message id='x'/>");
        assert!(table.deliver(&stanza));
        assert!(first.next_result(Duration::from_secs(1)).await.is_ok());
        assert_eq!(table.len(), 1);
        assert!(table.deliver(&stanza));
        assert!(second.next_result(Duration::from_secs(1)).await.is_ok());
        assert!(!table.deliver(&stanza));
    }

    #[tokio::test]
    async fn test_cancel_is_not_retroactive() {
        let table = Arc::new(PendingTable::new());
        let mut matched = StanzaCollector::new(&table, IdFilter("m".into()));
        table.deliver(&parse("<iq type='result' id='m'/>"));
        matched.cancel();
        assert!(matched.next_result(Duration::from_millis(50)).await.is_ok());

        let mut unmatched = StanzaCollector::new(&table, IdFilter("u".into()));
        unmatched.cancel();
        assert!(!table.deliver(&parse("<iq type='result' id='u'/>")));
        assert!(matches!(
            unmatched.next_result(Duration::from_millis(50)).await,
            Err(Error::State(StateError::CollectorCancelled))
        ));
    }

    #[tokio::test]
    async fn test_fail_all_wakes_waiters() {
        let table = Arc::new(PendingTable::new());
        let mut collector = StanzaCollector::new(&table, IdFilter("q".into()));
        let t2 = table.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            t2.fail_all(StateError::NotConnected.into());
        });
        let err = collector.next_result(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, Error::State(StateError::NotConnected)));
    }

    #[test]
    fn test_drop_withdraws_entry() {
        let table = Arc::new(PendingTable::new());
        {
            let _collector = StanzaCollector::new(&table, IdFilter("d".into()));
            assert_eq!(table.len(), 1);
        }
        assert!(table.is_empty());
    }
}
