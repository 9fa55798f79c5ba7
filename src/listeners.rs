//! Standing subscriptions: stanza listeners and connection lifecycle listeners.

use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, Instrument};

use crate::error::Error;
use crate::filter::StanzaFilter;
use crate::stanza::Stanza;

pub type StanzaCallback = Arc<dyn Fn(&Stanza) + Send + Sync>;

struct ListenerEntry {
    filter: Box<dyn StanzaFilter>,
    callback: StanzaCallback,
}

/// Ordered `(filter, callback)` pairs. Append-only; every entry sees every stanza.
#[derive(Default)]
pub struct ListenerRegistry {
    entries: RwLock<Vec<Arc<ListenerEntry>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, filter: impl StanzaFilter + 'static, callback: StanzaCallback) {
        let entry = Arc::new(ListenerEntry {
            filter: Box::new(filter),
            callback,
        });
        match self.entries.write() {
            Ok(mut entries) => entries.push(entry),
            Err(poisoned) => poisoned.into_inner().push(entry),
        }
    }

    pub fn len(&self) -> usize {
        match self.entries.read() {
            Ok(entries) => entries.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every accepting listener, in registration order. Returns how many ran.
    pub fn dispatch(&self, stanza: &Stanza) -> usize {
        let snapshot: Vec<Arc<ListenerEntry>> = match self.entries.read() {
            Ok(entries) => entries.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let mut delivered = 0;
        for entry in snapshot.iter().filter(|e| e.filter.accept(stanza)) {
            (entry.callback)(stanza);
            delivered += 1;
        }
        delivered
    }
}

/// Run listener callbacks off the reader loop, in arrival order.
///
/// The task ends once every sender is dropped and the queue is drained.
pub fn spawn_dispatcher(
    registry: Arc<ListenerRegistry>,
    conn_id: u64,
) -> (mpsc::UnboundedSender<Stanza>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Stanza>();
    let task = tokio::spawn(
        async move {
            while let Some(stanza) = rx.recv().await {
                let delivered = registry.dispatch(&stanza);
                debug!(kind = ?stanza.kind(), id = ?stanza.id(), delivered, "Dispatched stanza to listeners");
            }
            debug!("Listener dispatch finished");
        }
        .instrument(tracing::debug_span!("dispatch", conn_id)),
    );
    (tx, task)
}

/// Lifecycle notifications. Every method defaults to a no-op.
pub trait ConnectionListener: Send + Sync {
    fn connected(&self) {}

    fn authenticated(&self, _resumed: bool) {}

    /// Orderly shutdown.
    fn connection_closed(&self) {}

    /// Abrupt loss of the connection. Fired once per failure.
    fn connection_closed_on_error(&self, _error: &Error) {}

    /// An automatic re-login after an abrupt loss succeeded.
    fn reconnection_successful(&self) {}
}
