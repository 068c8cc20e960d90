// ── RPC correlator ──
//
// Matches asynchronous replies to the calls that caused them. Each call
// registers a pending entry keyed by a strictly increasing id and
// suspends on its own oneshot. The dispatch task resolves entries as
// replies arrive; session loss fails every entry at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use shelly_api::ReplyOutcome;

use crate::error::CoreError;

/// What a pending call eventually receives.
pub type ReplyResult = Result<ReplyOutcome, CoreError>;

/// Marks a reply as a full snapshot the dispatch path applies to the
/// state tree before waking the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotTarget {
    Config,
    Status,
    DynamicComponents,
}

/// One outstanding call.
#[derive(Debug)]
pub struct PendingRequest {
    pub id: u64,
    pub method: String,
    pub submitted_at: Instant,
    pub timeout: Duration,
    pub target: Option<SnapshotTarget>,
    slot: oneshot::Sender<ReplyResult>,
}

impl PendingRequest {
    /// Wake the caller. A caller that already gave up is ignored.
    pub fn complete(self, result: ReplyResult) {
        let _ = self.slot.send(result);
    }
}

#[derive(Debug)]
struct Table {
    open: bool,
    pending: HashMap<u64, PendingRequest>,
}

/// Id allocator plus the id → pending-call table.
#[derive(Debug)]
pub struct Correlator {
    next_id: AtomicU64,
    table: Mutex<Table>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    /// A closed table; [`reopen`](Self::reopen) it once a link is up.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            table: Mutex::new(Table {
                open: false,
                pending: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate an id and register a pending entry for it.
    ///
    /// Fails with [`CoreError::Disconnected`] when the table is closed, so
    /// a call racing a disconnect never waits forever.
    pub fn register(
        &self,
        method: &str,
        timeout: Duration,
        target: Option<SnapshotTarget>,
    ) -> Result<(u64, oneshot::Receiver<ReplyResult>), CoreError> {
        let mut table = self.lock();
        if !table.open {
            return Err(CoreError::Disconnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (slot, rx) = oneshot::channel();
        table.pending.insert(
            id,
            PendingRequest {
                id,
                method: method.to_owned(),
                submitted_at: Instant::now(),
                timeout,
                target,
                slot,
            },
        );
        Ok((id, rx))
    }

    /// Remove and return the entry for a reply id.
    pub fn take(&self, id: u64) -> Option<PendingRequest> {
        self.lock().pending.remove(&id)
    }

    /// Drop an entry without completing it (timeout, send failure).
    pub fn cancel(&self, id: u64) {
        self.lock().pending.remove(&id);
    }

    /// Close the table and fail everything pending with `Disconnected`.
    ///
    /// Returns how many calls were failed.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut table = self.lock();
            table.open = false;
            table.pending.drain().map(|(_, p)| p).collect()
        };
        let count = drained.len();
        for pending in drained {
            tracing::debug!(id = pending.id, method = %pending.method, "failing pending call");
            pending.complete(Err(CoreError::Disconnected));
        }
        count
    }

    /// Accept registrations again. Ids keep increasing across reopenings.
    pub fn reopen(&self) {
        self.lock().open = true;
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    const T: Duration = Duration::from_secs(10);

    fn open() -> Correlator {
        let c = Correlator::new();
        c.reopen();
        c
    }

    #[test]
    fn closed_table_rejects_registration() {
        let c = Correlator::new();
        assert!(matches!(
            c.register("Shelly.GetStatus", T, None),
            Err(CoreError::Disconnected)
        ));
    }

    #[test]
    fn ids_strictly_increase() {
        let c = open();
        let (a, _ra) = c.register("A", T, None).unwrap();
        let (b, _rb) = c.register("B", T, None).unwrap();
        c.take(a);
        let (d, _rd) = c.register("C", T, None).unwrap();
        assert_eq!(a, 1);
        assert!(a < b && b < d);
    }

    #[tokio::test]
    async fn replies_resolve_their_own_id() {
        let c = open();
        let (a, ra) = c.register("A", T, None).unwrap();
        let (b, rb) = c.register("B", T, None).unwrap();

        c.take(b)
            .unwrap()
            .complete(Ok(ReplyOutcome::Result(json!("b"))));
        c.take(a)
            .unwrap()
            .complete(Ok(ReplyOutcome::Result(json!("a"))));

        assert_eq!(ra.await.unwrap().unwrap(), ReplyOutcome::Result(json!("a")));
        assert_eq!(rb.await.unwrap().unwrap(), ReplyOutcome::Result(json!("b")));
        assert_eq!(c.pending_count(), 0);
    }

    #[tokio::test]
    async fn fail_all_fails_every_pending_call_and_closes() {
        let c = open();
        let (_, ra) = c.register("A", T, None).unwrap();
        let (_, rb) = c.register("B", T, Some(SnapshotTarget::Status)).unwrap();

        assert_eq!(c.fail_all(), 2);
        assert!(matches!(ra.await.unwrap(), Err(CoreError::Disconnected)));
        assert!(matches!(rb.await.unwrap(), Err(CoreError::Disconnected)));
        assert!(!c.is_open());
        assert!(c.register("C", T, None).is_err());
    }

    #[test]
    fn reply_slot_stays_pending_until_completed() {
        let c = open();
        let (id, rx) = c.register("A", T, None).unwrap();
        let mut rx = tokio_test::task::spawn(rx);
        tokio_test::assert_pending!(rx.poll());

        c.take(id)
            .unwrap()
            .complete(Ok(ReplyOutcome::Result(json!(1))));
        assert!(rx.is_woken());
        let out = tokio_test::assert_ready!(rx.poll());
        assert_eq!(out.unwrap().unwrap(), ReplyOutcome::Result(json!(1)));
    }

    #[test]
    fn take_unknown_id_is_none() {
        let c = open();
        assert!(c.take(42).is_none());
    }

    #[test]
    fn cancel_removes_entry() {
        let c = open();
        let (id, _rx) = c.register("A", T, None).unwrap();
        c.cancel(id);
        assert!(c.take(id).is_none());
    }
}
