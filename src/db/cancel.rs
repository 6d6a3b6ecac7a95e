// Query Cancellation
// Tracks the in-flight queries of a connection so a concurrent cancel can stop them

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};

use crate::db::traits::DatabaseError;

/// Outcome of racing a query against a cancel signal
#[derive(Debug)]
pub enum Raced<T> {
    Completed(T),
    Cancelled,
}

/// Identifies one in-flight query within a `CancelSlot`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryTicket(u64);

/// A query taken out of the slot by `take_pending`. The engine hook is
/// fired first, then `signal` drops the caller's future.
pub struct PendingQuery<H> {
    ticket: QueryTicket,
    tx: oneshot::Sender<()>,
    hook: Option<H>,
}

impl<H> PendingQuery<H> {
    pub fn ticket(&self) -> QueryTicket {
        self.ticket
    }

    /// Engine-side cancel handle the query attached, if it got that far
    pub fn hook(&self) -> Option<&H> {
        self.hook.as_ref()
    }

    pub fn signal(self) -> bool {
        let delivered = self.tx.send(()).is_ok();
        tracing::info!(ticket = self.ticket.0, delivered, "cancel signal sent");
        delivered
    }
}

/// In-flight queries of one driver, keyed by ticket. `H` is whatever the
/// engine needs to stop a statement server-side (a cancel token, a thread id).
pub struct CancelSlot<H = ()> {
    pending: Mutex<HashMap<QueryTicket, (oneshot::Sender<()>, Option<H>)>>,
    next_ticket: AtomicU64,
}

impl<H> Default for CancelSlot<H> {
    fn default() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(0),
        }
    }
}

impl<H> CancelSlot<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the query built by `query`, returning `Raced::Cancelled` if a
    /// cancel takes it first. The query future is dropped on cancellation,
    /// which releases whatever connection it was holding.
    pub async fn run<F, Fut, T>(&self, query: F) -> Raced<T>
    where
        F: FnOnce(QueryTicket) -> Fut,
        Fut: Future<Output = T>,
    {
        let ticket = QueryTicket(self.next_ticket.fetch_add(1, Ordering::SeqCst));
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        self.pending.lock().await.insert(ticket, (cancel_tx, None));

        let outcome = tokio::select! {
            biased;

            // If cancel signal received, drop the query future
            Ok(()) = cancel_rx => {
                tracing::warn!(ticket = ticket.0, "query cancelled, dropping in-flight future");
                Raced::Cancelled
            }

            // Normal query execution
            result = query(ticket) => Raced::Completed(result),
        };

        // A query taken by `take_pending` was cancelled even if the engine
        // answered with its own error before the signal arrived
        let still_pending = self.pending.lock().await.remove(&ticket).is_some();
        match outcome {
            Raced::Completed(_) if !still_pending => Raced::Cancelled,
            outcome => outcome,
        }
    }

    /// Record the engine hook for a running query. Ignored once the query
    /// has been taken for cancellation.
    pub async fn attach(&self, ticket: QueryTicket, hook: H) {
        if let Some((_, slot)) = self.pending.lock().await.get_mut(&ticket) {
            *slot = Some(hook);
        }
    }

    /// Remove every in-flight query so the caller can stop each one
    pub async fn take_pending(&self) -> Vec<PendingQuery<H>> {
        self.pending
            .lock()
            .await
            .drain()
            .map(|(ticket, (tx, hook))| PendingQuery { ticket, tx, hook })
            .collect()
    }

    /// Signal every in-flight query. Returns whether any was signalled.
    pub async fn cancel(&self) -> bool {
        signal_all(self.take_pending().await)
    }
}

/// Signal each taken query. Returns whether any was still waiting.
pub fn signal_all<H>(pending: Vec<PendingQuery<H>>) -> bool {
    pending.into_iter().fold(false, |any, query| query.signal() || any)
}

/// Bound `query` by the configured query timeout, if any
pub async fn with_deadline<F, T>(timeout: Option<Duration>, query: F) -> Result<T, DatabaseError>
where
    F: Future<Output = Result<T, DatabaseError>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, query).await.map_err(|_| {
            DatabaseError::QueryError(format!("Query timed out after {}s", limit.as_secs()))
        })?,
        None => query.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    async fn wait_for_pending<H>(slot: &CancelSlot<H>, count: usize) {
        for _ in 0..200 {
            if slot.pending.lock().await.len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_completed_query_passes_through() {
        let slot: CancelSlot = CancelSlot::new();
        let outcome = slot.run(|_| async { 42 }).await;
        assert!(matches!(outcome, Raced::Completed(42)));
        assert!(!slot.cancel().await);
    }

    #[tokio::test]
    async fn test_cancel_stops_pending_query() {
        let slot: Arc<CancelSlot> = Arc::new(CancelSlot::new());
        let runner = Arc::clone(&slot);
        let handle = tokio::spawn(async move {
            runner
                .run(|_| async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    1
                })
                .await
        });

        wait_for_pending(&slot, 1).await;
        assert!(slot.cancel().await);
        let outcome = handle.await.unwrap();
        assert!(matches!(outcome, Raced::Cancelled));
    }

    #[tokio::test]
    async fn test_overlapping_queries_keep_their_own_hooks() {
        let slot: Arc<CancelSlot<&'static str>> = Arc::new(CancelSlot::new());
        let mut handles = Vec::new();
        for hook in ["first", "second"] {
            let runner = Arc::clone(&slot);
            handles.push(tokio::spawn(async move {
                let attach_to = Arc::clone(&runner);
                runner
                    .run(|ticket| async move {
                        attach_to.attach(ticket, hook).await;
                        tokio::time::sleep(Duration::from_secs(30)).await;
                    })
                    .await
            }));
        }

        wait_for_pending(&slot, 2).await;
        // Give both queries time to attach their hooks
        tokio::time::sleep(Duration::from_millis(50)).await;
        let pending = slot.take_pending().await;
        let mut hooks: Vec<&str> = pending.iter().filter_map(|p| p.hook().copied()).collect();
        hooks.sort();
        assert_eq!(hooks, vec!["first", "second"]);

        assert!(signal_all(pending));
        for handle in handles {
            assert!(matches!(handle.await.unwrap(), Raced::Cancelled));
        }
        assert!(!slot.cancel().await);
    }

    #[tokio::test]
    async fn test_taken_query_reports_cancelled_even_if_it_finishes() {
        let slot: Arc<CancelSlot> = Arc::new(CancelSlot::new());
        let runner = Arc::clone(&slot);
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            runner
                .run(|_| async move {
                    let _ = release_rx.await;
                    "engine said: canceling statement"
                })
                .await
        });

        wait_for_pending(&slot, 1).await;
        // The engine aborts the statement before the signal is sent
        let pending = slot.take_pending().await;
        release_tx.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        signal_all(pending);
        assert!(matches!(handle.await.unwrap(), Raced::Cancelled));
    }

    #[tokio::test]
    async fn test_attach_after_completion_is_ignored() {
        let slot: CancelSlot<u64> = CancelSlot::new();
        let outcome = slot.run(|ticket| async move { ticket }).await;
        let Raced::Completed(ticket) = outcome else {
            panic!("query should complete");
        };
        slot.attach(ticket, 7).await;
        assert!(slot.take_pending().await.is_empty());
    }

    #[tokio::test]
    async fn test_deadline_expires() {
        let outcome = with_deadline(Some(Duration::from_millis(10)), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, DatabaseError>(())
        })
        .await;
        assert!(matches!(outcome, Err(DatabaseError::QueryError(msg)) if msg.contains("timed out")));

        let passthrough = with_deadline(None, async { Ok::<_, DatabaseError>(7) }).await;
        assert_eq!(passthrough.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_double_cancel_is_harmless() {
        let slot: CancelSlot = CancelSlot::new();
        assert!(!slot.cancel().await);
        assert!(!slot.cancel().await);
    }
}
