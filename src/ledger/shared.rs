// SharedLedger - one lock around the ledger for transfers and cleanup

use super::spend_ledger::{CleanupReport, DoubleSpendLedger};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Current wall-clock time in Unix milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Cloneable handle to a ledger shared between transfers
///
/// Reconciliation and cleanup both take the same async lock, so a sweep
/// never interleaves with a reconcile on the same instance.
#[derive(Clone, Debug)]
pub struct SharedLedger {
    inner: Arc<Mutex<DoubleSpendLedger>>,
}

impl SharedLedger {
    pub fn new(ledger: DoubleSpendLedger) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ledger)),
        }
    }

    /// Exclusive access for a sequence of ledger calls
    pub async fn lock(&self) -> MutexGuard<'_, DoubleSpendLedger> {
        self.inner.lock().await
    }

    /// Run a cleanup sweep now
    pub async fn cleanup_now(&self) -> Result<CleanupReport, super::LedgerError> {
        self.inner.lock().await.perform_cleanup(now_millis())
    }

    /// Sweep expired receipts every `interval` until the handle is aborted
    pub fn spawn_cleanup_task(&self, interval: Duration) -> JoinHandle<()> {
        let ledger = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match ledger.cleanup_now().await {
                    Ok(report) => debug!(removed = report.removed, "Periodic ledger cleanup"),
                    Err(e) => error!(error = %e, "Periodic ledger cleanup failed"),
                }
            }
        })
    }
}
