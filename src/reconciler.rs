use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::booking::docs::{paths, to_doc, Docs};
use crate::booking::ledger::{BookingLedger, ReleaseOutcome, ReservationToken};
use crate::booking::BookingError;
use crate::model::NightSet;
use crate::observability;
use crate::store::{ConditionalWrite, Expect, WalStore};

/// A compensating release that hasn't gone through yet. Stored in the
/// `pending_releases` collection under the reservation id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRelease {
    pub property_id: Ulid,
    pub reservation_id: Ulid,
    pub nights: NightSet,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Out of attempts; left for an operator.
    #[serde(default)]
    pub parked: bool,
}

impl PendingRelease {
    fn new(token: &ReservationToken, last_error: Option<String>) -> Self {
        Self {
            property_id: token.property_id,
            reservation_id: token.reservation_id,
            nights: token.nights.clone(),
            attempts: 0,
            last_error,
            parked: false,
        }
    }

    pub fn token(&self) -> ReservationToken {
        ReservationToken::unconfirmed(self.property_id, self.reservation_id, self.nights.clone())
    }
}

/// Holds compensating releases that failed inline. They live in the store so a restart
/// picks them up again, and are retried until they succeed; after `max_attempts` they are
/// parked for manual reconciliation and logged at error level.
///
/// A release whose record can't be written (the store is usually what failed) is held in
/// memory and written on a later pass.
pub struct Reconciler {
    docs: Docs,
    unsaved: Mutex<Vec<PendingRelease>>,
    max_attempts: u32,
}

impl Reconciler {
    pub fn new(docs: Docs, max_attempts: u32) -> Self {
        Self {
            docs,
            unsaved: Mutex::new(Vec::new()),
            max_attempts: max_attempts.max(1),
        }
    }

    pub async fn enqueue(&self, token: &ReservationToken, error: Option<String>) {
        warn!(
            reservation_id = %token.reservation_id,
            property_id = %token.property_id,
            "compensating release queued for reconciliation"
        );
        self.keep(PendingRelease::new(token, error)).await;
    }

    /// Queued releases that are still being retried.
    pub async fn pending_count(&self) -> Result<usize, BookingError> {
        Ok(self.all().await?.iter().filter(|p| !p.parked).count())
    }

    /// Releases that exhausted their attempts.
    pub async fn needs_manual(&self) -> Result<Vec<PendingRelease>, BookingError> {
        Ok(self.all().await?.into_iter().filter(|p| p.parked).collect())
    }

    /// Stored releases plus any still waiting to be written.
    async fn all(&self) -> Result<Vec<PendingRelease>, BookingError> {
        let mut items: Vec<PendingRelease> = self.docs.scan(paths::PENDING_RELEASES).await?;
        for item in self.unsaved.lock().await.iter() {
            if !items.iter().any(|p| p.reservation_id == item.reservation_id) {
                items.push(item.clone());
            }
        }
        Ok(items)
    }

    async fn save(&self, item: &PendingRelease) -> Result<(), BookingError> {
        self.docs
            .write_if(ConditionalWrite::put(
                paths::PENDING_RELEASES,
                item.reservation_id.to_string(),
                Expect::Any,
                to_doc(item)?,
            ))
            .await
    }

    /// Write `item` back, or hold it in memory if the store refuses.
    async fn keep(&self, item: PendingRelease) {
        if let Err(e) = self.save(&item).await {
            warn!(reservation_id = %item.reservation_id, error = %e, "pending release not stored, holding it in memory");
            let mut unsaved = self.unsaved.lock().await;
            unsaved.retain(|p| p.reservation_id != item.reservation_id);
            unsaved.push(item);
        }
    }

    async fn forget(&self, item: &PendingRelease) {
        let delete = ConditionalWrite::delete(paths::PENDING_RELEASES, item.reservation_id.to_string(), Expect::Any);
        if let Err(e) = self.docs.write_if(delete).await {
            // The next pass releases nothing and clears it again.
            debug!(reservation_id = %item.reservation_id, error = %e, "resolved release not cleared");
        }
    }

    /// Retry every pending release once. Returns how many were resolved.
    pub async fn run_once(&self, ledger: &BookingLedger) -> usize {
        let mut batch = std::mem::take(&mut *self.unsaved.lock().await);
        match self.docs.scan::<PendingRelease>(paths::PENDING_RELEASES).await {
            Ok(stored) => {
                for item in stored {
                    if !batch.iter().any(|p| p.reservation_id == item.reservation_id) {
                        batch.push(item);
                    }
                }
            }
            Err(e) => warn!(error = %e, "could not load pending releases"),
        }

        let mut resolved = 0;
        let mut parked = 0u64;
        for mut item in batch {
            if item.parked {
                // Parked releases only need to reach the store.
                self.keep(item).await;
                continue;
            }
            match ledger.release_unless_recorded(&item.token()).await {
                Ok(outcome) => {
                    match outcome {
                        ReleaseOutcome::Released(n) => {
                            info!(reservation_id = %item.reservation_id, nights = n, "reconciled release")
                        }
                        ReleaseOutcome::Recorded => {
                            info!(reservation_id = %item.reservation_id, "reservation was recorded, nights kept")
                        }
                    }
                    self.forget(&item).await;
                    resolved += 1;
                }
                Err(e) => {
                    item.attempts += 1;
                    item.last_error = Some(e.to_string());
                    if item.attempts >= self.max_attempts {
                        error!(
                            reservation_id = %item.reservation_id,
                            property_id = %item.property_id,
                            nights = ?item.nights,
                            attempts = item.attempts,
                            error = %e,
                            "manual reconciliation required"
                        );
                        item.parked = true;
                        parked += 1;
                    } else {
                        debug!(reservation_id = %item.reservation_id, attempts = item.attempts, "release retry failed");
                    }
                    self.keep(item).await;
                }
            }
        }

        if parked > 0 {
            metrics::counter!(observability::RECONCILIATIONS_MANUAL_TOTAL).increment(parked);
        }
        if let Ok(n) = self.pending_count().await {
            metrics::gauge!(observability::RECONCILIATIONS_PENDING).set(n as f64);
        }
        resolved
    }

    /// Queue a release for every reservation id that holds Reserved nights without a
    /// reservation record. Only meaningful while no reservation is being created, i.e.
    /// at startup before connections are accepted. Returns how many were queued.
    pub async fn recover_orphans(&self, ledger: &BookingLedger, property_ids: &[Ulid]) -> Result<usize, BookingError> {
        let known: Vec<Ulid> = self.all().await?.iter().map(|p| p.reservation_id).collect();
        let mut queued = 0;
        for &property_id in property_ids {
            let report = ledger.verify(property_id).await?;
            let mut by_holder: BTreeMap<Ulid, NightSet> = BTreeMap::new();
            for (date, holder) in report.orphaned {
                by_holder.entry(holder).or_default().insert(date);
            }
            for (reservation_id, nights) in by_holder {
                if known.contains(&reservation_id) {
                    continue;
                }
                // A stored record means the mismatch is not a lost claim; verify reports it.
                if self.docs.get_raw(paths::RESERVATIONS, &reservation_id.to_string()).await?.is_some() {
                    continue;
                }
                let token = ReservationToken::unconfirmed(property_id, reservation_id, nights);
                self.enqueue(&token, Some("orphaned claim found at startup".into())).await;
                queued += 1;
            }
        }
        Ok(queued)
    }
}

/// Background task retrying queued compensating releases.
pub async fn run_reconciler(reconciler: Arc<Reconciler>, ledger: BookingLedger, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        reconciler.run_once(&ledger).await;
    }
}

/// Background task compacting the WAL once enough appends pile up.
pub async fn run_compactor(store: Arc<WalStore>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        if store.wal_appends_since_compact().await < threshold {
            continue;
        }
        match store.compact_wal().await {
            Ok(()) => info!("WAL compacted"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
