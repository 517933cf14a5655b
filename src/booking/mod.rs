pub mod admin;
pub mod availability;
pub mod calendar;
pub mod docs;
pub mod error;
pub mod ledger;
pub mod pricing;
pub mod rates;
pub mod workflow;

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};

use crate::notify::NotifyHub;
use crate::reconciler::Reconciler;
use crate::store::DocumentStore;

pub use admin::Admin;
pub use availability::AvailabilityChecker;
pub use calendar::CalendarStore;
pub use docs::Docs;
pub use error::{BookingError, UnavailableReason};
pub use ledger::{BookingLedger, LedgerReport, ReservationToken};
pub use pricing::{PricingCalculator, Quote};
pub use rates::RateResolver;
pub use workflow::ReservationWorkflow;

/// Source of "now". "Today" is the UTC calendar date.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock stuck at one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl FixedClock {
    /// Midnight UTC on `date`.
    pub fn on(date: NaiveDate) -> Self {
        Self(date.and_time(chrono::NaiveTime::MIN).and_utc())
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BookingConfig {
    /// Upper bound on any single store call.
    pub store_timeout: Duration,
    /// Inline retries of a compensating release before handing it to the reconciler.
    pub release_retries: u32,
    /// Reconciler passes before a release is parked for manual reconciliation.
    pub reconcile_max_attempts: u32,
}

impl Default for BookingConfig {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_millis(5_000),
            release_retries: 3,
            reconcile_max_attempts: 100,
        }
    }
}

/// The booking core, wired over one document store.
#[derive(Clone)]
pub struct Booking {
    pub calendar: CalendarStore,
    pub rates: RateResolver,
    pub pricing: PricingCalculator,
    pub availability: AvailabilityChecker,
    pub ledger: BookingLedger,
    pub workflow: ReservationWorkflow,
    pub admin: Admin,
    pub notify: Arc<NotifyHub>,
    pub reconciler: Arc<Reconciler>,
    pub clock: Arc<dyn Clock>,
}

impl Booking {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        notify: Arc<NotifyHub>,
        clock: Arc<dyn Clock>,
        config: BookingConfig,
    ) -> Self {
        let docs = Docs::new(store, config.store_timeout);
        let reconciler = Arc::new(Reconciler::new(docs.clone(), config.reconcile_max_attempts));
        let calendar = CalendarStore::new(docs.clone());
        let rates = RateResolver::new(docs.clone(), calendar.clone());
        let pricing = PricingCalculator::new(docs.clone(), rates.clone());
        let availability = AvailabilityChecker::new(docs.clone(), rates.clone());
        let ledger = BookingLedger::new(docs.clone(), calendar.clone());
        let workflow = ReservationWorkflow::new(
            docs.clone(),
            availability.clone(),
            pricing.clone(),
            ledger.clone(),
            notify.clone(),
            reconciler.clone(),
            clock.clone(),
            config.release_retries,
        );
        let admin = Admin::new(docs, calendar.clone(), clock.clone());
        Self {
            calendar,
            rates,
            pricing,
            availability,
            ledger,
            workflow,
            admin,
            notify,
            reconciler,
            clock,
        }
    }

    pub async fn quote(
        &self,
        property_id: ulid::Ulid,
        check_in: NaiveDate,
        check_out: NaiveDate,
        guests: u32,
    ) -> Result<Quote, BookingError> {
        self.pricing
            .quote(property_id, check_in, check_out, guests, self.clock.today())
            .await
    }

    pub async fn check_availability(
        &self,
        property_id: ulid::Ulid,
        check_in: NaiveDate,
        check_out: NaiveDate,
        guests: u32,
    ) -> Result<crate::model::NightSet, BookingError> {
        self.availability
            .check_availability(property_id, check_in, check_out, guests, self.clock.today())
            .await
    }

    /// Queue releases for claims left behind by a crash between claiming and recording.
    /// Run before serving traffic.
    pub async fn recover_orphaned_claims(&self) -> Result<usize, BookingError> {
        let ids: Vec<ulid::Ulid> = self.admin.list_properties().await?.iter().map(|p| p.id).collect();
        self.reconciler.recover_orphans(&self.ledger, &ids).await
    }

    pub async fn verify_ledger(&self, property_id: ulid::Ulid) -> Result<LedgerReport, BookingError> {
        self.ledger.verify(property_id).await
    }
}
