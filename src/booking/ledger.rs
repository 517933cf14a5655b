use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use tracing::{debug, info, warn};
use ulid::Ulid;

use super::calendar::{CalendarEntry, CalendarStore};
use super::docs::{from_doc, paths, Docs};
use super::error::BookingError;
use crate::model::{CalendarDay, DayState, NightSet, Reservation};
use crate::observability;
use crate::store::{ConditionalWrite, Document, Expect};

/// Re-reads allowed when the calendar moves under a release.
const RELEASE_CAS_ATTEMPTS: u32 = 5;

/// Proof of a successful claim: the nights now Reserved for `reservation_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReservationToken {
    pub property_id: Ulid,
    pub reservation_id: Ulid,
    pub nights: NightSet,
    /// Documents written by the claim, keyed by date id. Empty for tokens rebuilt from a
    /// stored reservation.
    claimed: Vec<(String, Document)>,
}

impl ReservationToken {
    /// Token covering the nights of an existing reservation.
    pub fn for_reservation(reservation: &Reservation) -> Self {
        Self {
            property_id: reservation.property_id,
            reservation_id: reservation.id,
            nights: reservation.nights(),
            claimed: Vec::new(),
        }
    }

    /// Token for a claim whose outcome isn't known, such as one that timed out or one
    /// found orphaned after a restart. Releasing it frees only nights Reserved for
    /// `reservation_id`.
    pub fn unconfirmed(property_id: Ulid, reservation_id: Ulid, nights: NightSet) -> Self {
        Self {
            property_id,
            reservation_id,
            nights,
            claimed: Vec::new(),
        }
    }

    /// True unless this token came straight from a successful `try_reserve`.
    pub fn is_unconfirmed(&self) -> bool {
        self.claimed.is_empty()
    }

    /// Writes that succeed only while every claimed night is still exactly as the claim
    /// left it. Appended to the reservation write so a record can't outlive its claim.
    pub fn still_held(&self) -> Vec<ConditionalWrite> {
        let collection = paths::calendar(self.property_id);
        self.claimed
            .iter()
            .map(|(id, doc)| ConditionalWrite::put(collection.clone(), id.clone(), Expect::Equals(doc.clone()), doc.clone()))
            .collect()
    }
}

/// What a guarded release found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// This many nights went back to Open.
    Released(usize),
    /// The reservation record exists after all; the nights are legitimately held.
    Recorded,
}

/// Discrepancies between Reserved days and non-cancelled reservations of a property.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerReport {
    /// Reserved days no live reservation accounts for.
    pub orphaned: Vec<(NaiveDate, Ulid)>,
    /// Nights of live reservations that aren't Reserved for them.
    pub missing: Vec<(NaiveDate, Ulid)>,
    /// Nights claimed by more than one live reservation.
    pub double_booked: Vec<NaiveDate>,
}

impl LedgerReport {
    pub fn is_consistent(&self) -> bool {
        self.orphaned.is_empty() && self.missing.is_empty() && self.double_booked.is_empty()
    }
}

/// The only component that moves calendar days into or out of Reserved.
#[derive(Clone)]
pub struct BookingLedger {
    docs: Docs,
    calendar: CalendarStore,
}

impl BookingLedger {
    pub fn new(docs: Docs, calendar: CalendarStore) -> Self {
        Self { docs, calendar }
    }

    /// Atomically claim every night in `nights` for `reservation_id`.
    ///
    /// Each night's Reserved write is conditioned on the exact state read, and the whole
    /// set goes in one batch: either all nights flip or none do. Per-day overrides and
    /// notes are kept so a later release restores the day exactly.
    pub async fn try_reserve(
        &self,
        property_id: Ulid,
        reservation_id: Ulid,
        nights: &NightSet,
    ) -> Result<ReservationToken, BookingError> {
        let (Some(first), Some(last)) = (nights.first(), nights.last()) else {
            return Err(BookingError::validation("no nights to reserve"));
        };
        let stored = self.calendar.stored_days(property_id, *first, *last).await?;

        let mut writes = Vec::with_capacity(nights.len());
        let mut claimed = Vec::with_capacity(nights.len());
        let mut taken = Vec::new();
        for date in nights {
            let entry = stored
                .get(date)
                .cloned()
                .unwrap_or_else(|| CalendarEntry::absent(*date));
            if !entry.day.is_open() {
                taken.push(*date);
                continue;
            }
            let next = entry.day.with_state(DayState::Reserved { reservation_id });
            let write = entry.transition(property_id, &next)?;
            if let Some(doc) = &write.new {
                claimed.push((write.id.clone(), doc.clone()));
            }
            writes.push(write);
        }

        if !taken.is_empty() {
            metrics::counter!(observability::LEDGER_CONFLICTS_TOTAL).increment(1);
            warn!(%property_id, %reservation_id, dates = ?taken, "claim lost: nights already taken");
            return Err(BookingError::Conflict { dates: taken });
        }

        match self.docs.write_all_if(writes).await {
            Ok(()) => {
                debug!(%property_id, %reservation_id, nights = nights.len(), "nights claimed");
                Ok(ReservationToken {
                    property_id,
                    reservation_id,
                    nights: nights.clone(),
                    claimed,
                })
            }
            Err(e @ BookingError::Conflict { .. }) => {
                metrics::counter!(observability::LEDGER_CONFLICTS_TOTAL).increment(1);
                warn!(%property_id, %reservation_id, error = %e, "claim lost a race");
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Writes returning the token's nights to Open. Nights not Reserved for this
    /// reservation are skipped, which is what makes release idempotent.
    pub async fn release_writes(&self, token: &ReservationToken) -> Result<Vec<ConditionalWrite>, BookingError> {
        let (Some(first), Some(last)) = (token.nights.first(), token.nights.last()) else {
            return Ok(Vec::new());
        };
        let stored = self.calendar.stored_days(token.property_id, *first, *last).await?;
        let mut writes = Vec::new();
        for date in &token.nights {
            let Some(entry) = stored.get(date) else { continue };
            if entry.day.state == (DayState::Reserved { reservation_id: token.reservation_id }) {
                writes.push(entry.transition(token.property_id, &entry.day.with_state(DayState::Open))?);
            }
        }
        Ok(writes)
    }

    /// Reserved → Open for the token's nights, in one batch. Releasing nights that are
    /// already free is a no-op.
    pub async fn release(&self, token: &ReservationToken) -> Result<usize, BookingError> {
        match self.release_guarded(token, None).await? {
            ReleaseOutcome::Released(n) => Ok(n),
            ReleaseOutcome::Recorded => Ok(0),
        }
    }

    /// Compensating release after a failed reservation write. The batch also asserts the
    /// reservation record is absent; if the record turns out to exist the nights stay held.
    pub async fn release_unless_recorded(&self, token: &ReservationToken) -> Result<ReleaseOutcome, BookingError> {
        let guard = ConditionalWrite::delete(paths::RESERVATIONS, token.reservation_id.to_string(), Expect::Absent);
        self.release_guarded(token, Some(guard)).await
    }

    async fn release_guarded(
        &self,
        token: &ReservationToken,
        guard: Option<ConditionalWrite>,
    ) -> Result<ReleaseOutcome, BookingError> {
        let mut last_conflict = None;
        for attempt in 0..RELEASE_CAS_ATTEMPTS {
            let mut writes = self.release_writes(token).await?;
            let count = writes.len();
            if count == 0 {
                return Ok(ReleaseOutcome::Released(0));
            }
            if let Some(g) = &guard {
                writes.push(g.clone());
            }
            match self.docs.write_all_if(writes).await {
                Ok(()) => {
                    metrics::counter!(observability::LEDGER_RELEASES_TOTAL).increment(1);
                    info!(
                        property_id = %token.property_id,
                        reservation_id = %token.reservation_id,
                        nights = count,
                        "nights released"
                    );
                    return Ok(ReleaseOutcome::Released(count));
                }
                Err(e @ BookingError::Conflict { .. }) => {
                    if guard.is_some()
                        && self
                            .docs
                            .get_raw(paths::RESERVATIONS, &token.reservation_id.to_string())
                            .await?
                            .is_some()
                    {
                        return Ok(ReleaseOutcome::Recorded);
                    }
                    debug!(attempt, reservation_id = %token.reservation_id, "calendar moved during release, re-reading");
                    last_conflict = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_conflict.unwrap_or(BookingError::Conflict { dates: Vec::new() }))
    }

    /// Compare Reserved days against the night sets of non-cancelled reservations.
    pub async fn verify(&self, property_id: Ulid) -> Result<LedgerReport, BookingError> {
        let mut actual: BTreeMap<NaiveDate, Ulid> = BTreeMap::new();
        for (_, raw) in self.docs.scan_raw(&paths::calendar(property_id), None, None).await? {
            let day: CalendarDay = from_doc(raw)?;
            if let DayState::Reserved { reservation_id } = day.state {
                actual.insert(day.date, reservation_id);
            }
        }

        let mut expected: BTreeMap<NaiveDate, Vec<Ulid>> = BTreeMap::new();
        let reservations: Vec<Reservation> = self.docs.scan(paths::RESERVATIONS).await?;
        let live: HashMap<Ulid, &Reservation> = reservations
            .iter()
            .filter(|r| r.property_id == property_id && r.status.holds_nights())
            .map(|r| (r.id, r))
            .collect();
        for r in live.values() {
            for night in r.nights() {
                expected.entry(night).or_default().push(r.id);
            }
        }

        let mut report = LedgerReport::default();
        for (date, owners) in &expected {
            if owners.len() > 1 {
                report.double_booked.push(*date);
            }
            for owner in owners {
                if actual.get(date) != Some(owner) {
                    report.missing.push((*date, *owner));
                }
            }
        }
        for (date, holder) in &actual {
            let accounted = live.get(holder).is_some_and(|r| r.nights().contains(date));
            if !accounted {
                report.orphaned.push((*date, *holder));
            }
        }
        report.missing.sort();
        Ok(report)
    }
}
