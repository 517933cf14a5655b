use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn, Instrument};
use ulid::Ulid;

use super::availability::AvailabilityChecker;
use super::docs::{paths, to_doc, Docs};
use super::error::BookingError;
use super::ledger::{BookingLedger, ReleaseOutcome, ReservationToken};
use super::pricing::{PricingCalculator, Quote};
use super::Clock;
use crate::limits::{
    MAX_BOOKING_HORIZON_DAYS, MAX_EMAIL_LEN, MAX_GUESTS, MAX_NAME_LEN, MAX_NOTE_LEN, MAX_PHONE_LEN,
};
use crate::model::{
    GuestContact, PaymentStatus, Reservation, ReservationRequest, ReservationStatus,
};
use crate::notify::{BookingEvent, NotifyHub};
use crate::observability;
use crate::reconciler::Reconciler;
use crate::store::{ConditionalWrite, Expect};

/// Reservation-record CAS attempts for cancel and status changes.
const RECORD_CAS_ATTEMPTS: u32 = 5;
const RELEASE_BACKOFF_BASE: Duration = Duration::from_millis(50);

/// Stages of `create_reservation`, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validating,
    CheckingAvailability,
    Pricing,
    Reserving,
    Persisting,
    Done,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Validating => "validating",
            Stage::CheckingAvailability => "checking_availability",
            Stage::Pricing => "pricing",
            Stage::Reserving => "reserving",
            Stage::Persisting => "persisting",
            Stage::Done => "done",
        }
    }
}

fn valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !email.chars().any(char::is_whitespace)
}

fn valid_phone(phone: &str) -> bool {
    let allowed = phone
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, ' ' | '+' | '-' | '(' | ')' | '.'));
    allowed && phone.chars().filter(char::is_ascii_digit).count() >= 10
}

fn validate_contact(guest: &GuestContact) -> Result<(), BookingError> {
    let name = guest.name.trim();
    if name.chars().count() < 2 || name.len() > MAX_NAME_LEN {
        return Err(BookingError::validation("guest name must be 2 to 200 characters"));
    }
    if guest.email.len() > MAX_EMAIL_LEN || !valid_email(guest.email.trim()) {
        return Err(BookingError::validation("guest email is not a valid address"));
    }
    if guest.phone.len() > MAX_PHONE_LEN || !valid_phone(guest.phone.trim()) {
        return Err(BookingError::validation("guest phone must contain at least 10 digits"));
    }
    Ok(())
}

/// Shallow input checks: contact fields, guest count bounds, text sizes, booking horizon.
/// Business rules are left to availability.
pub fn validate_request(request: &ReservationRequest, today: chrono::NaiveDate) -> Result<(), BookingError> {
    validate_contact(&request.guest)?;
    if request.guests == 0 || request.guests > MAX_GUESTS {
        return Err(BookingError::validation(format!("guest count must be 1 to {MAX_GUESTS}")));
    }
    if let Some(text) = &request.special_requests
        && text.len() > MAX_NOTE_LEN
    {
        return Err(BookingError::validation("special requests too long"));
    }
    if (request.check_in - today).num_days() > MAX_BOOKING_HORIZON_DAYS {
        return Err(BookingError::validation("check-in is too far in the future"));
    }
    Ok(())
}

/// Entry point for guest bookings and reservation lifecycle changes.
#[derive(Clone)]
pub struct ReservationWorkflow {
    docs: Docs,
    availability: AvailabilityChecker,
    pricing: PricingCalculator,
    ledger: BookingLedger,
    notify: Arc<NotifyHub>,
    reconciler: Arc<Reconciler>,
    clock: Arc<dyn Clock>,
    release_retries: u32,
}

impl ReservationWorkflow {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        docs: Docs,
        availability: AvailabilityChecker,
        pricing: PricingCalculator,
        ledger: BookingLedger,
        notify: Arc<NotifyHub>,
        reconciler: Arc<Reconciler>,
        clock: Arc<dyn Clock>,
        release_retries: u32,
    ) -> Self {
        Self {
            docs,
            availability,
            pricing,
            ledger,
            notify,
            reconciler,
            clock,
            release_retries,
        }
    }

    /// Validate, check availability, price, claim the nights, then persist a Pending
    /// reservation. A failure after the claim releases it before the error is returned.
    pub async fn create_reservation(&self, request: ReservationRequest) -> Result<Ulid, BookingError> {
        let reservation_id = Ulid::new();
        let span = tracing::info_span!(
            "create_reservation",
            property_id = %request.property_id,
            %reservation_id
        );
        let result = self.create_in_span(reservation_id, request).instrument(span).await;
        match &result {
            Ok(_) => metrics::counter!(observability::RESERVATIONS_CREATED_TOTAL).increment(1),
            Err(e) => metrics::counter!(observability::RESERVATIONS_FAILED_TOTAL, "kind" => e.kind()).increment(1),
        }
        result
    }

    async fn create_in_span(&self, reservation_id: Ulid, request: ReservationRequest) -> Result<Ulid, BookingError> {
        let today = self.clock.today();
        let property_id = request.property_id;

        let mut stage = Stage::Validating;
        debug!(stage = stage.as_str());
        validate_request(&request, today)?;

        stage = Stage::CheckingAvailability;
        debug!(stage = stage.as_str());
        let nights = self
            .availability
            .check_availability(property_id, request.check_in, request.check_out, request.guests, today)
            .await?;

        stage = Stage::Pricing;
        debug!(stage = stage.as_str());
        let quote = self
            .pricing
            .quote(property_id, request.check_in, request.check_out, request.guests, today)
            .await?;

        stage = Stage::Reserving;
        debug!(stage = stage.as_str());
        let token = match self.ledger.try_reserve(property_id, reservation_id, &nights).await {
            Ok(token) => token,
            Err(cause @ BookingError::Persistence(_)) => {
                // The claim batch may have landed even though the store never answered.
                warn!(stage = stage.as_str(), error = %cause, "claim outcome unknown, releasing whatever landed");
                let token = ReservationToken::unconfirmed(property_id, reservation_id, nights);
                self.compensate(&token, &cause).await;
                return Err(cause);
            }
            Err(e) => return Err(e),
        };

        stage = Stage::Persisting;
        debug!(stage = stage.as_str());
        let reservation = self.build_reservation(reservation_id, request, &quote);
        if let Err(cause) = self.persist_new(&reservation, &token).await {
            warn!(stage = stage.as_str(), error = %cause, "persist failed, releasing claimed nights");
            if !self.compensate(&token, &cause).await {
                return Err(cause);
            }
            warn!("reservation write reported failure but was recorded");
        }

        stage = Stage::Done;
        info!(
            stage = stage.as_str(),
            nights = reservation.nights,
            total = %reservation.total_price,
            "reservation created"
        );
        self.notify.send(&BookingEvent::created(&reservation));
        Ok(reservation_id)
    }

    fn build_reservation(&self, id: Ulid, request: ReservationRequest, quote: &Quote) -> Reservation {
        let now = self.clock.now();
        Reservation {
            id,
            property_id: request.property_id,
            guest: GuestContact {
                name: request.guest.name.trim().to_string(),
                email: request.guest.email.trim().to_string(),
                phone: request.guest.phone.trim().to_string(),
            },
            check_in: request.check_in,
            check_out: request.check_out,
            guests: request.guests,
            nights: quote.night_count(),
            price_per_night: quote.average_nightly_price(),
            total_price: quote.total,
            currency: quote.currency.clone(),
            status: ReservationStatus::Pending,
            payment_status: PaymentStatus::Pending,
            special_requests: request.special_requests.filter(|s| !s.trim().is_empty()),
            created_at: now,
            updated_at: now,
        }
    }

    /// Write the record only while the claim is still exactly in place.
    async fn persist_new(&self, reservation: &Reservation, token: &ReservationToken) -> Result<(), BookingError> {
        let mut writes = vec![ConditionalWrite::put(
            paths::RESERVATIONS,
            reservation.id.to_string(),
            Expect::Absent,
            to_doc(reservation)?,
        )];
        writes.extend(token.still_held());
        self.docs.write_all_if(writes).await
    }

    /// Undo a claim whose reservation write failed, or whose own write went unanswered.
    /// Returns true if the reservation write had in fact landed (the nights are then
    /// rightly held). Retries inline with backoff, then hands the release to the
    /// reconciler; it is never dropped. An unconfirmed claim that had nothing to release
    /// yet is also handed over, since its batch can still land.
    async fn compensate(&self, token: &ReservationToken, cause: &BookingError) -> bool {
        let mut last_error = None;
        for attempt in 0..=self.release_retries {
            if attempt > 0 {
                tokio::time::sleep(RELEASE_BACKOFF_BASE * 2u32.saturating_pow(attempt - 1)).await;
            }
            match self.ledger.release_unless_recorded(token).await {
                Ok(ReleaseOutcome::Released(0)) if token.is_unconfirmed() => {
                    debug!(cause = %cause, "unconfirmed claim held nothing yet, queueing a later check");
                    self.reconciler.enqueue(token, None).await;
                    return false;
                }
                Ok(ReleaseOutcome::Released(n)) => {
                    info!(nights = n, cause = %cause, "claim released after failed persist");
                    return false;
                }
                Ok(ReleaseOutcome::Recorded) => return true,
                Err(e) => {
                    warn!(attempt, error = %e, "compensating release failed");
                    last_error = Some(e.to_string());
                }
            }
        }
        self.reconciler.enqueue(token, last_error).await;
        false
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<Option<Reservation>, BookingError> {
        self.docs.get(paths::RESERVATIONS, &id.to_string()).await
    }

    /// Reservations of a property, latest check-in first.
    pub async fn list_reservations(&self, property_id: Ulid) -> Result<Vec<Reservation>, BookingError> {
        let mut out: Vec<Reservation> = self
            .docs
            .scan::<Reservation>(paths::RESERVATIONS)
            .await?
            .into_iter()
            .filter(|r| r.property_id == property_id)
            .collect();
        out.sort_by(|a, b| b.check_in.cmp(&a.check_in).then(b.id.cmp(&a.id)));
        Ok(out)
    }

    /// Cancel and release the nights in one batch. Cancelling twice is a no-op.
    pub async fn cancel_reservation(&self, id: Ulid) -> Result<Reservation, BookingError> {
        let mut last_conflict = None;
        for _ in 0..RECORD_CAS_ATTEMPTS {
            let (reservation, raw) = self
                .docs
                .reservation(id)
                .await?
                .ok_or_else(|| BookingError::validation(format!("unknown reservation {id}")))?;
            if reservation.status == ReservationStatus::Cancelled {
                return Ok(reservation);
            }
            if !reservation.status.can_transition_to(ReservationStatus::Cancelled) {
                return Err(BookingError::validation(format!(
                    "a {} reservation can't be cancelled",
                    reservation.status.as_str()
                )));
            }

            let token = ReservationToken::for_reservation(&reservation);
            let mut writes = self.ledger.release_writes(&token).await?;
            let released = writes.len();
            let updated = Reservation {
                status: ReservationStatus::Cancelled,
                updated_at: self.clock.now(),
                ..reservation
            };
            writes.push(ConditionalWrite::put(
                paths::RESERVATIONS,
                id.to_string(),
                Expect::Equals(raw),
                to_doc(&updated)?,
            ));

            match self.docs.write_all_if(writes).await {
                Ok(()) => {
                    info!(reservation_id = %id, property_id = %updated.property_id, nights = released, "reservation cancelled");
                    metrics::counter!(observability::RESERVATIONS_CANCELLED_TOTAL).increment(1);
                    self.notify.send(&BookingEvent::cancelled(&updated));
                    return Ok(updated);
                }
                Err(e @ BookingError::Conflict { .. }) => {
                    debug!(reservation_id = %id, "reservation or calendar moved during cancel, retrying");
                    last_conflict = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_conflict.unwrap_or(BookingError::Conflict { dates: Vec::new() }))
    }

    /// Move a reservation along Pending → Confirmed → Completed, or cancel it.
    pub async fn update_status(&self, id: Ulid, status: ReservationStatus) -> Result<Reservation, BookingError> {
        if status == ReservationStatus::Cancelled {
            return self.cancel_reservation(id).await;
        }
        let mut last_conflict = None;
        for _ in 0..RECORD_CAS_ATTEMPTS {
            let (reservation, raw) = self
                .docs
                .reservation(id)
                .await?
                .ok_or_else(|| BookingError::validation(format!("unknown reservation {id}")))?;
            if reservation.status == status {
                return Ok(reservation);
            }
            if !reservation.status.can_transition_to(status) {
                return Err(BookingError::validation(format!(
                    "can't move a {} reservation to {}",
                    reservation.status.as_str(),
                    status.as_str()
                )));
            }
            let updated = Reservation {
                status,
                updated_at: self.clock.now(),
                ..reservation
            };
            let write = ConditionalWrite::put(paths::RESERVATIONS, id.to_string(), Expect::Equals(raw), to_doc(&updated)?);
            match self.docs.write_if(write).await {
                Ok(()) => {
                    info!(reservation_id = %id, status = status.as_str(), "reservation status changed");
                    self.notify.send(&BookingEvent::ReservationStatusChanged {
                        reservation_id: id,
                        property_id: updated.property_id,
                        status,
                    });
                    return Ok(updated);
                }
                Err(e @ BookingError::Conflict { .. }) => last_conflict = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_conflict.unwrap_or(BookingError::Conflict { dates: Vec::new() }))
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn request() -> ReservationRequest {
        ReservationRequest {
            property_id: Ulid::new(),
            check_in: NaiveDate::from_ymd_opt(2026, 7, 1).unwrap(),
            check_out: NaiveDate::from_ymd_opt(2026, 7, 4).unwrap(),
            guests: 2,
            guest: GuestContact {
                name: "Marie Dupont".into(),
                email: "marie@example.fr".into(),
                phone: "+33 6 12 34 56 78".into(),
            },
            special_requests: None,
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 5, 1).unwrap()
    }

    #[test]
    fn accepts_reasonable_contact() {
        assert!(validate_request(&request(), today()).is_ok());
    }

    #[test]
    fn rejects_bad_contact_fields() {
        let mut r = request();
        r.guest.name = " M ".into();
        assert!(matches!(validate_request(&r, today()), Err(BookingError::Validation(_))));

        let mut r = request();
        r.guest.email = "marie.example.fr".into();
        assert!(validate_request(&r, today()).is_err());
        r.guest.email = "marie@localhost".into();
        assert!(validate_request(&r, today()).is_err());

        let mut r = request();
        r.guest.phone = "06 12 34".into();
        assert!(validate_request(&r, today()).is_err());
        r.guest.phone = "06-12-34-56-78 ext".into();
        assert!(validate_request(&r, today()).is_err());
    }

    #[test]
    fn rejects_guest_count_out_of_bounds() {
        let mut r = request();
        r.guests = 0;
        assert!(validate_request(&r, today()).is_err());
        r.guests = MAX_GUESTS + 1;
        assert!(validate_request(&r, today()).is_err());
    }

    #[test]
    fn rejects_far_future() {
        let mut r = request();
        r.check_in = NaiveDate::from_ymd_opt(2030, 7, 1).unwrap();
        r.check_out = NaiveDate::from_ymd_opt(2030, 7, 4).unwrap();
        assert!(validate_request(&r, today()).is_err());
    }

    #[test]
    fn stage_labels() {
        assert_eq!(Stage::CheckingAvailability.as_str(), "checking_availability");
        assert_eq!(Stage::Done.as_str(), "done");
    }
}
