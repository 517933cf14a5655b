use chrono::NaiveDate;
use ulid::Ulid;

use super::calendar::previous_day;
use super::docs::Docs;
use super::error::{BookingError, UnavailableReason};
use super::pricing::validate_stay;
use super::rates::{RateResolver, RateTable};
use crate::model::{stay_nights, NightSet, Property, PropertyStatus};

/// Decide whether a stay is bookable against a loaded rate table. Pure.
///
/// Checks run in a fixed order so the first failing rule is the one reported.
pub fn evaluate(
    table: &RateTable,
    property: &Property,
    check_in: NaiveDate,
    check_out: NaiveDate,
    guests: u32,
    today: NaiveDate,
) -> Result<NightSet, BookingError> {
    let nights = validate_stay(check_in, check_out, guests)? as u32;

    if property.status != PropertyStatus::Active {
        return Err(BookingError::Unavailable(UnavailableReason::PropertyInactive {
            status: property.status,
        }));
    }
    if check_in < today {
        return Err(BookingError::Unavailable(UnavailableReason::PastCheckIn));
    }

    let stay = stay_nights(check_in, check_out);
    let taken: Vec<NaiveDate> = stay.iter().copied().filter(|d| !table.day(*d).is_open()).collect();
    if !taken.is_empty() {
        return Err(BookingError::Unavailable(UnavailableReason::DatesNotOpen { dates: taken }));
    }

    let required = stay
        .iter()
        .map(|d| table.resolve(*d).minimum_stay)
        .max()
        .unwrap_or(1);
    if nights < required {
        return Err(BookingError::Unavailable(UnavailableReason::BelowMinimumStay { required, nights }));
    }

    let maximum = table.policy().maximum_stay;
    if nights > maximum {
        return Err(BookingError::Unavailable(UnavailableReason::AboveMaximumStay { maximum, nights }));
    }

    if guests > property.max_guests {
        return Err(BookingError::Unavailable(UnavailableReason::TooManyGuests {
            max_guests: property.max_guests,
            guests,
        }));
    }

    Ok(stay)
}

/// Fail-fast check before the ledger claim. Not a safety mechanism on its own:
/// the ledger's conditional writes are the serialization point.
#[derive(Clone)]
pub struct AvailabilityChecker {
    docs: Docs,
    rates: RateResolver,
}

impl AvailabilityChecker {
    pub fn new(docs: Docs, rates: RateResolver) -> Self {
        Self { docs, rates }
    }

    /// On success returns the nights the ledger must claim.
    pub async fn check_availability(
        &self,
        property_id: Ulid,
        check_in: NaiveDate,
        check_out: NaiveDate,
        guests: u32,
        today: NaiveDate,
    ) -> Result<NightSet, BookingError> {
        validate_stay(check_in, check_out, guests)?;
        let property = self.docs.require_property(property_id).await?;
        let table = self
            .rates
            .rate_table(property_id, check_in, previous_day(check_out))
            .await?;
        evaluate(&table, &property, check_in, check_out, guests, today)
    }
}
