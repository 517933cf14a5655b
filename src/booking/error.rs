use std::fmt;

use chrono::NaiveDate;

use crate::model::PropertyStatus;

/// Why a stay was refused on business rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnavailableReason {
    PastCheckIn,
    DatesNotOpen { dates: Vec<NaiveDate> },
    BelowMinimumStay { required: u32, nights: u32 },
    AboveMaximumStay { maximum: u32, nights: u32 },
    TooManyGuests { max_guests: u32, guests: u32 },
    PropertyInactive { status: PropertyStatus },
}

impl UnavailableReason {
    /// Short machine-readable code (used in the availability result rows).
    pub fn code(&self) -> &'static str {
        match self {
            UnavailableReason::PastCheckIn => "past_check_in",
            UnavailableReason::DatesNotOpen { .. } => "dates_not_open",
            UnavailableReason::BelowMinimumStay { .. } => "below_minimum_stay",
            UnavailableReason::AboveMaximumStay { .. } => "above_maximum_stay",
            UnavailableReason::TooManyGuests { .. } => "too_many_guests",
            UnavailableReason::PropertyInactive { .. } => "property_inactive",
        }
    }
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnavailableReason::PastCheckIn => write!(f, "check-in date is in the past"),
            UnavailableReason::DatesNotOpen { dates } => {
                write!(f, "not open on ")?;
                write_dates(f, dates)
            }
            UnavailableReason::BelowMinimumStay { required, nights } => {
                write!(f, "minimum stay is {required} nights, requested {nights}")
            }
            UnavailableReason::AboveMaximumStay { maximum, nights } => {
                write!(f, "maximum stay is {maximum} nights, requested {nights}")
            }
            UnavailableReason::TooManyGuests { max_guests, guests } => {
                write!(f, "property sleeps {max_guests}, requested {guests} guests")
            }
            UnavailableReason::PropertyInactive { status } => {
                write!(f, "property is {}", status.as_str())
            }
        }
    }
}

fn write_dates(f: &mut fmt::Formatter<'_>, dates: &[NaiveDate]) -> fmt::Result {
    for (i, d) in dates.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{d}")?;
    }
    Ok(())
}

struct DateList<'a>(&'a [NaiveDate]);

impl fmt::Display for DateList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_dates(f, self.0)
    }
}

/// Failure kinds of the booking core. Components pass these through unchanged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BookingError {
    /// Malformed or out-of-bounds input.
    #[error("validation error: {0}")]
    Validation(String),
    #[error("unavailable: {0}")]
    Unavailable(UnavailableReason),
    /// Lost a race for the same nights.
    #[error("conflict on {}", DateList(.dates))]
    Conflict { dates: Vec<NaiveDate> },
    /// Store failure or timeout.
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl BookingError {
    pub fn validation(msg: impl Into<String>) -> Self {
        BookingError::Validation(msg.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BookingError::Validation(_) => "validation",
            BookingError::Unavailable(_) => "unavailable",
            BookingError::Conflict { .. } => "conflict",
            BookingError::Persistence(_) => "persistence",
        }
    }

    /// Text shown to the guest or admin.
    pub fn user_message(&self) -> String {
        match self {
            BookingError::Validation(msg) => format!("invalid request: {msg}"),
            BookingError::Unavailable(reason) => match reason {
                UnavailableReason::DatesNotOpen { .. } => {
                    "these dates are no longer available, please choose different dates".into()
                }
                other => format!("these dates can't be booked ({other}), please choose different dates"),
            },
            BookingError::Conflict { .. } => {
                "these dates are no longer available, please choose different dates".into()
            }
            BookingError::Persistence(_) => {
                "a temporary problem prevented saving your request, please try again".into()
            }
        }
    }
}
