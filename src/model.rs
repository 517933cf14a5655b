use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// The nights of a stay, as calendar dates (check-out excluded).
pub type NightSet = BTreeSet<NaiveDate>;

/// Nights consumed by a stay `[check_in, check_out)`. Empty when `check_out <= check_in`.
pub fn stay_nights(check_in: NaiveDate, check_out: NaiveDate) -> NightSet {
    check_in.iter_days().take_while(|d| *d < check_out).collect()
}

/// Number of nights between two dates, negative when reversed.
pub fn night_count(check_in: NaiveDate, check_out: NaiveDate) -> i64 {
    (check_out - check_in).num_days()
}

// ── Calendar ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    Blocked,
    Maintenance,
}

impl BlockReason {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "blocked" => Some(BlockReason::Blocked),
            "maintenance" => Some(BlockReason::Maintenance),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::Blocked => "blocked",
            BlockReason::Maintenance => "maintenance",
        }
    }
}

/// Availability state of one night.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DayState {
    Open,
    Blocked { reason: BlockReason },
    Reserved { reservation_id: Ulid },
}

impl DayState {
    pub fn label(&self) -> &'static str {
        match self {
            DayState::Open => "open",
            DayState::Blocked { reason } => reason.as_str(),
            DayState::Reserved { .. } => "reserved",
        }
    }
}

/// Per-date state for one property. A missing entry means Open at the resolved rate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarDay {
    pub date: NaiveDate,
    #[serde(flatten)]
    pub state: DayState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_stay: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub season_id: Option<Ulid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl CalendarDay {
    pub fn open(date: NaiveDate) -> Self {
        Self {
            date,
            state: DayState::Open,
            price: None,
            minimum_stay: None,
            season_id: None,
            note: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == DayState::Open
    }

    /// True when the entry carries nothing an absent entry wouldn't.
    /// Such days are deleted instead of stored.
    pub fn is_default(&self) -> bool {
        self.is_open()
            && self.price.is_none()
            && self.minimum_stay.is_none()
            && self.season_id.is_none()
            && self.note.is_none()
    }

    pub fn with_state(&self, state: DayState) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }
}

// ── Pricing configuration ────────────────────────────────────────

/// A named inclusive date interval with its own nightly price and minimum stay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeasonRate {
    pub id: Ulid,
    pub name: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub price: Decimal,
    pub minimum_stay: u32,
    pub color: String,
    pub created_at: DateTime<Utc>,
}

impl SeasonRate {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// Ordering key for overlap resolution: later creation wins.
    pub fn creation_order(&self) -> (DateTime<Utc>, Ulid) {
        (self.created_at, self.id)
    }
}

/// Admin input for creating or editing a season.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeasonDraft {
    pub name: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub price: Decimal,
    pub minimum_stay: u32,
    pub color: String,
}

pub const DEFAULT_SEASON_COLOR: &str = "#3b82f6";

/// Per-property pricing singleton.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingPolicy {
    pub base_price: Decimal,
    pub currency: String,
    pub cleaning_fee: Decimal,
    pub security_deposit: Decimal,
    pub minimum_stay: u32,
    pub maximum_stay: u32,
    /// Percentages, 0..=100.
    pub weekly_discount: Decimal,
    pub monthly_discount: Decimal,
    pub last_minute_discount: Decimal,
    pub early_bird_discount: Decimal,
    pub tax_per_person_per_night: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for PricingPolicy {
    fn default() -> Self {
        Self {
            base_price: Decimal::from(450),
            currency: "EUR".into(),
            cleaning_fee: Decimal::from(200),
            security_deposit: Decimal::from(500),
            minimum_stay: 3,
            maximum_stay: 30,
            weekly_discount: Decimal::from(10),
            monthly_discount: Decimal::from(20),
            last_minute_discount: Decimal::from(15),
            early_bird_discount: Decimal::from(10),
            tax_per_person_per_night: Decimal::from(2),
            updated_at: None,
        }
    }
}

// ── Property ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyStatus {
    Active,
    Inactive,
    Maintenance,
}

impl PropertyStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "active" => Some(PropertyStatus::Active),
            "inactive" => Some(PropertyStatus::Inactive),
            "maintenance" => Some(PropertyStatus::Maintenance),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyStatus::Active => "active",
            PropertyStatus::Inactive => "inactive",
            PropertyStatus::Maintenance => "maintenance",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub id: Ulid,
    pub name: String,
    pub status: PropertyStatus,
    pub max_guests: u32,
    pub check_in_time: String,
    pub check_out_time: String,
}

impl Property {
    pub fn new(id: Ulid, name: impl Into<String>, max_guests: u32) -> Self {
        Self {
            id,
            name: name.into(),
            status: PropertyStatus::Active,
            max_guests,
            check_in_time: "16:00".into(),
            check_out_time: "11:00".into(),
        }
    }
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl ReservationStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(ReservationStatus::Pending),
            "confirmed" => Some(ReservationStatus::Confirmed),
            "cancelled" | "canceled" => Some(ReservationStatus::Cancelled),
            "completed" => Some(ReservationStatus::Completed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::Completed => "completed",
        }
    }

    /// Pending → Confirmed → Completed; any non-terminal state → Cancelled.
    pub fn can_transition_to(&self, next: ReservationStatus) -> bool {
        use ReservationStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed) | (Confirmed, Completed) | (Pending, Cancelled) | (Confirmed, Cancelled)
        )
    }

    /// Whether the reservation still holds its nights.
    pub fn holds_nights(&self) -> bool {
        !matches!(self, ReservationStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Refunded => "refunded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestContact {
    pub name: String,
    pub email: String,
    pub phone: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub property_id: Ulid,
    pub guest: GuestContact,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub guests: u32,
    pub nights: u32,
    pub price_per_night: Decimal,
    pub total_price: Decimal,
    pub currency: String,
    pub status: ReservationStatus,
    pub payment_status: PaymentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub special_requests: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reservation {
    pub fn nights(&self) -> NightSet {
        stay_nights(self.check_in, self.check_out)
    }
}

/// Guest-facing booking input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationRequest {
    pub property_id: Ulid,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub guests: u32,
    pub guest: GuestContact,
    pub special_requests: Option<String>,
}

// ── WAL records ──────────────────────────────────────────────────

/// One document change. Bodies are JSON text: bincode cannot drive
/// self-describing `serde_json::Value` deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    Put {
        collection: String,
        id: String,
        body: String,
    },
    Delete {
        collection: String,
        id: String,
    },
}

/// The WAL record format. A batch is one record so replay applies it whole or not at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    Applied(Mutation),
    BatchApplied(Vec<Mutation>),
}

impl Event {
    pub fn mutations(&self) -> &[Mutation] {
        match self {
            Event::Applied(m) => std::slice::from_ref(m),
            Event::BatchApplied(ms) => ms,
        }
    }
}
