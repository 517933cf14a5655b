use chrono::NaiveDate;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use ulid::Ulid;

use super::calendar::previous_day;
use super::docs::Docs;
use super::error::BookingError;
use super::rates::{RateResolver, RateTable, ResolvedRate};
use crate::limits::MAX_STAY_NIGHTS;
use crate::model::night_count;

/// Stays of at least this many nights get the weekly discount.
pub const WEEKLY_MIN_NIGHTS: i64 = 7;
/// Stays of at least this many nights get the monthly discount instead.
pub const MONTHLY_MIN_NIGHTS: i64 = 28;
/// Check-in at most this many days ahead is last-minute.
pub const LAST_MINUTE_MAX_LEAD_DAYS: i64 = 7;
/// Check-in at least this many days ahead is early-bird.
pub const EARLY_BIRD_MIN_LEAD_DAYS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscountKind {
    Weekly,
    Monthly,
    LastMinute,
    EarlyBird,
}

impl DiscountKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscountKind::Weekly => "weekly_discount",
            DiscountKind::Monthly => "monthly_discount",
            DiscountKind::LastMinute => "last_minute_discount",
            DiscountKind::EarlyBird => "early_bird_discount",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedDiscount {
    pub kind: DiscountKind,
    pub percent: Decimal,
    pub amount: Decimal,
}

/// Itemized price of a stay. Both the guest quote and the admin preview come from here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Quote {
    pub property_id: Ulid,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub guests: u32,
    pub currency: String,
    pub nights: Vec<ResolvedRate>,
    pub subtotal: Decimal,
    pub discounts: Vec<AppliedDiscount>,
    pub discounted_subtotal: Decimal,
    pub cleaning_fee: Decimal,
    pub occupancy_tax: Decimal,
    pub total: Decimal,
    /// Quoted separately; not part of `total`.
    pub security_deposit: Decimal,
}

/// A flat row of a quote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineItem {
    pub item: &'static str,
    pub date: Option<NaiveDate>,
    pub percent: Option<Decimal>,
    pub amount: Decimal,
}

impl LineItem {
    fn new(item: &'static str, amount: Decimal) -> Self {
        Self {
            item,
            date: None,
            percent: None,
            amount,
        }
    }
}

impl Quote {
    pub fn night_count(&self) -> u32 {
        self.nights.len() as u32
    }

    /// Mean undiscounted nightly price, to the cent.
    pub fn average_nightly_price(&self) -> Decimal {
        if self.nights.is_empty() {
            return Decimal::ZERO;
        }
        round_cents(self.subtotal / Decimal::from(self.nights.len()))
    }

    pub fn discount_total(&self) -> Decimal {
        self.discounts.iter().map(|d| d.amount).sum()
    }

    pub fn line_items(&self) -> Vec<LineItem> {
        let mut items: Vec<LineItem> = self
            .nights
            .iter()
            .map(|n| LineItem {
                item: "night",
                date: Some(n.date),
                percent: None,
                amount: n.nightly_price,
            })
            .collect();
        items.push(LineItem::new("subtotal", self.subtotal));
        for d in &self.discounts {
            items.push(LineItem {
                item: d.kind.as_str(),
                date: None,
                percent: Some(d.percent),
                amount: -d.amount,
            });
        }
        items.push(LineItem::new("discounted_subtotal", self.discounted_subtotal));
        items.push(LineItem::new("cleaning_fee", self.cleaning_fee));
        items.push(LineItem::new("occupancy_tax", self.occupancy_tax));
        items.push(LineItem::new("total", self.total));
        items.push(LineItem::new("security_deposit", self.security_deposit));
        items
    }
}

fn round_cents(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

fn percent_of(base: Decimal, percent: Decimal) -> Decimal {
    round_cents(base * percent / Decimal::ONE_HUNDRED)
}

/// Shape checks shared by quoting and availability. `quote` and `check_availability`
/// also run them before their first store read, so a malformed stay never loads a
/// rate table.
pub fn validate_stay(check_in: NaiveDate, check_out: NaiveDate, guests: u32) -> Result<i64, BookingError> {
    let nights = night_count(check_in, check_out);
    if nights <= 0 {
        return Err(BookingError::validation(format!(
            "check-out {check_out} must be after check-in {check_in}"
        )));
    }
    if nights > MAX_STAY_NIGHTS {
        return Err(BookingError::validation(format!("stays are limited to {MAX_STAY_NIGHTS} nights")));
    }
    if guests == 0 {
        return Err(BookingError::validation("at least one guest is required"));
    }
    Ok(nights)
}

fn duration_discount(table: &RateTable, nights: i64) -> Option<(DiscountKind, Decimal)> {
    let policy = table.policy();
    if nights >= MONTHLY_MIN_NIGHTS {
        Some((DiscountKind::Monthly, policy.monthly_discount))
    } else if nights >= WEEKLY_MIN_NIGHTS {
        Some((DiscountKind::Weekly, policy.weekly_discount))
    } else {
        None
    }
}

fn timing_discount(table: &RateTable, lead_days: i64) -> Option<(DiscountKind, Decimal)> {
    let policy = table.policy();
    if lead_days <= LAST_MINUTE_MAX_LEAD_DAYS {
        Some((DiscountKind::LastMinute, policy.last_minute_discount))
    } else if lead_days >= EARLY_BIRD_MIN_LEAD_DAYS {
        Some((DiscountKind::EarlyBird, policy.early_bird_discount))
    } else {
        None
    }
}

/// Price a stay from a loaded rate table. Pure.
///
/// Each night is billed at its own resolved rate. The duration discount (monthly over
/// weekly) applies to the subtotal; the timing discount then applies to what remains.
pub fn compute_quote(
    table: &RateTable,
    property_id: Ulid,
    check_in: NaiveDate,
    check_out: NaiveDate,
    guests: u32,
    today: NaiveDate,
) -> Result<Quote, BookingError> {
    let nights = validate_stay(check_in, check_out, guests)?;
    let lead_days = (check_in - today).num_days();
    if lead_days < 0 {
        return Err(BookingError::validation(format!("check-in {check_in} is in the past")));
    }

    let rates: Vec<ResolvedRate> = check_in
        .iter_days()
        .take_while(|d| *d < check_out)
        .map(|d| table.resolve(d))
        .collect();
    let subtotal: Decimal = rates.iter().map(|r| r.nightly_price).sum();

    let mut discounts = Vec::new();
    let mut running = subtotal;
    for (kind, percent) in [duration_discount(table, nights), timing_discount(table, lead_days)]
        .into_iter()
        .flatten()
    {
        if percent.is_zero() {
            continue;
        }
        let amount = percent_of(running, percent);
        running -= amount;
        discounts.push(AppliedDiscount { kind, percent, amount });
    }

    let policy = table.policy();
    let occupancy_tax = Decimal::from(nights) * Decimal::from(guests) * policy.tax_per_person_per_night;
    let total = running + policy.cleaning_fee + occupancy_tax;

    metrics::counter!(crate::observability::QUOTES_TOTAL).increment(1);
    Ok(Quote {
        property_id,
        check_in,
        check_out,
        guests,
        currency: policy.currency.clone(),
        nights: rates,
        subtotal,
        discounts,
        discounted_subtotal: running,
        cleaning_fee: policy.cleaning_fee,
        occupancy_tax,
        total,
        security_deposit: policy.security_deposit,
    })
}

#[derive(Clone)]
pub struct PricingCalculator {
    docs: Docs,
    rates: RateResolver,
}

impl PricingCalculator {
    pub fn new(docs: Docs, rates: RateResolver) -> Self {
        Self { docs, rates }
    }

    pub async fn quote(
        &self,
        property_id: Ulid,
        check_in: NaiveDate,
        check_out: NaiveDate,
        guests: u32,
        today: NaiveDate,
    ) -> Result<Quote, BookingError> {
        validate_stay(check_in, check_out, guests)?;
        self.docs.require_property(property_id).await?;
        let table = self
            .rates
            .rate_table(property_id, check_in, previous_day(check_out))
            .await?;
        compute_quote(&table, property_id, check_in, check_out, guests, today)
    }
}
