use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use tracing::info;
use ulid::Ulid;

use super::calendar::CalendarStore;
use super::docs::{from_doc, paths, to_doc, Docs};
use super::error::BookingError;
use super::Clock;
use crate::limits::{MAX_GUESTS, MAX_NAME_LEN, MAX_SEASONS};
use crate::model::{BlockReason, PricingPolicy, Property, SeasonDraft, SeasonRate};
use crate::store::{ConditionalWrite, Expect};

const COPY_SUFFIX: &str = " (copy)";

fn check_name(name: &str, what: &str) -> Result<(), BookingError> {
    let name = name.trim();
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(BookingError::validation(format!("{what} name must be 1 to {MAX_NAME_LEN} characters")));
    }
    Ok(())
}

fn check_percent(value: Decimal, field: &str) -> Result<(), BookingError> {
    if value < Decimal::ZERO || value > Decimal::ONE_HUNDRED {
        return Err(BookingError::validation(format!("{field} must be between 0 and 100")));
    }
    Ok(())
}

fn check_amount(value: Decimal, field: &str) -> Result<(), BookingError> {
    if value.is_sign_negative() && !value.is_zero() {
        return Err(BookingError::validation(format!("{field} must not be negative")));
    }
    Ok(())
}

fn valid_color(color: &str) -> bool {
    color.len() == 7 && color.starts_with('#') && color[1..].chars().all(|c| c.is_ascii_hexdigit())
}

pub fn validate_policy(policy: &PricingPolicy) -> Result<(), BookingError> {
    check_amount(policy.base_price, "base price")?;
    check_amount(policy.cleaning_fee, "cleaning fee")?;
    check_amount(policy.security_deposit, "security deposit")?;
    check_amount(policy.tax_per_person_per_night, "occupancy tax")?;
    check_percent(policy.weekly_discount, "weekly discount")?;
    check_percent(policy.monthly_discount, "monthly discount")?;
    check_percent(policy.last_minute_discount, "last-minute discount")?;
    check_percent(policy.early_bird_discount, "early-bird discount")?;
    if policy.minimum_stay < 1 || policy.minimum_stay > policy.maximum_stay {
        return Err(BookingError::validation("stay bounds must satisfy 1 <= minimum <= maximum"));
    }
    if policy.currency.trim().is_empty() {
        return Err(BookingError::validation("currency is required"));
    }
    Ok(())
}

pub fn validate_season(draft: &SeasonDraft) -> Result<(), BookingError> {
    check_name(&draft.name, "season")?;
    if draft.end < draft.start {
        return Err(BookingError::validation(format!(
            "season end {} is before start {}",
            draft.end, draft.start
        )));
    }
    check_amount(draft.price, "season price")?;
    if draft.minimum_stay < 1 {
        return Err(BookingError::validation("season minimum stay must be at least 1"));
    }
    if !valid_color(&draft.color) {
        return Err(BookingError::validation(format!("season color {} is not #rrggbb", draft.color)));
    }
    Ok(())
}

/// Owner-side inputs: property records, pricing policy, seasons and calendar edits.
#[derive(Clone)]
pub struct Admin {
    docs: Docs,
    calendar: CalendarStore,
    clock: Arc<dyn Clock>,
}

impl Admin {
    pub fn new(docs: Docs, calendar: CalendarStore, clock: Arc<dyn Clock>) -> Self {
        Self { docs, calendar, clock }
    }

    // ── Properties ──────────────────────────────────────────────

    pub async fn upsert_property(&self, property: Property) -> Result<(), BookingError> {
        check_name(&property.name, "property")?;
        if property.max_guests == 0 || property.max_guests > MAX_GUESTS {
            return Err(BookingError::validation(format!("max guests must be 1 to {MAX_GUESTS}")));
        }
        let write = ConditionalWrite::put(paths::PROPERTIES, property.id.to_string(), Expect::Any, to_doc(&property)?);
        self.docs.write_if(write).await?;
        info!(property_id = %property.id, status = property.status.as_str(), "property saved");
        Ok(())
    }

    pub async fn get_property(&self, property_id: Ulid) -> Result<Option<Property>, BookingError> {
        self.docs.property(property_id).await
    }

    pub async fn list_properties(&self) -> Result<Vec<Property>, BookingError> {
        self.docs.scan(paths::PROPERTIES).await
    }

    // ── Pricing policy ──────────────────────────────────────────

    pub async fn set_pricing_policy(&self, property_id: Ulid, mut policy: PricingPolicy) -> Result<PricingPolicy, BookingError> {
        self.docs.require_property(property_id).await?;
        policy.currency = policy.currency.trim().to_uppercase();
        validate_policy(&policy)?;
        policy.updated_at = Some(self.clock.now());
        let write = ConditionalWrite::put(paths::PRICING, property_id.to_string(), Expect::Any, to_doc(&policy)?);
        self.docs.write_if(write).await?;
        info!(%property_id, base_price = %policy.base_price, "pricing policy updated");
        Ok(policy)
    }

    pub async fn pricing_policy(&self, property_id: Ulid) -> Result<PricingPolicy, BookingError> {
        self.docs.policy(property_id).await
    }

    // ── Seasons ─────────────────────────────────────────────────

    /// Seasons ordered by start date.
    pub async fn list_seasons(&self, property_id: Ulid) -> Result<Vec<SeasonRate>, BookingError> {
        let mut seasons = self.docs.seasons(property_id).await?;
        seasons.sort_by(|a, b| a.start.cmp(&b.start).then(a.end.cmp(&b.end)).then(a.id.cmp(&b.id)));
        Ok(seasons)
    }

    async fn insert_season(&self, property_id: Ulid, season: SeasonRate) -> Result<SeasonRate, BookingError> {
        if self.docs.seasons(property_id).await?.len() >= MAX_SEASONS {
            return Err(BookingError::validation(format!("a property can have at most {MAX_SEASONS} seasons")));
        }
        let write = ConditionalWrite::put(
            paths::seasons(property_id),
            season.id.to_string(),
            Expect::Absent,
            to_doc(&season)?,
        );
        self.docs.write_if(write).await?;
        info!(%property_id, season_id = %season.id, name = %season.name, "season created");
        Ok(season)
    }

    pub async fn create_season(&self, property_id: Ulid, draft: SeasonDraft) -> Result<SeasonRate, BookingError> {
        self.upsert_season(Ulid::new(), property_id, draft).await
    }

    /// Create the season under `id`, or replace its fields if it exists. Replacing keeps
    /// the original creation stamp, so overlap precedence doesn't shift on edit.
    pub async fn upsert_season(&self, id: Ulid, property_id: Ulid, draft: SeasonDraft) -> Result<SeasonRate, BookingError> {
        validate_season(&draft)?;
        self.docs.require_property(property_id).await?;
        let collection = paths::seasons(property_id);
        match self.docs.get_raw(&collection, &id.to_string()).await? {
            None => {
                let season = SeasonRate {
                    id,
                    name: draft.name.trim().to_string(),
                    start: draft.start,
                    end: draft.end,
                    price: draft.price,
                    minimum_stay: draft.minimum_stay,
                    color: draft.color,
                    created_at: self.clock.now(),
                };
                self.insert_season(property_id, season).await
            }
            Some(raw) => {
                let existing: SeasonRate = from_doc(raw.clone())?;
                let season = SeasonRate {
                    name: draft.name.trim().to_string(),
                    start: draft.start,
                    end: draft.end,
                    price: draft.price,
                    minimum_stay: draft.minimum_stay,
                    color: draft.color,
                    ..existing
                };
                let write = ConditionalWrite::put(collection, id.to_string(), Expect::Equals(raw), to_doc(&season)?);
                self.docs.write_if(write).await?;
                info!(%property_id, season_id = %id, "season updated");
                Ok(season)
            }
        }
    }

    /// Edit an existing season. Unknown ids are a validation error.
    pub async fn update_season(&self, property_id: Ulid, id: Ulid, draft: SeasonDraft) -> Result<SeasonRate, BookingError> {
        if self.docs.get_raw(&paths::seasons(property_id), &id.to_string()).await?.is_none() {
            return Err(BookingError::validation(format!("unknown season {id}")));
        }
        self.upsert_season(id, property_id, draft).await
    }

    /// Copy a season under a new id. The copy is newer, so it wins overlaps with the original.
    pub async fn duplicate_season(&self, property_id: Ulid, id: Ulid) -> Result<SeasonRate, BookingError> {
        let original: SeasonRate = self
            .docs
            .get(&paths::seasons(property_id), &id.to_string())
            .await?
            .ok_or_else(|| BookingError::validation(format!("unknown season {id}")))?;
        let mut name = original.name.clone();
        name.push_str(COPY_SUFFIX);
        let copy = SeasonRate {
            id: Ulid::new(),
            name,
            created_at: self
                .clock
                .now()
                .max(original.created_at + chrono::Duration::milliseconds(1)),
            ..original
        };
        self.insert_season(property_id, copy).await
    }

    /// Delete a season and drop any calendar pins pointing at it.
    pub async fn delete_season(&self, property_id: Ulid, id: Ulid) -> Result<bool, BookingError> {
        let collection = paths::seasons(property_id);
        let Some(raw) = self.docs.get_raw(&collection, &id.to_string()).await? else {
            return Ok(false);
        };
        self.docs
            .write_if(ConditionalWrite::delete(collection, id.to_string(), Expect::Equals(raw)))
            .await?;
        let unpinned = self.calendar.unpin_everywhere(property_id, id).await?;
        info!(%property_id, season_id = %id, unpinned, "season deleted");
        Ok(true)
    }

    // ── Calendar ────────────────────────────────────────────────

    pub async fn block_dates(
        &self,
        property_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
        reason: BlockReason,
        note: Option<String>,
    ) -> Result<usize, BookingError> {
        self.docs.require_property(property_id).await?;
        self.calendar.block(property_id, from, to, reason, note).await
    }

    pub async fn unblock_dates(&self, property_id: Ulid, from: NaiveDate, to: NaiveDate) -> Result<usize, BookingError> {
        self.docs.require_property(property_id).await?;
        self.calendar.unblock(property_id, from, to).await
    }

    /// The "special rate" action: per-day price and minimum-stay overrides.
    pub async fn set_day_overrides(
        &self,
        property_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
        price: Option<Decimal>,
        minimum_stay: Option<u32>,
        note: Option<String>,
    ) -> Result<usize, BookingError> {
        self.docs.require_property(property_id).await?;
        self.calendar
            .set_overrides(property_id, from, to, price, minimum_stay, note)
            .await
    }

    pub async fn pin_season(
        &self,
        property_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
        season_id: Option<Ulid>,
    ) -> Result<usize, BookingError> {
        self.docs.require_property(property_id).await?;
        if let Some(id) = season_id
            && self.docs.get_raw(&paths::seasons(property_id), &id.to_string()).await?.is_none()
        {
            return Err(BookingError::validation(format!("unknown season {id}")));
        }
        self.calendar.pin_season(property_id, from, to, season_id).await
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn draft() -> SeasonDraft {
        SeasonDraft {
            name: "Haute saison".into(),
            start: d("2026-07-01"),
            end: d("2026-08-31"),
            price: dec!(650),
            minimum_stay: 7,
            color: "#ef4444".into(),
        }
    }

    #[test]
    fn default_policy_is_valid() {
        assert!(validate_policy(&PricingPolicy::default()).is_ok());
    }

    #[test]
    fn policy_bounds() {
        let mut p = PricingPolicy::default();
        p.weekly_discount = dec!(100.01);
        assert!(validate_policy(&p).is_err());

        let mut p = PricingPolicy::default();
        p.cleaning_fee = dec!(-1);
        assert!(validate_policy(&p).is_err());

        let mut p = PricingPolicy::default();
        p.minimum_stay = 31;
        assert!(validate_policy(&p).is_err());
        p.minimum_stay = 0;
        assert!(validate_policy(&p).is_err());

        let mut p = PricingPolicy::default();
        p.currency = " ".into();
        assert!(validate_policy(&p).is_err());
    }

    #[test]
    fn season_validation() {
        assert!(validate_season(&draft()).is_ok());

        let mut s = draft();
        s.end = d("2026-06-30");
        assert!(validate_season(&s).is_err());

        let mut s = draft();
        s.color = "red".into();
        assert!(validate_season(&s).is_err());
        s.color = "#12345g".into();
        assert!(validate_season(&s).is_err());

        let mut s = draft();
        s.minimum_stay = 0;
        assert!(validate_season(&s).is_err());

        let mut s = draft();
        s.name = "   ".into();
        assert!(validate_season(&s).is_err());
    }

    #[test]
    fn single_day_season_is_valid() {
        let mut s = draft();
        s.end = s.start;
        assert!(validate_season(&s).is_ok());
    }
}
