use std::collections::BTreeMap;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use ulid::Ulid;

use super::calendar::{check_window, CalendarStore};
use super::docs::Docs;
use super::error::BookingError;
use crate::model::{CalendarDay, DayState, PricingPolicy, SeasonRate};

/// Effective nightly price and minimum stay for one date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedRate {
    pub date: NaiveDate,
    pub nightly_price: Decimal,
    pub minimum_stay: u32,
    pub season_id: Option<Ulid>,
}

/// Everything rate resolution needs for a window of dates, loaded once.
#[derive(Debug, Clone)]
pub struct RateTable {
    policy: PricingPolicy,
    /// Newest first, so the first match is the tie-break winner.
    seasons: Vec<SeasonRate>,
    days: BTreeMap<NaiveDate, CalendarDay>,
}

impl RateTable {
    pub fn new(policy: PricingPolicy, mut seasons: Vec<SeasonRate>, days: BTreeMap<NaiveDate, CalendarDay>) -> Self {
        seasons.sort_by_key(|s| std::cmp::Reverse(s.creation_order()));
        Self { policy, seasons, days }
    }

    pub fn policy(&self) -> &PricingPolicy {
        &self.policy
    }

    /// The stored day, or an Open default.
    pub fn day(&self, date: NaiveDate) -> CalendarDay {
        self.days.get(&date).cloned().unwrap_or_else(|| CalendarDay::open(date))
    }

    /// Precedence, highest first: per-day override (field by field), a season pinned on
    /// the day, the most recently created season containing the date, the base policy.
    pub fn resolve(&self, date: NaiveDate) -> ResolvedRate {
        let day = self.days.get(&date);
        let pinned = day
            .and_then(|d| d.season_id)
            .and_then(|sid| self.seasons.iter().find(|s| s.id == sid));
        let season = pinned.or_else(|| self.seasons.iter().find(|s| s.contains(date)));

        let (mut nightly_price, mut minimum_stay, season_id) = match season {
            Some(s) => (s.price, s.minimum_stay, Some(s.id)),
            None => (self.policy.base_price, self.policy.minimum_stay, None),
        };
        if let Some(d) = day {
            if let Some(p) = d.price {
                nightly_price = p;
            }
            if let Some(m) = d.minimum_stay {
                minimum_stay = m;
            }
        }

        ResolvedRate {
            date,
            nightly_price,
            minimum_stay,
            season_id,
        }
    }
}

/// One row of the admin calendar / guest date picker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CalendarViewDay {
    pub date: NaiveDate,
    pub state: DayState,
    pub nightly_price: Decimal,
    pub minimum_stay: u32,
    pub season_id: Option<Ulid>,
    pub note: Option<String>,
}

#[derive(Clone)]
pub struct RateResolver {
    docs: Docs,
    calendar: CalendarStore,
}

impl RateResolver {
    pub fn new(docs: Docs, calendar: CalendarStore) -> Self {
        Self { docs, calendar }
    }

    /// Load policy, seasons and stored days covering `[from, to]`.
    pub async fn rate_table(&self, property_id: Ulid, from: NaiveDate, to: NaiveDate) -> Result<RateTable, BookingError> {
        let policy = self.docs.policy(property_id).await?;
        let seasons = self.docs.seasons(property_id).await?;
        let days = self
            .calendar
            .stored_days(property_id, from, to)
            .await?
            .into_iter()
            .map(|(date, entry)| (date, entry.day))
            .collect();
        Ok(RateTable::new(policy, seasons, days))
    }

    pub async fn resolve_rate(&self, property_id: Ulid, date: NaiveDate) -> Result<ResolvedRate, BookingError> {
        Ok(self.rate_table(property_id, date, date).await?.resolve(date))
    }

    pub async fn calendar_view(
        &self,
        property_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<CalendarViewDay>, BookingError> {
        check_window(from, to)?;
        let table = self.rate_table(property_id, from, to).await?;
        Ok(from
            .iter_days()
            .take_while(|d| *d <= to)
            .map(|date| {
                let day = table.day(date);
                let rate = table.resolve(date);
                CalendarViewDay {
                    date,
                    state: day.state,
                    nightly_price: rate.nightly_price,
                    minimum_stay: rate.minimum_stay,
                    season_id: rate.season_id,
                    note: day.note,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn season(name: &str, start: &str, end: &str, price: Decimal, min: u32, created_secs: i64) -> SeasonRate {
        SeasonRate {
            id: Ulid::new(),
            name: name.into(),
            start: d(start),
            end: d(end),
            price,
            minimum_stay: min,
            color: "#ef4444".into(),
            created_at: Utc.timestamp_opt(created_secs, 0).unwrap(),
        }
    }

    #[test]
    fn no_season_uses_base() {
        let table = RateTable::new(PricingPolicy::default(), vec![], BTreeMap::new());
        let r = table.resolve(d("2026-03-10"));
        assert_eq!(r.nightly_price, dec!(450));
        assert_eq!(r.minimum_stay, 3);
        assert_eq!(r.season_id, None);
    }

    #[test]
    fn single_season_applies_inside_only() {
        let high = season("Haute saison", "2026-07-01", "2026-08-31", dec!(650), 7, 1);
        let id = high.id;
        let table = RateTable::new(PricingPolicy::default(), vec![high], BTreeMap::new());

        let inside = table.resolve(d("2026-08-31"));
        assert_eq!(inside.nightly_price, dec!(650));
        assert_eq!(inside.minimum_stay, 7);
        assert_eq!(inside.season_id, Some(id));

        let outside = table.resolve(d("2026-09-01"));
        assert_eq!(outside.nightly_price, dec!(450));
        assert_eq!(outside.season_id, None);
    }

    #[test]
    fn overlapping_seasons_newest_wins() {
        let older = season("Été", "2026-06-01", "2026-09-30", dec!(600), 5, 100);
        let newer = season("Août", "2026-08-01", "2026-08-31", dec!(800), 7, 200);
        let newer_id = newer.id;
        // Insertion order must not matter.
        let table = RateTable::new(PricingPolicy::default(), vec![newer, older], BTreeMap::new());

        assert_eq!(table.resolve(d("2026-08-15")).season_id, Some(newer_id));
        assert_eq!(table.resolve(d("2026-08-15")).nightly_price, dec!(800));
        assert_eq!(table.resolve(d("2026-07-15")).nightly_price, dec!(600));
    }

    #[test]
    fn same_creation_time_breaks_tie_by_id() {
        let a = season("A", "2026-08-01", "2026-08-31", dec!(500), 3, 100);
        let b = season("B", "2026-08-01", "2026-08-31", dec!(700), 3, 100);
        let winner = if a.id > b.id { a.id } else { b.id };
        let table = RateTable::new(PricingPolicy::default(), vec![a, b], BTreeMap::new());
        assert_eq!(table.resolve(d("2026-08-10")).season_id, Some(winner));
    }

    #[test]
    fn day_override_beats_season_field_by_field() {
        let high = season("Haute saison", "2026-07-01", "2026-08-31", dec!(650), 7, 1);
        let mut days = BTreeMap::new();
        let mut day = CalendarDay::open(d("2026-07-14"));
        day.price = Some(dec!(900));
        days.insert(day.date, day);
        let table = RateTable::new(PricingPolicy::default(), vec![high], days);

        let r = table.resolve(d("2026-07-14"));
        assert_eq!(r.nightly_price, dec!(900));
        assert_eq!(r.minimum_stay, 7);
    }

    #[test]
    fn pinned_season_beats_tie_break() {
        let older = season("Été", "2026-06-01", "2026-09-30", dec!(600), 5, 100);
        let newer = season("Août", "2026-08-01", "2026-08-31", dec!(800), 7, 200);
        let older_id = older.id;
        let mut days = BTreeMap::new();
        let mut day = CalendarDay::open(d("2026-08-15"));
        day.season_id = Some(older_id);
        days.insert(day.date, day);
        let table = RateTable::new(PricingPolicy::default(), vec![older, newer], days);

        let r = table.resolve(d("2026-08-15"));
        assert_eq!(r.season_id, Some(older_id));
        assert_eq!(r.nightly_price, dec!(600));
    }

    #[test]
    fn pin_to_deleted_season_falls_back() {
        let mut days = BTreeMap::new();
        let mut day = CalendarDay::open(d("2026-08-15"));
        day.season_id = Some(Ulid::new());
        days.insert(day.date, day);
        let table = RateTable::new(PricingPolicy::default(), vec![], days);
        let r = table.resolve(d("2026-08-15"));
        assert_eq!(r.season_id, None);
        assert_eq!(r.nightly_price, dec!(450));
    }
}
