use std::collections::BTreeMap;

use chrono::{Days, NaiveDate};
use rust_decimal::Decimal;
use tracing::info;
use ulid::Ulid;

use super::docs::{date_key, from_doc, paths, to_doc, Docs};
use super::error::BookingError;
use crate::limits::{MAX_CALENDAR_WINDOW_DAYS, MAX_NOTE_LEN};
use crate::model::{BlockReason, CalendarDay, DayState};
use crate::store::{ConditionalWrite, Document, Expect};

/// A calendar day as read, plus the exact stored document it came from
/// (`None` when the day has no entry).
#[derive(Debug, Clone, PartialEq)]
pub struct CalendarEntry {
    pub day: CalendarDay,
    pub stored: Option<Document>,
}

impl CalendarEntry {
    pub fn absent(date: NaiveDate) -> Self {
        Self {
            day: CalendarDay::open(date),
            stored: None,
        }
    }

    /// Precondition matching what was read.
    pub fn expect(&self) -> Expect {
        Expect::current(self.stored.as_ref())
    }

    /// Conditional write moving this day to `next`. A default day is deleted, not stored.
    pub fn transition(&self, property_id: Ulid, next: &CalendarDay) -> Result<ConditionalWrite, BookingError> {
        let collection = paths::calendar(property_id);
        let id = date_key(next.date);
        if next.is_default() {
            Ok(ConditionalWrite::delete(collection, id, self.expect()))
        } else {
            Ok(ConditionalWrite::put(collection, id, self.expect(), to_doc(next)?))
        }
    }
}

/// Validate an inclusive admin date window.
pub fn check_window(from: NaiveDate, to: NaiveDate) -> Result<(), BookingError> {
    if to < from {
        return Err(BookingError::validation(format!("range end {to} is before start {from}")));
    }
    if (to - from).num_days() >= MAX_CALENDAR_WINDOW_DAYS {
        return Err(BookingError::validation(format!(
            "date window wider than {MAX_CALENDAR_WINDOW_DAYS} days"
        )));
    }
    Ok(())
}

fn check_note(note: &Option<String>) -> Result<(), BookingError> {
    if let Some(n) = note
        && n.len() > MAX_NOTE_LEN
    {
        return Err(BookingError::validation("note too long"));
    }
    Ok(())
}

/// Per-date state of each property.
#[derive(Clone)]
pub struct CalendarStore {
    docs: Docs,
}

impl CalendarStore {
    pub fn new(docs: Docs) -> Self {
        Self { docs }
    }

    pub async fn day(&self, property_id: Ulid, date: NaiveDate) -> Result<CalendarDay, BookingError> {
        Ok(self
            .docs
            .get(&paths::calendar(property_id), &date_key(date))
            .await?
            .unwrap_or_else(|| CalendarDay::open(date)))
    }

    /// Stored entries in `[from, to]`, keyed by date. Absent dates are Open at the resolved rate.
    pub async fn stored_days(
        &self,
        property_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<BTreeMap<NaiveDate, CalendarEntry>, BookingError> {
        let rows = self
            .docs
            .scan_raw(&paths::calendar(property_id), Some(&date_key(from)), Some(&date_key(to)))
            .await?;
        let mut out = BTreeMap::new();
        for (_, raw) in rows {
            let day: CalendarDay = from_doc(raw.clone())?;
            out.insert(
                day.date,
                CalendarEntry {
                    day,
                    stored: Some(raw),
                },
            );
        }
        Ok(out)
    }

    /// Every date in `[from, to]`, absent ones filled in as Open.
    pub async fn entries(
        &self,
        property_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<CalendarEntry>, BookingError> {
        let mut stored = self.stored_days(property_id, from, to).await?;
        Ok(from
            .iter_days()
            .take_while(|d| *d <= to)
            .map(|d| stored.remove(&d).unwrap_or_else(|| CalendarEntry::absent(d)))
            .collect())
    }

    /// Admin block over `[from, to]`. Open days become Blocked; already blocked days take the
    /// new reason and note. Any Reserved day fails the whole request with `Conflict`.
    pub async fn block(
        &self,
        property_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
        reason: BlockReason,
        note: Option<String>,
    ) -> Result<usize, BookingError> {
        check_window(from, to)?;
        check_note(&note)?;
        let entries = self.entries(property_id, from, to).await?;

        let reserved: Vec<NaiveDate> = entries
            .iter()
            .filter(|e| matches!(e.day.state, DayState::Reserved { .. }))
            .map(|e| e.day.date)
            .collect();
        if !reserved.is_empty() {
            return Err(BookingError::Conflict { dates: reserved });
        }

        let mut writes = Vec::with_capacity(entries.len());
        for entry in &entries {
            let mut next = entry.day.with_state(DayState::Blocked { reason });
            if note.is_some() {
                next.note = note.clone();
            }
            if next != entry.day {
                writes.push(entry.transition(property_id, &next)?);
            }
        }
        let count = writes.len();
        self.docs.write_all_if(writes).await?;
        info!(%property_id, %from, %to, reason = reason.as_str(), days = count, "dates blocked");
        Ok(count)
    }

    /// Lift blocks in `[from, to]`. Reserved and open days are left alone.
    pub async fn unblock(&self, property_id: Ulid, from: NaiveDate, to: NaiveDate) -> Result<usize, BookingError> {
        check_window(from, to)?;
        let stored = self.stored_days(property_id, from, to).await?;
        let mut writes = Vec::new();
        for entry in stored.values() {
            if let DayState::Blocked { .. } = entry.day.state {
                let mut next = entry.day.with_state(DayState::Open);
                next.note = None;
                writes.push(entry.transition(property_id, &next)?);
            }
        }
        let count = writes.len();
        self.docs.write_all_if(writes).await?;
        info!(%property_id, %from, %to, days = count, "dates unblocked");
        Ok(count)
    }

    /// Set (or clear, with `None`) the per-day price and minimum-stay overrides on every
    /// non-blocked day of `[from, to]`. Availability state is unchanged.
    pub async fn set_overrides(
        &self,
        property_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
        price: Option<Decimal>,
        minimum_stay: Option<u32>,
        note: Option<String>,
    ) -> Result<usize, BookingError> {
        check_window(from, to)?;
        check_note(&note)?;
        if let Some(p) = price
            && p.is_sign_negative()
        {
            return Err(BookingError::validation("override price must not be negative"));
        }
        if minimum_stay == Some(0) {
            return Err(BookingError::validation("override minimum stay must be at least 1"));
        }

        let entries = self.entries(property_id, from, to).await?;
        let mut writes = Vec::new();
        for entry in &entries {
            if matches!(entry.day.state, DayState::Blocked { .. }) {
                continue;
            }
            let next = CalendarDay {
                price,
                minimum_stay,
                note: note.clone().or_else(|| entry.day.note.clone()),
                ..entry.day.clone()
            };
            if next != entry.day {
                writes.push(entry.transition(property_id, &next)?);
            }
        }
        let count = writes.len();
        self.docs.write_all_if(writes).await?;
        info!(%property_id, %from, %to, days = count, "day overrides set");
        Ok(count)
    }

    /// Pin (or unpin) a season on every day of `[from, to]`.
    pub async fn pin_season(
        &self,
        property_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
        season_id: Option<Ulid>,
    ) -> Result<usize, BookingError> {
        check_window(from, to)?;
        let entries = self.entries(property_id, from, to).await?;
        let mut writes = Vec::new();
        for entry in &entries {
            let next = CalendarDay {
                season_id,
                ..entry.day.clone()
            };
            if next != entry.day {
                writes.push(entry.transition(property_id, &next)?);
            }
        }
        let count = writes.len();
        self.docs.write_all_if(writes).await?;
        Ok(count)
    }

    /// Remove a season pin wherever it appears (used when the season is deleted).
    pub(crate) async fn unpin_everywhere(&self, property_id: Ulid, season_id: Ulid) -> Result<usize, BookingError> {
        let rows = self.docs.scan_raw(&paths::calendar(property_id), None, None).await?;
        let mut writes = Vec::new();
        for (_, raw) in rows {
            let day: CalendarDay = from_doc(raw.clone())?;
            if day.season_id == Some(season_id) {
                let entry = CalendarEntry { day, stored: Some(raw) };
                let next = CalendarDay {
                    season_id: None,
                    ..entry.day.clone()
                };
                writes.push(entry.transition(property_id, &next)?);
            }
        }
        let count = writes.len();
        self.docs.write_all_if(writes).await?;
        Ok(count)
    }
}

/// The day before `date`; used to turn an exclusive check-out into an inclusive last night.
pub fn previous_day(date: NaiveDate) -> NaiveDate {
    date.checked_sub_days(Days::new(1)).unwrap_or(date)
}
