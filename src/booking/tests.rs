use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Days, NaiveDate};
use rust_decimal_macros::dec;
use ulid::Ulid;

use super::*;
use crate::model::{
    BlockReason, DayState, GuestContact, PricingPolicy, Property, PropertyStatus, ReservationRequest,
    ReservationStatus, SeasonDraft,
};
use crate::notify::BookingEvent;
use crate::store::{ConditionalWrite, Document, StoreError, WalStore};

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("benb_test_booking");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    let _ = std::fs::remove_file(path.with_extension("wal.tmp"));
    path
}

fn d(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

const TODAY: &str = "2026-05-01";

struct Harness {
    booking: Booking,
    store: Arc<WalStore>,
    property_id: Ulid,
}

async fn harness_over(store: Arc<dyn DocumentStore>, wal: Arc<WalStore>, config: BookingConfig) -> Harness {
    let booking = Booking::new(
        store,
        Arc::new(NotifyHub::new()),
        Arc::new(FixedClock::on(d(TODAY))),
        config,
    );
    let property_id = Ulid::new();
    booking
        .admin
        .upsert_property(Property::new(property_id, "Villa Les Oliviers", 6))
        .await
        .unwrap();
    Harness {
        booking,
        store: wal,
        property_id,
    }
}

async fn harness(name: &str) -> Harness {
    let wal = Arc::new(WalStore::open(test_wal_path(name)).unwrap());
    harness_over(wal.clone(), wal, BookingConfig::default()).await
}

fn request(property_id: Ulid, check_in: &str, check_out: &str, guests: u32) -> ReservationRequest {
    ReservationRequest {
        property_id,
        check_in: d(check_in),
        check_out: d(check_out),
        guests,
        guest: GuestContact {
            name: "Camille Martin".into(),
            email: "camille@example.fr".into(),
            phone: "+33 6 11 22 33 44".into(),
        },
        special_requests: Some("Arrivée tardive".into()),
    }
}

fn nights(from: &str, to: &str) -> crate::model::NightSet {
    crate::model::stay_nights(d(from), d(to))
}

// ── Pricing scenarios ───────────────────────────────────────────

#[tokio::test]
async fn quote_three_nights_two_guests() {
    let h = harness("quote_1562.wal").await;
    let q = h.booking.quote(h.property_id, d("2026-06-10"), d("2026-06-13"), 2).await.unwrap();
    assert_eq!(q.subtotal, dec!(1350));
    assert_eq!(q.occupancy_tax, dec!(12));
    assert_eq!(q.total, dec!(1562));
    assert!(q.discounts.is_empty());
}

#[tokio::test]
async fn quote_week_gets_weekly_discount() {
    let h = harness("quote_weekly.wal").await;
    let q = h.booking.quote(h.property_id, d("2026-06-10"), d("2026-06-17"), 2).await.unwrap();
    assert_eq!(q.subtotal, dec!(3150));
    assert_eq!(q.discount_total(), dec!(315));
    assert_eq!(q.discounted_subtotal, dec!(2835));
    assert_eq!(q.total, dec!(2835) + dec!(200) + dec!(28));
}

#[tokio::test]
async fn quote_unknown_property_is_validation() {
    let h = harness("quote_unknown.wal").await;
    let err = h.booking.quote(Ulid::new(), d("2026-06-10"), d("2026-06-13"), 2).await.unwrap_err();
    assert!(matches!(err, BookingError::Validation(_)));
}

#[tokio::test]
async fn stored_policy_and_season_drive_the_quote() {
    let h = harness("quote_policy_season.wal").await;
    let mut policy = PricingPolicy::default();
    policy.base_price = dec!(300);
    policy.cleaning_fee = dec!(100);
    h.booking.admin.set_pricing_policy(h.property_id, policy).await.unwrap();
    h.booking
        .admin
        .create_season(
            h.property_id,
            SeasonDraft {
                name: "Juin".into(),
                start: d("2026-06-12"),
                end: d("2026-06-30"),
                price: dec!(400),
                minimum_stay: 2,
                color: "#22c55e".into(),
            },
        )
        .await
        .unwrap();

    let q = h.booking.quote(h.property_id, d("2026-06-10"), d("2026-06-14"), 1).await.unwrap();
    let prices: Vec<_> = q.nights.iter().map(|n| n.nightly_price).collect();
    assert_eq!(prices, vec![dec!(300), dec!(300), dec!(400), dec!(400)]);
    assert_eq!(q.total, dec!(1400) + dec!(100) + dec!(8));
}

// ── Reservation workflow ────────────────────────────────────────

#[tokio::test]
async fn create_reservation_persists_pending_record() {
    let h = harness("create_pending.wal").await;
    let mut events = h.booking.notify.subscribe(h.property_id);

    let id = h
        .booking
        .workflow
        .create_reservation(request(h.property_id, "2026-06-10", "2026-06-13", 2))
        .await
        .unwrap();

    let r = h.booking.workflow.get_reservation(id).await.unwrap().unwrap();
    assert_eq!(r.status, ReservationStatus::Pending);
    assert_eq!(r.nights, 3);
    assert_eq!(r.price_per_night, dec!(450));
    assert_eq!(r.total_price, dec!(1562));
    assert_eq!(r.currency, "EUR");

    for night in nights("2026-06-10", "2026-06-13") {
        let day = h.booking.calendar.day(h.property_id, night).await.unwrap();
        assert_eq!(day.state, DayState::Reserved { reservation_id: id });
    }
    assert_eq!(
        h.booking.calendar.day(h.property_id, d("2026-06-13")).await.unwrap().state,
        DayState::Open
    );

    match events.recv().await.unwrap() {
        BookingEvent::ReservationCreated { reservation_id, total_price, .. } => {
            assert_eq!(reservation_id, id);
            assert_eq!(total_price, dec!(1562));
        }
        other => panic!("expected ReservationCreated, got {other:?}"),
    }
    assert!(h.booking.verify_ledger(h.property_id).await.unwrap().is_consistent());
}

#[tokio::test]
async fn booking_a_reserved_night_is_unavailable() {
    let h = harness("reserved_unavailable.wal").await;
    h.booking
        .workflow
        .create_reservation(request(h.property_id, "2026-06-10", "2026-06-13", 2))
        .await
        .unwrap();

    let err = h
        .booking
        .workflow
        .create_reservation(request(h.property_id, "2026-06-12", "2026-06-16", 2))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        BookingError::Unavailable(UnavailableReason::DatesNotOpen {
            dates: vec![d("2026-06-12")]
        })
    );

    // Back-to-back stays share the turnover day.
    h.booking
        .workflow
        .create_reservation(request(h.property_id, "2026-06-13", "2026-06-16", 2))
        .await
        .unwrap();
}

#[tokio::test]
async fn invalid_contact_claims_nothing() {
    let h = harness("invalid_contact.wal").await;
    let mut req = request(h.property_id, "2026-06-10", "2026-06-13", 2);
    req.guest.email = "not-an-email".into();
    let err = h.booking.workflow.create_reservation(req).await.unwrap_err();
    assert!(matches!(err, BookingError::Validation(_)));
    assert!(h.booking.calendar.stored_days(h.property_id, d("2026-06-10"), d("2026-06-12")).await.unwrap().is_empty());
}

#[tokio::test]
async fn inactive_property_is_unavailable() {
    let h = harness("inactive_property.wal").await;
    let mut p = h.booking.admin.get_property(h.property_id).await.unwrap().unwrap();
    p.status = PropertyStatus::Inactive;
    h.booking.admin.upsert_property(p).await.unwrap();

    let err = h
        .booking
        .workflow
        .create_reservation(request(h.property_id, "2026-06-10", "2026-06-13", 2))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BookingError::Unavailable(UnavailableReason::PropertyInactive { .. })
    ));
}

#[tokio::test]
async fn cancel_frees_nights_and_is_idempotent() {
    let h = harness("cancel.wal").await;
    let id = h
        .booking
        .workflow
        .create_reservation(request(h.property_id, "2026-06-10", "2026-06-13", 2))
        .await
        .unwrap();
    let mut events = h.booking.notify.subscribe(h.property_id);

    let cancelled = h.booking.workflow.cancel_reservation(id).await.unwrap();
    assert_eq!(cancelled.status, ReservationStatus::Cancelled);
    assert!(h
        .booking
        .calendar
        .stored_days(h.property_id, d("2026-06-10"), d("2026-06-12"))
        .await
        .unwrap()
        .is_empty());
    assert!(matches!(
        events.recv().await.unwrap(),
        BookingEvent::ReservationCancelled { reservation_id, .. } if reservation_id == id
    ));

    let again = h.booking.workflow.cancel_reservation(id).await.unwrap();
    assert_eq!(again.status, ReservationStatus::Cancelled);
    assert!(h.booking.verify_ledger(h.property_id).await.unwrap().is_consistent());

    // The nights can be booked again.
    h.booking
        .workflow
        .create_reservation(request(h.property_id, "2026-06-10", "2026-06-13", 2))
        .await
        .unwrap();
}

#[tokio::test]
async fn status_transitions() {
    let h = harness("status_transitions.wal").await;
    let id = h
        .booking
        .workflow
        .create_reservation(request(h.property_id, "2026-06-10", "2026-06-13", 2))
        .await
        .unwrap();

    let r = h.booking.workflow.update_status(id, ReservationStatus::Confirmed).await.unwrap();
    assert_eq!(r.status, ReservationStatus::Confirmed);
    let err = h.booking.workflow.update_status(id, ReservationStatus::Pending).await.unwrap_err();
    assert!(matches!(err, BookingError::Validation(_)));

    let r = h.booking.workflow.update_status(id, ReservationStatus::Completed).await.unwrap();
    assert_eq!(r.status, ReservationStatus::Completed);
    // Completed stays still hold their nights.
    assert!(h.booking.verify_ledger(h.property_id).await.unwrap().is_consistent());

    let err = h.booking.workflow.cancel_reservation(id).await.unwrap_err();
    assert!(matches!(err, BookingError::Validation(_)));
    let err = h.booking.workflow.cancel_reservation(Ulid::new()).await.unwrap_err();
    assert!(matches!(err, BookingError::Validation(_)));
}

#[tokio::test]
async fn list_reservations_newest_check_in_first() {
    let h = harness("list_reservations.wal").await;
    let early = h
        .booking
        .workflow
        .create_reservation(request(h.property_id, "2026-06-01", "2026-06-04", 2))
        .await
        .unwrap();
    let late = h
        .booking
        .workflow
        .create_reservation(request(h.property_id, "2026-07-01", "2026-07-04", 2))
        .await
        .unwrap();
    let listed: Vec<Ulid> = h
        .booking
        .workflow
        .list_reservations(h.property_id)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(listed, vec![late, early]);
    assert!(h.booking.workflow.list_reservations(Ulid::new()).await.unwrap().is_empty());
}

// ── Ledger ──────────────────────────────────────────────────────

#[tokio::test]
async fn release_restores_overrides_exactly() {
    let h = harness("release_roundtrip.wal").await;
    let pid = h.property_id;
    h.booking
        .admin
        .set_day_overrides(pid, d("2026-06-11"), d("2026-06-11"), Some(dec!(900)), None, Some("Feu d'artifice".into()))
        .await
        .unwrap();
    let collection = docs::paths::calendar(pid);
    let before = h.store.get(&collection, "2026-06-11").await.unwrap();
    assert!(before.is_some());

    let token = h
        .booking
        .ledger
        .try_reserve(pid, Ulid::new(), &nights("2026-06-10", "2026-06-13"))
        .await
        .unwrap();
    assert_eq!(h.booking.ledger.release(&token).await.unwrap(), 3);

    assert_eq!(h.store.get(&collection, "2026-06-11").await.unwrap(), before);
    assert_eq!(h.store.get(&collection, "2026-06-10").await.unwrap(), None);
    assert_eq!(h.store.get(&collection, "2026-06-12").await.unwrap(), None);

    // Second release finds nothing to do.
    assert_eq!(h.booking.ledger.release(&token).await.unwrap(), 0);
}

#[tokio::test]
async fn release_leaves_other_reservations_alone() {
    let h = harness("release_scoped.wal").await;
    let pid = h.property_id;
    let mine = h
        .booking
        .ledger
        .try_reserve(pid, Ulid::new(), &nights("2026-06-10", "2026-06-13"))
        .await
        .unwrap();
    h.booking.ledger.release(&mine).await.unwrap();

    let theirs_id = Ulid::new();
    h.booking
        .ledger
        .try_reserve(pid, theirs_id, &nights("2026-06-10", "2026-06-13"))
        .await
        .unwrap();

    // A stale release of the first claim must not free the second.
    assert_eq!(h.booking.ledger.release(&mine).await.unwrap(), 0);
    let day = h.booking.calendar.day(pid, d("2026-06-11")).await.unwrap();
    assert_eq!(day.state, DayState::Reserved { reservation_id: theirs_id });
}

#[tokio::test]
async fn try_reserve_is_all_or_nothing() {
    let h = harness("reserve_all_or_nothing.wal").await;
    let pid = h.property_id;
    h.booking
        .admin
        .block_dates(pid, d("2026-06-12"), d("2026-06-12"), BlockReason::Maintenance, None)
        .await
        .unwrap();

    let err = h
        .booking
        .ledger
        .try_reserve(pid, Ulid::new(), &nights("2026-06-10", "2026-06-14"))
        .await
        .unwrap_err();
    assert_eq!(err, BookingError::Conflict { dates: vec![d("2026-06-12")] });
    for night in ["2026-06-10", "2026-06-11", "2026-06-13"] {
        assert!(h.booking.calendar.day(pid, d(night)).await.unwrap().is_open());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_claims_have_exactly_one_winner() {
    let h = harness("concurrent_claims.wal").await;
    let pid = h.property_id;
    let start = d("2026-06-01");

    for round in 0..50u64 {
        let check_in = start.checked_add_days(Days::new(round * 5)).unwrap();
        let mut handles = Vec::new();
        for racer in 0..8u64 {
            let ledger = h.booking.ledger.clone();
            // Staggered stays that all share `check_in + 2`.
            let ci = check_in.checked_add_days(Days::new(racer % 3)).unwrap();
            let co = ci.checked_add_days(Days::new(3)).unwrap();
            handles.push(tokio::spawn(async move {
                ledger.try_reserve(pid, Ulid::new(), &crate::model::stay_nights(ci, co)).await
            }));
        }
        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(BookingError::Conflict { .. }) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(winners, 1, "round {round}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_pair_never_both_win() {
    let h = harness("racing_pair.wal").await;
    let pid = h.property_id;
    let a = nights("2026-06-10", "2026-06-13");
    let b = nights("2026-06-12", "2026-06-15");

    for run in 0..1000 {
        let (la, lb) = (h.booking.ledger.clone(), h.booking.ledger.clone());
        let (na, nb) = (a.clone(), b.clone());
        let ta = tokio::spawn(async move { la.try_reserve(pid, Ulid::new(), &na).await });
        let tb = tokio::spawn(async move { lb.try_reserve(pid, Ulid::new(), &nb).await });
        let results = [ta.await.unwrap(), tb.await.unwrap()];

        let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(winners.len(), 1, "run {run}: {results:?}");
        assert!(
            results.iter().any(|r| matches!(r, Err(BookingError::Conflict { .. }))),
            "run {run}"
        );
        h.booking.ledger.release(winners[0]).await.unwrap();
    }
    assert!(h.booking.verify_ledger(pid).await.unwrap().is_consistent());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_reservations_never_double_book() {
    let h = harness("concurrent_reservations.wal").await;
    let pid = h.property_id;

    let mut handles = Vec::new();
    for i in 0..16u64 {
        let workflow = h.booking.workflow.clone();
        let ci = d("2026-06-10").checked_add_days(Days::new(i % 4)).unwrap();
        let co = ci.checked_add_days(Days::new(4)).unwrap();
        let req = ReservationRequest {
            check_in: ci,
            check_out: co,
            ..request(pid, "2026-06-10", "2026-06-14", 2)
        };
        handles.push(tokio::spawn(async move { workflow.create_reservation(req).await }));
    }

    let mut created = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => created += 1,
            Err(BookingError::Unavailable(_)) | Err(BookingError::Conflict { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert!(created >= 1);
    let report = h.booking.verify_ledger(pid).await.unwrap();
    assert!(report.is_consistent(), "{report:?}");
}

#[tokio::test]
async fn verify_reports_orphaned_nights() {
    let h = harness("verify_orphaned.wal").await;
    let rid = Ulid::new();
    h.booking
        .ledger
        .try_reserve(h.property_id, rid, &nights("2026-06-10", "2026-06-12"))
        .await
        .unwrap();
    let report = h.booking.verify_ledger(h.property_id).await.unwrap();
    assert_eq!(report.orphaned, vec![(d("2026-06-10"), rid), (d("2026-06-11"), rid)]);
    assert!(report.missing.is_empty());
}

// ── Calendar admin ──────────────────────────────────────────────

#[tokio::test]
async fn block_rejects_reserved_days_and_unblock_restores() {
    let h = harness("block_unblock.wal").await;
    let pid = h.property_id;
    h.booking
        .workflow
        .create_reservation(request(pid, "2026-06-10", "2026-06-13", 2))
        .await
        .unwrap();

    let err = h
        .booking
        .admin
        .block_dates(pid, d("2026-06-12"), d("2026-06-15"), BlockReason::Blocked, None)
        .await
        .unwrap_err();
    assert_eq!(err, BookingError::Conflict { dates: vec![d("2026-06-12")] });

    let n = h
        .booking
        .admin
        .block_dates(pid, d("2026-06-20"), d("2026-06-22"), BlockReason::Maintenance, Some("Peinture".into()))
        .await
        .unwrap();
    assert_eq!(n, 3);
    let err = h
        .booking
        .check_availability(pid, d("2026-06-19"), d("2026-06-23"), 2)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BookingError::Unavailable(UnavailableReason::DatesNotOpen { ref dates }) if dates.len() == 3
    ));

    assert_eq!(h.booking.admin.unblock_dates(pid, d("2026-06-01"), d("2026-06-30")).await.unwrap(), 3);
    assert!(h.booking.check_availability(pid, d("2026-06-19"), d("2026-06-23"), 2).await.is_ok());
    // Reserved nights survive an unblock over them.
    assert!(matches!(
        h.booking.calendar.day(pid, d("2026-06-11")).await.unwrap().state,
        DayState::Reserved { .. }
    ));
}

#[tokio::test]
async fn calendar_view_reports_effective_rates() {
    let h = harness("calendar_view.wal").await;
    let pid = h.property_id;
    h.booking
        .admin
        .set_day_overrides(pid, d("2026-06-02"), d("2026-06-02"), Some(dec!(999)), Some(4), None)
        .await
        .unwrap();
    let view = h.booking.rates.calendar_view(pid, d("2026-06-01"), d("2026-06-03")).await.unwrap();
    assert_eq!(view.len(), 3);
    assert_eq!(view[0].nightly_price, dec!(450));
    assert_eq!(view[1].nightly_price, dec!(999));
    assert_eq!(view[1].minimum_stay, 4);
    assert_eq!(view[1].state, DayState::Open);
}

// ── Seasons ─────────────────────────────────────────────────────

fn draft(name: &str, start: &str, end: &str, price: rust_decimal::Decimal) -> SeasonDraft {
    SeasonDraft {
        name: name.into(),
        start: d(start),
        end: d(end),
        price,
        minimum_stay: 3,
        color: "#f59e0b".into(),
    }
}

#[tokio::test]
async fn season_crud() {
    let h = harness("season_crud.wal").await;
    let pid = h.property_id;
    let admin = &h.booking.admin;

    let aout = admin.create_season(pid, draft("Août", "2026-08-01", "2026-08-31", dec!(800))).await.unwrap();
    let juin = admin.create_season(pid, draft("Juin", "2026-06-01", "2026-06-30", dec!(500))).await.unwrap();
    let names: Vec<_> = admin.list_seasons(pid).await.unwrap().into_iter().map(|s| s.name).collect();
    assert_eq!(names, vec!["Juin", "Août"]);

    let updated = admin
        .update_season(pid, juin.id, draft("Juin", "2026-06-01", "2026-06-30", dec!(550)))
        .await
        .unwrap();
    assert_eq!(updated.price, dec!(550));
    assert_eq!(updated.created_at, juin.created_at);

    let copy = admin.duplicate_season(pid, aout.id).await.unwrap();
    assert_eq!(copy.name, "Août (copy)");
    assert!(copy.creation_order() > aout.creation_order());

    assert!(admin.delete_season(pid, aout.id).await.unwrap());
    assert!(!admin.delete_season(pid, aout.id).await.unwrap());
    assert_eq!(admin.list_seasons(pid).await.unwrap().len(), 2);

    let err = admin
        .update_season(pid, Ulid::new(), draft("X", "2026-06-01", "2026-06-30", dec!(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, BookingError::Validation(_)));
    let err = admin
        .create_season(Ulid::new(), draft("X", "2026-06-01", "2026-06-30", dec!(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, BookingError::Validation(_)));
}

#[tokio::test]
async fn deleting_a_pinned_season_unpins_it() {
    let h = harness("season_unpin.wal").await;
    let pid = h.property_id;
    let ete = h
        .booking
        .admin
        .create_season(pid, draft("Été", "2026-06-01", "2026-09-30", dec!(600)))
        .await
        .unwrap();
    h.booking
        .admin
        .create_season(pid, draft("Août", "2026-08-01", "2026-08-31", dec!(800)))
        .await
        .unwrap();
    h.booking
        .admin
        .pin_season(pid, d("2026-08-15"), d("2026-08-15"), Some(ete.id))
        .await
        .unwrap();
    assert_eq!(
        h.booking.rates.resolve_rate(pid, d("2026-08-15")).await.unwrap().nightly_price,
        dec!(600)
    );

    h.booking.admin.delete_season(pid, ete.id).await.unwrap();
    assert_eq!(h.store.get(&docs::paths::calendar(pid), "2026-08-15").await.unwrap(), None);
    assert_eq!(
        h.booking.rates.resolve_rate(pid, d("2026-08-15")).await.unwrap().nightly_price,
        dec!(800)
    );
}

// ── Failure handling ────────────────────────────────────────────

/// Store wrapper that fails chosen batches.
struct FlakyStore {
    inner: Arc<WalStore>,
    /// Fail batches that write a reservation record.
    fail_record_writes: AtomicBool,
    /// Fail batches carrying the "reservation absent" guard of a compensating release.
    fail_guarded_releases: AtomicBool,
    /// Apply record writes but report failure.
    lose_record_acks: AtomicBool,
    /// Apply claim batches at once but answer only after 500 ms.
    ack_claims_late: AtomicBool,
    /// Apply claim batches after 300 ms, whether or not the caller still waits.
    land_claims_late: AtomicBool,
}

impl FlakyStore {
    fn new(inner: Arc<WalStore>) -> Self {
        Self {
            inner,
            fail_record_writes: AtomicBool::new(false),
            fail_guarded_releases: AtomicBool::new(false),
            lose_record_acks: AtomicBool::new(false),
            ack_claims_late: AtomicBool::new(false),
            land_claims_late: AtomicBool::new(false),
        }
    }
}

fn touches_records(writes: &[ConditionalWrite], put: bool) -> bool {
    writes
        .iter()
        .any(|w| w.collection == docs::paths::RESERVATIONS && w.new.is_some() == put)
}

/// A ledger claim: calendar writes with no reservation record or guard alongside.
fn is_claim(writes: &[ConditionalWrite]) -> bool {
    writes.iter().all(|w| w.collection.ends_with("/calendar"))
}

#[async_trait]
impl DocumentStore for FlakyStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        self.inner.get(collection, id).await
    }

    async fn scan(
        &self,
        collection: &str,
        from: Option<&str>,
        to: Option<&str>,
    ) -> Result<Vec<(String, Document)>, StoreError> {
        self.inner.scan(collection, from, to).await
    }

    async fn write_all_if(&self, writes: Vec<ConditionalWrite>) -> Result<(), StoreError> {
        if self.fail_record_writes.load(Ordering::SeqCst) && touches_records(&writes, true) {
            return Err(StoreError::Wal("injected write failure".into()));
        }
        if self.fail_guarded_releases.load(Ordering::SeqCst) && touches_records(&writes, false) {
            return Err(StoreError::Wal("injected release failure".into()));
        }
        if self.ack_claims_late.load(Ordering::SeqCst) && is_claim(&writes) {
            self.inner.write_all_if(writes).await?;
            tokio::time::sleep(Duration::from_millis(500)).await;
            return Ok(());
        }
        if self.land_claims_late.load(Ordering::SeqCst) && is_claim(&writes) {
            let inner = self.inner.clone();
            return tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                inner.write_all_if(writes).await
            })
            .await
            .map_err(|e| StoreError::Wal(e.to_string()))?;
        }
        if self.lose_record_acks.load(Ordering::SeqCst) && touches_records(&writes, true) {
            self.inner.write_all_if(writes).await?;
            return Err(StoreError::Wal("injected lost acknowledgement".into()));
        }
        self.inner.write_all_if(writes).await
    }
}

async fn flaky_harness(name: &str, release_retries: u32) -> (Harness, Arc<FlakyStore>) {
    let wal = Arc::new(WalStore::open(test_wal_path(name)).unwrap());
    let flaky = Arc::new(FlakyStore::new(wal.clone()));
    let config = BookingConfig {
        release_retries,
        reconcile_max_attempts: 3,
        ..BookingConfig::default()
    };
    (harness_over(flaky.clone(), wal, config).await, flaky)
}

#[tokio::test]
async fn failed_persist_releases_claim() {
    let (h, flaky) = flaky_harness("persist_fails.wal", 1).await;
    flaky.fail_record_writes.store(true, Ordering::SeqCst);

    let err = h
        .booking
        .workflow
        .create_reservation(request(h.property_id, "2026-06-10", "2026-06-13", 2))
        .await
        .unwrap_err();
    assert!(matches!(err, BookingError::Persistence(_)));

    assert!(h
        .booking
        .calendar
        .stored_days(h.property_id, d("2026-06-10"), d("2026-06-12"))
        .await
        .unwrap()
        .is_empty());
    assert!(h.booking.workflow.list_reservations(h.property_id).await.unwrap().is_empty());
    assert_eq!(h.booking.reconciler.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn lost_acknowledgement_keeps_the_reservation() {
    let (h, flaky) = flaky_harness("lost_ack.wal", 1).await;
    flaky.lose_record_acks.store(true, Ordering::SeqCst);

    let id = h
        .booking
        .workflow
        .create_reservation(request(h.property_id, "2026-06-10", "2026-06-13", 2))
        .await
        .unwrap();
    assert!(h.booking.workflow.get_reservation(id).await.unwrap().is_some());
    assert!(h.booking.verify_ledger(h.property_id).await.unwrap().is_consistent());
}

#[tokio::test]
async fn failed_release_goes_to_reconciler() {
    let (h, flaky) = flaky_harness("reconcile.wal", 1).await;
    flaky.fail_record_writes.store(true, Ordering::SeqCst);
    flaky.fail_guarded_releases.store(true, Ordering::SeqCst);

    let err = h
        .booking
        .workflow
        .create_reservation(request(h.property_id, "2026-06-10", "2026-06-13", 2))
        .await
        .unwrap_err();
    assert!(matches!(err, BookingError::Persistence(_)));
    assert_eq!(h.booking.reconciler.pending_count().await.unwrap(), 1);
    assert_eq!(h.booking.verify_ledger(h.property_id).await.unwrap().orphaned.len(), 3);

    // Still failing: stays queued.
    assert_eq!(h.booking.reconciler.run_once(&h.booking.ledger).await, 0);
    assert_eq!(h.booking.reconciler.pending_count().await.unwrap(), 1);

    flaky.fail_guarded_releases.store(false, Ordering::SeqCst);
    assert_eq!(h.booking.reconciler.run_once(&h.booking.ledger).await, 1);
    assert_eq!(h.booking.reconciler.pending_count().await.unwrap(), 0);
    assert!(h.booking.verify_ledger(h.property_id).await.unwrap().is_consistent());
}

#[tokio::test]
async fn reconciler_parks_after_max_attempts() {
    let (h, flaky) = flaky_harness("reconcile_manual.wal", 0).await;
    flaky.fail_record_writes.store(true, Ordering::SeqCst);
    flaky.fail_guarded_releases.store(true, Ordering::SeqCst);

    h.booking
        .workflow
        .create_reservation(request(h.property_id, "2026-06-10", "2026-06-13", 2))
        .await
        .unwrap_err();

    for _ in 0..3 {
        h.booking.reconciler.run_once(&h.booking.ledger).await;
    }
    assert_eq!(h.booking.reconciler.pending_count().await.unwrap(), 0);
    let parked = h.booking.reconciler.needs_manual().await.unwrap();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].attempts, 3);
    assert!(parked[0].last_error.is_some());
}

async fn late_claim_harness(name: &str) -> (Harness, Arc<FlakyStore>) {
    let wal = Arc::new(WalStore::open(test_wal_path(name)).unwrap());
    let flaky = Arc::new(FlakyStore::new(wal.clone()));
    let config = BookingConfig {
        store_timeout: Duration::from_millis(100),
        release_retries: 1,
        ..BookingConfig::default()
    };
    (harness_over(flaky.clone(), wal, config).await, flaky)
}

#[tokio::test]
async fn timed_out_claim_that_landed_is_released() {
    let (h, flaky) = late_claim_harness("claim_late_ack.wal").await;
    flaky.ack_claims_late.store(true, Ordering::SeqCst);

    let err = h
        .booking
        .workflow
        .create_reservation(request(h.property_id, "2026-06-10", "2026-06-13", 2))
        .await
        .unwrap_err();
    assert!(matches!(err, BookingError::Persistence(_)));

    assert!(h.booking.workflow.list_reservations(h.property_id).await.unwrap().is_empty());
    assert!(h
        .booking
        .calendar
        .stored_days(h.property_id, d("2026-06-10"), d("2026-06-12"))
        .await
        .unwrap()
        .is_empty());
    assert!(h.booking.verify_ledger(h.property_id).await.unwrap().is_consistent());
    assert_eq!(h.booking.reconciler.pending_count().await.unwrap(), 0);

    flaky.ack_claims_late.store(false, Ordering::SeqCst);
    h.booking
        .workflow
        .create_reservation(request(h.property_id, "2026-06-10", "2026-06-13", 2))
        .await
        .unwrap();
}

#[tokio::test]
async fn timed_out_claim_landing_later_is_reconciled() {
    let (h, flaky) = late_claim_harness("claim_lands_late.wal").await;
    flaky.land_claims_late.store(true, Ordering::SeqCst);

    let err = h
        .booking
        .workflow
        .create_reservation(request(h.property_id, "2026-06-10", "2026-06-13", 2))
        .await
        .unwrap_err();
    assert!(matches!(err, BookingError::Persistence(_)));
    assert_eq!(h.booking.reconciler.pending_count().await.unwrap(), 1);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(h.booking.verify_ledger(h.property_id).await.unwrap().orphaned.len(), 3);

    assert_eq!(h.booking.reconciler.run_once(&h.booking.ledger).await, 1);
    assert_eq!(h.booking.reconciler.pending_count().await.unwrap(), 0);
    assert!(h.booking.verify_ledger(h.property_id).await.unwrap().is_consistent());
}

#[tokio::test]
async fn pending_release_survives_restart() {
    let path = test_wal_path("reconcile_restart.wal");
    let pid = {
        let wal = Arc::new(WalStore::open(path.clone()).unwrap());
        let flaky = Arc::new(FlakyStore::new(wal.clone()));
        let config = BookingConfig {
            release_retries: 0,
            ..BookingConfig::default()
        };
        let h = harness_over(flaky.clone(), wal, config).await;
        flaky.fail_record_writes.store(true, Ordering::SeqCst);
        flaky.fail_guarded_releases.store(true, Ordering::SeqCst);
        h.booking
            .workflow
            .create_reservation(request(h.property_id, "2026-06-10", "2026-06-13", 2))
            .await
            .unwrap_err();
        assert_eq!(h.booking.reconciler.pending_count().await.unwrap(), 1);
        h.property_id
    };

    let wal = Arc::new(WalStore::open(path).unwrap());
    let booking = Booking::new(
        wal,
        Arc::new(NotifyHub::new()),
        Arc::new(FixedClock::on(d(TODAY))),
        BookingConfig::default(),
    );
    assert_eq!(booking.reconciler.pending_count().await.unwrap(), 1);
    assert_eq!(booking.verify_ledger(pid).await.unwrap().orphaned.len(), 3);

    assert_eq!(booking.reconciler.run_once(&booking.ledger).await, 1);
    assert_eq!(booking.reconciler.pending_count().await.unwrap(), 0);
    assert!(booking.verify_ledger(pid).await.unwrap().is_consistent());
}

#[tokio::test]
async fn startup_sweep_queues_orphaned_claims() {
    let path = test_wal_path("orphan_sweep.wal");
    let (pid, kept) = {
        let wal = Arc::new(WalStore::open(path.clone()).unwrap());
        let h = harness_over(wal.clone(), wal, BookingConfig::default()).await;
        // Claimed, then the process went away before the record was written.
        h.booking
            .ledger
            .try_reserve(h.property_id, Ulid::new(), &nights("2026-06-10", "2026-06-13"))
            .await
            .unwrap();
        let kept = h
            .booking
            .workflow
            .create_reservation(request(h.property_id, "2026-07-01", "2026-07-04", 2))
            .await
            .unwrap();
        (h.property_id, kept)
    };

    let wal = Arc::new(WalStore::open(path).unwrap());
    let booking = Booking::new(
        wal,
        Arc::new(NotifyHub::new()),
        Arc::new(FixedClock::on(d(TODAY))),
        BookingConfig::default(),
    );
    assert_eq!(booking.recover_orphaned_claims().await.unwrap(), 1);
    assert_eq!(booking.recover_orphaned_claims().await.unwrap(), 0);

    assert_eq!(booking.reconciler.run_once(&booking.ledger).await, 1);
    assert!(booking.verify_ledger(pid).await.unwrap().is_consistent());
    assert!(booking.workflow.get_reservation(kept).await.unwrap().is_some());
    assert!(booking
        .check_availability(pid, d("2026-06-10"), d("2026-06-13"), 2)
        .await
        .is_ok());
}

/// Store whose reads never answer in time.
struct SlowStore(Arc<WalStore>);

#[async_trait]
impl DocumentStore for SlowStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        tokio::time::sleep(Duration::from_millis(500)).await;
        self.0.get(collection, id).await
    }

    async fn scan(
        &self,
        collection: &str,
        from: Option<&str>,
        to: Option<&str>,
    ) -> Result<Vec<(String, Document)>, StoreError> {
        self.0.scan(collection, from, to).await
    }

    async fn write_all_if(&self, writes: Vec<ConditionalWrite>) -> Result<(), StoreError> {
        self.0.write_all_if(writes).await
    }
}

#[tokio::test]
async fn store_timeout_is_persistence_error() {
    let wal = Arc::new(WalStore::open(test_wal_path("slow_store.wal")).unwrap());
    let config = BookingConfig {
        store_timeout: Duration::from_millis(50),
        ..BookingConfig::default()
    };
    let h = harness_over(Arc::new(SlowStore(wal.clone())), wal, config).await;
    let err = h
        .booking
        .quote(h.property_id, d("2026-06-10"), d("2026-06-13"), 2)
        .await
        .unwrap_err();
    assert!(matches!(err, BookingError::Persistence(_)));
}

#[tokio::test]
async fn malformed_stay_fails_before_any_read() {
    let wal = Arc::new(WalStore::open(test_wal_path("slow_store_shape.wal")).unwrap());
    let config = BookingConfig {
        store_timeout: Duration::from_millis(50),
        ..BookingConfig::default()
    };
    let h = harness_over(Arc::new(SlowStore(wal.clone())), wal, config).await;

    let err = h
        .booking
        .quote(h.property_id, d("2026-06-13"), d("2026-06-10"), 2)
        .await
        .unwrap_err();
    assert!(matches!(err, BookingError::Validation(_)));
    let err = h
        .booking
        .check_availability(h.property_id, d("2026-06-10"), d("2026-06-13"), 0)
        .await
        .unwrap_err();
    assert!(matches!(err, BookingError::Validation(_)));
}

#[tokio::test]
async fn reservations_survive_restart() {
    let path = test_wal_path("restart_booking.wal");
    let (pid, id) = {
        let wal = Arc::new(WalStore::open(path.clone()).unwrap());
        let h = harness_over(wal.clone(), wal, BookingConfig::default()).await;
        let id = h
            .booking
            .workflow
            .create_reservation(request(h.property_id, "2026-06-10", "2026-06-13", 2))
            .await
            .unwrap();
        (h.property_id, id)
    };

    let wal = Arc::new(WalStore::open(path).unwrap());
    let booking = Booking::new(
        wal,
        Arc::new(NotifyHub::new()),
        Arc::new(FixedClock::on(d(TODAY))),
        BookingConfig::default(),
    );
    assert!(booking.workflow.get_reservation(id).await.unwrap().is_some());
    assert!(booking.verify_ledger(pid).await.unwrap().is_consistent());
}
