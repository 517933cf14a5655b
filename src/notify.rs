use chrono::NaiveDate;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Reservation, ReservationStatus};

const CHANNEL_CAPACITY: usize = 256;

/// Something listeners (email dispatch, LISTEN sessions) care about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BookingEvent {
    ReservationCreated {
        reservation_id: Ulid,
        property_id: Ulid,
        check_in: NaiveDate,
        check_out: NaiveDate,
        guests: u32,
        total_price: Decimal,
        currency: String,
        guest_name: String,
        guest_email: String,
    },
    ReservationCancelled {
        reservation_id: Ulid,
        property_id: Ulid,
        check_in: NaiveDate,
        check_out: NaiveDate,
    },
    ReservationStatusChanged {
        reservation_id: Ulid,
        property_id: Ulid,
        status: ReservationStatus,
    },
}

impl BookingEvent {
    pub fn created(r: &Reservation) -> Self {
        BookingEvent::ReservationCreated {
            reservation_id: r.id,
            property_id: r.property_id,
            check_in: r.check_in,
            check_out: r.check_out,
            guests: r.guests,
            total_price: r.total_price,
            currency: r.currency.clone(),
            guest_name: r.guest.name.clone(),
            guest_email: r.guest.email.clone(),
        }
    }

    pub fn cancelled(r: &Reservation) -> Self {
        BookingEvent::ReservationCancelled {
            reservation_id: r.id,
            property_id: r.property_id,
            check_in: r.check_in,
            check_out: r.check_out,
        }
    }

    pub fn property_id(&self) -> Ulid {
        match self {
            BookingEvent::ReservationCreated { property_id, .. }
            | BookingEvent::ReservationCancelled { property_id, .. }
            | BookingEvent::ReservationStatusChanged { property_id, .. } => *property_id,
        }
    }

    pub fn reservation_id(&self) -> Ulid {
        match self {
            BookingEvent::ReservationCreated { reservation_id, .. }
            | BookingEvent::ReservationCancelled { reservation_id, .. }
            | BookingEvent::ReservationStatusChanged { reservation_id, .. } => *reservation_id,
        }
    }

    /// JSON payload for NOTIFY.
    pub fn payload(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Broadcast hub per property, plus one firehose for collaborators that want everything.
/// Sending never waits on listeners.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<BookingEvent>>,
    all: broadcast::Sender<BookingEvent>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            all: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to one property's events. Creates the channel if needed.
    pub fn subscribe(&self, property_id: Ulid) -> broadcast::Receiver<BookingEvent> {
        let sender = self
            .channels
            .entry(property_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<BookingEvent> {
        self.all.subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, event: &BookingEvent) {
        if let Some(sender) = self.channels.get(&event.property_id()) {
            let _ = sender.send(event.clone());
        }
        let _ = self.all.send(event.clone());
    }

    /// Drop a property's channel once its last listener is gone.
    pub fn prune(&self, property_id: &Ulid) {
        self.channels.remove_if(property_id, |_, s| s.receiver_count() == 0);
    }
}
