use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::Serialize;
use ulid::Ulid;

use super::error::BookingError;
use crate::model::{PricingPolicy, Property, Reservation, SeasonRate};
use crate::store::{ConditionalWrite, Document, DocumentStore, StoreError};

/// Collection layout.
pub mod paths {
    use ulid::Ulid;

    pub const PROPERTIES: &str = "properties";
    pub const PRICING: &str = "pricing";
    pub const RESERVATIONS: &str = "reservations";
    pub const PENDING_RELEASES: &str = "pending_releases";

    pub fn seasons(property_id: Ulid) -> String {
        format!("properties/{property_id}/seasons")
    }

    pub fn calendar(property_id: Ulid) -> String {
        format!("properties/{property_id}/calendar")
    }
}

pub fn date_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Map a store failure onto the booking taxonomy. This is the only place it happens.
fn map_store_error(e: StoreError) -> BookingError {
    match e {
        StoreError::Conflict { id, .. } => BookingError::Conflict {
            dates: NaiveDate::parse_from_str(&id, "%Y-%m-%d").ok().into_iter().collect(),
        },
        StoreError::LimitExceeded(what) => BookingError::Validation(format!("limit exceeded: {what}")),
        other => BookingError::Persistence(other.to_string()),
    }
}

pub fn to_doc<T: Serialize>(value: &T) -> Result<Document, BookingError> {
    serde_json::to_value(value).map_err(|e| BookingError::Persistence(format!("encode: {e}")))
}

pub fn from_doc<T: DeserializeOwned>(doc: Document) -> Result<T, BookingError> {
    serde_json::from_value(doc).map_err(|e| BookingError::Persistence(format!("corrupt document: {e}")))
}

/// Typed, time-bounded access to the document store.
#[derive(Clone)]
pub struct Docs {
    store: Arc<dyn DocumentStore>,
    timeout: Duration,
}

impl Docs {
    pub fn new(store: Arc<dyn DocumentStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    async fn bounded<T>(&self, fut: impl Future<Output = Result<T, StoreError>>) -> Result<T, BookingError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(map_store_error),
            Err(_) => {
                metrics::counter!(crate::observability::STORE_TIMEOUTS_TOTAL).increment(1);
                Err(BookingError::Persistence(format!(
                    "store did not answer within {} ms",
                    self.timeout.as_millis()
                )))
            }
        }
    }

    pub async fn get_raw(&self, collection: &str, id: &str) -> Result<Option<Document>, BookingError> {
        self.bounded(self.store.get(collection, id)).await
    }

    pub async fn get<T: DeserializeOwned>(&self, collection: &str, id: &str) -> Result<Option<T>, BookingError> {
        self.get_raw(collection, id).await?.map(from_doc).transpose()
    }

    pub async fn scan_raw(
        &self,
        collection: &str,
        from: Option<&str>,
        to: Option<&str>,
    ) -> Result<Vec<(String, Document)>, BookingError> {
        self.bounded(self.store.scan(collection, from, to)).await
    }

    pub async fn scan<T: DeserializeOwned>(&self, collection: &str) -> Result<Vec<T>, BookingError> {
        self.scan_raw(collection, None, None)
            .await?
            .into_iter()
            .map(|(_, doc)| from_doc(doc))
            .collect()
    }

    pub async fn write_if(&self, write: ConditionalWrite) -> Result<(), BookingError> {
        self.bounded(self.store.write_if(write)).await
    }

    pub async fn write_all_if(&self, writes: Vec<ConditionalWrite>) -> Result<(), BookingError> {
        self.bounded(self.store.write_all_if(writes)).await
    }

    // ── Record loaders ─────────────────────────────────────────

    pub async fn property(&self, property_id: Ulid) -> Result<Option<Property>, BookingError> {
        self.get(paths::PROPERTIES, &property_id.to_string()).await
    }

    pub async fn require_property(&self, property_id: Ulid) -> Result<Property, BookingError> {
        self.property(property_id)
            .await?
            .ok_or_else(|| BookingError::Validation(format!("unknown property {property_id}")))
    }

    /// The stored policy, or the defaults when none was ever set.
    pub async fn policy(&self, property_id: Ulid) -> Result<PricingPolicy, BookingError> {
        Ok(self
            .get(paths::PRICING, &property_id.to_string())
            .await?
            .unwrap_or_default())
    }

    pub async fn seasons(&self, property_id: Ulid) -> Result<Vec<SeasonRate>, BookingError> {
        self.scan(&paths::seasons(property_id)).await
    }

    /// The reservation together with its raw stored form, for conditional updates.
    pub async fn reservation(&self, id: Ulid) -> Result<Option<(Reservation, Document)>, BookingError> {
        match self.get_raw(paths::RESERVATIONS, &id.to_string()).await? {
            Some(raw) => Ok(Some((from_doc(raw.clone())?, raw))),
            None => Ok(None),
        }
    }
}
