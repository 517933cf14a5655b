mod wal_store;

pub use wal_store::WalStore;

use async_trait::async_trait;

/// Documents are schemaless JSON; typed records are layered on top by the booking core.
pub type Document = serde_json::Value;

/// Precondition on a document's current state for a conditional write.
#[derive(Debug, Clone, PartialEq)]
pub enum Expect {
    /// Unconditional (last writer wins).
    Any,
    /// The document must not exist.
    Absent,
    /// The document must exist and equal this value exactly.
    Equals(Document),
}

impl Expect {
    /// `Absent` for `None`, `Equals` otherwise.
    pub fn current(doc: Option<&Document>) -> Self {
        match doc {
            Some(d) => Expect::Equals(d.clone()),
            None => Expect::Absent,
        }
    }

    pub fn matches(&self, current: Option<&Document>) -> bool {
        match (self, current) {
            (Expect::Any, _) => true,
            (Expect::Absent, None) => true,
            (Expect::Equals(want), Some(have)) => want == have,
            _ => false,
        }
    }
}

/// One element of a conditional write: replace (or delete, when `new` is `None`)
/// the document at `collection/id` if its current state satisfies `expect`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionalWrite {
    pub collection: String,
    pub id: String,
    pub expect: Expect,
    pub new: Option<Document>,
}

impl ConditionalWrite {
    pub fn put(collection: impl Into<String>, id: impl Into<String>, expect: Expect, doc: Document) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
            expect,
            new: Some(doc),
        }
    }

    pub fn delete(collection: impl Into<String>, id: impl Into<String>, expect: Expect) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
            expect,
            new: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A precondition did not hold. Nothing in the batch was written.
    #[error("conditional write failed on {collection}/{id}")]
    Conflict { collection: String, id: String },
    #[error("invalid batch: {0}")]
    InvalidBatch(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("WAL error: {0}")]
    Wal(String),
}

/// Minimal read / conditional-write contract the booking core is built on.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError>;

    /// Documents whose id lies in the inclusive range `[from, to]`, ordered by id.
    /// Open bounds when `None`.
    async fn scan(
        &self,
        collection: &str,
        from: Option<&str>,
        to: Option<&str>,
    ) -> Result<Vec<(String, Document)>, StoreError>;

    /// Atomic per document.
    async fn write_if(&self, write: ConditionalWrite) -> Result<(), StoreError> {
        self.write_all_if(vec![write]).await
    }

    /// All-or-nothing across the batch: either every precondition holds and every
    /// write lands, or `Conflict` is returned and nothing changes.
    async fn write_all_if(&self, writes: Vec<ConditionalWrite>) -> Result<(), StoreError>;
}
