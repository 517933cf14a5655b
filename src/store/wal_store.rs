use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io;
use std::ops::Bound;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, warn};

use super::{ConditionalWrite, Document, DocumentStore, StoreError};
use crate::limits::{MAX_BATCH_SIZE, MAX_DOCUMENT_BYTES};
use crate::model::{Event, Mutation};
use crate::observability;
use crate::wal::Wal;

type Collection = BTreeMap<String, Document>;
type SharedCollection = Arc<RwLock<Collection>>;

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first Append, drains whatever else is already queued,
/// then fsyncs once and answers every sender with the shared result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        for (_, tx) in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(r);
        }

        // A compaction queued behind appends runs only after they are durable.
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so stray buffered bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => {}
    }
}

/// Durable in-process `DocumentStore`.
///
/// Each collection sits behind its own `tokio::sync::RwLock`. A batch takes write
/// locks on every collection it touches, in sorted name order, checks all
/// preconditions, appends one WAL record, and only then applies, so a batch is
/// never partially visible and never partially replayed.
///
/// The locked section runs on its own task: a caller that gives up (timeout,
/// dropped connection) can't leave a record in the log that memory never saw.
pub struct WalStore {
    inner: Arc<Inner>,
}

struct Inner {
    collections: DashMap<String, SharedCollection>,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Commits hold this shared from collection lookup to WAL ack; compaction holds it exclusively.
    commit_gate: RwLock<()>,
}

impl WalStore {
    /// Replay the log at `wal_path` and start the group-commit writer.
    /// Must be called inside a tokio runtime.
    pub fn open(wal_path: PathBuf) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        if replay.discarded_tail {
            warn!(path = %wal_path.display(), "discarded torn WAL tail during replay");
        }

        let mut staging: HashMap<String, Collection> = HashMap::new();
        for event in &replay.events {
            for mutation in event.mutations() {
                apply_mutation(&mut staging, mutation)?;
            }
        }
        let collections = DashMap::new();
        for (name, docs) in staging {
            collections.insert(name, Arc::new(RwLock::new(docs)));
        }
        debug!(events = replay.events.len(), "WAL replayed");

        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        Ok(Self {
            inner: Arc::new(Inner {
                collections,
                wal_tx,
                commit_gate: RwLock::new(()),
            }),
        })
    }

    /// Rewrite the log as one `Put` per live document.
    /// Holds the commit gate exclusively from snapshot to swap, so no commit,
    /// including one that creates a collection, can append to the log being replaced.
    pub async fn compact_wal(&self) -> Result<(), StoreError> {
        let _exclusive = self.inner.commit_gate.write().await;
        let mut names: Vec<(String, SharedCollection)> = self
            .inner
            .collections
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        names.sort_by(|a, b| a.0.cmp(&b.0));

        let mut guards = Vec::with_capacity(names.len());
        for (name, coll) in names {
            guards.push((name, coll.read_owned().await));
        }

        let mut events = Vec::new();
        for (name, guard) in &guards {
            for (id, doc) in guard.iter() {
                events.push(Event::Applied(Mutation::Put {
                    collection: name.clone(),
                    id: id.clone(),
                    body: encode_body(doc)?,
                }));
            }
        }

        let (tx, rx) = oneshot::channel();
        self.inner
            .wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .inner
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

impl Inner {
    fn collection(&self, name: &str) -> Option<SharedCollection> {
        self.collections.get(name).map(|e| e.value().clone())
    }

    fn collection_or_create(&self, name: &str) -> SharedCollection {
        self.collections
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(Collection::new())))
            .value()
            .clone()
    }

    async fn wal_append(&self, event: Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { event, response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    /// Lock, check, log, apply.
    async fn commit(&self, writes: Vec<ConditionalWrite>, mut mutations: Vec<Mutation>) -> Result<(), StoreError> {
        let _shared = self.commit_gate.read().await;
        let names: BTreeSet<String> = writes.iter().map(|w| w.collection.clone()).collect();
        let mut guards: HashMap<String, OwnedRwLockWriteGuard<Collection>> = HashMap::new();
        for name in names {
            let coll = self.collection_or_create(&name);
            guards.insert(name, coll.write_owned().await);
        }

        for w in &writes {
            let current = guards.get(&w.collection).and_then(|g| g.get(&w.id));
            if !w.expect.matches(current) {
                metrics::counter!(observability::STORE_CONFLICTS_TOTAL).increment(1);
                return Err(StoreError::Conflict {
                    collection: w.collection.clone(),
                    id: w.id.clone(),
                });
            }
        }

        let event = if mutations.len() == 1 {
            Event::Applied(mutations.remove(0))
        } else {
            Event::BatchApplied(mutations)
        };
        self.wal_append(event).await?;

        for w in writes {
            if let Some(guard) = guards.get_mut(&w.collection) {
                match w.new {
                    Some(doc) => {
                        guard.insert(w.id, doc);
                    }
                    None => {
                        guard.remove(&w.id);
                    }
                }
            }
        }
        Ok(())
    }
}

fn encode_body(doc: &Document) -> Result<String, StoreError> {
    serde_json::to_string(doc).map_err(|e| StoreError::Codec(e.to_string()))
}

fn apply_mutation(staging: &mut HashMap<String, Collection>, mutation: &Mutation) -> io::Result<()> {
    match mutation {
        Mutation::Put { collection, id, body } => {
            let doc: Document =
                serde_json::from_str(body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            staging.entry(collection.clone()).or_default().insert(id.clone(), doc);
        }
        Mutation::Delete { collection, id } => {
            if let Some(c) = staging.get_mut(collection) {
                c.remove(id);
            }
        }
    }
    Ok(())
}

fn validate_batch(writes: &[ConditionalWrite]) -> Result<(), StoreError> {
    if writes.len() > MAX_BATCH_SIZE {
        return Err(StoreError::LimitExceeded("too many writes in batch"));
    }
    let mut seen = HashSet::with_capacity(writes.len());
    for w in writes {
        if !seen.insert((w.collection.as_str(), w.id.as_str())) {
            return Err(StoreError::InvalidBatch(format!(
                "duplicate write to {}/{}",
                w.collection, w.id
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl DocumentStore for WalStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let Some(coll) = self.inner.collection(collection) else {
            return Ok(None);
        };
        let guard = coll.read().await;
        Ok(guard.get(id).cloned())
    }

    async fn scan(
        &self,
        collection: &str,
        from: Option<&str>,
        to: Option<&str>,
    ) -> Result<Vec<(String, Document)>, StoreError> {
        if let (Some(f), Some(t)) = (from, to)
            && f > t
        {
            return Ok(Vec::new());
        }
        let Some(coll) = self.inner.collection(collection) else {
            return Ok(Vec::new());
        };
        let lower = from.map_or(Bound::Unbounded, Bound::Included);
        let upper = to.map_or(Bound::Unbounded, Bound::Included);
        let guard = coll.read().await;
        Ok(guard
            .range::<str, _>((lower, upper))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn write_all_if(&self, writes: Vec<ConditionalWrite>) -> Result<(), StoreError> {
        if writes.is_empty() {
            return Ok(());
        }
        validate_batch(&writes)?;

        // Encode up front so a codec failure can't strike after the WAL append.
        let mut mutations = Vec::with_capacity(writes.len());
        for w in &writes {
            mutations.push(match &w.new {
                Some(doc) => {
                    let body = encode_body(doc)?;
                    if body.len() > MAX_DOCUMENT_BYTES {
                        return Err(StoreError::LimitExceeded("document too large"));
                    }
                    Mutation::Put {
                        collection: w.collection.clone(),
                        id: w.id.clone(),
                        body,
                    }
                }
                None => Mutation::Delete {
                    collection: w.collection.clone(),
                    id: w.id.clone(),
                },
            });
        }

        let inner = self.inner.clone();
        tokio::spawn(async move { inner.commit(writes, mutations).await })
            .await
            .map_err(|e| StoreError::Wal(format!("commit task failed: {e}")))?
    }
}
