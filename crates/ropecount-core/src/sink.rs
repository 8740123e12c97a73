//! Durable sink abstraction for aggregated counter records.
//!
//! The compactor drains per-segment hash-maps and lands each one here as a
//! single aggregation record keyed by `(name, direction, segment)`. The
//! sink merges additively: each insert adds its field counts into the
//! record, so two hash-maps that parse to the same key fold into one
//! aggregate. Callers pair every insert with deletion of the source
//! hash-map, which is what keeps aggregates exact end to end.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use mongodb::bson::{Document, doc};

use crate::error::{Error, Result};
use crate::segment::{Direction, Segment};

/// A durable store for aggregated counter records.
#[async_trait]
pub trait CompactionSink: Send + Sync + 'static {
    /// Merges `fields` into the aggregate record for
    /// `(name, direction, segment)`, creating it if absent.
    ///
    /// Field counts are summed per field. An empty `fields` map is never
    /// passed; callers short-circuit it.
    async fn insert_compaction(
        &self,
        name: &str,
        direction: Direction,
        segment: Segment,
        fields: &HashMap<String, i64>,
    ) -> Result<()>;
}

/// One recorded write, exposed by [`MemorySink`] for order assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkWrite {
    /// The record's counter name.
    pub name: String,
    /// The record's direction.
    pub direction: Direction,
    /// The record's segment.
    pub segment: Segment,
}

/// In-memory sink for testing.
///
/// Sums fields per record and keeps an append-only log of writes so tests
/// can assert on ordering as well as final aggregates.
#[derive(Debug, Default)]
pub struct MemorySink {
    inner: Arc<RwLock<MemoryRecords>>,
}

#[derive(Debug, Default)]
struct MemoryRecords {
    aggregates: HashMap<(String, Direction, Segment), HashMap<String, i64>>,
    writes: Vec<SinkWrite>,
}

impl MemorySink {
    /// Creates a new empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the aggregate for a record, if any write reached it.
    #[must_use]
    pub fn aggregate(
        &self,
        name: &str,
        direction: Direction,
        segment: Segment,
    ) -> Option<HashMap<String, i64>> {
        self.inner.read().ok().and_then(|records| {
            records
                .aggregates
                .get(&(name.to_string(), direction, segment))
                .cloned()
        })
    }

    /// Returns every write in arrival order.
    #[must_use]
    pub fn writes(&self) -> Vec<SinkWrite> {
        self.inner
            .read()
            .ok()
            .map(|records| records.writes.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CompactionSink for MemorySink {
    async fn insert_compaction(
        &self,
        name: &str,
        direction: Direction,
        segment: Segment,
        fields: &HashMap<String, i64>,
    ) -> Result<()> {
        let mut records = self
            .inner
            .write()
            .map_err(|_| Error::storage("lock poisoned"))?;
        let aggregate = records
            .aggregates
            .entry((name.to_string(), direction, segment))
            .or_default();
        for (field, count) in fields {
            *aggregate.entry(field.clone()).or_insert(0) += count;
        }
        records.writes.push(SinkWrite {
            name: name.to_string(),
            direction,
            segment,
        });
        Ok(())
    }
}

/// MongoDB-backed sink.
///
/// One document per `(name, direction, segment)`; field counts live under
/// a `counts` subdocument and are merged with `$inc` upserts, so every
/// insert is a per-field summation on the server.
#[derive(Clone)]
pub struct MongoSink {
    collection: mongodb::Collection<Document>,
}

impl std::fmt::Debug for MongoSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MongoSink")
            .field("namespace", &format!("{}.{}", Self::DATABASE, Self::COLLECTION))
            .finish_non_exhaustive()
    }
}

impl MongoSink {
    const DATABASE: &'static str = "ropecount";
    const COLLECTION: &'static str = "compactions";

    /// Connects to a MongoDB server at `addr` (`host:port`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] when the address does not parse or the
    /// client cannot be constructed.
    pub async fn connect(addr: &str) -> Result<Self> {
        let client = mongodb::Client::with_uri_str(format!("mongodb://{addr}"))
            .await
            .map_err(|e| Error::storage_with_source("mongodb connection failed", e))?;
        Ok(Self {
            collection: client
                .database(Self::DATABASE)
                .collection(Self::COLLECTION),
        })
    }
}

#[async_trait]
impl CompactionSink for MongoSink {
    async fn insert_compaction(
        &self,
        name: &str,
        direction: Direction,
        segment: Segment,
        fields: &HashMap<String, i64>,
    ) -> Result<()> {
        let mut increments = Document::new();
        for (field, count) in fields {
            increments.insert(format!("counts.{field}"), *count);
        }

        self.collection
            .update_one(
                doc! {
                    "name": name,
                    "direction": direction.as_str(),
                    "segment": segment.index(),
                },
                doc! { "$inc": increments },
            )
            .upsert(true)
            .await
            .map_err(|e| Error::storage_with_source("compaction upsert failed", e))?;
        Ok(())
    }
}
