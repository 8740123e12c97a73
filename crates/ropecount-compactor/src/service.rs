//! Compaction service: segment scheduling and the merge/commit step.
//!
//! One `process` call walks segments backwards from the last closed bucket
//! at the request's start time, draining both directions of each segment
//! before advancing. Draining claims one member at a time through the
//! claim protocol; each claim reads the member's hash-map, lands the
//! aggregate in the durable sink, and deletes the source.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ropecount_core::{
    CompactionSink, Direction, Error, KeyNames, KvStore, Result, Segment, parse_key_name,
};

use crate::claim::{ClaimOutcome, claim_one};
use crate::metrics;

/// How far back one request reaches from its starting segment. Callers
/// schedule repeated requests to cover longer histories.
const BACKWARD_WINDOW_SECS: i64 = 3600;

/// Request to compact every closed segment in the backward window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRequest {
    /// Reference time for the run; only segments already closed at this
    /// time are touched.
    pub start_at: DateTime<Utc>,
    /// Caller-supplied identifier, carried through the logs.
    pub id: String,
}

/// The compactor service.
///
/// Holds shared handles to the KV and the sink; all per-request state is
/// stack-local, so one instance serves any number of concurrent requests.
#[derive(Clone)]
pub struct CompactorService {
    kv: Arc<dyn KvStore>,
    sink: Arc<dyn CompactionSink>,
}

impl CompactorService {
    /// Creates a service over the given KV and sink handles.
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, sink: Arc<dyn CompactionSink>) -> Self {
        Self { kv, sink }
    }

    /// Drains every segment whose start lies within the backward window,
    /// newest first.
    ///
    /// A segment counts as drained once both directions report an empty
    /// pending set in the same round. Cancellation is observed at the top
    /// of every round; an in-flight claim always runs to completion so the
    /// KV is never abandoned mid-merge.
    ///
    /// # Errors
    ///
    /// Returns the first malformed-key, storage, or cancellation error
    /// encountered. An empty window is success.
    pub async fn process(&self, cancel: &CancellationToken, request: &ProcessRequest) -> Result<()> {
        info!(
            id = %request.id,
            start_at = %request.start_at.to_rfc3339(),
            "processing compaction request"
        );

        let mut segment = Segment::last_processible(request.start_at);
        let window_start = segment.start_time() - Duration::seconds(BACKWARD_WINDOW_SECS);

        while segment.start_time() >= window_start {
            debug!(segment = %segment, "draining segment");
            let keys = KeyNames::for_segment(segment);

            loop {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }

                let src = self.drain_one(keys, Direction::Src).await?;
                let dst = self.drain_one(keys, Direction::Dst).await?;
                if src == ClaimOutcome::Empty && dst == ClaimOutcome::Empty {
                    break;
                }
            }

            segment = segment.prev();
        }

        Ok(())
    }

    /// Claims and merges at most one member of the segment's pending set
    /// for `direction`.
    async fn drain_one(&self, keys: KeyNames, direction: Direction) -> Result<ClaimOutcome> {
        let queue = keys.current_counter_set(direction);
        let outcome = claim_one(self.kv.as_ref(), &queue, |member| {
            let source = keys.hash_set_name(direction, &member);
            async move { self.merge(&source).await }
        })
        .await?;

        if outcome == ClaimOutcome::Processed {
            metrics::record_member_compacted(direction);
        }
        Ok(outcome)
    }

    /// Reads the source hash-map, lands its aggregate in the sink, then
    /// deletes the source. The sink write strictly precedes the delete.
    async fn merge(&self, source: &str) -> Result<()> {
        let fields = match self.kv.hash_get_all(source).await {
            Ok(fields) => fields,
            Err(Error::Empty) => {
                warn!(source = %source, "member was queued but its hash-map does not exist");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if fields.is_empty() {
            return Ok(());
        }

        let parsed = parse_key_name(source)?;
        self.sink
            .insert_compaction(&parsed.name, parsed.direction, parsed.segment, &fields)
            .await?;

        // The aggregate is durable from here on; a failed delete leaks the
        // source hash-map, it cannot lose or duplicate counts.
        match self.kv.del(&[source]).await {
            Ok(0) | Err(Error::Empty) => {
                warn!(source = %source, "source hash-map was already deleted");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(source = %source, error = %e, "failed to delete merged hash-map");
            }
        }

        Ok(())
    }
}
