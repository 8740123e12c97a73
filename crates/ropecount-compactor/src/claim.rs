//! Work-claiming protocol over shared counter sets.
//!
//! Many compactor instances drain the same sets concurrently. A claim
//! atomically moves one member from the pending set to its `_processing`
//! sibling, runs the processing callback, and then either commits (removes
//! the claim) or rolls back (moves the member home). The KV's atomic move
//! is the only synchronization primitive; there are no locks.

use std::future::Future;

use tracing::{debug, warn};

use ropecount_core::{Error, KvStore, PROCESSING_SUFFIX, Result};

use crate::metrics;

/// Ceiling on consecutive lost claim races before the attempt is reported
/// as a transient failure. Set cardinality is not observable through the
/// KV operations we use, so this is a flat constant rather than a function
/// of queue size.
const MAX_CLAIM_RETRIES: u32 = 32;

/// Result of one claim attempt against a pending set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// One member was processed and removed from both sets.
    Processed,
    /// The pending set had no members; the callback never ran.
    Empty,
}

/// Claims one member of `queue` and runs `process` on it.
///
/// On callback success the in-flight claim is removed from the
/// `_processing` sibling; on callback failure the member is moved back to
/// `queue` (best effort) and the callback's error is returned. Losing the
/// move race to another worker restarts the attempt with a fresh random
/// member.
///
/// # Errors
///
/// Returns the callback's error, any KV failure, or a transient error
/// after `MAX_CLAIM_RETRIES` consecutive lost races.
pub async fn claim_one<F, Fut>(kv: &dyn KvStore, queue: &str, mut process: F) -> Result<ClaimOutcome>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let processing = format!("{queue}{PROCESSING_SUFFIX}");

    for _ in 0..MAX_CLAIM_RETRIES {
        let member = match kv.random_set_member(queue).await {
            Ok(member) => member,
            Err(Error::Empty) => return Ok(ClaimOutcome::Empty),
            Err(e) => return Err(e),
        };

        let moved = kv.move_set_member(queue, &processing, &member).await?;
        if moved == 0 {
            // Another worker moved this member between our read and our move.
            debug!(queue = %queue, member = %member, "lost claim race, retrying");
            metrics::record_claim_race();
            continue;
        }

        if let Err(process_err) = process(member.clone()).await {
            if matches!(process_err, Error::Malformed { .. }) {
                // A malformed member would fail identically on every
                // retry. It stays parked in the processing set for an
                // operator to inspect instead of cycling forever.
                warn!(
                    queue = %queue,
                    member = %member,
                    "leaving unparseable member in the processing set"
                );
                return Err(process_err);
            }
            if let Err(rollback_err) = kv.move_set_member(&processing, queue, &member).await {
                warn!(
                    queue = %queue,
                    member = %member,
                    error = %rollback_err,
                    "failed to move member back to the pending set after a processing failure"
                );
            }
            return Err(process_err);
        }

        match kv.remove_set_members(&processing, &[&member]).await {
            Ok(0) | Err(Error::Empty) => warn!(
                queue = %queue,
                member = %member,
                "in-flight claim was already gone from the processing set"
            ),
            Ok(_) => {}
            Err(e) => return Err(e),
        }

        return Ok(ClaimOutcome::Processed);
    }

    Err(Error::storage(format!(
        "gave up claiming from {queue} after {MAX_CLAIM_RETRIES} contended attempts"
    )))
}
