//! Peer graceful close (GOAWAY) handling.
//!
//! A GOAWAY carries the highest stream id the peer has processed or will
//! process. Streams up to and including it keep running and finish on
//! their own; streams above it were never seen by the peer and are failed
//! as [`Failure::refused`], which callers may retry on another connection.

use std::collections::BTreeMap;

use tracing::debug;

use crate::connection::StreamEntry;
use crate::error::{ErrorCode, Failure};
use crate::exchange::Outcome;

/// What a GOAWAY did to a connection's streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Drain {
    /// Last stream id recorded on the connection.
    pub last_stream_id: u32,
    /// Streams left running because the peer accepted them.
    pub accepted: usize,
    /// Streams failed as refused.
    pub refused: usize,
}

/// Apply a GOAWAY to the active stream set.
///
/// `recorded` holds the connection's last-accepted stream id; it is only
/// written the first time. A later GOAWAY can refuse more streams but never
/// revives one that was already refused.
pub(crate) fn drain(
    streams: &mut BTreeMap<u32, StreamEntry>,
    recorded: &mut Option<u32>,
    last_stream_id: u32,
    error_code: ErrorCode,
) -> Drain {
    let recorded_id = *recorded.get_or_insert(last_stream_id);
    let cutoff = recorded_id.min(last_stream_id);

    let unprocessed = match cutoff.checked_add(1) {
        Some(first) => streams.split_off(&first),
        None => BTreeMap::new(),
    };
    for (stream_id, entry) in &unprocessed {
        debug!(stream_id, ?error_code, "stream refused by peer shutdown");
        entry.exchange.finalize(Outcome::Failed(Failure::refused()));
    }

    Drain {
        last_stream_id: recorded_id,
        accepted: streams.len(),
        refused: unprocessed.len(),
    }
}
