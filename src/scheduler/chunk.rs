//! Extraction-range chunking.
//!
//! A schedule's extraction range is processed in payload-sized chunks to
//! bound memory. The first chunk start snaps onto the schedule's rounding
//! grid and through the payload's start-date adjustment hook; each following
//! chunk starts one microsecond after the previous end. A range with no
//! start date at all (no backtrack, no early timestamp) becomes a single
//! open-ended chunk.

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use super::schedule::adjust_to_schedule;
use crate::payload::Payload;

pub(crate) async fn build_chunks(
    payload: &dyn Payload,
    start_date: Option<DateTime<Utc>>,
    end_date: DateTime<Utc>,
    round_hour: Option<u32>,
    round_min: Option<u32>,
    interval: Duration,
    chunk_size: Duration,
) -> Vec<(Option<DateTime<Utc>>, DateTime<Utc>)> {
    let start_date = match start_date {
        Some(start) => start,
        None => match payload.early_timestamp().await {
            Some(early) => {
                debug!(%early, "early timestamp obtained from payload");
                early
            }
            None => {
                debug!(
                    "no start date and no early timestamp; data will be retrieved in a single chunk"
                );
                return vec![(None, end_date)];
            }
        },
    };

    let mut chunks = Vec::new();
    let aligned = adjust_to_schedule(start_date, round_hour, round_min, interval);
    let mut chunk_start = payload.adjusted_start_date(aligned);
    let mut chunk_end = (chunk_start + chunk_size).min(end_date);
    debug!(%chunk_start, %chunk_end, "first chunk");
    chunks.push((Some(chunk_start), chunk_end));

    while chunk_end < end_date {
        chunk_start = payload.adjusted_start_date(chunk_end + Duration::microseconds(1));
        chunk_end = (chunk_start + chunk_size).min(end_date);
        debug!(%chunk_start, %chunk_end, "next chunk");
        chunks.push((Some(chunk_start), chunk_end));
    }
    chunks
}
