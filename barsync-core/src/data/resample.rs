//! Aggregate candles into a coarser interval.
//!
//! Buckets are epoch-aligned like the exchange's own intervals. Per bucket:
//! open of the earliest bar, max high, min low, close of the latest bar,
//! summed volume. Buckets with no input bars are omitted rather than filled.

use crate::domain::{Candle, Interval};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

struct Bucket {
    first: DateTime<Utc>,
    last: DateTime<Utc>,
    candle: Candle,
}

/// Resample `candles` (one symbol) into bars of `target` width.
///
/// Input order does not matter; output is ascending by bucket start.
pub fn resample(candles: &[Candle], target: Interval) -> Vec<Candle> {
    let mut buckets: BTreeMap<DateTime<Utc>, Bucket> = BTreeMap::new();

    for c in candles {
        let start = target.truncate(c.open_time);
        match buckets.get_mut(&start) {
            None => {
                let mut candle = c.clone();
                candle.open_time = start;
                buckets.insert(
                    start,
                    Bucket {
                        first: c.open_time,
                        last: c.open_time,
                        candle,
                    },
                );
            }
            Some(b) => {
                if c.open_time < b.first {
                    b.first = c.open_time;
                    b.candle.open = c.open;
                }
                if c.open_time > b.last {
                    b.last = c.open_time;
                    b.candle.close = c.close;
                }
                b.candle.high = b.candle.high.max(c.high);
                b.candle.low = b.candle.low.min(c.low);
                b.candle.volume += c.volume;
            }
        }
    }

    buckets.into_values().map(|b| b.candle).collect()
}
