//! Persisted monotonic clock

use crate::error::GroupResult;
use crate::state::keys::{ts_bytes, ts_from_bytes, CLOCK_PROPERTY_KEY};
use crate::state::Store;

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

const POLL_ATTEMPTS: u32 = 20;
const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(1);
const PERSIST_RETRY: std::time::Duration = std::time::Duration::from_millis(100);

/// Strictly increasing timestamps that survive restarts
pub struct MonotonicClock {
    store: Arc<dyn Store>,
    last: Mutex<DateTime<Utc>>,
}

impl MonotonicClock {
    /// Resume from the persisted value, or wall time if that is later
    pub async fn restore(store: Arc<dyn Store>) -> GroupResult<Self> {
        let stored = store
            .read_property(CLOCK_PROPERTY_KEY)
            .await?
            .and_then(|bytes| ts_from_bytes(&bytes));
        let now = Utc::now();
        let last = match stored {
            Some(ts) if ts > now => ts,
            _ => now,
        };
        Ok(Self {
            store,
            last: Mutex::new(last),
        })
    }

    /// Next timestamp, strictly after every one handed out before
    pub async fn now(&self) -> DateTime<Utc> {
        let mut last = self.last.lock().await;

        let mut next = None;
        for _ in 0..POLL_ATTEMPTS {
            let now = Utc::now();
            if now > *last {
                next = Some(now);
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        *last = next.unwrap_or_else(|| *last + Duration::nanoseconds(1));

        let value = ts_bytes(*last);
        while let Err(e) = self.store.write_property(CLOCK_PROPERTY_KEY, &value).await {
            warn!("Failed to persist clock: {}", e);
            tokio::time::sleep(PERSIST_RETRY).await;
        }

        *last
    }
}
