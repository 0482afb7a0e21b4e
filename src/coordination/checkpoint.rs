//! Draining checkpoints, one per output stream

use crate::error::{GroupError, GroupResult};
use crate::model::Stream;
use crate::state::keys::{ts_bytes, ts_from_bytes, COLLECTIBLES_CHECKPOINT_KEY, OUTPUTS_CHECKPOINT_KEY};
use crate::state::Store;

use chrono::{DateTime, Utc};

pub fn checkpoint_key(stream: Stream) -> &'static str {
    match stream {
        Stream::Multisig => OUTPUTS_CHECKPOINT_KEY,
        Stream::Collectible => COLLECTIBLES_CHECKPOINT_KEY,
    }
}

/// Persisted checkpoint of `stream`, never earlier than `epoch`
pub async fn read_checkpoint(
    store: &dyn Store,
    stream: Stream,
    epoch: DateTime<Utc>,
) -> GroupResult<DateTime<Utc>> {
    let Some(bytes) = store.read_property(checkpoint_key(stream)).await? else {
        return Ok(epoch);
    };
    let ts = ts_from_bytes(&bytes).ok_or_else(|| {
        GroupError::fatal(format!("corrupt {} checkpoint {}", stream.label(), hex::encode(&bytes)))
    })?;
    Ok(ts.max(epoch))
}

/// Advance the checkpoint of `stream`; returns false when `ckpt` would not move it forward
pub async fn write_checkpoint(
    store: &dyn Store,
    stream: Stream,
    ckpt: DateTime<Utc>,
) -> GroupResult<bool> {
    let key = checkpoint_key(stream);
    if let Some(bytes) = store.read_property(key).await? {
        if ts_from_bytes(&bytes).map(|old| old >= ckpt).unwrap_or(false) {
            return Ok(false);
        }
    }
    store.write_property(key, &ts_bytes(ckpt)).await?;
    Ok(true)
}
