//! Redis signal repository.
//!
//! # Key Patterns
//!
//! - `signals:{room}:to:{peer}` - direct mailbox (ZSET, score = `createdAt`)
//! - `signals:{room}:broadcast` - room broadcast mailbox (ZSET, score = `createdAt`)
//! - `signals:mailboxes` - index of every mailbox key (SET), drives expiry
//! - `signals:seq` - append sequence counter (STRING)
//!
//! Room and peer segments are escaped (`%` as `%25`, `:` as `%3A`) so one
//! id can never spell out another mailbox's key.
//!
//! Members are `{seq:020}:{json}`. Equal scores order lexicographically by
//! member, so the zero-padded sequence prefix keeps append order within a
//! millisecond.
//!
//! The redis-rs `MultiplexedConnection` is cheap to clone and safe to use
//! concurrently; each operation clones it.

use super::lua_scripts;
use super::{SignalRepository, StoredSignal};
use crate::errors::SignalError;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use signal_protocol::{PeerId, RoomId, SignalingMessage};
use std::borrow::Cow;
use tracing::{error, instrument, warn};

/// Index of all mailbox keys.
pub const MAILBOX_INDEX_KEY: &str = "signals:mailboxes";

/// Append sequence counter.
pub const SEQUENCE_KEY: &str = "signals:seq";

fn key_segment(id: &str) -> Cow<'_, str> {
    if id.contains([':', '%']) {
        Cow::Owned(id.replace('%', "%25").replace(':', "%3A"))
    } else {
        Cow::Borrowed(id)
    }
}

#[must_use]
pub fn direct_key(room: &RoomId, to: &PeerId) -> String {
    format!(
        "signals:{}:to:{}",
        key_segment(room.as_str()),
        key_segment(to.as_str())
    )
}

#[must_use]
pub fn broadcast_key(room: &RoomId) -> String {
    format!("signals:{}:broadcast", key_segment(room.as_str()))
}

/// Split a stored member into its sequence number and record.
fn decode_member(member: &str) -> Result<StoredSignal, String> {
    let (seq, json) = member
        .split_once(':')
        .ok_or_else(|| "missing sequence prefix".to_string())?;
    let seq = seq.parse::<u64>().map_err(|e| format!("bad sequence: {e}"))?;
    let message = serde_json::from_str::<SignalingMessage>(json).map_err(|e| e.to_string())?;
    Ok(StoredSignal { seq, message })
}

#[derive(Clone)]
pub struct RedisSignalRepository {
    connection: MultiplexedConnection,
    append_script: Script,
    expire_script: Script,
}

impl RedisSignalRepository {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns `SignalError::Redis` if the client cannot be opened or connected.
    pub async fn new(redis_url: &str) -> Result<Self, SignalError> {
        let client = Client::open(redis_url).map_err(|e| {
            // Never log redis_url: it may carry credentials.
            error!(target: "signal.store.redis", error = %e, "Failed to open Redis client");
            SignalError::Redis(format!("Failed to open Redis client: {e}"))
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(target: "signal.store.redis", error = %e, "Failed to connect to Redis");
                SignalError::Redis(format!("Failed to connect to Redis: {e}"))
            })?;

        Ok(Self {
            connection,
            append_script: Script::new(lua_scripts::APPEND_SIGNAL),
            expire_script: Script::new(lua_scripts::EXPIRE_MAILBOXES),
        })
    }

    async fn range(&self, key: &str, since: i64) -> Result<Vec<StoredSignal>, SignalError> {
        let mut conn = self.connection.clone();
        let raw: Vec<String> = conn
            .zrangebyscore(key, format!("({since}"), "+inf")
            .await
            .map_err(|e| {
                warn!(target: "signal.store.redis", error = %e, "Failed to read mailbox");
                SignalError::Redis(format!("Failed to read mailbox: {e}"))
            })?;

        Ok(raw
            .iter()
            .filter_map(|entry| match decode_member(entry) {
                Ok(stored) => Some(stored),
                Err(e) => {
                    warn!(target: "signal.store.redis", error = %e, "Dropping malformed stored signal");
                    None
                }
            })
            .collect())
    }
}

#[async_trait]
impl SignalRepository for RedisSignalRepository {
    #[instrument(skip_all, fields(room_id = %message.room_id, signal_id = %message.id))]
    async fn append(&self, message: &SignalingMessage) -> Result<u64, SignalError> {
        let key = match &message.to_peer_id {
            Some(to) => direct_key(&message.room_id, to),
            None => broadcast_key(&message.room_id),
        };
        let record = serde_json::to_string(message)
            .map_err(|e| SignalError::Internal(format!("Failed to encode signal: {e}")))?;

        let mut conn = self.connection.clone();
        let seq: u64 = self
            .append_script
            .key(&key)
            .key(MAILBOX_INDEX_KEY)
            .key(SEQUENCE_KEY)
            .arg(message.created_at)
            .arg(record)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(target: "signal.store.redis", error = %e, "Failed to append signal");
                SignalError::Redis(format!("Failed to append signal: {e}"))
            })?;
        Ok(seq)
    }

    async fn range_direct(
        &self,
        room: &RoomId,
        to: &PeerId,
        since: i64,
    ) -> Result<Vec<StoredSignal>, SignalError> {
        self.range(&direct_key(room, to), since).await
    }

    async fn range_broadcast(
        &self,
        room: &RoomId,
        since: i64,
    ) -> Result<Vec<StoredSignal>, SignalError> {
        self.range(&broadcast_key(room), since).await
    }

    #[instrument(skip_all, fields(cutoff = cutoff))]
    async fn delete_older_than(&self, cutoff: i64) -> Result<u64, SignalError> {
        let mut conn = self.connection.clone();
        let removed: i64 = self
            .expire_script
            .key(MAILBOX_INDEX_KEY)
            .arg(cutoff)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(target: "signal.store.redis", error = %e, "Failed to expire signals");
                SignalError::Redis(format!("Failed to expire signals: {e}"))
            })?;
        Ok(u64::try_from(removed).unwrap_or(0))
    }

    async fn ping(&self) -> Result<(), SignalError> {
        let mut conn = self.connection.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await.map_err(|e| {
            warn!(target: "signal.store.redis", error = %e, "Redis ping failed");
            SignalError::Redis(format!("Redis ping failed: {e}"))
        })?;
        Ok(())
    }
}
