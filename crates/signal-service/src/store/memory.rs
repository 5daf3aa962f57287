//! In-process signal repository.
//!
//! One `BTreeMap` per mailbox keyed by `(createdAt, seq)`, so range reads are
//! `BTreeMap::range` and expiry is a `split_off` per mailbox.

use super::{SignalRepository, StoredSignal};
use crate::errors::SignalError;
use async_trait::async_trait;
use signal_protocol::{PeerId, RoomId, SignalingMessage};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

type Mailbox = BTreeMap<(i64, u64), SignalingMessage>;

#[derive(Default)]
struct Mailboxes {
    direct: HashMap<(RoomId, PeerId), Mailbox>,
    broadcast: HashMap<RoomId, Mailbox>,
    /// Last assigned sequence number.
    seq: u64,
}

#[derive(Default)]
pub struct MemorySignalRepository {
    mailboxes: RwLock<Mailboxes>,
}

impl MemorySignalRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored records across all mailboxes.
    pub async fn len(&self) -> usize {
        let mailboxes = self.mailboxes.read().await;
        mailboxes.direct.values().map(BTreeMap::len).sum::<usize>()
            + mailboxes.broadcast.values().map(BTreeMap::len).sum::<usize>()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn range_after(mailbox: Option<&Mailbox>, since: i64) -> Vec<StoredSignal> {
    mailbox
        .map(|m| {
            m.range((since.saturating_add(1), 0)..)
                .map(|((_, seq), message)| StoredSignal {
                    seq: *seq,
                    message: message.clone(),
                })
                .collect()
        })
        .unwrap_or_default()
}

fn trim_before(mailbox: &mut Mailbox, cutoff: i64) -> u64 {
    let kept = mailbox.split_off(&(cutoff, 0));
    let removed = mailbox.len() as u64;
    *mailbox = kept;
    removed
}

#[async_trait]
impl SignalRepository for MemorySignalRepository {
    async fn append(&self, message: &SignalingMessage) -> Result<u64, SignalError> {
        let mut mailboxes = self.mailboxes.write().await;
        mailboxes.seq += 1;
        let seq = mailboxes.seq;
        let mailbox = match &message.to_peer_id {
            Some(to) => mailboxes
                .direct
                .entry((message.room_id.clone(), to.clone()))
                .or_default(),
            None => mailboxes
                .broadcast
                .entry(message.room_id.clone())
                .or_default(),
        };
        mailbox.insert((message.created_at, seq), message.clone());
        Ok(seq)
    }

    async fn range_direct(
        &self,
        room: &RoomId,
        to: &PeerId,
        since: i64,
    ) -> Result<Vec<StoredSignal>, SignalError> {
        let mailboxes = self.mailboxes.read().await;
        Ok(range_after(
            mailboxes.direct.get(&(room.clone(), to.clone())),
            since,
        ))
    }

    async fn range_broadcast(
        &self,
        room: &RoomId,
        since: i64,
    ) -> Result<Vec<StoredSignal>, SignalError> {
        let mailboxes = self.mailboxes.read().await;
        Ok(range_after(mailboxes.broadcast.get(room), since))
    }

    async fn delete_older_than(&self, cutoff: i64) -> Result<u64, SignalError> {
        let mut mailboxes = self.mailboxes.write().await;
        let mut removed = 0;
        for mailbox in mailboxes.direct.values_mut() {
            removed += trim_before(mailbox, cutoff);
        }
        for mailbox in mailboxes.broadcast.values_mut() {
            removed += trim_before(mailbox, cutoff);
        }
        mailboxes.direct.retain(|_, m| !m.is_empty());
        mailboxes.broadcast.retain(|_, m| !m.is_empty());
        Ok(removed)
    }

    async fn ping(&self) -> Result<(), SignalError> {
        Ok(())
    }
}
