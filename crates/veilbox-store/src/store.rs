//! The relay state store.
//!
//! Each user key owns a [`UserSlot`]: an async mutex guarding the user's
//! block list and inbox, plus a small leaf cell holding the user's pairing
//! edge. Operations acquire the async mutex of their primary key and touch
//! the edge cell under it. The one cross-user write, in [`RelayStore::block`],
//! is a compare-and-clear on the other user's edge cell without taking that
//! user's async mutex, so two users blocking each other can never wait on
//! each other.
//!
//! Lock order: slot table, then a slot's async mutex, then edge cells. Edge
//! cells are held only for a single read or write and never across `.await`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use veilbox_shared::{LinkToken, MessageRef, Salt, UserId};

use crate::error::Result;
use crate::inbox::{Inbox, InboxSummary};
use crate::persistence::SnapshotStore;
use crate::snapshot::Snapshot;

#[derive(Debug, Default)]
struct UserRecord {
    blocked: HashSet<UserId>,
    inbox: Inbox,
}

#[derive(Debug, Default)]
struct UserSlot {
    record: Mutex<UserRecord>,
    partner: StdMutex<Option<UserId>>,
}

impl UserSlot {
    fn partner_cell(&self) -> MutexGuard<'_, Option<UserId>> {
        self.partner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clear the edge only if it still points at `expected`.
    fn clear_partner_if(&self, expected: UserId) -> bool {
        let mut cell = self.partner_cell();
        if *cell == Some(expected) {
            *cell = None;
            true
        } else {
            false
        }
    }

    /// True when the slot holds no state and nobody is operating on it.
    fn is_idle(&self) -> bool {
        match self.record.try_lock() {
            Ok(record) => {
                record.blocked.is_empty()
                    && record.inbox.is_empty()
                    && self.partner_cell().is_none()
            }
            Err(_) => false,
        }
    }
}

/// Counters describing the current store contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Users with a slot (and therefore a lock) in the table.
    pub tracked_users: usize,
    /// Users with an outgoing pairing edge.
    pub active_edges: usize,
    /// Edges whose target points back.
    pub symmetric_edges: usize,
    pub blocked_entries: usize,
    pub pending_senders: usize,
    pub pending_messages: usize,
    pub tokens: usize,
}

pub struct RelayStore {
    slots: RwLock<HashMap<UserId, Arc<UserSlot>>>,
    hashes: RwLock<HashMap<LinkToken, UserId>>,
    salt: Salt,
}

impl RelayStore {
    /// Create an empty store using `salt` for token derivation.
    pub fn new(salt: Salt) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            hashes: RwLock::new(HashMap::new()),
            salt,
        }
    }

    /// Rebuild a store from a persisted snapshot.
    ///
    /// A snapshot without a salt gets a freshly generated one, which the
    /// next save persists.
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let salt = snapshot.salt.unwrap_or_else(|| {
            info!("No salt persisted, generating a new one");
            Salt::generate()
        });

        let mut slots: HashMap<UserId, UserSlot> = HashMap::new();

        for (user, partner) in snapshot.pairings {
            if let Some(partner) = partner {
                let slot = slots.entry(user).or_default();
                *slot
                    .partner
                    .get_mut()
                    .unwrap_or_else(PoisonError::into_inner) = Some(partner);
            }
        }

        for (owner, blocked) in snapshot.blocks {
            if blocked.is_empty() {
                continue;
            }
            let slot = slots.entry(owner).or_default();
            slot.record.get_mut().blocked.extend(blocked);
        }

        for (receiver, entries) in snapshot.inbox {
            for entry in entries {
                if entry.messages.is_empty() {
                    continue;
                }
                let record = slots.entry(receiver).or_default().record.get_mut();
                for message in entry.messages {
                    record.inbox.push(entry.sender, message);
                }
            }
        }

        Self {
            slots: RwLock::new(
                slots
                    .into_iter()
                    .map(|(user, slot)| (user, Arc::new(slot)))
                    .collect(),
            ),
            hashes: RwLock::new(snapshot.hashes.into_iter().collect()),
            salt,
        }
    }

    /// Load a snapshot from `source` and build a store from it.
    pub async fn load_from(source: &dyn SnapshotStore) -> Result<Self> {
        let snapshot = source.load().await?;
        Ok(Self::from_snapshot(snapshot))
    }

    /// Take a snapshot and hand it to `sink`.
    ///
    /// A failed save leaves the in-memory state untouched.
    pub async fn persist(&self, sink: &dyn SnapshotStore) -> Result<()> {
        let snapshot = self.snapshot().await;
        sink.save(&snapshot).await
    }

    async fn slot(&self, user: UserId) -> Arc<UserSlot> {
        if let Some(slot) = self.slots.read().await.get(&user) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write().await;
        Arc::clone(slots.entry(user).or_default())
    }

    async fn existing_slot(&self, user: UserId) -> Option<Arc<UserSlot>> {
        self.slots.read().await.get(&user).cloned()
    }

    // -----------------------------------------------------------------------
    // Pairing
    // -----------------------------------------------------------------------

    /// Point `sender`'s edge at `receiver`, replacing any previous edge.
    ///
    /// Performs no validation; blocked or self pairings must be rejected by
    /// the caller.
    pub async fn start_chat(&self, sender: UserId, receiver: UserId) {
        let slot = self.slot(sender).await;
        let _record = slot.record.lock().await;
        let previous = slot.partner_cell().replace(receiver);
        debug!(sender = %sender, receiver = %receiver, ?previous, "Pairing edge set");
    }

    /// Remove `user`'s edge. Returns whether there was one.
    pub async fn end_chat(&self, user: UserId) -> bool {
        let slot = self.slot(user).await;
        let _record = slot.record.lock().await;
        let previous = slot.partner_cell().take();
        if let Some(partner) = previous {
            debug!(user = %user, partner = %partner, "Pairing edge cleared");
        }
        previous.is_some()
    }

    pub async fn is_chatting(&self, user: UserId) -> bool {
        self.partner_of(user).await.is_some()
    }

    pub async fn partner_of(&self, user: UserId) -> Option<UserId> {
        let slot = self.slot(user).await;
        let _record = slot.record.lock().await;
        let partner = *slot.partner_cell();
        partner
    }

    // -----------------------------------------------------------------------
    // Blocking
    // -----------------------------------------------------------------------

    /// Add `target` to `owner`'s block list and tear down any pairing
    /// between the two.
    ///
    /// `owner`'s edge is cleared whatever it points at. `target`'s edge is
    /// cleared only if it points at `owner`, without taking `target`'s
    /// operation lock.
    pub async fn block(&self, owner: UserId, target: UserId) {
        let slot = self.slot(owner).await;
        let mut record = slot.record.lock().await;
        record.blocked.insert(target);
        let previous = slot.partner_cell().take();

        let reverse_cleared = match self.existing_slot(target).await {
            Some(target_slot) => target_slot.clear_partner_if(owner),
            None => false,
        };

        debug!(
            owner = %owner,
            target = %target,
            ?previous,
            reverse_cleared,
            "User blocked"
        );
    }

    /// Remove `target` from `owner`'s block list. Returns whether it was there.
    ///
    /// Never restores a pairing.
    pub async fn unblock(&self, owner: UserId, target: UserId) -> bool {
        let slot = self.slot(owner).await;
        let mut record = slot.record.lock().await;
        let removed = record.blocked.remove(&target);
        if removed {
            debug!(owner = %owner, target = %target, "User unblocked");
        }
        removed
    }

    pub async fn is_blocked(&self, owner: UserId, target: UserId) -> bool {
        let slot = self.slot(owner).await;
        let record = slot.record.lock().await;
        record.blocked.contains(&target)
    }

    // -----------------------------------------------------------------------
    // Inbox
    // -----------------------------------------------------------------------

    /// Append `message` to `receiver`'s queue for `sender`.
    ///
    /// Does not consult the block list; the caller checks it first.
    pub async fn enqueue(&self, sender: UserId, receiver: UserId, message: MessageRef) {
        let slot = self.slot(receiver).await;
        let mut record = slot.record.lock().await;
        record.inbox.push(sender, message);
        debug!(sender = %sender, receiver = %receiver, message = %message, "Message queued");
    }

    pub async fn inbox_summary(&self, receiver: UserId) -> InboxSummary {
        let slot = self.slot(receiver).await;
        let record = slot.record.lock().await;
        record.inbox.summary()
    }

    /// Remove one sender's whole backlog from `receiver`'s inbox.
    ///
    /// The sender whose bucket was created first is chosen. An empty inbox
    /// yields `None` and is left as is.
    pub async fn pop_one_sender(&self, receiver: UserId) -> Option<(UserId, Vec<MessageRef>)> {
        let slot = self.slot(receiver).await;
        let mut record = slot.record.lock().await;
        let popped = record.inbox.pop_oldest();
        if let Some((sender, messages)) = &popped {
            debug!(
                receiver = %receiver,
                sender = %sender,
                count = messages.len(),
                "Inbox bucket drained"
            );
        }
        popped
    }

    // -----------------------------------------------------------------------
    // Share-link tokens
    // -----------------------------------------------------------------------

    /// Derive `user`'s share-link token and record it for [`Self::unhash`].
    ///
    /// Tokens are deterministic under one salt, so repeated calls for the
    /// same user rewrite the same index entry.
    pub async fn hash(&self, user: UserId) -> LinkToken {
        let token = LinkToken::derive(user, &self.salt);
        self.hashes.write().await.insert(token.clone(), user);
        token
    }

    pub async fn unhash(&self, token: &LinkToken) -> Option<UserId> {
        self.hashes.read().await.get(token).copied()
    }

    // -----------------------------------------------------------------------
    // Snapshots and maintenance
    // -----------------------------------------------------------------------

    /// Copy the whole state. Each user is read under its own lock; the
    /// snapshot as a whole is not a single atomic cut.
    pub async fn snapshot(&self) -> Snapshot {
        let slots = self.slot_list().await;

        let mut snapshot = Snapshot {
            salt: Some(self.salt.clone()),
            ..Default::default()
        };

        for (user, slot) in slots {
            let record = slot.record.lock().await;
            let partner = *slot.partner_cell();
            if let Some(partner) = partner {
                snapshot.pairings.insert(user, Some(partner));
            }
            if !record.blocked.is_empty() {
                snapshot
                    .blocks
                    .insert(user, record.blocked.iter().copied().collect());
            }
            if !record.inbox.is_empty() {
                snapshot.inbox.insert(user, record.inbox.entries());
            }
        }

        snapshot.hashes = self
            .hashes
            .read()
            .await
            .iter()
            .map(|(token, user)| (token.clone(), *user))
            .collect();

        snapshot
    }

    pub async fn stats(&self) -> StoreStats {
        let slots = self.slot_list().await;
        let mut edges = HashMap::new();
        let mut stats = StoreStats {
            tracked_users: slots.len(),
            ..Default::default()
        };

        for (user, slot) in slots {
            let record = slot.record.lock().await;
            let partner = *slot.partner_cell();
            if let Some(partner) = partner {
                edges.insert(user, partner);
            }
            let summary = record.inbox.summary();
            stats.blocked_entries += record.blocked.len();
            stats.pending_senders += summary.senders;
            stats.pending_messages += summary.messages;
        }

        stats.active_edges = edges.len();
        stats.symmetric_edges = edges
            .iter()
            .filter(|(user, partner)| edges.get(*partner) == Some(*user))
            .count();
        stats.tokens = self.hashes.read().await.len();
        stats
    }

    /// Drop slots that hold no state and are not in use by any operation.
    /// Returns the number of slots removed.
    pub async fn purge_idle(&self) -> usize {
        let mut slots = self.slots.write().await;
        let before = slots.len();
        slots.retain(|_, slot| Arc::strong_count(slot) > 1 || !slot.is_idle());
        let removed = before - slots.len();
        if removed > 0 {
            debug!(removed, remaining = slots.len(), "Purged idle user slots");
        }
        removed
    }

    async fn slot_list(&self) -> Vec<(UserId, Arc<UserSlot>)> {
        self.slots
            .read()
            .await
            .iter()
            .map(|(user, slot)| (*user, Arc::clone(slot)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> RelayStore {
        RelayStore::new(Salt::generate())
    }

    const A: UserId = UserId(100);
    const B: UserId = UserId(200);
    const C: UserId = UserId(300);

    #[tokio::test]
    async fn test_fresh_user_is_not_chatting() {
        let store = store();
        assert!(!store.is_chatting(A).await);
        assert_eq!(store.partner_of(A).await, None);
    }

    #[tokio::test]
    async fn test_end_chat_clears_edge_and_is_idempotent() {
        let store = store();
        store.start_chat(A, B).await;
        assert!(store.end_chat(A).await);
        assert!(!store.is_chatting(A).await);

        assert!(!store.end_chat(A).await);
        assert!(!store.is_chatting(A).await);
    }

    #[tokio::test]
    async fn test_start_chat_both_ways_is_symmetric() {
        let store = store();
        store.start_chat(A, B).await;
        store.start_chat(B, A).await;

        assert_eq!(store.partner_of(A).await, Some(B));
        assert_eq!(store.partner_of(B).await, Some(A));
        assert_eq!(store.stats().await.symmetric_edges, 2);
    }

    #[tokio::test]
    async fn test_start_chat_overwrites_previous_edge() {
        let store = store();
        store.start_chat(A, B).await;
        store.start_chat(A, C).await;
        assert_eq!(store.partner_of(A).await, Some(C));
    }

    #[tokio::test]
    async fn test_block_tears_down_both_edges() {
        let store = store();
        store.start_chat(A, B).await;
        store.start_chat(B, A).await;

        store.block(A, B).await;

        assert_eq!(store.partner_of(A).await, None);
        assert_eq!(store.partner_of(B).await, None);
        assert!(store.is_blocked(A, B).await);
        assert!(!store.is_blocked(B, A).await);
    }

    #[tokio::test]
    async fn test_block_clears_owner_edge_regardless_of_target() {
        let store = store();
        store.start_chat(A, C).await;
        store.start_chat(B, C).await;

        store.block(A, B).await;

        assert_eq!(store.partner_of(A).await, None);
        // B was not pointing at A, so its edge stays.
        assert_eq!(store.partner_of(B).await, Some(C));
    }

    #[tokio::test]
    async fn test_unblock_is_noop_when_absent() {
        let store = store();
        assert!(!store.unblock(A, B).await);

        store.block(A, B).await;
        assert!(store.unblock(A, B).await);
        assert!(!store.is_blocked(A, B).await);
        assert!(store.snapshot().await.blocks.is_empty());
    }

    #[tokio::test]
    async fn test_unblock_does_not_restore_pairing() {
        let store = store();
        store.start_chat(A, B).await;
        store.block(A, B).await;
        store.unblock(A, B).await;
        assert!(!store.is_chatting(A).await);
    }

    #[tokio::test]
    async fn test_enqueue_then_pop_is_fifo() {
        let store = store();
        store.enqueue(A, B, MessageRef(1)).await;
        store.enqueue(A, B, MessageRef(2)).await;

        assert_eq!(
            store.pop_one_sender(B).await,
            Some((A, vec![MessageRef(1), MessageRef(2)]))
        );
        assert_eq!(store.inbox_summary(B).await, InboxSummary::default());
    }

    #[tokio::test]
    async fn test_inbox_summary_counts_senders_and_messages() {
        let store = store();
        for m in 0..2 {
            store.enqueue(A, C, MessageRef(m)).await;
        }
        for m in 10..13 {
            store.enqueue(B, C, MessageRef(m)).await;
        }

        assert_eq!(
            store.inbox_summary(C).await,
            InboxSummary {
                senders: 2,
                messages: 5
            }
        );
    }

    #[tokio::test]
    async fn test_pop_on_empty_inbox_changes_nothing() {
        let store = store();
        store.start_chat(A, B).await;
        let before = store.snapshot().await;

        assert_eq!(store.pop_one_sender(A).await, None);
        assert_eq!(store.snapshot().await, before);
    }

    #[tokio::test]
    async fn test_pop_removes_one_bucket_at_a_time() {
        let store = store();
        store.enqueue(A, C, MessageRef(1)).await;
        store.enqueue(B, C, MessageRef(2)).await;

        assert_eq!(store.pop_one_sender(C).await, Some((A, vec![MessageRef(1)])));
        assert_eq!(
            store.inbox_summary(C).await,
            InboxSummary {
                senders: 1,
                messages: 1
            }
        );
        assert_eq!(store.pop_one_sender(C).await, Some((B, vec![MessageRef(2)])));
        assert!(store.snapshot().await.inbox.is_empty());
    }

    #[tokio::test]
    async fn test_hash_then_unhash() {
        let store = store();
        let token = store.hash(A).await;
        assert_eq!(store.unhash(&token).await, Some(A));
        assert_eq!(store.hash(A).await, token);

        let unknown = LinkToken::derive(B, &Salt::generate());
        assert_eq!(store.unhash(&unknown).await, None);
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let store = store();
        store.start_chat(A, B).await;
        store.block(C, A).await;
        store.enqueue(B, C, MessageRef(5)).await;
        store.enqueue(A, C, MessageRef(6)).await;
        store.enqueue(B, C, MessageRef(7)).await;
        let token = store.hash(C).await;

        let snapshot = store.snapshot().await;
        let restored = RelayStore::from_snapshot(snapshot.clone());

        assert_eq!(restored.snapshot().await, snapshot);
        assert_eq!(restored.partner_of(A).await, Some(B));
        assert!(restored.is_blocked(C, A).await);
        assert_eq!(restored.unhash(&token).await, Some(C));
        assert_eq!(restored.hash(C).await, token);
        assert_eq!(
            restored.pop_one_sender(C).await,
            Some((B, vec![MessageRef(5), MessageRef(7)]))
        );
    }

    #[tokio::test]
    async fn test_null_partner_loads_as_no_edge() {
        let mut snapshot = Snapshot::default();
        snapshot.pairings.insert(A, None);

        let store = RelayStore::from_snapshot(snapshot);
        assert!(!store.is_chatting(A).await);
        assert!(store.snapshot().await.salt.is_some());
    }

    #[tokio::test]
    async fn test_purge_idle_keeps_users_with_state() {
        let store = store();
        store.is_chatting(A).await;
        store.start_chat(B, C).await;
        store.enqueue(A, C, MessageRef(1)).await;
        assert_eq!(store.stats().await.tracked_users, 3);

        assert_eq!(store.purge_idle().await, 1);
        let stats = store.stats().await;
        assert_eq!(stats.tracked_users, 2);
        assert_eq!(store.partner_of(B).await, Some(C));
        assert_eq!(store.inbox_summary(C).await.messages, 1);
    }
}
