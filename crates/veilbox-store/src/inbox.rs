//! Per-receiver message backlog.

use std::collections::{HashMap, VecDeque};

use serde::Serialize;

use veilbox_shared::{MessageRef, UserId};

use crate::snapshot::InboxEntry;

/// Counts reported for a receiver's backlog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InboxSummary {
    /// Number of distinct senders with pending messages.
    pub senders: usize,
    /// Total pending messages across all senders.
    pub messages: usize,
}

/// Pending messages for one receiver, bucketed by sender.
///
/// Buckets are drained oldest-first: the sender whose bucket was created
/// earliest is returned by [`Inbox::pop_oldest`]. Within a bucket messages
/// keep their arrival order.
#[derive(Debug, Default)]
pub struct Inbox {
    buckets: HashMap<UserId, Vec<MessageRef>>,
    order: VecDeque<UserId>,
}

impl Inbox {
    pub fn push(&mut self, sender: UserId, message: MessageRef) {
        let order = &mut self.order;
        self.buckets
            .entry(sender)
            .or_insert_with(|| {
                order.push_back(sender);
                Vec::new()
            })
            .push(message);
    }

    pub fn summary(&self) -> InboxSummary {
        InboxSummary {
            senders: self.buckets.len(),
            messages: self.buckets.values().map(Vec::len).sum(),
        }
    }

    /// Remove and return the oldest sender bucket.
    pub fn pop_oldest(&mut self) -> Option<(UserId, Vec<MessageRef>)> {
        let sender = self.order.pop_front()?;
        let messages = self.buckets.remove(&sender).unwrap_or_default();
        Some((sender, messages))
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Buckets in drain order, for snapshots.
    pub fn entries(&self) -> Vec<InboxEntry> {
        self.order
            .iter()
            .filter_map(|sender| {
                self.buckets.get(sender).map(|messages| InboxEntry {
                    sender: *sender,
                    messages: messages.clone(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buckets_drain_in_creation_order() {
        let mut inbox = Inbox::default();
        inbox.push(UserId(2), MessageRef(10));
        inbox.push(UserId(1), MessageRef(11));
        inbox.push(UserId(2), MessageRef(12));

        assert_eq!(inbox.summary(), InboxSummary { senders: 2, messages: 3 });
        assert_eq!(
            inbox.pop_oldest(),
            Some((UserId(2), vec![MessageRef(10), MessageRef(12)]))
        );
        assert_eq!(inbox.pop_oldest(), Some((UserId(1), vec![MessageRef(11)])));
        assert_eq!(inbox.pop_oldest(), None);
        assert!(inbox.is_empty());
    }

    #[test]
    fn test_drained_sender_gets_a_new_bucket_at_the_back() {
        let mut inbox = Inbox::default();
        inbox.push(UserId(1), MessageRef(1));
        inbox.push(UserId(2), MessageRef(2));
        inbox.pop_oldest();
        inbox.push(UserId(1), MessageRef(3));

        let senders: Vec<_> = inbox.entries().into_iter().map(|e| e.sender).collect();
        assert_eq!(senders, vec![UserId(2), UserId(1)]);
    }
}
