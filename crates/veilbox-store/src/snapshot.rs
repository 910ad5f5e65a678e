//! Point-in-time copy of the relay state, as exchanged with persistence.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use veilbox_shared::{LinkToken, MessageRef, Salt, UserId};

/// One sender's pending messages in a receiver's inbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxEntry {
    pub sender: UserId,
    pub messages: Vec<MessageRef>,
}

/// Everything the relay needs to resume after a restart.
///
/// `pairings` may carry explicit `None` partners; they load as "no edge".
/// Inbox entries are listed in drain order so that order survives a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub pairings: BTreeMap<UserId, Option<UserId>>,
    pub blocks: BTreeMap<UserId, BTreeSet<UserId>>,
    pub inbox: BTreeMap<UserId, Vec<InboxEntry>>,
    pub hashes: BTreeMap<LinkToken, UserId>,
    /// `None` only when nothing was ever persisted.
    pub salt: Option<Salt>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.pairings.is_empty()
            && self.blocks.is_empty()
            && self.inbox.is_empty()
            && self.hashes.is_empty()
            && self.salt.is_none()
    }
}
