//! Update dispatch.
//!
//! Turns inbound platform events ([`Update`]) into store operations and
//! transport calls. This layer owns the business rules the store leaves to
//! its caller: no chats with oneself, no starting a chat with someone who
//! blocked you, and no queueing from a blocked sender.
//!
//! Nothing here produces human-readable text. The transport receives
//! semantic [`Notice`]s and decides how to render them.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use veilbox_shared::constants::CHAT_LINK_PREFIX;
use veilbox_shared::{LinkToken, MessageRef, UserId};
use veilbox_store::RelayStore;

use crate::error::ServerError;

/// One inbound event from the messaging platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Update {
    /// A plain (non-command) message.
    Message { from: UserId, message: MessageRef },
    /// `/start`, optionally with a deep-link payload such as `chat-<token>`.
    Start {
        from: UserId,
        #[serde(default)]
        payload: Option<String>,
    },
    EndChat { from: UserId },
    /// Ask to block the current partner; answered with a confirmation.
    Block { from: UserId },
    ConfirmBlock { from: UserId, token: String },
    Unblock { from: UserId, token: String },
    /// Ask for the inbox summary.
    Inbox { from: UserId },
    /// Read one sender's backlog and start chatting with them.
    ReadInbox { from: UserId },
}

impl Update {
    pub fn sender(&self) -> UserId {
        match self {
            Update::Message { from, .. }
            | Update::Start { from, .. }
            | Update::EndChat { from }
            | Update::Block { from }
            | Update::ConfirmBlock { from, .. }
            | Update::Unblock { from, .. }
            | Update::Inbox { from }
            | Update::ReadInbox { from } => *from,
        }
    }
}

/// Semantic notification for a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    /// The user's own share link.
    ShareLink { token: LinkToken },
    ChatStarted,
    ChatEnded,
    NotChatting,
    InvalidLink,
    SelfChat,
    /// Messages are waiting in the user's inbox.
    Unread { messages: usize },
    /// The inbox can only be opened outside a chat.
    FinishChatFirst,
    InboxEmpty,
    InboxSummary { senders: usize, messages: usize },
    /// Ask the user to confirm blocking the partner behind `token`.
    ConfirmBlock { token: LinkToken },
    Blocked { token: LinkToken },
    Unblocked { token: LinkToken },
    /// The user's live partner blocked them; the chat is over.
    PartnerBlockedYou,
    /// The receiver read the backlog ending with `last`.
    BacklogRead { last: MessageRef },
}

/// Delivery side of the relay, supplied by the platform integration.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Copy `message`, owned by `from`'s chat, into `to`'s chat.
    async fn copy_message(
        &self,
        from: UserId,
        to: UserId,
        message: MessageRef,
    ) -> Result<(), ServerError>;

    async fn notify(&self, to: UserId, notice: Notice) -> Result<(), ServerError>;
}

/// A transport call, recorded instead of performed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Copy {
        from: UserId,
        to: UserId,
        message: MessageRef,
    },
    Notify {
        to: UserId,
        notice: Notice,
    },
}

/// Transport that collects actions for the caller to perform later.
#[derive(Debug, Default)]
pub struct OutboxTransport {
    actions: Mutex<Vec<Action>>,
}

impl OutboxTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain the recorded actions in the order they were issued.
    pub async fn take(&self) -> Vec<Action> {
        std::mem::take(&mut *self.actions.lock().await)
    }
}

#[async_trait]
impl Transport for OutboxTransport {
    async fn copy_message(
        &self,
        from: UserId,
        to: UserId,
        message: MessageRef,
    ) -> Result<(), ServerError> {
        self.actions
            .lock()
            .await
            .push(Action::Copy { from, to, message });
        Ok(())
    }

    async fn notify(&self, to: UserId, notice: Notice) -> Result<(), ServerError> {
        self.actions.lock().await.push(Action::Notify { to, notice });
        Ok(())
    }
}

/// Applies updates to the shared [`RelayStore`].
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<RelayStore>,
}

impl Dispatcher {
    pub fn new(store: Arc<RelayStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<RelayStore> {
        &self.store
    }

    pub async fn handle(
        &self,
        update: Update,
        transport: &dyn Transport,
    ) -> Result<(), ServerError> {
        debug!(?update, "Dispatching update");
        match update {
            Update::Message { from, message } => self.relay(from, message, transport).await,
            Update::Start { from, payload } => self.start(from, payload, transport).await,
            Update::EndChat { from } => self.end_chat(from, transport).await,
            Update::Block { from } => self.request_block(from, transport).await,
            Update::ConfirmBlock { from, token } => self.block(from, &token, transport).await,
            Update::Unblock { from, token } => self.unblock(from, &token, transport).await,
            Update::Inbox { from } => self.inbox(from, transport).await,
            Update::ReadInbox { from } => self.read_inbox(from, transport).await,
        }
    }

    /// Deliver live when the pairing is mutual, otherwise queue for the
    /// partner.
    async fn relay(
        &self,
        from: UserId,
        message: MessageRef,
        transport: &dyn Transport,
    ) -> Result<(), ServerError> {
        let Some(partner) = self.store.partner_of(from).await else {
            return transport.notify(from, Notice::NotChatting).await;
        };

        if self.store.partner_of(partner).await == Some(from) {
            return transport.copy_message(from, partner, message).await;
        }

        // Blocked senders are dropped silently.
        if self.store.is_blocked(partner, from).await {
            debug!(from = %from, to = %partner, "Message from blocked sender dropped");
            return Ok(());
        }

        self.store.enqueue(from, partner, message).await;
        if !self.store.is_chatting(partner).await {
            let summary = self.store.inbox_summary(partner).await;
            transport
                .notify(
                    partner,
                    Notice::Unread {
                        messages: summary.messages,
                    },
                )
                .await?;
        }
        Ok(())
    }

    async fn start(
        &self,
        from: UserId,
        payload: Option<String>,
        transport: &dyn Transport,
    ) -> Result<(), ServerError> {
        let payload = payload.unwrap_or_default();
        let payload = payload.trim();
        if payload.is_empty() {
            let token = self.store.hash(from).await;
            return transport.notify(from, Notice::ShareLink { token }).await;
        }

        let Some(target) = self.resolve(payload.strip_prefix(CHAT_LINK_PREFIX)).await else {
            return transport.notify(from, Notice::InvalidLink).await;
        };
        if target == from {
            return transport.notify(from, Notice::SelfChat).await;
        }
        if self.store.is_blocked(target, from).await {
            return transport.notify(from, Notice::InvalidLink).await;
        }

        self.store.start_chat(from, target).await;
        info!(from = %from, to = %target, "Chat started from share link");
        transport.notify(from, Notice::ChatStarted).await
    }

    async fn end_chat(&self, from: UserId, transport: &dyn Transport) -> Result<(), ServerError> {
        if self.store.end_chat(from).await {
            transport.notify(from, Notice::ChatEnded).await
        } else {
            transport.notify(from, Notice::NotChatting).await
        }
    }

    async fn request_block(
        &self,
        from: UserId,
        transport: &dyn Transport,
    ) -> Result<(), ServerError> {
        match self.store.partner_of(from).await {
            Some(partner) => {
                let token = self.store.hash(partner).await;
                transport.notify(from, Notice::ConfirmBlock { token }).await
            }
            None => transport.notify(from, Notice::NotChatting).await,
        }
    }

    async fn block(
        &self,
        from: UserId,
        token: &str,
        transport: &dyn Transport,
    ) -> Result<(), ServerError> {
        let Some(target) = self.resolve(Some(token)).await else {
            debug!(from = %from, "Block with unknown token ignored");
            return Ok(());
        };
        if target == from {
            return Ok(());
        }

        let was_live = self.store.partner_of(target).await == Some(from);
        self.store.block(from, target).await;
        info!(owner = %from, target = %target, was_live, "User blocked");

        if was_live {
            transport.notify(target, Notice::PartnerBlockedYou).await?;
        }
        let token = self.store.hash(target).await;
        transport.notify(from, Notice::Blocked { token }).await
    }

    async fn unblock(
        &self,
        from: UserId,
        token: &str,
        transport: &dyn Transport,
    ) -> Result<(), ServerError> {
        let Some(target) = self.resolve(Some(token)).await else {
            debug!(from = %from, "Unblock with unknown token ignored");
            return Ok(());
        };

        self.store.unblock(from, target).await;
        info!(owner = %from, target = %target, "User unblocked");
        let token = self.store.hash(target).await;
        transport.notify(from, Notice::Unblocked { token }).await
    }

    async fn inbox(&self, from: UserId, transport: &dyn Transport) -> Result<(), ServerError> {
        if self.store.is_chatting(from).await {
            return transport.notify(from, Notice::FinishChatFirst).await;
        }

        let summary = self.store.inbox_summary(from).await;
        let notice = if summary.senders == 0 {
            Notice::InboxEmpty
        } else {
            Notice::InboxSummary {
                senders: summary.senders,
                messages: summary.messages,
            }
        };
        transport.notify(from, notice).await
    }

    /// Pop one sender's backlog, pair with them and replay it in order.
    ///
    /// Backlogs from senders blocked after they queued are discarded.
    async fn read_inbox(&self, from: UserId, transport: &dyn Transport) -> Result<(), ServerError> {
        let (sender, messages) = loop {
            let Some((sender, messages)) = self.store.pop_one_sender(from).await else {
                return transport.notify(from, Notice::InboxEmpty).await;
            };
            if !self.store.is_blocked(from, sender).await {
                break (sender, messages);
            }
            debug!(
                receiver = %from,
                sender = %sender,
                count = messages.len(),
                "Discarded backlog from blocked sender"
            );
        };

        self.store.start_chat(from, sender).await;
        transport.notify(from, Notice::ChatStarted).await?;

        for message in &messages {
            transport.copy_message(sender, from, *message).await?;
        }
        if let Some(last) = messages.last() {
            transport
                .notify(sender, Notice::BacklogRead { last: *last })
                .await?;
        }

        info!(receiver = %from, sender = %sender, count = messages.len(), "Backlog read");
        Ok(())
    }

    async fn resolve(&self, token: Option<&str>) -> Option<UserId> {
        let token = LinkToken::parse(token?).ok()?;
        self.store.unhash(&token).await
    }
}
