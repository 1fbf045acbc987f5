use anyhow::{anyhow, Result};
use tokio::sync::mpsc;

use crate::storage::entities::UserId;

use super::{session::PromptId, transport::ChatId};

/// A user's answer to a confirmation prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Confirm,
    Cancel,
}

/// Everything the dispatcher reacts to. Incoming chat traffic and internal timer
/// callbacks go through the same channel, which is what serializes per-user state
/// transitions.
#[derive(Debug, Clone)]
pub enum BotEvent {
    IncomingText {
        user: UserId,
        chat: ChatId,
        text: String,
        forwarded: bool,
    },
    ButtonPress {
        user: UserId,
        chat: ChatId,
        callback: String,
    },
    ConfirmationDecision {
        user: UserId,
        prompt: PromptId,
        decision: Decision,
    },
    /// A debounce window ran out without new timer messages for this batch generation.
    DebounceElapsed { user: UserId, generation: u64 },
    NotifyTick { user: UserId, chat: ChatId },
}

/// Cloneable entry point for feeding events into a running bot.
#[derive(Clone)]
pub struct BotHandle {
    sender: mpsc::Sender<BotEvent>,
}

impl BotHandle {
    pub(crate) fn new(sender: mpsc::Sender<BotEvent>) -> Self {
        Self { sender }
    }

    pub async fn on_incoming_text(
        &self,
        user: UserId,
        chat: ChatId,
        text: impl Into<String>,
        forwarded: bool,
    ) -> Result<()> {
        self.send(BotEvent::IncomingText {
            user,
            chat,
            text: text.into(),
            forwarded,
        })
        .await
    }

    /// Feeds a candidate timer message, the narrow entry point for callers that already
    /// filtered their traffic.
    pub async fn on_timer_text(
        &self,
        user: UserId,
        chat: ChatId,
        text: impl Into<String>,
    ) -> Result<()> {
        self.on_incoming_text(user, chat, text, false).await
    }

    pub async fn on_button_press(
        &self,
        user: UserId,
        chat: ChatId,
        callback: impl Into<String>,
    ) -> Result<()> {
        self.send(BotEvent::ButtonPress {
            user,
            chat,
            callback: callback.into(),
        })
        .await
    }

    pub async fn on_confirmation_decision(
        &self,
        user: UserId,
        prompt: PromptId,
        decision: Decision,
    ) -> Result<()> {
        self.send(BotEvent::ConfirmationDecision {
            user,
            prompt,
            decision,
        })
        .await
    }

    pub(crate) async fn send(&self, event: BotEvent) -> Result<()> {
        self.sender
            .send(event)
            .await
            .map_err(|_| anyhow!("The bot event loop is no longer running"))
    }
}
