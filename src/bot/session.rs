//! Per-user conversation state. Every field here is owned by the dispatcher task, so no
//! locking is needed; events for one user are handled strictly one at a time.

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;

use super::transport::{ChatId, MessageRef};

/// Identifier of a confirmation prompt. Consumed on the first decision.
pub type PromptId = u64;

/// What kind of text input the bot currently expects from a user. While this is set,
/// incoming text is fed to the matching conversation step and never treated as a timer
/// message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// Initial registration, hourly rate step.
    Rate,
    /// Initial registration, earnings goal step.
    Goal,
    ManualTime,
    ChangeRate,
    ChangeGoal,
}

/// A proposed commit waiting for an explicit user decision. There is deliberately no
/// timeout on these: only the pre-confirmation debounce is timed.
#[derive(Debug)]
pub struct PendingConfirmation {
    /// Durations in arrival order.
    pub items: Vec<u32>,
    /// Minutes that will be committed on confirm.
    pub total: u32,
    pub message: Option<MessageRef>,
}

/// Timer-batching lifecycle of a session.
#[derive(Debug)]
pub enum Phase {
    Idle,
    Collecting {
        /// Durations in arrival order.
        batch: Vec<u32>,
        /// Ties the pending debounce callback to this exact batch. A callback carrying
        /// an older generation finds nothing to flush.
        generation: u64,
        cancel: CancellationToken,
    },
}

#[derive(Debug)]
pub struct Session {
    pub chat: ChatId,
    pub phase: Phase,
    /// Unresolved confirmation prompts. A new batch can start while older prompts are
    /// still waiting, so this is a table rather than a single slot.
    pub pending: HashMap<PromptId, PendingConfirmation>,
    pub awaiting: Option<InputKind>,
    /// Rate remembered between the two registration steps.
    pub pending_rate: Option<f64>,
    /// Last menu-like message, deleted when the next screen replaces it.
    pub last_menu: Option<MessageRef>,
    pub(crate) debounce_seq: u64,
}

impl Session {
    pub fn new(chat: ChatId) -> Self {
        Self {
            chat,
            phase: Phase::Idle,
            pending: HashMap::new(),
            awaiting: None,
            pending_rate: None,
            last_menu: None,
            debounce_seq: 0,
        }
    }
}
