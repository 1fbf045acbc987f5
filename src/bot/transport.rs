//! Contains the contract for talking to a chat network and a terminal-backed
//! implementation of it. [ChatTransport] is the main artifact of this module: the rest
//! of the bot never touches a chat API directly.

use std::sync::atomic::{AtomicI64, Ordering};

use ansi_term::{Colour, Style};
use anyhow::Result;
use async_trait::async_trait;

use crate::storage::entities::UserId;

/// Identifier of a conversation the bot replies into.
pub type ChatId = i64;

/// Points at a message the bot has sent, used for later deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub chat: ChatId,
    pub id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    pub label: String,
    /// Opaque payload delivered back through a button press event.
    pub callback: String,
}

impl Button {
    pub fn new(label: impl Into<String>, callback: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            callback: callback.into(),
        }
    }
}

/// Rows of inline buttons attached to a message.
pub type Keyboard = Vec<Vec<Button>>;

/// Intended to serve as a contract every chat backend must implement.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatTransport: Send + Sync + 'static {
    async fn send(
        &self,
        chat: ChatId,
        text: String,
        keyboard: Option<Keyboard>,
    ) -> Result<MessageRef>;

    async fn delete(&self, message: MessageRef) -> Result<()>;
}

/// Chat id used by [ConsoleTransport]. The console is a single conversation.
pub const CONSOLE_CHAT: ChatId = 0;

/// User id used by [ConsoleTransport].
pub const CONSOLE_USER: UserId = 0;

/// Renders the conversation into the terminal. Useful for trying the bot out and for
/// debugging without a chat network behind it.
pub struct ConsoleTransport {
    next_id: AtomicI64,
}

impl ConsoleTransport {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
        }
    }
}

impl Default for ConsoleTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatTransport for ConsoleTransport {
    async fn send(
        &self,
        chat: ChatId,
        text: String,
        keyboard: Option<Keyboard>,
    ) -> Result<MessageRef> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        println!();
        println!("{}", Style::new().bold().paint(format!("#{id}")));
        println!("{text}");
        if let Some(keyboard) = keyboard {
            for row in keyboard {
                let rendered = row
                    .iter()
                    .map(|b| {
                        format!(
                            "[{}] {}",
                            Colour::Cyan.paint(&b.callback),
                            Style::new().bold().paint(&b.label)
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("   ");
                println!("  {rendered}");
            }
            println!(
                "{}",
                Colour::Fixed(8).paint("  press a button with: press <callback>")
            );
        }
        Ok(MessageRef { chat, id })
    }

    async fn delete(&self, message: MessageRef) -> Result<()> {
        println!(
            "{}",
            Colour::Fixed(8).paint(format!("(message #{} removed)", message.id))
        );
        Ok(())
    }
}
