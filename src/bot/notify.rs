//! Periodic progress notifications. Each armed user gets a background task that ticks
//! at the chosen frequency; the handles live in a per-user table owned by whoever
//! created the notifier, never in process-wide state.

use std::{collections::HashMap, sync::Arc};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    storage::entities::{NotifyFreq, UserId},
    utils::clock::Clock,
};

use super::{event::BotEvent, transport::ChatId};

pub struct Notifier {
    handles: HashMap<UserId, CancellationToken>,
    events: mpsc::Sender<BotEvent>,
    clock: Arc<dyn Clock>,
}

impl Notifier {
    pub fn new(events: mpsc::Sender<BotEvent>, clock: Arc<dyn Clock>) -> Self {
        Self {
            handles: HashMap::new(),
            events,
            clock,
        }
    }

    /// Starts ticking for the user at the given frequency. A previously armed schedule
    /// is cancelled first, so there is never more than one ticker per user.
    pub fn arm(&mut self, user: UserId, chat: ChatId, freq: NotifyFreq) {
        self.disarm(user);
        let Some(interval) = freq.interval() else {
            return;
        };

        debug!("Arming {freq:?} notifications for user {user}");
        let token = CancellationToken::new();
        self.handles.insert(user, token.clone());

        let events = self.events.clone();
        let clock = self.clock.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = clock.sleep(interval) => {
                        if events.send(BotEvent::NotifyTick { user, chat }).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    pub fn disarm(&mut self, user: UserId) {
        if let Some(token) = self.handles.remove(&user) {
            token.cancel();
        }
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        for token in self.handles.values() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tokio::sync::mpsc;

    use crate::{
        bot::event::BotEvent,
        storage::entities::NotifyFreq,
        utils::clock::DefaultClock,
    };

    use super::Notifier;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_until_disarmed() {
        let (sender, mut receiver) = mpsc::channel(8);
        let mut notifier = Notifier::new(sender, Arc::new(DefaultClock));

        notifier.arm(1, 1, NotifyFreq::Hour);

        let event = receiver.recv().await.unwrap();
        assert!(matches!(event, BotEvent::NotifyTick { user: 1, chat: 1 }));

        notifier.disarm(1);
        let next = tokio::time::timeout(Duration::from_secs(60 * 60 * 3), receiver.recv()).await;
        assert!(next.is_err() || next.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_off_frequency_never_ticks() {
        let (sender, mut receiver) = mpsc::channel(8);
        let mut notifier = Notifier::new(sender, Arc::new(DefaultClock));

        notifier.arm(1, 1, NotifyFreq::Off);

        let next = tokio::time::timeout(Duration::from_secs(60 * 60 * 24 * 8), receiver.recv()).await;
        assert!(next.is_err());
        drop(notifier);
    }
}
