//! The event loop at the center of the bot. One task owns every [Session], pulls
//! [BotEvent]s off a single channel and reacts to them, so state transitions for a user
//! are serialized without any locking.

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    storage::{
        entities::{NotifyFreq, UserId, UserProfileEntity},
        ledger::TimeLedger,
    },
    utils::clock::Clock,
};

use super::{
    aggregator::{self, TimerArrival},
    event::{BotEvent, BotHandle, Decision},
    format::{self, callback},
    notify::Notifier,
    parse,
    session::{InputKind, PendingConfirmation, PromptId, Session},
    transport::{ChatId, ChatTransport, Keyboard, MessageRef},
    BotConfig,
};

const EVENT_BUFFER: usize = 64;

pub struct Dispatcher<L: TimeLedger> {
    events: mpsc::Receiver<BotEvent>,
    handle: BotHandle,
    transport: Arc<dyn ChatTransport>,
    ledger: L,
    clock: Arc<dyn Clock>,
    config: BotConfig,
    sessions: HashMap<UserId, Session>,
    notifier: Notifier,
    next_prompt: PromptId,
    shutdown: CancellationToken,
}

impl<L: TimeLedger> Dispatcher<L> {
    pub fn new(
        ledger: L,
        transport: Arc<dyn ChatTransport>,
        clock: Arc<dyn Clock>,
        config: BotConfig,
        shutdown: CancellationToken,
    ) -> (BotHandle, Self) {
        let (sender, events) = mpsc::channel(EVENT_BUFFER);
        let handle = BotHandle::new(sender.clone());
        let dispatcher = Self {
            events,
            handle: handle.clone(),
            transport,
            ledger,
            clock: clock.clone(),
            config,
            sessions: HashMap::new(),
            notifier: Notifier::new(sender, clock),
            next_prompt: 1,
            shutdown,
        };
        (handle, dispatcher)
    }

    /// Re-arms notification tickers for every stored profile. Meant to be called once
    /// before [Dispatcher::run], after a restart.
    pub async fn restore_notifications(&mut self, chat_of: impl Fn(UserId) -> ChatId) -> Result<()> {
        for (user, profile) in self.ledger.all_profiles().await? {
            self.notifier.arm(user, chat_of(user), profile.notify);
        }
        Ok(())
    }

    pub async fn run(mut self) -> Result<()> {
        info!("Bot event loop started");
        loop {
            tokio::select! {
                biased;
                event = self.events.recv() => {
                    let Some(event) = event else {
                        return Ok(());
                    };
                    if let Err(e) = self.handle_event(event).await {
                        error!("Couldn't handle a bot event: {e:?}");
                    }
                }
                _ = self.shutdown.cancelled() => {
                    info!("Bot event loop stopping");
                    return Ok(());
                }
            }
        }
    }

    async fn handle_event(&mut self, event: BotEvent) -> Result<()> {
        match event {
            BotEvent::IncomingText {
                user,
                chat,
                text,
                forwarded,
            } => {
                let text = text.trim().to_string();
                if text.starts_with('/') {
                    self.handle_command(user, chat, &text).await
                } else if let Some(kind) = self.session_mut(user, chat).awaiting {
                    self.handle_awaited_input(user, chat, kind, &text).await
                } else if parse::is_timer_notification(&text) {
                    self.handle_timer_text(user, chat, &text, forwarded).await
                } else {
                    debug!("Ignoring unrecognized text from user {user}");
                    Ok(())
                }
            }
            BotEvent::ButtonPress {
                user,
                chat,
                callback,
            } => self.handle_callback(user, chat, &callback).await,
            BotEvent::ConfirmationDecision {
                user,
                prompt,
                decision,
            } => self.resolve_prompt(user, prompt, decision).await,
            BotEvent::DebounceElapsed { user, generation } => {
                self.handle_debounce_elapsed(user, generation).await
            }
            BotEvent::NotifyTick { user, chat } => {
                if let Some(progress) = self.ledger.progress(user).await? {
                    self.send(chat, format::notification_message(&progress), None)
                        .await?;
                }
                Ok(())
            }
        }
    }

    async fn handle_command(&mut self, user: UserId, chat: ChatId, text: &str) -> Result<()> {
        let mut parts = text.split_whitespace();
        let command = parts.next().unwrap_or_default();
        match command {
            "/start" => {
                if self.ledger.user_exists(user).await? {
                    self.show_menu(user, chat).await
                } else {
                    self.send(chat, format::GREETING, None).await?;
                    self.session_mut(user, chat).awaiting = Some(InputKind::Rate);
                    Ok(())
                }
            }
            "/rate" => {
                self.send(chat, "Введите новую почасовую ставку:", None)
                    .await?;
                self.session_mut(user, chat).awaiting = Some(InputKind::ChangeRate);
                Ok(())
            }
            "/goal" => {
                self.send(chat, "Введите новую цель заработка:", None)
                    .await?;
                self.session_mut(user, chat).awaiting = Some(InputKind::ChangeGoal);
                Ok(())
            }
            "/notify" => {
                let Some(freq) = parts.next().and_then(NotifyFreq::parse) else {
                    self.send(chat, "Использование: /notify [hour/day/week/off]", None)
                        .await?;
                    return Ok(());
                };
                if !self.apply_notify(user, chat, freq).await? {
                    return Ok(());
                }
                let reply = match freq {
                    NotifyFreq::Off => "Уведомления отключены.".to_string(),
                    _ => format!("Уведомления настроены: {}.", freq_label(freq)),
                };
                self.send(chat, reply, None).await?;
                Ok(())
            }
            "/help" => {
                self.send(chat, format::HELP, None).await?;
                Ok(())
            }
            "/cancel" => {
                let session = self.session_mut(user, chat);
                session.awaiting = None;
                session.pending_rate = None;
                aggregator::abort_collecting(session);
                self.send(chat, "Действие отменено. Возвращаемся в главное меню.", None)
                    .await?;
                self.show_menu(user, chat).await
            }
            other => {
                debug!("Unknown command {other} from user {user}");
                Ok(())
            }
        }
    }

    async fn handle_awaited_input(
        &mut self,
        user: UserId,
        chat: ChatId,
        kind: InputKind,
        text: &str,
    ) -> Result<()> {
        match kind {
            InputKind::Rate => {
                let Some(rate) = parse_amount(text) else {
                    self.send(
                        chat,
                        "Пожалуйста, введите корректное числовое значение для почасовой \
                         ставки.\nНапример: 500 или 500₽",
                        None,
                    )
                    .await?;
                    return Ok(());
                };
                let session = self.session_mut(user, chat);
                session.pending_rate = Some(rate);
                session.awaiting = Some(InputKind::Goal);
                self.send(
                    chat,
                    format!(
                        "Отлично! Ваша почасовая ставка: {}\n\nТеперь укажите цель заработка:",
                        format::format_money(rate)
                    ),
                    None,
                )
                .await?;
                Ok(())
            }
            InputKind::Goal => {
                let Some(goal) = parse_amount(text) else {
                    self.send(
                        chat,
                        "Пожалуйста, введите корректное числовое значение для цели.\n\
                         Например: 10000 или 10000₽",
                        None,
                    )
                    .await?;
                    return Ok(());
                };
                let session = self.session_mut(user, chat);
                session.awaiting = None;
                let Some(rate) = session.pending_rate.take() else {
                    self.send(
                        chat,
                        "Произошла ошибка при сохранении ставки. Пожалуйста, начните \
                         сначала с команды /start",
                        None,
                    )
                    .await?;
                    return Ok(());
                };
                self.ledger
                    .upsert_profile(
                        user,
                        UserProfileEntity {
                            rate,
                            goal,
                            earned: 0.,
                            notify: NotifyFreq::Day,
                        },
                    )
                    .await?;
                self.notifier.arm(user, chat, NotifyFreq::Day);
                info!("Registered user {user} with rate {rate} and goal {goal}");
                self.send(
                    chat,
                    format!(
                        "Отлично! Ваша цель заработка: {}\n\nНастройка завершена, теперь вы \
                         можете использовать бот для отслеживания времени.",
                        format::format_money(goal)
                    ),
                    None,
                )
                .await?;
                self.show_menu(user, chat).await
            }
            InputKind::ChangeRate => {
                let Some(rate) = parse_amount(text) else {
                    self.send(
                        chat,
                        "Пожалуйста, введите корректное числовое значение для почасовой \
                         ставки.\nНапример: 500 или 500₽",
                        None,
                    )
                    .await?;
                    return Ok(());
                };
                self.ledger.update_rate(user, rate).await?;
                self.session_mut(user, chat).awaiting = None;
                self.send_ephemeral(
                    chat,
                    format!("✅ Ставка успешно обновлена: {}", format::format_money(rate)),
                    self.config.ephemeral_ttl,
                )
                .await?;
                self.show_menu(user, chat).await
            }
            InputKind::ChangeGoal => {
                let Some(goal) = parse_amount(text) else {
                    self.send(
                        chat,
                        "Пожалуйста, введите корректное числовое значение для цели.\n\
                         Например: 10000 или 10000₽",
                        None,
                    )
                    .await?;
                    return Ok(());
                };
                self.ledger.update_goal(user, goal).await?;
                self.session_mut(user, chat).awaiting = None;
                self.send_ephemeral(
                    chat,
                    format!("✅ Цель успешно обновлена: {}", format::format_money(goal)),
                    self.config.ephemeral_ttl,
                )
                .await?;
                self.show_menu(user, chat).await
            }
            InputKind::ManualTime => {
                let Some(minutes) = parse::parse_free_text(text) else {
                    self.send_ephemeral(
                        chat,
                        format::MANUAL_TIME_RETRY,
                        self.config.retry_hint_ttl,
                    )
                    .await?;
                    return Ok(());
                };
                self.session_mut(user, chat).awaiting = None;
                self.commit_minutes(user, chat, minutes).await
            }
        }
    }

    async fn handle_callback(&mut self, user: UserId, chat: ChatId, callback: &str) -> Result<()> {
        if let Some(prompt) = callback
            .strip_prefix(callback::CONFIRM_PREFIX)
            .and_then(|v| v.parse().ok())
        {
            return self.resolve_prompt(user, prompt, Decision::Confirm).await;
        }
        if let Some(prompt) = callback
            .strip_prefix(callback::CANCEL_PREFIX)
            .and_then(|v| v.parse().ok())
        {
            return self.resolve_prompt(user, prompt, Decision::Cancel).await;
        }
        if callback != callback::TIME_MANUAL {
            if let Some(minutes) = callback
                .strip_prefix(callback::QUICK_TIME_PREFIX)
                .and_then(|v| v.parse::<u32>().ok())
            {
                return self.open_quick_prompt(user, chat, minutes).await;
            }
        }
        if let Some(freq) = callback
            .strip_prefix(callback::NOTIFY_PREFIX)
            .and_then(NotifyFreq::parse)
        {
            if !self.apply_notify(user, chat, freq).await? {
                return Ok(());
            }
            let reply = match freq {
                NotifyFreq::Off => "Уведомления отключены.".to_string(),
                _ => format!("Уведомления будут приходить: {}.", freq_label(freq)),
            };
            return self
                .show_screen(user, chat, reply, Some(format::back_keyboard(callback::SETTINGS)))
                .await;
        }

        match callback {
            callback::MAIN_MENU => self.show_menu(user, chat).await,
            callback::ADD_TIME => {
                self.show_screen(
                    user,
                    chat,
                    "Выберите время или введите вручную:",
                    Some(format::add_time_keyboard()),
                )
                .await
            }
            callback::TIME_MANUAL => {
                self.show_screen(user, chat, format::MANUAL_TIME_HINT, None)
                    .await?;
                self.session_mut(user, chat).awaiting = Some(InputKind::ManualTime);
                Ok(())
            }
            callback::PROGRESS => {
                let Some(progress) = self.ledger.progress(user).await? else {
                    self.send(chat, format::PROFILE_MISSING, None).await?;
                    return Ok(());
                };
                self.show_screen(
                    user,
                    chat,
                    format::progress_message(&progress),
                    Some(format::back_keyboard(callback::MAIN_MENU)),
                )
                .await
            }
            callback::HISTORY => {
                let records = self.ledger.history(user, self.config.history_limit).await?;
                self.show_screen(
                    user,
                    chat,
                    format::history_message(&records),
                    Some(format::back_keyboard(callback::MAIN_MENU)),
                )
                .await
            }
            callback::SETTINGS => {
                self.show_screen(user, chat, "Настройки:", Some(format::settings_keyboard()))
                    .await
            }
            callback::CHANGE_RATE => {
                self.show_screen(user, chat, "Введите новую почасовую ставку:", None)
                    .await?;
                self.session_mut(user, chat).awaiting = Some(InputKind::ChangeRate);
                Ok(())
            }
            callback::CHANGE_GOAL => {
                self.show_screen(user, chat, "Введите новую цель заработка:", None)
                    .await?;
                self.session_mut(user, chat).awaiting = Some(InputKind::ChangeGoal);
                Ok(())
            }
            callback::NOTIFICATIONS => {
                self.show_screen(
                    user,
                    chat,
                    "Настройка уведомлений:",
                    Some(format::notifications_keyboard()),
                )
                .await
            }
            callback::RESET => {
                let Some(progress) = self.ledger.progress(user).await? else {
                    self.send(chat, format::PROFILE_MISSING, None).await?;
                    return Ok(());
                };
                let warning = format!(
                    "⚠️ ВНИМАНИЕ! ⚠️\n\nВы собираетесь сбросить свой прогресс.\n\
                     Текущий заработок: {}\n\nИстория записей и счётчик заработка будут \
                     удалены, ставка и цель останутся.\nЭто действие нельзя отменить.",
                    format::format_money(progress.earned)
                );
                self.show_screen(user, chat, warning, Some(format::reset_warning_keyboard()))
                    .await
            }
            callback::RESET_CONFIRM => match self.ledger.reset_progress(user).await {
                Ok(()) => {
                    info!("Reset progress of user {user}");
                    self.show_screen(
                        user,
                        chat,
                        "✅ Все данные успешно сброшены!\nИстория записей и счётчик \
                         заработка удалены.\n\nЖелаете установить новую цель заработка?",
                        Some(format::after_reset_keyboard()),
                    )
                    .await
                }
                Err(e) => {
                    warn!("Couldn't reset progress of user {user}: {e:?}");
                    self.send(
                        chat,
                        "❌ Произошла ошибка при сбросе данных. Попробуйте позже.",
                        None,
                    )
                    .await?;
                    self.show_menu(user, chat).await
                }
            },
            other => {
                debug!("Unknown callback {other} from user {user}");
                Ok(())
            }
        }
    }

    async fn handle_timer_text(
        &mut self,
        user: UserId,
        chat: ChatId,
        text: &str,
        forwarded: bool,
    ) -> Result<()> {
        let Some(minutes) = parse::parse_timer_notification(text) else {
            debug!("Timer notification of user {user} carried no usable duration");
            return Ok(());
        };
        info!("Recognized {minutes} minutes in a timer notification of user {user}");

        if !self.ledger.user_exists(user).await? {
            self.send(chat, format::SETUP_REQUIRED, None).await?;
            return Ok(());
        }

        match aggregator::note_timer(self.session_mut(user, chat), minutes, forwarded) {
            TimerArrival::PromptNow => self.open_timer_prompt(user, chat, vec![minutes]).await,
            TimerArrival::Buffered { generation, cancel } => {
                self.arm_debounce(user, generation, cancel);
                Ok(())
            }
        }
    }

    /// Spawns the timer that flushes the user's batch once no further timer messages
    /// arrive within the debounce window. The token cancels it when another one does.
    fn arm_debounce(&self, user: UserId, generation: u64, cancel: CancellationToken) {
        let window = self.config.debounce_window;
        let clock = self.clock.clone();
        let handle = self.handle.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = clock.sleep(window) => {
                    let _ = handle
                        .send(BotEvent::DebounceElapsed { user, generation })
                        .await;
                }
            }
        });
    }

    async fn handle_debounce_elapsed(&mut self, user: UserId, generation: u64) -> Result<()> {
        let Some(session) = self.sessions.get_mut(&user) else {
            return Ok(());
        };
        let chat = session.chat;
        let Some(items) = aggregator::take_batch(session, generation) else {
            debug!("Stale debounce callback for user {user}, generation {generation}");
            return Ok(());
        };
        self.open_timer_prompt(user, chat, items).await
    }

    async fn open_timer_prompt(
        &mut self,
        user: UserId,
        chat: ChatId,
        items: Vec<u32>,
    ) -> Result<()> {
        let Some(profile) = self.ledger.get_profile(user).await? else {
            self.send(chat, format::PROFILE_MISSING, None).await?;
            return Ok(());
        };

        let (text, confirm_label, cancel_label) = if let [minutes] = items[..] {
            let earnings = (minutes as f64 / 60.) * profile.rate;
            (
                format::single_timer_prompt(minutes, earnings),
                "Да, добавить",
                "Нет, отмена",
            )
        } else {
            (
                format::batch_timer_prompt(&items, profile.rate),
                "Добавить всё",
                "Отмена",
            )
        };
        self.open_prompt(user, chat, items, text, confirm_label, cancel_label)
            .await
    }

    async fn open_quick_prompt(&mut self, user: UserId, chat: ChatId, minutes: u32) -> Result<()> {
        let Some(profile) = self.ledger.get_profile(user).await? else {
            self.send(chat, format::PROFILE_MISSING, None).await?;
            return Ok(());
        };
        let earnings = (minutes as f64 / 60.) * profile.rate;
        self.open_prompt(
            user,
            chat,
            vec![minutes],
            format::quick_add_prompt(minutes, earnings),
            "Подтвердить",
            "Отмена",
        )
        .await
    }

    async fn open_prompt(
        &mut self,
        user: UserId,
        chat: ChatId,
        items: Vec<u32>,
        text: String,
        confirm_label: &str,
        cancel_label: &str,
    ) -> Result<()> {
        let prompt_id = self.next_prompt;
        self.next_prompt += 1;

        let message = self
            .transport
            .send(
                chat,
                text,
                Some(format::confirm_keyboard(prompt_id, confirm_label, cancel_label)),
            )
            .await?;

        let total = items.iter().sum();
        self.session_mut(user, chat).pending.insert(
            prompt_id,
            PendingConfirmation {
                items,
                total,
                message: Some(message),
            },
        );
        Ok(())
    }

    /// Settles a confirmation prompt. The entry is removed from the session before
    /// anything else happens, so a second press of either button finds nothing and the
    /// commit can run at most once.
    async fn resolve_prompt(
        &mut self,
        user: UserId,
        prompt: PromptId,
        decision: Decision,
    ) -> Result<()> {
        let Some(session) = self.sessions.get_mut(&user) else {
            return Ok(());
        };
        let chat = session.chat;
        let Some(pending) = session.pending.remove(&prompt) else {
            debug!("Decision for an already settled prompt {prompt} of user {user}");
            return Ok(());
        };

        if let Some(message) = pending.message {
            if let Err(e) = self.transport.delete(message).await {
                debug!("Couldn't delete prompt message: {e:?}");
            }
        }

        match decision {
            Decision::Confirm => self.commit_minutes(user, chat, pending.total).await,
            Decision::Cancel => {
                self.send_ephemeral(
                    chat,
                    "❌ Добавление времени отменено.",
                    self.config.ephemeral_ttl,
                )
                .await?;
                self.show_menu(user, chat).await
            }
        }
    }

    async fn commit_minutes(&mut self, user: UserId, chat: ChatId, minutes: u32) -> Result<()> {
        match self.ledger.add_time_record(user, minutes).await {
            Ok(earnings) => {
                self.send_ephemeral(
                    chat,
                    format::time_added_message(minutes, earnings),
                    self.config.ephemeral_ttl,
                )
                .await?;
                self.show_menu(user, chat).await
            }
            Err(e) => {
                // The duration is reported back to the user but not kept for a retry.
                warn!("Couldn't commit {minutes} minutes for user {user}: {e:?}");
                self.send(chat, format::commit_failed_message(minutes), None)
                    .await?;
                Ok(())
            }
        }
    }

    async fn apply_notify(&mut self, user: UserId, chat: ChatId, freq: NotifyFreq) -> Result<bool> {
        if !self.ledger.user_exists(user).await? {
            self.send(chat, format::SETUP_REQUIRED, None).await?;
            return Ok(false);
        }
        self.ledger.update_notify(user, freq).await?;
        match freq {
            NotifyFreq::Off => self.notifier.disarm(user),
            _ => self.notifier.arm(user, chat, freq),
        }
        Ok(true)
    }

    /// Replaces the previous menu-like message with the main menu.
    async fn show_menu(&mut self, user: UserId, chat: ChatId) -> Result<()> {
        let text = match self.ledger.get_profile(user).await? {
            Some(profile) => {
                let total_hours = self.ledger.total_minutes(user).await? as f64 / 60.;
                format::main_menu_text(&profile, &profile.progress(), total_hours)
            }
            None => "Главное меню:".to_string(),
        };
        self.show_screen(user, chat, text, Some(format::main_menu_keyboard()))
            .await
    }

    /// Sends a message that takes the place of the previous menu-like message, which is
    /// deleted on a best-effort basis.
    async fn show_screen(
        &mut self,
        user: UserId,
        chat: ChatId,
        text: impl Into<String>,
        keyboard: Option<Keyboard>,
    ) -> Result<()> {
        if let Some(previous) = self.session_mut(user, chat).last_menu.take() {
            if let Err(e) = self.transport.delete(previous).await {
                debug!("Couldn't delete the previous menu message: {e:?}");
            }
        }
        let message = self.transport.send(chat, text.into(), keyboard).await?;
        self.session_mut(user, chat).last_menu = Some(message);
        Ok(())
    }

    async fn send(
        &self,
        chat: ChatId,
        text: impl Into<String>,
        keyboard: Option<Keyboard>,
    ) -> Result<MessageRef> {
        self.transport.send(chat, text.into(), keyboard).await
    }

    /// Sends a status message and schedules its deletion after `ttl`.
    async fn send_ephemeral(
        &self,
        chat: ChatId,
        text: impl Into<String>,
        ttl: Duration,
    ) -> Result<()> {
        let message = self.send(chat, text, None).await?;
        let transport = self.transport.clone();
        let clock = self.clock.clone();
        tokio::spawn(async move {
            clock.sleep(ttl).await;
            if let Err(e) = transport.delete(message).await {
                debug!("Couldn't delete an ephemeral message: {e:?}");
            }
        });
        Ok(())
    }

    fn session_mut(&mut self, user: UserId, chat: ChatId) -> &mut Session {
        let session = self
            .sessions
            .entry(user)
            .or_insert_with(|| Session::new(chat));
        session.chat = chat;
        session
    }
}

fn freq_label(freq: NotifyFreq) -> &'static str {
    match freq {
        NotifyFreq::Hour => "каждый час",
        NotifyFreq::Day => "ежедневно",
        NotifyFreq::Week => "еженедельно",
        NotifyFreq::Off => "отключены",
    }
}

/// Parses money amounts like "500", "500₽", "500 руб" or "499,9".
fn parse_amount(text: &str) -> Option<f64> {
    let cleaned = text
        .replace("руб", "")
        .replace('₽', "")
        .replace('р', "")
        .replace(',', ".");
    let value = cleaned.trim().parse::<f64>().ok()?;
    (value.is_finite() && value >= 0.).then_some(value)
}
