//! Rendering of every message and keyboard the bot sends. Pure functions only, so the
//! whole surface can be checked without a transport.

use chrono::Local;

use crate::storage::entities::{ProgressSnapshot, TimeRecordEntity, UserProfileEntity};

use super::transport::{Button, Keyboard};

/// Callback payloads understood by the dispatcher. Confirmation buttons additionally
/// carry a prompt id after the prefix, like `confirm:4`.
pub mod callback {
    pub const MAIN_MENU: &str = "main_menu";
    pub const ADD_TIME: &str = "add_time";
    pub const TIME_MANUAL: &str = "time_manual";
    pub const QUICK_TIME_PREFIX: &str = "time_";
    pub const CONFIRM_PREFIX: &str = "confirm:";
    pub const CANCEL_PREFIX: &str = "cancel:";
    pub const PROGRESS: &str = "progress";
    pub const HISTORY: &str = "history";
    pub const SETTINGS: &str = "settings";
    pub const CHANGE_RATE: &str = "change_rate";
    pub const CHANGE_GOAL: &str = "change_goal";
    pub const NOTIFICATIONS: &str = "notifications";
    pub const NOTIFY_PREFIX: &str = "notify_";
    pub const RESET: &str = "reset";
    pub const RESET_CONFIRM: &str = "reset_confirm";
}

pub fn format_time(minutes: u32) -> String {
    if minutes < 60 {
        return format!("{minutes}м");
    }

    let hours = minutes / 60;
    let mins = minutes % 60;

    if mins == 0 {
        format!("{hours}ч")
    } else {
        format!("{hours}ч {mins}м")
    }
}

pub fn format_money(amount: f64) -> String {
    format!("{amount:.0}₽")
}

/// Ten-segment text progress bar, `[●●●○○○○○○○] 34%`.
pub fn progress_bar(percent: u8) -> String {
    let filled = usize::min(10, percent as usize / 10);
    let bar: String = "●".repeat(filled) + &"○".repeat(10 - filled);
    format!("[{bar}] {percent}%")
}

pub fn progress_message(progress: &ProgressSnapshot) -> String {
    format!(
        "Цель: {} | Заработано: {}\n{}\nОсталось: {:.1} часов",
        format_money(progress.goal),
        format_money(progress.earned),
        progress_bar(progress.percent),
        progress.hours_left
    )
}

pub fn notification_message(progress: &ProgressSnapshot) -> String {
    format!(
        "📢\nЗаработано: {} | Осталось: {:.1} ч",
        format_money(progress.earned),
        progress.hours_left
    )
}

pub fn main_menu_text(
    profile: &UserProfileEntity,
    progress: &ProgressSnapshot,
    total_hours: f64,
) -> String {
    let mut text = format!(
        "🎯 Цель: {}\n💰 Заработано: {} ({}%)\n\n",
        format_money(progress.goal),
        format_money(progress.earned),
        progress.percent
    );
    // After a progress reset the worked-hours line would contradict the zeroed counter.
    if !(progress.earned == 0. && total_hours > 0.) {
        text += &format!("⏱️ Отработано: {total_hours:.1}ч\n");
    }
    text += &format!(
        "⌛ Осталось: {:.1}ч\n💵 Ставка: {}/час\n\nВыберите действие:",
        progress.hours_left,
        format_money(profile.rate)
    );
    text
}

pub fn history_line(record: &TimeRecordEntity) -> String {
    let logged_at = record.logged_at.with_timezone(&Local);
    format!(
        "{} - {} ({})",
        logged_at.format("%d.%m.%Y %H:%M"),
        format_time(record.minutes),
        format_money(record.earnings)
    )
}

pub fn history_message(records: &[TimeRecordEntity]) -> String {
    if records.is_empty() {
        return "История пуста.".into();
    }
    let mut text = "📋 История:\n\n".to_string();
    for record in records {
        text += &history_line(record);
        text.push('\n');
    }
    text
}

pub fn single_timer_prompt(minutes: u32, earnings: f64) -> String {
    format!(
        "Обнаружено время: {}\nЗаработок: {}\n\nДобавить это время в учет?",
        format_time(minutes),
        format_money(earnings)
    )
}

/// Itemized summary of a batch of forwarded timers, in arrival order.
pub fn batch_timer_prompt(items: &[u32], rate: f64) -> String {
    let total_minutes: u32 = items.iter().sum();
    let total_earnings = (total_minutes as f64 / 60.) * rate;

    let mut text = "Я обнаружил несколько сообщений с таймерами:\n\n".to_string();
    for (i, minutes) in items.iter().enumerate() {
        let earnings = (*minutes as f64 / 60.) * rate;
        text += &format!(
            "{}) {} ({})\n",
            i + 1,
            format_time(*minutes),
            format_money(earnings)
        );
    }
    text += &format!(
        "\nИтого: {} ({})",
        format_time(total_minutes),
        format_money(total_earnings)
    );
    text
}

pub fn quick_add_prompt(minutes: u32, earnings: f64) -> String {
    format!(
        "Вы хотите добавить: {}\nЗаработок: {}\n\nПодтвердите добавление:",
        format_time(minutes),
        format_money(earnings)
    )
}

pub fn time_added_message(minutes: u32, earnings: f64) -> String {
    format!(
        "✅\nВремя добавлено: {}\nЗаработано: {}",
        format_time(minutes),
        format_money(earnings)
    )
}

pub fn commit_failed_message(minutes: u32) -> String {
    format!(
        "Не удалось сохранить время ({}). Запись не добавлена, попробуйте снова.",
        format_time(minutes)
    )
}

pub const GREETING: &str = "Приветствую! Я бот для отслеживания рабочего времени и заработка.\n\n\
     Для начала, укажите свою почасовую ставку (например, 500₽):";

pub const SETUP_REQUIRED: &str = "Для учета времени необходимо сначала настроить ставку и цель \
     с помощью команды /start";

pub const PROFILE_MISSING: &str = "Не удалось получить данные пользователя. Используйте /start \
     для настройки.";

pub const HELP: &str = "Список доступных команд:\n\n\
     /start - Начать использование бота\n\
     /rate - Изменить почасовую ставку\n\
     /goal - Установить новую цель\n\
     /notify [hour/day/week/off] - Управление уведомлениями\n\
     /cancel - Отменить текущее действие\n\
     /help - Показать справку";

pub const MANUAL_TIME_HINT: &str = "Введите время в одном из форматов:\n\
     • 2ч 20м\n\
     • 140мин\n\
     • 2.33 (часы)";

pub const MANUAL_TIME_RETRY: &str = "Не удалось распознать формат времени. Попробуйте еще раз.\n\
     Примеры форматов:\n\
     • 2ч 20м\n\
     • 140мин\n\
     • 2.33 (часы)";

pub fn main_menu_keyboard() -> Keyboard {
    vec![
        vec![
            Button::new("Добавить время", callback::ADD_TIME),
            Button::new("Мой прогресс", callback::PROGRESS),
        ],
        vec![
            Button::new("История", callback::HISTORY),
            Button::new("Настройки", callback::SETTINGS),
        ],
    ]
}

pub fn add_time_keyboard() -> Keyboard {
    vec![
        vec![
            Button::new("15 мин", "time_15"),
            Button::new("30 мин", "time_30"),
        ],
        vec![
            Button::new("1 час", "time_60"),
            Button::new("2 часа", "time_120"),
        ],
        vec![Button::new("Ввести вручную", callback::TIME_MANUAL)],
        vec![Button::new("« Назад", callback::MAIN_MENU)],
    ]
}

pub fn confirm_keyboard(prompt_id: u64, confirm_label: &str, cancel_label: &str) -> Keyboard {
    vec![vec![
        Button::new(
            confirm_label,
            format!("{}{prompt_id}", callback::CONFIRM_PREFIX),
        ),
        Button::new(
            cancel_label,
            format!("{}{prompt_id}", callback::CANCEL_PREFIX),
        ),
    ]]
}

pub fn back_keyboard(target: &str) -> Keyboard {
    vec![vec![Button::new("« Назад", target)]]
}

pub fn settings_keyboard() -> Keyboard {
    vec![
        vec![
            Button::new("Изменить ставку", callback::CHANGE_RATE),
            Button::new("Изменить цель", callback::CHANGE_GOAL),
        ],
        vec![
            Button::new("Уведомления", callback::NOTIFICATIONS),
            Button::new("Сбросить прогресс", callback::RESET),
        ],
        vec![Button::new("« Назад", callback::MAIN_MENU)],
    ]
}

pub fn notifications_keyboard() -> Keyboard {
    vec![
        vec![
            Button::new("Каждый час", "notify_hour"),
            Button::new("Ежедневно", "notify_day"),
        ],
        vec![
            Button::new("Еженедельно", "notify_week"),
            Button::new("Отключить", "notify_off"),
        ],
        vec![Button::new("« Назад", callback::SETTINGS)],
    ]
}

pub fn reset_warning_keyboard() -> Keyboard {
    vec![vec![
        Button::new("Отмена", callback::SETTINGS),
        Button::new("Да, сбросить", callback::RESET_CONFIRM),
    ]]
}

pub fn after_reset_keyboard() -> Keyboard {
    vec![
        vec![Button::new(
            "Установить цель заработка",
            callback::CHANGE_GOAL,
        )],
        vec![Button::new("Вернуться в меню", callback::MAIN_MENU)],
    ]
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use crate::storage::entities::{ProgressSnapshot, TimeRecordEntity};

    use super::{
        batch_timer_prompt, format_money, format_time, history_line, progress_bar,
        progress_message,
    };

    #[test]
    fn test_format_time() {
        assert_eq!(format_time(45), "45м");
        assert_eq!(format_time(60), "1ч");
        assert_eq!(format_time(140), "2ч 20м");
    }

    #[test]
    fn test_format_money_rounds_to_whole() {
        assert_eq!(format_money(500.), "500₽");
        assert_eq!(format_money(749.6), "750₽");
    }

    #[test]
    fn test_progress_bar() {
        assert_eq!(progress_bar(0), "[○○○○○○○○○○] 0%");
        assert_eq!(progress_bar(34), "[●●●○○○○○○○] 34%");
        assert_eq!(progress_bar(100), "[●●●●●●●●●●] 100%");
    }

    #[test]
    fn test_progress_message() {
        let message = progress_message(&ProgressSnapshot {
            goal: 10000.,
            earned: 5000.,
            percent: 50,
            hours_left: 10.,
        });
        assert_eq!(
            message,
            "Цель: 10000₽ | Заработано: 5000₽\n[●●●●●○○○○○] 50%\nОсталось: 10.0 часов"
        );
    }

    #[test]
    fn test_batch_prompt_lists_items_in_order() {
        let text = batch_timer_prompt(&[30, 90, 15], 600.);
        assert!(text.contains("1) 30м (300₽)"));
        assert!(text.contains("2) 1ч 30м (900₽)"));
        assert!(text.contains("3) 15м (150₽)"));
        assert!(text.contains("Итого: 2ч 15м (1350₽)"));
    }

    #[test]
    fn test_history_line() {
        let record = TimeRecordEntity {
            minutes: 90,
            earnings: 750.,
            logged_at: Utc.with_ymd_and_hms(2024, 3, 5, 10, 30, 0).unwrap(),
        };
        let line = history_line(&record);
        assert!(line.contains("1ч 30м"));
        assert!(line.contains("750₽"));
    }
}
