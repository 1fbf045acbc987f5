//! Turns free-form duration text and "timer stopped" notifications into minute counts.
//! Anything that doesn't match comes back as [None] and the caller decides what to do,
//! usually by asking the user to re-enter the value.

use std::sync::OnceLock;

use regex::Regex;

/// Upper bound on a single logged chunk of time, 24 hours.
pub const MAX_MINUTES: u32 = 24 * 60;

fn hours_token() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+)ч").expect("valid hours token regex"))
}

fn minutes_token() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+)м").expect("valid minutes token regex"))
}

fn decimal_hours() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d+\.\d+$").expect("valid decimal hours regex"))
}

fn elapsed_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"Затрачено\s+(\d{2}):(\d{2}):(\d{2})").expect("valid elapsed marker regex")
    })
}

fn clock_triplet() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d{2}):(\d{2}):(\d{2})").expect("valid clock triplet regex"))
}

/// Parses manually entered durations. Supported forms, checked in order:
///  - "2ч 20м" with either unit optional
///  - "140мин" (covered by the "м" token)
///  - "2.33" meaning hours, truncated towards zero after conversion
///  - "45" meaning minutes
pub fn parse_free_text(input: &str) -> Option<u32> {
    let input = input.trim();

    let hours = hours_token().captures(input);
    let minutes = minutes_token().captures(input);
    if hours.is_some() || minutes.is_some() {
        let mut total = 0u32;
        if let Some(hours) = hours {
            total = hours[1].parse::<u32>().ok()?.checked_mul(60)?;
        }
        if let Some(minutes) = minutes {
            total = total.checked_add(minutes[1].parse::<u32>().ok()?)?;
        }
        return Some(total);
    }

    if decimal_hours().is_match(input) {
        let hours = input.parse::<f64>().ok()?;
        return Some((hours * 60.) as u32);
    }

    if !input.is_empty() && input.bytes().all(|b| b.is_ascii_digit()) {
        return input.parse::<u32>().ok();
    }

    None
}

/// Extracts elapsed time from a timer-stop notification.
///
/// The marker phrase followed by HH:MM:SS is preferred. When the message was reworded
/// by the timer tool the whole text is scanned for the first plausible HH:MM:SS
/// substring instead. Seconds are rounded to the nearest minute, halves up.
pub fn parse_timer_notification(text: &str) -> Option<u32> {
    if let Some(capture) = elapsed_marker().captures(text) {
        let hours = capture[1].parse::<u32>().ok()?;
        let minutes = capture[2].parse::<u32>().ok()?;
        let seconds = capture[3].parse::<u32>().ok()?;
        return checked_total(hours, minutes, seconds);
    }

    for capture in clock_triplet().captures_iter(text) {
        let hours = capture[1].parse::<u32>().ok()?;
        let minutes = capture[2].parse::<u32>().ok()?;
        let seconds = capture[3].parse::<u32>().ok()?;
        if hours < 24 && minutes < 60 && seconds < 60 {
            if let Some(total) = checked_total(hours, minutes, seconds) {
                return Some(total);
            }
        }
    }

    None
}

/// Checks whether a message is a timer-stop notification at all. Run this before
/// [parse_timer_notification], which only cares about extracting the time.
pub fn is_timer_notification(text: &str) -> bool {
    let lowered = text.to_lowercase();
    lowered.contains("таймер остановлен") && lowered.contains("затрачено")
}

fn checked_total(hours: u32, minutes: u32, seconds: u32) -> Option<u32> {
    let mut total = hours * 60 + minutes;
    if seconds >= 30 {
        total += 1;
    }

    // Guards against corrupted messages and unrelated HH:MM:SS-shaped matches.
    if total > 0 && total <= MAX_MINUTES {
        Some(total)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::{is_timer_notification, parse_free_text, parse_timer_notification};

    #[test]
    fn test_free_text_unit_tokens() {
        assert_eq!(parse_free_text("2ч 20м"), Some(140));
        assert_eq!(parse_free_text("20м 2ч"), Some(140));
        assert_eq!(parse_free_text("2ч"), Some(120));
        assert_eq!(parse_free_text("20м"), Some(20));
        assert_eq!(parse_free_text("140мин"), Some(140));
    }

    #[test]
    fn test_free_text_decimal_hours_truncate() {
        assert_eq!(parse_free_text("2.33"), Some(139));
        assert_eq!(parse_free_text("0.5"), Some(30));
    }

    #[test]
    fn test_free_text_bare_integer_is_minutes() {
        assert_eq!(parse_free_text("45"), Some(45));
        assert_eq!(parse_free_text(" 45 "), Some(45));
    }

    #[test]
    fn test_free_text_rejects_garbage() {
        assert_eq!(parse_free_text("abc"), None);
        assert_eq!(parse_free_text(""), None);
        assert_eq!(parse_free_text("2h 20m"), None);
    }

    #[test]
    fn test_free_text_rejects_overflowing_amounts() {
        assert_eq!(parse_free_text("100000000ч"), None);
        assert_eq!(parse_free_text("100000000ч 5м"), None);
        assert_eq!(parse_free_text("4294967295м 1ч"), None);
    }

    #[test]
    fn test_timer_rounding_on_seconds() {
        assert_eq!(
            parse_timer_notification("🛑 Таймер остановлен. Затрачено 01:29:30"),
            Some(90)
        );
        assert_eq!(
            parse_timer_notification("🛑 Таймер остановлен. Затрачено 01:29:29"),
            Some(89)
        );
    }

    #[test]
    fn test_timer_fallback_scan() {
        assert_eq!(
            parse_timer_notification("таймер остановлен, прошло 00:45:10, отдохните"),
            Some(45)
        );
    }

    #[test]
    fn test_timer_rejects_out_of_range() {
        // Computes to zero minutes.
        assert_eq!(parse_timer_notification("Затрачено 00:00:14"), None);
        // Over 24 hours through the marker path.
        assert_eq!(parse_timer_notification("Затрачено 25:00:00"), None);
        // The fallback scan rejects impossible wall-clock components.
        assert_eq!(parse_timer_notification("версия 99:99:99"), None);
    }

    #[test]
    fn test_timer_fallback_skips_gated_match() {
        // The first triplet computes to zero, the second one is the real value.
        assert_eq!(
            parse_timer_notification("сессия 00:00:02, всего 01:10:00"),
            Some(70)
        );
    }

    #[test]
    fn test_notification_precheck() {
        assert!(is_timer_notification(
            "🛑 Таймер остановлен. Затрачено 01:00:00"
        ));
        assert!(!is_timer_notification("Затрачено 01:00:00"));
        assert!(!is_timer_notification("просто сообщение"));
    }
}
