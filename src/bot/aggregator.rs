//! State transitions for collecting forwarded timer messages into a single
//! confirmation. The dispatcher feeds parsed durations in here and turns the returned
//! instructions into messages and debounce timers.

use tokio_util::sync::CancellationToken;

use super::session::{Phase, Session};

/// What the dispatcher should do after a parsed timer duration arrived.
#[derive(Debug)]
pub enum TimerArrival {
    /// The user is not forwarding a batch, confirm this one duration right away.
    PromptNow,
    /// The duration joined the batch. The debounce timer must be restarted with this
    /// generation and cancellation token.
    Buffered {
        generation: u64,
        cancel: CancellationToken,
    },
}

/// Feeds one parsed duration into the session. In grouping mode the duration is
/// appended to the active batch (starting one if needed) and the previous debounce
/// timer is cancelled, so only the latest timer can ever fire for this batch.
pub fn note_timer(session: &mut Session, minutes: u32, grouping: bool) -> TimerArrival {
    if !grouping {
        return TimerArrival::PromptNow;
    }

    session.debounce_seq += 1;
    let next_generation = session.debounce_seq;
    let fresh = CancellationToken::new();

    match &mut session.phase {
        Phase::Collecting {
            batch,
            generation,
            cancel,
        } => {
            batch.push(minutes);
            cancel.cancel();
            *cancel = fresh.clone();
            *generation = next_generation;
        }
        Phase::Idle => {
            session.phase = Phase::Collecting {
                batch: vec![minutes],
                generation: next_generation,
                cancel: fresh.clone(),
            };
        }
    }

    TimerArrival::Buffered {
        generation: next_generation,
        cancel: fresh,
    }
}

/// Takes the batch out of the session if `generation` still refers to it. A stale
/// debounce callback, fired for a batch that was since superseded or flushed, gets
/// [None] and must do nothing.
pub fn take_batch(session: &mut Session, generation: u64) -> Option<Vec<u32>> {
    match &session.phase {
        Phase::Collecting {
            generation: current,
            ..
        } if *current == generation => {
            let Phase::Collecting { batch, .. } =
                std::mem::replace(&mut session.phase, Phase::Idle)
            else {
                unreachable!()
            };
            Some(batch)
        }
        _ => None,
    }
}

/// Drops a still-collecting batch, cancelling its debounce timer. Returns whether
/// there was anything to drop.
pub fn abort_collecting(session: &mut Session) -> bool {
    match std::mem::replace(&mut session.phase, Phase::Idle) {
        Phase::Collecting { cancel, .. } => {
            cancel.cancel();
            true
        }
        Phase::Idle => false,
    }
}

#[cfg(test)]
mod tests {
    use crate::bot::session::{Phase, Session};

    use super::{abort_collecting, note_timer, take_batch, TimerArrival};

    fn buffered_generation(arrival: TimerArrival) -> u64 {
        match arrival {
            TimerArrival::Buffered { generation, .. } => generation,
            TimerArrival::PromptNow => panic!("expected the duration to be buffered"),
        }
    }

    #[test]
    fn test_non_grouping_is_not_buffered() {
        let mut session = Session::new(1);
        assert!(matches!(
            note_timer(&mut session, 30, false),
            TimerArrival::PromptNow
        ));
        assert!(matches!(session.phase, Phase::Idle));
    }

    #[test]
    fn test_batch_keeps_arrival_order() {
        let mut session = Session::new(1);
        note_timer(&mut session, 30, true);
        note_timer(&mut session, 90, true);
        let generation = buffered_generation(note_timer(&mut session, 15, true));

        let batch = take_batch(&mut session, generation).unwrap();
        assert_eq!(batch, vec![30, 90, 15]);
        assert!(matches!(session.phase, Phase::Idle));
    }

    #[test]
    fn test_new_arrival_cancels_previous_debounce() {
        let mut session = Session::new(1);
        let TimerArrival::Buffered { cancel: first, .. } = note_timer(&mut session, 30, true)
        else {
            panic!("expected the duration to be buffered");
        };
        assert!(!first.is_cancelled());

        note_timer(&mut session, 45, true);
        assert!(first.is_cancelled());
    }

    #[test]
    fn test_stale_generation_finds_nothing() {
        let mut session = Session::new(1);
        let stale = buffered_generation(note_timer(&mut session, 30, true));
        let current = buffered_generation(note_timer(&mut session, 45, true));

        assert!(take_batch(&mut session, stale).is_none());
        // The stale callback must not have consumed the batch.
        assert_eq!(take_batch(&mut session, current).unwrap(), vec![30, 45]);
        assert!(take_batch(&mut session, current).is_none());
    }

    #[test]
    fn test_abort_cancels_timer_and_clears_batch() {
        let mut session = Session::new(1);
        let TimerArrival::Buffered {
            generation, cancel, ..
        } = note_timer(&mut session, 30, true)
        else {
            panic!("expected the duration to be buffered");
        };

        assert!(abort_collecting(&mut session));
        assert!(cancel.is_cancelled());
        assert!(take_batch(&mut session, generation).is_none());
        assert!(!abort_collecting(&mut session));
    }
}
