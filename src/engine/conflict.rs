use chrono::{Local, NaiveDate, Utc};
use ulid::Ulid;

use crate::model::*;

use super::availability::find_conflict;
use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    Utc::now().timestamp_millis()
}

/// Server-local calendar date; past-date rules compare against this.
pub(crate) fn today() -> NaiveDate {
    Local::now().date_naive()
}

/// Build a slot from raw bounds, enforcing `start < end <= 24:00`.
pub(crate) fn validate_window(start: Minutes, end: Minutes) -> Result<Slot, EngineError> {
    if start >= end {
        return Err(EngineError::validation("start time must be before end time"));
    }
    if end > MINUTES_PER_DAY {
        return Err(EngineError::validation("booking must end by 24:00"));
    }
    Ok(Slot::new(start, end))
}

/// Write-path guard. Runs with the day's write lock held, so no other writer
/// can slip a booking in between this check and the append that follows.
pub(crate) fn check_no_conflict(
    day: &DaySchedule,
    slot: &Slot,
    master: Option<&str>,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match find_conflict(&day.bookings, slot, master, exclude) {
        Some(existing) => {
            tracing::debug!(
                date = %day.date,
                holder = %existing.id,
                "slot {}-{} rejected under lock",
                format_hhmm(slot.start),
                format_hhmm(slot.end)
            );
            Err(EngineError::Conflict(existing.summary()))
        }
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_must_be_ordered() {
        assert!(matches!(validate_window(600, 600), Err(EngineError::Validation(_))));
        assert!(matches!(validate_window(660, 600), Err(EngineError::Validation(_))));
        assert_eq!(validate_window(540, 600).unwrap(), Slot::new(540, 600));
    }

    #[test]
    fn window_must_end_by_midnight() {
        assert!(validate_window(1400, MINUTES_PER_DAY).is_ok());
        assert!(matches!(
            validate_window(1400, MINUTES_PER_DAY + 20),
            Err(EngineError::Validation(_))
        ));
    }
}
