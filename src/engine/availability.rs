use ulid::Ulid;

use crate::model::*;

// ── Availability Algorithm ────────────────────────────────────────

/// First booking a candidate `slot` for `master` collides with.
///
/// Bookings are scanned in insertion order, so for a fixed day the reported
/// conflict is deterministic. `exclude` is skipped, letting an edit be checked
/// without tripping over its own current slot.
///
/// Master rule: a named candidate only competes with unassigned bookings and
/// bookings for the same name (exact, case-sensitive). An unassigned candidate
/// claims "any master" and must avoid every booking.
pub fn find_conflict<'a>(
    bookings: &'a [Booking],
    slot: &Slot,
    master: Option<&str>,
    exclude: Option<Ulid>,
) -> Option<&'a Booking> {
    bookings
        .iter()
        .filter(|b| Some(b.id) != exclude)
        .filter(|b| b.competes_with(master))
        .find(|b| b.slot().overlaps(slot))
}

/// Availability verdict for a candidate window. Bounds that failed to parse
/// arrive as `None` and are reported in the result rather than raised.
pub fn check_slot(
    bookings: &[Booking],
    start: Option<Minutes>,
    end: Option<Minutes>,
    master: Option<&str>,
    exclude: Option<Ulid>,
) -> Availability {
    let (Some(start), Some(end)) = (start, end) else {
        return Availability::invalid("invalid time format");
    };
    if start >= end {
        return Availability::invalid("start time must be before end time");
    }
    if end > MINUTES_PER_DAY {
        return Availability::invalid("booking must end by 24:00");
    }
    match find_conflict(bookings, &Slot::new(start, end), master, exclude) {
        Some(existing) => Availability::taken(existing.summary()),
        None => Availability::free(),
    }
}
