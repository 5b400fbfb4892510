use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Used for creation timestamps only.
pub type Ms = i64;

/// Minutes since midnight. The only time-of-day type.
pub type Minutes = u16;

pub const MINUTES_PER_DAY: Minutes = 24 * 60;

/// Length of a new booking when the caller gives no end time.
pub const DEFAULT_DURATION_MINUTES: Minutes = 60;

/// Length assumed for stored bookings that carry no end time.
pub const LEGACY_DURATION_MINUTES: Minutes = 30;

// ── Time of day ─────────────────────────────────────────────────

/// Parse `HH:MM` or `HH:MM:SS` into minutes since midnight. Seconds are
/// truncated. `24:00` is accepted as the end of the day.
pub fn parse_hhmm(text: &str) -> Option<Minutes> {
    let mut parts = text.trim().split(':');
    let hours = parts.next().and_then(two_digits)?;
    let minutes = parts.next().and_then(two_digits)?;
    let seconds = match parts.next() {
        Some(s) => Some(two_digits(s)?),
        None => None,
    };
    if parts.next().is_some() {
        return None;
    }

    if hours == 24 && minutes == 0 && seconds.unwrap_or(0) == 0 {
        return Some(MINUTES_PER_DAY);
    }
    if hours >= 24 || minutes >= 60 || seconds.is_some_and(|s| s >= 60) {
        return None;
    }
    Some(hours * 60 + minutes)
}

fn two_digits(part: &str) -> Option<Minutes> {
    if part.is_empty() || part.len() > 2 || !part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    part.parse().ok()
}

pub fn format_hhmm(minutes: Minutes) -> String {
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

pub fn derive_end(start: Minutes, duration: Minutes) -> Minutes {
    start.saturating_add(duration)
}

/// Half-open overlap test: `[start_a, end_a)` against `[start_b, end_b)`.
pub fn overlaps(start_a: Minutes, end_a: Minutes, start_b: Minutes, end_b: Minutes) -> bool {
    start_a < end_b && end_a > start_b
}

/// Half-open interval `[start, end)` within one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub start: Minutes,
    pub end: Minutes,
}

impl Slot {
    pub fn new(start: Minutes, end: Minutes) -> Self {
        debug_assert!(start < end, "Slot start must be before end");
        Self { start, end }
    }

    pub fn duration(&self) -> Minutes {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Slot) -> bool {
        overlaps(self.start, self.end, other.start, other.end)
    }
}

/// Trim a master name; blank means unassigned.
pub fn normalize_master(master: Option<&str>) -> Option<String> {
    master
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
}

/// Digits of a phone number with all formatting removed.
pub fn phone_digits(phone: &str) -> String {
    phone.chars().filter(char::is_ascii_digit).collect()
}

// ── Bookings ────────────────────────────────────────────────────

/// A client appointment. The only persisted entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub tenant_id: String,
    pub client_name: String,
    pub client_phone: String,
    pub service_name: String,
    pub master: Option<String>,
    pub date: NaiveDate,
    pub start_time: Minutes,
    /// `None` only on records imported from before end times were stored.
    pub end_time: Option<Minutes>,
    pub comment: String,
    pub created_at: Ms,
}

impl Booking {
    pub fn effective_end(&self) -> Minutes {
        self.end_time
            .unwrap_or_else(|| derive_end(self.start_time, LEGACY_DURATION_MINUTES))
    }

    pub fn slot(&self) -> Slot {
        Slot::new(self.start_time, self.effective_end())
    }

    /// Whether a candidate for `master` competes with this booking for time.
    /// A candidate without a master competes with everything; a named one
    /// competes with unassigned bookings and its own.
    pub fn competes_with(&self, master: Option<&str>) -> bool {
        match master {
            None => true,
            Some(m) => self.master.as_deref().is_none_or(|own| own == m),
        }
    }

    pub fn summary(&self) -> BookingSummary {
        BookingSummary {
            id: self.id,
            name: self.client_name.clone(),
            time: format_hhmm(self.start_time),
            end_time: format_hhmm(self.effective_end()),
            master: self.master.clone(),
        }
    }
}

/// What a conflict reports back about the booking already holding the slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingSummary {
    pub id: Ulid,
    pub name: String,
    pub time: String,
    pub end_time: String,
    pub master: Option<String>,
}

/// Validated fields for a new booking; the store assigns id and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingDraft {
    pub client_name: String,
    pub client_phone: String,
    pub service_name: String,
    pub master: Option<String>,
    pub date: NaiveDate,
    pub slot: Slot,
    pub comment: String,
}

// ── Request payloads ────────────────────────────────────────────

/// Raw create request. Dates and times arrive as text and are validated by
/// the booking service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewBooking {
    pub client_name: String,
    pub client_phone: String,
    pub service_name: String,
    pub master: Option<String>,
    pub date: String,
    pub start_time: String,
    pub end_time: Option<String>,
    pub comment: Option<String>,
}

/// Partial update. `None` leaves the stored value untouched; a blank
/// `master` clears the assignment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingPatch {
    pub client_name: Option<String>,
    pub client_phone: Option<String>,
    pub service_name: Option<String>,
    pub master: Option<String>,
    pub date: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub comment: Option<String>,
}

impl BookingPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AvailabilityQuery {
    pub date: String,
    pub start_time: String,
    pub end_time: Option<String>,
    pub master: Option<String>,
    pub exclude_id: Option<Ulid>,
}

/// Result of an availability check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Availability {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict: Option<BookingSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Availability {
    pub fn free() -> Self {
        Self { available: true, conflict: None, error: None }
    }

    pub fn taken(conflict: BookingSummary) -> Self {
        Self { available: false, conflict: Some(conflict), error: None }
    }

    pub fn invalid(reason: &str) -> Self {
        Self { available: false, conflict: None, error: Some(reason.to_string()) }
    }
}

// ── Day partition ───────────────────────────────────────────────

/// All bookings of one tenant on one date, in insertion order.
#[derive(Debug, Clone)]
pub struct DaySchedule {
    pub date: NaiveDate,
    pub bookings: Vec<Booking>,
}

impl DaySchedule {
    pub fn new(date: NaiveDate) -> Self {
        Self { date, bookings: Vec::new() }
    }

    pub fn get(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    /// Replace a booking in place, keeping its position; append if absent.
    pub fn upsert(&mut self, booking: Booking) {
        match self.bookings.iter_mut().find(|b| b.id == booking.id) {
            Some(slot) => *slot = booking,
            None => self.bookings.push(booking),
        }
    }

    pub fn remove(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }
}

/// WAL record. Flat, one variant per mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BookingCreated {
        booking: Booking,
    },
    BookingUpdated {
        booking: Booking,
        previous_date: NaiveDate,
    },
    BookingDeleted {
        id: Ulid,
        date: NaiveDate,
    },
    /// A whole import batch in one frame, so a torn write drops all of it.
    BookingsImported {
        bookings: Vec<Booking>,
    },
}
