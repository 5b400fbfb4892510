use std::collections::{BTreeMap, HashSet};

use chrono::NaiveDate;
use tokio::sync::oneshot;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, now_ms};
use super::{apply_to_day, Engine, EngineError, WalCommand};

impl Engine {
    /// Store a new booking. The conflict check and the append happen under
    /// the same day lock, so two racing inserts for one slot cannot both land.
    pub async fn insert_booking(&self, draft: BookingDraft) -> Result<Booking, EngineError> {
        let _gate = self.write_gate.read().await;
        let day = self.day(draft.date);
        let mut guard = day.write().await;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_DAY {
            return Err(EngineError::LimitExceeded("too many bookings on this date"));
        }

        check_no_conflict(&guard, &draft.slot, draft.master.as_deref(), None)?;

        let booking = Booking {
            id: Ulid::new(),
            tenant_id: self.tenant().to_string(),
            client_name: draft.client_name,
            client_phone: draft.client_phone,
            service_name: draft.service_name,
            master: draft.master,
            date: draft.date,
            start_time: draft.slot.start,
            end_time: Some(draft.slot.end),
            comment: draft.comment,
            created_at: now_ms(),
        };
        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(booking)
    }

    /// Edit a stored booking in place. `edit` receives the record as it is
    /// under the day lock and returns the replacement plus whether its
    /// window must be re-checked (excluding itself). Moving to another date
    /// always rechecks. If the booking changes while both days are being
    /// locked for a move, `edit` runs again on the fresh record.
    pub async fn update_booking<F>(&self, id: Ulid, edit: F) -> Result<Booking, EngineError>
    where
        F: Fn(&Booking) -> Result<(Booking, bool), EngineError>,
    {
        let _gate = self.write_gate.read().await;
        loop {
            let mut guard = self.resolve_booking_write(&id).await?;
            let stored = guard.get(id).cloned().ok_or(EngineError::NotFound(id))?;
            let (mut updated, recheck) = edit(&stored)?;
            updated.id = id;
            updated.tenant_id = stored.tenant_id.clone();

            if updated.date == stored.date {
                if recheck {
                    check_no_conflict(&guard, &updated.slot(), updated.master.as_deref(), Some(id))?;
                }
                let event = Event::BookingUpdated {
                    booking: updated.clone(),
                    previous_date: stored.date,
                };
                self.persist_and_apply(&mut guard, &event).await?;
                return Ok(updated);
            }

            drop(guard);
            if let Some(saved) = self.move_booking(&stored, updated).await? {
                return Ok(saved);
            }
        }
    }

    /// Move `expected` to `updated.date`. Returns `None` when the stored
    /// record no longer matches `expected` once both days are locked.
    async fn move_booking(
        &self,
        expected: &Booking,
        updated: Booking,
    ) -> Result<Option<Booking>, EngineError> {
        let id = expected.id;
        let previous_date = expected.date;
        // Two partitions: lock in date order so opposite moves can't deadlock.
        let moving_forward = previous_date < updated.date;
        let (first, second) = if moving_forward {
            (previous_date, updated.date)
        } else {
            (updated.date, previous_date)
        };
        let first_day = self.day(first);
        let second_day = self.day(second);
        let mut first_guard = first_day.write().await;
        let mut second_guard = second_day.write().await;
        let (old_day, new_day) = if moving_forward {
            (&mut *first_guard, &mut *second_guard)
        } else {
            (&mut *second_guard, &mut *first_guard)
        };

        if old_day.get(id) != Some(expected) {
            return Ok(None);
        }
        if new_day.bookings.len() >= MAX_BOOKINGS_PER_DAY {
            return Err(EngineError::LimitExceeded("too many bookings on this date"));
        }
        check_no_conflict(new_day, &updated.slot(), updated.master.as_deref(), Some(id))?;

        let event = Event::BookingUpdated {
            booking: updated.clone(),
            previous_date,
        };
        self.wal_append(&event).await?;
        apply_to_day(old_day, &event, &self.booking_days);
        apply_to_day(new_day, &event, &self.booking_days);
        Ok(Some(updated))
    }

    /// Remove a booking unconditionally. Returns the removed record.
    pub async fn delete_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let _gate = self.write_gate.read().await;
        let mut guard = self.resolve_booking_write(&id).await?;
        let removed = guard.get(id).cloned().ok_or(EngineError::NotFound(id))?;
        let event = Event::BookingDeleted {
            id,
            date: removed.date,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(removed)
    }

    /// Restore existing records verbatim, e.g. when migrating from an older
    /// store. No availability checks run and legacy records may lack an end
    /// time. All-or-nothing: the batch is one WAL entry, applied only after
    /// it is durable, and one bad record rejects it.
    pub async fn import_bookings(&self, bookings: Vec<Booking>) -> Result<usize, EngineError> {
        if bookings.is_empty() {
            return Ok(0);
        }
        if bookings.len() > MAX_IMPORT_BATCH {
            return Err(EngineError::LimitExceeded("import batch too large"));
        }

        let mut seen = HashSet::new();
        for b in &bookings {
            if b.tenant_id != self.tenant() {
                return Err(EngineError::validation(format!(
                    "booking {} belongs to tenant {}",
                    b.id, b.tenant_id
                )));
            }
            if !seen.insert(b.id) || self.contains_booking(&b.id) {
                return Err(EngineError::validation(format!("duplicate booking id {}", b.id)));
            }
            if b.start_time >= b.effective_end() {
                return Err(EngineError::validation(format!(
                    "booking {} ends before it starts",
                    b.id
                )));
            }
        }

        let _gate = self.write_gate.read().await;
        // BTreeMap keeps lock acquisition in ascending date order.
        let mut per_date: BTreeMap<NaiveDate, usize> = BTreeMap::new();
        for b in &bookings {
            *per_date.entry(b.date).or_default() += 1;
        }

        let mut guards = Vec::with_capacity(per_date.len());
        for (date, incoming) in &per_date {
            let guard = self.day(*date).write_owned().await;
            if guard.bookings.len() + incoming > MAX_BOOKINGS_PER_DAY {
                return Err(EngineError::LimitExceeded("too many bookings on this date"));
            }
            guards.push(guard);
        }
        // A racing import of the same rows may have landed before the locks.
        if let Some(b) = bookings.iter().find(|b| self.contains_booking(&b.id)) {
            return Err(EngineError::validation(format!("duplicate booking id {}", b.id)));
        }

        let count = bookings.len();
        let event = Event::BookingsImported { bookings };
        self.wal_append(&event).await?;
        for guard in guards.iter_mut() {
            apply_to_day(guard, &event, &self.booking_days);
        }
        Ok(count)
    }

    /// Rewrite the WAL with one `BookingCreated` per live booking.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.write_gate.write().await;

        let mut days: Vec<_> = self
            .days
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        days.sort_by_key(|(date, _)| *date);

        let mut events = Vec::with_capacity(self.booking_count());
        let mut empty = Vec::new();
        for (date, day) in days {
            let guard = day.read().await;
            if guard.bookings.is_empty() {
                empty.push(date);
            }
            events.extend(guard.bookings.iter().map(|b| Event::BookingCreated {
                booking: b.clone(),
            }));
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;

        // No writer can be inside these partitions while the gate is held.
        for date in empty {
            self.days.remove_if(&date, |_, day| {
                day.try_read().is_ok_and(|d| d.bookings.is_empty())
            });
        }
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
