mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use availability::{check_slot, find_conflict};
pub use error::EngineError;
pub(crate) use conflict::{today, validate_window};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedDay = Arc<RwLock<DaySchedule>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first append, drains whatever else is already queued,
/// then pays for a single fsync on behalf of the whole batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_other(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, &mut batch);
        if let Some(other) = deferred {
            handle_other(&mut wal, other);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for {} events: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let append_err = batch
        .iter()
        .find_map(|(event, _)| wal.append_buffered(event).err());
    // Flush even after an append error so half-written bytes don't leak into
    // the next batch.
    let flush_err = wal.flush_sync().err();
    match append_err.or(flush_err) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn handle_other(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Append { event, response } => commit_batch(wal, &mut vec![(event, response)]),
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
    }
}

/// Booking store for a single tenant.
///
/// Bookings are partitioned by date; each day sits behind its own lock, and
/// every write holds that lock across conflict check, WAL append and apply.
pub struct Engine {
    tenant: String,
    pub(super) days: DashMap<NaiveDate, SharedDay>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Reverse lookup: booking id → date partition.
    pub(super) booking_days: DashMap<Ulid, NaiveDate>,
    /// Writers share it; compaction takes it exclusively to snapshot a
    /// state that matches the log.
    pub(super) write_gate: RwLock<()>,
}

/// Apply an event to one day. The caller holds the day's lock.
/// A cross-date update is applied to both days: removed from the old one,
/// inserted into the new one.
fn apply_to_day(day: &mut DaySchedule, event: &Event, index: &DashMap<Ulid, NaiveDate>) {
    match event {
        Event::BookingCreated { booking } => {
            day.upsert(booking.clone());
            index.insert(booking.id, booking.date);
        }
        Event::BookingUpdated { booking, .. } => {
            if booking.date == day.date {
                day.upsert(booking.clone());
                index.insert(booking.id, booking.date);
            } else {
                day.remove(booking.id);
            }
        }
        Event::BookingDeleted { id, .. } => {
            day.remove(*id);
            index.remove(id);
        }
        Event::BookingsImported { bookings } => {
            let date = day.date;
            for booking in bookings.iter().filter(|b| b.date == date) {
                day.upsert(booking.clone());
                index.insert(booking.id, booking.date);
            }
        }
    }
}

/// Dates an event touches.
fn event_dates(event: &Event) -> Vec<NaiveDate> {
    match event {
        Event::BookingCreated { booking } => vec![booking.date],
        Event::BookingUpdated { booking, previous_date } if *previous_date != booking.date => {
            vec![*previous_date, booking.date]
        }
        Event::BookingUpdated { booking, .. } => vec![booking.date],
        Event::BookingDeleted { date, .. } => vec![*date],
        Event::BookingsImported { bookings } => {
            let mut dates: Vec<NaiveDate> = bookings.iter().map(|b| b.date).collect();
            dates.sort_unstable();
            dates.dedup();
            dates
        }
    }
}

impl Engine {
    pub fn new(tenant: &str, wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            tenant: tenant.to_string(),
            days: DashMap::new(),
            wal_tx,
            booking_days: DashMap::new(),
            write_gate: RwLock::new(()),
        };

        // Sole owner of every lock here, so try_write never contends. Blocking
        // lock calls are off limits: replay can run inside the async runtime.
        for event in &events {
            for date in event_dates(event) {
                let day = engine.day(date);
                let mut guard = day
                    .try_write()
                    .map_err(|_| io::Error::other("replay: day partition locked"))?;
                apply_to_day(&mut guard, event, &engine.booking_days);
            }
        }
        tracing::debug!(tenant, events = events.len(), "replayed booking log");

        Ok(engine)
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn booking_count(&self) -> usize {
        self.booking_days.len()
    }

    pub fn contains_booking(&self, id: &Ulid) -> bool {
        self.booking_days.contains_key(id)
    }

    pub fn booking_date(&self, id: &Ulid) -> Option<NaiveDate> {
        self.booking_days.get(id).map(|e| *e.value())
    }

    /// Day partition, created empty on first use.
    pub(super) fn day(&self, date: NaiveDate) -> SharedDay {
        self.days
            .entry(date)
            .or_insert_with(|| Arc::new(RwLock::new(DaySchedule::new(date))))
            .value()
            .clone()
    }

    pub(super) fn existing_day(&self, date: &NaiveDate) -> Option<SharedDay> {
        self.days.get(date).map(|e| e.value().clone())
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append then apply, under the caller's day lock.
    pub(super) async fn persist_and_apply(
        &self,
        day: &mut DaySchedule,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_day(day, event, &self.booking_days);
        Ok(())
    }

    /// Lookup booking → date, take the day's write lock, and confirm the
    /// booking is still there once the lock is held. A booking moved to
    /// another date while we waited is followed to its new day.
    pub(super) async fn resolve_booking_write(
        &self,
        id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<DaySchedule>, EngineError> {
        loop {
            let date = self.booking_date(id).ok_or(EngineError::NotFound(*id))?;
            let guard = self.day(date).write_owned().await;
            if guard.get(*id).is_some() {
                return Ok(guard);
            }
            if self.booking_date(id) == Some(date) {
                return Err(EngineError::NotFound(*id));
            }
        }
    }
}
