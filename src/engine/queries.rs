use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::availability::check_slot;
use super::{Engine, SharedDay};

impl Engine {
    /// Read-only availability check for a candidate window on `date`.
    /// `exclude` skips a booking being edited.
    pub async fn check_availability(
        &self,
        date: NaiveDate,
        start: Option<Minutes>,
        end: Option<Minutes>,
        master: Option<&str>,
        exclude: Option<Ulid>,
    ) -> Availability {
        match self.existing_day(&date) {
            Some(day) => {
                let guard = day.read().await;
                check_slot(&guard.bookings, start, end, master, exclude)
            }
            None => check_slot(&[], start, end, master, exclude),
        }
    }

    pub async fn get_booking(&self, id: Ulid) -> Option<Booking> {
        let date = self.booking_date(&id)?;
        let day = self.existing_day(&date)?;
        let guard = day.read().await;
        guard.get(id).cloned()
    }

    /// Bookings of this tenant, optionally for one date, ordered by date
    /// then start time.
    pub async fn list_bookings(&self, date: Option<NaiveDate>) -> Vec<Booking> {
        match date {
            Some(date) => match self.existing_day(&date) {
                Some(day) => sorted(day.read().await.bookings.clone()),
                None => Vec::new(),
            },
            None => self.collect_where(|_| true).await,
        }
    }

    /// Bookings assigned to exactly this master name.
    pub async fn list_by_master(&self, master: &str) -> Vec<Booking> {
        self.collect_where(|b| b.master.as_deref() == Some(master)).await
    }

    /// Bookings whose phone digits end with `suffix`.
    pub async fn list_by_phone_suffix(&self, suffix: &str) -> Vec<Booking> {
        self.collect_where(|b| phone_digits(&b.client_phone).ends_with(suffix))
            .await
    }

    async fn collect_where(&self, keep: impl Fn(&Booking) -> bool) -> Vec<Booking> {
        // Snapshot the partitions first; DashMap refs must not live across awaits.
        let days: Vec<SharedDay> = self.days.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for day in days {
            let guard = day.read().await;
            out.extend(guard.bookings.iter().filter(|b| keep(b)).cloned());
        }
        sorted(out)
    }
}

fn sorted(mut bookings: Vec<Booking>) -> Vec<Booking> {
    bookings.sort_by_key(|b| (b.date, b.start_time));
    bookings
}
