use std::io;
use std::sync::Arc;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::directory::TenantDirectory;
use crate::engine::{today, validate_window, Engine, EngineError};
use crate::limits::*;
use crate::model::*;
use crate::tenant::TenantManager;

/// Request-facing booking operations: validation, tenant resolution and
/// ownership checks in front of the per-tenant engines.
pub struct BookingService {
    tenants: Arc<TenantManager>,
    directory: Arc<dyn TenantDirectory>,
}

impl BookingService {
    pub fn new(tenants: Arc<TenantManager>, directory: Arc<dyn TenantDirectory>) -> Self {
        Self { tenants, directory }
    }

    pub fn tenants(&self) -> &Arc<TenantManager> {
        &self.tenants
    }

    pub async fn create_booking(
        &self,
        tenant: &str,
        input: NewBooking,
    ) -> Result<Booking, EngineError> {
        let draft = validate_new(&input, today())?;
        let engine = self.engine_for(tenant).await?;

        // Fast path; the engine repeats this check under the day lock.
        let verdict = engine
            .check_availability(
                draft.date,
                Some(draft.slot.start),
                Some(draft.slot.end),
                draft.master.as_deref(),
                None,
            )
            .await;
        if let Some(summary) = verdict.conflict {
            return Err(conflict(summary));
        }

        let booking = engine
            .insert_booking(draft)
            .await
            .map_err(surface("create_booking", tenant, None))?;
        tracing::info!(
            tenant,
            id = %booking.id,
            date = %booking.date,
            "booked {}-{}",
            format_hhmm(booking.start_time),
            format_hhmm(booking.effective_end())
        );
        Ok(booking)
    }

    /// Read-only check. Unparseable times come back as `available: false`
    /// with an error message; an unparseable date is a validation error.
    pub async fn check_availability(
        &self,
        tenant: &str,
        query: AvailabilityQuery,
    ) -> Result<Availability, EngineError> {
        let date = parse_date(&query.date)?;
        let start = parse_hhmm(&query.start_time);
        let end = match query.end_time.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => parse_hhmm(text),
            _ => start.map(|s| derive_end(s, DEFAULT_DURATION_MINUTES)),
        };
        let master = normalize_master(query.master.as_deref());

        let engine = self.engine_for(tenant).await?;
        Ok(engine
            .check_availability(date, start, end, master.as_deref(), query.exclude_id)
            .await)
    }

    /// Apply the supplied fields. The slot is re-checked only when date,
    /// window or master actually change. The merge that gets stored runs
    /// inside the engine against the record under the day lock, so a
    /// concurrent edit is never overwritten with stale fields.
    pub async fn update_booking(
        &self,
        id: Ulid,
        caller: &str,
        patch: BookingPatch,
    ) -> Result<Booking, EngineError> {
        let (engine, current) = self.owned_booking(id, caller).await?;
        if patch.is_empty() {
            return Ok(current);
        }

        // Fast path on a snapshot; the engine repeats merge and check.
        let today = today();
        let (preview, window_changed) = merge_patch(&current, &patch, today)?;
        if window_changed {
            let verdict = engine
                .check_availability(
                    preview.date,
                    Some(preview.start_time),
                    Some(preview.effective_end()),
                    preview.master.as_deref(),
                    Some(id),
                )
                .await;
            if let Some(summary) = verdict.conflict {
                return Err(conflict(summary));
            }
        }

        let saved = engine
            .update_booking(id, |stored| merge_patch(stored, &patch, today))
            .await
            .map_err(surface("update_booking", caller, Some(id)))?;
        tracing::info!(
            tenant = caller,
            %id,
            date = %saved.date,
            "booking updated to {}-{}",
            format_hhmm(saved.start_time),
            format_hhmm(saved.effective_end())
        );
        Ok(saved)
    }

    pub async fn delete_booking(&self, id: Ulid, caller: &str) -> Result<Booking, EngineError> {
        let (engine, _) = self.owned_booking(id, caller).await?;
        let removed = engine
            .delete_booking(id)
            .await
            .map_err(surface("delete_booking", caller, Some(id)))?;
        tracing::info!(tenant = caller, %id, "booking deleted");
        Ok(removed)
    }

    pub async fn list_by_tenant(
        &self,
        tenant: &str,
        date: Option<&str>,
    ) -> Result<Vec<Booking>, EngineError> {
        let date = date.map(parse_date).transpose()?;
        let engine = self.engine_for(tenant).await?;
        Ok(engine.list_bookings(date).await)
    }

    /// Every booking of a master, across all salons.
    pub async fn list_by_master(&self, master: &str) -> Result<Vec<Booking>, EngineError> {
        let master = normalize_master(Some(master))
            .ok_or_else(|| EngineError::validation("master is required"))?;
        Ok(self.tenants.list_by_master(&master).await)
    }

    /// A client's bookings across all salons. The query keeps its trailing
    /// ten digits (nine if that is all it has) and matches stored numbers by
    /// suffix, so country prefixes and punctuation do not matter.
    pub async fn list_by_phone(&self, phone: &str) -> Result<Vec<Booking>, EngineError> {
        let suffix = phone_query_suffix(phone)?;
        Ok(self.tenants.list_by_phone_suffix(&suffix).await)
    }

    async fn engine_for(&self, tenant: &str) -> Result<Arc<Engine>, EngineError> {
        let active = self.directory.is_active(tenant).await.map_err(|e| {
            tracing::error!(op = "resolve_tenant", tenant, "tenant directory failed: {e}");
            EngineError::Internal
        })?;
        if !active {
            return Err(EngineError::UnknownTenant(tenant.to_string()));
        }
        self.tenants
            .get_or_create(tenant)
            .map_err(|e| tenant_error(tenant, e))
    }

    /// Locate a booking and confirm `caller` owns it.
    async fn owned_booking(
        &self,
        id: Ulid,
        caller: &str,
    ) -> Result<(Arc<Engine>, Booking), EngineError> {
        let (engine, booking) = self
            .tenants
            .find_booking(id)
            .await
            .ok_or(EngineError::NotFound(id))?;
        if booking.tenant_id != caller {
            tracing::warn!(tenant = caller, %id, owner = %booking.tenant_id, "cross-tenant access refused");
            return Err(EngineError::Forbidden(id));
        }
        Ok((engine, booking))
    }
}

fn tenant_error(tenant: &str, e: io::Error) -> EngineError {
    match e.kind() {
        io::ErrorKind::InvalidInput => EngineError::UnknownTenant(tenant.to_string()),
        _ if e.to_string().contains("too many tenants") => {
            EngineError::LimitExceeded("too many tenants")
        }
        _ => {
            tracing::error!(op = "open_tenant", tenant, "failed to load tenant: {e}");
            EngineError::Internal
        }
    }
}

fn conflict(summary: BookingSummary) -> EngineError {
    metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
    EngineError::Conflict(summary)
}

/// Map engine errors for the caller: storage failures are logged with
/// context and hidden behind `Internal`.
fn surface<'a>(
    op: &'static str,
    tenant: &'a str,
    id: Option<Ulid>,
) -> impl FnOnce(EngineError) -> EngineError + 'a {
    move |e| match e {
        EngineError::WalError(msg) => {
            tracing::error!(op, tenant, id = ?id, "storage failure: {msg}");
            EngineError::Internal
        }
        EngineError::Conflict(summary) => conflict(summary),
        other => other,
    }
}

// ── Validation ──────────────────────────────────────────────────

fn validate_new(input: &NewBooking, today: NaiveDate) -> Result<BookingDraft, EngineError> {
    let client_name = required_text("client name", &input.client_name, MAX_NAME_LEN)?;
    let client_phone = validate_phone(&input.client_phone)?;
    let service_name = required_text("service", &input.service_name, MAX_NAME_LEN)?;
    let master = validate_master(input.master.as_deref())?;

    let date = parse_date(&input.date)?;
    if date < today {
        return Err(EngineError::validation("date cannot be in the past"));
    }
    let start = parse_time(&input.start_time)?;
    let end = match input.end_time.as_deref().map(str::trim) {
        Some(text) if !text.is_empty() => parse_time(text)?,
        _ => derive_end(start, DEFAULT_DURATION_MINUTES),
    };
    let slot = validate_window(start, end)?;
    let comment = validate_comment(input.comment.as_deref().unwrap_or_default())?;

    Ok(BookingDraft {
        client_name,
        client_phone,
        service_name,
        master,
        date,
        slot,
        comment,
    })
}

/// Merge `patch` over `current`. Returns the new record and whether its
/// date, window or master differ from the stored ones.
fn merge_patch(
    current: &Booking,
    patch: &BookingPatch,
    today: NaiveDate,
) -> Result<(Booking, bool), EngineError> {
    let mut next = current.clone();

    if let Some(name) = &patch.client_name {
        next.client_name = required_text("client name", name, MAX_NAME_LEN)?;
    }
    if let Some(service) = &patch.service_name {
        next.service_name = required_text("service", service, MAX_NAME_LEN)?;
    }
    if let Some(phone) = &patch.client_phone {
        if phone.trim() != current.client_phone {
            next.client_phone = validate_phone(phone)?;
        }
    }
    if let Some(comment) = &patch.comment {
        next.comment = validate_comment(comment)?;
    }
    if patch.master.is_some() {
        next.master = validate_master(patch.master.as_deref())?;
    }
    if let Some(date) = &patch.date {
        let date = parse_date(date)?;
        if date != current.date && date < today {
            return Err(EngineError::validation("date cannot be in the past"));
        }
        next.date = date;
    }

    if patch.start_time.is_some() || patch.end_time.is_some() {
        let start = match &patch.start_time {
            Some(text) => parse_time(text)?,
            None => current.start_time,
        };
        let end = match &patch.end_time {
            Some(text) => parse_time(text)?,
            // Moving the start alone keeps the stored length.
            None => derive_end(start, current.slot().duration()),
        };
        let slot = validate_window(start, end)?;
        next.start_time = slot.start;
        next.end_time = Some(slot.end);
    }

    let window_changed = next.date != current.date
        || next.start_time != current.start_time
        || next.effective_end() != current.effective_end()
        || next.master != current.master;
    Ok((next, window_changed))
}

fn required_text(field: &str, value: &str, max_len: usize) -> Result<String, EngineError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(EngineError::validation(format!("{field} is required")));
    }
    if value.len() > max_len {
        return Err(EngineError::validation(format!("{field} is too long")));
    }
    Ok(value.to_string())
}

fn validate_phone(phone: &str) -> Result<String, EngineError> {
    let phone = phone.trim();
    if phone.len() > MAX_PHONE_LEN {
        return Err(EngineError::validation("phone number is too long"));
    }
    if phone_digits(phone).len() < MIN_PHONE_DIGITS {
        return Err(EngineError::validation(format!(
            "phone number must contain at least {MIN_PHONE_DIGITS} digits"
        )));
    }
    Ok(phone.to_string())
}

fn validate_master(master: Option<&str>) -> Result<Option<String>, EngineError> {
    let master = normalize_master(master);
    if master.as_ref().is_some_and(|m| m.len() > MAX_NAME_LEN) {
        return Err(EngineError::validation("master name is too long"));
    }
    Ok(master)
}

fn validate_comment(comment: &str) -> Result<String, EngineError> {
    if comment.len() > MAX_COMMENT_LEN {
        return Err(EngineError::validation("comment is too long"));
    }
    Ok(comment.trim().to_string())
}

fn parse_date(text: &str) -> Result<NaiveDate, EngineError> {
    NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d")
        .map_err(|_| EngineError::validation("invalid date format, expected YYYY-MM-DD"))
}

fn parse_time(text: &str) -> Result<Minutes, EngineError> {
    parse_hhmm(text).ok_or_else(|| EngineError::validation("invalid time format"))
}

fn phone_query_suffix(phone: &str) -> Result<String, EngineError> {
    let digits = phone_digits(phone);
    if digits.len() < MIN_PHONE_DIGITS {
        return Err(EngineError::validation(format!(
            "phone number must contain at least {MIN_PHONE_DIGITS} digits"
        )));
    }
    let keep = digits.len().min(PHONE_MATCH_DIGITS);
    Ok(digits[digits.len() - keep..].to_string())
}
